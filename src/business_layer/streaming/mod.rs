pub mod hls_uploader;
pub mod orchestrator;
pub mod transcoder;

pub use orchestrator::StreamOrchestrator;
