pub mod broadcast;
pub mod ingest;
pub mod streaming;
