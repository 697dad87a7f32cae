pub mod registry;
pub mod stream;
pub mod subscriber;

pub use registry::StreamRegistry;
pub use stream::{Stream, StreamStatus};
