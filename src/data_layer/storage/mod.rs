pub mod client;
pub mod types;
pub mod watcher;

pub use client::StorageClient;
