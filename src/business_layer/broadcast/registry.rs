use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use super::stream::{Stream, StreamStatus};
use crate::error::{Error, LogError, Result};

/// Process-wide map from stream id to stream record. Streams live exactly as
/// long as their registry entry.
pub struct StreamRegistry {
    streams: RwLock<HashMap<String, Arc<Stream>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self {
            streams: RwLock::new(HashMap::new()),
        }
    }

    pub async fn create_stream(&self, video_url: String, storage_path: String) -> Arc<Stream> {
        self.insert(Stream::new(video_url, None, storage_path)).await
    }

    pub async fn create_stream_with_hls(
        &self,
        video_url: String,
        hls_playlist_url: String,
        storage_path: String,
    ) -> Arc<Stream> {
        self.insert(Stream::new(video_url, Some(hls_playlist_url), storage_path))
            .await
    }

    async fn insert(&self, stream: Arc<Stream>) -> Arc<Stream> {
        let mut streams = self.streams.write().await;
        streams.insert(stream.id.clone(), Arc::clone(&stream));
        info!(stream_id = %stream.id, "stream created");
        stream
    }

    pub async fn get_stream(&self, id: &str) -> Result<Arc<Stream>> {
        self.streams
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("stream not found: {id}")))
    }

    pub async fn list_streams(&self) -> Vec<Arc<Stream>> {
        self.streams.read().await.values().cloned().collect()
    }

    /// Stop the stream if it is streaming, release its resources, and remove
    /// the entry.
    pub async fn delete_stream(&self, id: &str) -> Result<()> {
        let stream = self.get_stream(id).await?;

        match stream.status().await {
            StreamStatus::Streaming => {
                stream.stop().await.log_error("stopping stream during delete");
            }
            // An idle stream may still own an ingest session or a pipeline
            // started by negotiation.
            _ => stream.teardown().await,
        }

        self.streams.write().await.remove(id);
        info!(stream_id = %id, "stream deleted");
        Ok(())
    }

    pub async fn active_stream_count(&self) -> usize {
        let streams = self.list_streams().await;
        let mut active = 0;
        for stream in streams {
            if stream.status().await == StreamStatus::Streaming {
                active += 1;
            }
        }
        active
    }
}

impl Default for StreamRegistry {
    fn default() -> Self {
        Self::new()
    }
}
