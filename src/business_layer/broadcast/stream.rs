use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::debug;
use uuid::Uuid;

use super::subscriber::{Subscriber, SUBSCRIBER_QUEUE_CAPACITY};
use crate::business_layer::ingest::IngestSession;
use crate::business_layer::streaming::StreamOrchestrator;
use crate::config::Config;
use crate::data_layer::storage::StorageClient;
use crate::error::{Error, LogError, Result};

/// Capacity of the per-stream broadcast bus.
const BUS_CAPACITY: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    Idle,
    Streaming,
    Stopped,
}

#[derive(Clone)]
struct StreamState {
    status: StreamStatus,
    started_at: Option<DateTime<Utc>>,
    video_url: String,
    hls_playlist_url: Option<String>,
    storage_path: String,
    video_duration: f64,
}

/// One logical live stream: lifecycle state, the viewer bus, and ownership
/// of the ingest session and pipeline orchestrator.
pub struct Stream {
    pub id: String,
    pub created_at: DateTime<Utc>,
    state: RwLock<StreamState>,
    subscribers: Mutex<HashMap<String, Subscriber>>,
    bus_tx: mpsc::Sender<String>,
    bus_rx: Mutex<Option<mpsc::Receiver<String>>>,
    shutdown: CancellationToken,
    ingest: Mutex<Option<Arc<IngestSession>>>,
    orchestrator: Mutex<Option<Arc<StreamOrchestrator>>>,
}

impl Stream {
    pub(crate) fn new(
        video_url: String,
        hls_playlist_url: Option<String>,
        storage_path: String,
    ) -> Arc<Self> {
        let (bus_tx, bus_rx) = mpsc::channel(BUS_CAPACITY);
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            created_at: Utc::now(),
            state: RwLock::new(StreamState {
                status: StreamStatus::Idle,
                started_at: None,
                video_url,
                hls_playlist_url,
                storage_path,
                video_duration: 0.0,
            }),
            subscribers: Mutex::new(HashMap::new()),
            bus_tx,
            bus_rx: Mutex::new(Some(bus_rx)),
            shutdown: CancellationToken::new(),
            ingest: Mutex::new(None),
            orchestrator: Mutex::new(None),
        })
    }

    pub async fn status(&self) -> StreamStatus {
        self.state.read().await.status
    }

    /// Idle → Streaming; records `started_at` and spawns the fan-out loop.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let rx = {
            let mut state = self.state.write().await;
            match state.status {
                StreamStatus::Idle => {
                    state.status = StreamStatus::Streaming;
                    state.started_at = Some(Utc::now());
                }
                StreamStatus::Streaming => {
                    return Err(Error::AlreadyRunning(format!(
                        "stream {} already started",
                        self.id
                    )))
                }
                StreamStatus::Stopped => {
                    return Err(Error::IllegalState(format!(
                        "stream {} is stopped; create a new stream to restart",
                        self.id
                    )))
                }
            }
            self.bus_rx.lock().await.take()
        };

        let Some(mut rx) = rx else {
            return Err(Error::Internal(format!(
                "broadcast bus for stream {} already consumed",
                self.id
            )));
        };

        let stream = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    frame = rx.recv() => {
                        let Some(frame) = frame else { break };
                        let subscribers = stream.subscribers.lock().await;
                        for subscriber in subscribers.values() {
                            subscriber.enqueue(&frame);
                        }
                    }
                }
            }
            debug!(stream_id = %stream.id, "fan-out loop terminated");
        });

        Ok(())
    }

    /// Streaming → Stopped. Closes the shutdown signal, tears the pipeline
    /// and ingest session down, then closes every subscriber queue exactly
    /// once. A second stop is a success no-op.
    pub async fn stop(&self) -> Result<()> {
        {
            let mut state = self.state.write().await;
            match state.status {
                StreamStatus::Streaming => state.status = StreamStatus::Stopped,
                StreamStatus::Stopped => return Ok(()),
                StreamStatus::Idle => {
                    return Err(Error::IllegalState(format!(
                        "stream {} is not streaming",
                        self.id
                    )))
                }
            }
        }

        self.teardown().await;
        Ok(())
    }

    /// Release every per-stream resource: pipeline, ingest session, fan-out
    /// loop, subscriber queues. Safe to call regardless of status.
    pub(crate) async fn teardown(&self) {
        self.shutdown.cancel();

        if let Some(orchestrator) = self.orchestrator.lock().await.clone() {
            orchestrator.stop().await;
        }

        if let Some(ingest) = self.ingest.lock().await.take() {
            ingest.close().await.log_error("closing ingest session");
        }

        let mut subscribers = self.subscribers.lock().await;
        for (_, subscriber) in subscribers.drain() {
            // Dropping the record drops its only sender, closing the queue.
            drop(subscriber);
        }
    }

    pub async fn add_subscriber(&self) -> (String, mpsc::Receiver<String>) {
        let id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_CAPACITY);
        self.subscribers
            .lock()
            .await
            .insert(id.clone(), Subscriber::new(id.clone(), tx));
        (id, rx)
    }

    pub async fn remove_subscriber(&self, id: &str) {
        self.subscribers.lock().await.remove(id);
    }

    pub async fn viewer_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }

    /// Enqueue a frame on the bus; a full bus drops it silently.
    pub fn broadcast(&self, frame: impl Into<String>) {
        let _ = self.bus_tx.try_send(frame.into());
    }

    pub async fn set_video_duration(&self, duration_seconds: f64) {
        self.state.write().await.video_duration = duration_seconds;
    }

    /// Synchronized "now playing" pointer for finite looped inputs:
    /// `floor(uptime) mod floor(duration)`, or 0 without a duration.
    pub async fn current_position(&self) -> f64 {
        let state = self.state.read().await;
        match state.started_at {
            Some(started) => {
                let uptime = (Utc::now() - started).num_seconds();
                looped_position(uptime, state.video_duration)
            }
            None => 0.0,
        }
    }

    /// Lazily create the WebRTC ingest session for this stream.
    pub async fn webrtc_ingest(&self, config: &Config) -> Result<Arc<IngestSession>> {
        let mut guard = self.ingest.lock().await;
        if let Some(session) = guard.clone() {
            return Ok(session);
        }
        let session = IngestSession::new(
            &self.id,
            &config.server.ingest_dir,
            config.server.stun_servers.clone(),
        )
        .await?;
        *guard = Some(Arc::clone(&session));
        Ok(session)
    }

    /// The stream's pipeline orchestrator, created on first use. At most one
    /// exists per stream.
    pub async fn ensure_orchestrator(
        &self,
        storage: Arc<StorageClient>,
        config: &Config,
    ) -> Arc<StreamOrchestrator> {
        let mut guard = self.orchestrator.lock().await;
        if let Some(orchestrator) = guard.clone() {
            return orchestrator;
        }
        let orchestrator = Arc::new(StreamOrchestrator::new(self.id.clone(), storage, config));
        *guard = Some(Arc::clone(&orchestrator));
        orchestrator
    }

    pub async fn orchestrator(&self) -> Option<Arc<StreamOrchestrator>> {
        self.orchestrator.lock().await.clone()
    }

    pub async fn get_stats(&self) -> serde_json::Value {
        let state = self.state.read().await.clone();
        let viewer_count = self.viewer_count().await;

        // Prefer the HLS playlist URL when one is published.
        let video_url = state
            .hls_playlist_url
            .clone()
            .unwrap_or_else(|| state.video_url.clone());

        let mut stats = json!({
            "id": self.id,
            "status": state.status,
            "viewer_count": viewer_count,
            "created_at": self.created_at,
            "video_url": video_url,
            "storage_path": state.storage_path,
        });

        if let Some(hls_url) = &state.hls_playlist_url {
            stats["hls_playlist_url"] = json!(hls_url);
            stats["original_video_url"] = json!(state.video_url);
        }

        if let Some(orchestrator) = self.orchestrator().await {
            stats["orchestrator"] = orchestrator.get_stats().await;
        }

        if let Some(started) = state.started_at {
            let uptime = Utc::now() - started;
            stats["started_at"] = json!(started);
            stats["uptime_seconds"] = json!(uptime.num_milliseconds() as f64 / 1000.0);

            if state.video_duration > 0.0 {
                stats["current_position"] =
                    json!(looped_position(uptime.num_seconds(), state.video_duration));
                stats["video_duration"] = json!(state.video_duration);
            }
        }

        stats
    }
}

fn looped_position(uptime_seconds: i64, duration_seconds: f64) -> f64 {
    let duration = duration_seconds as i64;
    if duration <= 0 || uptime_seconds < 0 {
        return 0.0;
    }
    (uptime_seconds % duration) as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    fn new_stream() -> Arc<Stream> {
        Stream::new("https://example.com/video.mp4".into(), None, "videos/x".into())
    }

    #[tokio::test]
    async fn status_transitions_are_monotone() {
        let stream = new_stream();
        assert_eq!(stream.status().await, StreamStatus::Idle);

        stream.start().await.expect("start");
        assert_eq!(stream.status().await, StreamStatus::Streaming);

        assert!(matches!(
            stream.start().await,
            Err(Error::AlreadyRunning(_))
        ));

        stream.stop().await.expect("stop");
        assert_eq!(stream.status().await, StreamStatus::Stopped);

        // Stopped is terminal: no restart, duplicate stop is a no-op success.
        assert!(matches!(stream.start().await, Err(Error::IllegalState(_))));
        stream.stop().await.expect("duplicate stop");
    }

    #[tokio::test]
    async fn stop_before_start_is_illegal() {
        let stream = new_stream();
        assert!(matches!(stream.stop().await, Err(Error::IllegalState(_))));
    }

    #[tokio::test]
    async fn viewer_count_tracks_subscriber_set() {
        let stream = new_stream();
        assert_eq!(stream.viewer_count().await, 0);

        let (id_a, _rx_a) = stream.add_subscriber().await;
        let (_id_b, _rx_b) = stream.add_subscriber().await;
        assert_eq!(stream.viewer_count().await, 2);

        stream.remove_subscriber(&id_a).await;
        assert_eq!(stream.viewer_count().await, 1);

        // Removing an unknown id is a no-op.
        stream.remove_subscriber("nope").await;
        assert_eq!(stream.viewer_count().await, 1);
    }

    #[tokio::test]
    async fn fan_out_preserves_order_for_every_subscriber() {
        let stream = new_stream();
        stream.start().await.expect("start");

        let (_id_a, mut rx_a) = stream.add_subscriber().await;
        let (_id_b, mut rx_b) = stream.add_subscriber().await;

        stream.broadcast("m1");
        stream.broadcast("m2");

        for rx in [&mut rx_a, &mut rx_b] {
            let first = timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("frame")
                .expect("open");
            let second = timeout(Duration::from_secs(1), rx.recv())
                .await
                .expect("frame")
                .expect("open");
            assert_eq!((first.as_str(), second.as_str()), ("m1", "m2"));
        }
    }

    #[tokio::test]
    async fn stop_closes_subscriber_queues() {
        let stream = new_stream();
        stream.start().await.expect("start");

        let (_id, mut rx) = stream.add_subscriber().await;
        stream.stop().await.expect("stop");

        // Queue closes; any buffered frames would drain first.
        let closed = timeout(Duration::from_secs(1), async {
            loop {
                if rx.recv().await.is_none() {
                    break;
                }
            }
        })
        .await;
        assert!(closed.is_ok(), "queue should close after stop");
        assert_eq!(stream.viewer_count().await, 0);
    }

    #[tokio::test]
    async fn broadcast_on_full_bus_drops_frames() {
        // Never started, so nothing drains the bus.
        let stream = new_stream();
        for i in 0..(BUS_CAPACITY + 50) {
            stream.broadcast(format!("m{i}"));
        }
        // No panic, no block; the overflow was dropped silently.
    }

    #[tokio::test]
    async fn subscribers_see_a_monotone_subsequence_under_overflow() {
        let stream = new_stream();
        stream.start().await.expect("start");
        let (_id, mut rx) = stream.add_subscriber().await;

        for i in 0..50 {
            stream.broadcast(format!("{i:03}"));
        }
        // Give the fan-out loop a moment to drain what it can.
        tokio::time::sleep(Duration::from_millis(200)).await;
        stream.stop().await.expect("stop");

        let mut received = Vec::new();
        while let Some(frame) = rx.recv().await {
            received.push(frame);
        }
        assert!(!received.is_empty());
        let mut sorted = received.clone();
        sorted.sort();
        assert_eq!(received, sorted, "frames must arrive in enqueue order");
    }

    #[tokio::test]
    async fn position_is_modular_in_video_duration() {
        assert_eq!(looped_position(0, 60.0), 0.0);
        assert_eq!(looped_position(59, 60.0), 59.0);
        assert_eq!(looped_position(60, 60.0), 0.0);
        assert_eq!(looped_position(125, 60.0), 5.0);
        // Fractional durations floor, matching floor(uptime) mod floor(D).
        assert_eq!(looped_position(10, 7.9), 3.0);
        assert_eq!(looped_position(10, 0.0), 0.0);
        assert_eq!(looped_position(10, -3.0), 0.0);

        let stream = new_stream();
        stream.set_video_duration(42.0).await;
        assert_eq!(stream.current_position().await, 0.0, "not started yet");
    }

    #[tokio::test]
    async fn stats_reflect_lifecycle() {
        let stream = new_stream();
        let stats = stream.get_stats().await;
        assert_eq!(stats["status"], "idle");
        assert_eq!(stats["viewer_count"], 0);
        assert!(stats.get("started_at").is_none());

        stream.start().await.expect("start");
        stream.set_video_duration(30.0).await;
        let stats = stream.get_stats().await;
        assert_eq!(stats["status"], "streaming");
        assert!(stats.get("started_at").is_some());
        assert!(stats.get("uptime_seconds").is_some());
        assert_eq!(stats["video_duration"], 30.0);
    }

    #[tokio::test]
    async fn stats_prefer_hls_playlist_url() {
        let stream = Stream::new(
            "https://example.com/video.mp4".into(),
            Some("https://cdn.example.com/x/playlist.m3u8".into()),
            "videos/x".into(),
        );
        let stats = stream.get_stats().await;
        assert_eq!(stats["video_url"], "https://cdn.example.com/x/playlist.m3u8");
        assert_eq!(stats["original_video_url"], "https://example.com/video.mp4");
    }
}
