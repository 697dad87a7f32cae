use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::hls_uploader::HlsUploader;
use super::transcoder::FfmpegTranscoder;
use crate::config::Config;
use crate::data_layer::storage::StorageClient;
use crate::error::{Error, Result};

/// Minimum bytes an ingest file must reach before the encoder starts; below
/// this the container headers are usually incomplete.
const MIN_INPUT_SIZE: u64 = 1024;
const READINESS_TIMEOUT: Duration = Duration::from_secs(10);
const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Coordinates the per-stream pipeline: waits for ingest files, runs the
/// transcoder, and publishes its output through the uploader.
pub struct StreamOrchestrator {
    stream_id: String,
    storage: Arc<StorageClient>,
    transcoder: FfmpegTranscoder,
    output_path: PathBuf,
    media_prefix: String,
    inner: Mutex<OrchestratorState>,
}

#[derive(Default)]
struct OrchestratorState {
    running: bool,
    cancel: Option<CancellationToken>,
    uploader: Option<Arc<HlsUploader>>,
}

impl StreamOrchestrator {
    pub fn new(stream_id: String, storage: Arc<StorageClient>, config: &Config) -> Self {
        let output_path = config.server.hls_dir.join(&stream_id);
        Self {
            stream_id,
            storage,
            transcoder: FfmpegTranscoder::new(config.ffmpeg.clone()),
            output_path,
            media_prefix: config.storage.media_prefix.clone(),
            inner: Mutex::new(OrchestratorState::default()),
        }
    }

    /// Start the pipeline for `input_spec` (path, or `video|audio` pair).
    pub async fn start(&self, input_spec: &str) -> Result<()> {
        let mut state = self.inner.lock().await;
        if state.running {
            return Err(Error::AlreadyRunning(format!(
                "orchestrator for stream {}",
                self.stream_id
            )));
        }

        let cancel = CancellationToken::new();

        info!(stream_id = %self.stream_id, "starting stream pipeline");

        // The encoder copes with briefly-empty inputs and its own logs beat a
        // refusal to start, so a readiness timeout only downgrades to a warning.
        if let Err(e) = wait_for_input_files(input_spec, READINESS_TIMEOUT).await {
            warn!(stream_id = %self.stream_id, "{e}, starting ffmpeg anyway");
        }

        self.transcoder
            .start(&cancel, input_spec, &self.stream_id, &self.output_path)
            .await?;

        let uploader = Arc::new(HlsUploader::new(
            self.stream_id.clone(),
            self.output_path.clone(),
            self.media_prefix.clone(),
            Arc::clone(&self.storage),
            cancel.child_token(),
        ));

        if let Err(e) = uploader.start().await {
            self.transcoder.stop().await;
            cancel.cancel();
            return Err(e);
        }

        state.uploader = Some(uploader);
        state.cancel = Some(cancel);
        state.running = true;

        info!(stream_id = %self.stream_id, "stream pipeline started");
        Ok(())
    }

    /// Stop the pipeline: uploader first, then the encoder, then the scope.
    /// Idempotent; component errors are logged, not propagated.
    pub async fn stop(&self) {
        let mut state = self.inner.lock().await;
        if !state.running {
            return;
        }

        info!(stream_id = %self.stream_id, "stopping stream pipeline");

        if let Some(uploader) = state.uploader.take() {
            uploader.stop().await;
        }
        self.transcoder.stop().await;
        if let Some(cancel) = state.cancel.take() {
            cancel.cancel();
        }

        state.running = false;
        info!(stream_id = %self.stream_id, "stream pipeline stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.inner.lock().await.running
    }

    /// CDN URL of the published HLS master playlist.
    pub fn playlist_url(&self) -> String {
        self.storage.hls_master_playlist_url(&self.stream_id)
    }

    pub async fn get_stats(&self) -> serde_json::Value {
        let state = self.inner.lock().await;
        json!({
            "stream_id": self.stream_id,
            "running": state.running,
            "output_path": self.output_path.to_string_lossy(),
            "playlist_url": self.playlist_url(),
        })
    }
}

/// Poll the ingest files named by `input_spec` until each exists with at
/// least `MIN_INPUT_SIZE` bytes, or the timeout elapses. Non-path specs
/// (e.g. URLs) are not waited on.
pub(crate) async fn wait_for_input_files(input_spec: &str, timeout: Duration) -> Result<()> {
    let files = parse_input_files(input_spec);
    if files.is_empty() {
        return Ok(());
    }

    info!("waiting for input files to have data");

    let deadline = tokio::time::Instant::now() + timeout;
    let mut ticker = tokio::time::interval(READINESS_POLL_INTERVAL);

    loop {
        ticker.tick().await;

        if files.iter().all(|f| input_ready(Path::new(f))) {
            info!("input files ready");
            return Ok(());
        }

        if tokio::time::Instant::now() >= deadline {
            return Err(Error::Timeout(format!(
                "waiting for input files: {input_spec}"
            )));
        }
    }
}

fn input_ready(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.len() >= MIN_INPUT_SIZE)
        .unwrap_or(false)
}

/// File paths to wait on: a pipe-delimited list, a single absolute path, or
/// nothing when the input is not file-shaped.
pub(crate) fn parse_input_files(input_spec: &str) -> Vec<&str> {
    if input_spec.contains('|') {
        input_spec.split('|').collect()
    } else if input_spec.starts_with('/') {
        vec![input_spec]
    } else {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_single_and_piped_input_specs() {
        assert_eq!(
            parse_input_files("/tmp/in/video.ivf"),
            vec!["/tmp/in/video.ivf"]
        );
        assert_eq!(
            parse_input_files("/tmp/in/video.ivf|/tmp/in/audio.ogg"),
            vec!["/tmp/in/video.ivf", "/tmp/in/audio.ogg"]
        );
        assert!(parse_input_files("rtmp://example/live/key").is_empty());
    }

    #[tokio::test]
    async fn readiness_succeeds_once_files_reach_threshold() {
        let dir = tempfile::tempdir().expect("tempdir");
        let video = dir.path().join("video.ivf");
        tokio::fs::write(&video, vec![0u8; 2048]).await.expect("write");

        wait_for_input_files(video.to_str().unwrap(), Duration::from_secs(2))
            .await
            .expect("files ready");
    }

    #[tokio::test]
    async fn readiness_times_out_on_undersized_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let video = dir.path().join("video.ivf");
        tokio::fs::write(&video, vec![0u8; 16]).await.expect("write");

        let result =
            wait_for_input_files(video.to_str().unwrap(), Duration::from_millis(700)).await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }

    #[tokio::test]
    async fn readiness_waits_for_every_file_in_the_pair() {
        let dir = tempfile::tempdir().expect("tempdir");
        let video = dir.path().join("video.ivf");
        let audio = dir.path().join("audio.ogg");
        tokio::fs::write(&video, vec![0u8; 2048]).await.expect("write");
        tokio::fs::write(&audio, vec![0u8; 8]).await.expect("write");

        let spec = format!("{}|{}", video.display(), audio.display());
        let result = wait_for_input_files(&spec, Duration::from_millis(700)).await;
        assert!(matches!(result, Err(Error::Timeout(_))));

        tokio::fs::write(&audio, vec![0u8; 4096]).await.expect("write");
        wait_for_input_files(&spec, Duration::from_secs(2))
            .await
            .expect("both files ready");
    }

    #[tokio::test]
    async fn non_file_specs_skip_the_wait() {
        wait_for_input_files("rtmp://example/live/key", Duration::from_millis(10))
            .await
            .expect("no wait for non-file input");
    }
}
