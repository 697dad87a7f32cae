use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use super::router::AppState;
use crate::business_layer::broadcast::Stream;
use crate::error::{Error, Result};

/// Delay between a successful negotiation and the pipeline start, giving the
/// track writers time to create the ingest files.
const PIPELINE_START_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Deserialize)]
pub struct SdpRequest {
    pub sdp: Option<String>,
}

impl SdpRequest {
    fn sdp(self) -> Result<String> {
        self.sdp
            .filter(|sdp| !sdp.is_empty())
            .ok_or_else(|| Error::InvalidArgument("sdp is required".into()))
    }
}

/// Take the broadcaster's offer, reply with the answer, and schedule the
/// pipeline start once tracks begin flowing.
pub async fn webrtc_offer(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SdpRequest>,
) -> Result<Json<serde_json::Value>> {
    let sdp = req.sdp()?;
    let stream = state.registry.get_stream(&id).await?;

    let ingest = stream.webrtc_ingest(&state.config).await?;
    let answer = ingest.handle_offer(&sdp).await?;

    let stream = Arc::clone(&stream);
    let state = state.clone();
    tokio::spawn(async move {
        tokio::time::sleep(PIPELINE_START_DELAY).await;
        if let Err(e) = start_stream_pipeline(&stream, &state).await {
            error!(stream_id = %stream.id, "failed to start streaming pipeline: {e}");
        }
    });

    Ok(Json(json!({
        "success": true,
        "sdp": answer,
    })))
}

/// Complete a server-initiated negotiation and start the pipeline.
pub async fn webrtc_answer(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SdpRequest>,
) -> Result<Json<serde_json::Value>> {
    let sdp = req.sdp()?;
    let stream = state.registry.get_stream(&id).await?;

    let ingest = stream.webrtc_ingest(&state.config).await?;
    ingest.handle_answer(&sdp).await?;

    start_stream_pipeline(&stream, &state).await?;

    Ok(Json(json!({
        "success": true,
        "message": "WebRTC connection established and streaming pipeline started",
    })))
}

/// Wire the stream's ingest output into its orchestrator. The encoder input
/// is the video file only; audio is synthesized downstream.
async fn start_stream_pipeline(stream: &Arc<Stream>, state: &AppState) -> Result<()> {
    let ingest = stream.webrtc_ingest(&state.config).await?;
    let orchestrator = stream
        .ensure_orchestrator(Arc::clone(&state.storage), &state.config)
        .await;

    let input = ingest.video_path().to_string_lossy().into_owned();
    orchestrator.start(&input).await?;

    info!(
        stream_id = %stream.id,
        playlist_url = orchestrator.playlist_url(),
        "streaming pipeline started"
    );
    Ok(())
}
