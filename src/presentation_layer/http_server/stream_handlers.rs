use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::router::AppState;
use crate::error::{Error, Result};

#[derive(Debug, Deserialize)]
pub struct CreateStreamRequest {
    pub video_url: Option<String>,
    #[serde(default)]
    pub hls_playlist_url: Option<String>,
    #[serde(default)]
    pub storage_path: Option<String>,
    /// Duration in seconds of finite inputs, for synchronized looped playback.
    #[serde(default)]
    pub video_duration: Option<f64>,
}

pub async fn create_stream(
    State(state): State<AppState>,
    Json(req): Json<CreateStreamRequest>,
) -> Result<impl IntoResponse> {
    let video_url = req
        .video_url
        .filter(|url| !url.is_empty())
        .ok_or_else(|| Error::InvalidArgument("video_url is required".into()))?;
    let storage_path = req.storage_path.unwrap_or_default();

    let stream = match req.hls_playlist_url.filter(|url| !url.is_empty()) {
        Some(hls_url) => {
            state
                .registry
                .create_stream_with_hls(video_url.clone(), hls_url, storage_path)
                .await
        }
        None => state.registry.create_stream(video_url.clone(), storage_path).await,
    };

    if let Some(duration) = req.video_duration.filter(|d| *d > 0.0) {
        stream.set_video_duration(duration).await;
        info!(stream_id = %stream.id, duration, "stream created with video duration");
    }

    Ok((
        StatusCode::CREATED,
        Json(json!({
            "success": true,
            "message": "Stream created successfully",
            "stream_id": stream.id,
            "video_url": video_url,
            "status": stream.status().await,
            "stream_url": format!("/api/v1/streams/{}", stream.id),
            "watch_url": format!("/api/v1/streams/{}/watch", stream.id),
        })),
    ))
}

pub async fn list_streams(State(state): State<AppState>) -> Json<serde_json::Value> {
    let streams = state.registry.list_streams().await;
    let mut stats = Vec::with_capacity(streams.len());
    for stream in &streams {
        stats.push(stream.get_stats().await);
    }

    Json(json!({
        "success": true,
        "count": streams.len(),
        "streams": stats,
    }))
}

pub async fn get_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let stream = state.registry.get_stream(&id).await?;
    Ok(Json(json!({
        "success": true,
        "stream": stream.get_stats().await,
    })))
}

pub async fn delete_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    state.registry.delete_stream(&id).await?;
    Ok(Json(json!({
        "success": true,
        "message": "Stream deleted",
    })))
}

pub async fn start_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let stream = state.registry.get_stream(&id).await?;
    stream.start().await?;
    Ok(Json(json!({
        "success": true,
        "message": "Stream started",
        "stream": stream.get_stats().await,
    })))
}

pub async fn stop_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let stream = state.registry.get_stream(&id).await?;
    stream.stop().await?;
    Ok(Json(json!({
        "success": true,
        "message": "Stream stopped",
    })))
}

pub async fn get_stream_stats(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    let stream = state.registry.get_stream(&id).await?;
    Ok(Json(json!({
        "success": true,
        "stats": stream.get_stats().await,
    })))
}

/// Broadcast an opaque media chunk to every subscriber as a JSON frame.
pub async fn upload_stream_chunk(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<serde_json::Value>> {
    let stream = state.registry.get_stream(&id).await?;

    if body.is_empty() {
        return Err(Error::InvalidArgument("empty chunk body".into()));
    }

    let frame = json!({
        "type": "chunk",
        "data": BASE64.encode(&body),
    })
    .to_string();
    stream.broadcast(frame);

    Ok(Json(json!({
        "success": true,
        "bytes_sent": body.len(),
        "viewer_count": stream.viewer_count().await,
    })))
}
