use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;

use super::{health, stream_handlers, watch_handlers, webrtc_handlers};
use crate::business_layer::broadcast::StreamRegistry;
use crate::config::Config;
use crate::data_layer::storage::StorageClient;

/// Shared state handed to every request handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<StreamRegistry>,
    pub storage: Arc<StorageClient>,
    pub config: Arc<Config>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route(
            "/api/v1/streams",
            post(stream_handlers::create_stream).get(stream_handlers::list_streams),
        )
        .route(
            "/api/v1/streams/{id}",
            get(stream_handlers::get_stream).delete(stream_handlers::delete_stream),
        )
        .route("/api/v1/streams/{id}/start", post(stream_handlers::start_stream))
        .route("/api/v1/streams/{id}/stop", post(stream_handlers::stop_stream))
        .route("/api/v1/streams/{id}/stats", get(stream_handlers::get_stream_stats))
        .route("/api/v1/streams/{id}/chunk", post(stream_handlers::upload_stream_chunk))
        .route("/api/v1/streams/{id}/watch", get(watch_handlers::watch_stream))
        .route(
            "/api/v1/streams/{id}/webrtc/offer",
            post(webrtc_handlers::webrtc_offer),
        )
        .route(
            "/api/v1/streams/{id}/webrtc/answer",
            post(webrtc_handlers::webrtc_answer),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}
