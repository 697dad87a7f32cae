use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tracing::{error, info};

use live_broadcast_server::business_layer::broadcast::StreamRegistry;
use live_broadcast_server::config::Config;
use live_broadcast_server::data_layer::storage::StorageClient;
use live_broadcast_server::logging;
use live_broadcast_server::presentation_layer::http_server::{build_router, AppState};

/// Cadence of the storage janitor pruning stale segments.
const JANITOR_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let config = Arc::new(Config::from_env()?);

    info!("starting live broadcast service");
    info!(
        port = config.server.port,
        bucket = %config.storage.bucket,
        media_prefix = %config.storage.media_prefix,
        "configuration loaded"
    );

    let storage = Arc::new(StorageClient::new(&config.storage).await?);
    let registry = Arc::new(StreamRegistry::new());

    spawn_segment_janitor(
        Arc::clone(&registry),
        Arc::clone(&storage),
        config.storage.segment_lifetime_hours,
    );

    let state = AppState {
        registry,
        storage,
        config: Arc::clone(&config),
    };
    let app = build_router(state);

    let addr = format!("[::]:{}", config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("server listening on {addr}");

    axum::serve(listener, app).await?;
    Ok(())
}

/// Periodically prune `.ts` segments older than the configured lifetime from
/// every registered stream's storage prefix.
fn spawn_segment_janitor(
    registry: Arc<StreamRegistry>,
    storage: Arc<StorageClient>,
    lifetime_hours: u64,
) {
    let lifetime = Duration::from_secs(lifetime_hours * 60 * 60);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(JANITOR_INTERVAL);
        // The first tick fires immediately; skip it so startup stays quiet.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            for stream in registry.list_streams().await {
                let prefix = storage.stream_prefix(&stream.id);
                if let Err(e) = storage.delete_segments_older_than(&prefix, lifetime).await {
                    error!(stream_id = %stream.id, "segment janitor sweep failed: {e}");
                }
            }
        }
    });
}
