use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream as EventStream, StreamExt};

use super::router::AppState;
use crate::business_layer::broadcast::Stream;
use crate::error::Result;

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Long-lived SSE feed of control frames: an initial `connected` frame,
/// broadcast frames in order, and heartbeat comments. Ends when the client
/// disconnects or the stream closes the queue.
pub async fn watch_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Sse<impl EventStream<Item = std::result::Result<Event, Infallible>>>> {
    let stream = state.registry.get_stream(&id).await?;
    let (viewer_id, rx) = stream.add_subscriber().await;

    let connected = json!({
        "type": "connected",
        "stream_id": stream.id,
        "viewer_id": viewer_id,
    })
    .to_string();

    let frames = SubscriberStream {
        inner: ReceiverStream::new(rx),
        stream,
        viewer_id,
    };

    let events = tokio_stream::once(connected)
        .chain(frames)
        .map(|frame| Ok(Event::default().data(frame)));

    Ok(Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(HEARTBEAT_INTERVAL)
            .text("heartbeat"),
    ))
}

/// Wraps the subscriber queue so the viewer is unregistered however the
/// connection ends.
struct SubscriberStream {
    inner: ReceiverStream<String>,
    stream: Arc<Stream>,
    viewer_id: String,
}

impl EventStream for SubscriberStream {
    type Item = String;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<String>> {
        let this = self.get_mut();
        Pin::new(&mut this.inner).poll_next(cx)
    }
}

impl Drop for SubscriberStream {
    fn drop(&mut self) {
        let stream = Arc::clone(&self.stream);
        let viewer_id = self.viewer_id.clone();
        tokio::spawn(async move {
            stream.remove_subscriber(&viewer_id).await;
        });
    }
}
