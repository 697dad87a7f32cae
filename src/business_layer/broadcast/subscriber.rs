use chrono::{DateTime, Utc};
use tokio::sync::mpsc;

/// Capacity of each viewer's outbound frame queue.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 10;

/// A connected viewer of the control channel. Holds the only sender for the
/// viewer's queue, so dropping the record closes the queue exactly once.
pub struct Subscriber {
    pub id: String,
    pub connected_at: DateTime<Utc>,
    tx: mpsc::Sender<String>,
}

impl Subscriber {
    pub fn new(id: String, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            connected_at: Utc::now(),
            tx,
        }
    }

    /// Non-blocking enqueue; a full queue drops the frame. Viewers must
    /// tolerate gaps, never reorderings.
    pub fn enqueue(&self, frame: &str) {
        let _ = self.tx.try_send(frame.to_string());
    }
}
