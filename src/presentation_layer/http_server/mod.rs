pub mod health;
pub mod router;
pub mod stream_handlers;
pub mod watch_handlers;
pub mod webrtc_handlers;

pub use router::{build_router, AppState};
