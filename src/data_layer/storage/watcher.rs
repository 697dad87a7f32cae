use std::path::Path;

use notify::event::{AccessKind, AccessMode, ModifyKind};
use notify::{recommended_watcher, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::error;

use crate::error::{Error, Result};

/// Watch `root` recursively and forward filesystem events into a tokio
/// channel. The returned watcher handle must be kept alive for as long as
/// events are wanted; dropping it tears the watch down.
///
/// Variant subdirectories created after the watch starts are covered by the
/// recursive mode. Events are dropped, not blocked on, when the consumer
/// falls behind.
pub fn watch_recursive(root: &Path) -> Result<(RecommendedWatcher, mpsc::Receiver<Event>)> {
    if !root.exists() {
        return Err(Error::Misconfigured(format!(
            "watch root does not exist: {}",
            root.display()
        )));
    }

    let (tx, rx) = mpsc::channel(256);

    let mut watcher = recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            let _ = tx.try_send(event);
        }
        Err(e) => error!("filesystem watch error: {e}"),
    })
    .map_err(|e| Error::Internal(format!("create watcher: {e}")))?;

    watcher
        .watch(root, RecursiveMode::Recursive)
        .map_err(|e| Error::Misconfigured(format!("watch {}: {e}", root.display())))?;

    Ok((watcher, rx))
}

/// The authoritative "file finished" signal on platforms that report it.
pub fn is_close_write(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Access(AccessKind::Close(AccessMode::Write))
    )
}

/// Whether an event kind can signal new or updated artifact content.
/// Close-write is the authoritative "file finished" signal on platforms that
/// report it; create/modify cover the rest.
pub fn is_content_event(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_)
            | EventKind::Modify(ModifyKind::Data(_) | ModifyKind::Name(_) | ModifyKind::Any)
            | EventKind::Access(AccessKind::Close(AccessMode::Write))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, MetadataKind, ModifyKind};

    #[test]
    fn watch_missing_root_is_misconfigured() {
        let result = watch_recursive(Path::new("/nonexistent/hls/stream"));
        assert!(matches!(result, Err(Error::Misconfigured(_))));
    }

    #[test]
    fn content_events_are_recognized() {
        assert!(is_content_event(&EventKind::Create(CreateKind::File)));
        assert!(is_content_event(&EventKind::Modify(ModifyKind::Data(
            DataChange::Content
        ))));
        assert!(is_content_event(&EventKind::Access(AccessKind::Close(
            AccessMode::Write
        ))));
        assert!(!is_content_event(&EventKind::Remove(
            notify::event::RemoveKind::File
        )));
        assert!(!is_content_event(&EventKind::Modify(ModifyKind::Metadata(
            MetadataKind::Any
        ))));
    }

    #[tokio::test]
    async fn watcher_reports_created_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (_watcher, mut rx) = watch_recursive(dir.path()).expect("watch");

        tokio::fs::write(dir.path().join("segment_000.ts"), b"data")
            .await
            .expect("write");

        let event = tokio::time::timeout(std::time::Duration::from_secs(5), rx.recv())
            .await
            .expect("watch event before timeout")
            .expect("channel open");
        assert!(event
            .paths
            .iter()
            .any(|p| p.file_name().is_some_and(|n| n == "segment_000.ts")));
    }
}
