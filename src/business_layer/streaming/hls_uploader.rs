use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use notify::{Event, RecommendedWatcher};
use tokio::sync::{mpsc, Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::data_layer::storage::client::{
    playlist_key, segment_key, PLAYLIST_CACHE_CONTROL, PLAYLIST_CONTENT_TYPE,
    SEGMENT_CACHE_CONTROL, SEGMENT_CONTENT_TYPE,
};
use crate::data_layer::storage::watcher::{is_close_write, is_content_event, watch_recursive};
use crate::data_layer::storage::StorageClient;
use crate::error::Result;

const MAX_UPLOAD_ATTEMPTS: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);

/// Watches the encoder's output tree and publishes new segments and
/// playlists to object storage.
///
/// Ordering: uploads run in parallel across keys but are serialized per key,
/// and a playlist is never published before the segments it references have
/// been resolved (uploaded, or dropped after retry exhaustion so the stream
/// cannot deadlock).
pub struct HlsUploader {
    stream_id: String,
    output_root: PathBuf,
    media_prefix: String,
    storage: Arc<StorageClient>,
    cancel: CancellationToken,
    key_locks: Arc<KeyLocks>,
    /// Monotone version per playlist key; an upload holding a stale version
    /// yields so the key always ends up with the newest bytes.
    playlist_versions: DashMap<String, Arc<AtomicU64>>,
    started: Mutex<bool>,
}

/// One async mutex per storage key; uploads for the same key queue behind
/// each other while different keys proceed in parallel.
struct KeyLocks(DashMap<String, Arc<Mutex<()>>>);

impl KeyLocks {
    fn new() -> Self {
        Self(DashMap::new())
    }

    async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = self
            .0
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }
}

/// An HLS artifact classified from its location in the output tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum HlsArtifact {
    Segment {
        variant: String,
        file_name: String,
    },
    /// `variant` is `None` for the master playlist at the tree root.
    Playlist {
        variant: Option<String>,
        file_name: String,
    },
}

/// A playlist parked until the segment keys it references are resolved.
struct PendingPlaylist {
    variant: Option<String>,
    file_name: String,
    missing: Vec<String>,
}

impl HlsUploader {
    pub fn new(
        stream_id: String,
        output_root: PathBuf,
        media_prefix: String,
        storage: Arc<StorageClient>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            stream_id,
            output_root,
            media_prefix,
            storage,
            cancel,
            key_locks: Arc::new(KeyLocks::new()),
            playlist_versions: DashMap::new(),
            started: Mutex::new(false),
        }
    }

    /// Register the recursive watcher and start the publisher loop. Fails
    /// with `Misconfigured` when the output root does not exist.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut started = self.started.lock().await;
        if *started {
            return Ok(());
        }

        let (watcher, events) = watch_recursive(&self.output_root)?;
        *started = true;

        let uploader = Arc::clone(self);
        tokio::spawn(async move {
            uploader.run(watcher, events).await;
        });

        info!(
            stream_id = %self.stream_id,
            root = %self.output_root.display(),
            "hls uploader started"
        );
        Ok(())
    }

    /// Tear the watcher down. Idempotent.
    pub async fn stop(&self) {
        self.cancel.cancel();
    }

    async fn run(self: Arc<Self>, watcher: RecommendedWatcher, mut events: mpsc::Receiver<Event>) {
        // The watch registration lives exactly as long as this loop.
        let _watcher = watcher;

        let (done_tx, mut done_rx) = mpsc::channel::<String>(64);
        // Keys whose upload finished (or was dropped); gates playlists.
        let mut resolved: HashSet<String> = HashSet::new();
        let mut in_flight: HashSet<String> = HashSet::new();
        let mut pending: HashMap<PathBuf, PendingPlaylist> = HashMap::new();

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv() => {
                    let Some(event) = event else { break };
                    if !is_content_event(&event.kind) {
                        continue;
                    }
                    let close_write = is_close_write(&event.kind);
                    for path in &event.paths {
                        match classify_artifact(&self.output_root, path) {
                            // A segment is complete only once the encoder
                            // closes it; create/modify events still show a
                            // partial file.
                            Some(HlsArtifact::Segment { variant, file_name }) if close_write => {
                                let key = segment_key(
                                    &self.media_prefix,
                                    &self.stream_id,
                                    &variant,
                                    &file_name,
                                );
                                self.enqueue_segment(
                                    path.clone(),
                                    key,
                                    &resolved,
                                    &mut in_flight,
                                    &done_tx,
                                );
                            }
                            Some(HlsArtifact::Segment { .. }) => {}
                            Some(HlsArtifact::Playlist { variant, file_name }) => {
                                self.handle_playlist(
                                    path,
                                    variant,
                                    file_name,
                                    &resolved,
                                    &mut in_flight,
                                    &mut pending,
                                    &done_tx,
                                )
                                .await;
                            }
                            None => {}
                        }
                    }
                }
                done_key = done_rx.recv() => {
                    let Some(done_key) = done_key else { break };
                    in_flight.remove(&done_key);
                    resolved.insert(done_key);

                    // A segment completed; publish any playlist that was
                    // waiting only on it.
                    let ready: Vec<PathBuf> = pending
                        .iter()
                        .filter(|(_, job)| job.missing.iter().all(|k| resolved.contains(k)))
                        .map(|(path, _)| path.clone())
                        .collect();
                    for path in ready {
                        if let Some(job) = pending.remove(&path) {
                            self.handle_playlist(
                                &path,
                                job.variant,
                                job.file_name,
                                &resolved,
                                &mut in_flight,
                                &mut pending,
                                &done_tx,
                            )
                            .await;
                        }
                    }
                }
            }
        }

        debug!(stream_id = %self.stream_id, "hls uploader loop terminated");
    }

    /// Start a segment upload unless the key is already in flight or done.
    fn enqueue_segment(
        &self,
        path: PathBuf,
        key: String,
        resolved: &HashSet<String>,
        in_flight: &mut HashSet<String>,
        done_tx: &mpsc::Sender<String>,
    ) {
        if resolved.contains(&key) || in_flight.contains(&key) {
            return;
        }
        in_flight.insert(key.clone());
        self.spawn_segment_upload(path, key, done_tx.clone());
    }

    /// Publish a playlist, or park it when it references segments whose
    /// uploads have not completed yet.
    async fn handle_playlist(
        &self,
        path: &Path,
        variant: Option<String>,
        file_name: String,
        resolved: &HashSet<String>,
        in_flight: &mut HashSet<String>,
        pending: &mut HashMap<PathBuf, PendingPlaylist>,
        done_tx: &mpsc::Sender<String>,
    ) {
        let content = match tokio::fs::read_to_string(path).await {
            Ok(content) => content,
            Err(e) => {
                // Rotated away between the event and the read.
                debug!(path = %path.display(), "skipping unreadable playlist: {e}");
                pending.remove(path);
                return;
            }
        };

        // Master playlists reference variant playlists, not segments; only
        // variant playlists are gated.
        let missing: Vec<String> = match &variant {
            Some(variant) => missing_segment_keys(
                &self.media_prefix,
                &self.stream_id,
                variant,
                &content,
                resolved,
            ),
            None => Vec::new(),
        };

        if missing.is_empty() {
            pending.remove(path);
            let key = playlist_key(
                &self.media_prefix,
                &self.stream_id,
                variant.as_deref(),
                &file_name,
            );
            self.spawn_playlist_upload(key, content);
            return;
        }

        // The encoder only lists a segment after closing it, so a referenced
        // segment is safe to upload even if its close event was missed.
        if let Some(parent) = path.parent() {
            for ref_name in playlist_segment_refs(&content) {
                let segment_path = parent.join(ref_name);
                if let Some(variant) = &variant {
                    let key =
                        segment_key(&self.media_prefix, &self.stream_id, variant, ref_name);
                    if !resolved.contains(&key) && segment_path.exists() {
                        self.enqueue_segment(segment_path, key, resolved, in_flight, done_tx);
                    }
                }
            }
        }

        debug!(
            playlist = %path.display(),
            waiting_on = missing.len(),
            "parking playlist until referenced segments upload"
        );
        pending.insert(
            path.to_path_buf(),
            PendingPlaylist {
                variant,
                file_name,
                missing,
            },
        );
    }

    fn spawn_segment_upload(&self, path: PathBuf, key: String, done: mpsc::Sender<String>) {
        let storage = Arc::clone(&self.storage);
        let locks = Arc::clone(&self.key_locks);
        tokio::spawn(async move {
            let _guard = locks.acquire(&key).await;
            let result = upload_with_retry(&key, || {
                storage.put_file(&path, &key, SEGMENT_CONTENT_TYPE, SEGMENT_CACHE_CONTROL)
            })
            .await;

            match result {
                Ok(()) => debug!(key, "uploaded segment"),
                Err(e) => error!(key, "dropping segment after failed upload: {e}"),
            }
            // Resolve the key either way so dependent playlists don't stall.
            let _ = done.send(key).await;
        });
    }

    fn spawn_playlist_upload(&self, key: String, content: String) {
        let version_slot = self
            .playlist_versions
            .entry(key.clone())
            .or_insert_with(|| Arc::new(AtomicU64::new(0)))
            .clone();
        let version = version_slot.fetch_add(1, Ordering::SeqCst) + 1;

        let storage = Arc::clone(&self.storage);
        let locks = Arc::clone(&self.key_locks);
        tokio::spawn(async move {
            let _guard = locks.acquire(&key).await;
            if version_slot.load(Ordering::SeqCst) != version {
                debug!(key, "skipping superseded playlist version");
                return;
            }

            let result = upload_with_retry(&key, || {
                storage.put_blob(
                    &key,
                    content.clone().into_bytes(),
                    PLAYLIST_CONTENT_TYPE,
                    PLAYLIST_CACHE_CONTROL,
                )
            })
            .await;

            match result {
                Ok(()) => debug!(key, "uploaded playlist"),
                Err(e) => error!(key, "dropping playlist after failed upload: {e}"),
            }
        });
    }
}

async fn upload_with_retry<F, Fut>(key: &str, mut op: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let mut delay = RETRY_BASE_DELAY;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() && attempt < MAX_UPLOAD_ATTEMPTS => {
                warn!(key, attempt, "upload failed ({e}), retrying in {delay:?}");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Classify a file in the output tree by extension and location.
/// `<root>/<variant>/segment_NNN.ts` and `<root>/[<variant>/]*.m3u8` are
/// artifacts; everything else (directories, recordings, temp files) is not.
pub(crate) fn classify_artifact(output_root: &Path, path: &Path) -> Option<HlsArtifact> {
    let rel = path.strip_prefix(output_root).ok()?;
    let file_name = rel.file_name()?.to_str()?.to_string();
    let ext = rel.extension()?.to_str()?;

    let variant = rel
        .components()
        .next()
        .and_then(|c| match c {
            Component::Normal(s) => s.to_str(),
            _ => None,
        })
        .filter(|first| *first != file_name.as_str())
        .map(str::to_string);

    match ext {
        "ts" => Some(HlsArtifact::Segment {
            variant: variant?,
            file_name,
        }),
        "m3u8" => Some(HlsArtifact::Playlist { variant, file_name }),
        _ => None,
    }
}

/// Relative `.ts` references in a playlist body.
pub(crate) fn playlist_segment_refs(content: &str) -> Vec<&str> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#') && line.ends_with(".ts"))
        .collect()
}

/// Storage keys of referenced segments that have not been resolved yet.
pub(crate) fn missing_segment_keys(
    media_prefix: &str,
    stream_id: &str,
    variant: &str,
    content: &str,
    resolved: &HashSet<String>,
) -> Vec<String> {
    playlist_segment_refs(content)
        .into_iter()
        .map(|file| segment_key(media_prefix, stream_id, variant, file))
        .filter(|key| !resolved.contains(key))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const ROOT: &str = "/tmp/hls/stream-1";

    fn classify(path: &str) -> Option<HlsArtifact> {
        classify_artifact(Path::new(ROOT), Path::new(path))
    }

    #[test]
    fn classifies_variant_segments() {
        assert_eq!(
            classify("/tmp/hls/stream-1/720p/segment_004.ts"),
            Some(HlsArtifact::Segment {
                variant: "720p".into(),
                file_name: "segment_004.ts".into(),
            })
        );
    }

    #[test]
    fn classifies_variant_and_master_playlists() {
        assert_eq!(
            classify("/tmp/hls/stream-1/1080p/playlist.m3u8"),
            Some(HlsArtifact::Playlist {
                variant: Some("1080p".into()),
                file_name: "playlist.m3u8".into(),
            })
        );
        assert_eq!(
            classify("/tmp/hls/stream-1/playlist.m3u8"),
            Some(HlsArtifact::Playlist {
                variant: None,
                file_name: "playlist.m3u8".into(),
            })
        );
    }

    #[test]
    fn ignores_unknown_extensions_and_foreign_paths() {
        assert_eq!(classify("/tmp/hls/stream-1/recording/stream-1.mp4"), None);
        assert_eq!(classify("/tmp/hls/stream-1/720p"), None);
        assert_eq!(classify("/somewhere/else/720p/segment_000.ts"), None);
    }

    #[test]
    fn segment_at_tree_root_is_not_publishable() {
        assert_eq!(classify("/tmp/hls/stream-1/segment_000.ts"), None);
    }

    #[test]
    fn parses_segment_refs_from_playlist() {
        let playlist = "#EXTM3U\n\
                        #EXT-X-VERSION:3\n\
                        #EXT-X-TARGETDURATION:4\n\
                        #EXTINF:4.000000,\n\
                        segment_000.ts\n\
                        #EXTINF:4.000000,\n\
                        segment_001.ts\n";
        assert_eq!(
            playlist_segment_refs(playlist),
            vec!["segment_000.ts", "segment_001.ts"]
        );
    }

    #[test]
    fn master_playlist_has_no_segment_refs() {
        let master = "#EXTM3U\n\
                      #EXT-X-STREAM-INF:BANDWIDTH=5128000,RESOLUTION=1920x1080\n\
                      1080p/playlist.m3u8\n";
        assert!(playlist_segment_refs(master).is_empty());
    }

    #[test]
    fn missing_keys_shrink_as_segments_resolve() {
        let playlist = "#EXTM3U\nsegment_000.ts\nsegment_001.ts\n";
        let mut resolved = HashSet::new();

        let missing = missing_segment_keys("upload/videos", "s1", "720p", playlist, &resolved);
        assert_eq!(
            missing,
            vec![
                "upload/videos/s1/720p/segment_000.ts".to_string(),
                "upload/videos/s1/720p/segment_001.ts".to_string(),
            ]
        );

        resolved.insert("upload/videos/s1/720p/segment_000.ts".to_string());
        let missing = missing_segment_keys("upload/videos", "s1", "720p", playlist, &resolved);
        assert_eq!(missing, vec!["upload/videos/s1/720p/segment_001.ts".to_string()]);

        resolved.insert("upload/videos/s1/720p/segment_001.ts".to_string());
        assert!(
            missing_segment_keys("upload/videos", "s1", "720p", playlist, &resolved).is_empty()
        );
    }
}
