use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::{debug, error, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_gatherer_state::RTCIceGathererState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;

use super::track_writers::{save_audio_track, save_video_track};
use crate::error::{Error, LogError, Result};

pub const VIDEO_FILE_NAME: &str = "video.ivf";
pub const AUDIO_FILE_NAME: &str = "audio.ogg";

/// Window granted to ICE gathering before the local description is returned;
/// negotiation here is plain HTTP, so candidates must ride in the SDP.
const ICE_GATHER_TIMEOUT: Duration = Duration::from_secs(1);

/// Per-stream WebRTC media session: negotiates a peer connection with the
/// broadcasting browser and persists incoming tracks under the stream's
/// scratch directory.
pub struct IngestSession {
    stream_id: String,
    output_dir: PathBuf,
    stun_servers: Vec<String>,
    inner: Mutex<SessionInner>,
}

#[derive(Default)]
struct SessionInner {
    peer: Option<Arc<RTCPeerConnection>>,
    closed: bool,
}

impl IngestSession {
    pub async fn new(
        stream_id: &str,
        ingest_root: &Path,
        stun_servers: Vec<String>,
    ) -> Result<Arc<Self>> {
        let output_dir = ingest_root.join(stream_id);
        tokio::fs::create_dir_all(&output_dir).await?;

        Ok(Arc::new(Self {
            stream_id: stream_id.to_string(),
            output_dir,
            stun_servers,
            inner: Mutex::new(SessionInner::default()),
        }))
    }

    /// Server-initiated negotiation: build an offer carrying recv-only video
    /// and audio sections and return its SDP.
    pub async fn create_offer(self: &Arc<Self>) -> Result<String> {
        let mut inner = self.inner.lock().await;
        self.ensure_open(&inner)?;

        let peer = self.new_peer_connection().await?;

        // Without explicit transceivers the offer would carry no media
        // sections at all.
        for kind in [RTPCodecType::Video, RTPCodecType::Audio] {
            peer.add_transceiver_from_kind(
                kind,
                Some(RTCRtpTransceiverInit {
                    direction: RTCRtpTransceiverDirection::Recvonly,
                    send_encodings: vec![],
                }),
            )
            .await?;
        }

        let offer = peer.create_offer(None).await?;
        peer.set_local_description(offer).await?;
        wait_for_ice_gathering(&peer, ICE_GATHER_TIMEOUT).await;

        let local = peer
            .local_description()
            .await
            .ok_or_else(|| Error::Internal("local description not set".into()))?;

        self.install_peer(&mut inner, peer);
        info!(stream_id = %self.stream_id, "created WebRTC offer");
        Ok(local.sdp)
    }

    /// Client-initiated negotiation: take the browser's offer, return the
    /// answer SDP.
    pub async fn handle_offer(self: &Arc<Self>, offer_sdp: &str) -> Result<String> {
        let offer = RTCSessionDescription::offer(offer_sdp.to_string())
            .map_err(|e| Error::InvalidArgument(format!("malformed offer SDP: {e}")))?;

        let mut inner = self.inner.lock().await;
        self.ensure_open(&inner)?;

        let peer = self.new_peer_connection().await?;
        peer.set_remote_description(offer).await?;

        let answer = peer.create_answer(None).await?;
        peer.set_local_description(answer).await?;
        wait_for_ice_gathering(&peer, ICE_GATHER_TIMEOUT).await;

        let local = peer
            .local_description()
            .await
            .ok_or_else(|| Error::Internal("local description not set".into()))?;

        self.install_peer(&mut inner, peer);
        info!(stream_id = %self.stream_id, "created WebRTC answer");
        Ok(local.sdp)
    }

    /// Complete a previously created offer with the browser's answer.
    pub async fn handle_answer(&self, answer_sdp: &str) -> Result<()> {
        let answer = RTCSessionDescription::answer(answer_sdp.to_string())
            .map_err(|e| Error::InvalidArgument(format!("malformed answer SDP: {e}")))?;

        let inner = self.inner.lock().await;
        let peer = inner
            .peer
            .as_ref()
            .ok_or_else(|| Error::IllegalState("peer connection not initialized".into()))?;

        peer.set_remote_description(answer).await?;
        info!(stream_id = %self.stream_id, "remote description set");
        Ok(())
    }

    /// Close the peer connection and mark the session unusable. Idempotent.
    pub async fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.closed {
            return Ok(());
        }

        if let Some(peer) = inner.peer.take() {
            peer.close().await.log_error("closing peer connection");
        }
        inner.closed = true;
        info!(stream_id = %self.stream_id, "ingest session closed");
        Ok(())
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn video_path(&self) -> PathBuf {
        self.output_dir.join(VIDEO_FILE_NAME)
    }

    pub fn audio_path(&self) -> PathBuf {
        self.output_dir.join(AUDIO_FILE_NAME)
    }

    fn ensure_open(&self, inner: &SessionInner) -> Result<()> {
        if inner.closed {
            return Err(Error::IllegalState(format!(
                "ingest session for stream {} is closed",
                self.stream_id
            )));
        }
        Ok(())
    }

    fn install_peer(&self, inner: &mut SessionInner, peer: Arc<RTCPeerConnection>) {
        if let Some(old) = inner.peer.replace(peer) {
            tokio::spawn(async move {
                old.close().await.log_error("closing replaced peer connection");
            });
        }
    }

    async fn new_peer_connection(self: &Arc<Self>) -> Result<Arc<RTCPeerConnection>> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: self.stun_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };

        let peer = Arc::new(api.new_peer_connection(config).await?);

        let output_dir = self.output_dir.clone();
        let stream_id = self.stream_id.clone();
        peer.on_track(Box::new(move |track, _receiver, _transceiver| {
            let output_dir = output_dir.clone();
            let stream_id = stream_id.clone();
            Box::pin(async move {
                info!(
                    stream_id,
                    kind = %track.kind(),
                    "received media track"
                );
                match track.kind() {
                    RTPCodecType::Video => {
                        tokio::spawn(save_video_track(track, output_dir.join(VIDEO_FILE_NAME)));
                    }
                    RTPCodecType::Audio => {
                        tokio::spawn(save_audio_track(track, output_dir.join(AUDIO_FILE_NAME)));
                    }
                    RTPCodecType::Unspecified => {
                        warn!(stream_id, "ignoring track of unspecified kind");
                    }
                }
            })
        }));

        let stream_id = self.stream_id.clone();
        peer.on_ice_connection_state_change(Box::new(move |state| {
            debug!(stream_id, "ICE connection state changed: {state}");
            Box::pin(async {})
        }));

        // A failed connection ends the session; writers see their tracks
        // close and wind down on their own.
        let session = Arc::downgrade(self);
        let stream_id = self.stream_id.clone();
        peer.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let session: Weak<IngestSession> = session.clone();
            let stream_id = stream_id.clone();
            Box::pin(async move {
                if state == RTCPeerConnectionState::Failed {
                    error!(stream_id, "peer connection failed, closing ingest session");
                    if let Some(session) = session.upgrade() {
                        session.close().await.log_error("closing failed session");
                    }
                }
            })
        }));

        Ok(peer)
    }
}

async fn wait_for_ice_gathering(peer: &Arc<RTCPeerConnection>, timeout: Duration) {
    let (tx, mut rx) = watch::channel(RTCIceGathererState::Unspecified);

    peer.on_ice_gathering_state_change(Box::new(move |state| {
        let _ = tx.send(state);
        Box::pin(async {})
    }));

    let gathered = async {
        while rx.changed().await.is_ok() {
            if *rx.borrow() == RTCIceGathererState::Complete {
                break;
            }
        }
    };

    if tokio::time::timeout(timeout, gathered).await.is_err() {
        debug!("ICE gathering window elapsed, returning local description as-is");
    }
}
