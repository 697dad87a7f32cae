use std::path::PathBuf;
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};
use webrtc::media::io::ivf_reader::IVFFileHeader;
use webrtc::media::io::ivf_writer::IVFWriter;
use webrtc::media::io::Writer;
use webrtc::track::track_remote::TrackRemote;

/// Drain a remote video track into an IVF container the encoder can read.
/// Runs until the track ends or a write fails; errors terminate only this
/// writer.
pub(crate) async fn save_video_track(track: Arc<TrackRemote>, path: PathBuf) {
    let file = match std::fs::File::create(&path) {
        Ok(file) => file,
        Err(e) => {
            error!(path = %path.display(), "failed to create video file: {e}");
            return;
        }
    };

    let header = IVFFileHeader {
        signature: *b"DKIF",
        version: 0,
        header_size: 32,
        four_cc: *b"VP80",
        width: 640,
        height: 480,
        timebase_denominator: 30,
        timebase_numerator: 1,
        num_frames: 900,
        unused: 0,
    };

    let mut writer = match IVFWriter::new(file, &header) {
        Ok(writer) => writer,
        Err(e) => {
            error!(path = %path.display(), "failed to create IVF writer: {e}");
            return;
        }
    };

    info!(path = %path.display(), "saving video track");

    loop {
        match track.read_rtp().await {
            Ok((packet, _)) => {
                if let Err(e) = writer.write_rtp(&packet) {
                    error!("error writing video RTP packet: {e}");
                    break;
                }
            }
            Err(e) => {
                debug!("video track ended: {e}");
                break;
            }
        }
    }

    if let Err(e) = writer.close() {
        error!("error finalizing IVF file: {e}");
    }
    info!(path = %path.display(), "video track writer finished");
}

/// Drain a remote audio track as a raw packet-payload dump.
///
/// Best-effort diagnostics only: the output carries no container framing, so
/// it is never fed to the encoder (which synthesizes silence instead).
pub(crate) async fn save_audio_track(track: Arc<TrackRemote>, path: PathBuf) {
    let mut file = match tokio::fs::File::create(&path).await {
        Ok(file) => file,
        Err(e) => {
            error!(path = %path.display(), "failed to create audio file: {e}");
            return;
        }
    };

    info!(path = %path.display(), "saving audio track");

    loop {
        match track.read_rtp().await {
            Ok((packet, _)) => {
                if packet.payload.is_empty() {
                    continue;
                }
                if let Err(e) = file.write_all(&packet.payload).await {
                    error!("error writing audio payload: {e}");
                    break;
                }
            }
            Err(e) => {
                debug!("audio track ended: {e}");
                break;
            }
        }
    }

    info!(path = %path.display(), "audio track writer finished");
}
