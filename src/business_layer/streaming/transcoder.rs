use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::FfmpegConfig;
use crate::error::{Error, Result};

/// Supervises one external ffmpeg process transcoding an ingest file into a
/// segmented HLS ladder.
pub struct FfmpegTranscoder {
    config: FfmpegConfig,
    inner: Arc<Mutex<TranscoderState>>,
}

#[derive(Default)]
struct TranscoderState {
    running: bool,
    cancel: Option<CancellationToken>,
}

impl FfmpegTranscoder {
    pub fn new(config: FfmpegConfig) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(TranscoderState::default())),
        }
    }

    /// Spawn ffmpeg for `input_spec` (a file path, or `video|audio`) writing
    /// the HLS tree under `output_root`. The child is bound to a scope derived
    /// from `parent`; cancelling the parent kills the process.
    pub async fn start(
        &self,
        parent: &CancellationToken,
        input_spec: &str,
        stream_id: &str,
        output_root: &Path,
    ) -> Result<()> {
        let mut state = self.inner.lock().await;
        if state.running {
            return Err(Error::AlreadyRunning(format!(
                "transcoder for stream {stream_id}"
            )));
        }

        create_output_dirs(&self.config, output_root).await?;

        let args = build_ffmpeg_args(&self.config, input_spec, stream_id, output_root);
        info!(stream_id, "starting ffmpeg: ffmpeg {}", args.join(" "));

        let token = parent.child_token();

        let mut child = Command::new("ffmpeg")
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Internal(format!("failed to start ffmpeg: {e}")))?;

        if let Some(stdout) = child.stdout.take() {
            forward_process_output(stream_id, "stdout", stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_process_output(stream_id, "stderr", stderr);
        }

        state.running = true;
        state.cancel = Some(token.clone());

        // Reap the child asynchronously and record how it went.
        let inner = Arc::clone(&self.inner);
        let stream_id = stream_id.to_string();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = token.cancelled() => {
                    if let Err(e) = child.start_kill() {
                        debug!(stream_id, "ffmpeg kill signal failed: {e}");
                    }
                    child.wait().await
                }
            };

            {
                let mut state = inner.lock().await;
                state.running = false;
                state.cancel = None;
            }

            match status {
                Ok(exit) if token.is_cancelled() => {
                    info!(stream_id, "ffmpeg exited after cancellation ({exit})");
                }
                Ok(exit) if exit.success() => info!(stream_id, "ffmpeg exited normally"),
                Ok(exit) => error!(stream_id, "ffmpeg exited with {exit}"),
                Err(e) => error!(stream_id, "failed waiting for ffmpeg: {e}"),
            }
        });

        Ok(())
    }

    /// Cancel the child scope. Idempotent; the monitor task reports the
    /// eventual process exit.
    pub async fn stop(&self) {
        let mut state = self.inner.lock().await;
        if let Some(cancel) = state.cancel.take() {
            info!("stopping transcoder");
            cancel.cancel();
        }
        state.running = false;
    }

    pub async fn is_running(&self) -> bool {
        self.inner.lock().await.running
    }
}

fn forward_process_output(
    stream_id: &str,
    pipe: &'static str,
    output: impl AsyncRead + Unpin + Send + 'static,
) {
    let stream_id = stream_id.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(output).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if !line.trim().is_empty() {
                debug!(target: "ffmpeg", stream_id, pipe, "{line}");
            }
        }
    });
}

/// Create the per-variant output directories, plus `recording/` when enabled,
/// before ffmpeg starts writing into them.
async fn create_output_dirs(config: &FfmpegConfig, output_root: &Path) -> Result<()> {
    tokio::fs::create_dir_all(output_root).await?;
    for profile in &config.profiles {
        tokio::fs::create_dir_all(output_root.join(&profile.name)).await?;
    }
    if config.recording.enabled {
        tokio::fs::create_dir_all(output_root.join("recording")).await?;
    }
    debug!("created output directories in {}", output_root.display());
    Ok(())
}

/// Assemble the full ffmpeg argument vector for the ABR HLS ladder.
pub(crate) fn build_ffmpeg_args(
    config: &FfmpegConfig,
    input_spec: &str,
    stream_id: &str,
    output_root: &Path,
) -> Vec<String> {
    let mut args: Vec<String> = [
        // Regenerate PTS; browser ingest files have no reliable timestamps.
        "-fflags",
        "genpts",
        "-avoid_negative_ts",
        "make_zero",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();

    let inputs: Vec<&str> = input_spec.split('|').collect();
    if inputs.len() > 1 {
        // Separate video and audio files.
        for input in &inputs {
            args.push("-i".into());
            args.push((*input).into());
        }
    } else {
        // Video-only IVF: no container timestamps, so read at native rate
        // with an explicit frame rate and synthesize silent stereo audio.
        args.extend(
            ["-re", "-f", "ivf", "-r", "30", "-i", input_spec]
                .iter()
                .map(|s| s.to_string()),
        );
        args.extend(
            [
                "-f",
                "lavfi",
                "-i",
                "anullsrc=channel_layout=stereo:sample_rate=48000",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
    }

    args.push("-fps_mode".into());
    args.push("cfr".into());

    let mut var_stream_map = Vec::with_capacity(config.profiles.len());
    for (i, profile) in config.profiles.iter().enumerate() {
        // Video lanes always map from input 0.
        args.extend([
            "-map".to_string(),
            "0:v:0".to_string(),
            format!("-c:v:{i}"),
            "libx264".to_string(),
            format!("-s:v:{i}"),
            format!("{}x{}", profile.width, profile.height),
            format!("-b:v:{i}"),
            format!("{}k", profile.video_bitrate),
            format!("-maxrate:v:{i}"),
            format!("{}k", profile.video_bitrate),
            format!("-bufsize:v:{i}"),
            format!("{}k", profile.video_bitrate * 2),
            "-preset".to_string(),
            profile.preset.clone(),
            "-g".to_string(),
            (profile.framerate * 2).to_string(),
            "-keyint_min".to_string(),
            (profile.framerate * 2).to_string(),
            "-sc_threshold".to_string(),
            "0".to_string(),
            format!("-profile:v:{i}"),
            "high".to_string(),
        ]);

        // Audio from input 1: either the audio file or the silent source.
        args.extend([
            "-map".to_string(),
            "1:a:0".to_string(),
            format!("-c:a:{i}"),
            "aac".to_string(),
            format!("-b:a:{i}"),
            format!("{}k", profile.audio_bitrate),
            "-ar".to_string(),
            "48000".to_string(),
            "-ac".to_string(),
            "2".to_string(),
        ]);

        var_stream_map.push(format!("v:{i},a:{i},name:{}", profile.name));
    }

    // Assemble the flag set once so low-latency mode extends it instead of
    // replacing it.
    let mut hls_flags = vec![
        "delete_segments",
        "append_list",
        "omit_endlist",
        "independent_segments",
    ];
    if config.low_latency_mode {
        hls_flags.push("program_date_time");
    }

    args.extend([
        "-f".to_string(),
        "hls".to_string(),
        "-hls_time".to_string(),
        config.segment_duration.to_string(),
        "-hls_list_size".to_string(),
        config.playlist_size.to_string(),
        "-hls_flags".to_string(),
        hls_flags.join("+"),
        "-hls_segment_type".to_string(),
        "mpegts".to_string(),
        "-hls_segment_filename".to_string(),
        output_root
            .join("%v")
            .join("segment_%03d.ts")
            .to_string_lossy()
            .into_owned(),
        "-master_pl_name".to_string(),
        "playlist.m3u8".to_string(),
        "-var_stream_map".to_string(),
        var_stream_map.join(" "),
        "-start_number".to_string(),
        "0".to_string(),
    ]);

    if config.low_latency_mode {
        args.push("-hls_start_number_source".into());
        args.push("epoch".into());
    }

    args.push(
        output_root
            .join("%v")
            .join("playlist.m3u8")
            .to_string_lossy()
            .into_owned(),
    );

    if config.recording.enabled {
        let record_path = output_root
            .join("recording")
            .join(format!("{stream_id}.{}", config.recording.format));
        args.extend([
            "-map".to_string(),
            "0".to_string(),
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            "fast".to_string(),
            "-b:v".to_string(),
            format!("{}k", config.recording.video_bitrate),
            "-c:a".to_string(),
            "aac".to_string(),
            "-b:a".to_string(),
            format!("{}k", config.recording.audio_bitrate),
            "-f".to_string(),
            config.recording.format.clone(),
            record_path.to_string_lossy().into_owned(),
        ]);
    }

    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn config() -> FfmpegConfig {
        FfmpegConfig::default()
    }

    fn args_for(config: &FfmpegConfig, input: &str) -> Vec<String> {
        build_ffmpeg_args(config, input, "stream-1", &PathBuf::from("/tmp/hls/stream-1"))
    }

    fn count_flag(args: &[String], flag: &str) -> usize {
        args.iter().filter(|a| a.as_str() == flag).count()
    }

    #[test]
    fn single_input_reads_ivf_and_synthesizes_audio() {
        let args = args_for(&config(), "/tmp/webrtc-ingest/stream-1/video.ivf");
        assert!(args.contains(&"-re".to_string()));
        assert!(args.contains(&"ivf".to_string()));
        assert!(args
            .iter()
            .any(|a| a.starts_with("anullsrc=channel_layout=stereo")));
        assert_eq!(count_flag(&args, "-i"), 2);
    }

    #[test]
    fn dual_input_maps_audio_from_second_file() {
        let args = args_for(&config(), "/tmp/in/video.ivf|/tmp/in/audio.ogg");
        assert_eq!(count_flag(&args, "-i"), 2);
        assert!(!args.iter().any(|a| a.starts_with("anullsrc")));
        assert!(args.contains(&"/tmp/in/audio.ogg".to_string()));
        assert!(args.contains(&"1:a:0".to_string()));
    }

    #[test]
    fn hls_flags_are_assembled_once() {
        let mut cfg = config();
        let args = args_for(&cfg, "/tmp/in/video.ivf");
        assert_eq!(count_flag(&args, "-hls_flags"), 1);
        let flags_value = &args[args.iter().position(|a| a == "-hls_flags").unwrap() + 1];
        assert_eq!(
            flags_value,
            "delete_segments+append_list+omit_endlist+independent_segments"
        );

        cfg.low_latency_mode = true;
        let args = args_for(&cfg, "/tmp/in/video.ivf");
        assert_eq!(count_flag(&args, "-hls_flags"), 1);
        let flags_value = &args[args.iter().position(|a| a == "-hls_flags").unwrap() + 1];
        assert_eq!(
            flags_value,
            "delete_segments+append_list+omit_endlist+independent_segments+program_date_time"
        );
        assert!(args.contains(&"-hls_start_number_source".to_string()));
        assert!(args.contains(&"epoch".to_string()));
    }

    #[test]
    fn ladder_produces_one_lane_per_profile() {
        let cfg = config();
        let args = args_for(&cfg, "/tmp/in/video.ivf");
        let map_pos = args.iter().position(|a| a == "-var_stream_map").unwrap();
        assert_eq!(
            args[map_pos + 1],
            "v:0,a:0,name:1080p v:1,a:1,name:720p v:2,a:2,name:480p v:3,a:3,name:360p"
        );
        assert!(args.contains(&"-s:v:0".to_string()));
        assert!(args.contains(&"1920x1080".to_string()));
        assert!(args.contains(&"-s:v:3".to_string()));
        assert!(args.contains(&"640x360".to_string()));
    }

    #[test]
    fn recording_output_is_appended_when_enabled() {
        let mut cfg = config();
        cfg.recording.enabled = true;
        let args = args_for(&cfg, "/tmp/in/video.ivf");
        assert!(args.contains(&"/tmp/hls/stream-1/recording/stream-1.mp4".to_string()));

        cfg.recording.enabled = false;
        let args = args_for(&cfg, "/tmp/in/video.ivf");
        assert!(!args.iter().any(|a| a.contains("recording")));
    }

    #[tokio::test]
    async fn output_dirs_cover_every_variant() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().join("stream-1");
        create_output_dirs(&config(), &root).await.expect("dirs");
        for variant in ["1080p", "720p", "480p", "360p", "recording"] {
            assert!(root.join(variant).is_dir(), "{variant} missing");
        }
    }
}
