use std::path::PathBuf;

use crate::error::{Error, Result};

/// Process configuration, sourced from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub ffmpeg: FfmpegConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    /// Scratch root for per-stream WebRTC ingest files.
    pub ingest_dir: PathBuf,
    /// Scratch root for per-stream HLS encoder output.
    pub hls_dir: PathBuf,
    pub stun_servers: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub bucket: String,
    pub region: String,
    /// Custom endpoint for S3-compatible stores; regional AWS URL otherwise.
    pub endpoint: Option<String>,
    /// Path to a JSON credentials file. Absent means the ambient credential
    /// chain is used and URL signing degrades to public URLs.
    pub credentials_file: Option<String>,
    /// Key prefix under which all stream artifacts live.
    pub media_prefix: String,
    /// Delivery base; `<cdn_base_url>/<stream_id>/playlist.m3u8` is the
    /// published master URL.
    pub cdn_base_url: String,
    /// Janitor cutoff for stale `.ts` segments.
    pub segment_lifetime_hours: u64,
}

/// Transcoder configuration: HLS windowing plus the ABR ladder.
#[derive(Debug, Clone)]
pub struct FfmpegConfig {
    /// HLS segment duration in seconds.
    pub segment_duration: u32,
    /// Number of segments kept in each variant playlist.
    pub playlist_size: u32,
    pub low_latency_mode: bool,
    pub profiles: Vec<TranscodeProfile>,
    pub recording: RecordingConfig,
}

#[derive(Debug, Clone)]
pub struct TranscodeProfile {
    pub name: String,
    pub width: u32,
    pub height: u32,
    /// kbps
    pub video_bitrate: u32,
    /// kbps
    pub audio_bitrate: u32,
    pub framerate: u32,
    pub preset: String,
}

#[derive(Debug, Clone)]
pub struct RecordingConfig {
    pub enabled: bool,
    /// Container format, e.g. `mp4`.
    pub format: String,
    pub video_bitrate: u32,
    pub audio_bitrate: u32,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let port = env_or("PORT", "8080")
            .parse::<u16>()
            .map_err(|e| Error::Misconfigured(format!("PORT: {e}")))?;

        let bucket = std::env::var("STORAGE_BUCKET")
            .map_err(|_| Error::Misconfigured("STORAGE_BUCKET is required".into()))?;

        Ok(Self {
            server: ServerConfig {
                port,
                ingest_dir: PathBuf::from(env_or("INGEST_DIR", "/tmp/webrtc-ingest")),
                hls_dir: PathBuf::from(env_or("HLS_DIR", "/tmp/hls")),
                stun_servers: vec!["stun:stun.l.google.com:19302".to_string()],
            },
            storage: StorageConfig {
                bucket,
                region: env_or("STORAGE_REGION", "us-east-1"),
                endpoint: std::env::var("STORAGE_ENDPOINT").ok(),
                credentials_file: std::env::var("STORAGE_CREDENTIALS").ok(),
                media_prefix: env_or("MEDIA_PREFIX", "upload/videos"),
                cdn_base_url: env_or("CDN_BASE_URL", "https://cdn.example.com"),
                segment_lifetime_hours: env_or("SEGMENT_LIFETIME_HOURS", "24")
                    .parse::<u64>()
                    .map_err(|e| Error::Misconfigured(format!("SEGMENT_LIFETIME_HOURS: {e}")))?,
            },
            ffmpeg: FfmpegConfig::default(),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

impl Default for FfmpegConfig {
    fn default() -> Self {
        Self {
            segment_duration: 4,
            playlist_size: 5,
            low_latency_mode: false,
            profiles: vec![
                TranscodeProfile::new("1080p", 1920, 1080, 5000, 128),
                TranscodeProfile::new("720p", 1280, 720, 2800, 128),
                TranscodeProfile::new("480p", 854, 480, 1400, 96),
                TranscodeProfile::new("360p", 640, 360, 800, 96),
            ],
            recording: RecordingConfig {
                enabled: true,
                format: "mp4".to_string(),
                video_bitrate: 5000,
                audio_bitrate: 192,
            },
        }
    }
}

impl TranscodeProfile {
    fn new(name: &str, width: u32, height: u32, video_bitrate: u32, audio_bitrate: u32) -> Self {
        Self {
            name: name.to_string(),
            width,
            height,
            video_bitrate,
            audio_bitrate,
            framerate: 30,
            preset: "veryfast".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    fn clear_env() {
        for key in [
            "PORT",
            "STORAGE_BUCKET",
            "STORAGE_REGION",
            "STORAGE_ENDPOINT",
            "STORAGE_CREDENTIALS",
            "MEDIA_PREFIX",
            "CDN_BASE_URL",
            "INGEST_DIR",
            "HLS_DIR",
            "SEGMENT_LIFETIME_HOURS",
        ] {
            env::remove_var(key);
        }
    }

    #[serial]
    #[test]
    fn from_env_requires_bucket() {
        clear_env();
        assert!(matches!(Config::from_env(), Err(Error::Misconfigured(_))));
    }

    #[serial]
    #[test]
    fn from_env_uses_defaults() {
        clear_env();
        env::set_var("STORAGE_BUCKET", "test-bucket");

        let config = Config::from_env().expect("from_env");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.storage.media_prefix, "upload/videos");
        assert_eq!(config.storage.cdn_base_url, "https://cdn.example.com");
        assert_eq!(config.storage.segment_lifetime_hours, 24);
        assert_eq!(config.server.ingest_dir, PathBuf::from("/tmp/webrtc-ingest"));
        assert_eq!(config.server.hls_dir, PathBuf::from("/tmp/hls"));

        clear_env();
    }

    #[serial]
    #[test]
    fn from_env_respects_overrides() {
        clear_env();
        env::set_var("STORAGE_BUCKET", "assets");
        env::set_var("PORT", "9090");
        env::set_var("MEDIA_PREFIX", "live/streams");
        env::set_var("CDN_BASE_URL", "https://cdn.test.example");

        let config = Config::from_env().expect("from_env");
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.storage.bucket, "assets");
        assert_eq!(config.storage.media_prefix, "live/streams");
        assert_eq!(config.storage.cdn_base_url, "https://cdn.test.example");

        clear_env();
    }

    #[serial]
    #[test]
    fn from_env_rejects_bad_port() {
        clear_env();
        env::set_var("STORAGE_BUCKET", "assets");
        env::set_var("PORT", "not-a-port");
        assert!(Config::from_env().is_err());
        clear_env();
    }

    #[test]
    fn default_ladder_matches_expected_profiles() {
        let config = FfmpegConfig::default();
        let names: Vec<&str> = config.profiles.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, ["1080p", "720p", "480p", "360p"]);
        assert_eq!(config.segment_duration, 4);
        assert_eq!(config.playlist_size, 5);
        assert!(!config.low_latency_mode);
        assert!(config.recording.enabled);
    }
}
