use std::path::Path;
use std::time::Duration;

use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::error::{ProvideErrorMetadata, SdkError};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client as S3Client;
use aws_types::region::Region;
use chrono::Utc;
use serde::Deserialize;
use tracing::{error, info, warn};

use super::types::ObjectAttrs;
use crate::config::StorageConfig;
use crate::error::{Error, Result};

pub const PLAYLIST_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";
pub const SEGMENT_CONTENT_TYPE: &str = "video/MP2T";

/// Segments are immutable once written, playlists roll over constantly, so
/// the edge may hold segments for a while but must refetch manifests fast.
pub const SEGMENT_CACHE_CONTROL: &str = "public, max-age=60";
pub const PLAYLIST_CACHE_CONTROL: &str = "public, max-age=2";

/// Gateway to the object store holding every published stream artifact.
pub struct StorageClient {
    client: S3Client,
    bucket: String,
    region: String,
    endpoint: Option<String>,
    media_prefix: String,
    cdn_base_url: String,
    can_sign: bool,
}

#[derive(Debug, Deserialize)]
struct CredentialsFile {
    access_key_id: String,
    secret_access_key: String,
}

impl StorageClient {
    pub async fn new(config: &StorageConfig) -> Result<Self> {
        let region = Region::new(config.region.clone());
        let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(region);

        let can_sign = match &config.credentials_file {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    Error::Misconfigured(format!("read credentials file {path}: {e}"))
                })?;
                let creds: CredentialsFile = serde_json::from_str(&raw).map_err(|e| {
                    Error::Misconfigured(format!("parse credentials file {path}: {e}"))
                })?;
                loader = loader.credentials_provider(Credentials::new(
                    creds.access_key_id,
                    creds.secret_access_key,
                    None,
                    None,
                    "live-broadcast-server",
                ));
                true
            }
            None => false,
        };

        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }

        let aws_config = loader.load().await;
        let client = S3Client::new(&aws_config);

        info!(
            bucket = %config.bucket,
            region = %config.region,
            signing = can_sign,
            "storage client initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            endpoint: config.endpoint.clone(),
            media_prefix: config.media_prefix.clone(),
            cdn_base_url: config.cdn_base_url.clone(),
            can_sign,
        })
    }

    /// Upload raw bytes under `key`, overwriting any existing object.
    pub async fn put_blob(
        &self,
        key: &str,
        body: Vec<u8>,
        content_type: &str,
        cache_control: &str,
    ) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .cache_control(cache_control)
            .send()
            .await
            .map_err(|e| classify_sdk_error("put_blob", &e))?;
        Ok(())
    }

    /// Streaming copy of a local file to `key`.
    pub async fn put_file(
        &self,
        local_path: &Path,
        key: &str,
        content_type: &str,
        cache_control: &str,
    ) -> Result<()> {
        let body = ByteStream::from_path(local_path).await.map_err(|e| {
            Error::Internal(format!("read {}: {e}", local_path.display()))
        })?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type(content_type)
            .cache_control(cache_control)
            .send()
            .await
            .map_err(|e| classify_sdk_error("put_file", &e))?;
        Ok(())
    }

    /// Byte stream of a stored object. Fails with `NotFound` for unknown keys.
    pub async fn get_reader(&self, key: &str) -> Result<ByteStream> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify_sdk_error("get_reader", &e))?;
        Ok(output.body)
    }

    /// Enumerate objects under `prefix`, skipping zero-size placeholder entries.
    pub async fn list(&self, prefix: &str) -> Result<Vec<ObjectAttrs>> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        let mut objects = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| classify_sdk_error("list", &e))?;
            for object in page.contents() {
                let size = object.size().unwrap_or(0);
                if size == 0 {
                    continue;
                }
                let Some(key) = object.key() else { continue };
                objects.push(ObjectAttrs {
                    key: key.to_string(),
                    size,
                    last_modified_epoch_secs: object
                        .last_modified()
                        .map(|t| t.secs())
                        .unwrap_or(0),
                });
            }
        }
        Ok(objects)
    }

    /// Delete one object. A missing key surfaces as `NotFound`.
    pub async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify_sdk_error("delete", &e))?;
        self.delete_unchecked(key).await
    }

    async fn delete_unchecked(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify_sdk_error("delete", &e))?;
        Ok(())
    }

    /// Public URL for a key. Pure derivation, no I/O.
    pub fn public_url(&self, key: &str) -> String {
        public_object_url(self.endpoint.as_deref(), &self.bucket, &self.region, key)
    }

    /// Presigned GET URL. Degrades to the public URL, with a log line, when
    /// no service credentials were configured or signing fails.
    pub async fn signed_url(&self, key: &str, ttl: Duration) -> Result<String> {
        if !self.can_sign {
            warn!(key, "no storage credentials configured, degrading to public URL");
            return Ok(self.public_url(key));
        }

        let presigning = PresigningConfig::expires_in(ttl)
            .map_err(|e| Error::Internal(format!("presigning config: {e}")))?;

        match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presigning)
            .await
        {
            Ok(request) => Ok(request.uri().to_string()),
            Err(e) => {
                warn!(key, "failed to sign URL ({e}), degrading to public URL");
                Ok(self.public_url(key))
            }
        }
    }

    /// Remove `.ts` segments under `stream_prefix` whose last-modified instant
    /// is older than `age`. Individual delete failures are logged and skipped.
    pub async fn delete_segments_older_than(
        &self,
        stream_prefix: &str,
        age: Duration,
    ) -> Result<()> {
        let cutoff = Utc::now().timestamp() - age.as_secs() as i64;

        for attrs in self.list(stream_prefix).await? {
            if !attrs.key.ends_with(".ts") {
                continue;
            }
            if attrs.last_modified_epoch_secs < cutoff {
                if let Err(e) = self.delete_unchecked(&attrs.key).await {
                    error!(key = %attrs.key, "failed to delete stale segment: {e}");
                }
            }
        }
        Ok(())
    }

    /// Prefix under which every artifact of one stream lives.
    pub fn stream_prefix(&self, stream_id: &str) -> String {
        format!("{}/{}", self.media_prefix, stream_id)
    }

    /// Published CDN URL of the HLS master playlist.
    pub fn hls_master_playlist_url(&self, stream_id: &str) -> String {
        format!("{}/{}/playlist.m3u8", self.cdn_base_url, stream_id)
    }
}

pub(crate) fn public_object_url(
    endpoint: Option<&str>,
    bucket: &str,
    region: &str,
    key: &str,
) -> String {
    match endpoint {
        Some(base) => format!("{}/{}/{}", base.trim_end_matches('/'), bucket, key),
        None => format!("https://{bucket}.s3.{region}.amazonaws.com/{key}"),
    }
}

pub(crate) fn segment_key(
    media_prefix: &str,
    stream_id: &str,
    variant: &str,
    file_name: &str,
) -> String {
    format!("{media_prefix}/{stream_id}/{variant}/{file_name}")
}

pub(crate) fn playlist_key(
    media_prefix: &str,
    stream_id: &str,
    variant: Option<&str>,
    file_name: &str,
) -> String {
    match variant {
        Some(variant) if !variant.is_empty() => {
            format!("{media_prefix}/{stream_id}/{variant}/{file_name}")
        }
        _ => format!("{media_prefix}/{stream_id}/{file_name}"),
    }
}

fn classify_sdk_error<E, R>(op: &str, err: &SdkError<E, R>) -> Error
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    R: std::fmt::Debug,
{
    let text = format!("{op}: {err}");
    match err {
        SdkError::ServiceError(_) => match err.code() {
            Some("NoSuchKey" | "NoSuchBucket" | "NotFound") => Error::NotFound(text),
            Some("AccessDenied" | "InvalidAccessKeyId" | "SignatureDoesNotMatch") => {
                Error::PermissionDenied(text)
            }
            Some("SlowDown" | "ServiceUnavailable" | "InternalError" | "RequestTimeout") => {
                Error::Unavailable(text)
            }
            _ => {
                // head_object errors carry no XML body, so no error code.
                let detail = format!("{err:?}");
                if detail.contains("NotFound") || detail.contains("404") {
                    Error::NotFound(text)
                } else if detail.contains("403") {
                    Error::PermissionDenied(text)
                } else {
                    Error::Internal(text)
                }
            }
        },
        SdkError::DispatchFailure(_) | SdkError::TimeoutError(_) => Error::Unavailable(text),
        _ => Error::Internal(text),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;

    fn test_config(credentials_file: Option<String>) -> StorageConfig {
        StorageConfig {
            bucket: "assets".to_string(),
            region: "us-east-1".to_string(),
            endpoint: None,
            credentials_file,
            media_prefix: "upload/videos".to_string(),
            cdn_base_url: "https://cdn.test.example".to_string(),
            segment_lifetime_hours: 24,
        }
    }

    #[tokio::test]
    async fn signed_url_degrades_to_public_without_credentials() {
        let client = StorageClient::new(&test_config(None)).await.expect("client");
        let url = client
            .signed_url("upload/videos/abc/720p/segment_000.ts", Duration::from_secs(3600))
            .await
            .expect("signed url");
        assert_eq!(url, client.public_url("upload/videos/abc/720p/segment_000.ts"));
    }

    #[tokio::test]
    async fn signed_url_is_presigned_with_credentials() {
        let creds = tempfile::NamedTempFile::new().expect("tempfile");
        std::fs::write(
            creds.path(),
            r#"{"access_key_id":"AKIDEXAMPLE","secret_access_key":"secret"}"#,
        )
        .expect("write creds");

        let config = test_config(Some(creds.path().to_string_lossy().into_owned()));
        let client = StorageClient::new(&config).await.expect("client");
        let url = client
            .signed_url("upload/videos/abc/playlist.m3u8", Duration::from_secs(600))
            .await
            .expect("signed url");
        assert!(url.contains("X-Amz-Signature="), "expected a presigned URL, got {url}");
    }

    #[tokio::test]
    async fn client_rejects_unreadable_credentials_file() {
        let config = test_config(Some("/nonexistent/creds.json".to_string()));
        assert!(matches!(
            StorageClient::new(&config).await,
            Err(Error::Misconfigured(_))
        ));
    }

    #[tokio::test]
    async fn stream_prefix_and_master_url_derive_from_config() {
        let client = StorageClient::new(&test_config(None)).await.expect("client");
        assert_eq!(client.stream_prefix("abc"), "upload/videos/abc");
        assert_eq!(
            client.hls_master_playlist_url("abc"),
            "https://cdn.test.example/abc/playlist.m3u8"
        );
    }

    #[test]
    fn public_url_uses_regional_host_without_endpoint() {
        let url = public_object_url(None, "assets", "eu-west-1", "upload/videos/abc/playlist.m3u8");
        assert_eq!(
            url,
            "https://assets.s3.eu-west-1.amazonaws.com/upload/videos/abc/playlist.m3u8"
        );
    }

    #[test]
    fn public_url_prefers_custom_endpoint() {
        let url = public_object_url(
            Some("https://minio.local:9000/"),
            "assets",
            "us-east-1",
            "k/v.ts",
        );
        assert_eq!(url, "https://minio.local:9000/assets/k/v.ts");
    }

    #[test]
    fn segment_keys_are_variant_scoped() {
        assert_eq!(
            segment_key("upload/videos", "abc", "720p", "segment_003.ts"),
            "upload/videos/abc/720p/segment_003.ts"
        );
    }

    #[test]
    fn playlist_key_distinguishes_master_and_variant() {
        assert_eq!(
            playlist_key("upload/videos", "abc", None, "playlist.m3u8"),
            "upload/videos/abc/playlist.m3u8"
        );
        assert_eq!(
            playlist_key("upload/videos", "abc", Some(""), "playlist.m3u8"),
            "upload/videos/abc/playlist.m3u8"
        );
        assert_eq!(
            playlist_key("upload/videos", "abc", Some("1080p"), "playlist.m3u8"),
            "upload/videos/abc/1080p/playlist.m3u8"
        );
    }
}
