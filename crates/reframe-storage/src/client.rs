//! R2 client implementation.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{Builder, Region};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::{debug, info};

use crate::error::{StorageError, StorageResult};
use crate::keys::DEFAULT_KEY_PREFIX;

/// Where oversized results go.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload the file at `path` under `key` and return a URL a client can
    /// fetch it from.
    async fn put_file(&self, key: &str, path: &Path, content_type: &str) -> StorageResult<String>;

    /// Prefix new keys are created under.
    fn key_prefix(&self) -> &str;

    /// Cheap reachability check for readiness probes.
    async fn check_connectivity(&self) -> StorageResult<()>;
}

/// Configuration for R2 client.
#[derive(Debug, Clone)]
pub struct R2Config {
    /// R2 endpoint URL (S3 API endpoint)
    pub endpoint_url: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket_name: String,
    /// Region (usually "auto" for R2)
    pub region: String,
    /// Public base URL of the bucket; when unset, URLs are presigned
    pub public_base_url: Option<String>,
    pub key_prefix: String,
    /// Lifetime of presigned GET URLs
    pub presign_expiry: Duration,
}

impl R2Config {
    /// Create config from environment variables.
    pub fn from_env() -> StorageResult<Self> {
        Ok(Self {
            endpoint_url: std::env::var("R2_ENDPOINT_URL")
                .map_err(|_| StorageError::config_error("R2_ENDPOINT_URL not set"))?,
            access_key_id: std::env::var("R2_ACCESS_KEY_ID")
                .map_err(|_| StorageError::config_error("R2_ACCESS_KEY_ID not set"))?,
            secret_access_key: std::env::var("R2_SECRET_ACCESS_KEY")
                .map_err(|_| StorageError::config_error("R2_SECRET_ACCESS_KEY not set"))?,
            bucket_name: std::env::var("R2_BUCKET_NAME")
                .map_err(|_| StorageError::config_error("R2_BUCKET_NAME not set"))?,
            region: std::env::var("R2_REGION").unwrap_or_else(|_| "auto".to_string()),
            public_base_url: std::env::var("R2_PUBLIC_BASE_URL")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            key_prefix: std::env::var("R2_KEY_PREFIX")
                .unwrap_or_else(|_| DEFAULT_KEY_PREFIX.to_string()),
            presign_expiry: Duration::from_secs(
                std::env::var("R2_PRESIGN_EXPIRY_SECS")
                    .ok()
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(7 * 24 * 3600),
            ),
        })
    }
}

/// Cloudflare R2 storage client.
#[derive(Clone)]
pub struct R2Client {
    client: Client,
    bucket: String,
    public_base_url: Option<String>,
    key_prefix: String,
    presign_expiry: Duration,
}

impl R2Client {
    /// Create a new R2 client from configuration.
    pub async fn new(config: R2Config) -> StorageResult<Self> {
        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "r2",
        );

        let sdk_config = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(&config.endpoint_url)
            .region(Region::new(config.region))
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Ok(Self {
            client: Client::from_conf(sdk_config),
            bucket: config.bucket_name,
            public_base_url: config.public_base_url,
            key_prefix: config.key_prefix,
            presign_expiry: config.presign_expiry,
        })
    }

    /// Create from environment variables.
    pub async fn from_env() -> StorageResult<Self> {
        let config = R2Config::from_env()?;
        Self::new(config).await
    }

    /// Upload a file to R2.
    pub async fn upload_file(
        &self,
        path: impl AsRef<Path>,
        key: &str,
        content_type: &str,
    ) -> StorageResult<()> {
        let path = path.as_ref();
        debug!("Uploading {} to {}", path.display(), key);

        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| StorageError::upload_failed(e.to_string()))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StorageError::upload_failed(e.to_string()))?;

        info!("Uploaded {} to {}", path.display(), key);
        Ok(())
    }

    /// Generate a presigned URL for GET (temporary, signed URL via S3 API).
    pub async fn presign_get(&self, key: &str, expires_in: Duration) -> StorageResult<String> {
        let presign_config = PresigningConfig::expires_in(expires_in)
            .map_err(|e| StorageError::PresignFailed(e.to_string()))?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(presign_config)
            .await
            .map_err(|e| StorageError::PresignFailed(e.to_string()))?;

        Ok(presigned.uri().to_string())
    }

    /// Public URL for `key`, or a presigned one when the bucket is private.
    pub async fn url_for(&self, key: &str) -> StorageResult<String> {
        match &self.public_base_url {
            Some(base) => Ok(public_url(base, key)),
            None => self.presign_get(key, self.presign_expiry).await,
        }
    }
}

#[async_trait]
impl ObjectStore for R2Client {
    async fn put_file(&self, key: &str, path: &Path, content_type: &str) -> StorageResult<String> {
        if key.is_empty() || key.starts_with('/') {
            return Err(StorageError::InvalidKey(key.to_string()));
        }
        self.upload_file(path, key, content_type).await?;
        self.url_for(key).await
    }

    fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Check connectivity to R2 by performing a head bucket operation.
    async fn check_connectivity(&self) -> StorageResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| StorageError::AwsSdk(format!("R2 connectivity check failed: {}", e)))?;
        Ok(())
    }
}

/// Join a public base URL and a key, percent-encoding each key segment.
pub fn public_url(base: &str, key: &str) -> String {
    let encoded = key
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/");
    format!("{}/{}", base.trim_end_matches('/'), encoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(public_base_url: Option<&str>) -> R2Config {
        R2Config {
            endpoint_url: "https://account.r2.cloudflarestorage.com".to_string(),
            access_key_id: "key".to_string(),
            secret_access_key: "secret".to_string(),
            bucket_name: "outputs".to_string(),
            region: "auto".to_string(),
            public_base_url: public_base_url.map(str::to_string),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            presign_expiry: Duration::from_secs(3600),
        }
    }

    #[test]
    fn test_url_for_public_bucket() {
        let client = tokio_test::block_on(R2Client::new(config(Some("https://cdn.example.com")))).unwrap();
        let url = tokio_test::block_on(client.url_for("reframe/a.mp4")).unwrap();
        assert_eq!(url, "https://cdn.example.com/reframe/a.mp4");
        assert_eq!(client.key_prefix(), "reframe");
    }

    #[tokio::test]
    async fn test_url_for_private_bucket_is_presigned() {
        let client = R2Client::new(config(None)).await.unwrap();
        let url = client.url_for("reframe/a.mp4").await.unwrap();
        assert!(url.starts_with("https://account.r2.cloudflarestorage.com/outputs/reframe/a.mp4?"));
        assert!(url.contains("X-Amz-Signature="));
    }

    #[tokio::test]
    async fn test_put_file_rejects_absolute_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("output.mp4");
        std::fs::write(&path, b"data").unwrap();

        let client = R2Client::new(config(None)).await.unwrap();
        let err = client.put_file("/abs.mp4", &path, "video/mp4").await.unwrap_err();
        assert!(matches!(err, StorageError::InvalidKey(_)));
    }

    #[test]
    fn test_public_url() {
        assert_eq!(
            public_url("https://cdn.example.com/", "reframe/20240309T070501Z-0a1b2c3d-clip.mp4"),
            "https://cdn.example.com/reframe/20240309T070501Z-0a1b2c3d-clip.mp4"
        );
        assert_eq!(
            public_url("https://cdn.example.com", "a b/c.mp4"),
            "https://cdn.example.com/a%20b/c.mp4"
        );
    }
}
