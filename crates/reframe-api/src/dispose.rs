//! Routing of finished outputs: inline bytes or an object-store reference.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::{header, HeaderValue, Response, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use reframe_media::OutputArtifact;
use reframe_models::StoredResponse;
use reframe_storage::{new_object_key, ObjectStore};
use tracing::{info, warn};

use crate::error::{ApiError, ApiResult};
use crate::metrics;

pub const X_ORIENTATION: &str = "x-orientation";
pub const X_MODE_USED: &str = "x-mode-used";

/// Decides where a finished artifact goes.
#[derive(Clone)]
pub struct Disposer {
    inline_limit: u64,
    store: Option<Arc<dyn ObjectStore>>,
}

impl Disposer {
    pub fn new(inline_limit: u64, store: Option<Arc<dyn ObjectStore>>) -> Self {
        Self { inline_limit, store }
    }

    /// Whether an output of `size` bytes is returned in the body.
    pub fn is_inline(&self, size: u64) -> bool {
        size <= self.inline_limit
    }

    /// Build the response for `artifact`.
    ///
    /// The artifact file must stay on disk until this returns.
    pub async fn dispose(&self, artifact: &OutputArtifact) -> ApiResult<Response<Body>> {
        if self.is_inline(artifact.size) {
            self.inline(artifact).await
        } else {
            self.stored(artifact).await
        }
    }

    async fn inline(&self, artifact: &OutputArtifact) -> ApiResult<Response<Body>> {
        // Fully buffered so headers go out with an exact Content-Length.
        let bytes = tokio::fs::read(&artifact.path)
            .await
            .map_err(|e| ApiError::internal(format!("Failed to read output: {}", e)))?;

        if bytes.len() as u64 != artifact.size {
            warn!(
                expected = artifact.size,
                actual = bytes.len(),
                "Output size changed after conversion"
            );
        }

        metrics::record_disposition("inline", bytes.len() as u64);
        info!(
            size = bytes.len(),
            filename = %artifact.filename,
            mode_used = %artifact.mode_used,
            "Returning output inline"
        );

        let disposition = HeaderValue::from_str(&content_disposition(&artifact.filename))
            .map_err(|e| ApiError::internal(format!("Invalid filename header: {}", e)))?;

        let len = bytes.len() as u64;
        let mut response = Response::new(Body::from(bytes));
        *response.status_mut() = StatusCode::OK;
        let headers = response.headers_mut();
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static(artifact.content_type));
        headers.insert(header::CONTENT_DISPOSITION, disposition);
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
        headers.insert(
            X_ORIENTATION,
            HeaderValue::from_static(artifact.orientation.as_str()),
        );
        headers.insert(X_MODE_USED, HeaderValue::from_static(artifact.mode_used.as_str()));

        Ok(response)
    }

    async fn stored(&self, artifact: &OutputArtifact) -> ApiResult<Response<Body>> {
        let store = self.store.as_ref().ok_or_else(|| {
            ApiError::storage(format!(
                "Output is {} bytes, above the inline limit of {}, and no object store is configured",
                artifact.size, self.inline_limit
            ))
        })?;

        let key = new_object_key(store.key_prefix(), &artifact.filename);
        let start = Instant::now();
        let result = store
            .put_file(&key, &artifact.path, artifact.content_type)
            .await;
        metrics::record_store_upload(start.elapsed().as_secs_f64(), result.is_ok());
        let blob_url = result?;

        metrics::record_disposition("stored", artifact.size);
        info!(size = artifact.size, key = %key, "Output routed to object store");

        let body = StoredResponse::new(
            artifact.size,
            blob_url,
            artifact.orientation,
            artifact.mode_used,
        );
        Ok((StatusCode::OK, Json(body)).into_response())
    }
}

/// `inline; filename="<name>"; filename*=UTF-8''<encoded>`
pub fn content_disposition(filename: &str) -> String {
    let ascii: String = filename
        .chars()
        .map(|c| {
            if (c.is_ascii_graphic() && c != '"' && c != '\\') || c == ' ' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!(
        "inline; filename=\"{}\"; filename*=UTF-8''{}",
        ascii,
        urlencoding::encode(filename)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use reframe_models::{ModeUsed, Orientation};
    use reframe_storage::{StorageError, StorageResult};
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeStore {
        fail: bool,
        puts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ObjectStore for FakeStore {
        async fn put_file(&self, key: &str, path: &Path, _content_type: &str) -> StorageResult<String> {
            assert!(path.exists());
            if self.fail {
                return Err(StorageError::upload_failed("bucket unreachable"));
            }
            self.puts.lock().unwrap().push(key.to_string());
            Ok(format!("https://cdn.example.com/{}", key))
        }

        fn key_prefix(&self) -> &str {
            "reframe"
        }

        async fn check_connectivity(&self) -> StorageResult<()> {
            Ok(())
        }
    }

    fn artifact(dir: &Path, size: usize) -> OutputArtifact {
        let path: PathBuf = dir.join("output.mp4");
        std::fs::write(&path, vec![0u8; size]).unwrap();
        OutputArtifact {
            path,
            size: size as u64,
            content_type: "video/mp4",
            filename: "holiday.mp4".to_string(),
            orientation: Orientation::Portrait,
            mode_used: ModeUsed::Encode,
        }
    }

    #[test]
    fn test_content_disposition() {
        assert_eq!(
            content_disposition("clip.mp4"),
            "inline; filename=\"clip.mp4\"; filename*=UTF-8''clip.mp4"
        );
        assert_eq!(
            content_disposition("my clip.mp4"),
            "inline; filename=\"my clip.mp4\"; filename*=UTF-8''my%20clip.mp4"
        );
    }

    #[test]
    fn test_limit_is_inclusive() {
        let disposer = Disposer::new(100, None);
        assert!(disposer.is_inline(100));
        assert!(!disposer.is_inline(101));
    }

    #[tokio::test]
    async fn test_small_output_is_inline() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FakeStore::default());
        let disposer = Disposer::new(1024, Some(store.clone()));

        let response = disposer.dispose(&artifact(dir.path(), 1024)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers[header::CONTENT_TYPE], "video/mp4");
        assert_eq!(headers[header::CONTENT_LENGTH], "1024");
        assert_eq!(headers[X_ORIENTATION], "portrait");
        assert_eq!(headers[X_MODE_USED], "encode");
        assert!(headers[header::CONTENT_DISPOSITION]
            .to_str()
            .unwrap()
            .starts_with("inline; filename=\"holiday.mp4\""));
        assert!(store.puts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_large_output_is_stored() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FakeStore::default());
        let disposer = Disposer::new(1024, Some(store.clone()));

        let response = disposer.dispose(&artifact(dir.path(), 1025)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
        assert!(response.headers().get(X_MODE_USED).is_none());

        let puts = store.puts.lock().unwrap();
        assert_eq!(puts.len(), 1);
        assert!(puts[0].starts_with("reframe/"));
        assert!(puts[0].ends_with("-holiday.mp4"));
    }

    #[tokio::test]
    async fn test_large_output_without_store_fails() {
        let dir = tempfile::tempdir().unwrap();
        let disposer = Disposer::new(10, None);

        let err = disposer.dispose(&artifact(dir.path(), 11)).await.unwrap_err();
        assert_eq!(err.code(), "storage_failed");
    }

    #[tokio::test]
    async fn test_upload_failure_is_storage_failed() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FakeStore {
            fail: true,
            ..Default::default()
        });
        let disposer = Disposer::new(10, Some(store));

        let err = disposer.dispose(&artifact(dir.path(), 11)).await.unwrap_err();
        assert_eq!(err.code(), "storage_failed");
        assert_eq!(err.status_code(), StatusCode::BAD_GATEWAY);
    }
}
