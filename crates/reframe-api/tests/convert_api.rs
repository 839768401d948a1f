//! Router-level tests for the conversion API.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use reframe_api::{create_router, ApiConfig, AppState};
use reframe_media::{
    ByteStream, FfmpegCommand, MediaError, MediaResult, Pipeline, PipelineConfig, TranscodeEngine,
};
use serde_json::Value;
use tower::ServiceExt;

const BOUNDARY: &str = "reframe-test-boundary";

/// Writes `size` bytes to the command's output, failing the first `failures` runs.
struct FakeEngine {
    size: usize,
    failures: usize,
    calls: AtomicUsize,
}

#[async_trait]
impl TranscodeEngine for FakeEngine {
    async fn run(
        &self,
        cmd: &FfmpegCommand,
        _stdin: Option<ByteStream>,
        _duration_hint: Option<f64>,
    ) -> MediaResult<()> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        let output = PathBuf::from(cmd.build_args().last().unwrap());
        if n < self.failures {
            return Err(MediaError::ffmpeg_failed(
                "exit 1",
                Some("Error reinitializing filters!".to_string()),
                Some(1),
            ));
        }
        tokio::fs::write(&output, vec![7u8; self.size]).await?;
        Ok(())
    }
}

fn app_with(config: ApiConfig, engine: FakeEngine, work_dir: Option<PathBuf>) -> Router {
    let mut pipeline_config = PipelineConfig::default();
    pipeline_config.cropdetect.enabled = false;
    pipeline_config.work_dir = work_dir;
    let pipeline = Pipeline::new(pipeline_config)
        .unwrap()
        .with_engine(Arc::new(engine));
    create_router(AppState::from_parts(config, pipeline, None), None)
}

fn app() -> Router {
    app_with(
        ApiConfig::default(),
        FakeEngine {
            size: 1024,
            failures: 0,
            calls: AtomicUsize::new(0),
        },
        None,
    )
}

enum Part<'a> {
    Text(&'a str, &'a str),
    File(&'a str, &'a [u8]),
}

fn multipart_request(parts: &[Part<'_>]) -> Request<Body> {
    let mut body = Vec::new();
    for part in parts {
        body.extend_from_slice(format!("--{}\r\n", BOUNDARY).as_bytes());
        match part {
            Part::Text(name, value) => {
                body.extend_from_slice(
                    format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes(),
                );
                body.extend_from_slice(value.as_bytes());
            }
            Part::File(filename, data) => {
                body.extend_from_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\n\
                         Content-Type: video/quicktime\r\n\r\n",
                        filename
                    )
                    .as_bytes(),
                );
                body.extend_from_slice(data);
            }
        }
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", BOUNDARY).as_bytes());

    Request::builder()
        .method(Method::POST)
        .uri("/api/convert")
        .header(
            header::CONTENT_TYPE,
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(body))
        .unwrap()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let response = app()
        .oneshot(Request::get("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let json = json_body(response).await;
    assert_eq!(json["status"], "healthy");
}

#[tokio::test]
async fn test_request_id_is_echoed() {
    let response = app()
        .oneshot(
            Request::get("/health")
                .header("x-request-id", "abc-123")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.headers()["x-request-id"], "abc-123");
}

#[tokio::test]
async fn test_missing_input_is_400() {
    let response = app()
        .oneshot(multipart_request(&[Part::Text("mode", "encode")]))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = json_body(response).await;
    assert_eq!(json["ok"], false);
    assert_eq!(json["error"], "missing_input");
}

#[tokio::test]
async fn test_url_and_file_is_400() {
    let response = app()
        .oneshot(multipart_request(&[
            Part::Text("url", "https://example.com/v.mp4"),
            Part::File("clip.mov", b"movie bytes"),
        ]))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"], "ambiguous_input");
}

#[tokio::test]
async fn test_invalid_height_is_400() {
    let response = app()
        .oneshot(multipart_request(&[
            Part::Text("url", "https://example.com/v.mp4"),
            Part::Text("h", "100"),
        ]))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"], "invalid_parameter");
}

#[tokio::test]
async fn test_non_multipart_body_is_400() {
    let response = app()
        .oneshot(
            Request::post("/api/convert")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from("{}"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"], "bad_request_body");
}

#[tokio::test]
async fn test_upload_returns_inline_video() {
    let work = tempfile::tempdir().unwrap();
    let app = app_with(
        ApiConfig::default(),
        FakeEngine {
            size: 4096,
            failures: 0,
            calls: AtomicUsize::new(0),
        },
        Some(work.path().to_path_buf()),
    );

    let response = app
        .oneshot(multipart_request(&[
            Part::File("Beach Day.mov", b"pretend this is a movie"),
            Part::Text("mode", "encode"),
        ]))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers().clone();
    assert_eq!(headers[header::CONTENT_TYPE], "video/mp4");
    assert_eq!(headers[header::CONTENT_LENGTH], "4096");
    assert_eq!(headers["x-mode-used"], "encode");
    // probe falls back to 1920x1080 for bytes it cannot read
    assert_eq!(headers["x-orientation"], "landscape");
    assert!(headers[header::CONTENT_DISPOSITION]
        .to_str()
        .unwrap()
        .contains("filename=\"Beach_Day.mp4\""));

    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(bytes.len(), 4096);

    // Nothing staged for the request is left behind
    assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_engine_failure_after_all_tiers_is_502() {
    let work = tempfile::tempdir().unwrap();
    let app = app_with(
        ApiConfig::default(),
        FakeEngine {
            size: 0,
            failures: usize::MAX,
            calls: AtomicUsize::new(0),
        },
        Some(work.path().to_path_buf()),
    );

    let response = app
        .oneshot(multipart_request(&[
            Part::File("clip.mov", b"pretend this is a movie"),
            Part::Text("mode", "copyfix"),
        ]))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    let json = json_body(response).await;
    assert_eq!(json["error"], "convert_failed");
    assert!(json["detail"]
        .as_str()
        .unwrap()
        .contains("Error reinitializing filters!"));
    assert_eq!(std::fs::read_dir(work.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn test_large_output_without_store_is_502() {
    let config = ApiConfig {
        inline_limit_bytes: 1000,
        ..Default::default()
    };
    let app = app_with(
        config,
        FakeEngine {
            size: 1001,
            failures: 0,
            calls: AtomicUsize::new(0),
        },
        None,
    );

    let response = app
        .oneshot(multipart_request(&[Part::File("clip.mov", b"movie")]))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(json_body(response).await["error"], "storage_failed");
}

#[tokio::test]
async fn test_cors_preflight() {
    let response = app()
        .oneshot(
            Request::builder()
                .method(Method::OPTIONS)
                .uri("/api/convert")
                .header(header::ORIGIN, "https://app.example.com")
                .header(header::ACCESS_CONTROL_REQUEST_METHOD, "POST")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
}
