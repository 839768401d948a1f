//! Axum HTTP API server.
//!
//! This crate provides:
//! - `POST /api/convert` over multipart form data
//! - Inline or object-store disposition of converted outputs
//! - Rate limiting, request ids and CORS
//! - Prometheus metrics

pub mod config;
pub mod dispose;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod state;

pub use config::ApiConfig;
pub use dispose::{content_disposition, Disposer};
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
