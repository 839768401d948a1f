//! Application state.

use std::sync::Arc;

use reframe_media::{Pipeline, PipelineConfig};
use reframe_storage::{ObjectStore, R2Client};
use tracing::{info, warn};

use crate::config::ApiConfig;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub pipeline: Arc<Pipeline>,
    /// Destination for oversized outputs; `None` when R2 is not configured
    pub store: Option<Arc<dyn ObjectStore>>,
}

impl AppState {
    /// Create new application state.
    pub async fn new(config: ApiConfig) -> anyhow::Result<Self> {
        let pipeline = Pipeline::new(PipelineConfig::from_env())?;

        let store: Option<Arc<dyn ObjectStore>> = match R2Client::from_env().await {
            Ok(client) => {
                info!("Object store configured");
                Some(Arc::new(client))
            }
            Err(e) => {
                warn!("Object store unavailable, large outputs will fail: {}", e);
                None
            }
        };

        Ok(Self::from_parts(config, pipeline, store))
    }

    /// Assemble state from already-built components.
    pub fn from_parts(
        config: ApiConfig,
        pipeline: Pipeline,
        store: Option<Arc<dyn ObjectStore>>,
    ) -> Self {
        Self {
            config,
            pipeline: Arc::new(pipeline),
            store,
        }
    }
}
