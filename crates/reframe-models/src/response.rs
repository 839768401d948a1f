//! JSON bodies returned by the conversion endpoint.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::style::Orientation;

/// Which engine path produced the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ModeUsed {
    /// Stream copy with metadata fixes only
    Copyfix,
    /// Full re-encode with the planned filter chain
    Encode,
    /// Re-encode with the contain-only fallback chain
    Conservative,
}

impl ModeUsed {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModeUsed::Copyfix => "copyfix",
            ModeUsed::Encode => "encode",
            ModeUsed::Conservative => "conservative",
        }
    }
}

impl std::fmt::Display for ModeUsed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Body returned when the output was routed to object storage.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct StoredResponse {
    pub ok: bool,
    pub size: u64,
    pub blob_url: String,
    pub orientation: Orientation,
    pub mode_used: ModeUsed,
}

impl StoredResponse {
    pub fn new(size: u64, blob_url: String, orientation: Orientation, mode_used: ModeUsed) -> Self {
        Self {
            ok: true,
            size,
            blob_url,
            orientation,
            mode_used,
        }
    }
}

/// Body returned for every failure.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ErrorResponse {
    pub ok: bool,
    pub error: String,
    pub detail: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            error: error.into(),
            detail: detail.into(),
        }
    }
}
