//! Shared data models for the reframe conversion service.
//!
//! This crate provides Serde-serializable types for:
//! - Conversion modes, fit modes and orientation
//! - Validated request parameters
//! - Success and failure response bodies
//! - Filename sanitizing

pub mod request;
pub mod response;
pub mod style;
pub mod utils;

// Re-export common types
pub use request::{parse_bitrate, ConvertParams, DEFAULT_MAXRATE, DEFAULT_PRESET, DEFAULT_TARGET_HEIGHT};
pub use response::{ErrorResponse, ModeUsed, StoredResponse};
pub use style::{AspectRatio, ConvertMode, FitMode, Orientation, ParseModeError};
pub use utils::{clean_field, sanitize_filename, DEFAULT_FILENAME};
