//! Conversion request parameters.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::style::{ConvertMode, FitMode};

/// Default target height in pixels.
pub const DEFAULT_TARGET_HEIGHT: u32 = 1080;
/// Default x264 preset.
pub const DEFAULT_PRESET: &str = "veryfast";
/// Default bitrate ceiling token.
pub const DEFAULT_MAXRATE: &str = "6M";

/// Presets accepted by libx264.
pub const X264_PRESETS: &[&str] = &[
    "ultrafast",
    "superfast",
    "veryfast",
    "faster",
    "fast",
    "medium",
    "slow",
    "slower",
    "veryslow",
];

/// Validated conversion parameters, independent of where the source comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Validate)]
pub struct ConvertParams {
    pub mode: ConvertMode,
    pub fit: FitMode,
    /// Target output height in pixels
    #[validate(range(min = 144, max = 4320))]
    pub height: u32,
    #[validate(custom(function = "validate_preset"))]
    pub preset: String,
    /// Bitrate ceiling such as `6M` or `2500k`
    #[validate(custom(function = "validate_maxrate"))]
    pub maxrate: String,
}

impl Default for ConvertParams {
    fn default() -> Self {
        Self {
            mode: ConvertMode::default(),
            fit: FitMode::default(),
            height: DEFAULT_TARGET_HEIGHT,
            preset: DEFAULT_PRESET.to_string(),
            maxrate: DEFAULT_MAXRATE.to_string(),
        }
    }
}

impl ConvertParams {
    /// Maxrate expressed in bits per second.
    pub fn maxrate_bps(&self) -> Option<u64> {
        parse_bitrate(&self.maxrate)
    }

    /// `-bufsize` token: twice the ceiling.
    pub fn bufsize(&self) -> String {
        match self.maxrate_bps() {
            Some(bps) => format!("{}k", bps.saturating_mul(2) / 1000),
            None => self.maxrate.clone(),
        }
    }
}

fn validate_preset(preset: &str) -> Result<(), ValidationError> {
    if X264_PRESETS.contains(&preset) {
        Ok(())
    } else {
        Err(ValidationError::new("unknown_preset"))
    }
}

fn validate_maxrate(maxrate: &str) -> Result<(), ValidationError> {
    match parse_bitrate(maxrate) {
        Some(bps) if (100_000..=100_000_000).contains(&bps) => Ok(()),
        _ => Err(ValidationError::new("invalid_maxrate")),
    }
}

/// Parse an ffmpeg bitrate token (`6M`, `2500k`, `800000`).
pub fn parse_bitrate(token: &str) -> Option<u64> {
    let token = token.trim();
    if token.is_empty() {
        return None;
    }
    let (digits, multiplier) = match token.chars().last()? {
        'k' | 'K' => (&token[..token.len() - 1], 1_000),
        'm' | 'M' => (&token[..token.len() - 1], 1_000_000),
        _ => (token, 1),
    };
    if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse::<u64>().ok()?.checked_mul(multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(ConvertParams::default().validate().is_ok());
    }

    #[test]
    fn test_height_bounds() {
        let params = ConvertParams {
            height: 100,
            ..Default::default()
        };
        assert!(params.validate().is_err());

        let params = ConvertParams {
            height: 2160,
            ..Default::default()
        };
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_preset_and_maxrate() {
        let params = ConvertParams {
            preset: "placebo-ish".to_string(),
            ..Default::default()
        };
        assert!(params.validate().is_err());

        let params = ConvertParams {
            maxrate: "6Q".to_string(),
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_parse_bitrate() {
        assert_eq!(parse_bitrate("6M"), Some(6_000_000));
        assert_eq!(parse_bitrate("2500k"), Some(2_500_000));
        assert_eq!(parse_bitrate("800000"), Some(800_000));
        assert_eq!(parse_bitrate("k"), None);
        assert_eq!(parse_bitrate("-1M"), None);
    }

    #[test]
    fn test_bufsize_doubles() {
        let params = ConvertParams::default();
        assert_eq!(params.bufsize(), "12000k");
    }
}
