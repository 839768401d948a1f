//! Conversion mode, fit mode and orientation definitions.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// How the engine is allowed to produce the output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConvertMode {
    /// Try a stream-copy remux first, re-encode on failure
    #[default]
    Copyfix,
    /// Always re-encode
    Encode,
    /// Remux only when the source already matches the target geometry
    Smart,
}

impl ConvertMode {
    pub const ALL: &'static [ConvertMode] =
        &[ConvertMode::Copyfix, ConvertMode::Encode, ConvertMode::Smart];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConvertMode::Copyfix => "copyfix",
            ConvertMode::Encode => "encode",
            ConvertMode::Smart => "smart",
        }
    }

    /// Whether this mode ever allows the stream-copy path.
    pub fn permits_fast_path(&self) -> bool {
        matches!(self, ConvertMode::Copyfix | ConvertMode::Smart)
    }
}

impl fmt::Display for ConvertMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for ConvertMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "copyfix" => Ok(ConvertMode::Copyfix),
            "encode" => Ok(ConvertMode::Encode),
            "smart" => Ok(ConvertMode::Smart),
            _ => Err(ParseModeError::Mode(s.to_string())),
        }
    }
}

/// How the source frame is fitted into the target frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
pub enum FitMode {
    /// Cover 9:16 for portrait, 16:9 for landscape, contain otherwise
    #[default]
    #[serde(rename = "cover-auto")]
    CoverAuto,
    #[serde(rename = "cover-16x9")]
    Cover16x9,
    #[serde(rename = "cover-9x16")]
    Cover9x16,
    #[serde(rename = "contain")]
    Contain,
}

impl FitMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FitMode::CoverAuto => "cover-auto",
            FitMode::Cover16x9 => "cover-16x9",
            FitMode::Cover9x16 => "cover-9x16",
            FitMode::Contain => "contain",
        }
    }

    /// Resolve `cover-auto` against a detected orientation.
    pub fn resolve(self, orientation: Orientation) -> FitMode {
        match (self, orientation) {
            (FitMode::CoverAuto, Orientation::Portrait) => FitMode::Cover9x16,
            (FitMode::CoverAuto, Orientation::Landscape) => FitMode::Cover16x9,
            (FitMode::CoverAuto, Orientation::Square) => FitMode::Contain,
            (other, _) => other,
        }
    }

    /// Cover fits must hit the exact target rectangle.
    pub fn is_cover(&self) -> bool {
        matches!(
            self,
            FitMode::CoverAuto | FitMode::Cover16x9 | FitMode::Cover9x16
        )
    }
}

impl fmt::Display for FitMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for FitMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cover-auto" => Ok(FitMode::CoverAuto),
            "cover-16x9" => Ok(FitMode::Cover16x9),
            "cover-9x16" => Ok(FitMode::Cover9x16),
            "contain" => Ok(FitMode::Contain),
            _ => Err(ParseModeError::Fit(s.to_string())),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ParseModeError {
    #[error("Unknown mode: {0}")]
    Mode(String),
    #[error("Unknown fit: {0}")]
    Fit(String),
}

/// Orientation classification of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    Portrait,
    Landscape,
    /// Neither side exceeds the other by the hysteresis band
    Square,
}

impl Orientation {
    /// Classify with a hysteresis band: one side must exceed the other by
    /// at least `band` (e.g. 1.06) to count as portrait or landscape.
    pub fn classify(width: u32, height: u32, band: f64) -> Self {
        if width == 0 || height == 0 {
            return Orientation::Square;
        }
        let (w, h) = (width as f64, height as f64);
        if h / w >= band {
            Orientation::Portrait
        } else if w / h >= band {
            Orientation::Landscape
        } else {
            Orientation::Square
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Orientation::Portrait => "portrait",
            Orientation::Landscape => "landscape",
            Orientation::Square => "square",
        }
    }
}

impl fmt::Display for Orientation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Aspect ratio specification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub struct AspectRatio {
    pub width: u32,
    pub height: u32,
}

impl AspectRatio {
    /// Vertical short-form video (9:16)
    pub const PORTRAIT: AspectRatio = AspectRatio {
        width: 9,
        height: 16,
    };

    /// Widescreen (16:9)
    pub const LANDSCAPE: AspectRatio = AspectRatio {
        width: 16,
        height: 9,
    };

    /// Create a new aspect ratio.
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Reduce by the greatest common divisor (`1920:1080` becomes `16:9`).
    pub fn reduced(width: u32, height: u32) -> Self {
        let g = gcd(width, height).max(1);
        Self::new(width / g, height / g)
    }

    /// Parse ffprobe-style `N:D` (or `N/D`). Zero terms mean "unknown".
    pub fn parse(s: &str) -> Option<Self> {
        let (n, d) = s.split_once(':').or_else(|| s.split_once('/'))?;
        let n: u32 = n.trim().parse().ok()?;
        let d: u32 = d.trim().parse().ok()?;
        if n == 0 || d == 0 {
            return None;
        }
        Some(Self::new(n, d))
    }

    pub fn is_square_pixels(&self) -> bool {
        self.width == self.height
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.width, self.height)
    }
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}
