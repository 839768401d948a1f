//! FFprobe geometry and orientation metadata.

use std::path::PathBuf;

use reframe_models::AspectRatio;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::acquire::ByteStream;
use crate::command::{check_ffprobe, FfmpegRunner};
use crate::config::ProbeConfig;
use crate::error::{MediaError, MediaResult};

/// Geometry of the first video stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaProbe {
    /// Coded width before rotation
    pub width: u32,
    /// Coded height before rotation
    pub height: u32,
    /// Clockwise display rotation, one of 0/90/180/270
    pub rotation: u16,
    pub sar: Option<AspectRatio>,
    pub dar: Option<AspectRatio>,
    /// Duration in seconds
    pub duration: Option<f64>,
    pub codec: Option<String>,
    /// Values are defaults because probing failed
    pub degraded: bool,
}

impl MediaProbe {
    /// Default geometry used when probing fails.
    pub fn fallback(config: &ProbeConfig) -> Self {
        Self {
            width: config.default_width,
            height: config.default_height,
            rotation: 0,
            sar: None,
            dar: None,
            duration: None,
            codec: None,
            degraded: true,
        }
    }

    /// Displayed width: the coded height when rotated a quarter turn.
    pub fn effective_width(&self) -> u32 {
        if self.is_quarter_turn() {
            self.height
        } else {
            self.width
        }
    }

    /// Displayed height: the coded width when rotated a quarter turn.
    pub fn effective_height(&self) -> u32 {
        if self.is_quarter_turn() {
            self.width
        } else {
            self.height
        }
    }

    pub fn is_quarter_turn(&self) -> bool {
        matches!(self.rotation, 90 | 270)
    }

    /// Absent SAR counts as square.
    pub fn has_square_pixels(&self) -> bool {
        self.sar.map(|sar| sar.is_square_pixels()).unwrap_or(true)
    }
}

/// What the prober reads.
pub enum ProbeInput {
    File(PathBuf),
    /// Fresh stream piped into ffprobe's stdin
    Stream(ByteStream),
}

/// Extracts [`MediaProbe`]s. Never fails: errors degrade to defaults.
#[derive(Debug, Clone, Default)]
pub struct Prober {
    config: ProbeConfig,
}

impl Prober {
    pub fn new(config: ProbeConfig) -> Self {
        Self { config }
    }

    pub async fn probe(&self, input: ProbeInput, runner: &FfmpegRunner) -> MediaProbe {
        let runner = runner.clone().with_timeout(self.config.timeout);
        match self.try_probe(input, &runner).await {
            Ok(probe) => {
                debug!(
                    width = probe.width,
                    height = probe.height,
                    rotation = probe.rotation,
                    codec = probe.codec.as_deref().unwrap_or("unknown"),
                    "Probed source"
                );
                probe
            }
            Err(MediaError::Cancelled) => MediaProbe::fallback(&self.config),
            Err(e) => {
                warn!(error = %e, "Probe failed, using default geometry");
                crate::metrics::record_probe_degraded();
                MediaProbe::fallback(&self.config)
            }
        }
    }

    async fn try_probe(&self, input: ProbeInput, runner: &FfmpegRunner) -> MediaResult<MediaProbe> {
        let program = check_ffprobe()?;

        let mut args: Vec<String> = [
            "-v",
            "error",
            "-print_format",
            "json",
            "-show_format",
            "-show_streams",
            "-select_streams",
            "v:0",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let stdin = match input {
            ProbeInput::File(path) => {
                if !path.exists() {
                    return Err(MediaError::FileNotFound(path));
                }
                args.push(path.to_string_lossy().to_string());
                None
            }
            ProbeInput::Stream(stream) => {
                args.push("pipe:0".to_string());
                Some(stream)
            }
        };

        let output = runner.run_raw(program, &args, stdin).await?;
        if !output.success {
            return Err(MediaError::FfprobeFailed {
                message: "FFprobe failed".to_string(),
                stderr: Some(output.stderr_tail(800)),
            });
        }

        parse_probe_output(&output.stdout)
    }
}

/// FFprobe JSON output format.
#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    format: Option<FfprobeFormat>,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    sample_aspect_ratio: Option<String>,
    display_aspect_ratio: Option<String>,
    duration: Option<String>,
    rotation: Option<serde_json::Value>,
    #[serde(default)]
    tags: FfprobeTags,
    #[serde(default)]
    side_data_list: Vec<FfprobeSideData>,
}

#[derive(Debug, Default, Deserialize)]
struct FfprobeTags {
    rotate: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct FfprobeSideData {
    rotation: Option<serde_json::Value>,
}

/// Parse ffprobe's JSON into a probe of the first video stream.
pub fn parse_probe_output(json: &[u8]) -> MediaResult<MediaProbe> {
    let probe: FfprobeOutput = serde_json::from_slice(json)?;

    let stream = probe
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref().unwrap_or("video") == "video")
        .ok_or_else(|| MediaError::InvalidVideo("No video stream found".to_string()))?;

    let width = stream.width.unwrap_or(0);
    let height = stream.height.unwrap_or(0);
    if width == 0 || height == 0 {
        return Err(MediaError::InvalidVideo(format!(
            "Zero dimensions {}x{}",
            width, height
        )));
    }

    let rotation = stream
        .rotation
        .as_ref()
        .and_then(json_number)
        .or_else(|| stream.tags.rotate.as_ref().and_then(json_number))
        .or_else(|| {
            // display matrix rotation is counter-clockwise
            stream
                .side_data_list
                .iter()
                .find_map(|sd| sd.rotation.as_ref().and_then(json_number))
                .map(|r| -r)
        })
        .map(normalize_rotation)
        .unwrap_or(0);

    let duration = probe
        .format
        .as_ref()
        .and_then(|f| f.duration.as_deref())
        .or(stream.duration.as_deref())
        .and_then(|d| d.parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0);

    Ok(MediaProbe {
        width,
        height,
        rotation,
        sar: stream.sample_aspect_ratio.as_deref().and_then(AspectRatio::parse),
        dar: stream.display_aspect_ratio.as_deref().and_then(AspectRatio::parse),
        duration,
        codec: stream.codec_name.clone(),
        degraded: false,
    })
}

/// Normalise any rotation in degrees to the nearest quarter turn in `[0, 360)`.
pub fn normalize_rotation(degrees: f64) -> u16 {
    let r = ((degrees % 360.0) + 360.0) % 360.0;
    let quarter = (r / 90.0).round() as u16 % 4;
    quarter * 90
}

fn json_number(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
