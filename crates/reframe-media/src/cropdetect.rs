//! Letterbox detection via the `cropdetect` filter.
//!
//! A bounded scan: a handful of short samples at fixed offsets and
//! thresholds, each with a frame ceiling and its own deadline.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::command::{EngineInput, FfmpegCommand, FfmpegRunner};
use crate::config::CropDetectConfig;
use crate::error::MediaError;

/// A crop rectangle reported by one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CropCandidate {
    pub width: u32,
    pub height: u32,
    pub x: u32,
    pub y: u32,
}

impl CropCandidate {
    pub const fn new(width: u32, height: u32, x: u32, y: u32) -> Self {
        Self {
            width,
            height,
            x,
            y,
        }
    }

    /// `crop=` filter expression for this rectangle.
    pub fn to_filter(&self) -> String {
        format!("crop={}:{}:{}:{}", self.width, self.height, self.x, self.y)
    }
}

/// Samples a staged file for letterbox bars.
#[derive(Debug, Clone, Default)]
pub struct CropDetector {
    config: CropDetectConfig,
}

impl CropDetector {
    pub fn new(config: CropDetectConfig) -> Self {
        Self { config }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Run every sample and collect the candidates, in sampling order.
    ///
    /// Failed or empty samples contribute nothing. Offsets at or past
    /// `duration` are skipped. Returns early only on cancellation.
    pub async fn detect(
        &self,
        input: &Path,
        duration: Option<f64>,
        runner: &FfmpegRunner,
    ) -> Result<Vec<CropCandidate>, MediaError> {
        if !self.config.enabled {
            return Ok(Vec::new());
        }

        let runner = runner.clone().with_timeout(self.config.sample_timeout);
        let mut candidates = Vec::new();

        for &offset in &self.config.offsets_secs {
            if duration.is_some_and(|d| offset >= d) {
                debug!(offset, duration, "Skipping crop sample past end of source");
                continue;
            }
            for &limit in &self.config.limits {
                let cmd = self.sample_command(input, offset, limit);
                match runner.run(&cmd, None).await {
                    Ok(output) => {
                        if let Some(candidate) = output
                            .stderr_lines
                            .iter()
                            .rev()
                            .find_map(|line| parse_crop_line(line))
                        {
                            debug!(offset, limit, ?candidate, "Crop sample");
                            candidates.push(candidate);
                        }
                    }
                    Err(MediaError::Cancelled) => return Err(MediaError::Cancelled),
                    Err(e) => warn!(offset, limit, error = %e, "Crop sample failed"),
                }
            }
        }

        Ok(candidates)
    }

    fn sample_command(&self, input: &Path, offset: f64, limit: u32) -> FfmpegCommand {
        FfmpegCommand::null_output(EngineInput::File(input.to_path_buf()))
            .log_level("info")
            .seek(offset)
            .frames(self.config.frames)
            .video_filter(format!("cropdetect=limit={}:round=2:reset=0", limit))
            .output_arg("-an")
    }
}

/// Extract the `crop=w:h:x:y` rectangle from a cropdetect log line.
pub fn parse_crop_line(line: &str) -> Option<CropCandidate> {
    static CROP: OnceLock<Regex> = OnceLock::new();
    let re = CROP.get_or_init(|| {
        Regex::new(r"crop=(\d+):(\d+):(\d+):(\d+)").expect("static regex")
    });

    let caps = re.captures_iter(line).last()?;
    let width = caps[1].parse().ok()?;
    let height = caps[2].parse().ok()?;
    if width == 0 || height == 0 {
        return None;
    }
    Some(CropCandidate::new(
        width,
        height,
        caps[3].parse().ok()?,
        caps[4].parse().ok()?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_crop_line() {
        let line = "[Parsed_cropdetect_0 @ 0x55d0] x1:0 x2:1919 y1:140 y2:939 w:1920 h:800 x:0 y:140 pts:1001 t:0.041708 limit:0.094118 crop=1920:800:0:140";
        assert_eq!(parse_crop_line(line), Some(CropCandidate::new(1920, 800, 0, 140)));
        assert_eq!(parse_crop_line("frame=   24 fps=0.0 q=-0.0"), None);
        assert_eq!(parse_crop_line("crop=0:0:0:0"), None);
    }

    #[test]
    fn test_sample_command_shape() {
        let detector = CropDetector::default();
        let args = detector
            .sample_command(Path::new("/tmp/in.mp4"), 3.0, 24)
            .build_args();
        let vf = args.iter().position(|a| a == "-vf").unwrap();
        assert_eq!(args[vf + 1], "cropdetect=limit=24:round=2:reset=0");
        assert!(args.contains(&"-frames:v".to_string()));
        assert!(!args.contains(&"-noautorotate".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("-"));
    }

    #[tokio::test]
    async fn test_disabled_detector_returns_nothing() {
        let detector = CropDetector::new(CropDetectConfig {
            enabled: false,
            ..Default::default()
        });
        let candidates = detector
            .detect(Path::new("/tmp/in.mp4"), Some(10.0), &FfmpegRunner::new())
            .await
            .unwrap();
        assert!(candidates.is_empty());
    }
}
