//! Engine progress records (`-progress pipe:2`).

use serde::Serialize;

/// Snapshot emitted at every `progress=` record.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FfmpegProgress {
    pub frame: u64,
    pub fps: f64,
    /// Output timestamp in milliseconds
    pub out_time_ms: i64,
    /// Output timestamp as `HH:MM:SS.micro`
    pub out_time: String,
    /// Multiple of realtime
    pub speed: f64,
    pub is_complete: bool,
}

impl FfmpegProgress {
    /// Completion against the probed source duration, if one is known.
    pub fn percentage(&self, duration_secs: Option<f64>) -> Option<f64> {
        let total_ms = duration_secs.filter(|d| *d > 0.0)? * 1000.0;
        Some((self.out_time_ms as f64 / total_ms * 100.0).clamp(0.0, 100.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_percentage() {
        let progress = FfmpegProgress {
            out_time_ms: 5000,
            ..Default::default()
        };

        assert!((progress.percentage(Some(10.0)).unwrap() - 50.0).abs() < 0.01);
        assert!((progress.percentage(Some(2.0)).unwrap() - 100.0).abs() < 0.01);
        assert_eq!(progress.percentage(None), None);
        assert_eq!(progress.percentage(Some(0.0)), None);
    }
}
