//! Pipeline configuration.
//!
//! Every threshold the pipeline relies on lives here and is handed to the
//! component that needs it, rather than being a module-level constant.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Browser-like user agent; some share hosts refuse bare clients.
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Who owns replaying the input between engine attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InputPolicy {
    /// Acquire once into the request's work directory; every consumer reads the file.
    #[default]
    Stage,
    /// Never touch disk for the input; every consumer re-invokes the acquirer.
    Stream,
}

impl FromStr for InputPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "stage" => Ok(InputPolicy::Stage),
            "stream" => Ok(InputPolicy::Stream),
            other => Err(format!("unknown input policy: {}", other)),
        }
    }
}

/// Acquirer settings.
#[derive(Debug, Clone)]
pub struct AcquireConfig {
    /// Maximum redirect hops before giving up
    pub max_redirects: usize,
    pub user_agent: String,
    pub connect_timeout: Duration,
    /// Deadline for receiving response headers
    pub header_timeout: Duration,
    /// Longest silence tolerated between body chunks
    pub fetch_timeout: Duration,
    /// How much of an interstitial HTML page is read when looking for a token
    pub max_interstitial_bytes: usize,
    /// Upper bound on staged input size
    pub max_input_bytes: u64,
}

impl Default for AcquireConfig {
    fn default() -> Self {
        Self {
            max_redirects: 10,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            connect_timeout: Duration::from_secs(15),
            header_timeout: Duration::from_secs(60),
            fetch_timeout: Duration::from_secs(60),
            max_interstitial_bytes: 2 * 1024 * 1024,
            max_input_bytes: 4 * 1024 * 1024 * 1024,
        }
    }
}

/// Prober settings.
#[derive(Debug, Clone)]
pub struct ProbeConfig {
    /// Geometry assumed when probing fails
    pub default_width: u32,
    pub default_height: u32,
    pub timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            default_width: 1920,
            default_height: 1080,
            timeout: Duration::from_secs(30),
        }
    }
}

/// Letterbox detection settings.
#[derive(Debug, Clone)]
pub struct CropDetectConfig {
    pub enabled: bool,
    /// Seek offsets sampled, in seconds
    pub offsets_secs: Vec<f64>,
    /// cropdetect `limit` values (black threshold, 0-255)
    pub limits: Vec<u32>,
    /// Frame ceiling per sample
    pub frames: u32,
    /// Deadline per sample
    pub sample_timeout: Duration,
}

impl Default for CropDetectConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            offsets_secs: vec![1.0, 3.0, 5.0],
            limits: vec![24, 48],
            frames: 24,
            sample_timeout: Duration::from_secs(20),
        }
    }
}

/// FilterPlanner settings.
#[derive(Debug, Clone)]
pub struct PlannerConfig {
    /// Ratio one side must exceed the other by to count as portrait/landscape
    pub orientation_band: f64,
    /// Crops smaller than this in either dimension are ignored
    pub min_crop_width: u32,
    pub min_crop_height: u32,
    /// Pad contain output to the exact target box
    pub pad_contain: bool,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            orientation_band: 1.06,
            min_crop_width: 200,
            min_crop_height: 200,
            pad_contain: false,
        }
    }
}

/// Fixed encoder settings for the re-encode tiers.
#[derive(Debug, Clone)]
pub struct EncodeSettings {
    pub video_codec: String,
    pub profile: String,
    pub level: String,
    pub pix_fmt: String,
    pub frame_rate: u32,
    pub keyframe_interval: u32,
    pub audio_codec: String,
    pub audio_bitrate: String,
    pub audio_channels: u32,
    pub audio_sample_rate: u32,
}

impl Default for EncodeSettings {
    fn default() -> Self {
        Self {
            video_codec: "libx264".to_string(),
            profile: "high".to_string(),
            level: "4.1".to_string(),
            pix_fmt: "yuv420p".to_string(),
            frame_rate: 30,
            keyframe_interval: 60,
            audio_codec: "aac".to_string(),
            audio_bitrate: "128k".to_string(),
            audio_channels: 2,
            audio_sample_rate: 48_000,
        }
    }
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub input_policy: InputPolicy,
    /// Parent directory for per-request work directories (system temp if unset)
    pub work_dir: Option<PathBuf>,
    /// Deadline for a single engine attempt
    pub engine_timeout: Option<Duration>,
    pub acquire: AcquireConfig,
    pub probe: ProbeConfig,
    pub cropdetect: CropDetectConfig,
    pub planner: PlannerConfig,
    pub encode: EncodeSettings,
}

impl PipelineConfig {
    /// Create config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        config.input_policy = env_parse("REFRAME_INPUT_POLICY", config.input_policy);
        config.work_dir = std::env::var("REFRAME_WORK_DIR").ok().map(PathBuf::from);
        config.engine_timeout = std::env::var("REFRAME_ENGINE_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .or(Some(Duration::from_secs(900)));

        config.acquire.max_redirects =
            env_parse("REFRAME_MAX_REDIRECTS", config.acquire.max_redirects);
        config.acquire.max_input_bytes =
            env_parse("REFRAME_MAX_INPUT_BYTES", config.acquire.max_input_bytes);
        if let Some(secs) = env_opt::<u64>("REFRAME_FETCH_TIMEOUT_SECS") {
            config.acquire.fetch_timeout = Duration::from_secs(secs);
        }
        if let Ok(ua) = std::env::var("REFRAME_USER_AGENT") {
            config.acquire.user_agent = ua;
        }

        config.cropdetect.enabled =
            env_parse("REFRAME_LETTERBOX_DETECTION", config.cropdetect.enabled);
        config.planner.pad_contain = env_parse("REFRAME_PAD_CONTAIN", config.planner.pad_contain);
        config.planner.orientation_band =
            env_parse("REFRAME_ORIENTATION_BAND", config.planner.orientation_band);

        config
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env_opt(key).unwrap_or(default)
}

fn env_opt<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.input_policy, InputPolicy::Stage);
        assert_eq!(config.acquire.max_redirects, 10);
        assert_eq!(config.acquire.fetch_timeout, Duration::from_secs(60));
        assert_eq!(config.planner.min_crop_width, 200);
        assert!((config.planner.orientation_band - 1.06).abs() < f64::EPSILON);
        assert_eq!(config.cropdetect.offsets_secs, vec![1.0, 3.0, 5.0]);
    }

    #[test]
    fn test_input_policy_parse() {
        assert_eq!("STREAM".parse::<InputPolicy>(), Ok(InputPolicy::Stream));
        assert!("tape".parse::<InputPolicy>().is_err());
    }
}
