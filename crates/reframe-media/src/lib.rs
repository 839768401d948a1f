//! Video reframing pipeline around the FFmpeg CLI.
//!
//! This crate provides:
//! - Source acquisition with manual redirects and share-link confirmation
//! - FFprobe geometry/rotation probing that degrades instead of failing
//! - Letterbox detection with `cropdetect`
//! - Filter planning (rotate, crop, cover/contain scale, force aspect)
//! - A three-tier executor (stream copy, planned encode, conservative encode)
//! - Per-request orchestration with cancellation and scoped temp files

pub mod acquire;
pub mod command;
pub mod config;
pub mod cropdetect;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod pipeline;
pub mod plan;
pub mod probe;
pub mod progress;

pub use acquire::{stage_stream, with_idle_timeout, Acquired, Acquirer, ByteStream, SourceDescriptor, SourceKind};
pub use command::{
    check_ffmpeg, check_ffprobe, tail_chars, EngineInput, FfmpegCommand, FfmpegRunner,
};
pub use config::{
    AcquireConfig, CropDetectConfig, EncodeSettings, InputPolicy, PipelineConfig, PlannerConfig,
    ProbeConfig,
};
pub use cropdetect::{CropCandidate, CropDetector};
pub use error::{FetchError, MediaError, MediaResult};
pub use executor::{
    fast_path_allowed, ConversionJob, EncodeOptions, ExecState, Executor, FfmpegEngine,
    InputSource, OutputArtifact, RemoteInput, StagedInput, Tier, TranscodeEngine,
};
pub use pipeline::{Conversion, ConvertRequest, Pipeline};
pub use plan::{FilterOp, FilterPlan, FilterPlanner};
pub use probe::{MediaProbe, ProbeInput, Prober};
pub use progress::FfmpegProgress;
