//! Tiered execution: fast stream copy, planned encode, conservative encode.
//!
//! The retry ladder is an explicit state machine. [`ExecState::next`] is a
//! pure transition; [`Executor::execute`] drives it against an engine.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use reframe_models::{ConvertMode, ModeUsed, Orientation};
use tracing::{debug, info, warn};

use crate::acquire::{stage_stream, Acquirer, ByteStream, SourceDescriptor};
use crate::command::{EngineInput, FfmpegCommand, FfmpegRunner};
use crate::config::EncodeSettings;
use crate::error::{MediaError, MediaResult};
use crate::metrics;
use crate::plan::FilterPlan;
use crate::probe::MediaProbe;

/// Engine tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Stream copy with metadata fixes only
    Fast,
    /// Full filter chain re-encode
    Planned,
    /// Contain-only re-encode
    Conservative,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Fast => "fast",
            Tier::Planned => "planned",
            Tier::Conservative => "conservative",
        }
    }

    pub fn mode_used(&self) -> ModeUsed {
        match self {
            Tier::Fast => ModeUsed::Copyfix,
            Tier::Planned => ModeUsed::Encode,
            Tier::Conservative => ModeUsed::Conservative,
        }
    }
}

/// Executor state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecState {
    AttemptFast,
    AttemptPlanned,
    AttemptConservative,
    Done(Tier),
    Failed,
}

impl ExecState {
    pub fn start(fast_path: bool) -> Self {
        if fast_path {
            ExecState::AttemptFast
        } else {
            ExecState::AttemptPlanned
        }
    }

    /// State after the current attempt succeeded or failed.
    pub fn next(self, succeeded: bool) -> Self {
        match (self, succeeded) {
            (ExecState::AttemptFast, true) => ExecState::Done(Tier::Fast),
            (ExecState::AttemptFast, false) => ExecState::AttemptPlanned,
            (ExecState::AttemptPlanned, true) => ExecState::Done(Tier::Planned),
            (ExecState::AttemptPlanned, false) => ExecState::AttemptConservative,
            (ExecState::AttemptConservative, true) => ExecState::Done(Tier::Conservative),
            (ExecState::AttemptConservative, false) => ExecState::Failed,
            (terminal, _) => terminal,
        }
    }

    /// Tier attempted in this state.
    pub fn tier(&self) -> Option<Tier> {
        match self {
            ExecState::AttemptFast => Some(Tier::Fast),
            ExecState::AttemptPlanned => Some(Tier::Planned),
            ExecState::AttemptConservative => Some(Tier::Conservative),
            ExecState::Done(_) | ExecState::Failed => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecState::Done(_) | ExecState::Failed)
    }
}

/// One engine attempt.
#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub tier: Tier,
    pub error: Option<String>,
}

/// Bookkeeping for one request's execution.
#[derive(Debug, Clone)]
pub struct ConversionJob {
    pub state: ExecState,
    pub attempts: Vec<AttemptRecord>,
}

impl ConversionJob {
    fn new(fast_path: bool) -> Self {
        Self {
            state: ExecState::start(fast_path),
            attempts: Vec::new(),
        }
    }

    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    pub fn tiers_attempted(&self) -> Vec<Tier> {
        self.attempts.iter().map(|a| a.tier).collect()
    }
}

/// Finished output file.
#[derive(Debug, Clone)]
pub struct OutputArtifact {
    pub path: PathBuf,
    pub size: u64,
    pub content_type: &'static str,
    pub filename: String,
    pub orientation: Orientation,
    pub mode_used: ModeUsed,
}

/// Input opened for one attempt.
pub struct OpenedInput {
    pub input: EngineInput,
    pub stdin: Option<ByteStream>,
}

/// Something the executor can (re)open before every attempt.
#[async_trait]
pub trait InputSource: Send + Sync {
    async fn open(&self) -> MediaResult<OpenedInput>;

    /// A seekable file path, when the input is staged.
    fn staged_path(&self) -> Option<&Path> {
        None
    }
}

/// Input staged on disk; every attempt reads the same file.
#[derive(Debug, Clone)]
pub struct StagedInput {
    path: PathBuf,
    origin_filename: Option<String>,
}

impl StagedInput {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            origin_filename: None,
        }
    }

    /// Acquire `descriptor` and write it to `path`.
    pub async fn stage(
        acquirer: &Acquirer,
        descriptor: &SourceDescriptor,
        path: impl Into<PathBuf>,
    ) -> MediaResult<Self> {
        let path = path.into();
        let acquired = acquirer.acquire(descriptor).await?;
        let bytes = stage_stream(acquired.stream, &path, acquirer.config().max_input_bytes).await?;
        info!(path = %path.display(), bytes, "Input staged");
        Ok(Self {
            path,
            origin_filename: acquired.filename,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Filename reported by the origin (Content-Disposition or URL path).
    pub fn origin_filename(&self) -> Option<&str> {
        self.origin_filename.as_deref()
    }
}

#[async_trait]
impl InputSource for StagedInput {
    async fn open(&self) -> MediaResult<OpenedInput> {
        if !tokio::fs::try_exists(&self.path).await.unwrap_or(false) {
            return Err(MediaError::FileNotFound(self.path.clone()));
        }
        Ok(OpenedInput {
            input: EngineInput::File(self.path.clone()),
            stdin: None,
        })
    }

    fn staged_path(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

/// Single-use remote stream; every attempt re-invokes the acquirer.
#[derive(Clone)]
pub struct RemoteInput {
    acquirer: Acquirer,
    descriptor: SourceDescriptor,
}

impl RemoteInput {
    pub fn new(acquirer: Acquirer, descriptor: SourceDescriptor) -> Self {
        Self {
            acquirer,
            descriptor,
        }
    }
}

#[async_trait]
impl InputSource for RemoteInput {
    async fn open(&self) -> MediaResult<OpenedInput> {
        debug!("Re-acquiring source for engine attempt");
        let acquired = self.acquirer.acquire(&self.descriptor).await?;
        Ok(OpenedInput {
            input: EngineInput::Pipe,
            stdin: Some(acquired.stream),
        })
    }
}

/// External transcoding engine.
#[async_trait]
pub trait TranscodeEngine: Send + Sync {
    /// Run one command to completion; non-zero exit is an error.
    async fn run(
        &self,
        cmd: &FfmpegCommand,
        stdin: Option<ByteStream>,
        duration_hint: Option<f64>,
    ) -> MediaResult<()>;
}

/// The FFmpeg CLI.
#[derive(Debug, Clone, Default)]
pub struct FfmpegEngine {
    runner: FfmpegRunner,
}

impl FfmpegEngine {
    pub fn new(runner: FfmpegRunner) -> Self {
        Self { runner }
    }
}

#[async_trait]
impl TranscodeEngine for FfmpegEngine {
    async fn run(
        &self,
        cmd: &FfmpegCommand,
        stdin: Option<ByteStream>,
        duration_hint: Option<f64>,
    ) -> MediaResult<()> {
        self.runner
            .run_with_progress(cmd, stdin, move |progress| {
                debug!(
                    frame = progress.frame,
                    speed = progress.speed,
                    percent = progress.percentage(duration_hint),
                    "Engine progress"
                );
            })
            .await
            .map(|_| ())
    }
}

/// Request-level encoder options.
#[derive(Debug, Clone)]
pub struct EncodeOptions {
    pub mode: ConvertMode,
    pub preset: String,
    pub maxrate: String,
    pub bufsize: String,
}

/// Whether the stream-copy tier may run at all.
///
/// A stream copy cannot rotate, crop or rescale, so it is skipped for any
/// cover fit and for rotated sources. `smart` additionally requires the
/// source to already match the plan.
pub fn fast_path_allowed(mode: ConvertMode, plan: &FilterPlan, probe: &MediaProbe) -> bool {
    if !mode.permits_fast_path() || plan.requires_exact_geometry() || probe.rotation != 0 {
        return false;
    }
    match mode {
        ConvertMode::Smart => {
            plan.crop().is_none()
                && probe.has_square_pixels()
                && probe.effective_width() == plan.target_width
                && probe.effective_height() == plan.target_height
        }
        _ => true,
    }
}

/// Drives the tier ladder.
#[derive(Clone)]
pub struct Executor {
    engine: Arc<dyn TranscodeEngine>,
    encode: EncodeSettings,
}

impl Executor {
    pub fn new(engine: Arc<dyn TranscodeEngine>, encode: EncodeSettings) -> Self {
        Self { engine, encode }
    }

    /// Run the ladder until a tier produces a non-empty output at `output`.
    ///
    /// Returns the finished tier together with the job record. When every
    /// tier fails, the error carries the last attempt's stderr.
    pub async fn execute(
        &self,
        source: &dyn InputSource,
        plan: &FilterPlan,
        probe: &MediaProbe,
        options: &EncodeOptions,
        output: &Path,
    ) -> MediaResult<(Tier, ConversionJob)> {
        let fast = fast_path_allowed(options.mode, plan, probe);
        let mut job = ConversionJob::new(fast);
        let mut last_error: Option<MediaError> = None;

        if !fast {
            debug!(mode = %options.mode, fit = %plan.fit, rotation = probe.rotation, "Skipping fast path");
        }

        while let Some(tier) = job.state.tier() {
            remove_partial(output).await?;

            let start = Instant::now();
            let result = self.attempt(tier, source, plan, probe, options, output).await;
            let succeeded = result.is_ok();
            metrics::record_engine_attempt(tier.as_str(), start.elapsed().as_secs_f64(), succeeded);

            match result {
                Ok(()) => {
                    info!(tier = tier.as_str(), "Engine attempt succeeded");
                    job.attempts.push(AttemptRecord { tier, error: None });
                }
                Err(e) if !e.is_engine_retryable() => {
                    warn!(tier = tier.as_str(), error = %e, "Engine attempt aborted");
                    job.attempts.push(AttemptRecord {
                        tier,
                        error: Some(e.to_string()),
                    });
                    remove_partial(output).await?;
                    return Err(e);
                }
                Err(e) => {
                    warn!(tier = tier.as_str(), error = %e, "Engine attempt failed");
                    job.attempts.push(AttemptRecord {
                        tier,
                        error: Some(e.to_string()),
                    });
                    last_error = Some(e);
                }
            }

            job.state = job.state.next(succeeded);
        }

        match job.state {
            ExecState::Done(tier) => Ok((tier, job)),
            _ => {
                remove_partial(output).await?;
                let stderr = last_error.as_ref().and_then(|e| e.stderr()).map(str::to_string);
                Err(MediaError::EngineExhausted {
                    attempts: job.attempt_count(),
                    message: last_error
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "no attempt ran".to_string()),
                    stderr,
                })
            }
        }
    }

    async fn attempt(
        &self,
        tier: Tier,
        source: &dyn InputSource,
        plan: &FilterPlan,
        probe: &MediaProbe,
        options: &EncodeOptions,
        output: &Path,
    ) -> MediaResult<()> {
        let opened = source.open().await?;
        let cmd = match tier {
            Tier::Fast => self.fast_command(opened.input, probe, output),
            Tier::Planned => self.encode_command(opened.input, plan, options, output),
            Tier::Conservative => self.encode_command(opened.input, &plan.conservative(), options, output),
        };

        self.engine.run(&cmd, opened.stdin, probe.duration).await?;

        let size = tokio::fs::metadata(output).await.map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            return Err(MediaError::EmptyOutput);
        }
        Ok(())
    }

    /// Remux with metadata fixes: clear rotation, square pixels, faststart.
    pub fn fast_command(&self, input: EngineInput, probe: &MediaProbe, output: &Path) -> FfmpegCommand {
        let mut cmd = FfmpegCommand::new(input, output)
            .output_args(["-map", "0:v:0", "-map", "0:a:?", "-c", "copy"])
            .output_args(["-metadata:s:v:0", "rotate=0"]);

        if let Some(bsf) = sar_bitstream_filter(probe.codec.as_deref()) {
            cmd = cmd.output_args(["-bsf:v", bsf]);
        }

        cmd.faststart().output_args(["-f", "mp4"])
    }

    /// Full re-encode with `plan`'s chain and the fixed encoder settings.
    pub fn encode_command(
        &self,
        input: EngineInput,
        plan: &FilterPlan,
        options: &EncodeOptions,
        output: &Path,
    ) -> FfmpegCommand {
        let e = &self.encode;
        let mut cmd = FfmpegCommand::new(input, output);
        if plan.has_rotation() {
            cmd = cmd.no_autorotate();
        }

        cmd = cmd
            .output_args(["-map", "0:v:0", "-map", "0:a:?"])
            .video_filter(plan.filter_chain())
            .video_codec(e.video_codec.clone())
            .preset(options.preset.clone())
            .output_args(["-profile:v", e.profile.as_str(), "-level", e.level.as_str()])
            .output_args(["-pix_fmt", e.pix_fmt.as_str()])
            .output_args(["-maxrate", options.maxrate.as_str(), "-bufsize", options.bufsize.as_str()])
            .output_args(["-r".to_string(), e.frame_rate.to_string()])
            .output_args(["-g".to_string(), e.keyframe_interval.to_string()])
            .audio_codec(e.audio_codec.clone())
            .audio_bitrate(e.audio_bitrate.clone())
            .output_args(["-ac".to_string(), e.audio_channels.to_string()])
            .output_args(["-ar".to_string(), e.audio_sample_rate.to_string()]);

        if plan.has_rotation() {
            cmd = cmd.output_args(["-metadata:s:v:0", "rotate=0"]);
        }

        cmd.faststart().output_args(["-f", "mp4"])
    }
}

/// Bitstream filter that stamps SAR 1:1 without re-encoding.
fn sar_bitstream_filter(codec: Option<&str>) -> Option<&'static str> {
    match codec? {
        "h264" => Some("h264_metadata=sample_aspect_ratio=1/1"),
        "hevc" | "h265" => Some("hevc_metadata=sample_aspect_ratio=1/1"),
        _ => None,
    }
}

async fn remove_partial(path: &Path) -> MediaResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "Removed partial output");
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::FilterPlanner;
    use bytes::Bytes;
    use futures_util::StreamExt;
    use reframe_models::FitMode;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// What the fake engine does on one call.
    #[derive(Debug, Clone, Copy)]
    enum Step {
        Write(usize),
        WriteEmpty,
        Exit(i32),
        Cancel,
    }

    struct FakeEngine {
        script: Mutex<Vec<Step>>,
        calls: Mutex<Vec<Vec<String>>>,
        stdin_payloads: Mutex<Vec<Vec<u8>>>,
    }

    impl FakeEngine {
        fn new(script: &[Step]) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.iter().rev().copied().collect()),
                calls: Mutex::new(Vec::new()),
                stdin_payloads: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<Vec<String>> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl TranscodeEngine for FakeEngine {
        async fn run(
            &self,
            cmd: &FfmpegCommand,
            stdin: Option<ByteStream>,
            _duration_hint: Option<f64>,
        ) -> MediaResult<()> {
            let args = cmd.build_args();
            let output = PathBuf::from(args.last().unwrap());
            assert!(!output.exists(), "previous partial output was not removed");
            self.calls.lock().unwrap().push(args);

            if let Some(mut stream) = stdin {
                let mut payload = Vec::new();
                while let Some(chunk) = stream.next().await {
                    payload.extend_from_slice(&chunk.unwrap());
                }
                self.stdin_payloads.lock().unwrap().push(payload);
            }

            let step = self.script.lock().unwrap().pop().unwrap_or(Step::Exit(1));
            match step {
                Step::Write(n) => {
                    tokio::fs::write(&output, vec![0u8; n]).await?;
                    Ok(())
                }
                Step::WriteEmpty => {
                    tokio::fs::write(&output, b"").await?;
                    Ok(())
                }
                Step::Exit(code) => {
                    tokio::fs::write(&output, b"partial").await?;
                    Err(MediaError::ffmpeg_failed(
                        "FFmpeg exited with non-zero status",
                        Some(format!("Error while filtering (code {})", code)),
                        Some(code),
                    ))
                }
                Step::Cancel => Err(MediaError::Cancelled),
            }
        }
    }

    /// Single-use stream source that counts how often it was opened.
    struct CountingSource {
        opens: AtomicUsize,
    }

    #[async_trait]
    impl InputSource for CountingSource {
        async fn open(&self) -> MediaResult<OpenedInput> {
            let n = self.opens.fetch_add(1, Ordering::SeqCst);
            let chunks: Vec<Result<Bytes, crate::error::FetchError>> =
                vec![Ok(Bytes::from(format!("stream-{}", n)))];
            Ok(OpenedInput {
                input: EngineInput::Pipe,
                stdin: Some(Box::pin(futures_util::stream::iter(chunks))),
            })
        }
    }

    fn probe(width: u32, height: u32, rotation: u16) -> MediaProbe {
        MediaProbe {
            width,
            height,
            rotation,
            sar: None,
            dar: None,
            duration: Some(10.0),
            codec: Some("h264".into()),
            degraded: false,
        }
    }

    fn options(mode: ConvertMode) -> EncodeOptions {
        EncodeOptions {
            mode,
            preset: "veryfast".into(),
            maxrate: "6M".into(),
            bufsize: "12000k".into(),
        }
    }

    fn is_copy(args: &[String]) -> bool {
        args.windows(2).any(|w| w[0] == "-c" && w[1] == "copy")
    }

    #[test]
    fn test_transitions() {
        use ExecState::*;
        assert_eq!(ExecState::start(true), AttemptFast);
        assert_eq!(ExecState::start(false), AttemptPlanned);
        assert_eq!(AttemptFast.next(true), Done(Tier::Fast));
        assert_eq!(AttemptFast.next(false), AttemptPlanned);
        assert_eq!(AttemptPlanned.next(true), Done(Tier::Planned));
        assert_eq!(AttemptPlanned.next(false), AttemptConservative);
        assert_eq!(AttemptConservative.next(true), Done(Tier::Conservative));
        assert_eq!(AttemptConservative.next(false), Failed);
        assert_eq!(Failed.next(true), Failed);
        assert_eq!(Done(Tier::Fast).next(false), Done(Tier::Fast));
        assert!(Failed.is_terminal());
        assert_eq!(AttemptConservative.tier(), Some(Tier::Conservative));
    }

    #[test]
    fn test_fast_path_eligibility() {
        let planner = FilterPlanner::default();
        let landscape = probe(1920, 1080, 0);

        let cover = planner.plan(&landscape, 1080, FitMode::CoverAuto, &[]);
        assert!(!fast_path_allowed(ConvertMode::Copyfix, &cover, &landscape));

        let contain = planner.plan(&landscape, 1080, FitMode::Contain, &[]);
        assert!(fast_path_allowed(ConvertMode::Copyfix, &contain, &landscape));
        assert!(fast_path_allowed(ConvertMode::Smart, &contain, &landscape));
        assert!(!fast_path_allowed(ConvertMode::Encode, &contain, &landscape));

        // smart: source does not already match the target
        let smaller = planner.plan(&landscape, 720, FitMode::Contain, &[]);
        assert!(!fast_path_allowed(ConvertMode::Smart, &smaller, &landscape));
        assert!(fast_path_allowed(ConvertMode::Copyfix, &smaller, &landscape));

        // rotation cannot be applied by a stream copy
        let rotated = probe(1080, 1920, 90);
        let plan = planner.plan(&rotated, 1080, FitMode::Contain, &[]);
        assert!(!fast_path_allowed(ConvertMode::Copyfix, &plan, &rotated));

        let anamorphic = MediaProbe {
            sar: Some(reframe_models::AspectRatio::new(4, 3)),
            ..landscape.clone()
        };
        assert!(!fast_path_allowed(ConvertMode::Smart, &contain, &anamorphic));
    }

    #[tokio::test]
    async fn test_fast_failure_reacquires_for_planned() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp4");
        let engine = FakeEngine::new(&[Step::Exit(1), Step::Write(1024)]);
        let executor = Executor::new(engine.clone(), EncodeSettings::default());
        let source = CountingSource {
            opens: AtomicUsize::new(0),
        };
        let src = probe(1920, 1080, 0);
        let plan = FilterPlanner::default().plan(&src, 1080, FitMode::Contain, &[]);

        let (tier, job) = executor
            .execute(&source, &plan, &src, &options(ConvertMode::Copyfix), &output)
            .await
            .unwrap();

        assert_eq!(tier, Tier::Planned);
        assert_eq!(job.tiers_attempted(), vec![Tier::Fast, Tier::Planned]);
        assert_eq!(source.opens.load(Ordering::SeqCst), 2);
        assert_eq!(
            *engine.stdin_payloads.lock().unwrap(),
            vec![b"stream-0".to_vec(), b"stream-1".to_vec()]
        );

        let calls = engine.calls();
        assert!(is_copy(&calls[0]));
        assert!(!is_copy(&calls[1]));
        assert_eq!(tokio::fs::metadata(&output).await.unwrap().len(), 1024);
    }

    #[tokio::test]
    async fn test_empty_fast_output_counts_as_failure() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp4");
        let engine = FakeEngine::new(&[Step::WriteEmpty, Step::Write(10)]);
        let executor = Executor::new(engine.clone(), EncodeSettings::default());
        let src = probe(1920, 1080, 0);
        let plan = FilterPlanner::default().plan(&src, 1080, FitMode::Contain, &[]);
        let staged_path = dir.path().join("in.mp4");
        tokio::fs::write(&staged_path, b"source").await.unwrap();
        let source = StagedInput::new(&staged_path);

        let (tier, job) = executor
            .execute(&source, &plan, &src, &options(ConvertMode::Copyfix), &output)
            .await
            .unwrap();
        assert_eq!(tier, Tier::Planned);
        assert_eq!(job.attempt_count(), 2);
        assert!(job.attempts[0].error.is_some());
    }

    #[tokio::test]
    async fn test_cover_skips_fast_and_falls_back_to_conservative() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp4");
        let engine = FakeEngine::new(&[Step::Exit(1), Step::Write(10)]);
        let executor = Executor::new(engine.clone(), EncodeSettings::default());
        let src = probe(1920, 1080, 90);
        let plan = FilterPlanner::default().plan(&src, 1080, FitMode::CoverAuto, &[]);
        let staged_path = dir.path().join("in.mp4");
        tokio::fs::write(&staged_path, b"source").await.unwrap();

        let (tier, job) = executor
            .execute(&StagedInput::new(&staged_path), &plan, &src, &options(ConvertMode::Copyfix), &output)
            .await
            .unwrap();
        assert_eq!(tier, Tier::Conservative);
        assert_eq!(tier.mode_used(), ModeUsed::Conservative);
        assert_eq!(job.tiers_attempted(), vec![Tier::Planned, Tier::Conservative]);

        let calls = engine.calls();
        assert!(calls[0].contains(&"-noautorotate".to_string()));
        assert!(!calls[1].contains(&"-noautorotate".to_string()));
        let vf = calls[1].iter().position(|a| a == "-vf").unwrap();
        assert!(!calls[1][vf + 1].contains("crop="));
    }

    #[tokio::test]
    async fn test_all_tiers_failing_is_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp4");
        let engine = FakeEngine::new(&[Step::Exit(1), Step::Exit(1), Step::Exit(234)]);
        let executor = Executor::new(engine.clone(), EncodeSettings::default());
        let src = probe(1920, 1080, 0);
        let plan = FilterPlanner::default().plan(&src, 1080, FitMode::Contain, &[]);
        let source = CountingSource {
            opens: AtomicUsize::new(0),
        };

        let err = executor
            .execute(&source, &plan, &src, &options(ConvertMode::Copyfix), &output)
            .await
            .unwrap_err();

        match err {
            MediaError::EngineExhausted { attempts, stderr, .. } => {
                assert_eq!(attempts, 3);
                assert!(stderr.unwrap().contains("code 234"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn test_cancellation_stops_the_ladder() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.mp4");
        let engine = FakeEngine::new(&[Step::Cancel, Step::Write(10)]);
        let executor = Executor::new(engine.clone(), EncodeSettings::default());
        let src = probe(1920, 1080, 0);
        let plan = FilterPlanner::default().plan(&src, 1080, FitMode::Contain, &[]);
        let source = CountingSource {
            opens: AtomicUsize::new(0),
        };

        let err = executor
            .execute(&source, &plan, &src, &options(ConvertMode::Copyfix), &output)
            .await
            .unwrap_err();
        assert!(matches!(err, MediaError::Cancelled));
        assert_eq!(engine.calls().len(), 1);
    }

    #[test]
    fn test_fast_command_args() {
        let executor = Executor::new(FakeEngine::new(&[]), EncodeSettings::default());
        let args = executor
            .fast_command(EngineInput::File("in.mov".into()), &probe(1920, 1080, 0), Path::new("out.mp4"))
            .build_args();
        let joined = args.join(" ");
        assert!(joined.contains("-map 0:v:0 -map 0:a:? -c copy"));
        assert!(joined.contains("-metadata:s:v:0 rotate=0"));
        assert!(joined.contains("-bsf:v h264_metadata=sample_aspect_ratio=1/1"));
        assert!(joined.ends_with("-movflags +faststart -f mp4 out.mp4"));

        let vp9 = MediaProbe {
            codec: Some("vp9".into()),
            ..probe(1920, 1080, 0)
        };
        let args = executor
            .fast_command(EngineInput::File("in.webm".into()), &vp9, Path::new("out.mp4"))
            .build_args();
        assert!(!args.contains(&"-bsf:v".to_string()));
    }

    #[test]
    fn test_encode_command_args() {
        let executor = Executor::new(FakeEngine::new(&[]), EncodeSettings::default());
        let src = probe(1080, 1920, 0);
        let plan = FilterPlanner::default().plan(&src, 1080, FitMode::CoverAuto, &[]);
        let joined = executor
            .encode_command(EngineInput::Pipe, &plan, &options(ConvertMode::Encode), Path::new("out.mp4"))
            .build_args()
            .join(" ");

        assert!(joined.contains("-i pipe:0"));
        assert!(joined.contains("-c:v libx264 -preset veryfast -profile:v high -level 4.1 -pix_fmt yuv420p"));
        assert!(joined.contains("-maxrate 6M -bufsize 12000k -r 30 -g 60"));
        assert!(joined.contains("-c:a aac -b:a 128k -ac 2 -ar 48000"));
        assert!(!joined.contains("-noautorotate"));
    }
}
