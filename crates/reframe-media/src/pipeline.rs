//! Request pipeline: acquire, probe, detect, plan, execute.
//!
//! One [`Pipeline`] is shared by every request; each run owns its work
//! directory and cancellation token, so requests share no mutable state.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use reframe_models::{sanitize_filename, ConvertParams, DEFAULT_FILENAME};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, Instrument};

use crate::acquire::{Acquirer, SourceDescriptor};
use crate::command::FfmpegRunner;
use crate::config::{InputPolicy, PipelineConfig};
use crate::cropdetect::{CropCandidate, CropDetector};
use crate::error::{MediaError, MediaResult};
use crate::executor::{
    ConversionJob, EncodeOptions, Executor, FfmpegEngine, InputSource, OutputArtifact,
    RemoteInput, StagedInput, TranscodeEngine,
};
use crate::metrics;
use crate::plan::{FilterPlan, FilterPlanner};
use crate::probe::{MediaProbe, ProbeInput, Prober};

const STAGED_INPUT_NAME: &str = "input";
const OUTPUT_NAME: &str = "output.mp4";

/// One conversion request.
#[derive(Debug, Clone)]
pub struct ConvertRequest {
    pub source: SourceDescriptor,
    pub params: ConvertParams,
}

/// A finished conversion. Owns the work directory: dropping it removes the
/// staged input and the output.
#[derive(Debug)]
pub struct Conversion {
    pub artifact: OutputArtifact,
    pub job: ConversionJob,
    pub probe: MediaProbe,
    pub plan: FilterPlan,
    workdir: TempDir,
}

impl Conversion {
    pub fn workdir(&self) -> &Path {
        self.workdir.path()
    }

    /// Load the output into memory.
    pub async fn read_bytes(&self) -> MediaResult<Bytes> {
        Ok(Bytes::from(tokio::fs::read(&self.artifact.path).await?))
    }
}

/// Shared, stateless pipeline.
#[derive(Clone)]
pub struct Pipeline {
    config: PipelineConfig,
    acquirer: Acquirer,
    prober: Prober,
    detector: CropDetector,
    planner: FilterPlanner,
    engine: Option<Arc<dyn TranscodeEngine>>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> MediaResult<Self> {
        let acquirer = Acquirer::new(config.acquire.clone())?;
        Ok(Self {
            prober: Prober::new(config.probe.clone()),
            detector: CropDetector::new(config.cropdetect.clone()),
            planner: FilterPlanner::new(config.planner.clone()),
            acquirer,
            config,
            engine: None,
        })
    }

    /// Use `engine` instead of spawning FFmpeg.
    pub fn with_engine(mut self, engine: Arc<dyn TranscodeEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Create a fresh per-request work directory.
    pub fn create_workdir(&self) -> MediaResult<TempDir> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("reframe-");
        let dir = match &self.config.work_dir {
            Some(parent) => {
                std::fs::create_dir_all(parent)?;
                builder.tempdir_in(parent)?
            }
            None => builder.tempdir()?,
        };
        Ok(dir)
    }

    /// Path an upload should be written to inside `workdir`.
    pub fn upload_path(workdir: &TempDir) -> PathBuf {
        workdir.path().join(STAGED_INPUT_NAME)
    }

    /// Run the whole pipeline inside `workdir`.
    ///
    /// The work directory moves into the returned [`Conversion`] on success
    /// and is dropped (deleted) on every error path.
    pub async fn run(
        &self,
        request: ConvertRequest,
        workdir: TempDir,
        cancel: CancellationToken,
    ) -> MediaResult<Conversion> {
        let span = info_span!(
            "convert",
            mode = %request.params.mode,
            fit = %request.params.fit,
            height = request.params.height,
            upload = request.source.is_upload()
        );

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(MediaError::Cancelled),
            result = self.run_inner(&request, &workdir, &cancel).instrument(span) => result,
        };

        match result {
            Ok((artifact, job, probe, plan)) => {
                metrics::record_conversion(artifact.mode_used.as_str());
                Ok(Conversion {
                    artifact,
                    job,
                    probe,
                    plan,
                    workdir,
                })
            }
            Err(e) => {
                metrics::record_conversion("failed");
                Err(e)
            }
        }
    }

    async fn run_inner(
        &self,
        request: &ConvertRequest,
        workdir: &TempDir,
        cancel: &CancellationToken,
    ) -> MediaResult<(OutputArtifact, ConversionJob, MediaProbe, FilterPlan)> {
        let runner = FfmpegRunner::new().with_cancel(cancel.clone());
        let descriptor = &request.source;

        let mut origin_filename: Option<String> = None;
        let source: Box<dyn InputSource> = match descriptor.kind() {
            crate::acquire::SourceKind::Upload(path) => Box::new(StagedInput::new(path)),
            crate::acquire::SourceKind::Url(_) => match self.config.input_policy {
                InputPolicy::Stage => {
                    let staged = StagedInput::stage(
                        &self.acquirer,
                        descriptor,
                        workdir.path().join(STAGED_INPUT_NAME),
                    )
                    .await?;
                    origin_filename = staged.origin_filename().map(str::to_string);
                    Box::new(staged)
                }
                InputPolicy::Stream => Box::new(RemoteInput::new(self.acquirer.clone(), descriptor.clone())),
            },
        };

        let probe = match source.staged_path() {
            Some(path) => {
                self.prober
                    .probe(ProbeInput::File(path.to_path_buf()), &runner)
                    .await
            }
            None => {
                let acquired = self.acquirer.acquire(descriptor).await?;
                origin_filename = acquired.filename;
                self.prober
                    .probe(ProbeInput::Stream(acquired.stream), &runner)
                    .await
            }
        };
        if cancel.is_cancelled() {
            return Err(MediaError::Cancelled);
        }

        let candidates: Vec<CropCandidate> = match source.staged_path() {
            Some(path) if self.detector.is_enabled() && !probe.degraded => {
                self.detector.detect(path, probe.duration, &runner).await?
            }
            _ => Vec::new(),
        };

        let plan = self.planner.plan(
            &probe,
            request.params.height,
            request.params.fit,
            &candidates,
        );

        let engine: Arc<dyn TranscodeEngine> = match &self.engine {
            Some(engine) => engine.clone(),
            None => Arc::new(FfmpegEngine::new(
                runner.clone().with_timeout_opt(self.config.engine_timeout),
            )),
        };
        let executor = Executor::new(engine, self.config.encode.clone());

        let options = EncodeOptions {
            mode: request.params.mode,
            preset: request.params.preset.clone(),
            maxrate: request.params.maxrate.clone(),
            bufsize: request.params.bufsize(),
        };
        let output = workdir.path().join(OUTPUT_NAME);
        let (tier, job) = executor
            .execute(source.as_ref(), &plan, &probe, &options, &output)
            .await?;

        let size = tokio::fs::metadata(&output).await?.len();
        let filename = descriptor
            .filename_hint()
            .or(origin_filename.as_deref())
            .map(sanitize_filename)
            .unwrap_or_else(|| DEFAULT_FILENAME.to_string());

        info!(
            tier = tier.as_str(),
            attempts = job.attempt_count(),
            size,
            orientation = %plan.orientation,
            width = plan.target_width,
            height = plan.target_height,
            "Conversion finished"
        );

        let artifact = OutputArtifact {
            path: output,
            size,
            content_type: "video/mp4",
            filename,
            orientation: plan.orientation,
            mode_used: tier.mode_used(),
        };
        Ok((artifact, job, probe, plan))
    }
}
