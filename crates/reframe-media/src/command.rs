//! FFmpeg command builder and subprocess runner.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use futures_util::TryStreamExt;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::acquire::ByteStream;
use crate::error::{FetchError, MediaError, MediaResult};
use crate::progress::FfmpegProgress;

/// Number of trailing stderr lines kept from a run.
const STDERR_TAIL_LINES: usize = 200;

/// Where the engine reads its input from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineInput {
    /// Seekable file on disk
    File(PathBuf),
    /// Bytes piped into stdin
    Pipe,
}

impl EngineInput {
    fn as_arg(&self) -> String {
        match self {
            EngineInput::File(path) => path.to_string_lossy().to_string(),
            EngineInput::Pipe => "pipe:0".to_string(),
        }
    }
}

/// Builder for FFmpeg commands.
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    input: EngineInput,
    /// Output path, or `-` for the null muxer
    output: String,
    /// Input arguments (before -i)
    input_args: Vec<String>,
    /// Output arguments (after -i)
    output_args: Vec<String>,
    overwrite: bool,
    log_level: String,
    progress: bool,
}

impl FfmpegCommand {
    /// Create a new FFmpeg command writing to `output`.
    pub fn new(input: EngineInput, output: impl AsRef<Path>) -> Self {
        Self {
            input,
            output: output.as_ref().to_string_lossy().to_string(),
            input_args: Vec::new(),
            output_args: Vec::new(),
            overwrite: true,
            log_level: "error".to_string(),
            progress: true,
        }
    }

    /// Create a command that decodes but discards its output (`-f null -`).
    pub fn null_output(input: EngineInput) -> Self {
        let mut cmd = Self::new(input, "-");
        cmd.progress = false;
        cmd
    }

    pub fn input_arg(mut self, arg: impl Into<String>) -> Self {
        self.input_args.push(arg.into());
        self
    }

    pub fn input_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn output_arg(mut self, arg: impl Into<String>) -> Self {
        self.output_args.push(arg.into());
        self
    }

    pub fn output_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Input-side seek.
    pub fn seek(self, seconds: f64) -> Self {
        self.input_arg("-ss").input_arg(format!("{:.3}", seconds))
    }

    /// Disable the demuxer's automatic rotation; the filter chain rotates.
    pub fn no_autorotate(self) -> Self {
        self.input_arg("-noautorotate")
    }

    pub fn video_filter(self, filter: impl Into<String>) -> Self {
        self.output_arg("-vf").output_arg(filter)
    }

    pub fn video_codec(self, codec: impl Into<String>) -> Self {
        self.output_arg("-c:v").output_arg(codec)
    }

    pub fn audio_codec(self, codec: impl Into<String>) -> Self {
        self.output_arg("-c:a").output_arg(codec)
    }

    pub fn preset(self, preset: impl Into<String>) -> Self {
        self.output_arg("-preset").output_arg(preset)
    }

    pub fn audio_bitrate(self, bitrate: impl Into<String>) -> Self {
        self.output_arg("-b:a").output_arg(bitrate)
    }

    /// Limit the number of decoded video frames.
    pub fn frames(self, count: u32) -> Self {
        self.output_arg("-frames:v").output_arg(count.to_string())
    }

    /// Relocate the moov atom for progressive playback.
    pub fn faststart(self) -> Self {
        self.output_arg("-movflags").output_arg("+faststart")
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Build the command arguments.
    pub fn build_args(&self) -> Vec<String> {
        let mut args = Vec::new();

        if self.overwrite {
            args.push("-y".to_string());
        }
        args.push("-hide_banner".to_string());
        // stdin carries media when piping, otherwise it must stay closed
        if self.input != EngineInput::Pipe {
            args.push("-nostdin".to_string());
        }

        args.push("-v".to_string());
        args.push(self.log_level.clone());

        if self.progress {
            args.push("-progress".to_string());
            args.push("pipe:2".to_string());
        }

        args.extend(self.input_args.clone());

        args.push("-i".to_string());
        args.push(self.input.as_arg());

        args.extend(self.output_args.clone());

        if self.output == "-" {
            args.push("-f".to_string());
            args.push("null".to_string());
        }
        args.push(self.output.clone());

        args
    }
}

/// Captured result of a finished subprocess.
#[derive(Debug, Default)]
pub struct ProcessOutput {
    pub exit_code: Option<i32>,
    pub success: bool,
    pub stdout: Vec<u8>,
    /// Trailing stderr lines, progress records excluded
    pub stderr_lines: Vec<String>,
}

impl ProcessOutput {
    /// Last `max_chars` characters of stderr.
    pub fn stderr_tail(&self, max_chars: usize) -> String {
        tail_chars(&self.stderr_lines.join("\n"), max_chars)
    }
}

/// Runs engine subprocesses with stdin piping, cancellation and a deadline.
#[derive(Debug, Clone, Default)]
pub struct FfmpegRunner {
    cancel: Option<CancellationToken>,
    timeout: Option<Duration>,
}

impl FfmpegRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill the subprocess when `token` is cancelled.
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    /// Bound the run by a deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_timeout_opt(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run an FFmpeg command; non-zero exit is an error.
    pub async fn run(&self, cmd: &FfmpegCommand, stdin: Option<ByteStream>) -> MediaResult<ProcessOutput> {
        self.run_with_progress(cmd, stdin, |_| {}).await
    }

    /// Run an FFmpeg command, reporting `-progress` records to `progress_callback`.
    pub async fn run_with_progress<F>(
        &self,
        cmd: &FfmpegCommand,
        stdin: Option<ByteStream>,
        progress_callback: F,
    ) -> MediaResult<ProcessOutput>
    where
        F: Fn(FfmpegProgress) + Send + 'static,
    {
        let program = check_ffmpeg()?;
        let args = cmd.build_args();
        debug!("Running FFmpeg: ffmpeg {}", args.join(" "));

        let output = self
            .spawn_and_wait(program, &args, stdin, progress_callback)
            .await?;

        if output.success {
            Ok(output)
        } else {
            let tail = output.stderr_tail(800);
            Err(MediaError::ffmpeg_failed(
                "FFmpeg exited with non-zero status",
                Some(tail),
                output.exit_code,
            ))
        }
    }

    /// Run an arbitrary engine binary and return its output regardless of
    /// exit status.
    pub async fn run_raw(
        &self,
        program: PathBuf,
        args: &[String],
        stdin: Option<ByteStream>,
    ) -> MediaResult<ProcessOutput> {
        self.spawn_and_wait(program, args, stdin, |_| {}).await
    }

    async fn spawn_and_wait<F>(
        &self,
        program: PathBuf,
        args: &[String],
        stdin: Option<ByteStream>,
        progress_callback: F,
    ) -> MediaResult<ProcessOutput>
    where
        F: Fn(FfmpegProgress) + Send + 'static,
    {
        let mut child = Command::new(&program)
            .args(args)
            .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let feeder = match (stdin, child.stdin.take()) {
            (Some(stream), Some(mut sink)) => Some(tokio::spawn(async move {
                let mut reader = StreamReader::new(stream.map_err(std::io::Error::other));
                let bytes = tokio::io::copy(&mut reader, &mut sink).await?;
                debug!(bytes, "Input stream fed to engine");
                Ok::<u64, std::io::Error>(bytes)
            })),
            _ => None,
        };

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MediaError::internal("stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| MediaError::internal("stderr not captured"))?;

        let stdout_handle = tokio::spawn(async move {
            let mut buf = Vec::new();
            let mut stdout = stdout;
            let _ = stdout.read_to_end(&mut buf).await;
            buf
        });

        let stderr_handle = tokio::spawn(async move {
            let mut reader = BufReader::new(stderr).lines();
            let mut current = FfmpegProgress::default();
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);

            while let Ok(Some(line)) = reader.next_line().await {
                if is_progress_line(&line) {
                    if let Some(progress) = parse_progress_line(&line, &mut current) {
                        progress_callback(progress);
                    }
                    continue;
                }
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Vec::from(tail)
        });

        let cancel = self.cancel.clone().unwrap_or_default();
        let deadline = async {
            match self.timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => std::future::pending().await,
            }
        };

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = cancel.cancelled() => Outcome::Cancelled,
            _ = deadline => Outcome::TimedOut,
        };

        let status = match outcome {
            Outcome::Exited(status) => status?,
            Outcome::Cancelled => {
                info!("Engine cancelled, killing process");
                let _ = child.kill().await;
                abort(feeder);
                return Err(MediaError::Cancelled);
            }
            Outcome::TimedOut => {
                let secs = self.timeout.map(|t| t.as_secs()).unwrap_or_default();
                warn!("Engine timed out after {} seconds, killing process", secs);
                let _ = child.kill().await;
                abort(feeder);
                return Err(MediaError::Timeout(secs));
            }
        };

        if let Some(handle) = feeder {
            finish_feeder(handle).await?;
        }
        let stdout = stdout_handle.await.unwrap_or_default();
        let stderr_lines = stderr_handle.await.unwrap_or_default();

        Ok(ProcessOutput {
            exit_code: status.code(),
            success: status.success(),
            stdout,
            stderr_lines,
        })
    }
}

enum Outcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    Cancelled,
    TimedOut,
}

type Feeder = tokio::task::JoinHandle<std::io::Result<u64>>;

/// How long a finished engine waits for its stdin feeder to settle.
const FEEDER_GRACE: Duration = Duration::from_secs(5);

fn abort(feeder: Option<Feeder>) {
    if let Some(handle) = feeder {
        handle.abort();
    }
}

/// Surface a source failure that happened while piping stdin.
///
/// A mid-stream error closes stdin, which the engine sees as a normal EOF
/// and may answer with a truncated but successful output.
async fn finish_feeder(handle: Feeder) -> MediaResult<()> {
    let abort_handle = handle.abort_handle();
    let result = match tokio::time::timeout(FEEDER_GRACE, handle).await {
        Ok(Ok(result)) => result,
        Ok(Err(join_error)) => {
            return Err(MediaError::internal(format!("stdin feeder panicked: {}", join_error)))
        }
        Err(_) => {
            // engine exited without draining its input
            abort_handle.abort();
            return Ok(());
        }
    };

    match result {
        Ok(_) => Ok(()),
        // engine stopped reading (e.g. probe only needed the header)
        Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => Ok(()),
        Err(e) => {
            warn!(error = %e, "Input stream failed while feeding engine");
            Err(MediaError::Fetch(feeder_error(e)))
        }
    }
}

/// Recover the source's [`FetchError`] from the reader's wrapped error.
fn feeder_error(e: std::io::Error) -> FetchError {
    if e.get_ref().is_some_and(|inner| inner.is::<FetchError>()) {
        if let Some(inner) = e.into_inner() {
            if let Ok(fetch) = inner.downcast::<FetchError>() {
                return *fetch;
            }
        }
        return FetchError::Request("input stream failed".to_string());
    }
    FetchError::Io(e)
}

const PROGRESS_KEYS: &[&str] = &[
    "frame",
    "fps",
    "stream_0_0_q",
    "bitrate",
    "total_size",
    "out_time_us",
    "out_time_ms",
    "out_time",
    "dup_frames",
    "drop_frames",
    "speed",
    "progress",
];

fn is_progress_line(line: &str) -> bool {
    line.trim()
        .split_once('=')
        .map(|(key, _)| PROGRESS_KEYS.contains(&key) || key.starts_with("stream_"))
        .unwrap_or(false)
}

/// Parse a progress line from FFmpeg's -progress output.
fn parse_progress_line(line: &str, current: &mut FfmpegProgress) -> Option<FfmpegProgress> {
    let line = line.trim();

    if let Some((key, value)) = line.split_once('=') {
        match key {
            "out_time_ms" | "out_time_us" => {
                // both keys carry microseconds in current FFmpeg builds
                if let Ok(us) = value.parse::<i64>() {
                    current.out_time_ms = us / 1000;
                }
            }
            "out_time" => {
                current.out_time = value.to_string();
            }
            "frame" => {
                if let Ok(frame) = value.parse() {
                    current.frame = frame;
                }
            }
            "fps" => {
                if let Ok(fps) = value.parse() {
                    current.fps = fps;
                }
            }
            "speed" => {
                if let Some(speed) = value.strip_suffix('x').and_then(|s| s.trim().parse().ok()) {
                    current.speed = speed;
                }
            }
            "progress" => {
                if value == "end" {
                    current.is_complete = true;
                }
                return Some(current.clone());
            }
            _ => {}
        }
    }

    None
}

/// Last `max_chars` characters of `s`, on a char boundary.
pub fn tail_chars(s: &str, max_chars: usize) -> String {
    let count = s.chars().count();
    if count <= max_chars {
        return s.to_string();
    }
    s.chars().skip(count - max_chars).collect()
}

/// Check if FFmpeg is available.
pub fn check_ffmpeg() -> MediaResult<PathBuf> {
    which::which("ffmpeg").map_err(|_| MediaError::FfmpegNotFound)
}

/// Check if FFprobe is available.
pub fn check_ffprobe() -> MediaResult<PathBuf> {
    which::which("ffprobe").map_err(|_| MediaError::FfprobeNotFound)
}
