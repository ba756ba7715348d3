use std::{
    fmt, io,
    path::{Path, PathBuf},
    process::{ExitStatus, Stdio},
    sync::Arc,
};

use chrono::Local;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    process::{Child, Command},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::{
    buffer::LineBuffer,
    capture::Capture,
    exit_code::{exit_code_from_error, terminating_signal, ChildError, ExitOutcome},
    indicator::Indicator,
    logparse::{FieldSelection, LogFormat, LogProcessorOptions},
    platform::{configure_process_group, SignalRelay},
    quote::escape_args,
    timestamp::{render_layout, validate_layout, TimestampFormat},
    writer::{AnnotatedWriter, PrefixFn},
    CaptureError, ConfigError, RunError,
};

/// Name used in the banner line and in capture file names.
pub const TOOL_NAME: &str = "cg";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Default strftime layout for the line prefix.
pub const DEFAULT_FORMAT: &str = "%H:%M:%S ";

const BUFFERED_NOTICE: &str = "buffered mode, output deferred";
/// Final line when the supervisor, not the child, failed.
const FAILED: &str = "Finished with exitcode 1";

type ChildStream = Box<dyn AsyncRead + Unpin + Send>;

/// Validated settings for one supervised run. Build with [`RunConfig::builder`].
#[derive(Debug, Clone)]
pub struct RunConfig {
    command: Vec<String>,
    format: String,
    buffered: bool,
    capture: bool,
    capture_dir: Option<PathBuf>,
    log_parse: Option<(LogFormat, LogProcessorOptions)>,
}

impl RunConfig {
    pub fn builder() -> RunConfigBuilder {
        RunConfigBuilder::default()
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    pub fn is_buffered(&self) -> bool {
        self.buffered
    }

    pub fn is_capture(&self) -> bool {
        self.capture
    }

    /// Directory capture files are created in; the system temporary directory by default.
    pub fn capture_dir(&self) -> PathBuf {
        self.capture_dir.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn log_format(&self) -> Option<LogFormat> {
        self.log_parse.as_ref().map(|(format, _)| *format)
    }

    pub fn log_options(&self) -> Option<&LogProcessorOptions> {
        self.log_parse.as_ref().map(|(_, options)| options)
    }
}

/// Builder for [`RunConfig`].
///
/// The `log_*` settings are only meaningful together with [`RunConfigBuilder::log_parse`];
/// setting one without it makes [`RunConfigBuilder::build`] fail.
#[derive(Debug, Clone, Default)]
pub struct RunConfigBuilder {
    command: Vec<String>,
    format: Option<String>,
    buffered: bool,
    capture: bool,
    capture_dir: Option<PathBuf>,
    log_format: Option<LogFormat>,
    message_key: Option<String>,
    timestamp_key: Option<String>,
    timestamp_format: Option<TimestampFormat>,
    fields: Option<FieldSelection>,
}

impl RunConfigBuilder {
    /// Program and arguments to run; the first element is the program.
    pub fn command<I, S>(mut self, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command = command.into_iter().map(Into::into).collect();
        self
    }

    /// strftime layout for the line prefix. Defaults to [`DEFAULT_FORMAT`].
    pub fn format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    pub fn buffered(mut self, enable: bool) -> Self {
        self.buffered = enable;
        self
    }

    pub fn capture(mut self, enable: bool) -> Self {
        self.capture = enable;
        self
    }

    /// Overrides the directory capture files are written to.
    pub fn capture_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.capture_dir = Some(dir.into());
        self
    }

    pub fn log_parse(mut self, format: LogFormat) -> Self {
        self.log_format = Some(format);
        self
    }

    pub fn log_message_key(mut self, key: impl Into<String>) -> Self {
        self.message_key = Some(key.into());
        self
    }

    /// Key holding the record's timestamp. An empty key disables timestamp extraction.
    pub fn log_timestamp_key(mut self, key: impl Into<String>) -> Self {
        self.timestamp_key = Some(key.into());
        self
    }

    pub fn log_timestamp_format(mut self, format: TimestampFormat) -> Self {
        self.timestamp_format = Some(format);
        self
    }

    pub fn log_fields(mut self, fields: FieldSelection) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn build(self) -> Result<RunConfig, ConfigError> {
        if self.command.is_empty() {
            return Err(ConfigError::EmptyCommand);
        }
        if self.log_format.is_none() {
            if let Some(flag) = self.stray_log_flag() {
                return Err(ConfigError::RequiresLogParse(flag));
            }
        }
        let format = self.format.unwrap_or_else(|| DEFAULT_FORMAT.to_string());
        validate_layout(&format)?;

        let log_parse = match self.log_format {
            Some(log_format) => {
                let defaults = LogProcessorOptions::default();
                let timestamp_key = match self.timestamp_key {
                    Some(key) if key.is_empty() => None,
                    Some(key) => Some(key),
                    None => defaults.timestamp_key,
                };
                let options = LogProcessorOptions {
                    message_key: self.message_key.unwrap_or(defaults.message_key),
                    timestamp_key,
                    timestamp_format: self.timestamp_format,
                    fields: self.fields.unwrap_or(defaults.fields),
                    layout: format.clone(),
                };
                Some((log_format, options))
            }
            None => None,
        };

        Ok(RunConfig {
            command: self.command,
            format,
            buffered: self.buffered,
            capture: self.capture,
            capture_dir: self.capture_dir,
            log_parse,
        })
    }

    fn stray_log_flag(&self) -> Option<&'static str> {
        if self.message_key.is_some() {
            Some("log-message-key")
        } else if self.timestamp_key.is_some() {
            Some("log-timestamp-key")
        } else if self.timestamp_format.is_some() {
            Some("log-timestamp-format")
        } else if self.fields.is_some() {
            Some("log-fields")
        } else {
            None
        }
    }
}

/// Runs one child command and annotates its output onto `W`.
///
/// The runner prints lifecycle lines around the child's output, relays SIGINT/SIGTERM to the
/// child's process group while it runs, and reports the child's exit code. A child that fails
/// is an [`ExitOutcome::Failure`], not an error; [`RunError`] is reserved for the supervisor's
/// own failures.
pub struct Runner<W> {
    config: RunConfig,
    prefix: PrefixFn,
    writer: Arc<AnnotatedWriter<W>>,
}

impl<W> fmt::Debug for Runner<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runner")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<W> Runner<W>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Creates a runner whose prefix is the current local time rendered with the configured
    /// layout.
    pub fn new(config: RunConfig, out: W) -> Self {
        let layout = config.format.clone();
        let prefix: PrefixFn = Arc::new(move || render_layout(&Local::now(), &layout));
        Self::with_prefix(config, out, prefix)
    }

    /// Creates a runner with a caller-supplied prefix, e.g. a fixed string for reproducible
    /// output.
    pub fn with_prefix(config: RunConfig, out: W, prefix: PrefixFn) -> Self {
        let mut writer = AnnotatedWriter::new(out, Arc::clone(&prefix));
        if let Some((format, options)) = &config.log_parse {
            writer.set_processor(format.processor(options.clone()));
        }
        Self {
            config,
            prefix,
            writer: Arc::new(writer),
        }
    }

    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Returns the output sink, or `None` while a run still holds it.
    pub fn into_output(self) -> Option<W> {
        Arc::try_unwrap(self.writer)
            .ok()
            .map(AnnotatedWriter::into_inner)
    }

    /// Runs the command to completion.
    ///
    /// Every run ends with exactly one `Finished …` lifecycle line. When the supervisor itself
    /// fails after the child was spawned, the child is killed and reaped first.
    pub async fn run(&self) -> Result<ExitOutcome, RunError> {
        let mut lifecycle = Lifecycle::new(&self.writer, self.config.capture);
        let result = self.supervise(&mut lifecycle).await;

        match (result, lifecycle.close().await) {
            (Ok(outcome), Ok(())) => Ok(outcome),
            (Ok(_), Err(err)) => Err(err.into()),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(close)) => {
                warn!(%close, "closing capture files failed");
                Err(err)
            }
        }
    }

    async fn supervise(&self, lifecycle: &mut Lifecycle<'_, W>) -> Result<ExitOutcome, RunError> {
        if let Err(err) = self.announce(lifecycle).await {
            lifecycle.finish(FAILED).await;
            return Err(err);
        }

        let argv = &self.config.command;
        let mut command = Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        configure_process_group(&mut command);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(source) => {
                let err = ChildError::Spawn {
                    program: argv[0].clone(),
                    source,
                };
                let code = exit_code_from_error(Some(&err));
                debug!(%err, code, "spawn failed");
                lifecycle.finish(&format!("Finished with exitcode {code}")).await;
                return Ok(ExitOutcome::from_code(code));
            }
        };

        let completed = match self.drive(&mut child, lifecycle).await {
            Ok(completed) => completed,
            Err(err) => {
                warn!(%err, "supervision failed, stopping child");
                reap(&mut child).await;
                lifecycle.finish(FAILED).await;
                return Err(err);
            }
        };

        let status = completed.status;
        let code = if status.success() {
            exit_code_from_error(None)
        } else {
            exit_code_from_error(Some(&ChildError::Exited(status)))
        };
        let finished = match terminating_signal(status) {
            Some(signal) => format!("Finished with signal {signal}"),
            None => format!("Finished with exitcode {code}"),
        };
        lifecycle.finish(&finished).await;

        match completed.stream_error {
            Some(err) => Err(err),
            None => Ok(ExitOutcome::from_code(code)),
        }
    }

    async fn announce(&self, lifecycle: &mut Lifecycle<'_, W>) -> Result<(), RunError> {
        lifecycle.info(&format!("{TOOL_NAME} {VERSION}")).await?;
        lifecycle
            .info(&format!("prefix={:?}", self.config.format))
            .await?;
        if self.config.buffered {
            lifecycle.info(BUFFERED_NOTICE).await?;
        }
        lifecycle
            .info(&format!("Started {}", escape_args(&self.config.command)))
            .await
    }

    /// Everything between spawn and the final lifecycle line. The caller cleans up the child
    /// when this fails.
    async fn drive(
        &self,
        child: &mut Child,
        lifecycle: &mut Lifecycle<'_, W>,
    ) -> Result<Completed, RunError> {
        let pid = child.id().ok_or(RunError::MissingPid)?;
        debug!(pid, program = %self.config.command[0], "spawned child");

        if self.config.capture {
            let dir = self.config.capture_dir();
            let capture = Capture::create_in(&dir, pid, Arc::clone(&self.prefix)).await?;
            lifecycle.attach(capture).await?;
            for line in lifecycle.capture_paths() {
                lifecycle.info(&line).await?;
            }
        }

        let buffer = self.config.buffered.then(|| {
            let mut buffer = LineBuffer::new(Arc::clone(&self.prefix));
            if let Some(processor) = self.writer.processor() {
                buffer.set_processor(processor);
            }
            Arc::new(buffer)
        });
        let sink = match &buffer {
            Some(buffer) => Sink::Buffered(Arc::clone(buffer)),
            None => Sink::Direct(Arc::clone(&self.writer)),
        };

        let relay = match SignalRelay::start(pid) {
            Ok(relay) => Some(relay),
            Err(err) => {
                warn!(%err, "signal relay unavailable");
                None
            }
        };
        let streamed = self.stream(child, lifecycle.capture(), sink).await;
        if let Some(relay) = relay {
            relay.stop().await;
        }
        let completed = streamed?;
        debug!(pid, status = %completed.status, "child exited");

        if let Some(buffer) = &buffer {
            buffer.flush(&self.writer).await.map_err(RunError::Flush)?;
        }
        Ok(completed)
    }

    /// Pumps both pipes to end of stream, then reaps the child.
    async fn stream(
        &self,
        child: &mut Child,
        capture: Option<&Capture>,
        sink: Sink<W>,
    ) -> Result<Completed, RunError> {
        let (stdout, stderr) = child_streams(child, capture).await?;
        let stdout_task = spawn_pump(sink.clone(), stdout, Indicator::Out);
        let stderr_task = spawn_pump(sink, stderr, Indicator::Err);
        let stdout_result = stdout_task.await;
        let stderr_result = stderr_task.await;

        let status = child.wait().await.map_err(RunError::Wait)?;
        Ok(Completed {
            status,
            stream_error: stream_error(stdout_result?, stderr_result?),
        })
    }
}

/// A reaped child plus the first error seen while annotating its output.
struct Completed {
    status: ExitStatus,
    stream_error: Option<RunError>,
}

async fn child_streams(
    child: &mut Child,
    capture: Option<&Capture>,
) -> Result<(ChildStream, ChildStream), RunError> {
    let stdout = child.stdout.take().ok_or(RunError::MissingPipe("stdout"))?;
    let stderr = child.stderr.take().ok_or(RunError::MissingPipe("stderr"))?;
    let streams: (ChildStream, ChildStream) = match capture {
        Some(capture) => (
            Box::new(capture.tee_stdout(stdout).await?),
            Box::new(capture.tee_stderr(stderr).await?),
        ),
        None => (Box::new(stdout), Box::new(stderr)),
    };
    Ok(streams)
}

/// Destination for child output: straight to the writer, or held until the child exits.
enum Sink<W> {
    Direct(Arc<AnnotatedWriter<W>>),
    Buffered(Arc<LineBuffer>),
}

impl<W> Clone for Sink<W> {
    fn clone(&self) -> Self {
        match self {
            Sink::Direct(writer) => Sink::Direct(Arc::clone(writer)),
            Sink::Buffered(buffer) => Sink::Buffered(Arc::clone(buffer)),
        }
    }
}

fn spawn_pump<W>(
    sink: Sink<W>,
    mut reader: ChildStream,
    indicator: Indicator,
) -> JoinHandle<io::Result<()>>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let result = match &sink {
            Sink::Direct(writer) => writer.write_lines(&mut reader, indicator).await,
            Sink::Buffered(buffer) => buffer.write_lines(&mut reader, indicator).await,
        };
        if let Err(err) = &result {
            warn!(%indicator, %err, "annotating child output failed, discarding the rest");
            // Keep the pipe drained so the child never blocks on a full pipe.
            let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
        }
        result
    })
}

fn stream_error(stdout: io::Result<()>, stderr: io::Result<()>) -> Option<RunError> {
    match (stdout, stderr) {
        (Err(source), _) => Some(RunError::Stream {
            stream: "stdout",
            source,
        }),
        (Ok(()), Err(source)) => Some(RunError::Stream {
            stream: "stderr",
            source,
        }),
        (Ok(()), Ok(())) => None,
    }
}

async fn reap(child: &mut Child) {
    if let Err(err) = child.start_kill() {
        debug!(%err, "kill failed");
    }
    if let Err(err) = child.wait().await {
        warn!(%err, "failed to reap child");
    }
}

/// Lifecycle `Info` lines go to the writer and, once capture files exist, to the lifecycle
/// capture. Lines written before the capture is attached are replayed into it.
struct Lifecycle<'a, W> {
    writer: &'a AnnotatedWriter<W>,
    capture: Option<Capture>,
    pending: Vec<String>,
    remember: bool,
}

impl<'a, W: AsyncWrite + Unpin + Send> Lifecycle<'a, W> {
    fn new(writer: &'a AnnotatedWriter<W>, remember: bool) -> Self {
        Self {
            writer,
            capture: None,
            pending: Vec::new(),
            remember,
        }
    }

    /// Writes `msg` to both destinations even when one of them fails.
    async fn info(&mut self, msg: &str) -> Result<(), RunError> {
        let written = self
            .writer
            .write_line(Indicator::Info, msg)
            .await
            .map_err(|source| RunError::Write {
                what: "lifecycle line",
                source,
            });
        let captured = match &mut self.capture {
            Some(capture) => capture.write_lifecycle(msg).await.map_err(RunError::from),
            None => {
                if self.remember {
                    self.pending.push(msg.to_string());
                }
                Ok(())
            }
        };
        written.and(captured)
    }

    /// Writes the final line. A failure here cannot change the outcome, so it is only logged.
    async fn finish(&mut self, msg: &str) {
        if let Err(err) = self.info(msg).await {
            warn!(%err, "failed to write final lifecycle line");
        }
    }

    async fn attach(&mut self, capture: Capture) -> Result<(), CaptureError> {
        let capture = self.capture.insert(capture);
        for msg in self.pending.drain(..) {
            capture.write_lifecycle(&msg).await?;
        }
        Ok(())
    }

    fn capture(&self) -> Option<&Capture> {
        self.capture.as_ref()
    }

    fn capture_paths(&self) -> Vec<String> {
        let Some(capture) = &self.capture else {
            return Vec::new();
        };
        [
            ("stdout", capture.stdout_path()),
            ("stderr", capture.stderr_path()),
            ("lifecycle", capture.lifecycle_path()),
        ]
        .into_iter()
        .map(|(name, path): (&str, &Path)| format!("capture.{name}={}", path.display()))
        .collect()
    }

    async fn close(&mut self) -> Result<(), CaptureError> {
        match self.capture.take() {
            Some(capture) => capture.close().await,
            None => Ok(()),
        }
    }
}
