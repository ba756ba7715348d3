#![forbid(unsafe_code)]
//! Supervise a child command and annotate its output.
//!
//! Every line the child writes is rendered as `<prefix><indicator>: <text>`, where the prefix is
//! usually a timestamp and the indicator is `O` (stdout), `E` (stderr) or `I` (lifecycle messages
//! emitted by the supervisor itself). Optional features:
//!
//! - Buffered mode: output is held in memory and replayed after the child exits, grouped by stream.
//! - Capture mode: raw, unannotated copies of stdout/stderr plus an annotated lifecycle log are
//!   written to `<tmpdir>/cg-<pid>-{stdout,stderr,lifecycle}`.
//! - Structured log parsing: JSON or logfmt lines are reduced to their message plus selected
//!   fields, and their own timestamp (auto-detected) replaces the receive-time prefix.
//!
//! ```rust,no_run
//! use cg::{RunConfig, Runner};
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RunConfig::builder()
//!     .command(["sh", "-c", "echo out; echo err >&2"])
//!     .buffered(true)
//!     .build()?;
//! let runner = Runner::new(config, tokio::io::stdout());
//! let outcome = runner.run().await?;
//! std::process::exit(outcome.code());
//! # }
//! ```

mod buffer;
mod capture;
mod error;
mod exit_code;
mod indicator;
mod lines;
mod logparse;
mod platform;
mod quote;
mod runner;
mod timestamp;
mod writer;

pub use buffer::LineBuffer;
pub use capture::{Capture, CaptureTee};
pub use error::{CaptureError, ConfigError, RunError};
pub use exit_code::{exit_code_from_error, ChildError, ExitOutcome};
pub use indicator::Indicator;
pub use logparse::{
    parse_fields_flag, parse_logfmt, FieldSelection, JsonProcessor, LineProcessor, LogFormat,
    LogProcessorOptions, LogfmtProcessor, ProcessedLine, DEFAULT_MESSAGE_KEY,
    DEFAULT_TIMESTAMP_KEY,
};
pub use quote::{escape_args, shell_quote};
pub use runner::{RunConfig, RunConfigBuilder, Runner, DEFAULT_FORMAT, TOOL_NAME, VERSION};
pub use timestamp::{render_layout, validate_layout, TimestampFormat, TimestampParser};
pub use writer::{AnnotatedWriter, PrefixFn};
