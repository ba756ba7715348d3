use std::path::PathBuf;

use thiserror::Error;

/// Invalid configuration, detected before any child is spawned.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("command must not be empty")]
    EmptyCommand,
    #[error("invalid prefix format {0:?}")]
    InvalidLayout(String),
    #[error("unsupported --log-parse value: {0:?} (supported: json, logfmt)")]
    UnsupportedLogFormat(String),
    #[error("unsupported --log-timestamp-format value: {0:?} (supported: rfc3339, unix-s, unix-ms)")]
    UnsupportedTimestampFormat(String),
    #[error("--{0} requires --log-parse")]
    RequiresLogParse(&'static str),
}

impl ConfigError {
    /// Exit code used when a configuration error reaches the process boundary.
    pub const EXIT_CODE: i32 = 2;
}

/// Failures creating or writing the on-disk capture files.
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("creating {stream} capture file `{path}`: {source}")]
    Create {
        stream: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("duplicating capture handle for `{path}`: {source}")]
    Duplicate {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("writing lifecycle capture: {0}")]
    Lifecycle(#[source] std::io::Error),
    #[error("closing capture file `{path}`: {source}")]
    Close {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Internal failures of a run. A child that exits non-zero is not an error; see
/// [`crate::ExitOutcome`].
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("creating capture files: {0}")]
    Capture(#[from] CaptureError),
    #[error("writing {what}: {source}")]
    Write {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("reading child {stream}: {source}")]
    Stream {
        stream: &'static str,
        #[source]
        source: std::io::Error,
    },
    #[error("flushing buffered output: {0}")]
    Flush(#[source] std::io::Error),
    #[error("child {0} unavailable")]
    MissingPipe(&'static str),
    #[error("child process id unavailable")]
    MissingPid,
    #[error("failed to wait for child process: {0}")]
    Wait(#[source] std::io::Error),
    #[error("failed to join stream task: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl RunError {
    /// Exit code to report at the process boundary.
    pub fn exit_code(&self) -> i32 {
        match self {
            RunError::Config(_) => ConfigError::EXIT_CODE,
            _ => 1,
        }
    }
}
