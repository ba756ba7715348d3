use std::process::ExitCode;

use cg::{
    parse_fields_flag, ConfigError, LogFormat, RunConfig, Runner, TimestampFormat, DEFAULT_FORMAT,
};
use clap::Parser;
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "CG_LOG";

#[derive(Debug, Parser)]
#[command(name = "cg", version)]
#[command(about = "Run a command and annotate each line of its output with a timestamp")]
struct Cli {
    /// Prefix layout, strftime syntax.
    #[arg(long, default_value = DEFAULT_FORMAT)]
    format: String,

    /// Copy raw child output and lifecycle lines to temporary files.
    #[arg(long)]
    capture: bool,

    /// Defer child output until the command finishes, grouped by stream.
    #[arg(long)]
    buffered: bool,

    /// Structured log parser: json or logfmt.
    #[arg(long, value_name = "FORMAT")]
    log_parse: Option<LogFormat>,

    /// Key holding the log message [default: message]
    #[arg(long, value_name = "KEY")]
    log_message_key: Option<String>,

    /// Key holding the record timestamp; empty disables [default: timestamp]
    #[arg(long, value_name = "KEY")]
    log_timestamp_key: Option<String>,

    /// Timestamp encoding: rfc3339, unix-s or unix-ms. Auto-detected when omitted.
    #[arg(long, value_name = "FORMAT")]
    log_timestamp_format: Option<TimestampFormat>,

    /// Comma-separated keys appended after the message, or "*" for all.
    #[arg(long, value_name = "KEYS")]
    log_fields: Option<String>,

    /// Command to run, followed by its arguments.
    #[arg(
        required = true,
        num_args = 1..,
        trailing_var_arg = true,
        allow_hyphen_values = true,
        value_name = "COMMAND"
    )]
    command: Vec<String>,
}

impl Cli {
    fn into_config(self) -> Result<RunConfig, ConfigError> {
        let mut builder = RunConfig::builder()
            .command(self.command)
            .format(self.format)
            .capture(self.capture)
            .buffered(self.buffered);

        if let Some(format) = self.log_parse {
            builder = builder.log_parse(format);
        }
        if let Some(key) = self.log_message_key {
            builder = builder.log_message_key(key);
        }
        if let Some(key) = self.log_timestamp_key {
            builder = builder.log_timestamp_key(key);
        }
        if let Some(format) = self.log_timestamp_format {
            builder = builder.log_timestamp_format(format);
        }
        if let Some(fields) = self.log_fields {
            builder = builder.log_fields(parse_fields_flag(&fields));
        }
        builder.build()
    }
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let config = match Cli::parse().into_config() {
        Ok(config) => config,
        Err(err) => {
            eprintln!("Error: {err}");
            return exit_code(ConfigError::EXIT_CODE);
        }
    };

    let runner = Runner::new(config, tokio::io::stdout());
    match runner.run().await {
        Ok(outcome) => exit_code(outcome.code()),
        Err(err) => {
            tracing::debug!(?err, "run failed");
            eprintln!("Error: {err}");
            exit_code(err.exit_code())
        }
    }
}

/// Exit statuses outside 0..=255 are truncated by the OS; clamp rather than wrap.
fn exit_code(code: i32) -> ExitCode {
    ExitCode::from(u8::try_from(code).unwrap_or(u8::MAX))
}
