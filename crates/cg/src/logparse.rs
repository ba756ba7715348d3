use std::{fmt, str::FromStr, sync::Arc};

use serde_json::{Map, Value};

use crate::{timestamp::TimestampParser, ConfigError, TimestampFormat};

pub const DEFAULT_MESSAGE_KEY: &str = "message";
pub const DEFAULT_TIMESTAMP_KEY: &str = "timestamp";

/// Result of processing one raw output line for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedLine {
    /// Prefix derived from the line itself (e.g. its own timestamp). `None` lets the caller use
    /// its receive-time prefix.
    pub prefix: Option<String>,
    pub text: String,
}

/// Transforms raw output lines for display.
///
/// Returning `None` passes the line through unchanged. Implementations are shared between the
/// stdout and stderr readers, so they must be callable concurrently.
pub trait LineProcessor: Send + Sync {
    fn process(&self, line: &str) -> Option<ProcessedLine>;
}

pub(crate) fn apply_processor(
    processor: Option<&dyn LineProcessor>,
    line: String,
) -> (Option<String>, String) {
    match processor.and_then(|p| p.process(&line)) {
        Some(processed) => (processed.prefix, processed.text),
        None => (None, line),
    }
}

/// Structured log encodings understood by `--log-parse`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Logfmt,
}

impl LogFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            LogFormat::Json => "json",
            LogFormat::Logfmt => "logfmt",
        }
    }

    /// Builds the processor for this encoding.
    pub fn processor(self, options: LogProcessorOptions) -> Arc<dyn LineProcessor> {
        match self {
            LogFormat::Json => Arc::new(JsonProcessor::new(options)),
            LogFormat::Logfmt => Arc::new(LogfmtProcessor::new(options)),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "json" => Ok(LogFormat::Json),
            "logfmt" => Ok(LogFormat::Logfmt),
            other => Err(ConfigError::UnsupportedLogFormat(other.to_string())),
        }
    }
}

/// Which keys of a structured line are appended after the message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldSelection {
    /// Every key except the message and timestamp keys, alphabetically.
    All,
    /// The named keys in the given order; missing keys are skipped.
    Only(Vec<String>),
}

impl Default for FieldSelection {
    fn default() -> Self {
        FieldSelection::Only(Vec::new())
    }
}

/// Parses a comma-separated `--log-fields` value. `*` alone selects every field.
pub fn parse_fields_flag(s: &str) -> FieldSelection {
    if s.is_empty() {
        return FieldSelection::default();
    }
    if s == "*" {
        return FieldSelection::All;
    }
    FieldSelection::Only(s.split(',').map(str::to_string).collect())
}

#[derive(Debug, Clone)]
pub struct LogProcessorOptions {
    pub message_key: String,
    /// Key holding the line's own timestamp; `None` disables timestamp extraction.
    pub timestamp_key: Option<String>,
    /// Explicit timestamp encoding; `None` auto-detects.
    pub timestamp_format: Option<TimestampFormat>,
    pub fields: FieldSelection,
    /// strftime-style layout for rendering extracted timestamps.
    pub layout: String,
}

impl Default for LogProcessorOptions {
    fn default() -> Self {
        Self {
            message_key: DEFAULT_MESSAGE_KEY.to_string(),
            timestamp_key: Some(DEFAULT_TIMESTAMP_KEY.to_string()),
            timestamp_format: None,
            fields: FieldSelection::default(),
            layout: crate::runner::DEFAULT_FORMAT.to_string(),
        }
    }
}

#[derive(Debug)]
struct RecordRenderer {
    options: LogProcessorOptions,
    timestamps: Option<TimestampParser>,
}

impl RecordRenderer {
    fn new(options: LogProcessorOptions) -> Self {
        let timestamps = options
            .timestamp_key
            .as_ref()
            .map(|_| TimestampParser::new(options.timestamp_format, options.layout.clone()));
        Self {
            options,
            timestamps,
        }
    }

    fn render(&self, record: &Map<String, Value>) -> Option<ProcessedLine> {
        let message = record.get(&self.options.message_key)?;

        let mut text = stringify(message);
        let mut exclude = vec![self.options.message_key.as_str()];
        if let Some(key) = &self.options.timestamp_key {
            exclude.push(key.as_str());
        }
        text.push_str(&format_fields(record, &self.options.fields, &exclude));

        let prefix = match (&self.timestamps, &self.options.timestamp_key) {
            (Some(parser), Some(key)) => record.get(key).and_then(|value| parser.parse(value)),
            _ => None,
        };

        Some(ProcessedLine { prefix, text })
    }
}

/// Reduces JSON object lines to their message plus selected fields.
#[derive(Debug)]
pub struct JsonProcessor {
    renderer: RecordRenderer,
}

impl JsonProcessor {
    pub fn new(options: LogProcessorOptions) -> Self {
        Self {
            renderer: RecordRenderer::new(options),
        }
    }
}

impl LineProcessor for JsonProcessor {
    fn process(&self, line: &str) -> Option<ProcessedLine> {
        let record: Map<String, Value> = serde_json::from_str(line).ok()?;
        self.renderer.render(&record)
    }
}

/// Reduces logfmt lines to their message plus selected fields.
#[derive(Debug)]
pub struct LogfmtProcessor {
    renderer: RecordRenderer,
}

impl LogfmtProcessor {
    pub fn new(options: LogProcessorOptions) -> Self {
        Self {
            renderer: RecordRenderer::new(options),
        }
    }
}

impl LineProcessor for LogfmtProcessor {
    fn process(&self, line: &str) -> Option<ProcessedLine> {
        let record = parse_logfmt(line)?;
        self.renderer.render(&record)
    }
}

/// Parses a logfmt line into key/value pairs, or `None` if it holds no pairs.
///
/// A bare key is `true`, `key=` is an empty string, and quoted values honour `\"` and `\\`.
/// An unterminated quote runs to the end of the line.
pub fn parse_logfmt(line: &str) -> Option<Map<String, Value>> {
    let bytes = line.as_bytes();
    let n = bytes.len();
    let mut record = Map::new();
    let mut i = 0;

    while i < n {
        while i < n && bytes[i] == b' ' {
            i += 1;
        }
        if i >= n {
            break;
        }

        let key_start = i;
        while i < n && bytes[i] != b'=' && bytes[i] != b' ' {
            i += 1;
        }
        if i == key_start {
            break;
        }
        let key = line[key_start..i].to_string();

        if i >= n || bytes[i] == b' ' {
            record.insert(key, Value::Bool(true));
            continue;
        }

        // '='
        i += 1;

        if i >= n || bytes[i] == b' ' {
            record.insert(key, Value::String(String::new()));
            continue;
        }

        if bytes[i] == b'"' {
            i += 1;
            let mut value = Vec::new();
            while i < n && bytes[i] != b'"' {
                if bytes[i] == b'\\' && i + 1 < n && matches!(bytes[i + 1], b'"' | b'\\') {
                    value.push(bytes[i + 1]);
                    i += 2;
                    continue;
                }
                value.push(bytes[i]);
                i += 1;
            }
            if i < n {
                i += 1;
            }
            record.insert(key, Value::String(String::from_utf8_lossy(&value).into_owned()));
        } else {
            let value_start = i;
            while i < n && bytes[i] != b' ' {
                i += 1;
            }
            record.insert(key, Value::String(line[value_start..i].to_string()));
        }
    }

    (!record.is_empty()).then_some(record)
}

/// Renders a value for display: strings verbatim, scalars in their natural form, `null`, and
/// composites as compact JSON.
pub(crate) fn stringify(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Number(n) => match n.as_f64() {
            // Whole floats print without a fractional part, like integers.
            Some(f) if !n.is_i64() && !n.is_u64() && f.fract() == 0.0 && f.abs() < 1e21 => {
                format!("{f:.0}")
            }
            _ => n.to_string(),
        },
        Value::Bool(b) => b.to_string(),
        Value::Null => "null".to_string(),
        Value::Array(_) | Value::Object(_) => serde_json::to_string(value).unwrap_or_default(),
    }
}

/// Builds the ` key=value key=value` suffix. Values containing a space are quoted.
pub(crate) fn format_fields(
    record: &Map<String, Value>,
    fields: &FieldSelection,
    exclude: &[&str],
) -> String {
    let keys: Vec<&str> = match fields {
        FieldSelection::All => {
            let mut keys: Vec<&str> = record
                .keys()
                .map(String::as_str)
                .filter(|k| !exclude.contains(k))
                .collect();
            keys.sort_unstable();
            keys
        }
        FieldSelection::Only(names) => names
            .iter()
            .map(String::as_str)
            .filter(|k| record.contains_key(*k) && !exclude.contains(k))
            .collect(),
    };

    let mut out = String::new();
    for key in keys {
        let value = stringify(&record[key]);
        out.push(' ');
        out.push_str(key);
        out.push('=');
        if value.contains(' ') {
            out.push_str(&format!("{value:?}"));
        } else {
            out.push_str(&value);
        }
    }
    out
}
