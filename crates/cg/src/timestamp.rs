use std::{
    fmt::{self, Write as _},
    str::FromStr,
    sync::{Mutex, PoisonError},
};

use chrono::{
    format::{Item, StrftimeItems},
    DateTime, Datelike, Local, TimeZone,
};
use serde_json::Value;

use crate::ConfigError;

const MIN_YEAR: i32 = 1970;
const MAX_YEAR: i32 = 2100;

/// Encoding of a timestamp value found in a structured log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampFormat {
    /// RFC 3339 string, fractional seconds allowed.
    Rfc3339,
    /// Seconds since the epoch as a number or numeric string; the fraction becomes nanoseconds.
    UnixSeconds,
    /// Milliseconds since the epoch as a number or numeric string.
    UnixMillis,
}

impl TimestampFormat {
    /// Probe order used while auto-detecting.
    pub const DETECTION_ORDER: [TimestampFormat; 3] = [
        TimestampFormat::Rfc3339,
        TimestampFormat::UnixSeconds,
        TimestampFormat::UnixMillis,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TimestampFormat::Rfc3339 => "rfc3339",
            TimestampFormat::UnixSeconds => "unix-s",
            TimestampFormat::UnixMillis => "unix-ms",
        }
    }
}

impl fmt::Display for TimestampFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimestampFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rfc3339" => Ok(TimestampFormat::Rfc3339),
            "unix-s" => Ok(TimestampFormat::UnixSeconds),
            "unix-ms" => Ok(TimestampFormat::UnixMillis),
            other => Err(ConfigError::UnsupportedTimestampFormat(other.to_string())),
        }
    }
}

#[derive(Debug)]
struct ParserState {
    locked: bool,
    format: TimestampFormat,
}

/// Detects and parses timestamps from structured log values, rendering them with a
/// strftime-style layout.
///
/// Without an explicit format the parser probes [`TimestampFormat::DETECTION_ORDER`] and locks
/// to the first format that succeeds; from then on only that format is attempted. Instants
/// outside the years 1970..=2100 count as parse failures so that unrelated numbers (ports,
/// counters) are not mistaken for timestamps.
#[derive(Debug)]
pub struct TimestampParser {
    state: Mutex<ParserState>,
    layout: String,
}

impl TimestampParser {
    pub fn new(explicit: Option<TimestampFormat>, layout: impl Into<String>) -> Self {
        let state = match explicit {
            Some(format) => ParserState {
                locked: true,
                format,
            },
            None => ParserState {
                locked: false,
                format: TimestampFormat::Rfc3339,
            },
        };
        Self {
            state: Mutex::new(state),
            layout: layout.into(),
        }
    }

    /// The format this parser is locked to, if any.
    pub fn locked_format(&self) -> Option<TimestampFormat> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.locked.then_some(state.format)
    }

    /// Parses `value` and renders it with the configured layout. `None` means no usable
    /// timestamp; callers fall back to their own prefix.
    pub fn parse(&self, value: &Value) -> Option<String> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.locked {
            return self.parse_with(state.format, value);
        }

        for format in TimestampFormat::DETECTION_ORDER {
            if let Some(rendered) = self.parse_with(format, value) {
                state.locked = true;
                state.format = format;
                return Some(rendered);
            }
        }
        None
    }

    fn parse_with(&self, format: TimestampFormat, value: &Value) -> Option<String> {
        match format {
            TimestampFormat::Rfc3339 => {
                let Value::String(s) = value else {
                    return None;
                };
                // chrono also accepts a space between date and time; only `T` is RFC 3339 here.
                if !matches!(s.as_bytes().get(10), Some(b'T' | b't')) {
                    return None;
                }
                let parsed = DateTime::parse_from_rfc3339(s).ok()?;
                self.render_in_range(&parsed)
            }
            TimestampFormat::UnixSeconds => {
                let seconds = numeric(value)?;
                let whole = seconds.trunc();
                let mut secs = whole as i64;
                let mut nanos = ((seconds - whole) * 1e9) as i64;
                if nanos < 0 {
                    secs -= 1;
                    nanos += 1_000_000_000;
                }
                let instant = DateTime::from_timestamp(secs, u32::try_from(nanos).ok()?)?;
                self.render_in_range(&instant.with_timezone(&Local))
            }
            TimestampFormat::UnixMillis => {
                let millis = numeric(value)? as i64;
                let secs = millis.div_euclid(1000);
                let nanos = millis.rem_euclid(1000) * 1_000_000;
                let instant = DateTime::from_timestamp(secs, u32::try_from(nanos).ok()?)?;
                self.render_in_range(&instant.with_timezone(&Local))
            }
        }
    }

    fn render_in_range<Tz>(&self, instant: &DateTime<Tz>) -> Option<String>
    where
        Tz: TimeZone,
        Tz::Offset: fmt::Display,
    {
        if !(MIN_YEAR..=MAX_YEAR).contains(&instant.year()) {
            return None;
        }
        Some(render_layout(instant, &self.layout))
    }
}

fn numeric(value: &Value) -> Option<f64> {
    let n = match value {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

/// Renders `instant` with a strftime-style layout. An invalid layout renders as an empty string
/// instead of panicking; use [`validate_layout`] up front to reject those.
pub fn render_layout<Tz>(instant: &DateTime<Tz>, layout: &str) -> String
where
    Tz: TimeZone,
    Tz::Offset: fmt::Display,
{
    let mut out = String::new();
    if write!(out, "{}", instant.format(layout)).is_err() {
        out.clear();
    }
    out
}

pub fn validate_layout(layout: &str) -> Result<(), ConfigError> {
    if StrftimeItems::new(layout).any(|item| matches!(item, Item::Error)) {
        return Err(ConfigError::InvalidLayout(layout.to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn local(secs: i64, layout: &str) -> String {
        let instant = Local.timestamp_opt(secs, 0).single().unwrap();
        render_layout(&instant, layout)
    }

    #[test]
    fn parses_rfc3339_in_its_own_offset() {
        let parser = TimestampParser::new(None, "%H:%M:%S ");
        assert_eq!(
            parser.parse(&json!("2024-01-15T10:30:00Z")).as_deref(),
            Some("10:30:00 ")
        );

        let parser = TimestampParser::new(None, "%H:%M:%S%.3f ");
        assert_eq!(
            parser.parse(&json!("2024-01-15T10:30:00.123456789Z")).as_deref(),
            Some("10:30:00.123 ")
        );
    }

    #[test]
    fn explicit_format_rejects_other_encodings() {
        let rfc = TimestampParser::new(Some(TimestampFormat::Rfc3339), "%H:%M:%S ");
        assert_eq!(rfc.parse(&json!(1705312200.0)), None);
        assert_eq!(rfc.parse(&json!("1705312200")), None);

        let unix = TimestampParser::new(Some(TimestampFormat::UnixSeconds), "%H:%M:%S ");
        assert_eq!(unix.parse(&json!("2024-01-15T10:30:00Z")), None);
        assert_eq!(
            unix.locked_format(),
            Some(TimestampFormat::UnixSeconds)
        );
    }

    #[test]
    fn non_timestamp_values_fail() {
        let parser = TimestampParser::new(None, "%H:%M:%S ");
        assert_eq!(parser.parse(&json!("not a timestamp")), None);
        assert_eq!(parser.parse(&Value::Null), None);
        assert_eq!(parser.parse(&json!(true)), None);
        assert_eq!(parser.parse(&json!({"t": 1})), None);
        assert_eq!(parser.locked_format(), None);
    }

    #[test]
    fn space_separated_datetime_is_not_rfc3339() {
        let detect = TimestampParser::new(None, "%H:%M:%S ");
        assert_eq!(detect.parse(&json!("2024-01-15 10:30:00Z")), None);
        assert_eq!(detect.locked_format(), None);

        let explicit = TimestampParser::new(Some(TimestampFormat::Rfc3339), "%H:%M:%S ");
        assert_eq!(explicit.parse(&json!("2024-01-15 10:30:00Z")), None);
        assert_eq!(
            explicit.parse(&json!("2024-01-15t10:30:00Z")).as_deref(),
            Some("10:30:00 ")
        );
    }

    #[test]
    fn year_range_is_inclusive() {
        let parser = TimestampParser::new(Some(TimestampFormat::Rfc3339), "%Y ");
        assert_eq!(parser.parse(&json!("1969-12-31T23:59:59Z")), None);
        assert_eq!(parser.parse(&json!("2101-01-01T00:00:00Z")), None);
        assert_eq!(
            parser.parse(&json!("1970-01-01T00:00:00Z")).as_deref(),
            Some("1970 ")
        );
        assert_eq!(
            parser.parse(&json!("2100-12-31T23:59:59Z")).as_deref(),
            Some("2100 ")
        );
    }

    #[test]
    fn unix_seconds_and_millis_render_in_local_time() {
        let layout = "%H:%M:%S ";
        let want = local(1705312200, layout);

        let secs = TimestampParser::new(Some(TimestampFormat::UnixSeconds), layout);
        assert_eq!(secs.parse(&json!(1705312200)).as_deref(), Some(want.as_str()));
        assert_eq!(secs.parse(&json!("1705312200")).as_deref(), Some(want.as_str()));

        let millis = TimestampParser::new(Some(TimestampFormat::UnixMillis), layout);
        assert_eq!(
            millis.parse(&json!(1705312200000_i64)).as_deref(),
            Some(want.as_str())
        );
        assert_eq!(
            millis.parse(&json!("1705312200000")).as_deref(),
            Some(want.as_str())
        );
    }

    #[test]
    fn unix_seconds_fraction_becomes_nanoseconds() {
        let parser = TimestampParser::new(Some(TimestampFormat::UnixSeconds), "%.3f");
        assert_eq!(parser.parse(&json!(1705312200.25)).as_deref(), Some(".250"));
    }

    #[test]
    fn auto_detect_locks_on_first_success() {
        let parser = TimestampParser::new(None, "%H:%M:%S ");
        assert_eq!(
            parser.parse(&json!("2024-01-15T10:30:00Z")).as_deref(),
            Some("10:30:00 ")
        );
        assert_eq!(parser.locked_format(), Some(TimestampFormat::Rfc3339));

        assert_eq!(parser.parse(&json!(1705312200)), None);
        assert_eq!(
            parser.parse(&json!("2024-01-15T11:00:00Z")).as_deref(),
            Some("11:00:00 ")
        );
    }

    #[test]
    fn auto_detect_prefers_seconds_then_falls_back_to_millis() {
        let secs = TimestampParser::new(None, "%H:%M:%S ");
        assert!(secs.parse(&json!(1705312200)).is_some());
        assert_eq!(secs.locked_format(), Some(TimestampFormat::UnixSeconds));
        assert_eq!(secs.parse(&json!("2024-01-15T10:30:00Z")), None);

        // Interpreted as seconds this lands far beyond 2100.
        let millis = TimestampParser::new(None, "%H:%M:%S ");
        assert!(millis.parse(&json!(1705312200000_i64)).is_some());
        assert_eq!(millis.locked_format(), Some(TimestampFormat::UnixMillis));
    }

    #[test]
    fn out_of_range_millis_fail_even_when_locked() {
        let parser = TimestampParser::new(Some(TimestampFormat::UnixMillis), "%Y");
        assert_eq!(parser.parse(&json!(5_000_000_000_000_000_i64)), None);
        assert_eq!(parser.parse(&json!("NaN")), None);
    }

    #[test]
    fn parses_format_names() {
        assert_eq!(
            "rfc3339".parse::<TimestampFormat>(),
            Ok(TimestampFormat::Rfc3339)
        );
        assert_eq!(
            "unix-s".parse::<TimestampFormat>(),
            Ok(TimestampFormat::UnixSeconds)
        );
        assert_eq!(
            "unix-ms".parse::<TimestampFormat>(),
            Ok(TimestampFormat::UnixMillis)
        );
        assert_eq!(
            "iso".parse::<TimestampFormat>(),
            Err(ConfigError::UnsupportedTimestampFormat("iso".to_string()))
        );
    }

    #[test]
    fn validates_layouts() {
        assert!(validate_layout("%H:%M:%S ").is_ok());
        assert!(validate_layout("T ").is_ok());
        assert!(validate_layout("%Q").is_err());
    }
}
