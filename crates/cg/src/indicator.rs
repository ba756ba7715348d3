use std::fmt;

/// Identifies the source of an annotated output line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Indicator {
    /// Lifecycle messages from the supervisor itself.
    Info,
    /// A line from the child's stdout.
    Out,
    /// A line from the child's stderr.
    Err,
}

impl Indicator {
    pub fn as_char(self) -> char {
        match self {
            Indicator::Info => 'I',
            Indicator::Out => 'O',
            Indicator::Err => 'E',
        }
    }
}

impl fmt::Display for Indicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// Renders one annotated line. `terminated` controls the trailing newline.
pub(crate) fn render_line(prefix: &str, indicator: Indicator, text: &str, terminated: bool) -> String {
    let mut out = String::with_capacity(prefix.len() + text.len() + 4);
    out.push_str(prefix);
    out.push(indicator.as_char());
    out.push_str(": ");
    out.push_str(text);
    if terminated {
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_prefix_indicator_and_text() {
        assert_eq!(render_line("T ", Indicator::Out, "hi", true), "T O: hi\n");
        assert_eq!(render_line("", Indicator::Err, "tail", false), "E: tail");
        assert_eq!(Indicator::Info.to_string(), "I");
    }
}
