/// Joins `args` into a shell-readable command line, quoting where needed.
pub fn escape_args<S: AsRef<str>>(args: &[S]) -> String {
    args.iter()
        .map(|arg| shell_quote(arg.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Quotes one argument for a POSIX shell.
///
/// Empty strings become `''`; strings made only of safe characters pass through; anything else
/// is single-quoted with embedded quotes written as `'\''`.
pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    if s.chars().all(is_shell_safe) {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn is_shell_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | ':' | '@' | '+' | ',' | '=')
}
