//! Logging helpers that keep secrets and message bodies out of log output.
//!
//! Passwords are never printed, chat content is reduced to its length, and
//! raw lines that fail to parse are scrubbed before being echoed.
//!
//! Scrubbing is coarse: a malformed line that mentions any sensitive field
//! name, `content` included, is logged as `[REDACTED]` in full. A broken
//! `RELAY` frame therefore leaves no excerpt in the log; reproduce it with a
//! content-free frame when debugging the wire format.

use std::fmt;

/// Longest raw-line excerpt echoed into the log.
const MAX_LOGGED_LINE: usize = 80;

/// A wrapper that redacts sensitive data when displayed.
pub struct Redacted<T>(pub T);

impl<T> fmt::Display for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl<T> fmt::Debug for Redacted<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

/// Chat content, shown only as its length.
pub struct RedactedContent<'a>(pub &'a str);

impl<'a> fmt::Display for RedactedContent<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{} bytes]", self.0.len())
    }
}

impl<'a> fmt::Debug for RedactedContent<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Patterns that should be redacted from logs.
const SENSITIVE_PATTERNS: &[&str] = &["password", "secret", "token", "content"];

/// Check if a string appears to contain sensitive data.
pub fn appears_sensitive(s: &str) -> bool {
    let lower = s.to_lowercase();
    SENSITIVE_PATTERNS.iter().any(|p| lower.contains(p))
}

/// Sanitize a raw wire line for logging.
///
/// Lines mentioning sensitive fields are replaced wholesale; others are
/// truncated on a character boundary.
pub fn sanitize_for_log(s: &str) -> String {
    if appears_sensitive(s) {
        return "[REDACTED]".to_string();
    }
    if s.len() <= MAX_LOGGED_LINE {
        return s.to_string();
    }
    let cut = s
        .char_indices()
        .map(|(i, _)| i)
        .take_while(|i| *i <= MAX_LOGGED_LINE)
        .last()
        .unwrap_or(0);
    format!("{}...", &s[..cut])
}
