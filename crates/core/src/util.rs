//! Small shared helpers: timestamps and path normalization.

use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Current UTC time formatted as RFC 3339, e.g. `2026-07-27T12:00:00Z`.
pub fn now_rfc3339() -> String {
    OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

/// Normalize a filesystem path to POSIX-style forward slashes for storage
/// as a bundle-relative path.
pub fn to_posix(path: &str) -> String {
    path.replace('\\', "/")
}

/// Normalize line endings to LF. CRLF and lone CR both collapse to LF.
pub fn normalize_line_endings(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
                out.push('\n');
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_crlf_and_cr() {
        assert_eq!(normalize_line_endings("a\r\nb\rc\n"), "a\nb\nc\n");
    }

    #[test]
    fn posix_swaps_backslashes() {
        assert_eq!(to_posix("a\\b\\c"), "a/b/c");
    }
}
