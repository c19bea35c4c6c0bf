//! Persistent identifiers: `namespace:localId`.

use std::sync::OnceLock;

use regex::Regex;

use crate::error::{GraphRepoError, Result};

/// URI scheme prefix carried by resource references in relationship documents.
pub const FEDORA_URI_PREFIX: &str = "info:fedora/";

fn pid_regex() -> &'static Regex {
    static PID_RE: OnceLock<Regex> = OnceLock::new();
    PID_RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9.\-]*:[^\s/#:][^\s/#]*$").expect("Invalid PID pattern")
    })
}

/// True if `value` is a well-formed object identifier.
pub fn is_valid_pid(value: &str) -> bool {
    pid_regex().is_match(value)
}

/// Validate `value` as a PID, returning it unchanged.
pub fn validate_pid(value: &str) -> Result<&str> {
    if is_valid_pid(value) {
        Ok(value)
    } else {
        Err(GraphRepoError::InvalidPid(value.to_string()))
    }
}

/// Strip the `info:fedora/` scheme prefix from a resource reference.
pub fn strip_uri(resource: &str) -> &str {
    resource.strip_prefix(FEDORA_URI_PREFIX).unwrap_or(resource)
}

/// Resource URI for a PID.
pub fn to_uri(pid: &str) -> String {
    format!("{}{}", FEDORA_URI_PREFIX, pid)
}

/// Escape characters reserved by Lucene-style query syntax.
///
/// Used when rendering filter expressions; `uuid:x` becomes `uuid\:x`.
pub fn escape_query_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 4);
    for c in value.chars() {
        if matches!(
            c,
            '\\' | '+' | '-' | '!' | '(' | ')' | ':' | '^' | '[' | ']' | '"' | '{' | '}' | '~'
                | '*' | '?' | '|' | '&' | ';' | '/'
        ) || c.is_whitespace()
        {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_pids() {
        assert!(is_valid_pid("uuid:5035a48a-5e2e-486c-8127-2fa650842e46"));
        assert!(is_valid_pid("model:monograph"));
        assert!(is_valid_pid("my.ns-1:abc_def"));
    }

    #[test]
    fn test_invalid_pids() {
        assert!(!is_valid_pid(""));
        assert!(!is_valid_pid("no-namespace"));
        assert!(!is_valid_pid("uuid:"));
        assert!(!is_valid_pid("uuid:has space"));
        assert!(!is_valid_pid("info:fedora/uuid:a"));
        assert!(!is_valid_pid("1998"));
        assert!(!is_valid_pid(":local"));
        assert!(validate_pid("plain text").is_err());
    }

    #[test]
    fn test_strip_and_build_uri() {
        assert_eq!(strip_uri("info:fedora/uuid:a"), "uuid:a");
        assert_eq!(strip_uri("uuid:a"), "uuid:a");
        assert_eq!(to_uri("uuid:a"), "info:fedora/uuid:a");
    }

    #[test]
    fn test_escape_query_value() {
        assert_eq!(escape_query_value("uuid:a-b"), r"uuid\:a\-b");
        assert_eq!(escape_query_value("two words"), r"two\ words");
        assert_eq!(escape_query_value("plain"), "plain");
    }
}
