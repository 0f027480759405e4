//! Turns failures into bounded, credential-free descriptions.
//!
//! In the default mode only the error's category survives; the message text
//! may carry hostnames, usernames or server banners. Verbose mode keeps the
//! text for trusted local debugging, but it is still truncated and replaced
//! wholesale when it looks like it contains a secret.

use aho_corasick::{AhoCorasick, AhoCorasickBuilder};
use std::fmt::Display;
use std::sync::OnceLock;

use crate::constants::MAX_ERROR_MESSAGE_LEN;

/// Replacement text for messages that look like they contain secrets.
pub const REDACTED_MESSAGE: &str = "Operation failed (details omitted for security)";

/// Keywords that, followed by a separator and a value, indicate a secret.
const SECRET_KEYWORDS: &[&str] = &[
    "password",
    "passwd",
    "secret",
    "token",
    "key",
    "authorization",
];

const BEARER: &str = "bearer";

static KEYWORD_MATCHER: OnceLock<Option<AhoCorasick>> = OnceLock::new();

/// Stable, message-free name for an error, used in non-verbose mode.
pub trait ErrorCategory {
    fn category(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Sanitizer {
    verbose: bool,
}

impl Sanitizer {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }

    pub fn sanitize<E>(&self, err: &E) -> String
    where
        E: ErrorCategory + Display + ?Sized,
    {
        self.sanitize_parts(err.category(), &err.to_string())
    }

    /// For foreign errors (e.g. `anyhow`) where the caller names the category.
    pub fn sanitize_parts(&self, category: &str, message: &str) -> String {
        if !self.verbose {
            return if category.is_empty() {
                "UnknownError".to_string()
            } else {
                category.to_string()
            };
        }
        scrub(message)
    }
}

/// Bound the message and blank it out if it looks sensitive.
pub fn scrub(message: &str) -> String {
    if looks_sensitive(message) {
        return REDACTED_MESSAGE.to_string();
    }
    truncate(message, MAX_ERROR_MESSAGE_LEN)
}

fn truncate(message: &str, max: usize) -> String {
    if message.len() <= max {
        return message.to_string();
    }
    let mut end = max;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &message[..end])
}

fn keyword_matcher() -> Option<&'static AhoCorasick> {
    KEYWORD_MATCHER
        .get_or_init(|| {
            AhoCorasickBuilder::new()
                .ascii_case_insensitive(true)
                .build(SECRET_KEYWORDS.iter().chain(std::iter::once(&BEARER)))
                .ok()
        })
        .as_ref()
}

fn looks_sensitive(message: &str) -> bool {
    let Some(ac) = keyword_matcher() else {
        // Without the matcher nothing can be vouched for.
        return true;
    };

    for mat in ac.find_overlapping_iter(message) {
        let rest = &message[mat.end()..];
        let keyword = &message[mat.start()..mat.end()];
        let hit = if keyword.eq_ignore_ascii_case(BEARER) {
            bearer_value_follows(rest)
        } else {
            assignment_follows(rest)
        };
        if hit {
            return true;
        }
    }

    contains_email_address(message)
}

/// `keyword["\s:=]+\S`: a separator run followed by a value.
fn assignment_follows(rest: &str) -> bool {
    let value = rest.trim_start_matches(|c: char| c == '"' || c == ':' || c == '=' || c.is_whitespace());
    value.len() < rest.len() && value.chars().next().is_some_and(|c| !c.is_whitespace())
}

/// `bearer\s+[A-Za-z0-9_-]`
fn bearer_value_follows(rest: &str) -> bool {
    let value = rest.trim_start();
    value.len() < rest.len()
        && value
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn contains_email_address(message: &str) -> bool {
    let is_local = |c: char| c.is_ascii_alphanumeric() || "._%+-".contains(c);
    let is_domain = |c: char| c.is_ascii_alphanumeric() || c == '.' || c == '-';

    message.match_indices('@').any(|(at, _)| {
        let local_ok = message[..at].chars().next_back().is_some_and(is_local);
        let domain: String = message[at + 1..].chars().take_while(|&c| is_domain(c)).collect();
        let domain = domain.trim_end_matches('.');
        local_ok
            && domain
                .rsplit_once('.')
                .is_some_and(|(host, tld)| {
                    !host.is_empty() && tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic())
                })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, thiserror::Error)]
    #[error("Login failed for alice@example.com on imap.example.com")]
    struct LoginError;

    impl ErrorCategory for LoginError {
        fn category(&self) -> &'static str {
            "AuthenticationFailed"
        }
    }

    #[derive(Debug, thiserror::Error)]
    #[error("mailbox Archive does not exist")]
    struct MissingFolder;

    impl ErrorCategory for MissingFolder {
        fn category(&self) -> &'static str {
            "OperationFailed"
        }
    }

    #[test]
    fn test_default_mode_keeps_only_category() {
        let s = Sanitizer::new(false);
        assert_eq!(s.sanitize(&LoginError), "AuthenticationFailed");
        assert_eq!(s.sanitize(&MissingFolder), "OperationFailed");
        assert_eq!(s.sanitize_parts("", "boom"), "UnknownError");
    }

    #[test]
    fn test_verbose_mode_keeps_harmless_text() {
        let s = Sanitizer::new(true);
        assert_eq!(s.sanitize(&MissingFolder), "mailbox Archive does not exist");
    }

    #[test]
    fn test_verbose_mode_redacts_addresses_and_secrets() {
        let s = Sanitizer::new(true);
        assert_eq!(s.sanitize(&LoginError), REDACTED_MESSAGE);
        assert_eq!(scrub("login rejected: password=hunter2"), REDACTED_MESSAGE);
        assert_eq!(scrub("Authorization: Bearer abc123"), REDACTED_MESSAGE);
        assert_eq!(scrub("TOKEN \"xyz\""), REDACTED_MESSAGE);
    }

    #[test]
    fn test_keywords_without_values_are_not_redacted() {
        assert_eq!(scrub("invalid token."), "invalid token.");
        assert_eq!(scrub("password"), "password");
        assert_eq!(scrub("user@localhost refused"), "user@localhost refused");
    }

    #[test]
    fn test_long_messages_are_bounded() {
        let long = "é".repeat(400);
        let out = scrub(&long);
        assert!(out.ends_with("..."));
        assert!(out.len() <= MAX_ERROR_MESSAGE_LEN + 3);
    }
}
