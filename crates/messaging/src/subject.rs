//! Subject validation and wildcard matching.
//!
//! Subjects are dot-separated token strings. Patterns may use `*` to match a
//! single token and a trailing `>` to match any remainder.

use crate::Error;

/// Validates a literal subject (no wildcards allowed).
pub fn validate_subject(subject: &str) -> Result<(), Error> {
    if subject.is_empty() {
        return Err(Error::InvalidSubject("subject cannot be empty".into()));
    }
    if subject.contains(['*', '>']) {
        return Err(Error::InvalidSubject(format!(
            "literal subject {subject:?} cannot contain wildcards"
        )));
    }
    if subject.split('.').any(str::is_empty) {
        return Err(Error::InvalidSubject(format!(
            "subject {subject:?} contains an empty token"
        )));
    }
    Ok(())
}

/// Validates a subscription pattern.
pub fn validate_pattern(pattern: &str) -> Result<(), Error> {
    if pattern.is_empty() {
        return Err(Error::InvalidSubject("pattern cannot be empty".into()));
    }
    let tokens: Vec<&str> = pattern.split('.').collect();
    for (i, token) in tokens.iter().enumerate() {
        if token.is_empty() {
            return Err(Error::InvalidSubject(format!(
                "pattern {pattern:?} contains an empty token"
            )));
        }
        if *token == ">" && i != tokens.len() - 1 {
            return Err(Error::InvalidSubject(format!(
                "'>' must be the last token in {pattern:?}"
            )));
        }
    }
    Ok(())
}

/// Returns true when `subject` matches `pattern`.
pub fn matches(subject: &str, pattern: &str) -> bool {
    let mut subject_tokens = subject.split('.');
    let mut pattern_tokens = pattern.split('.').peekable();

    loop {
        match (subject_tokens.next(), pattern_tokens.next()) {
            (_, Some(">")) => return true,
            (Some(s), Some(p)) => {
                if p != "*" && p != s {
                    return false;
                }
            }
            (None, None) => return true,
            _ => return false,
        }
    }
}
