//! Subject matching with the `*` (one token) and `>` (trailing tokens) wildcards.

/// Returns true when `subject` is matched by `pattern`.
pub fn matches(pattern: &str, subject: &str) -> bool {
    let mut pattern_tokens = pattern.split('.');
    let mut subject_tokens = subject.split('.');

    loop {
        match (pattern_tokens.next(), subject_tokens.next()) {
            (Some(">"), Some(_)) => return true,
            (Some("*"), Some(_)) => continue,
            (Some(expected), Some(token)) if expected == token => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// A subject is valid when it has no empty tokens and no whitespace.
pub fn is_valid(subject: &str) -> bool {
    !subject.is_empty()
        && subject
            .split('.')
            .all(|token| !token.is_empty() && !token.contains(char::is_whitespace))
}
