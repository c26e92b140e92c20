//! Entry identifier and tag validation
//!
//! One shared validator applied by every backend at the top of `set`,
//! `get`, `has`, and `remove`, before any substrate access. The grammar
//! doubles as a path-traversal guard for the file backend, so it is
//! enforced uniformly even by backends that never touch a filesystem.

use crate::constants::{MAX_IDENTIFIER_LENGTH, MAX_TAG_LENGTH};
use crate::error::{Error, Result};
use once_cell::sync::Lazy;
use regex::Regex;

/// Identifier grammar: segments of `[A-Za-z0-9_%]` joined by single `/`.
///
/// `.` and `..` segments, empty segments, and leading/trailing `/` all fail
/// this pattern, so no separate dot-segment check is needed.
static ENTRY_IDENTIFIER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_%]+(/[A-Za-z0-9_%]+)*$").expect("pattern is valid"));

/// Validate a cache entry identifier
///
/// Returns [`Error::InvalidIdentifier`] for anything outside the grammar.
/// No side effects; safe to call before acquiring any substrate resource.
pub fn validate_identifier(identifier: &str) -> Result<()> {
    if identifier.is_empty()
        || identifier.len() > MAX_IDENTIFIER_LENGTH
        || !ENTRY_IDENTIFIER.is_match(identifier)
    {
        return Err(Error::invalid_identifier(identifier));
    }
    Ok(())
}

/// Validate a tag
///
/// Tags carry no grammar beyond non-empty, but control characters are
/// rejected so the file backend can join tags with a line separator inside
/// its entry footer.
pub fn validate_tag(tag: &str) -> Result<()> {
    if tag.is_empty() || tag.len() > MAX_TAG_LENGTH || tag.chars().any(char::is_control) {
        return Err(Error::invalid_tag(tag));
    }
    Ok(())
}
