//! Cache entry model and expiry arithmetic

use crate::error::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Namespacing string isolating one logical cache from others sharing a
/// substrate
///
/// Every backend instance is bound to exactly one identity for its whole
/// lifetime. Two backends with different identities over the same substrate
/// root never observe each other's entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheIdentity(String);

impl CacheIdentity {
    /// Create a cache identity
    ///
    /// Identities are restricted to `[A-Za-z0-9_]` so they can be embedded
    /// in directory names, table rows, and key prefixes without escaping.
    pub fn new<S: Into<String>>(identity: S) -> Result<Self> {
        let identity = identity.into();
        if identity.is_empty()
            || !identity
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(Error::configuration(format!(
                "invalid cache identity {identity:?}: expected one or more of [A-Za-z0-9_]"
            )));
        }
        Ok(Self(identity))
    }

    /// The identity as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Payload kind stored by a cache
///
/// The file backend keeps ordinary data and executable source under
/// separate directory roots. The kind is chosen by the frontend when the
/// backend is constructed, never inferred from payload contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadKind {
    /// Opaque data bytes
    #[default]
    Data,
    /// Executable source text
    Code,
}

impl PayloadKind {
    /// Directory root used by the file backend for this kind
    pub fn subdirectory(self) -> &'static str {
        match self {
            Self::Data => "Data",
            Self::Code => "Code",
        }
    }
}

/// A stored cache item: identifier, payload, tag set, and absolute expiry
///
/// `expires_at == None` means the entry never expires. Entries are created
/// and replaced wholesale by `set`; there is no partial update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Validated entry identifier
    pub identifier: String,
    /// Opaque payload bytes
    pub payload: Vec<u8>,
    /// Tags referencing this entry
    pub tags: BTreeSet<String>,
    /// Absolute expiry, `None` for never
    pub expires_at: Option<DateTime<Utc>>,
}

impl CacheEntry {
    /// Whether the entry has expired at `now`
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= now,
            None => false,
        }
    }
}

/// Resolve a caller-supplied lifetime into an absolute expiry
///
/// - `None` uses `default_lifetime` seconds (`0` meaning unlimited)
/// - `Some(0)` is the explicit "never expires" sentinel
/// - any other value, including negative ones, is added to `now`; negative
///   lifetimes produce an already-expired entry
pub fn resolve_expiry(
    lifetime: Option<i64>,
    default_lifetime: u64,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match lifetime {
        None => {
            if default_lifetime == 0 {
                None
            } else {
                Some(now + Duration::seconds(default_lifetime as i64))
            }
        }
        Some(0) => None,
        Some(seconds) => Some(now + Duration::seconds(seconds)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_grammar() {
        assert!(CacheIdentity::new("UnitTestCache").is_ok());
        assert!(CacheIdentity::new("cache_1").is_ok());
        assert!(CacheIdentity::new("").is_err());
        assert!(CacheIdentity::new("bad/identity").is_err());
        assert!(CacheIdentity::new("white space").is_err());
    }

    #[test]
    fn lifetime_resolution() {
        let now = Utc::now();

        // unset lifetime falls back to the default
        assert_eq!(resolve_expiry(None, 0, now), None);
        assert_eq!(
            resolve_expiry(None, 60, now),
            Some(now + Duration::seconds(60))
        );

        // explicit zero means infinite regardless of the default
        assert_eq!(resolve_expiry(Some(0), 60, now), None);

        // negative lifetimes are already expired
        let expiry = resolve_expiry(Some(-1), 0, now).unwrap();
        assert!(expiry < now);
    }

    #[test]
    fn expiry_check() {
        let now = Utc::now();
        let mut entry = CacheEntry {
            identifier: "entry".to_string(),
            payload: b"payload".to_vec(),
            tags: BTreeSet::new(),
            expires_at: None,
        };
        assert!(!entry.is_expired(now));

        entry.expires_at = Some(now - Duration::seconds(1));
        assert!(entry.is_expired(now));

        entry.expires_at = Some(now + Duration::seconds(60));
        assert!(!entry.is_expired(now));
    }
}
