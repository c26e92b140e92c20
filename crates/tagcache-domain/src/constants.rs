//! Domain layer constants
//!
//! Limits and defaults that are part of the cache contract itself.
//! Substrate-specific constants (file footer widths, key prefixes) live
//! with the backend that owns them.

/// Maximum length of an entry identifier in bytes
pub const MAX_IDENTIFIER_LENGTH: usize = 250;

/// Maximum length of a tag in bytes
pub const MAX_TAG_LENGTH: usize = 250;

/// Default entry lifetime in seconds; `0` means entries never expire
pub const DEFAULT_LIFETIME_SECS: u64 = 0;
