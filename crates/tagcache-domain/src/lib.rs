//! # tagcache-domain
//!
//! Domain layer for the tagcache workspace. Defines the storage-agnostic
//! cache contract and the value types shared by every backend:
//!
//! - [`error`] - error taxonomy separating bind-time faults, caller bugs,
//!   and recoverable substrate errors
//! - [`identifier`] - the shared entry identifier and tag validators
//! - [`entry`] - cache entry model, lifetime resolution, payload kinds
//! - [`ports`] - the [`CacheBackend`](ports::CacheBackend) port implemented
//!   by every storage engine
//!
//! This crate performs no I/O. Backends live in `tagcache-backends`.

/// Shared limits and defaults
pub mod constants;
/// Cache entry model and expiry arithmetic
pub mod entry;
/// Error taxonomy and `Result` alias
pub mod error;
/// Entry identifier and tag validation
pub mod identifier;
/// Port traits implemented by storage backends
pub mod ports;

// Re-export commonly used types for convenience
pub use entry::{CacheEntry, CacheIdentity, PayloadKind, resolve_expiry};
pub use error::{Error, Result};
pub use identifier::{validate_identifier, validate_tag};
pub use ports::{CacheBackend, EntryStream};
