//! # tagcache
//!
//! A tagged, expiring cache with interchangeable storage backends.
//!
//! Every backend implements one uniform contract: entry expiry, multi-tag
//! invalidation, bulk flush, garbage collection of expired entries, lazy
//! enumeration, and a one-way freeze transition that turns a warmed-up
//! cache into a fast, expiry-check-free read-only structure.
//!
//! ## Backends
//!
//! - **Memory** - process-local maps, fastest, non-durable
//! - **File** - one file per entry, durable, physical freeze on Unix
//! - **Postgres** - row-per-entry tables, transactional invalidation
//! - **Redis** - native TTLs and set-valued tag indexes
//!
//! ## Example
//!
//! ```ignore
//! use tagcache::backends::MemoryBackend;
//! use tagcache::domain::{CacheBackend, CacheIdentity};
//!
//! let cache = MemoryBackend::new(CacheIdentity::new("PageCache")?);
//! cache.set("frontpage", b"<html>...", &["page".to_string()], Some(300)).await?;
//! assert!(cache.has("frontpage").await?);
//! cache.flush_by_tag("page").await?;
//! ```
//!
//! ## Architecture
//!
//! The workspace follows a clean layering:
//!
//! - `domain` - the cache contract, entry model, and identifier grammar
//! - `backends` - the four storage engines
//! - `infrastructure` - configuration loading, logging, and the factory

/// Domain layer - the cache contract and core types
///
/// Re-exports from the domain crate for convenience
pub mod domain {
    pub use tagcache_domain::*;
}

/// Storage backends
///
/// Re-exports from the backends crate for convenience
pub mod backends {
    pub use tagcache_backends::*;
}

/// Infrastructure layer - configuration, logging, factory
///
/// Re-exports from the infrastructure crate for convenience
pub mod infrastructure {
    pub use tagcache_infrastructure::*;
}

// Flat re-exports of the types almost every consumer needs
pub use tagcache_backends::{FileBackend, MemoryBackend, PostgresBackend, RedisBackend};
pub use tagcache_domain::{CacheBackend, CacheIdentity, EntryStream, Error, Result};
pub use tagcache_infrastructure::{BackendFactory, CacheConfig, ConfigLoader, TypedCache};
