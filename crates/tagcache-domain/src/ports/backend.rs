//! Cache Backend Port
//!
//! The polymorphic contract implemented by every storage engine: entry
//! expiry, multi-tag invalidation, bulk flush, garbage collection,
//! enumeration, and the one-way freeze transition.
//!
//! ## Lifecycle
//!
//! A backend is bound to its [`CacheIdentity`] and substrate location at
//! construction time; construction performs substrate preparation
//! (directory creation, table creation, connection handshake) and fails
//! fast with [`Error::Configuration`](crate::Error::Configuration) if the
//! location is unusable. A bound backend is Active until [`freeze`] moves
//! it to Frozen; only [`flush`] returns it to Active.
//!
//! ## Frozen state
//!
//! While frozen, `get`/`has` skip the expiry check entirely (frozen entries
//! are permanent), `set`/`remove`/`flush_by_tag`/`freeze` fail with
//! [`Error::Frozen`](crate::Error::Frozen), and `collect_garbage` is a
//! no-op. The flag is persisted with the cache's data where the substrate
//! allows, so freeze outlives the process.
//!
//! [`freeze`]: CacheBackend::freeze
//! [`flush`]: CacheBackend::flush

use crate::entry::CacheIdentity;
use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::BTreeSet;

/// Lazy, finite, one-shot sequence of `(identifier, payload)` pairs
///
/// Entries removed or expired before being yielded are skipped. Order is
/// substrate-defined; the memory and file backends preserve insertion
/// order as long as nothing has expired.
pub type EntryStream = BoxStream<'static, Result<(String, Vec<u8>)>>;

/// Contract implemented by every concrete cache storage engine
///
/// # Implementations
///
/// | Backend | Substrate | Tag index strategy |
/// |---------|-----------|--------------------|
/// | Memory | process-local maps | maintained on write |
/// | File | one file per entry | derived by scan on read |
/// | Postgres | entry + tag join tables | maintained on write |
/// | Redis | native TTL keys + sets | maintained on write |
///
/// All identifier-taking operations validate the identifier with the
/// shared [`validate_identifier`](crate::validate_identifier) before any
/// substrate access. Misses are never errors: `get` returns `Ok(None)`,
/// `has` and `remove` return `Ok(false)`.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// The identity this backend was bound to at construction
    fn identity(&self) -> &CacheIdentity;

    /// A short name for the storage engine (e.g. "memory", "file")
    fn backend_name(&self) -> &str;

    /// Whether `freeze` also enforces read-only state at the substrate
    /// level (e.g. dropped filesystem write bits), beyond the logical flag
    fn supports_physical_freeze(&self) -> bool;

    /// Store an entry, fully replacing any previous entry and its tag
    /// associations
    ///
    /// # Arguments
    /// * `identifier` - entry identifier (validated)
    /// * `payload` - opaque payload bytes
    /// * `tags` - tags to associate; an empty slice drops all previous tags
    /// * `lifetime` - `None` for the backend default, `Some(0)` for
    ///   infinite, any other value in seconds relative to now
    async fn set(
        &self,
        identifier: &str,
        payload: &[u8],
        tags: &[String],
        lifetime: Option<i64>,
    ) -> Result<()>;

    /// Fetch an entry's payload
    ///
    /// # Returns
    /// `Ok(None)` for a missing or expired entry; expired entries are left
    /// in place for `collect_garbage` unless the substrate removes them
    /// natively.
    async fn get(&self, identifier: &str) -> Result<Option<Vec<u8>>>;

    /// Whether a live (non-expired) entry exists
    ///
    /// Must not deserialize or transfer the payload.
    async fn has(&self, identifier: &str) -> Result<bool>;

    /// Remove an entry and its tag associations
    ///
    /// # Returns
    /// `Ok(false)` if the identifier did not exist; never an error for a
    /// missing entry.
    async fn remove(&self, identifier: &str) -> Result<bool>;

    /// Identifiers of all live entries tagged with `tag`
    ///
    /// Expired entries are excluded; stale index references are never
    /// returned.
    async fn find_identifiers_by_tag(&self, tag: &str) -> Result<BTreeSet<String>>;

    /// Remove every entry of this cache's identity and clear the frozen
    /// flag
    ///
    /// Entries of other identities sharing the substrate are untouched.
    /// This is the only mutating operation allowed on a frozen cache.
    async fn flush(&self) -> Result<()>;

    /// Remove every entry tagged with `tag`
    ///
    /// Operates on a snapshot of the tag index taken at call time.
    async fn flush_by_tag(&self, tag: &str) -> Result<()>;

    /// Eagerly remove expired entries
    ///
    /// Idempotent and safe to run concurrently with readers. A no-op on a
    /// frozen cache, whose entries are permanent.
    async fn collect_garbage(&self) -> Result<()>;

    /// Lazily enumerate all live `(identifier, payload)` pairs
    async fn entries(&self) -> Result<EntryStream>;

    /// One-way transition into the read-optimized frozen state
    ///
    /// Frozen entries are treated as never expiring. Not reversible except
    /// through `flush`.
    async fn freeze(&self) -> Result<()>;

    /// Whether this backend is currently frozen
    async fn is_frozen(&self) -> bool;
}
