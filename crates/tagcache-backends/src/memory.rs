//! In-memory reference backend
//!
//! Reference semantics for the cache contract, backed by process-local
//! maps: an identifier-to-entry map, an insertion-order list, and a tag
//! index maintained incrementally on every `set`/`remove`. All operations
//! are O(1) amortized except the tag operations, which are linear in the
//! number of entries carrying the tag.
//!
//! The backend is process-local; the maps are protected by an `RwLock`
//! against concurrent tasks within one process. Nothing is shared across
//! processes and nothing survives process exit. Freeze is purely logical
//! here: the flag is honored but there is no substrate state to protect.

use async_stream::try_stream;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};
use tagcache_domain::entry::{CacheEntry, CacheIdentity, resolve_expiry};
use tagcache_domain::error::{Error, Result};
use tagcache_domain::identifier::{validate_identifier, validate_tag};
use tagcache_domain::ports::{CacheBackend, EntryStream};
use tracing::{debug, info};

/// Process-local in-memory cache backend
#[derive(Clone)]
pub struct MemoryBackend {
    identity: CacheIdentity,
    default_lifetime: u64,
    store: Arc<RwLock<MemoryStore>>,
}

#[derive(Default)]
struct MemoryStore {
    entries: HashMap<String, CacheEntry>,
    /// Identifiers in first-insertion order; overwrites keep the original
    /// position
    order: Vec<String>,
    tag_index: HashMap<String, BTreeSet<String>>,
    frozen: bool,
}

impl MemoryStore {
    fn unlink(&mut self, identifier: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(identifier)?;
        self.order.retain(|id| id != identifier);
        for tag in &entry.tags {
            if let Some(ids) = self.tag_index.get_mut(tag) {
                ids.remove(identifier);
                if ids.is_empty() {
                    self.tag_index.remove(tag);
                }
            }
        }
        Some(entry)
    }
}

impl MemoryBackend {
    /// Create a backend bound to `identity` with no default lifetime
    /// (entries live until removed)
    pub fn new(identity: CacheIdentity) -> Self {
        Self::with_default_lifetime(identity, 0)
    }

    /// Create a backend bound to `identity` with a default entry lifetime
    /// in seconds (`0` = unlimited)
    pub fn with_default_lifetime(identity: CacheIdentity, default_lifetime: u64) -> Self {
        Self {
            identity,
            default_lifetime,
            store: Arc::new(RwLock::new(MemoryStore::default())),
        }
    }

    fn store(&self) -> std::sync::RwLockReadGuard<'_, MemoryStore> {
        self.store.read().unwrap_or_else(|e| e.into_inner())
    }

    fn store_mut(&self) -> std::sync::RwLockWriteGuard<'_, MemoryStore> {
        self.store.write().unwrap_or_else(|e| e.into_inner())
    }

    fn reject_if_frozen(&self, operation: &'static str) -> Result<()> {
        if self.store().frozen {
            return Err(Error::frozen(self.identity.as_str(), operation));
        }
        Ok(())
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn identity(&self) -> &CacheIdentity {
        &self.identity
    }

    fn backend_name(&self) -> &str {
        "memory"
    }

    fn supports_physical_freeze(&self) -> bool {
        false
    }

    async fn set(
        &self,
        identifier: &str,
        payload: &[u8],
        tags: &[String],
        lifetime: Option<i64>,
    ) -> Result<()> {
        validate_identifier(identifier)?;
        for tag in tags {
            validate_tag(tag)?;
        }
        self.reject_if_frozen("set")?;

        let entry = CacheEntry {
            identifier: identifier.to_string(),
            payload: payload.to_vec(),
            tags: tags.iter().cloned().collect(),
            expires_at: resolve_expiry(lifetime, self.default_lifetime, Utc::now()),
        };

        let mut store = self.store_mut();
        // overwrites keep the original insertion position
        let previous_position = store.order.iter().position(|id| id == identifier);
        store.unlink(identifier);
        match previous_position {
            Some(position) => store.order.insert(position, identifier.to_string()),
            None => store.order.push(identifier.to_string()),
        }
        for tag in &entry.tags {
            store
                .tag_index
                .entry(tag.clone())
                .or_default()
                .insert(identifier.to_string());
        }
        store.entries.insert(identifier.to_string(), entry);
        Ok(())
    }

    async fn get(&self, identifier: &str) -> Result<Option<Vec<u8>>> {
        validate_identifier(identifier)?;
        let store = self.store();
        match store.entries.get(identifier) {
            Some(entry) if store.frozen || !entry.is_expired(Utc::now()) => {
                Ok(Some(entry.payload.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn has(&self, identifier: &str) -> Result<bool> {
        validate_identifier(identifier)?;
        let store = self.store();
        Ok(match store.entries.get(identifier) {
            Some(entry) => store.frozen || !entry.is_expired(Utc::now()),
            None => false,
        })
    }

    async fn remove(&self, identifier: &str) -> Result<bool> {
        validate_identifier(identifier)?;
        self.reject_if_frozen("remove")?;
        Ok(self.store_mut().unlink(identifier).is_some())
    }

    async fn find_identifiers_by_tag(&self, tag: &str) -> Result<BTreeSet<String>> {
        validate_tag(tag)?;
        let store = self.store();
        let now = Utc::now();
        let Some(ids) = store.tag_index.get(tag) else {
            return Ok(BTreeSet::new());
        };
        Ok(ids
            .iter()
            .filter(|id| {
                store
                    .entries
                    .get(*id)
                    .is_some_and(|entry| store.frozen || !entry.is_expired(now))
            })
            .cloned()
            .collect())
    }

    async fn flush(&self) -> Result<()> {
        let mut store = self.store_mut();
        let removed = store.entries.len();
        *store = MemoryStore::default();
        info!(identity = %self.identity, removed, "flushed memory cache");
        Ok(())
    }

    async fn flush_by_tag(&self, tag: &str) -> Result<()> {
        validate_tag(tag)?;
        self.reject_if_frozen("flushByTag")?;
        // snapshot at call time, not a live cursor
        let identifiers = self.find_identifiers_by_tag(tag).await?;
        let mut store = self.store_mut();
        for identifier in &identifiers {
            store.unlink(identifier);
        }
        debug!(identity = %self.identity, tag, removed = identifiers.len(), "flushed by tag");
        Ok(())
    }

    async fn collect_garbage(&self) -> Result<()> {
        let mut store = self.store_mut();
        if store.frozen {
            // frozen entries are permanent, nothing to collect
            return Ok(());
        }
        let now = Utc::now();
        let expired: Vec<String> = store
            .entries
            .values()
            .filter(|entry| entry.is_expired(now))
            .map(|entry| entry.identifier.clone())
            .collect();
        for identifier in &expired {
            store.unlink(identifier);
        }
        if !expired.is_empty() {
            debug!(identity = %self.identity, removed = expired.len(), "collected expired entries");
        }
        Ok(())
    }

    async fn entries(&self) -> Result<EntryStream> {
        let snapshot: Vec<String> = self.store().order.clone();
        let store = Arc::clone(&self.store);
        let stream = try_stream! {
            for identifier in snapshot {
                // re-check liveness at yield time; entries removed or
                // expired mid-iteration are skipped
                let item = {
                    let store = store.read().unwrap_or_else(|e| e.into_inner());
                    store.entries.get(&identifier).and_then(|entry| {
                        if store.frozen || !entry.is_expired(Utc::now()) {
                            Some((identifier.clone(), entry.payload.clone()))
                        } else {
                            None
                        }
                    })
                };
                if let Some(pair) = item {
                    yield pair;
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn freeze(&self) -> Result<()> {
        let mut store = self.store_mut();
        if store.frozen {
            return Err(Error::frozen(self.identity.as_str(), "freeze"));
        }
        store.frozen = true;
        info!(identity = %self.identity, entries = store.entries.len(), "froze memory cache");
        Ok(())
    }

    async fn is_frozen(&self) -> bool {
        self.store().frozen
    }
}

impl std::fmt::Debug for MemoryBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let store = self.store();
        f.debug_struct("MemoryBackend")
            .field("identity", &self.identity)
            .field("entries", &store.entries.len())
            .field("frozen", &store.frozen)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> MemoryBackend {
        MemoryBackend::new(CacheIdentity::new("UnitTestCache").unwrap())
    }

    #[tokio::test]
    async fn overwrite_keeps_insertion_position() {
        use futures::TryStreamExt;

        let cache = backend();
        cache.set("first", b"1", &[], None).await.unwrap();
        cache.set("second", b"2", &[], None).await.unwrap();
        cache.set("first", b"1b", &[], None).await.unwrap();

        let pairs: Vec<(String, Vec<u8>)> = cache.entries().await.unwrap().try_collect().await.unwrap();
        let ids: Vec<&str> = pairs.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, ["first", "second"]);
        assert_eq!(pairs[0].1, b"1b");
    }

    #[tokio::test]
    async fn tag_index_drops_empty_tags() {
        let cache = backend();
        cache
            .set("entry", b"x", &["only".to_string()], None)
            .await
            .unwrap();
        assert!(cache.remove("entry").await.unwrap());
        assert!(
            cache
                .find_identifiers_by_tag("only")
                .await
                .unwrap()
                .is_empty()
        );
    }
}
