//! Typed frontend wrapper
//!
//! A thin serialization layer over any backend: values are serialized to
//! JSON bytes before delegation and deserialized on the way out. The
//! wrapper consumes only the [`CacheBackend`] port, so every backend gets
//! the typed surface for free.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeSet;
use std::marker::PhantomData;
use std::sync::Arc;
use tagcache_domain::entry::CacheIdentity;
use tagcache_domain::error::{Error, Result};
use tagcache_domain::ports::CacheBackend;

/// Typed cache over an arbitrary backend
///
/// # Example
///
/// ```ignore
/// use tagcache_infrastructure::TypedCache;
///
/// let cache: TypedCache<Vec<String>> = TypedCache::new(backend);
/// cache.set("routes", &routes, &["routing".to_string()], None).await?;
/// let routes = cache.get("routes").await?;
/// ```
pub struct TypedCache<T> {
    backend: Arc<dyn CacheBackend>,
    _value: PhantomData<fn() -> T>,
}

impl<T> Clone for TypedCache<T> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            _value: PhantomData,
        }
    }
}

impl<T> TypedCache<T>
where
    T: Serialize + DeserializeOwned,
{
    /// Wrap a backend
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend,
            _value: PhantomData,
        }
    }

    /// The wrapped backend
    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    /// The identity of the wrapped backend
    pub fn identity(&self) -> &CacheIdentity {
        self.backend.identity()
    }

    /// Serialize and store a value
    pub async fn set(
        &self,
        identifier: &str,
        value: &T,
        tags: &[String],
        lifetime: Option<i64>,
    ) -> Result<()> {
        let payload = serde_json::to_vec(value)
            .map_err(|e| Error::invalid_data(format!("value cannot be serialized: {e}")))?;
        self.backend.set(identifier, &payload, tags, lifetime).await
    }

    /// Fetch and deserialize a value
    ///
    /// A payload that no longer deserializes into `T` is a caller bug
    /// (the identifier is shared between incompatible types) and surfaces
    /// as [`Error::InvalidData`].
    pub async fn get(&self, identifier: &str) -> Result<Option<T>> {
        match self.backend.get(identifier).await? {
            Some(payload) => {
                let value = serde_json::from_slice(&payload).map_err(|e| {
                    Error::invalid_data(format!("cached value cannot be deserialized: {e}"))
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Whether a live entry exists
    pub async fn has(&self, identifier: &str) -> Result<bool> {
        self.backend.has(identifier).await
    }

    /// Remove an entry
    pub async fn remove(&self, identifier: &str) -> Result<bool> {
        self.backend.remove(identifier).await
    }

    /// Identifiers of live entries carrying `tag`
    pub async fn find_identifiers_by_tag(&self, tag: &str) -> Result<BTreeSet<String>> {
        self.backend.find_identifiers_by_tag(tag).await
    }

    /// Remove every entry carrying `tag`
    pub async fn flush_by_tag(&self, tag: &str) -> Result<()> {
        self.backend.flush_by_tag(tag).await
    }

    /// Remove every entry of this cache
    pub async fn flush(&self) -> Result<()> {
        self.backend.flush().await
    }
}

impl<T> std::fmt::Debug for TypedCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedCache")
            .field("identity", self.backend.identity())
            .field("backend", &self.backend.backend_name())
            .finish()
    }
}
