//! Typed frontend wrapper tests

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tagcache_backends::MemoryBackend;
use tagcache_domain::entry::CacheIdentity;
use tagcache_domain::error::Error;
use tagcache_domain::ports::CacheBackend;
use tagcache_infrastructure::TypedCache;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Route {
    pattern: String,
    priority: u32,
}

fn typed_cache<T: Serialize + serde::de::DeserializeOwned>() -> TypedCache<T> {
    let backend = MemoryBackend::new(CacheIdentity::new("TypedTestCache").unwrap());
    TypedCache::new(Arc::new(backend))
}

#[tokio::test]
async fn round_trips_typed_values() {
    let cache: TypedCache<Route> = typed_cache();
    let route = Route {
        pattern: "/articles/{id}".to_string(),
        priority: 10,
    };

    cache
        .set("main_route", &route, &["routing".to_string()], None)
        .await
        .unwrap();

    assert_eq!(cache.get("main_route").await.unwrap(), Some(route));
    assert!(cache.has("main_route").await.unwrap());
    assert!(
        cache
            .find_identifiers_by_tag("routing")
            .await
            .unwrap()
            .contains("main_route")
    );
}

#[tokio::test]
async fn miss_is_none_not_an_error() {
    let cache: TypedCache<Route> = typed_cache();
    assert_eq!(cache.get("missing").await.unwrap(), None);
}

#[tokio::test]
async fn incompatible_payload_surfaces_as_invalid_data() {
    let backend = Arc::new(MemoryBackend::new(
        CacheIdentity::new("TypedTestCache").unwrap(),
    ));
    backend.set("entry", b"not json", &[], None).await.unwrap();

    let cache: TypedCache<Route> = TypedCache::new(backend);
    assert!(matches!(
        cache.get("entry").await,
        Err(Error::InvalidData { .. })
    ));
}

#[tokio::test]
async fn flush_by_tag_reaches_the_backend() {
    let cache: TypedCache<u32> = typed_cache();
    cache.set("keep", &1, &[], None).await.unwrap();
    cache.set("drop", &2, &["stale".to_string()], None).await.unwrap();

    cache.flush_by_tag("stale").await.unwrap();

    assert!(cache.has("keep").await.unwrap());
    assert!(!cache.has("drop").await.unwrap());
}
