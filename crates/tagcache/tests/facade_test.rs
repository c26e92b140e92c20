//! End-to-end test through the facade

use tagcache::domain::ports::CacheBackend as _;
use tagcache::infrastructure::config::{BackendKind, CacheConfig};
use tagcache::{BackendFactory, CacheIdentity, TypedCache};

#[tokio::test]
async fn warm_up_freeze_and_serve() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = CacheConfig {
        backend: BackendKind::File,
        identity: "FacadeCache".to_string(),
        cache_directory: Some(dir.path().to_path_buf()),
        ..CacheConfig::default()
    };

    // warm up
    let cache = BackendFactory::create(&config).await.unwrap();
    cache
        .set("config/routes", b"route table", &["config".to_string()], None)
        .await
        .unwrap();
    cache
        .set("config/policies", b"policy table", &["config".to_string()], None)
        .await
        .unwrap();
    cache.freeze().await.unwrap();

    // serve from a second instance bound to the same directory
    let reader = BackendFactory::create(&config).await.unwrap();
    assert!(reader.is_frozen().await);
    assert_eq!(
        reader.get("config/routes").await.unwrap(),
        Some(b"route table".to_vec())
    );

    // cleanup restores write permissions
    reader.flush().await.unwrap();
}

#[tokio::test]
async fn typed_cache_over_the_factory() {
    let config = CacheConfig {
        identity: "FacadeTyped".to_string(),
        ..CacheConfig::default()
    };
    let backend = BackendFactory::create(&config).await.unwrap();
    let cache: TypedCache<Vec<String>> = TypedCache::new(backend);

    let value = vec!["a".to_string(), "b".to_string()];
    cache.set("list", &value, &[], None).await.unwrap();
    assert_eq!(cache.get("list").await.unwrap(), Some(value));
    assert_eq!(cache.identity(), &CacheIdentity::new("FacadeTyped").unwrap());
}
