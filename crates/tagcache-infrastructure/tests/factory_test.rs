//! Backend factory tests

use tagcache_domain::error::Error;
use tagcache_domain::ports::CacheBackend as _;
use tagcache_infrastructure::config::{BackendKind, CacheConfig};
use tagcache_infrastructure::factory::BackendFactory;

#[tokio::test]
async fn creates_a_memory_backend() {
    let config = CacheConfig {
        identity: "FactoryMemory".to_string(),
        ..CacheConfig::default()
    };
    let backend = BackendFactory::create(&config).await.unwrap();
    assert_eq!(backend.backend_name(), "memory");
    assert_eq!(backend.identity().as_str(), "FactoryMemory");

    backend.set("entry", b"payload", &[], None).await.unwrap();
    assert_eq!(backend.get("entry").await.unwrap(), Some(b"payload".to_vec()));
}

#[tokio::test]
async fn creates_a_file_backend_in_the_configured_directory() {
    let dir = tempfile::TempDir::new().unwrap();
    let config = CacheConfig {
        backend: BackendKind::File,
        identity: "FactoryFile".to_string(),
        cache_directory: Some(dir.path().to_path_buf()),
        ..CacheConfig::default()
    };
    let backend = BackendFactory::create(&config).await.unwrap();
    assert_eq!(backend.backend_name(), "file");

    backend.set("entry", b"payload", &[], None).await.unwrap();
    assert!(dir.path().join("Data").join("FactoryFile").join("entry").is_file());
}

#[tokio::test]
async fn rejects_invalid_identity() {
    let config = CacheConfig {
        identity: "not a valid identity".to_string(),
        ..CacheConfig::default()
    };
    let result = BackendFactory::create(&config).await;
    assert!(matches!(result, Err(Error::Configuration { .. })));
}

#[tokio::test]
async fn postgres_without_dsn_is_a_configuration_error() {
    let config = CacheConfig {
        backend: BackendKind::Postgres,
        identity: "FactoryPg".to_string(),
        ..CacheConfig::default()
    };
    let result = BackendFactory::create(&config).await;
    assert!(matches!(result, Err(Error::Configuration { .. })));
}

#[tokio::test]
async fn redis_without_servers_is_a_configuration_error() {
    let config = CacheConfig {
        backend: BackendKind::Redis,
        identity: "FactoryRedis".to_string(),
        ..CacheConfig::default()
    };
    let result = BackendFactory::create(&config).await;
    assert!(matches!(result, Err(Error::Configuration { .. })));
}
