//! Configuration loader tests

use std::io::Write;
use tagcache_infrastructure::config::{AppConfig, BackendKind, ConfigLoader};

#[test]
fn load_without_file_yields_defaults() {
    let loader = ConfigLoader::new()
        .with_config_path("/nonexistent/tagcache.toml")
        .with_env_prefix("TAGCACHE_TEST_UNSET_");
    let config: AppConfig = loader.load().unwrap();

    assert_eq!(config.cache.backend, BackendKind::Memory);
    assert_eq!(config.cache.identity, "Standard");
    assert_eq!(config.logging.level, "info");
}

#[test]
fn toml_file_overrides_defaults() {
    let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
    writeln!(
        file,
        r#"
[cache]
backend = "file"
identity = "PageCache"
default_lifetime = 3600

[logging]
level = "debug"
"#
    )
    .unwrap();

    let loader = ConfigLoader::new()
        .with_config_path(file.path())
        .with_env_prefix("TAGCACHE_TEST_UNSET_");
    let config = loader.load().unwrap();

    assert_eq!(config.cache.backend, BackendKind::File);
    assert_eq!(config.cache.identity, "PageCache");
    assert_eq!(config.cache.default_lifetime, 3600);
    assert_eq!(config.logging.level, "debug");
}

#[test]
fn unknown_keys_are_ignored() {
    let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
    writeln!(
        file,
        r#"
[cache]
identity = "Tolerant"
some_future_option = true
"#
    )
    .unwrap();

    let loader = ConfigLoader::new()
        .with_config_path(file.path())
        .with_env_prefix("TAGCACHE_TEST_UNSET_");
    let config = loader.load().unwrap();
    assert_eq!(config.cache.identity, "Tolerant");
}

#[test]
fn environment_overrides_file() {
    let mut file = tempfile::NamedTempFile::with_suffix(".toml").unwrap();
    writeln!(
        file,
        r#"
[cache]
identity = "FromFile"
"#
    )
    .unwrap();

    // prefix unique to this test, env is process-global
    unsafe {
        std::env::set_var("TAGCACHE_ENVTEST_CACHE__IDENTITY", "FromEnv");
    }
    let loader = ConfigLoader::new()
        .with_config_path(file.path())
        .with_env_prefix("TAGCACHE_ENVTEST_");
    let config = loader.load().unwrap();
    unsafe {
        std::env::remove_var("TAGCACHE_ENVTEST_CACHE__IDENTITY");
    }

    assert_eq!(config.cache.identity, "FromEnv");
}
