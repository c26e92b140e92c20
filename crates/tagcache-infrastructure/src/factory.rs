//! Backend construction from configuration
//!
//! The factory performs the one-time binding step: it validates the
//! configuration, constructs the selected backend, and lets bind-time
//! faults (unwritable directory, unreachable server, missing required
//! option) surface immediately as configuration errors, before any cache
//! operation is attempted.

use crate::config::{BackendKind, CacheConfig};
use std::sync::Arc;
use tagcache_backends::{FileBackend, MemoryBackend, PostgresBackend, RedisBackend};
use tagcache_domain::entry::CacheIdentity;
use tagcache_domain::error::{Error, Result};
use tagcache_domain::ports::CacheBackend;
use tracing::debug;
use validator::Validate;

/// Factory creating bound cache backends from [`CacheConfig`]
pub struct BackendFactory;

impl BackendFactory {
    /// Create a backend from configuration
    pub async fn create(config: &CacheConfig) -> Result<Arc<dyn CacheBackend>> {
        config
            .validate()
            .map_err(|e| Error::configuration_with_source("invalid cache configuration", e))?;
        let identity = CacheIdentity::new(&config.identity)?;
        debug!(backend = ?config.backend, identity = %identity, "creating cache backend");

        let backend: Arc<dyn CacheBackend> = match config.backend {
            BackendKind::Memory => Arc::new(MemoryBackend::with_default_lifetime(
                identity,
                config.default_lifetime,
            )),
            BackendKind::File => Arc::new(
                FileBackend::with_options(
                    identity,
                    config.effective_cache_directory(),
                    config.payload_kind,
                    config.default_lifetime,
                )
                .await?,
            ),
            BackendKind::Postgres => {
                let data_source_name = config.data_source_name.as_deref().ok_or_else(|| {
                    Error::configuration("the postgres backend requires data_source_name")
                })?;
                Arc::new(
                    PostgresBackend::with_options(
                        identity,
                        data_source_name,
                        config.default_lifetime,
                        tagcache_backends::postgres::DEFAULT_POOL_SIZE,
                    )
                    .await?,
                )
            }
            BackendKind::Redis => Arc::new(
                RedisBackend::from_servers(identity, &config.servers, config.default_lifetime)
                    .await?,
            ),
        };
        Ok(backend)
    }
}
