//! PostgreSQL relational backend
//!
//! Row-per-entry storage with a row-per-(entry, tag) join table, sharing
//! one connection pool per backend instance. `set` is a transaction that
//! deletes the old tag rows, upserts the entry row, and inserts the new
//! tag rows, which gives the full-replace invariant; `flush` and
//! `flush_by_tag` are transactional across both tables. The tag index is
//! maintained on write and queried with a single join filtered by expiry.
//!
//! The pool is the synchronous `r2d2` stack; every query runs on a
//! blocking thread via `tokio::task::spawn_blocking` so the async
//! executor is never parked on database I/O.

use async_stream::try_stream;
use async_trait::async_trait;
use chrono::Utc;
use r2d2::{Pool, PooledConnection};
use r2d2_postgres::{PostgresConnectionManager, postgres::NoTls};
use std::collections::BTreeSet;
use tagcache_domain::entry::{CacheIdentity, resolve_expiry};
use tagcache_domain::error::{Error, Result};
use tagcache_domain::identifier::{validate_identifier, validate_tag};
use tagcache_domain::ports::{CacheBackend, EntryStream};
use tracing::{debug, info};

type PgPool = Pool<PostgresConnectionManager<NoTls>>;
type PgConnection = PooledConnection<PostgresConnectionManager<NoTls>>;

/// Default connection pool size
pub const DEFAULT_POOL_SIZE: u32 = 4;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS cache_entries (
    cache_identity TEXT NOT NULL,
    identifier TEXT NOT NULL,
    payload BYTEA NOT NULL,
    expires_at BIGINT,
    PRIMARY KEY (cache_identity, identifier)
);
CREATE TABLE IF NOT EXISTS cache_entry_tags (
    cache_identity TEXT NOT NULL,
    identifier TEXT NOT NULL,
    tag TEXT NOT NULL,
    PRIMARY KEY (cache_identity, identifier, tag)
);
CREATE INDEX IF NOT EXISTS cache_entry_tags_by_tag
    ON cache_entry_tags (cache_identity, tag);
CREATE TABLE IF NOT EXISTS cache_state (
    cache_identity TEXT PRIMARY KEY,
    frozen BOOLEAN NOT NULL DEFAULT FALSE
);
";

/// Relational cache backend over PostgreSQL
#[derive(Clone)]
pub struct PostgresBackend {
    identity: CacheIdentity,
    default_lifetime: u64,
    pool: PgPool,
}

impl PostgresBackend {
    /// Bind a backend to `identity` using a connection string
    /// (e.g. "host=localhost user=cache dbname=cache")
    pub async fn new(identity: CacheIdentity, data_source_name: &str) -> Result<Self> {
        Self::with_options(identity, data_source_name, 0, DEFAULT_POOL_SIZE).await
    }

    /// Bind with explicit default lifetime (seconds, `0` = unlimited) and
    /// pool size
    ///
    /// Fails fast when the server is unreachable or the schema cannot be
    /// prepared; no cache operation is attempted against a half-bound
    /// backend.
    pub async fn with_options(
        identity: CacheIdentity,
        data_source_name: &str,
        default_lifetime: u64,
        pool_size: u32,
    ) -> Result<Self> {
        let config: r2d2_postgres::postgres::Config =
            data_source_name.parse().map_err(|e| {
                Error::configuration_with_source("invalid PostgreSQL connection string", e)
            })?;
        let manager = PostgresConnectionManager::new(config, NoTls);

        let pool = tokio::task::spawn_blocking(move || {
            Pool::builder().max_size(pool_size).build(manager)
        })
        .await
        .map_err(|e| Error::substrate(format!("pool setup task failed: {e}")))?
        .map_err(|e| Error::configuration_with_source("cannot connect to PostgreSQL", e))?;

        let backend = Self {
            identity,
            default_lifetime,
            pool,
        };
        backend
            .with_conn(|conn| {
                conn.batch_execute(SCHEMA)
                    .map_err(|e| Error::configuration_with_source("cannot prepare cache schema", e))
            })
            .await?;
        info!(identity = %backend.identity, "bound PostgreSQL cache backend");
        Ok(backend)
    }

    /// Run a closure against a pooled connection on a blocking thread
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut PgConnection) -> Result<T> + Send + 'static,
    {
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = pool
                .get()
                .map_err(|e| Error::substrate_with_source("cannot get pooled connection", e))?;
            f(&mut conn)
        })
        .await
        .map_err(|e| Error::substrate(format!("database task failed: {e}")))?
    }

    fn frozen_in(conn: &mut PgConnection, identity: &str) -> Result<bool> {
        let row = conn
            .query_opt(
                "SELECT frozen FROM cache_state WHERE cache_identity = $1",
                &[&identity],
            )
            .map_err(|e| Error::substrate_with_source("frozen flag query failed", e))?;
        Ok(row.map(|row| row.get::<_, bool>(0)).unwrap_or(false))
    }

    fn reject_if_frozen_in(
        conn: &mut PgConnection,
        identity: &str,
        operation: &'static str,
    ) -> Result<()> {
        if Self::frozen_in(conn, identity)? {
            return Err(Error::frozen(identity, operation));
        }
        Ok(())
    }

    fn now_secs() -> i64 {
        Utc::now().timestamp()
    }
}

#[async_trait]
impl CacheBackend for PostgresBackend {
    fn identity(&self) -> &CacheIdentity {
        &self.identity
    }

    fn backend_name(&self) -> &str {
        "postgres"
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
        let identity = self.identity.as_str().to_string();
        let identifier = identifier.to_string();
        let payload = payload.to_vec();
        let tags: Vec<String> = tags.to_vec();
        let expires_at = resolve_expiry(lifetime, self.default_lifetime, Utc::now())
            .map(|t| t.timestamp());

        self.with_conn(move |conn| {
            Self::reject_if_frozen_in(conn, &identity, "set")?;
            let mut tx = conn
                .transaction()
                .map_err(|e| Error::substrate_with_source("cannot start transaction", e))?;
            tx.execute(
                "DELETE FROM cache_entry_tags WHERE cache_identity = $1 AND identifier = $2",
                &[&identity, &identifier],
            )
            .map_err(|e| Error::substrate_with_source("tag cleanup failed", e))?;
            tx.execute(
                "INSERT INTO cache_entries (cache_identity, identifier, payload, expires_at)
                 VALUES ($1, $2, $3, $4)
                 ON CONFLICT (cache_identity, identifier)
                 DO UPDATE SET payload = EXCLUDED.payload, expires_at = EXCLUDED.expires_at",
                &[&identity, &identifier, &payload, &expires_at],
            )
            .map_err(|e| Error::substrate_with_source("entry upsert failed", e))?;
            for tag in &tags {
                tx.execute(
                    "INSERT INTO cache_entry_tags (cache_identity, identifier, tag)
                     VALUES ($1, $2, $3) ON CONFLICT DO NOTHING",
                    &[&identity, &identifier, tag],
                )
                .map_err(|e| Error::substrate_with_source("tag insert failed", e))?;
            }
            tx.commit()
                .map_err(|e| Error::substrate_with_source("set transaction failed", e))
        })
        .await
    }

    async fn get(&self, identifier: &str) -> Result<Option<Vec<u8>>> {
        validate_identifier(identifier)?;
        let identity = self.identity.as_str().to_string();
        let identifier = identifier.to_string();
        self.with_conn(move |conn| {
            let frozen = Self::frozen_in(conn, &identity)?;
            let row = conn
                .query_opt(
                    "SELECT payload, expires_at FROM cache_entries
                     WHERE cache_identity = $1 AND identifier = $2",
                    &[&identity, &identifier],
                )
                .map_err(|e| Error::substrate_with_source("entry query failed", e))?;
            Ok(row.and_then(|row| {
                let expires_at: Option<i64> = row.get(1);
                if !frozen && expires_at.is_some_and(|t| t <= Self::now_secs()) {
                    None
                } else {
                    Some(row.get::<_, Vec<u8>>(0))
                }
            }))
        })
        .await
    }

    async fn has(&self, identifier: &str) -> Result<bool> {
        validate_identifier(identifier)?;
        let identity = self.identity.as_str().to_string();
        let identifier = identifier.to_string();
        // expiry only, the payload column is never transferred
        self.with_conn(move |conn| {
            let frozen = Self::frozen_in(conn, &identity)?;
            let row = conn
                .query_opt(
                    "SELECT expires_at FROM cache_entries
                     WHERE cache_identity = $1 AND identifier = $2",
                    &[&identity, &identifier],
                )
                .map_err(|e| Error::substrate_with_source("entry query failed", e))?;
            Ok(row.is_some_and(|row| {
                let expires_at: Option<i64> = row.get(0);
                frozen || expires_at.is_none_or(|t| t > Self::now_secs())
            }))
        })
        .await
    }

    async fn remove(&self, identifier: &str) -> Result<bool> {
        validate_identifier(identifier)?;
        let identity = self.identity.as_str().to_string();
        let identifier = identifier.to_string();
        self.with_conn(move |conn| {
            Self::reject_if_frozen_in(conn, &identity, "remove")?;
            let mut tx = conn
                .transaction()
                .map_err(|e| Error::substrate_with_source("cannot start transaction", e))?;
            tx.execute(
                "DELETE FROM cache_entry_tags WHERE cache_identity = $1 AND identifier = $2",
                &[&identity, &identifier],
            )
            .map_err(|e| Error::substrate_with_source("tag delete failed", e))?;
            let removed = tx
                .execute(
                    "DELETE FROM cache_entries WHERE cache_identity = $1 AND identifier = $2",
                    &[&identity, &identifier],
                )
                .map_err(|e| Error::substrate_with_source("entry delete failed", e))?;
            tx.commit()
                .map_err(|e| Error::substrate_with_source("remove transaction failed", e))?;
            Ok(removed > 0)
        })
        .await
    }

    async fn find_identifiers_by_tag(&self, tag: &str) -> Result<BTreeSet<String>> {
        validate_tag(tag)?;
        let identity = self.identity.as_str().to_string();
        let tag = tag.to_string();
        self.with_conn(move |conn| {
            let frozen = Self::frozen_in(conn, &identity)?;
            let rows = conn
                .query(
                    "SELECT t.identifier FROM cache_entry_tags t
                     JOIN cache_entries e
                       ON e.cache_identity = t.cache_identity
                      AND e.identifier = t.identifier
                     WHERE t.cache_identity = $1 AND t.tag = $2
                       AND ($3 OR e.expires_at IS NULL OR e.expires_at > $4)",
                    &[&identity, &tag, &frozen, &Self::now_secs()],
                )
                .map_err(|e| Error::substrate_with_source("tag query failed", e))?;
            Ok(rows.iter().map(|row| row.get(0)).collect())
        })
        .await
    }

    async fn flush(&self) -> Result<()> {
        let identity = self.identity.as_str().to_string();
        self.with_conn(move |conn| {
            let mut tx = conn
                .transaction()
                .map_err(|e| Error::substrate_with_source("cannot start transaction", e))?;
            tx.execute(
                "DELETE FROM cache_entry_tags WHERE cache_identity = $1",
                &[&identity],
            )
            .map_err(|e| Error::substrate_with_source("tag flush failed", e))?;
            let removed = tx
                .execute(
                    "DELETE FROM cache_entries WHERE cache_identity = $1",
                    &[&identity],
                )
                .map_err(|e| Error::substrate_with_source("entry flush failed", e))?;
            tx.execute(
                "DELETE FROM cache_state WHERE cache_identity = $1",
                &[&identity],
            )
            .map_err(|e| Error::substrate_with_source("state reset failed", e))?;
            tx.commit()
                .map_err(|e| Error::substrate_with_source("flush transaction failed", e))?;
            info!(identity = %identity, removed, "flushed PostgreSQL cache");
            Ok(())
        })
        .await
    }

    async fn flush_by_tag(&self, tag: &str) -> Result<()> {
        validate_tag(tag)?;
        let identity = self.identity.as_str().to_string();
        let tag = tag.to_string();
        self.with_conn(move |conn| {
            Self::reject_if_frozen_in(conn, &identity, "flushByTag")?;
            let mut tx = conn
                .transaction()
                .map_err(|e| Error::substrate_with_source("cannot start transaction", e))?;
            // snapshot the tagged identifiers, then delete across both tables
            let identifiers: Vec<String> = tx
                .query(
                    "SELECT identifier FROM cache_entry_tags
                     WHERE cache_identity = $1 AND tag = $2",
                    &[&identity, &tag],
                )
                .map_err(|e| Error::substrate_with_source("tag query failed", e))?
                .iter()
                .map(|row| row.get(0))
                .collect();
            tx.execute(
                "DELETE FROM cache_entry_tags
                 WHERE cache_identity = $1 AND identifier = ANY($2)",
                &[&identity, &identifiers],
            )
            .map_err(|e| Error::substrate_with_source("tag delete failed", e))?;
            tx.execute(
                "DELETE FROM cache_entries
                 WHERE cache_identity = $1 AND identifier = ANY($2)",
                &[&identity, &identifiers],
            )
            .map_err(|e| Error::substrate_with_source("entry delete failed", e))?;
            tx.commit()
                .map_err(|e| Error::substrate_with_source("flushByTag transaction failed", e))?;
            debug!(identity = %identity, tag, removed = identifiers.len(), "flushed by tag");
            Ok(())
        })
        .await
    }

    async fn collect_garbage(&self) -> Result<()> {
        let identity = self.identity.as_str().to_string();
        self.with_conn(move |conn| {
            if Self::frozen_in(conn, &identity)? {
                // frozen entries are permanent, nothing to collect
                return Ok(());
            }
            let now = Self::now_secs();
            let mut tx = conn
                .transaction()
                .map_err(|e| Error::substrate_with_source("cannot start transaction", e))?;
            tx.execute(
                "DELETE FROM cache_entry_tags WHERE cache_identity = $1 AND identifier IN (
                     SELECT identifier FROM cache_entries
                     WHERE cache_identity = $1 AND expires_at IS NOT NULL AND expires_at <= $2
                 )",
                &[&identity, &now],
            )
            .map_err(|e| Error::substrate_with_source("expired tag delete failed", e))?;
            let removed = tx
                .execute(
                    "DELETE FROM cache_entries
                     WHERE cache_identity = $1 AND expires_at IS NOT NULL AND expires_at <= $2",
                    &[&identity, &now],
                )
                .map_err(|e| Error::substrate_with_source("expired entry delete failed", e))?;
            tx.commit()
                .map_err(|e| Error::substrate_with_source("garbage collection failed", e))?;
            if removed > 0 {
                debug!(identity = %identity, removed, "collected expired entries");
            }
            Ok(())
        })
        .await
    }

    async fn entries(&self) -> Result<EntryStream> {
        let identity = self.identity.as_str().to_string();
        let identifiers: Vec<String> = self
            .with_conn(move |conn| {
                let frozen = Self::frozen_in(conn, &identity)?;
                let rows = conn
                    .query(
                        "SELECT identifier FROM cache_entries
                         WHERE cache_identity = $1
                           AND ($2 OR expires_at IS NULL OR expires_at > $3)
                         ORDER BY identifier",
                        &[&identity, &frozen, &Self::now_secs()],
                    )
                    .map_err(|e| Error::substrate_with_source("entry listing failed", e))?;
                Ok(rows.iter().map(|row| row.get(0)).collect())
            })
            .await?;

        let backend = self.clone();
        let stream = try_stream! {
            for identifier in identifiers {
                // fetch lazily; entries removed mid-iteration are skipped
                if let Some(payload) = backend.get(&identifier).await? {
                    yield (identifier, payload);
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn freeze(&self) -> Result<()> {
        let identity = self.identity.as_str().to_string();
        self.with_conn(move |conn| {
            Self::reject_if_frozen_in(conn, &identity, "freeze")?;
            conn.execute(
                "INSERT INTO cache_state (cache_identity, frozen) VALUES ($1, TRUE)
                 ON CONFLICT (cache_identity) DO UPDATE SET frozen = TRUE",
                &[&identity],
            )
            .map_err(|e| Error::substrate_with_source("cannot persist frozen flag", e))?;
            info!(identity = %identity, "froze PostgreSQL cache");
            Ok(())
        })
        .await
    }

    async fn is_frozen(&self) -> bool {
        let identity = self.identity.as_str().to_string();
        self.with_conn(move |conn| Self::frozen_in(conn, &identity))
            .await
            .unwrap_or(false)
    }
}

impl std::fmt::Debug for PostgresBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresBackend")
            .field("identity", &self.identity)
            .field("pool_size", &self.pool.max_size())
            .finish()
    }
}
