//! Redis remote key-value backend
//!
//! Delegates expiry to the substrate: the entry key carries a native TTL
//! set at write time, so no manual expiry bookkeeping exists for this
//! backend and `collect_garbage` only prunes index sets whose entries
//! have already expired away.
//!
//! ## Key scheme
//!
//! | Key | Contents |
//! |-----|----------|
//! | `<identity>:entry:<id>` | payload, TTL-bearing |
//! | `<identity>:tags:<id>` | the entry's own tag set, same TTL |
//! | `<identity>:tag:<t>` | identifiers tagged with `t` |
//! | `<identity>:entries` | master identifier set |
//! | `<identity>:tagindex` | master tag set |
//! | `<identity>:frozen` | frozen flag |
//!
//! `flush` deletes exactly the keys reachable from the master sets; it
//! never issues `FLUSHDB`, so other identities sharing the server are
//! untouched. Freezing persists the flag key and strips the TTL from
//! every entry with `PERSIST`, so a frozen snapshot cannot silently
//! expire.

use async_stream::try_stream;
use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use std::collections::BTreeSet;
use tagcache_domain::entry::{CacheIdentity, resolve_expiry};
use tagcache_domain::error::{Error, Result};
use tagcache_domain::identifier::{validate_identifier, validate_tag};
use tagcache_domain::ports::{CacheBackend, EntryStream};
use tracing::{debug, info};

/// Distributed cache backend over a Redis server
#[derive(Clone)]
pub struct RedisBackend {
    identity: CacheIdentity,
    default_lifetime: u64,
    connection: ConnectionManager,
}

impl RedisBackend {
    /// Bind a backend to `identity` using a Redis connection URL
    /// (e.g. "redis://localhost:6379")
    ///
    /// The connection handshake happens here; an unreachable server is a
    /// bind-time configuration error, not a per-call fault.
    pub async fn new(identity: CacheIdentity, connection_url: &str) -> Result<Self> {
        Self::with_options(identity, connection_url, 0).await
    }

    /// Bind using the first entry of a `host:port` server list
    pub async fn from_servers(
        identity: CacheIdentity,
        servers: &[String],
        default_lifetime: u64,
    ) -> Result<Self> {
        let server = servers.first().ok_or_else(|| {
            Error::configuration("the Redis backend requires at least one server")
        })?;
        let url = if server.contains("://") {
            server.clone()
        } else {
            format!("redis://{server}")
        };
        Self::with_options(identity, &url, default_lifetime).await
    }

    /// Bind with an explicit default lifetime (seconds, `0` = unlimited)
    pub async fn with_options(
        identity: CacheIdentity,
        connection_url: &str,
        default_lifetime: u64,
    ) -> Result<Self> {
        let client = Client::open(connection_url).map_err(|e| {
            Error::configuration_with_source("failed to create Redis client", e)
        })?;
        let connection = ConnectionManager::new(client).await.map_err(|e| {
            Error::configuration_with_source("cannot connect to Redis server", e)
        })?;
        info!(identity = %identity, "bound Redis cache backend");
        Ok(Self {
            identity,
            default_lifetime,
            connection,
        })
    }

    fn entry_key(&self, identifier: &str) -> String {
        format!("{}:entry:{identifier}", self.identity)
    }

    fn entry_tags_key(&self, identifier: &str) -> String {
        format!("{}:tags:{identifier}", self.identity)
    }

    fn tag_key(&self, tag: &str) -> String {
        format!("{}:tag:{tag}", self.identity)
    }

    fn entries_key(&self) -> String {
        format!("{}:entries", self.identity)
    }

    fn tag_index_key(&self) -> String {
        format!("{}:tagindex", self.identity)
    }

    fn frozen_key(&self) -> String {
        format!("{}:frozen", self.identity)
    }

    async fn reject_if_frozen(
        &self,
        conn: &mut ConnectionManager,
        operation: &'static str,
    ) -> Result<()> {
        let frozen: bool = conn
            .exists(self.frozen_key())
            .await
            .map_err(|e| Error::substrate_with_source("Redis EXISTS failed", e))?;
        if frozen {
            return Err(Error::frozen(self.identity.as_str(), operation));
        }
        Ok(())
    }

    /// TTL in whole seconds for a resolved expiry; `None` for no TTL,
    /// `Some(0)` for an entry that is already expired on arrival
    fn ttl_seconds(&self, lifetime: Option<i64>) -> Option<u64> {
        let now = Utc::now();
        resolve_expiry(lifetime, self.default_lifetime, now)
            .map(|expires_at| (expires_at - now).num_seconds().max(0) as u64)
    }

    /// Delete an entry and its index bookkeeping
    async fn unlink_entry(&self, conn: &mut ConnectionManager, identifier: &str) -> Result<bool> {
        let old_tags: Vec<String> = conn
            .smembers(self.entry_tags_key(identifier))
            .await
            .map_err(|e| Error::substrate_with_source("Redis SMEMBERS failed", e))?;
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.del(self.entry_key(identifier));
        pipe.del(self.entry_tags_key(identifier)).ignore();
        pipe.srem(self.entries_key(), identifier).ignore();
        for tag in &old_tags {
            pipe.srem(self.tag_key(tag), identifier).ignore();
        }
        let (removed,): (i64,) = pipe
            .query_async(conn)
            .await
            .map_err(|e| Error::substrate_with_source("Redis DEL failed", e))?;
        Ok(removed > 0)
    }
}

#[async_trait]
impl CacheBackend for RedisBackend {
    fn identity(&self) -> &CacheIdentity {
        &self.identity
    }

    fn backend_name(&self) -> &str {
        "redis"
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
        let mut conn = self.connection.clone();
        self.reject_if_frozen(&mut conn, "set").await?;

        let ttl = self.ttl_seconds(lifetime);
        if ttl == Some(0) {
            // expired on arrival: drop any previous entry, store nothing
            self.unlink_entry(&mut conn, identifier).await?;
            return Ok(());
        }

        let old_tags: Vec<String> = conn
            .smembers(self.entry_tags_key(identifier))
            .await
            .map_err(|e| Error::substrate_with_source("Redis SMEMBERS failed", e))?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        match ttl {
            Some(seconds) => {
                pipe.set_ex(self.entry_key(identifier), payload, seconds).ignore();
            }
            None => {
                pipe.set(self.entry_key(identifier), payload).ignore();
            }
        }
        // tag associations are replaced wholesale
        for tag in old_tags.iter().filter(|t| !tags.contains(*t)) {
            pipe.srem(self.tag_key(tag), identifier).ignore();
        }
        pipe.del(self.entry_tags_key(identifier)).ignore();
        if !tags.is_empty() {
            pipe.sadd(self.entry_tags_key(identifier), tags).ignore();
            if let Some(seconds) = ttl {
                pipe.expire(self.entry_tags_key(identifier), seconds as i64)
                    .ignore();
            }
            pipe.sadd(self.tag_index_key(), tags).ignore();
            for tag in tags {
                pipe.sadd(self.tag_key(tag), identifier).ignore();
            }
        }
        pipe.sadd(self.entries_key(), identifier).ignore();
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::substrate_with_source("Redis SET pipeline failed", e))?;
        Ok(())
    }

    async fn get(&self, identifier: &str) -> Result<Option<Vec<u8>>> {
        validate_identifier(identifier)?;
        let mut conn = self.connection.clone();
        conn.get(self.entry_key(identifier))
            .await
            .map_err(|e| Error::substrate_with_source("Redis GET failed", e))
    }

    async fn has(&self, identifier: &str) -> Result<bool> {
        validate_identifier(identifier)?;
        let mut conn = self.connection.clone();
        conn.exists(self.entry_key(identifier))
            .await
            .map_err(|e| Error::substrate_with_source("Redis EXISTS failed", e))
    }

    async fn remove(&self, identifier: &str) -> Result<bool> {
        validate_identifier(identifier)?;
        let mut conn = self.connection.clone();
        self.reject_if_frozen(&mut conn, "remove").await?;
        self.unlink_entry(&mut conn, identifier).await
    }

    async fn find_identifiers_by_tag(&self, tag: &str) -> Result<BTreeSet<String>> {
        validate_tag(tag)?;
        let mut conn = self.connection.clone();
        let members: Vec<String> = conn
            .smembers(self.tag_key(tag))
            .await
            .map_err(|e| Error::substrate_with_source("Redis SMEMBERS failed", e))?;
        if members.is_empty() {
            return Ok(BTreeSet::new());
        }
        // exclude identifiers whose entry key has already expired away
        let mut pipe = redis::pipe();
        for member in &members {
            pipe.exists(self.entry_key(member));
        }
        let alive: Vec<bool> = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::substrate_with_source("Redis EXISTS pipeline failed", e))?;
        Ok(members
            .into_iter()
            .zip(alive)
            .filter_map(|(member, alive)| alive.then_some(member))
            .collect())
    }

    async fn flush(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        let identifiers: Vec<String> = conn
            .smembers(self.entries_key())
            .await
            .map_err(|e| Error::substrate_with_source("Redis SMEMBERS failed", e))?;
        let tags: Vec<String> = conn
            .smembers(self.tag_index_key())
            .await
            .map_err(|e| Error::substrate_with_source("Redis SMEMBERS failed", e))?;

        // delete exactly this identity's keys, never FLUSHDB
        let mut pipe = redis::pipe();
        pipe.atomic();
        for identifier in &identifiers {
            pipe.del(self.entry_key(identifier)).ignore();
            pipe.del(self.entry_tags_key(identifier)).ignore();
        }
        for tag in &tags {
            pipe.del(self.tag_key(tag)).ignore();
        }
        pipe.del(self.entries_key()).ignore();
        pipe.del(self.tag_index_key()).ignore();
        pipe.del(self.frozen_key()).ignore();
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::substrate_with_source("Redis flush pipeline failed", e))?;
        info!(identity = %self.identity, removed = identifiers.len(), "flushed Redis cache");
        Ok(())
    }

    async fn flush_by_tag(&self, tag: &str) -> Result<()> {
        validate_tag(tag)?;
        let mut conn = self.connection.clone();
        self.reject_if_frozen(&mut conn, "flushByTag").await?;
        // snapshot at call time
        let members: Vec<String> = conn
            .smembers(self.tag_key(tag))
            .await
            .map_err(|e| Error::substrate_with_source("Redis SMEMBERS failed", e))?;
        for identifier in &members {
            self.unlink_entry(&mut conn, identifier).await?;
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.del(self.tag_key(tag)).ignore();
        pipe.srem(self.tag_index_key(), tag).ignore();
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::substrate_with_source("Redis tag cleanup failed", e))?;
        debug!(identity = %self.identity, tag, removed = members.len(), "flushed by tag");
        Ok(())
    }

    async fn collect_garbage(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        // entry expiry is native; garbage collection only prunes index
        // members whose entry key no longer exists
        let identifiers: Vec<String> = conn
            .smembers(self.entries_key())
            .await
            .map_err(|e| Error::substrate_with_source("Redis SMEMBERS failed", e))?;
        for identifier in &identifiers {
            let alive: bool = conn
                .exists(self.entry_key(identifier))
                .await
                .map_err(|e| Error::substrate_with_source("Redis EXISTS failed", e))?;
            if !alive {
                let _: () = conn
                    .srem(self.entries_key(), identifier)
                    .await
                    .map_err(|e| Error::substrate_with_source("Redis SREM failed", e))?;
            }
        }
        let tags: Vec<String> = conn
            .smembers(self.tag_index_key())
            .await
            .map_err(|e| Error::substrate_with_source("Redis SMEMBERS failed", e))?;
        for tag in &tags {
            let members: Vec<String> = conn
                .smembers(self.tag_key(tag))
                .await
                .map_err(|e| Error::substrate_with_source("Redis SMEMBERS failed", e))?;
            for member in &members {
                let alive: bool = conn
                    .exists(self.entry_key(member))
                    .await
                    .map_err(|e| Error::substrate_with_source("Redis EXISTS failed", e))?;
                if !alive {
                    let _: () = conn
                        .srem(self.tag_key(tag), member)
                        .await
                        .map_err(|e| Error::substrate_with_source("Redis SREM failed", e))?;
                }
            }
            let remaining: i64 = conn
                .scard(self.tag_key(tag))
                .await
                .map_err(|e| Error::substrate_with_source("Redis SCARD failed", e))?;
            if remaining == 0 {
                let mut pipe = redis::pipe();
                pipe.atomic();
                pipe.del(self.tag_key(tag)).ignore();
                pipe.srem(self.tag_index_key(), tag).ignore();
                let _: () = pipe
                    .query_async(&mut conn)
                    .await
                    .map_err(|e| Error::substrate_with_source("Redis tag cleanup failed", e))?;
            }
        }
        Ok(())
    }

    async fn entries(&self) -> Result<EntryStream> {
        let mut conn = self.connection.clone();
        let identifiers: BTreeSet<String> = conn
            .smembers(self.entries_key())
            .await
            .map_err(|e| Error::substrate_with_source("Redis SMEMBERS failed", e))?;
        let backend = self.clone();
        let stream = try_stream! {
            for identifier in identifiers {
                // fetch lazily; entries expired mid-iteration are skipped
                if let Some(payload) = backend.get(&identifier).await? {
                    yield (identifier, payload);
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn freeze(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        self.reject_if_frozen(&mut conn, "freeze").await?;
        let identifiers: Vec<String> = conn
            .smembers(self.entries_key())
            .await
            .map_err(|e| Error::substrate_with_source("Redis SMEMBERS failed", e))?;
        // strip TTLs so the frozen snapshot cannot silently expire
        let mut pipe = redis::pipe();
        pipe.atomic();
        for identifier in &identifiers {
            pipe.persist(self.entry_key(identifier)).ignore();
            pipe.persist(self.entry_tags_key(identifier)).ignore();
        }
        pipe.set(self.frozen_key(), 1).ignore();
        let _: () = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| Error::substrate_with_source("Redis freeze pipeline failed", e))?;
        info!(identity = %self.identity, entries = identifiers.len(), "froze Redis cache");
        Ok(())
    }

    async fn is_frozen(&self) -> bool {
        let mut conn = self.connection.clone();
        conn.exists(self.frozen_key()).await.unwrap_or(false)
    }
}

impl std::fmt::Debug for RedisBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBackend")
            .field("identity", &self.identity)
            .finish()
    }
}
