//! Backend contract tests
//!
//! One property table applied to every backend so the uniform cache
//! contract cannot drift between substrates. Memory and file backends run
//! against process-local state; the Postgres and Redis suites need live
//! services and are `#[ignore]`d by default (run with
//! `cargo test -- --ignored` and `TAGCACHE_TEST_PG_DSN` /
//! `TAGCACHE_TEST_REDIS_URL` pointing at disposable servers).

use futures::TryStreamExt;
use std::collections::BTreeSet;
use std::time::Duration;
use tagcache_backends::{FileBackend, MemoryBackend};
use tagcache_domain::entry::CacheIdentity;
use tagcache_domain::error::Error;
use tagcache_domain::ports::CacheBackend;
use tempfile::TempDir;

type TestBackend = (Box<dyn CacheBackend>, Option<TempDir>);

fn tags(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

fn ids(names: &[&str]) -> BTreeSet<String> {
    names.iter().map(|s| s.to_string()).collect()
}

/// The shared property list. Every function takes an empty, freshly bound
/// backend.
mod suite {
    use super::*;

    pub async fn stores_and_retrieves_entries(cache: &dyn CacheBackend) {
        cache
            .set("some_entry", b"payload", &tags(&["tag_one", "tag_two"]), None)
            .await
            .unwrap();
        assert_eq!(cache.get("some_entry").await.unwrap(), Some(b"payload".to_vec()));
        assert!(cache.has("some_entry").await.unwrap());
        assert_eq!(
            cache.find_identifiers_by_tag("tag_one").await.unwrap(),
            ids(&["some_entry"])
        );
        assert_eq!(
            cache.find_identifiers_by_tag("tag_two").await.unwrap(),
            ids(&["some_entry"])
        );
    }

    pub async fn get_on_missing_entry_is_a_miss(cache: &dyn CacheBackend) {
        assert_eq!(cache.get("never_written").await.unwrap(), None);
        assert!(!cache.has("never_written").await.unwrap());
    }

    pub async fn overwrite_replaces_payload_and_tags(cache: &dyn CacheBackend) {
        cache
            .set("entry", b"first", &tags(&["old_tag", "kept_tag"]), None)
            .await
            .unwrap();
        cache
            .set("entry", b"second", &tags(&["kept_tag", "new_tag"]), None)
            .await
            .unwrap();
        assert_eq!(cache.get("entry").await.unwrap(), Some(b"second".to_vec()));
        assert!(
            cache
                .find_identifiers_by_tag("old_tag")
                .await
                .unwrap()
                .is_empty(),
            "dropped tag still resolves to the entry"
        );
        assert_eq!(
            cache.find_identifiers_by_tag("new_tag").await.unwrap(),
            ids(&["entry"])
        );
    }

    pub async fn overwrite_with_empty_tags_drops_associations(cache: &dyn CacheBackend) {
        cache
            .set("entry", b"tagged", &tags(&["some_tag"]), None)
            .await
            .unwrap();
        cache.set("entry", b"untagged", &[], None).await.unwrap();
        assert!(
            cache
                .find_identifiers_by_tag("some_tag")
                .await
                .unwrap()
                .is_empty()
        );
    }

    pub async fn remove_round_trip(cache: &dyn CacheBackend) {
        cache.set("entry", b"payload", &[], None).await.unwrap();
        assert!(cache.remove("entry").await.unwrap());
        assert!(!cache.has("entry").await.unwrap());
        assert_eq!(cache.get("entry").await.unwrap(), None);
        assert!(!cache.remove("entry").await.unwrap());
        assert!(!cache.remove("never_written").await.unwrap());
    }

    pub async fn rejects_invalid_identifiers(cache: &dyn CacheBackend) {
        for identifier in ["/x", "../x", "x/", "x/../y", "", "white space", "dot.entry"] {
            assert!(
                matches!(
                    cache.set(identifier, b"x", &[], None).await,
                    Err(Error::InvalidIdentifier { .. })
                ),
                "set accepted {identifier:?}"
            );
            assert!(
                matches!(
                    cache.get(identifier).await,
                    Err(Error::InvalidIdentifier { .. })
                ),
                "get accepted {identifier:?}"
            );
            assert!(
                matches!(
                    cache.has(identifier).await,
                    Err(Error::InvalidIdentifier { .. })
                ),
                "has accepted {identifier:?}"
            );
            assert!(
                matches!(
                    cache.remove(identifier).await,
                    Err(Error::InvalidIdentifier { .. })
                ),
                "remove accepted {identifier:?}"
            );
        }
    }

    pub async fn negative_lifetime_expires_immediately(cache: &dyn CacheBackend) {
        cache
            .set("expired", b"stale", &tags(&["some_tag"]), Some(-1))
            .await
            .unwrap();
        assert_eq!(cache.get("expired").await.unwrap(), None);
        assert!(!cache.has("expired").await.unwrap());
        assert!(
            cache
                .find_identifiers_by_tag("some_tag")
                .await
                .unwrap()
                .is_empty()
        );
    }

    pub async fn explicit_zero_lifetime_never_expires(cache: &dyn CacheBackend) {
        cache.set("pinned", b"payload", &[], Some(0)).await.unwrap();
        assert!(cache.has("pinned").await.unwrap());
    }

    pub async fn flush_by_tag_removes_only_tagged(cache: &dyn CacheBackend) {
        cache
            .set("entry_a", b"a", &tags(&["test", "boring"]), None)
            .await
            .unwrap();
        cache
            .set("entry_b", b"b", &tags(&["test", "special"]), None)
            .await
            .unwrap();
        cache.set("entry_c", b"c", &tags(&["test"]), None).await.unwrap();

        cache.flush_by_tag("special").await.unwrap();

        assert!(cache.has("entry_a").await.unwrap());
        assert!(!cache.has("entry_b").await.unwrap());
        assert!(cache.has("entry_c").await.unwrap());
    }

    pub async fn collect_garbage_removes_expired_entries(cache: &dyn CacheBackend) {
        cache.set("live", b"fresh", &tags(&["t"]), None).await.unwrap();
        cache.set("dead", b"stale", &tags(&["t"]), Some(-1)).await.unwrap();

        cache.collect_garbage().await.unwrap();
        cache.collect_garbage().await.unwrap(); // idempotent

        assert!(cache.has("live").await.unwrap());
        assert!(!cache.has("dead").await.unwrap());
        assert_eq!(cache.find_identifiers_by_tag("t").await.unwrap(), ids(&["live"]));

        let pairs: Vec<(String, Vec<u8>)> =
            cache.entries().await.unwrap().try_collect().await.unwrap();
        assert_eq!(pairs, vec![("live".to_string(), b"fresh".to_vec())]);
    }

    pub async fn iteration_yields_all_live_entries(cache: &dyn CacheBackend) {
        cache.set("one", b"1", &[], None).await.unwrap();
        cache.set("two", b"2", &[], None).await.unwrap();
        cache.set("three", b"3", &[], None).await.unwrap();
        cache.remove("two").await.unwrap();

        let pairs: Vec<(String, Vec<u8>)> =
            cache.entries().await.unwrap().try_collect().await.unwrap();
        let collected: BTreeSet<String> = pairs.iter().map(|(id, _)| id.clone()).collect();
        assert_eq!(collected, ids(&["one", "three"]));
        for (identifier, payload) in pairs {
            let expected = if identifier == "one" { b"1" } else { b"3" };
            assert_eq!(payload, expected);
        }
    }

    pub async fn freeze_rejects_mutations(cache: &dyn CacheBackend) {
        cache.set("entry", b"payload", &tags(&["t"]), None).await.unwrap();
        cache.freeze().await.unwrap();
        assert!(cache.is_frozen().await);

        assert!(matches!(
            cache.set("other", b"x", &[], None).await,
            Err(Error::Frozen { .. })
        ));
        assert!(matches!(
            cache.remove("entry").await,
            Err(Error::Frozen { .. })
        ));
        assert!(matches!(
            cache.flush_by_tag("t").await,
            Err(Error::Frozen { .. })
        ));
        assert!(matches!(cache.freeze().await, Err(Error::Frozen { .. })));

        // reads still work
        assert_eq!(cache.get("entry").await.unwrap(), Some(b"payload".to_vec()));
        cache.flush().await.unwrap();
    }

    pub async fn frozen_entries_survive_their_expiry(cache: &dyn CacheBackend) {
        cache.set("short_lived", b"payload", &[], Some(1)).await.unwrap();
        cache.freeze().await.unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(
            cache.get("short_lived").await.unwrap(),
            Some(b"payload".to_vec())
        );
        assert!(cache.has("short_lived").await.unwrap());
        cache.flush().await.unwrap();
    }

    pub async fn flush_empties_and_unfreezes(cache: &dyn CacheBackend) {
        cache.set("entry", b"payload", &tags(&["t"]), None).await.unwrap();
        cache.freeze().await.unwrap();

        cache.flush().await.unwrap();

        assert!(!cache.is_frozen().await);
        assert!(!cache.has("entry").await.unwrap());
        assert!(cache.find_identifiers_by_tag("t").await.unwrap().is_empty());

        // the cache is writable again
        cache.set("entry", b"again", &[], None).await.unwrap();
        assert!(cache.has("entry").await.unwrap());
    }
}

macro_rules! contract_tests {
    ($make:path $(, #[$extra:meta])*) => {
        contract_tests!(@one $make $(, #[$extra])* =>
            stores_and_retrieves_entries,
            get_on_missing_entry_is_a_miss,
            overwrite_replaces_payload_and_tags,
            overwrite_with_empty_tags_drops_associations,
            remove_round_trip,
            rejects_invalid_identifiers,
            negative_lifetime_expires_immediately,
            explicit_zero_lifetime_never_expires,
            flush_by_tag_removes_only_tagged,
            collect_garbage_removes_expired_entries,
            iteration_yields_all_live_entries,
            freeze_rejects_mutations,
            frozen_entries_survive_their_expiry,
            flush_empties_and_unfreezes,
        );
    };
    (@one $make:path $(, #[$extra:meta])* => $($name:ident),+ $(,)?) => {
        $(
            $(#[$extra])*
            #[tokio::test]
            async fn $name() {
                let (cache, _keep) = $make(stringify!($name)).await;
                super::suite::$name(cache.as_ref()).await;
            }
        )+
    };
}

mod memory {
    use super::*;

    async fn make(name: &str) -> TestBackend {
        let identity = CacheIdentity::new(format!("MemoryContract_{name}")).unwrap();
        (Box::new(MemoryBackend::new(identity)), None)
    }

    contract_tests!(make);

    #[tokio::test]
    async fn flush_respects_namespace_isolation() {
        let (first, _) = make("isolation_first").await;
        let (second, _) = make("isolation_second").await;
        first.set("entry", b"1", &[], None).await.unwrap();
        second.set("entry", b"2", &[], None).await.unwrap();

        first.flush().await.unwrap();

        assert!(!first.has("entry").await.unwrap());
        assert!(second.has("entry").await.unwrap());
    }
}

mod file {
    use super::*;

    async fn make(name: &str) -> TestBackend {
        let dir = TempDir::new().unwrap();
        let identity = CacheIdentity::new(format!("FileContract_{name}")).unwrap();
        let backend = FileBackend::new(identity, dir.path()).await.unwrap();
        (Box::new(backend), Some(dir))
    }

    contract_tests!(make);

    #[tokio::test]
    async fn flush_respects_namespace_isolation() {
        let dir = TempDir::new().unwrap();
        let first = FileBackend::new(CacheIdentity::new("FirstCache").unwrap(), dir.path())
            .await
            .unwrap();
        let second = FileBackend::new(CacheIdentity::new("SecondCache").unwrap(), dir.path())
            .await
            .unwrap();
        first.set("entry", b"1", &[], None).await.unwrap();
        second.set("entry", b"2", &[], None).await.unwrap();

        first.flush().await.unwrap();

        assert!(!first.has("entry").await.unwrap());
        assert!(second.has("entry").await.unwrap());
    }

    #[tokio::test]
    async fn nested_identifiers_map_to_nested_files(){
        let (cache, keep) = make("nested").await;
        cache.set("nested/entry/leaf", b"deep", &[], None).await.unwrap();
        assert_eq!(cache.get("nested/entry/leaf").await.unwrap(), Some(b"deep".to_vec()));

        let dir = keep.as_ref().unwrap().path();
        assert!(
            dir.join("Data")
                .join("FileContract_nested")
                .join("nested/entry/leaf")
                .is_file()
        );
        assert!(cache.remove("nested/entry/leaf").await.unwrap());
    }

    #[tokio::test]
    async fn frozen_state_outlives_the_instance() {
        let dir = TempDir::new().unwrap();
        let identity = CacheIdentity::new("FrozenAcrossBind").unwrap();

        let first = FileBackend::new(identity.clone(), dir.path()).await.unwrap();
        first.set("entry", b"payload", &[], Some(1)).await.unwrap();
        first.freeze().await.unwrap();

        // a fresh backend bound to the same directory starts frozen
        let second = FileBackend::new(identity, dir.path()).await.unwrap();
        assert!(second.is_frozen().await);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(second.get("entry").await.unwrap(), Some(b"payload".to_vec()));
        assert!(second.has("entry").await.unwrap());
        assert!(matches!(
            second.set("other", b"x", &[], None).await,
            Err(Error::Frozen { .. })
        ));

        // restore write permissions so the tempdir can be cleaned up
        second.flush().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn freeze_drops_the_write_bits() {
        use std::os::unix::fs::PermissionsExt;

        let (cache, keep) = make("write_bits").await;
        assert!(cache.supports_physical_freeze());
        cache.set("entry", b"payload", &[], None).await.unwrap();
        cache.freeze().await.unwrap();

        let entry = keep
            .as_ref()
            .unwrap()
            .path()
            .join("Data")
            .join("FileContract_write_bits")
            .join("entry");
        let mode = std::fs::metadata(&entry).unwrap().permissions().mode();
        assert_eq!(mode & 0o222, 0, "entry file is still writable");

        cache.flush().await.unwrap();
    }

    #[tokio::test]
    async fn bind_fails_on_unwritable_directory() {
        let result = FileBackend::new(
            CacheIdentity::new("Unbindable").unwrap(),
            "/proc/tagcache-cannot-write-here",
        )
        .await;
        assert!(matches!(result, Err(Error::Configuration { .. })));
    }
}

#[cfg(feature = "backend-postgres")]
mod postgres {
    use super::*;
    use tagcache_backends::PostgresBackend;

    fn dsn() -> String {
        std::env::var("TAGCACHE_TEST_PG_DSN")
            .unwrap_or_else(|_| "host=localhost user=postgres password=postgres".to_string())
    }

    async fn make(name: &str) -> TestBackend {
        let identity = CacheIdentity::new(format!("PgContract_{name}")).unwrap();
        let backend = PostgresBackend::new(identity, &dsn()).await.unwrap();
        backend.flush().await.unwrap();
        (Box::new(backend), None)
    }

    contract_tests!(make, #[ignore = "requires a PostgreSQL server"]);

    #[tokio::test]
    #[ignore = "requires a PostgreSQL server"]
    async fn flush_respects_namespace_isolation() {
        let (first, _) = make("isolation_first").await;
        let (second, _) = make("isolation_second").await;
        first.set("entry", b"1", &[], None).await.unwrap();
        second.set("entry", b"2", &[], None).await.unwrap();

        first.flush().await.unwrap();

        assert!(!first.has("entry").await.unwrap());
        assert!(second.has("entry").await.unwrap());
        second.flush().await.unwrap();
    }
}

#[cfg(feature = "backend-redis")]
mod redis {
    use super::*;
    use tagcache_backends::RedisBackend;

    fn url() -> String {
        std::env::var("TAGCACHE_TEST_REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
    }

    async fn make(name: &str) -> TestBackend {
        let identity = CacheIdentity::new(format!("RedisContract_{name}")).unwrap();
        let backend = RedisBackend::new(identity, &url()).await.unwrap();
        backend.flush().await.unwrap();
        (Box::new(backend), None)
    }

    contract_tests!(make, #[ignore = "requires a Redis server"]);

    #[tokio::test]
    #[ignore = "requires a Redis server"]
    async fn flush_respects_namespace_isolation() {
        let (first, _) = make("isolation_first").await;
        let (second, _) = make("isolation_second").await;
        first.set("entry", b"1", &[], None).await.unwrap();
        second.set("entry", b"2", &[], None).await.unwrap();

        first.flush().await.unwrap();

        assert!(!first.has("entry").await.unwrap());
        assert!(second.has("entry").await.unwrap());
        second.flush().await.unwrap();
    }
}
