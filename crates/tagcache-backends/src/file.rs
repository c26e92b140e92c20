//! File-based durable backend
//!
//! One file per entry under `<cache_directory>/<Data|Code>/<identity>/`,
//! with tags and expiry stored in-band behind the payload:
//!
//! ```text
//! +---------+---------------------+------------------+------------------+
//! | payload | tags joined by '\n' | expiry u64 BE    | tag length u32 BE|
//! +---------+---------------------+------------------+------------------+
//! ```
//!
//! The trailing 12 bytes are fixed-width, so expiry checks and the tag
//! scan never read the payload. Writes go through a temporary file in the
//! entry's directory and are renamed into place, so concurrent readers
//! only ever observe complete entries.
//!
//! The tag index is derived by a recursive scan on every lookup rather
//! than maintained on write. That is linear in the entry count and is the
//! accepted trade-off for a backend whose advantage is durability without
//! any external service.
//!
//! Freezing persists a `FrozenCache.data` marker with the identifier
//! index and, on Unix, drops the write bits on all entry files and
//! directories, so accidental writes are also rejected by the OS.

use async_stream::try_stream;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeSet;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::SystemTime;
use tagcache_domain::constants::MAX_IDENTIFIER_LENGTH;
use tagcache_domain::entry::{CacheIdentity, PayloadKind, resolve_expiry};
use tagcache_domain::error::{Error, Result};
use tagcache_domain::identifier::{validate_identifier, validate_tag};
use tagcache_domain::ports::{CacheBackend, EntryStream};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Marker file recording the frozen flag and identifier index.
///
/// The name contains a dot, which the identifier grammar forbids, so it
/// can never collide with an entry file.
const FROZEN_MARKER: &str = "FrozenCache.data";

/// Separator between tags in the entry footer; tags reject control
/// characters so it cannot occur inside one.
const TAG_SEPARATOR: u8 = b'\n';

/// Fixed footer width: 8-byte expiry plus 4-byte tag block length.
const FOOTER_LEN: u64 = 12;

/// Expiry sentinel for entries that never expire.
const EXPIRY_NEVER: u64 = u64::MAX;

#[cfg(unix)]
const MAX_PATH_LENGTH: usize = 4096;
#[cfg(not(unix))]
const MAX_PATH_LENGTH: usize = 259;

/// Durable cache backend storing one file per entry
pub struct FileBackend {
    identity: CacheIdentity,
    default_lifetime: u64,
    /// `<root>/<Data|Code>/<identity>`, prepared at bind time
    directory: PathBuf,
    frozen: Arc<RwLock<Option<BTreeSet<String>>>>,
}

/// Footer and tag metadata parsed from an entry file
struct EntryMeta {
    identifier: String,
    tags: Vec<String>,
    expires_at: u64,
    modified: SystemTime,
}

impl FileBackend {
    /// Bind a data cache under `cache_directory` with no default lifetime
    pub async fn new<P: AsRef<Path>>(identity: CacheIdentity, cache_directory: P) -> Result<Self> {
        Self::with_options(identity, cache_directory, PayloadKind::Data, 0).await
    }

    /// Bind a cache with explicit payload kind and default lifetime
    ///
    /// Performs the one-time substrate preparation: creates the cache
    /// directory, verifies it is writable, validates the worst-case entry
    /// path against the platform maximum, and picks up a persisted frozen
    /// marker left by a previous process.
    pub async fn with_options<P: AsRef<Path>>(
        identity: CacheIdentity,
        cache_directory: P,
        payload_kind: PayloadKind,
        default_lifetime: u64,
    ) -> Result<Self> {
        let directory = cache_directory
            .as_ref()
            .join(payload_kind.subdirectory())
            .join(identity.as_str());

        tokio::fs::create_dir_all(&directory).await.map_err(|e| {
            Error::configuration_with_source(
                format!("cache directory {} cannot be created", directory.display()),
                e,
            )
        })?;

        // a later `set` must not be the first place a too-long path shows up
        let worst_case = directory.as_os_str().len() + 1 + MAX_IDENTIFIER_LENGTH;
        if worst_case > MAX_PATH_LENGTH {
            return Err(Error::configuration(format!(
                "cache directory {} leaves no room for entry paths ({worst_case} > {MAX_PATH_LENGTH})",
                directory.display()
            )));
        }

        let frozen = match tokio::fs::read(directory.join(FROZEN_MARKER)).await {
            Ok(bytes) => {
                let index: BTreeSet<String> = serde_json::from_slice(&bytes).map_err(|e| {
                    Error::configuration_with_source(
                        format!("frozen marker in {} is unreadable", directory.display()),
                        e,
                    )
                })?;
                info!(identity = %identity, entries = index.len(), "bound to frozen file cache");
                Some(index)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(Error::configuration_with_source(
                    format!("frozen marker in {} is unreadable", directory.display()),
                    e,
                ));
            }
        };

        // frozen directories are deliberately read-only, so the
        // writability probe only applies to active caches
        if frozen.is_none() {
            tempfile::NamedTempFile::new_in(&directory).map_err(|e| {
                Error::configuration_with_source(
                    format!("cache directory {} is not writable", directory.display()),
                    e,
                )
            })?;
        }

        Ok(Self {
            identity,
            default_lifetime,
            directory,
            frozen: Arc::new(RwLock::new(frozen)),
        })
    }

    /// Directory holding this cache's entry files
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    fn entry_path(&self, identifier: &str) -> PathBuf {
        // identifier is validated, so segments cannot traverse out
        self.directory.join(identifier)
    }

    fn frozen_index(&self) -> Option<BTreeSet<String>> {
        self.frozen.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn reject_if_frozen(&self, operation: &'static str) -> Result<()> {
        if self.frozen.read().unwrap_or_else(|e| e.into_inner()).is_some() {
            return Err(Error::frozen(self.identity.as_str(), operation));
        }
        Ok(())
    }

    fn encode(payload: &[u8], tags: &[String], expires_at: u64) -> Vec<u8> {
        let tag_block = tags.join("\n");
        let mut bytes = Vec::with_capacity(payload.len() + tag_block.len() + FOOTER_LEN as usize);
        bytes.extend_from_slice(payload);
        bytes.extend_from_slice(tag_block.as_bytes());
        bytes.extend_from_slice(&expires_at.to_be_bytes());
        bytes.extend_from_slice(&(tag_block.len() as u32).to_be_bytes());
        bytes
    }

    /// Split a complete entry file into payload, tags, and expiry.
    /// Returns `None` for files too short or inconsistent to be entries.
    fn decode(bytes: &[u8]) -> Option<(&[u8], Vec<String>, u64)> {
        let len = bytes.len();
        if len < FOOTER_LEN as usize {
            return None;
        }
        let tag_len = u32::from_be_bytes(bytes[len - 4..].try_into().ok()?) as usize;
        let expires_at = u64::from_be_bytes(bytes[len - 12..len - 4].try_into().ok()?);
        let payload_len = len.checked_sub(FOOTER_LEN as usize + tag_len)?;
        let tag_block = std::str::from_utf8(&bytes[payload_len..payload_len + tag_len]).ok()?;
        let tags = if tag_block.is_empty() {
            Vec::new()
        } else {
            tag_block
                .split(TAG_SEPARATOR as char)
                .map(str::to_string)
                .collect()
        };
        Some((&bytes[..payload_len], tags, expires_at))
    }

    /// Read only the footer (and optionally tags) of an entry file.
    fn read_meta(path: &Path) -> std::io::Result<Option<(Vec<String>, u64)>> {
        let mut file = std::fs::File::open(path)?;
        let len = file.metadata()?.len();
        if len < FOOTER_LEN {
            return Ok(None);
        }
        let mut footer = [0u8; FOOTER_LEN as usize];
        file.seek(SeekFrom::End(-(FOOTER_LEN as i64)))?;
        file.read_exact(&mut footer)?;
        let tag_len = u32::from_be_bytes(footer[8..].try_into().expect("fixed width")) as u64;
        let expires_at = u64::from_be_bytes(footer[..8].try_into().expect("fixed width"));
        if tag_len + FOOTER_LEN > len {
            return Ok(None);
        }
        let mut tag_block = vec![0u8; tag_len as usize];
        file.seek(SeekFrom::End(-((tag_len + FOOTER_LEN) as i64)))?;
        file.read_exact(&mut tag_block)?;
        let Ok(tag_block) = String::from_utf8(tag_block) else {
            return Ok(None);
        };
        let tags = if tag_block.is_empty() {
            Vec::new()
        } else {
            tag_block
                .split(TAG_SEPARATOR as char)
                .map(str::to_string)
                .collect()
        };
        Ok(Some((tags, expires_at)))
    }

    fn identifier_for(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.directory).ok()?;
        let segments: Vec<String> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(segments.join("/"))
    }

    /// Recursive scan of all entry files, sorted by modification time so
    /// enumeration approximates insertion order.
    fn scan(&self) -> Result<Vec<EntryMeta>> {
        let mut found = Vec::new();
        for item in WalkDir::new(&self.directory).min_depth(1) {
            let item = match item {
                Ok(item) => item,
                // directory vanished under a concurrent flush
                Err(e)
                    if e.io_error()
                        .is_some_and(|io| io.kind() == std::io::ErrorKind::NotFound) =>
                {
                    continue;
                }
                Err(e) => {
                    return Err(Error::substrate_with_source(
                        format!("cannot scan cache directory {}", self.directory.display()),
                        e,
                    ));
                }
            };
            if !item.file_type().is_file() || item.file_name().to_str() == Some(FROZEN_MARKER) {
                continue;
            }
            let Some(identifier) = self.identifier_for(item.path()) else {
                continue;
            };
            let modified = item
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            match Self::read_meta(item.path()) {
                Ok(Some((tags, expires_at))) => found.push(EntryMeta {
                    identifier,
                    tags,
                    expires_at,
                    modified,
                }),
                Ok(None) => {
                    warn!(identity = %self.identity, %identifier, "skipping malformed entry file");
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    // removed by a concurrent writer between walk and read
                }
                Err(e) => {
                    return Err(Error::substrate_with_source(
                        format!("cannot read entry {identifier}"),
                        e,
                    ));
                }
            }
        }
        found.sort_by(|a, b| {
            a.modified
                .cmp(&b.modified)
                .then_with(|| a.identifier.cmp(&b.identifier))
        });
        Ok(found)
    }

    fn now_secs() -> u64 {
        Utc::now().timestamp().max(0) as u64
    }

    #[cfg(unix)]
    fn set_tree_writable(&self, writable: bool) -> std::io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        let (dir_mode, file_mode) = if writable {
            (0o755, 0o644)
        } else {
            (0o555, 0o444)
        };
        // directories last when locking down, first when unlocking
        let mut dirs = Vec::new();
        for item in WalkDir::new(&self.directory).into_iter().flatten() {
            if item.file_type().is_dir() {
                dirs.push(item.path().to_path_buf());
            } else {
                std::fs::set_permissions(item.path(), std::fs::Permissions::from_mode(file_mode))?;
            }
        }
        if writable {
            dirs.sort();
        } else {
            dirs.sort_by(|a, b| b.cmp(a));
        }
        for dir in dirs {
            std::fs::set_permissions(&dir, std::fs::Permissions::from_mode(dir_mode))?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn set_tree_writable(&self, _writable: bool) -> std::io::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl CacheBackend for FileBackend {
    fn identity(&self) -> &CacheIdentity {
        &self.identity
    }

    fn backend_name(&self) -> &str {
        "file"
    }

    fn supports_physical_freeze(&self) -> bool {
        cfg!(unix)
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

        let expires_at = resolve_expiry(lifetime, self.default_lifetime, Utc::now())
            .map_or(EXPIRY_NEVER, |t| t.timestamp().max(0) as u64);
        let bytes = Self::encode(payload, tags, expires_at);
        let path = self.entry_path(identifier);

        let identifier = identifier.to_string();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let parent = path.parent().expect("entry path has a parent");
            std::fs::create_dir_all(parent)?;
            // temp file in the target directory, renamed into place, so a
            // concurrent `get` never sees a half-written entry
            let mut temp = tempfile::NamedTempFile::new_in(parent)?;
            temp.write_all(&bytes)?;
            temp.persist(&path).map_err(|e| e.error)?;
            Ok(())
        })
        .await
        .map_err(|e| Error::substrate(format!("entry write task failed: {e}")))?
        .map_err(|e| Error::substrate_with_source(format!("cannot write entry {identifier}"), e))
    }

    async fn get(&self, identifier: &str) -> Result<Option<Vec<u8>>> {
        validate_identifier(identifier)?;
        let frozen = self.frozen.read().unwrap_or_else(|e| e.into_inner()).is_some();
        let bytes = match tokio::fs::read(self.entry_path(identifier)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(Error::substrate_with_source(
                    format!("cannot read entry {identifier}"),
                    e,
                ));
            }
        };
        match Self::decode(&bytes) {
            Some((payload, _, expires_at)) => {
                if !frozen && expires_at <= Self::now_secs() {
                    Ok(None)
                } else {
                    Ok(Some(payload.to_vec()))
                }
            }
            None => {
                warn!(identity = %self.identity, identifier, "malformed entry file treated as miss");
                Ok(None)
            }
        }
    }

    async fn has(&self, identifier: &str) -> Result<bool> {
        validate_identifier(identifier)?;
        if let Some(index) = self.frozen_index() {
            // frozen caches answer from the persisted index, no expiry check
            return Ok(index.contains(identifier));
        }
        let path = self.entry_path(identifier);
        let meta = tokio::task::spawn_blocking(move || Self::read_meta(&path))
            .await
            .map_err(|e| Error::substrate(format!("entry read task failed: {e}")))?;
        match meta {
            Ok(Some((_, expires_at))) => Ok(expires_at > Self::now_secs()),
            Ok(None) => Ok(false),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::substrate_with_source(
                format!("cannot read entry {identifier}"),
                e,
            )),
        }
    }

    async fn remove(&self, identifier: &str) -> Result<bool> {
        validate_identifier(identifier)?;
        self.reject_if_frozen("remove")?;
        match tokio::fs::remove_file(self.entry_path(identifier)).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(Error::substrate_with_source(
                format!("cannot remove entry {identifier}"),
                e,
            )),
        }
    }

    async fn find_identifiers_by_tag(&self, tag: &str) -> Result<BTreeSet<String>> {
        validate_tag(tag)?;
        let frozen = self.frozen.read().unwrap_or_else(|e| e.into_inner()).is_some();
        let now = Self::now_secs();
        let tag = tag.to_string();
        let this = self.clone_scan_handle();
        tokio::task::spawn_blocking(move || -> Result<BTreeSet<String>> {
            Ok(this
                .scan()?
                .into_iter()
                .filter(|meta| (frozen || meta.expires_at > now) && meta.tags.iter().any(|t| *t == tag))
                .map(|meta| meta.identifier)
                .collect())
        })
        .await
        .map_err(|e| Error::substrate(format!("tag scan task failed: {e}")))?
    }

    async fn flush(&self) -> Result<()> {
        let was_frozen = {
            let mut frozen = self.frozen.write().unwrap_or_else(|e| e.into_inner());
            frozen.take().is_some()
        };
        if was_frozen {
            self.set_tree_writable(true).map_err(|e| {
                Error::substrate_with_source("cannot restore write permissions for flush", e)
            })?;
        }
        tokio::fs::remove_dir_all(&self.directory)
            .await
            .map_err(|e| {
                Error::substrate_with_source(
                    format!("cannot flush cache directory {}", self.directory.display()),
                    e,
                )
            })?;
        tokio::fs::create_dir_all(&self.directory)
            .await
            .map_err(|e| {
                Error::substrate_with_source(
                    format!("cannot recreate cache directory {}", self.directory.display()),
                    e,
                )
            })?;
        info!(identity = %self.identity, "flushed file cache");
        Ok(())
    }

    async fn flush_by_tag(&self, tag: &str) -> Result<()> {
        validate_tag(tag)?;
        self.reject_if_frozen("flushByTag")?;
        let identifiers = self.find_identifiers_by_tag(tag).await?;
        for identifier in &identifiers {
            self.remove(identifier).await?;
        }
        debug!(identity = %self.identity, tag, removed = identifiers.len(), "flushed by tag");
        Ok(())
    }

    async fn collect_garbage(&self) -> Result<()> {
        if self.frozen.read().unwrap_or_else(|e| e.into_inner()).is_some() {
            // frozen entries are permanent, nothing to collect
            return Ok(());
        }
        let now = Self::now_secs();
        let this = self.clone_scan_handle();
        let removed = tokio::task::spawn_blocking(move || -> Result<usize> {
            let mut removed = 0;
            for meta in this.scan()? {
                if meta.expires_at <= now {
                    match std::fs::remove_file(this.entry_path(&meta.identifier)) {
                        Ok(()) => removed += 1,
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                        Err(e) => {
                            return Err(Error::substrate_with_source(
                                format!("cannot remove expired entry {}", meta.identifier),
                                e,
                            ));
                        }
                    }
                }
            }
            Ok(removed)
        })
        .await
        .map_err(|e| Error::substrate(format!("garbage collection task failed: {e}")))??;
        if removed > 0 {
            debug!(identity = %self.identity, removed, "collected expired entries");
        }
        Ok(())
    }

    async fn entries(&self) -> Result<EntryStream> {
        let frozen = self.frozen.read().unwrap_or_else(|e| e.into_inner()).is_some();
        let this = self.clone_scan_handle();
        let snapshot = tokio::task::spawn_blocking(move || this.scan())
            .await
            .map_err(|e| Error::substrate(format!("scan task failed: {e}")))??;
        let directory = self.directory.clone();
        let now = Self::now_secs();
        let stream = try_stream! {
            for meta in snapshot {
                if !frozen && meta.expires_at <= now {
                    continue;
                }
                // read lazily; entries removed mid-iteration are skipped
                match tokio::fs::read(directory.join(&meta.identifier)).await {
                    Ok(bytes) => {
                        if let Some((payload, _, expires_at)) = Self::decode(&bytes) {
                            if frozen || expires_at > now {
                                yield (meta.identifier, payload.to_vec());
                            }
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        Err(Error::substrate_with_source(
                            format!("cannot read entry {}", meta.identifier),
                            e,
                        ))?;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }

    async fn freeze(&self) -> Result<()> {
        self.reject_if_frozen("freeze")?;

        // drop anything already expired so the frozen snapshot only
        // contains reachable entries
        self.collect_garbage().await?;

        let this = self.clone_scan_handle();
        let index: BTreeSet<String> = tokio::task::spawn_blocking(move || {
            this.scan()
                .map(|found| found.into_iter().map(|meta| meta.identifier).collect())
        })
        .await
        .map_err(|e| Error::substrate(format!("scan task failed: {e}")))??;

        let marker = serde_json::to_vec(&index)
            .map_err(|e| Error::substrate_with_source("cannot serialize frozen index", e))?;
        tokio::fs::write(self.directory.join(FROZEN_MARKER), marker)
            .await
            .map_err(|e| Error::substrate_with_source("cannot write frozen marker", e))?;

        {
            let mut frozen = self.frozen.write().unwrap_or_else(|e| e.into_inner());
            *frozen = Some(index);
        }

        if self.supports_physical_freeze() {
            self.set_tree_writable(false).map_err(|e| {
                Error::substrate_with_source("cannot drop write permissions for freeze", e)
            })?;
        }
        info!(identity = %self.identity, "froze file cache");
        Ok(())
    }

    async fn is_frozen(&self) -> bool {
        self.frozen.read().unwrap_or_else(|e| e.into_inner()).is_some()
    }
}

impl FileBackend {
    /// Cheap handle clone for moving scans onto blocking threads
    fn clone_scan_handle(&self) -> Self {
        Self {
            identity: self.identity.clone(),
            default_lifetime: self.default_lifetime,
            directory: self.directory.clone(),
            frozen: Arc::clone(&self.frozen),
        }
    }
}

impl std::fmt::Debug for FileBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBackend")
            .field("identity", &self.identity)
            .field("directory", &self.directory)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn footer_round_trip() {
        let bytes = FileBackend::encode(b"payload", &["a".to_string(), "b b".to_string()], 42);
        let (payload, tags, expires_at) = FileBackend::decode(&bytes).unwrap();
        assert_eq!(payload, b"payload");
        assert_eq!(tags, ["a", "b b"]);
        assert_eq!(expires_at, 42);
    }

    #[test]
    fn footer_without_tags() {
        let bytes = FileBackend::encode(b"", &[], EXPIRY_NEVER);
        let (payload, tags, expires_at) = FileBackend::decode(&bytes).unwrap();
        assert!(payload.is_empty());
        assert!(tags.is_empty());
        assert_eq!(expires_at, EXPIRY_NEVER);
    }

    #[test]
    fn decode_rejects_truncated_files() {
        assert!(FileBackend::decode(b"short").is_none());
        // tag length pointing past the start of the file
        let mut bytes = 0u64.to_be_bytes().to_vec();
        bytes.extend_from_slice(&100u32.to_be_bytes());
        assert!(FileBackend::decode(&bytes).is_none());
    }
}
