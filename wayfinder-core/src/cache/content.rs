use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::cache::{LruCache, LruOptions};
use crate::config::CacheSettings;
use crate::error::Error;
use crate::time_util::epoch_ms;

/// A verified body plus everything needed to serve it again.
#[derive(Clone, Debug)]
pub struct CachedContent {
    pub data: Bytes,
    pub content_type: String,
    pub content_length: u64,
    pub headers: Vec<(String, String)>,
    pub verified_at_ms: u64,
    pub txid: String,
    /// Hex SHA-256 of `data`; doubles as the disk file stem.
    pub hash: String,
    access: Arc<AccessStats>,
}

#[derive(Debug, Default)]
struct AccessStats {
    last_accessed_ms: AtomicU64,
    access_count: AtomicU64,
}

impl CachedContent {
    pub fn new(
        data: Bytes,
        content_type: String,
        headers: Vec<(String, String)>,
        txid: String,
        hash: String,
    ) -> Self {
        let content_length = data.len() as u64;
        Self {
            data,
            content_type,
            content_length,
            headers,
            verified_at_ms: epoch_ms(),
            txid,
            hash,
            access: Arc::new(AccessStats::default()),
        }
    }

    fn touch(&self) {
        self.access.last_accessed_ms.store(epoch_ms(), Ordering::Relaxed);
        self.access.access_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn access_count(&self) -> u64 {
        self.access.access_count.load(Ordering::Relaxed)
    }

    pub fn last_accessed_ms(&self) -> u64 {
        self.access.last_accessed_ms.load(Ordering::Relaxed)
    }
}

/// Sidecar metadata persisted next to each `.bin`; carries everything the
/// startup scan needs to rebuild the index without reading bodies.
#[derive(Debug, Deserialize, Serialize)]
struct MetaFile {
    txid: String,
    path: String,
    hash: String,
    content_type: String,
    content_length: u64,
    headers: Vec<(String, String)>,
    verified_at: DateTime<Utc>,
    access_count: u64,
}

#[derive(Clone, Debug)]
struct DiskEntry {
    hash: String,
    bytes: u64,
    verified_at_ms: u64,
    last_accessed_ms: u64,
    content_type: String,
    headers: Vec<(String, String)>,
    txid: String,
}

struct DiskInner {
    map: HashMap<String, DiskEntry>,
    total_bytes: u64,
}

struct DiskStore {
    dir: PathBuf,
    max_total_bytes: u64,
    inner: Mutex<DiskInner>,
}

#[derive(Clone, Debug, Serialize)]
pub struct ContentCacheStats {
    pub memory_entries: usize,
    pub memory_bytes: u64,
    pub disk_entries: usize,
    pub disk_bytes: u64,
    pub hits: u64,
    pub misses: u64,
}

/// Two-tier content cache. The memory tier is a byte-budgeted LRU holding
/// bodies; the optional disk tier persists each entry as
/// `<hash>.bin` + `<hash>.meta.json`, written through `.tmp` + rename so a
/// crash leaves only cleanable debris. Verified entries are stored under
/// `(content_txid, "")`: content addresses are content, so two manifest
/// paths mapping to one txid share a single entry.
pub struct ContentCache {
    memory: LruCache<String, CachedContent>,
    disk: Option<DiskStore>,
    max_item_bytes: u64,
    max_total_bytes: u64,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl ContentCache {
    /// Build the cache; in disk mode this scans `content_path`, deletes
    /// `.tmp` debris, and rebuilds the index from `.meta.json` files.
    pub fn new(settings: &CacheSettings) -> Result<Self, Error> {
        let disk = match &settings.content_path {
            Some(dir) => Some(DiskStore::open(dir, settings.max_total_bytes)?),
            None => None,
        };
        Ok(Self {
            memory: LruCache::new(LruOptions {
                max_entries: settings.max_entries,
                max_bytes: Some(settings.max_total_bytes),
                weigher: Some(Box::new(|entry: &CachedContent| entry.data.len() as u64)),
                on_dispose: None,
            }),
            disk,
            max_item_bytes: settings.max_item_bytes,
            max_total_bytes: settings.max_total_bytes,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        })
    }

    pub async fn get(&self, txid: &str, path: &str) -> Option<CachedContent> {
        let key = cache_key(txid, path);
        if let Some(entry) = self.memory.get(&key) {
            entry.touch();
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(entry);
        }

        if let Some(disk) = &self.disk {
            match disk.load(&key).await {
                Ok(Some(entry)) => {
                    entry.touch();
                    self.memory.insert(key, entry.clone(), None);
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Some(entry);
                }
                Ok(None) => {}
                Err(e) => e.log(),
            }
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub async fn has(&self, txid: &str, path: &str) -> bool {
        let key = cache_key(txid, path);
        self.memory.contains_key(&key)
            || self
                .disk
                .as_ref()
                .is_some_and(|disk| disk.contains(&key))
    }

    /// Admit an entry. Items above the per-item or total budget are
    /// rejected; otherwise older entries are evicted until it fits. Disk
    /// failures degrade the entry to memory-only.
    pub async fn set(&self, txid: &str, path: &str, entry: CachedContent) -> bool {
        let size = entry.data.len() as u64;
        if size > self.max_item_bytes || size > self.max_total_bytes {
            tracing::debug!(txid, size, "content too large to cache");
            return false;
        }
        let key = cache_key(txid, path);
        if !self.memory.insert(key.clone(), entry.clone(), None) {
            return false;
        }
        if let Some(disk) = &self.disk {
            if let Err(e) = disk.persist(&key, &entry).await {
                // Memory-only for this entry; the router keeps serving.
                e.log();
            }
        }
        true
    }

    /// Remove every path variant stored for `txid`.
    pub async fn invalidate(&self, txid: &str) {
        let prefix = format!("{txid}|");
        self.memory.retain(|key| !key.starts_with(&prefix));
        if let Some(disk) = &self.disk {
            disk.remove_prefix(&prefix).await;
        }
    }

    pub async fn clear(&self) {
        self.memory.clear();
        if let Some(disk) = &self.disk {
            disk.clear().await;
        }
    }

    pub fn stats(&self) -> ContentCacheStats {
        let (disk_entries, disk_bytes) = self
            .disk
            .as_ref()
            .map(|disk| disk.usage())
            .unwrap_or((0, 0));
        ContentCacheStats {
            memory_entries: self.memory.len(),
            memory_bytes: self.memory.total_bytes(),
            disk_entries,
            disk_bytes,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

pub fn cache_key(txid: &str, path: &str) -> String {
    format!("{txid}|{path}")
}

impl DiskStore {
    fn open(dir: &Path, max_total_bytes: u64) -> Result<Self, Error> {
        std::fs::create_dir_all(dir).map_err(|e| Error::CacheIo {
            message: format!("failed to create {}: {e}", dir.display()),
        })?;

        let mut metas: Vec<(PathBuf, MetaFile)> = Vec::new();
        let entries = std::fs::read_dir(dir).map_err(|e| Error::CacheIo {
            message: format!("failed to scan {}: {e}", dir.display()),
        })?;
        for dir_entry in entries.flatten() {
            let file_path = dir_entry.path();
            let name = dir_entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".tmp") {
                // Crash debris from an interrupted write.
                let _ = std::fs::remove_file(&file_path);
                continue;
            }
            if !name.ends_with(".meta.json") {
                continue;
            }
            match std::fs::read(&file_path)
                .ok()
                .and_then(|raw| serde_json::from_slice::<MetaFile>(&raw).ok())
            {
                Some(meta) => metas.push((file_path, meta)),
                None => {
                    tracing::warn!(file = %file_path.display(), "dropping unreadable cache meta");
                    let _ = std::fs::remove_file(&file_path);
                }
            }
        }

        // Newest first; older entries are the first dropped when the scan
        // would overflow the byte budget.
        metas.sort_by_key(|(_, meta)| std::cmp::Reverse(meta.verified_at.timestamp_millis()));

        let mut map = HashMap::new();
        let mut total_bytes = 0u64;
        for (meta_path, meta) in metas {
            let bin_path = dir.join(format!("{}.bin", meta.hash));
            let bin_ok = std::fs::metadata(&bin_path)
                .map(|m| m.len() == meta.content_length)
                .unwrap_or(false);
            if !bin_ok || total_bytes + meta.content_length > max_total_bytes {
                let _ = std::fs::remove_file(&bin_path);
                let _ = std::fs::remove_file(&meta_path);
                continue;
            }
            total_bytes += meta.content_length;
            let verified_at_ms = meta.verified_at.timestamp_millis().max(0) as u64;
            map.insert(
                cache_key(&meta.txid, &meta.path),
                DiskEntry {
                    hash: meta.hash,
                    bytes: meta.content_length,
                    verified_at_ms,
                    last_accessed_ms: verified_at_ms,
                    content_type: meta.content_type,
                    headers: meta.headers,
                    txid: meta.txid,
                },
            );
        }
        tracing::info!(
            entries = map.len(),
            bytes = total_bytes,
            dir = %dir.display(),
            "content cache index rebuilt"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            max_total_bytes,
            inner: Mutex::new(DiskInner { map, total_bytes }),
        })
    }

    fn contains(&self, key: &str) -> bool {
        self.inner
            .lock()
            .map(|inner| inner.map.contains_key(key))
            .unwrap_or(false)
    }

    fn usage(&self) -> (usize, u64) {
        self.inner
            .lock()
            .map(|inner| (inner.map.len(), inner.total_bytes))
            .unwrap_or((0, 0))
    }

    async fn load(&self, key: &str) -> Result<Option<CachedContent>, Error> {
        let entry = {
            let inner = self.inner.lock().map_err(poisoned)?;
            match inner.map.get(key) {
                Some(entry) => entry.clone(),
                None => return Ok(None),
            }
        };

        let bin_path = self.dir.join(format!("{}.bin", entry.hash));
        match tokio::fs::read(&bin_path).await {
            Ok(data) => {
                let mut inner = self.inner.lock().map_err(poisoned)?;
                if let Some(live) = inner.map.get_mut(key) {
                    live.last_accessed_ms = epoch_ms();
                }
                drop(inner);
                Ok(Some(CachedContent {
                    data: Bytes::from(data),
                    content_type: entry.content_type,
                    content_length: entry.bytes,
                    headers: entry.headers,
                    verified_at_ms: entry.verified_at_ms,
                    txid: entry.txid,
                    hash: entry.hash,
                    access: Arc::new(AccessStats::default()),
                }))
            }
            Err(e) => {
                // The body vanished out from under the index: purge the
                // stale entry and report a miss.
                tracing::warn!(key, "cache body missing ({e}), purging index entry");
                let removed = {
                    let mut inner = self.inner.lock().map_err(poisoned)?;
                    match inner.map.remove(key) {
                        Some(entry) => {
                            inner.total_bytes = inner.total_bytes.saturating_sub(entry.bytes);
                            Some(entry)
                        }
                        None => None,
                    }
                };
                if let Some(entry) = removed {
                    let _ = tokio::fs::remove_file(self.meta_path(&entry.hash)).await;
                }
                Ok(None)
            }
        }
    }

    async fn persist(&self, key: &str, entry: &CachedContent) -> Result<(), Error> {
        // Make room first, then write through `.tmp` + rename.
        let victims = {
            let mut inner = self.inner.lock().map_err(poisoned)?;
            if let Some(old) = inner.map.remove(key) {
                inner.total_bytes = inner.total_bytes.saturating_sub(old.bytes);
            }
            let mut victims = Vec::new();
            while inner.total_bytes + entry.data.len() as u64 > self.max_total_bytes {
                let oldest = inner
                    .map
                    .iter()
                    .min_by_key(|(_, e)| e.last_accessed_ms)
                    .map(|(k, _)| k.clone());
                match oldest {
                    Some(victim_key) => {
                        if let Some(victim) = inner.map.remove(&victim_key) {
                            inner.total_bytes =
                                inner.total_bytes.saturating_sub(victim.bytes);
                            victims.push(victim);
                        }
                    }
                    None => break,
                }
            }
            victims
        };
        for victim in victims {
            self.delete_files(&victim.hash).await;
        }

        let meta = MetaFile {
            txid: entry.txid.clone(),
            path: key.split_once('|').map(|(_, p)| p).unwrap_or("").to_string(),
            hash: entry.hash.clone(),
            content_type: entry.content_type.clone(),
            content_length: entry.data.len() as u64,
            headers: entry.headers.clone(),
            verified_at: Utc
                .timestamp_millis_opt(entry.verified_at_ms as i64)
                .single()
                .unwrap_or_else(Utc::now),
            access_count: entry.access_count(),
        };
        let meta_json = serde_json::to_vec_pretty(&meta).map_err(|e| Error::CacheIo {
            message: format!("failed to serialize cache meta: {e}"),
        })?;

        self.write_atomic(&self.bin_path(&entry.hash), &entry.data).await?;
        self.write_atomic(&self.meta_path(&entry.hash), &meta_json).await?;

        let mut inner = self.inner.lock().map_err(poisoned)?;
        inner.total_bytes += entry.data.len() as u64;
        inner.map.insert(
            key.to_string(),
            DiskEntry {
                hash: entry.hash.clone(),
                bytes: entry.data.len() as u64,
                verified_at_ms: entry.verified_at_ms,
                last_accessed_ms: epoch_ms(),
                content_type: entry.content_type.clone(),
                headers: entry.headers.clone(),
                txid: entry.txid.clone(),
            },
        );
        Ok(())
    }

    async fn remove_prefix(&self, prefix: &str) {
        let victims = {
            let mut inner = match self.inner.lock() {
                Ok(inner) => inner,
                Err(_) => return,
            };
            let doomed: Vec<String> = inner
                .map
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect();
            let mut victims = Vec::new();
            for key in doomed {
                if let Some(entry) = inner.map.remove(&key) {
                    inner.total_bytes = inner.total_bytes.saturating_sub(entry.bytes);
                    victims.push(entry);
                }
            }
            victims
        };
        for victim in victims {
            self.delete_files(&victim.hash).await;
        }
    }

    async fn clear(&self) {
        let victims = {
            let mut inner = match self.inner.lock() {
                Ok(inner) => inner,
                Err(_) => return,
            };
            inner.total_bytes = 0;
            inner.map.drain().map(|(_, entry)| entry).collect::<Vec<_>>()
        };
        for victim in victims {
            self.delete_files(&victim.hash).await;
        }
    }

    async fn write_atomic(&self, target: &Path, contents: &[u8]) -> Result<(), Error> {
        let tmp = target.with_extension(
            target
                .extension()
                .map(|ext| format!("{}.tmp", ext.to_string_lossy()))
                .unwrap_or_else(|| "tmp".to_string()),
        );
        tokio::fs::write(&tmp, contents)
            .await
            .map_err(|e| Error::CacheIo {
                message: format!("failed to write {}: {e}", tmp.display()),
            })?;
        tokio::fs::rename(&tmp, target)
            .await
            .map_err(|e| Error::CacheIo {
                message: format!("failed to rename {} into place: {e}", tmp.display()),
            })
    }

    async fn delete_files(&self, hash: &str) {
        let _ = tokio::fs::remove_file(self.bin_path(hash)).await;
        let _ = tokio::fs::remove_file(self.meta_path(hash)).await;
    }

    fn bin_path(&self, hash: &str) -> PathBuf {
        self.dir.join(format!("{hash}.bin"))
    }

    fn meta_path(&self, hash: &str) -> PathBuf {
        self.dir.join(format!("{hash}.meta.json"))
    }
}

fn poisoned<T>(_: std::sync::PoisonError<T>) -> Error {
    Error::CacheIo {
        message: "disk cache lock poisoned".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha2::{Digest, Sha256};

    fn settings() -> CacheSettings {
        CacheSettings {
            max_item_bytes: 100,
            max_total_bytes: 250,
            max_entries: 10,
            ..CacheSettings::default()
        }
    }

    fn entry(txid: &str, body: &[u8]) -> CachedContent {
        let hash = hex::encode(Sha256::digest(body));
        CachedContent::new(
            Bytes::copy_from_slice(body),
            "text/plain".to_string(),
            vec![("x-ar-io-data-id".to_string(), txid.to_string())],
            txid.to_string(),
            hash,
        )
    }

    #[tokio::test]
    async fn memory_round_trip() {
        let cache = ContentCache::new(&settings()).unwrap();
        assert!(cache.set("tx1", "", entry("tx1", b"hello")).await);
        let hit = cache.get("tx1", "").await.unwrap();
        assert_eq!(&hit.data[..], b"hello");
        assert_eq!(hit.access_count(), 1);
        assert!(cache.has("tx1", "").await);
        assert!(cache.get("tx2", "").await.is_none());
    }

    #[tokio::test]
    async fn oversized_items_are_rejected() {
        let cache = ContentCache::new(&settings()).unwrap();
        assert!(!cache.set("tx1", "", entry("tx1", &[0u8; 101])).await);
        assert!(!cache.has("tx1", "").await);
    }

    #[tokio::test]
    async fn total_budget_evicts_older_entries() {
        let cache = ContentCache::new(&settings()).unwrap();
        assert!(cache.set("tx1", "", entry("tx1", &[1u8; 100])).await);
        assert!(cache.set("tx2", "", entry("tx2", &[2u8; 100])).await);
        assert!(cache.set("tx3", "", entry("tx3", &[3u8; 100])).await);
        let stats = cache.stats();
        assert!(stats.memory_bytes <= 250);
        assert!(cache.get("tx1", "").await.is_none(), "oldest must be evicted");
        assert!(cache.get("tx3", "").await.is_some());
    }

    #[tokio::test]
    async fn invalidate_removes_all_path_variants() {
        let cache = ContentCache::new(&settings()).unwrap();
        cache.set("tx1", "", entry("tx1", b"a")).await;
        cache.set("tx1", "a/b", entry("tx1", b"b")).await;
        cache.set("tx2", "", entry("tx2", b"c")).await;
        cache.invalidate("tx1").await;
        assert!(!cache.has("tx1", "").await);
        assert!(!cache.has("tx1", "a/b").await);
        assert!(cache.has("tx2", "").await);
    }

    #[tokio::test]
    async fn disk_mode_persists_and_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let disk_settings = CacheSettings {
            content_path: Some(dir.path().to_path_buf()),
            ..settings()
        };

        {
            let cache = ContentCache::new(&disk_settings).unwrap();
            assert!(cache.set("tx1", "", entry("tx1", b"persisted")).await);
        }

        // Both files exist, no `.tmp` debris.
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.iter().any(|n| n.ends_with(".bin")));
        assert!(names.iter().any(|n| n.ends_with(".meta.json")));
        assert!(!names.iter().any(|n| n.ends_with(".tmp")));

        // A fresh cache over the same directory rebuilds the index.
        let cache = ContentCache::new(&disk_settings).unwrap();
        let hit = cache.get("tx1", "").await.unwrap();
        assert_eq!(&hit.data[..], b"persisted");
        assert_eq!(hit.content_type, "text/plain");
    }

    #[tokio::test]
    async fn startup_scan_deletes_tmp_debris() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("deadbeef.bin.tmp"), b"junk").unwrap();
        std::fs::write(dir.path().join("deadbeef.meta.json.tmp"), b"junk").unwrap();

        let disk_settings = CacheSettings {
            content_path: Some(dir.path().to_path_buf()),
            ..settings()
        };
        let cache = ContentCache::new(&disk_settings).unwrap();
        assert_eq!(cache.stats().disk_entries, 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn missing_bin_purges_the_index_entry() {
        let dir = tempfile::tempdir().unwrap();
        let disk_settings = CacheSettings {
            content_path: Some(dir.path().to_path_buf()),
            ..settings()
        };
        let hash = {
            let cache = ContentCache::new(&disk_settings).unwrap();
            let e = entry("tx1", b"body");
            let hash = e.hash.clone();
            cache.set("tx1", "", e).await;
            hash
        };
        std::fs::remove_file(dir.path().join(format!("{hash}.bin"))).unwrap();

        let cache = ContentCache::new(&disk_settings).unwrap();
        // The startup scan already drops entries whose body is missing.
        assert!(cache.get("tx1", "").await.is_none());
        assert_eq!(cache.stats().disk_entries, 0);
    }

    #[tokio::test]
    async fn startup_scan_enforces_the_byte_budget() {
        let dir = tempfile::tempdir().unwrap();
        let disk_settings = CacheSettings {
            content_path: Some(dir.path().to_path_buf()),
            ..settings()
        };
        {
            let cache = ContentCache::new(&disk_settings).unwrap();
            cache.set("tx1", "", entry("tx1", &[1u8; 100])).await;
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            cache.set("tx2", "", entry("tx2", &[2u8; 100])).await;
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            cache.set("tx3", "", entry("tx3", &[3u8; 100])).await;
        }

        // Reload with a tighter budget: only the newest entries fit.
        let tight = CacheSettings {
            max_total_bytes: 200,
            ..disk_settings
        };
        let cache = ContentCache::new(&tight).unwrap();
        let stats = cache.stats();
        assert!(stats.disk_bytes <= 200);
        assert!(stats.disk_entries <= 2);
        assert!(cache.get("tx3", "").await.is_some(), "newest survives");
    }

    #[tokio::test]
    async fn disk_budget_evicts_lru_on_write() {
        let dir = tempfile::tempdir().unwrap();
        let disk_settings = CacheSettings {
            content_path: Some(dir.path().to_path_buf()),
            ..settings()
        };
        let cache = ContentCache::new(&disk_settings).unwrap();
        cache.set("tx1", "", entry("tx1", &[1u8; 100])).await;
        cache.set("tx2", "", entry("tx2", &[2u8; 100])).await;
        cache.set("tx3", "", entry("tx3", &[3u8; 100])).await;
        let stats = cache.stats();
        assert!(stats.disk_bytes <= 250, "disk stays within budget");
        assert_eq!(stats.disk_entries, 2);
    }

    #[tokio::test]
    async fn clear_removes_everything_including_files() {
        let dir = tempfile::tempdir().unwrap();
        let disk_settings = CacheSettings {
            content_path: Some(dir.path().to_path_buf()),
            ..settings()
        };
        let cache = ContentCache::new(&disk_settings).unwrap();
        cache.set("tx1", "", entry("tx1", b"a")).await;
        cache.clear().await;
        assert_eq!(cache.stats().memory_entries, 0);
        assert_eq!(cache.stats().disk_entries, 0);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
