//! Content-addressed disk cache of retrieval results.
//!
//! One JSON file per (query, method, k) under a namespace directory derived
//! from the corpus, so results computed against one corpus are never served
//! for another. Entries are written to a temp file in the same directory and
//! renamed into place, so concurrent readers see either the old entry or the
//! new one, never a partial file.
//!
//! I/O problems never fail a task: a bad read is a miss and a failed write is
//! logged and counted.

use std::fs;
use std::io::Write as _;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::corpus::Corpus;
use crate::model::types::RankedDocument;

const ENTRY_EXTENSION: &str = "json";

/// Length of the corpus digest prefix used as the namespace directory name.
const NAMESPACE_LEN: usize = 16;

/// BLAKE3 digest of (query, canonical method, k).
///
/// Each component is length-prefixed so `("a_b", "c")` and `("a", "b_c")`
/// never hash the same bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn new(query: &str, method: &str, k: usize) -> Self {
        let mut hasher = blake3::Hasher::new();
        for part in [query.as_bytes(), method.as_bytes()] {
            hasher.update(&(part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        hasher.update(&(k as u64).to_le_bytes());
        Self(hasher.finalize().to_hex().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CacheKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("undecodable cache entry {path}: {source}")]
    Decode {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("failed to encode cache entry: {0}")]
    Encode(#[from] serde_json::Error),
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> CacheError + '_ {
    move |source| CacheError::Io {
        path: path.to_path_buf(),
        source,
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    write_failures: AtomicU64,
}

/// Snapshot of a store's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheCounters {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub write_failures: u64,
}

/// Disk-backed result cache for one namespace.
pub struct DiskCache {
    dir: PathBuf,
    max_entries: Option<usize>,
    memory: Option<Mutex<LruCache<String, Arc<Vec<RankedDocument>>>>>,
    counters: Counters,
}

impl std::fmt::Debug for DiskCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiskCache")
            .field("dir", &self.dir)
            .field("max_entries", &self.max_entries)
            .field("counters", &self.counters())
            .finish()
    }
}

impl DiskCache {
    /// A store rooted at `root/namespace`. The directory is created on first write.
    pub fn open(root: &Path, namespace: &str, config: &CacheConfig) -> Self {
        let memory =
            NonZeroUsize::new(config.memory_entries).map(|cap| Mutex::new(LruCache::new(cap)));
        Self {
            dir: root.join(namespace),
            max_entries: config.max_entries,
            memory,
            counters: Counters::default(),
        }
    }

    /// A store whose namespace is derived from the corpus content and fields.
    pub fn for_corpus(root: &Path, corpus: &Corpus, config: &CacheConfig) -> Self {
        let digest = corpus.digest();
        let namespace = &digest[..digest.len().min(NAMESPACE_LEN)];
        Self::open(root, namespace, config)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn entry_path(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{}.{ENTRY_EXTENSION}", key.as_str()))
    }

    /// Look up an entry. Any read or decode problem counts as a miss.
    pub fn get(&self, key: &CacheKey) -> Option<Vec<RankedDocument>> {
        if let Some(memory) = &self.memory
            && let Some(hit) = memory.lock().get(key.as_str())
        {
            self.counters.hits.fetch_add(1, Ordering::Relaxed);
            return Some(hit.as_ref().clone());
        }

        match self.read_entry(key) {
            Ok(Some(value)) => {
                self.counters.hits.fetch_add(1, Ordering::Relaxed);
                self.remember(key, &value);
                Some(value)
            }
            Ok(None) => {
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            Err(err) => {
                warn!(key = %key, error = %err, "cache read failed; treating as miss");
                self.counters.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Store an entry, replacing any previous value. Failures are logged, not returned.
    pub fn put(&self, key: &CacheKey, value: &[RankedDocument]) {
        match self.write_entry(key, value) {
            Ok(()) => {
                self.counters.writes.fetch_add(1, Ordering::Relaxed);
                self.remember(key, value);
                if let Some(max) = self.max_entries
                    && let Err(err) = self.prune(max, key)
                {
                    warn!(dir = %self.dir.display(), error = %err, "cache pruning failed");
                }
            }
            Err(err) => {
                self.counters.write_failures.fetch_add(1, Ordering::Relaxed);
                warn!(key = %key, error = %err, "cache write failed; continuing without cache");
            }
        }
    }

    pub fn counters(&self) -> CacheCounters {
        CacheCounters {
            hits: self.counters.hits.load(Ordering::Relaxed),
            misses: self.counters.misses.load(Ordering::Relaxed),
            writes: self.counters.writes.load(Ordering::Relaxed),
            write_failures: self.counters.write_failures.load(Ordering::Relaxed),
        }
    }

    /// Number of entries currently on disk in this namespace.
    pub fn entry_count(&self) -> usize {
        list_entries(&self.dir).map(|e| e.len()).unwrap_or(0)
    }

    fn remember(&self, key: &CacheKey, value: &[RankedDocument]) {
        if let Some(memory) = &self.memory {
            memory
                .lock()
                .put(key.as_str().to_string(), Arc::new(value.to_vec()));
        }
    }

    fn read_entry(&self, key: &CacheKey) -> Result<Option<Vec<RankedDocument>>, CacheError> {
        let path = self.entry_path(key);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CacheError::Io { path, source }),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| CacheError::Decode { path, source })
    }

    fn write_entry(&self, key: &CacheKey, value: &[RankedDocument]) -> Result<(), CacheError> {
        fs::create_dir_all(&self.dir).map_err(io_err(&self.dir))?;
        let payload = serde_json::to_vec(value)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir).map_err(io_err(&self.dir))?;
        tmp.write_all(&payload).map_err(io_err(tmp.path()))?;
        let path = self.entry_path(key);
        tmp.persist(&path).map_err(|e| CacheError::Io {
            path: path.clone(),
            source: e.error,
        })?;
        debug!(key = %key, bytes = payload.len(), "cache entry written");
        Ok(())
    }

    /// Delete the oldest entries until at most `max` remain. `keep` is never removed.
    fn prune(&self, max: usize, keep: &CacheKey) -> Result<usize, CacheError> {
        let mut entries = list_entries(&self.dir)?;
        if entries.len() <= max {
            return Ok(0);
        }
        let keep_path = self.entry_path(keep);
        entries.retain(|e| e.path != keep_path);
        entries.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));

        // `keep` counts toward the bound.
        let excess = (entries.len() + 1).saturating_sub(max);
        let mut removed = 0;
        for entry in entries.into_iter().take(excess) {
            match fs::remove_file(&entry.path) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(source) => {
                    return Err(CacheError::Io {
                        path: entry.path,
                        source,
                    });
                }
            }
            if let (Some(memory), Some(stem)) = (&self.memory, entry.path.file_stem()) {
                memory.lock().pop(stem.to_string_lossy().as_ref());
            }
        }
        debug!(removed, max, "pruned cache namespace");
        Ok(removed)
    }
}

struct EntryFile {
    path: PathBuf,
    modified: SystemTime,
    len: u64,
}

fn list_entries(dir: &Path) -> Result<Vec<EntryFile>, CacheError> {
    let read_dir = match fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(CacheError::Io {
                path: dir.to_path_buf(),
                source,
            });
        }
    };
    let mut entries = Vec::new();
    for item in read_dir {
        let item = item.map_err(io_err(dir))?;
        let path = item.path();
        if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXTENSION) {
            continue;
        }
        let Ok(meta) = item.metadata() else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        entries.push(EntryFile {
            path,
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            len: meta.len(),
        });
    }
    Ok(entries)
}

/// Totals over a whole cache directory.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheDirStats {
    pub dir: PathBuf,
    pub namespaces: usize,
    pub entries: usize,
    pub bytes: u64,
}

fn namespace_dirs(root: &Path) -> Result<Vec<PathBuf>, CacheError> {
    let read_dir = match fs::read_dir(root) {
        Ok(rd) => rd,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(CacheError::Io {
                path: root.to_path_buf(),
                source,
            });
        }
    };
    let mut dirs = Vec::new();
    for item in read_dir {
        let path = item.map_err(io_err(root))?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Count the entries and bytes under `root`.
pub fn dir_stats(root: &Path) -> Result<CacheDirStats, CacheError> {
    let mut stats = CacheDirStats {
        dir: root.to_path_buf(),
        ..CacheDirStats::default()
    };
    for dir in namespace_dirs(root)? {
        let entries = list_entries(&dir)?;
        if entries.is_empty() {
            continue;
        }
        stats.namespaces += 1;
        stats.entries += entries.len();
        stats.bytes += entries.iter().map(|e| e.len).sum::<u64>();
    }
    Ok(stats)
}

/// Remove every cache entry under `root`. Returns the number of entries removed.
///
/// Only `*.json` files inside namespace directories are deleted; namespace
/// directories left empty are removed as well.
pub fn clear_dir(root: &Path) -> Result<usize, CacheError> {
    let mut removed = 0;
    for dir in namespace_dirs(root)? {
        for entry in list_entries(&dir)? {
            fs::remove_file(&entry.path).map_err(io_err(&entry.path))?;
            removed += 1;
        }
        // Leaves directories that still hold foreign files.
        let _ = fs::remove_dir(&dir);
    }
    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_entries: Option<usize>, memory_entries: usize) -> CacheConfig {
        CacheConfig {
            max_entries,
            memory_entries,
            ..CacheConfig::default()
        }
    }

    fn docs() -> Vec<RankedDocument> {
        vec![RankedDocument::new(2, 0.9), RankedDocument::new("x", 0.5)]
    }

    #[test]
    fn key_is_hex_digest() {
        let key = CacheKey::new("finance in Paris", "bm25", 2);
        assert_eq!(key.as_str().len(), 64);
        assert!(key.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(key, CacheKey::new("finance in Paris", "bm25", 2));
        assert_ne!(key, CacheKey::new("finance in Paris", "bm25", 3));
    }

    #[test]
    fn key_components_do_not_collide() {
        assert_ne!(CacheKey::new("a_b", "c", 1), CacheKey::new("a", "b_c", 1));
    }

    #[test]
    fn miss_then_hit() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(tmp.path(), "ns", &config(None, 0));
        let key = CacheKey::new("q", "bm25", 2);
        assert!(cache.get(&key).is_none());
        cache.put(&key, &docs());
        assert_eq!(cache.get(&key), Some(docs()));
        let counters = cache.counters();
        assert_eq!((counters.hits, counters.misses, counters.writes), (1, 1, 1));
    }

    #[test]
    fn concurrent_writers_never_expose_partial_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(tmp.path(), "ns", &config(None, 0));
        let key = CacheKey::new("finance in Paris", "bm25", 500);
        let values: Vec<Vec<RankedDocument>> = (1..=4usize)
            .map(|t| {
                (0..t * 120)
                    .map(|i| RankedDocument::new(i as i64, 1.0 / (t as f32 + i as f32)))
                    .collect()
            })
            .collect();

        std::thread::scope(|scope| {
            for value in &values {
                let (cache, key, values) = (&cache, &key, &values);
                scope.spawn(move || {
                    for _ in 0..40 {
                        cache.put(key, value);
                        if let Some(read) = cache.get(key) {
                            assert!(values.contains(&read), "torn read of {} docs", read.len());
                        }
                    }
                });
            }
        });

        let last = cache.get(&key).unwrap();
        assert!(values.contains(&last));
        let counters = cache.counters();
        assert_eq!(counters.write_failures, 0);
        assert_eq!(counters.writes, 160);
        assert_eq!(entry_count_on_disk(tmp.path()), 1);
    }

    fn entry_count_on_disk(root: &Path) -> usize {
        dir_stats(root).unwrap().entries
    }

    #[test]
    fn entries_survive_a_new_store() {
        let tmp = tempfile::tempdir().unwrap();
        let key = CacheKey::new("q", "tfidf", 5);
        DiskCache::open(tmp.path(), "ns", &config(None, 8)).put(&key, &docs());
        let reopened = DiskCache::open(tmp.path(), "ns", &config(None, 8));
        assert_eq!(reopened.get(&key), Some(docs()));
    }

    #[test]
    fn put_replaces_previous_value() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(tmp.path(), "ns", &config(None, 0));
        let key = CacheKey::new("q", "bm25", 1);
        cache.put(&key, &docs());
        cache.put(&key, &[RankedDocument::new(9, 0.1)]);
        assert_eq!(cache.get(&key), Some(vec![RankedDocument::new(9, 0.1)]));
        assert_eq!(cache.entry_count(), 1);
    }

    #[test]
    fn corrupt_entry_is_a_miss() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(tmp.path(), "ns", &config(None, 0));
        let key = CacheKey::new("q", "bm25", 1);
        fs::create_dir_all(cache.dir()).unwrap();
        fs::write(cache.entry_path(&key), b"{not json").unwrap();
        assert!(cache.get(&key).is_none());
        assert_eq!(cache.counters().misses, 1);
    }

    #[test]
    fn write_failure_is_counted_not_raised() {
        let tmp = tempfile::tempdir().unwrap();
        let blocker = tmp.path().join("file");
        fs::write(&blocker, b"x").unwrap();
        // The namespace path sits under a regular file, so create_dir_all fails.
        let cache = DiskCache::open(&blocker, "ns", &config(None, 0));
        cache.put(&CacheKey::new("q", "bm25", 1), &docs());
        assert_eq!(cache.counters().write_failures, 1);
        assert_eq!(cache.counters().writes, 0);
    }

    #[test]
    fn bound_prunes_oldest_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = DiskCache::open(tmp.path(), "ns", &config(Some(2), 0));
        let keys: Vec<CacheKey> = (1..=4).map(|k| CacheKey::new("q", "bm25", k)).collect();
        for key in &keys {
            cache.put(key, &docs());
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert_eq!(cache.entry_count(), 2);
        assert!(cache.get(&keys[3]).is_some());
        assert!(cache.get(&keys[0]).is_none());
    }

    #[test]
    fn dir_stats_and_clear() {
        let tmp = tempfile::tempdir().unwrap();
        let a = DiskCache::open(tmp.path(), "a", &config(None, 0));
        let b = DiskCache::open(tmp.path(), "b", &config(None, 0));
        a.put(&CacheKey::new("q1", "bm25", 1), &docs());
        a.put(&CacheKey::new("q2", "bm25", 1), &docs());
        b.put(&CacheKey::new("q1", "bm25", 1), &docs());

        let stats = dir_stats(tmp.path()).unwrap();
        assert_eq!(stats.namespaces, 2);
        assert_eq!(stats.entries, 3);
        assert!(stats.bytes > 0);

        assert_eq!(clear_dir(tmp.path()).unwrap(), 3);
        assert_eq!(dir_stats(tmp.path()).unwrap().entries, 0);
    }

    #[test]
    fn missing_root_has_empty_stats() {
        let tmp = tempfile::tempdir().unwrap();
        let stats = dir_stats(&tmp.path().join("absent")).unwrap();
        assert_eq!(stats.entries, 0);
        assert_eq!(clear_dir(&tmp.path().join("absent")).unwrap(), 0);
    }
}
