//! Persistent per-file record cache.
//!
//! Records are kept in memory keyed by transcript path and validated against
//! the file's modification time. The map is mirrored to a single JSON file
//! whose name carries the schema version, so an incompatible cache from an
//! older build is simply never opened.
//!
//! ## Persistence
//!
//! - Loaded once when the store is opened
//! - Written by a background flusher after a burst of mutations settles
//! - Written one last time when the store is dropped
//! - Corrupt or unreadable state is discarded with a warning

use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::CacheError;
use crate::types::SessionRecord;
use crate::utils::file_stamp;

/// Bump whenever `SessionRecord` or the file layout changes shape.
pub const CACHE_VERSION: u32 = 3;

pub fn cache_file_name() -> String {
    format!("record-cache.v{CACHE_VERSION}.json")
}

/// One cached record together with the modification time it was parsed at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub mtime_ms: i64,
    pub record: SessionRecord,
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheFile {
    version: u32,
    entries: BTreeMap<String, CacheEntry>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
}

struct Shared {
    entries: RwLock<HashMap<PathBuf, CacheEntry>>,
    /// `None` for a store that never touches disk.
    file: Option<PathBuf>,
    dirty: AtomicBool,
    hits: AtomicU64,
    misses: AtomicU64,
    /// Serializes writers of the durable file.
    write_lock: Mutex<()>,
}

impl Shared {
    fn persist(&self) -> Result<(), CacheError> {
        let Some(path) = &self.file else {
            return Ok(());
        };
        let _guard = self.write_lock.lock();
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let snapshot = CacheFile {
            version: CACHE_VERSION,
            entries: self
                .entries
                .read()
                .iter()
                .map(|(path, entry)| (path.to_string_lossy().into_owned(), entry.clone()))
                .collect(),
        };

        let result = write_atomically(path, &snapshot);
        if result.is_err() {
            // Leave the store dirty so the next flush retries.
            self.dirty.store(true, Ordering::Release);
        } else {
            debug!(entries = snapshot.entries.len(), path = %path.display(), "record cache persisted");
        }
        result
    }
}

fn write_atomically(path: &Path, snapshot: &CacheFile) -> Result<(), CacheError> {
    let bytes = simd_json::to_vec(snapshot).map_err(|e| CacheError::Encode(e.to_string()))?;

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(CacheError::Write)?;
    }
    // Atomic write via temp file + rename
    let temp_path = path.with_extension("tmp");
    let mut file = File::create(&temp_path).map_err(CacheError::Write)?;
    file.write_all(&bytes).map_err(CacheError::Write)?;
    file.sync_all().map_err(CacheError::Write)?;
    fs::rename(&temp_path, path).map_err(CacheError::Write)?;
    Ok(())
}

fn load_entries(path: &Path) -> Result<HashMap<PathBuf, CacheEntry>, CacheError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let mut bytes = fs::read(path).map_err(CacheError::Read)?;
    let file: CacheFile =
        simd_json::from_slice(&mut bytes).map_err(|e| CacheError::Corrupt(e.to_string()))?;
    if file.version != CACHE_VERSION {
        return Err(CacheError::Corrupt(format!(
            "version {} does not match {CACHE_VERSION}",
            file.version
        )));
    }
    Ok(file
        .entries
        .into_iter()
        .map(|(path, entry)| (PathBuf::from(path), entry))
        .collect())
}

struct Flusher {
    signal: Sender<()>,
    handle: JoinHandle<()>,
}

fn spawn_flusher(shared: Arc<Shared>, debounce: Duration) -> Option<Flusher> {
    let (signal, rx) = mpsc::channel::<()>();
    let handle = std::thread::Builder::new()
        .name("sessiondex-cache-flush".to_string())
        .spawn(move || {
            let flush = |shared: &Shared| {
                if let Err(e) = shared.persist() {
                    warn!(error = %e, "failed to persist record cache");
                }
            };

            while rx.recv().is_ok() {
                // Absorb the rest of the burst before writing.
                loop {
                    match rx.recv_timeout(debounce) {
                        Ok(()) => continue,
                        Err(RecvTimeoutError::Timeout) => break,
                        Err(RecvTimeoutError::Disconnected) => {
                            flush(&shared);
                            return;
                        }
                    }
                }
                flush(&shared);
            }
            flush(&shared);
        });

    match handle {
        Ok(handle) => Some(Flusher { signal, handle }),
        Err(e) => {
            warn!(error = %e, "could not start cache flusher; cache persists on drop only");
            None
        }
    }
}

/// Path-keyed record cache with mtime validation and debounced persistence.
pub struct RecordCache {
    shared: Arc<Shared>,
    flusher: Option<Flusher>,
}

impl RecordCache {
    /// Open the cache stored in `dir`. Never fails: unusable state starts empty.
    pub fn open(dir: &Path, flush_debounce: Duration) -> Self {
        let file = dir.join(cache_file_name());
        let entries = match load_entries(&file) {
            Ok(entries) => {
                debug!(entries = entries.len(), path = %file.display(), "record cache loaded");
                entries
            }
            Err(e) => {
                warn!(error = %e, path = %file.display(), "discarding record cache");
                HashMap::new()
            }
        };

        let shared = Arc::new(Shared {
            entries: RwLock::new(entries),
            file: Some(file),
            dirty: AtomicBool::new(false),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            write_lock: Mutex::new(()),
        });
        let flusher = spawn_flusher(Arc::clone(&shared), flush_debounce);
        Self { shared, flusher }
    }

    /// A cache with no durable backing.
    pub fn in_memory() -> Self {
        Self {
            shared: Arc::new(Shared {
                entries: RwLock::new(HashMap::new()),
                file: None,
                dirty: AtomicBool::new(false),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                write_lock: Mutex::new(()),
            }),
            flusher: None,
        }
    }

    /// Cached record for `path` if the file still has the modification time it was parsed at.
    pub fn get(&self, path: &Path) -> Option<SessionRecord> {
        match file_stamp(path) {
            Some((_, mtime_ms)) => self.get_with_mtime(path, mtime_ms),
            None => {
                self.shared.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Like [`RecordCache::get`] for callers that already stat'ed the file.
    pub fn get_with_mtime(&self, path: &Path, mtime_ms: i64) -> Option<SessionRecord> {
        let entries = self.shared.entries.read();
        match entries.get(path) {
            Some(entry) if entry.mtime_ms == mtime_ms => {
                self.shared.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.record.clone())
            }
            _ => {
                self.shared.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Entry regardless of freshness. Does not touch the hit/miss counters.
    pub fn peek(&self, path: &Path) -> Option<CacheEntry> {
        self.shared.entries.read().get(path).cloned()
    }

    /// Store `record` as parsed at `mtime_ms`.
    ///
    /// A fast record never replaces an enriched one for the same modification
    /// time. Returns whether the entry was written.
    pub fn put(&self, path: &Path, mtime_ms: i64, record: SessionRecord) -> bool {
        {
            let mut entries = self.shared.entries.write();
            if let Some(existing) = entries.get(path)
                && existing.mtime_ms == mtime_ms
                && existing.record.is_enriched()
                && !record.is_enriched()
            {
                return false;
            }
            entries.insert(path.to_path_buf(), CacheEntry { mtime_ms, record });
        }
        self.mark_dirty();
        true
    }

    pub fn invalidate(&self, path: &Path) -> bool {
        let removed = self.shared.entries.write().remove(path).is_some();
        if removed {
            self.mark_dirty();
        }
        removed
    }

    pub fn invalidate_all(&self) {
        self.shared.entries.write().clear();
        self.mark_dirty();
    }

    /// Drop entries whose file no longer exists. Returns the removed paths.
    pub fn prune_missing(&self) -> Vec<PathBuf> {
        let candidates: Vec<PathBuf> = self.shared.entries.read().keys().cloned().collect();
        let missing: Vec<PathBuf> = candidates.into_iter().filter(|p| !p.exists()).collect();
        if missing.is_empty() {
            return missing;
        }
        {
            let mut entries = self.shared.entries.write();
            for path in &missing {
                entries.remove(path);
            }
        }
        debug!(removed = missing.len(), "pruned cache entries for deleted files");
        self.mark_dirty();
        missing
    }

    pub fn len(&self) -> usize {
        self.shared.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            entries: self.len(),
            hits: self.shared.hits.load(Ordering::Relaxed),
            misses: self.shared.misses.load(Ordering::Relaxed),
        }
    }

    /// Write the durable file now if anything changed since the last write.
    pub fn persist(&self) -> Result<(), CacheError> {
        self.shared.persist()
    }

    fn mark_dirty(&self) {
        self.shared.dirty.store(true, Ordering::Release);
        if let Some(flusher) = &self.flusher {
            let _ = flusher.signal.send(());
        }
    }
}

impl Drop for RecordCache {
    fn drop(&mut self) {
        match self.flusher.take() {
            Some(Flusher { signal, handle }) => {
                // Disconnecting wakes the flusher for its final write.
                drop(signal);
                let _ = handle.join();
            }
            None => {
                if let Err(e) = self.shared.persist() {
                    warn!(error = %e, "failed to persist record cache");
                }
            }
        }
    }
}

impl std::fmt::Debug for RecordCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordCache")
            .field("entries", &self.len())
            .field("file", &self.shared.file)
            .finish()
    }
}

#[cfg(test)]
mod tests;
