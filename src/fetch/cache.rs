//! Durable content cache — store and retrieve fetched bytes by key.
//!
//! One file per entry under the cache directory, named by the (already
//! collision-resistant) cache key. The in-memory index is rebuilt by a
//! directory scan at startup so a cache left by a previous run is
//! immediately usable: this is what makes interrupted runs resumable.
//!
//! ## Eviction
//!
//! Entries are append-only and eviction is capacity-driven, oldest stored
//! first. A hit is equivalent to a fresh fetch; nothing about eviction
//! affects correctness.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::SystemTime;
use tracing::{debug, warn};

struct EntryMeta {
    stored_at: SystemTime,
    size_bytes: u64,
}

struct CacheState {
    entries: HashMap<String, EntryMeta>,
    total_bytes: u64,
}

/// Filesystem-backed key→bytes store with a size cap.
pub struct ContentCache {
    dir: PathBuf,
    size_limit: u64,
    /// When false the cache is write-only: results from this run are still
    /// stored, but pre-existing entries are never read (no-cache mode).
    read_enabled: bool,
    state: Mutex<CacheState>,
}

impl ContentCache {
    /// Open (or create) a cache directory and rebuild the index from the
    /// `.bin` files already present.
    pub fn open(dir: PathBuf, size_limit: u64, read_enabled: bool) -> Result<Self> {
        fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create cache dir: {}", dir.display()))?;

        let mut entries = HashMap::new();
        let mut total_bytes = 0u64;
        if let Ok(listing) = fs::read_dir(&dir) {
            for entry in listing.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("bin") {
                    continue;
                }
                let Some(key) = path.file_stem().and_then(|s| s.to_str()) else {
                    continue;
                };
                if let Ok(meta) = entry.metadata() {
                    let stored_at = meta.modified().unwrap_or_else(|_| SystemTime::now());
                    total_bytes += meta.len();
                    entries.insert(
                        key.to_string(),
                        EntryMeta {
                            stored_at,
                            size_bytes: meta.len(),
                        },
                    );
                }
            }
        }

        debug!(
            "content cache opened: {} entries, {} bytes, {}",
            entries.len(),
            total_bytes,
            dir.display()
        );

        Ok(Self {
            dir,
            size_limit,
            read_enabled,
            state: Mutex::new(CacheState {
                entries,
                total_bytes,
            }),
        })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{key}.bin"))
    }

    /// Read an entry. Returns `None` on a miss or in no-cache mode.
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        if !self.read_enabled {
            return None;
        }
        {
            let state = self.state.lock().ok()?;
            state.entries.get(key)?;
        }
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                // Index said present but the file is gone; drop the entry.
                warn!("cache entry {key} unreadable ({e}), dropping");
                if let Ok(mut state) = self.state.lock() {
                    if let Some(meta) = state.entries.remove(key) {
                        state.total_bytes = state.total_bytes.saturating_sub(meta.size_bytes);
                    }
                }
                None
            }
        }
    }

    /// Store an entry, evicting oldest-first while over the size cap.
    pub fn put(&self, key: &str, bytes: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        fs::write(&path, bytes)
            .with_context(|| format!("failed to write cache entry: {}", path.display()))?;

        let mut state = match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(old) = state.entries.insert(
            key.to_string(),
            EntryMeta {
                stored_at: SystemTime::now(),
                size_bytes: bytes.len() as u64,
            },
        ) {
            state.total_bytes = state.total_bytes.saturating_sub(old.size_bytes);
        }
        state.total_bytes += bytes.len() as u64;

        while state.total_bytes > self.size_limit {
            let oldest = state
                .entries
                .iter()
                .min_by_key(|(_, meta)| meta.stored_at)
                .map(|(k, _)| k.clone());
            let Some(victim) = oldest else { break };
            if victim == key {
                // A single entry larger than the cap stays; evicting the
                // bytes we just stored would defeat the write.
                break;
            }
            if let Some(meta) = state.entries.remove(&victim) {
                state.total_bytes = state.total_bytes.saturating_sub(meta.size_bytes);
                let _ = fs::remove_file(self.path_for(&victim));
                debug!("evicted cache entry {victim}");
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
