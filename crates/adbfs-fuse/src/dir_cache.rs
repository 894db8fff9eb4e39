//! TTL cache of directory listings.
//!
//! Values are a listing in device order plus a base-name index built once
//! at insert; the caching device client answers per-child stats from the
//! index. The filesystem root is never stored, so the root listing is
//! always fetched live.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use adbfs_adb::DirEntry;
use tracing::debug;

use crate::error::Result;

pub const DEFAULT_CACHE_TTL: Duration = Duration::from_millis(300);
pub const CACHE_PURGE_INTERVAL: Duration = Duration::from_secs(300);

/// A directory listing with a by-name index over the same entries.
#[derive(Debug)]
pub struct CachedDirEntries {
    pub in_order: Vec<DirEntry>,
    pub by_name: HashMap<String, DirEntry>,
}

impl CachedDirEntries {
    pub fn new(entries: Vec<DirEntry>) -> Self {
        let by_name = entries
            .iter()
            .map(|e| (e.name.clone(), e.clone()))
            .collect();
        Self {
            in_order: entries,
            by_name,
        }
    }
}

struct Slot {
    entries: Arc<CachedDirEntries>,
    expires_at: Instant,
}

/// Maps absolute directory paths to listings, each with an absolute expiry
/// instant. Expired entries are never returned.
pub struct DirEntryCache {
    ttl: Duration,
    slots: Mutex<HashMap<String, Slot>>,
}

impl DirEntryCache {
    pub fn new(ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            ttl,
            slots: Mutex::new(HashMap::new()),
        })
    }

    /// Spawns the periodic purge. The thread holds only a weak reference
    /// and exits once the cache is dropped.
    pub fn start_purge(self: &Arc<Self>) {
        let weak: Weak<DirEntryCache> = Arc::downgrade(self);
        std::thread::Builder::new()
            .name("dir-cache-purge".to_string())
            .spawn(move || loop {
                std::thread::sleep(CACHE_PURGE_INTERVAL);
                match weak.upgrade() {
                    Some(cache) => {
                        cache.purge_expired();
                    }
                    None => return,
                }
            })
            .expect("spawning cache purge thread");
    }

    pub fn get(&self, path: &str) -> Option<Arc<CachedDirEntries>> {
        let mut slots = self.slots.lock().unwrap();
        match slots.get(path) {
            Some(slot) if slot.expires_at > Instant::now() => Some(Arc::clone(&slot.entries)),
            Some(_) => {
                slots.remove(path);
                None
            }
            None => None,
        }
    }

    /// Returns the cached listing for `path`, or invokes `loader` and
    /// caches its result. The boolean is the hit flag.
    ///
    /// The loader runs outside the cache lock, so concurrent misses for the
    /// same path may each load; the underlying device calls are idempotent
    /// and the last writer wins.
    pub fn get_or_load<F>(&self, path: &str, loader: F) -> Result<(Arc<CachedDirEntries>, bool)>
    where
        F: FnOnce(&str) -> Result<Vec<DirEntry>>,
    {
        if let Some(entries) = self.get(path) {
            return Ok((entries, true));
        }

        let entries = Arc::new(CachedDirEntries::new(loader(path)?));

        // The root listing is always served live.
        if path != "/" {
            let mut slots = self.slots.lock().unwrap();
            slots.insert(
                path.to_string(),
                Slot {
                    entries: Arc::clone(&entries),
                    expires_at: Instant::now() + self.ttl,
                },
            );
        }
        Ok((entries, false))
    }

    /// Drops the listing for `path`; the next `get` is guaranteed to miss.
    /// Called after any write into that directory.
    pub fn invalidate(&self, path: &str) {
        let removed = self.slots.lock().unwrap().remove(path).is_some();
        if removed {
            debug!(path, "dir cache entry invalidated");
        }
    }

    pub fn purge_expired(&self) -> usize {
        let mut slots = self.slots.lock().unwrap();
        let before = slots.len();
        let now = Instant::now();
        slots.retain(|_, slot| slot.expires_at > now);
        let purged = before - slots.len();
        if purged > 0 {
            debug!(purged, "dir cache purge");
        }
        purged
    }

    pub fn len(&self) -> usize {
        self.slots.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
