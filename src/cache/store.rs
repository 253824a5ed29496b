//! Thread-safe image cache: a `BoundedCache` behind a mutex, an optional disk
//! mirror, lazy staleness checks and hit/miss counters.

use super::disk::DiskMirror;
use super::key::CacheKey;
use super::lru::BoundedCache;
use super::staleness::{self, Freshness};
use crate::config::TierConfig;
use crate::decode::DecodedImage;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, trace};

/// A resident cache entry
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub image: Arc<DecodedImage>,
    pub cost: u64,
    pub cached_at: DateTime<Utc>,
    /// Source modification time the image was decoded from
    pub source_modified: SystemTime,
    /// Cache generation the entry was inserted under
    pub generation: u64,
}

/// Point-in-time view of one cache's counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub entries: usize,
    pub total_cost: u64,
    pub count_limit: usize,
    pub cost_limit: u64,
    pub hits: u64,
    pub misses: u64,
    pub disk_hits: u64,
    pub inserts: u64,
    pub evictions: u64,
    pub stale_evictions: u64,
    /// Results dropped because a clear or a source change raced the decode
    pub discarded_writes: u64,
}

impl CacheStats {
    /// Fraction of lookups served from memory or disk
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    disk_hits: AtomicU64,
    inserts: AtomicU64,
    evictions: AtomicU64,
    stale_evictions: AtomicU64,
    discarded_writes: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// One tier of the two-tier cache (thumbnails or previews)
pub struct ImageCache {
    name: &'static str,
    memory: Mutex<BoundedCache<CacheKey, CacheEntry>>,
    disk: Option<DiskMirror>,
    /// Bumped by `clear`; writes carrying an older value are dropped
    generation: AtomicU64,
    counters: Counters,
}

impl ImageCache {
    pub fn new(name: &'static str, config: &TierConfig, disk: Option<DiskMirror>) -> Self {
        debug!(
            cache = name,
            count_limit = config.count_limit,
            cost_limit = config.cost_limit_bytes,
            disk_mirror = disk.is_some(),
            "initialized image cache"
        );
        Self {
            name,
            memory: Mutex::new(BoundedCache::new(
                config.count_limit,
                config.cost_limit_bytes,
            )),
            disk,
            generation: AtomicU64::new(0),
            counters: Counters::default(),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn disk(&self) -> Option<&DiskMirror> {
        self.disk.as_ref()
    }

    /// Memory lookup with staleness check. Never touches the disk mirror
    /// beyond removing a stale entry.
    pub fn get_memory(&self, key: &CacheKey, source: &Path) -> Option<Arc<DecodedImage>> {
        let found = {
            let mut memory = self.memory.lock();
            memory
                .get(key)
                .map(|entry| (entry.image.clone(), entry.source_modified))
        };

        match found {
            Some((image, snapshot)) => {
                if self.validate(key, source, snapshot, &image) {
                    Counters::bump(&self.counters.hits);
                    Some(image)
                } else {
                    Counters::bump(&self.counters.misses);
                    None
                }
            }
            None => {
                Counters::bump(&self.counters.misses);
                None
            }
        }
    }

    /// Full lookup: memory, then the disk mirror. A disk hit repopulates memory.
    pub fn get(&self, key: &CacheKey, source: &Path) -> Option<Arc<DecodedImage>> {
        let found = {
            let mut memory = self.memory.lock();
            memory
                .get(key)
                .map(|entry| (entry.image.clone(), entry.source_modified))
        };

        if let Some((image, snapshot)) = found {
            if self.validate(key, source, snapshot, &image) {
                Counters::bump(&self.counters.hits);
                return Some(image);
            }
            Counters::bump(&self.counters.misses);
            return None;
        }

        if let Some(image) = self.load_from_disk(key, source) {
            Counters::bump(&self.counters.hits);
            Counters::bump(&self.counters.disk_hits);
            return Some(image);
        }

        Counters::bump(&self.counters.misses);
        None
    }

    /// Resident in memory (no recency change, no staleness check)
    pub fn contains(&self, key: &CacheKey) -> bool {
        self.memory.lock().contains(key)
    }

    /// Mirrored on disk (no staleness check)
    pub fn is_mirrored(&self, key: &CacheKey) -> bool {
        self.disk.as_ref().map_or(false, |disk| disk.contains(key))
    }

    /// Insert an image decoded from a source last modified at `source_modified`
    pub fn put(&self, key: CacheKey, image: Arc<DecodedImage>, source_modified: SystemTime) {
        self.insert_memory(key, image.clone(), source_modified, None);
        if let Some(disk) = &self.disk {
            disk.store(&key, &image);
        }
    }

    /// Insert only if no `clear` happened since `generation` was read.
    /// Returns whether the entry was stored.
    ///
    /// The generation is compared under the same lock `clear` takes, so a
    /// clear either happens before the insert (and rejects it) or after it
    /// (and removes it).
    pub fn put_if_current(
        &self,
        key: CacheKey,
        image: Arc<DecodedImage>,
        source_modified: SystemTime,
        generation: u64,
    ) -> bool {
        if !self.insert_memory(key, image.clone(), source_modified, Some(generation)) {
            trace!(cache = self.name, "dropping result dispatched before clear");
            Counters::bump(&self.counters.discarded_writes);
            return false;
        }
        if let Some(disk) = &self.disk {
            disk.store(&key, &image);
        }
        true
    }

    /// Entry for `key` without touching recency or checking staleness
    pub fn peek_entry(&self, key: &CacheKey) -> Option<CacheEntry> {
        self.memory.lock().peek(key).cloned()
    }

    /// Record a result that was decoded but deliberately not stored
    pub fn note_discarded(&self) {
        Counters::bump(&self.counters.discarded_writes);
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Drop one key from memory and disk
    pub fn invalidate(&self, key: &CacheKey) {
        self.memory.lock().remove(key);
        if let Some(disk) = &self.disk {
            disk.remove(key);
        }
    }

    /// Drop every memory entry. The disk mirror is kept.
    pub fn clear(&self) {
        let removed = {
            let mut memory = self.memory.lock();
            self.generation.fetch_add(1, Ordering::AcqRel);
            memory.clear()
        };
        debug!(cache = self.name, removed, "cleared memory cache");
    }

    /// Delete the disk mirror. Returns how many files were removed.
    pub fn clear_disk(&self) -> std::io::Result<usize> {
        match &self.disk {
            Some(disk) => disk.clear(),
            None => Ok(0),
        }
    }

    pub fn len(&self) -> usize {
        self.memory.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.memory.lock().is_empty()
    }

    pub fn total_cost(&self) -> u64 {
        self.memory.lock().total_cost()
    }

    pub fn stats(&self) -> CacheStats {
        let memory = self.memory.lock();
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        CacheStats {
            entries: memory.len(),
            total_cost: memory.total_cost(),
            count_limit: memory.count_limit(),
            cost_limit: memory.cost_limit(),
            hits: load(&self.counters.hits),
            misses: load(&self.counters.misses),
            disk_hits: load(&self.counters.disk_hits),
            inserts: load(&self.counters.inserts),
            evictions: load(&self.counters.evictions),
            stale_evictions: load(&self.counters.stale_evictions),
            discarded_writes: load(&self.counters.discarded_writes),
        }
    }

    /// Insert into memory. With `expected_generation`, the insert only happens
    /// if it still matches; returns whether the entry was stored.
    fn insert_memory(
        &self,
        key: CacheKey,
        image: Arc<DecodedImage>,
        source_modified: SystemTime,
        expected_generation: Option<u64>,
    ) -> bool {
        let cost = image.cost();

        let (evicted, resident, total_cost) = {
            let mut memory = self.memory.lock();
            let generation = self.generation();
            if expected_generation.map_or(false, |expected| expected != generation) {
                return false;
            }
            let entry = CacheEntry {
                image,
                cost,
                cached_at: Utc::now(),
                source_modified,
                generation: expected_generation.unwrap_or(generation),
            };
            let evicted = memory.put(key, entry, cost);
            (evicted, memory.len(), memory.total_cost())
        };

        Counters::bump(&self.counters.inserts);
        if !evicted.is_empty() {
            self.counters
                .evictions
                .fetch_add(evicted.len() as u64, Ordering::Relaxed);
            let freed: u64 = evicted.iter().map(|(_, entry)| entry.cost).sum();
            debug!(
                cache = self.name,
                evicted = evicted.len(),
                freed,
                resident,
                total_cost,
                "evicted under pressure"
            );
        }
        true
    }

    fn load_from_disk(&self, key: &CacheKey, source: &Path) -> Option<Arc<DecodedImage>> {
        let disk = self.disk.as_ref()?;
        let (image, written) = disk.load(key)?;

        if !staleness::check(source, written).is_fresh() {
            debug!(cache = self.name, ?source, "disk mirror entry is stale");
            disk.remove(key);
            Counters::bump(&self.counters.stale_evictions);
            return None;
        }

        let image = Arc::new(image);
        self.insert_memory(*key, image.clone(), written, None);
        Some(image)
    }

    /// Staleness check for a memory hit. Stale entries are removed from memory
    /// and disk, unless a fresher entry replaced them in the meantime.
    fn validate(
        &self,
        key: &CacheKey,
        source: &Path,
        snapshot: SystemTime,
        image: &Arc<DecodedImage>,
    ) -> bool {
        let freshness = staleness::check(source, snapshot);
        if freshness == Freshness::Fresh {
            return true;
        }

        debug!(cache = self.name, ?source, ?freshness, "evicting stale entry");
        {
            let mut memory = self.memory.lock();
            let unchanged = memory
                .peek(key)
                .map_or(false, |entry| Arc::ptr_eq(&entry.image, image));
            if unchanged {
                memory.remove(key);
            }
        }
        if let Some(disk) = &self.disk {
            disk.remove(key);
        }
        Counters::bump(&self.counters.stale_evictions);
        false
    }
}

impl std::fmt::Debug for ImageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageCache")
            .field("name", &self.name)
            .field("memory", &*self.memory.lock())
            .field("disk", &self.disk)
            .finish()
    }
}
