//! L2 PixelCache (spec §4.1): a byte-bounded LRU of decoded bitmaps, keyed
//! by page index. Grounded on the teacher's `lru` crate dependency (already
//! declared for manga mode) and on the byte-tracking LRU pattern used
//! throughout the retrieval pack (e.g. `ssoj13-playa`'s frame cache, which
//! pairs `lru::LruCache` with an explicit running byte total instead of
//! relying on the crate's item-count bound).

use std::num::NonZeroUsize;

use lru::LruCache;
use tracing::{debug, warn};

use crate::entry::{Bitmap, PageIndex};
use crate::error::CoreError;
use crate::events::{CoreEvent, EventBus};

/// Byte-bounded LRU cache of decoded pixel buffers.
///
/// All mutating operations (`get`, `insert`, `evict_outside`,
/// `set_capacity`, `clear`) serialize under a single internal lock. The
/// lock is never held across decoder or I/O work — callers pass already
/// decoded bitmaps in and get back cheap `Arc`-backed clones.
pub struct PixelCache {
    inner: parking_lot::Mutex<Inner>,
    events: EventBus,
}

struct Inner {
    cache: LruCache<PageIndex, Bitmap>,
    capacity_bytes: u64,
    total_bytes: u64,
}

impl PixelCache {
    pub fn new(capacity_bytes: u64, events: EventBus) -> Self {
        Self {
            inner: parking_lot::Mutex::new(Inner {
                // `lru`'s item-count bound is irrelevant here; we evict on
                // bytes, so the crate's own cap is set unbounded-ish and we
                // drive eviction ourselves.
                cache: LruCache::new(NonZeroUsize::new(usize::MAX).unwrap()),
                capacity_bytes,
                total_bytes: 0,
            }),
            events,
        }
    }

    /// Promote `page` to most-recently-used and return its bitmap, if
    /// present.
    pub fn get(&self, page: PageIndex) -> Option<Bitmap> {
        let mut inner = self.inner.lock();
        inner.cache.get(&page).cloned()
    }

    /// Returns true without mutating LRU order (used by the prefetcher to
    /// check for gaps without disturbing recency).
    pub fn contains(&self, page: PageIndex) -> bool {
        let inner = self.inner.lock();
        inner.cache.contains(&page)
    }

    /// Insert a decoded bitmap, evicting LRU entries as needed to stay under
    /// capacity. Oversize bitmaps are rejected (logged, not cached) rather
    /// than thrashing the whole cache empty.
    pub fn insert(&self, page: PageIndex, bitmap: Bitmap) {
        let bytes = bitmap.bytes();
        let mut inner = self.inner.lock();

        if bytes > inner.capacity_bytes {
            let err = CoreError::OversizeBitmap { page, bytes };
            warn!(page, bytes, capacity = inner.capacity_bytes, error = %err, "oversize bitmap rejected by L2");
            return;
        }

        if let Some(old) = inner.cache.pop(&page) {
            inner.total_bytes -= old.bytes();
        }

        while inner.total_bytes + bytes > inner.capacity_bytes {
            match inner.cache.pop_lru() {
                Some((_, evicted)) => inner.total_bytes -= evicted.bytes(),
                None => break,
            }
        }

        inner.total_bytes += bytes;
        inner.cache.put(page, bitmap);
        debug!(page, total_bytes = inner.total_bytes, "L2 insert");
        drop(inner);
        self.events.publish(CoreEvent::PageInsertedL2 { page });
    }

    /// Drop every entry whose key is outside `[start, end)`.
    pub fn evict_outside(&self, start: PageIndex, end: PageIndex) {
        let mut inner = self.inner.lock();
        let to_evict: Vec<PageIndex> =
            inner.cache.iter().map(|(&k, _)| k).filter(|&k| k < start || k >= end).collect();
        for key in to_evict {
            if let Some(bitmap) = inner.cache.pop(&key) {
                inner.total_bytes -= bitmap.bytes();
            }
        }
    }

    /// Update the capacity, evicting LRU entries until under the new cap.
    pub fn set_capacity(&self, bytes: u64) {
        let mut inner = self.inner.lock();
        inner.capacity_bytes = bytes;
        while inner.total_bytes > inner.capacity_bytes {
            match inner.cache.pop_lru() {
                Some((_, evicted)) => inner.total_bytes -= evicted.bytes(),
                None => break,
            }
        }
    }

    /// Supplemented from `cache.py`'s `ImageCache.adjust_cache_size`: recompute
    /// the byte cap from half of currently-available system memory, clamped
    /// between `min_bytes` and `max_bytes`. The façade calls this at startup
    /// and on configuration refresh when `dynamic_cache_resizing` is enabled;
    /// `available_bytes` is read from `sysinfo` by the caller so this stays
    /// unit-testable without touching the real system.
    pub fn recompute_dynamic_capacity(&self, available_bytes: u64, min_bytes: u64, max_bytes: u64) {
        let target = (available_bytes / 2).clamp(min_bytes, max_bytes);
        debug!(available_bytes, target, "recomputing L2 capacity from available system memory");
        self.set_capacity(target);
    }

    pub fn capacity_bytes(&self) -> u64 {
        self.inner.lock().capacity_bytes
    }

    pub fn total_bytes(&self) -> u64 {
        self.inner.lock().total_bytes
    }

    pub fn len(&self) -> usize {
        self.inner.lock().cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.cache.clear();
        inner.total_bytes = 0;
    }
}
