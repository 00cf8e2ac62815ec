//! L1 TextureCache (spec §4.2): an item-count-bounded cache of uploaded
//! textures with pinning and distance-based eviction. Generalizes the
//! teacher's `MangaTextureCache` (`manga_loader.rs`), which tracks
//! `(handle, width, height, last_access_frame)` in a `HashMap` and evicts
//! the oldest by frame counter; here the victim is chosen by distance from
//! the current page first, LRU only as a tie-breaker, and pinned keys are
//! categorically exempt.

use hashbrown::{HashMap, HashSet};
use tracing::warn;

use crate::entry::{PageIndex, TextureKey};
use crate::events::{CoreEvent, EventBus};

/// Metadata kept for each resident texture. `texture_id` is an opaque handle
/// minted by whatever `GpuUploader` the embedder runs on the render thread;
/// the core never interprets it beyond using it as a deletion token.
#[derive(Debug, Clone, Copy)]
pub struct TextureEntry {
    pub texture_id: u64,
    pub width: u32,
    pub height: u32,
}

struct Slot {
    entry: TextureEntry,
    insert_seq: u64,
}

pub struct TextureCache {
    inner: parking_lot::Mutex<Inner>,
    events: EventBus,
}

struct Inner {
    entries: HashMap<TextureKey, Slot>,
    pinned: HashSet<TextureKey>,
    capacity_items: usize,
    pending_deletions: Vec<u64>,
    seq: u64,
}

impl TextureCache {
    pub fn new(capacity_items: usize, events: EventBus) -> Self {
        Self {
            inner: parking_lot::Mutex::new(Inner {
                entries: HashMap::new(),
                pinned: HashSet::new(),
                capacity_items,
                pending_deletions: Vec::new(),
                seq: 0,
            }),
            events,
        }
    }

    /// Pin a key so it is never evicted. A no-op for a key not yet present
    /// — the pin "sticks" once the key is inserted, since `insert` never
    /// clears the pinned set.
    pub fn pin(&self, key: &TextureKey) {
        self.inner.lock().pinned.insert(key.clone());
    }

    pub fn unpin(&self, key: &TextureKey) {
        self.inner.lock().pinned.remove(key);
    }

    pub fn unpin_all(&self) {
        self.inner.lock().pinned.clear();
    }

    /// Whether `key` is currently pinned (i.e. displayed — spec §4.8 pins
    /// the exact displayed set and unpins everything else on every `display`
    /// call).
    pub fn is_pinned(&self, key: &TextureKey) -> bool {
        self.inner.lock().pinned.contains(key)
    }

    pub fn get(&self, key: &TextureKey) -> Option<TextureEntry> {
        self.inner.lock().entries.get(key).map(|s| s.entry)
    }

    pub fn contains(&self, key: &TextureKey) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    /// Insert (or overwrite, without eviction) an uploaded texture. If this
    /// is a new key and the cache now exceeds capacity, evict via the
    /// distance policy: among non-pinned entries, the one whose page index
    /// is farthest from `current_page` goes first; ties break by oldest
    /// insertion (LRU-like, but on insert order rather than access order,
    /// since textures are read by the render loop every frame and access
    /// order would never distinguish anything).
    pub fn insert(&self, key: TextureKey, entry: TextureEntry, current_page: PageIndex) {
        let mut inner = self.inner.lock();

        if let Some(slot) = inner.entries.get_mut(&key) {
            slot.entry = entry;
            return;
        }

        let seq = inner.seq;
        inner.seq += 1;
        inner.entries.insert(key.clone(), Slot { entry, insert_seq: seq });

        while inner.entries.len() > inner.capacity_items {
            let victim = inner
                .entries
                .iter()
                .filter(|(k, _)| !inner.pinned.contains(*k))
                .max_by_key(|(k, slot)| {
                    let distance = (k.page_index as i64 - current_page as i64).unsigned_abs();
                    (distance, u64::MAX - slot.insert_seq)
                })
                .map(|(k, _)| k.clone());

            match victim {
                Some(victim_key) => {
                    if let Some(slot) = inner.entries.remove(&victim_key) {
                        inner.pending_deletions.push(slot.entry.texture_id);
                    }
                }
                None => {
                    warn!("L1 cache over capacity but every entry is pinned; not evicting");
                    break;
                }
            }
        }

        self.events.publish(CoreEvent::TextureReady { key });
    }

    /// Drop non-pinned entries whose page index falls outside
    /// `[start_page, end_page)`. Entries whose key doesn't belong to the
    /// currently opened path are treated as unconditionally out of range.
    pub fn evict_outside(&self, current_path: &std::path::Path, start_page: PageIndex, end_page: PageIndex) {
        let mut inner = self.inner.lock();
        let to_evict: Vec<TextureKey> = inner
            .entries
            .keys()
            .filter(|k| !inner.pinned.contains(*k))
            .filter(|k| k.opened_path != current_path || k.page_index < start_page || k.page_index >= end_page)
            .cloned()
            .collect();

        for key in to_evict {
            if let Some(slot) = inner.entries.remove(&key) {
                inner.pending_deletions.push(slot.entry.texture_id);
            }
        }
    }

    /// Update the item-count cap, re-running the distance eviction as
    /// needed (spec §8 S6: radius config change shrinks L1 deterministically).
    pub fn set_capacity(&self, capacity_items: usize, current_page: PageIndex) {
        let mut inner = self.inner.lock();
        inner.capacity_items = capacity_items;
        while inner.entries.len() > inner.capacity_items {
            let victim = inner
                .entries
                .iter()
                .filter(|(k, _)| !inner.pinned.contains(*k))
                .max_by_key(|(k, slot)| {
                    let distance = (k.page_index as i64 - current_page as i64).unsigned_abs();
                    (distance, u64::MAX - slot.insert_seq)
                })
                .map(|(k, _)| k.clone());
            match victim {
                Some(victim_key) => {
                    if let Some(slot) = inner.entries.remove(&victim_key) {
                        inner.pending_deletions.push(slot.entry.texture_id);
                    }
                }
                None => break,
            }
        }
    }

    /// Return and clear the queue of texture ids scheduled for GPU-side
    /// deletion. Must only be called from the render thread, at the top of
    /// a frame, before any upload.
    pub fn drain_pending_deletions(&self) -> Vec<u64> {
        let mut inner = self.inner.lock();
        std::mem::take(&mut inner.pending_deletions)
    }

    /// Queue every entry for deletion and clear pins.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        let ids: Vec<u64> = inner.entries.values().map(|s| s.entry.texture_id).collect();
        inner.pending_deletions.extend(ids);
        inner.entries.clear();
        inner.pinned.clear();
    }

    /// Drop every entry (pinned or not) belonging to `path`, queuing its
    /// texture id for deletion. Used by the façade on `open()` to purge a
    /// superseded path's textures unconditionally, unlike `evict_outside`
    /// which respects pins for in-path range narrowing.
    pub fn clear_path(&self, path: &std::path::Path) {
        let mut inner = self.inner.lock();
        let to_evict: Vec<TextureKey> = inner.entries.keys().filter(|k| k.opened_path == path).cloned().collect();
        for key in to_evict {
            if let Some(slot) = inner.entries.remove(&key) {
                inner.pending_deletions.push(slot.entry.texture_id);
            }
            inner.pinned.remove(&key);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn key(page: PageIndex) -> TextureKey {
        TextureKey::new(PathBuf::from("/book.cbz"), page)
    }

    fn entry(id: u64) -> TextureEntry {
        TextureEntry { texture_id: id, width: 100, height: 100 }
    }

    #[test]
    fn distance_eviction_picks_farthest_unpinned_key() {
        let cache = TextureCache::new(3, EventBus::new());
        cache.insert(key(0), entry(100), 0);
        cache.pin(&key(0));
        cache.insert(key(1), entry(101), 0);
        cache.insert(key(2), entry(102), 0);
        // Inserting a 4th forces one eviction among {1,2,3} (0 pinned);
        // current page is 0, so key(3) itself is farthest and is evicted.
        cache.insert(key(3), entry(103), 0);

        let deleted = cache.drain_pending_deletions();
        assert_eq!(deleted, vec![103]);
        assert!(cache.contains(&key(0)));
        assert!(cache.contains(&key(1)));
        assert!(cache.contains(&key(2)));
        assert!(!cache.contains(&key(3)));
    }

    #[test]
    fn pinned_keys_never_appear_in_deletions() {
        let cache = TextureCache::new(1, EventBus::new());
        cache.insert(key(0), entry(1), 0);
        cache.pin(&key(0));
        // Forcing more inserts with everything pinned must not evict 0.
        cache.insert(key(5), entry(2), 0);
        cache.pin(&key(5));
        cache.insert(key(9), entry(3), 0);

        let deleted = cache.drain_pending_deletions();
        assert!(!deleted.contains(&1));
        assert!(cache.contains(&key(0)));
    }

    #[test]
    fn evict_outside_drops_non_pinned_out_of_range() {
        let cache = TextureCache::new(100, EventBus::new());
        for p in 0..10 {
            cache.insert(key(p), entry(p as u64), 5);
        }
        cache.pin(&key(2));
        cache.evict_outside(&PathBuf::from("/book.cbz"), 4, 8);
        assert!(cache.contains(&key(2))); // pinned, survives despite being out of range
        assert!(cache.contains(&key(5)));
        assert!(!cache.contains(&key(1)));
        assert!(!cache.contains(&key(9)));
    }

    #[test]
    fn set_capacity_shrink_evicts_deterministically() {
        let cache = TextureCache::new(5, EventBus::new());
        for p in 48..=52 {
            cache.insert(key(p), entry(p as u64), 50);
        }
        cache.set_capacity(3, 50);
        assert_eq!(cache.len(), 3);
        assert!(cache.contains(&key(49)));
        assert!(cache.contains(&key(50)));
        assert!(cache.contains(&key(51)));
    }
}
