//! Reactive prefetch controller (spec §4.6). Event-driven, no busy loops:
//! reacts to `navigate_to`, `settings_changed`, `context_changed` and
//! `L2.inserted` by issuing decode requests to the [`DecoderPool`] and
//! texture-prep requests to the [`TextureManager`], and range-evictions to
//! both cache tiers. Grounded on `prefetcher.py`'s
//! `_calculate_pages_for_prefetch`/`on_page_changed`, generalized from a
//! single prefetch radius to the two independent `R_L2`/`R_L1` radii this
//! spec requires (`R_L1 <= R_L2`).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::instrument;

use crate::decoder::DecoderPool;
use crate::entry::{PageIndex, Priority, TextureKey};
use crate::pixel_cache::PixelCache;
use crate::texture_cache::TextureCache;
use crate::texture_manager::TextureManager;

/// Inclusive-exclusive page range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: PageIndex,
    pub end: PageIndex,
}

impl Window {
    fn contains(&self, page: PageIndex) -> bool {
        page >= self.start && page < self.end
    }

    fn pages(&self) -> impl Iterator<Item = PageIndex> {
        self.start..self.end
    }
}

/// `base = {p}` in single mode, `{p, p+1}` in spread mode, clamped to the
/// list; spec §3's residency window is the union of each base page's own
/// `[-R, +R]` window, which (since base pages are adjacent) is always a
/// single contiguous range.
fn base_pages(page: PageIndex, is_spread: bool, total_pages: usize) -> SmallVec<[PageIndex; 2]> {
    if total_pages == 0 {
        return SmallVec::new();
    }
    let last = total_pages - 1;
    let p = page.min(last);
    if is_spread && p < last {
        SmallVec::from_slice(&[p, p + 1])
    } else {
        SmallVec::from_slice(&[p])
    }
}

fn window_for(base: &[PageIndex], radius: u32, total_pages: usize) -> Window {
    if total_pages == 0 || base.is_empty() {
        return Window { start: 0, end: 0 };
    }
    let last = (total_pages - 1) as i64;
    let r = i64::from(radius);
    let mut start = i64::MAX;
    let mut end = i64::MIN;
    for &b in base {
        let b = b as i64;
        start = start.min((b - r).max(0));
        end = end.max((b + r).min(last));
    }
    Window { start: start as PageIndex, end: (end + 1) as PageIndex }
}

struct Shared {
    r_l2: AtomicUsize,
    r_l1: AtomicUsize,
    current_page: AtomicUsize,
    is_spread: AtomicBool,
    gpu_backend: AtomicBool,
    total_pages: AtomicUsize,
    l1_window: Mutex<Window>,
    current_path: Mutex<Option<PathBuf>>,
}

/// The reactive controller described in spec §4.6. Holds no thread of its
/// own; every method runs synchronously on the calling thread (the façade
/// for `navigate_to`/`settings_changed`/`context_changed`, the L2 insertion
/// callback for the single-page re-evaluation).
pub struct Prefetcher {
    shared: Shared,
    l2: Arc<PixelCache>,
    l1: Arc<TextureCache>,
    decoder: Arc<DecoderPool>,
    texture_manager: Arc<TextureManager>,
}

impl Prefetcher {
    pub fn new(
        l2: Arc<PixelCache>,
        l1: Arc<TextureCache>,
        decoder: Arc<DecoderPool>,
        texture_manager: Arc<TextureManager>,
        r_l2: u32,
        r_l1: u32,
        gpu_backend: bool,
    ) -> Self {
        Self {
            shared: Shared {
                r_l2: AtomicUsize::new(r_l2 as usize),
                r_l1: AtomicUsize::new(r_l1 as usize),
                current_page: AtomicUsize::new(0),
                is_spread: AtomicBool::new(false),
                gpu_backend: AtomicBool::new(gpu_backend),
                total_pages: AtomicUsize::new(0),
                l1_window: Mutex::new(Window { start: 0, end: 0 }),
                current_path: Mutex::new(None),
            },
            l2,
            l1,
            decoder,
            texture_manager,
        }
    }

    /// Called by the façade on `open()`, before the first `navigate_to`, to
    /// reset the page-count/path context for the newly opened loader.
    pub fn context_changed(&self, path: PathBuf, total_pages: usize) {
        *self.shared.current_path.lock() = Some(path);
        self.shared.total_pages.store(total_pages, Ordering::SeqCst);
        *self.shared.l1_window.lock() = Window { start: 0, end: 0 };
    }

    /// Recompute the residency window for `page` and issue decode / texture
    /// prep / range-eviction work to close the gap between it and the
    /// caches' current contents. Idempotent: a page already resident, queued
    /// or in flight is never re-issued (spec §8 property 5), since both
    /// `DecoderPool::enqueue` and `TextureManager::request_prepare` dedup
    /// internally.
    #[instrument(skip(self))]
    pub fn navigate_to(&self, page: PageIndex, is_spread: bool) {
        self.shared.current_page.store(page, Ordering::SeqCst);
        self.shared.is_spread.store(is_spread, Ordering::SeqCst);

        let total_pages = self.shared.total_pages.load(Ordering::SeqCst);
        let base = base_pages(page, is_spread, total_pages);
        if base.is_empty() {
            return;
        }

        let r_l2 = self.shared.r_l2.load(Ordering::SeqCst) as u32;
        let r_l1 = self.shared.r_l1.load(Ordering::SeqCst) as u32;

        let w_l2 = window_for(&base, r_l2, total_pages);
        let w_l1 = window_for(&base, r_l1, total_pages);

        *self.shared.l1_window.lock() = w_l1;

        // Step 2: publish W_L1 as the authoritative GPU prefetch range,
        // regardless of whether the GPU backend is active, so the texture
        // manager always has an up-to-date filter to consult.
        if let Some(path) = self.shared.current_path.lock().clone() {
            self.texture_manager.set_gpu_range(path, w_l1.start, w_l1.end);
        }

        self.l2.evict_outside(w_l2.start, w_l2.end);
        for page in w_l2.pages() {
            if !self.l2.contains(page) {
                self.decoder.enqueue(page, Priority::Prefetch);
            }
        }

        if self.shared.gpu_backend.load(Ordering::SeqCst) {
            self.apply_l1_window(w_l1);
        }
    }

    /// Re-evaluates L1 residency for a single just-decoded page (spec §4.6:
    /// "this is the trigger that closes the gap between a just-decoded page
    /// and its GPU residency").
    pub fn on_l2_inserted(&self, page: PageIndex) {
        if !self.shared.gpu_backend.load(Ordering::SeqCst) {
            return;
        }
        let w_l1 = *self.shared.l1_window.lock();
        if !w_l1.contains(page) {
            return;
        }
        self.request_prepare_if_missing(page);
    }

    /// Update the two radii (clamping `R_L1 <= R_L2`) and replay the last
    /// navigation so both tiers re-converge on the new windows (spec §4.6).
    pub fn settings_changed(&self, mut new_r_l2: u32, mut new_r_l1: u32) {
        if new_r_l1 > new_r_l2 {
            new_r_l1 = new_r_l2;
        }
        self.shared.r_l2.store(new_r_l2 as usize, Ordering::SeqCst);
        self.shared.r_l1.store(new_r_l1 as usize, Ordering::SeqCst);
        let page = self.shared.current_page.load(Ordering::SeqCst);
        let is_spread = self.shared.is_spread.load(Ordering::SeqCst);
        self.navigate_to(page, is_spread);
    }

    pub fn set_gpu_backend(&self, enabled: bool) {
        self.shared.gpu_backend.store(enabled, Ordering::SeqCst);
    }

    fn apply_l1_window(&self, w_l1: Window) {
        let Some(path) = self.shared.current_path.lock().clone() else { return };
        self.l1.evict_outside(&path, w_l1.start, w_l1.end);
        for page in w_l1.pages() {
            self.request_prepare_if_missing(page);
        }
    }

    fn request_prepare_if_missing(&self, page: PageIndex) {
        let Some(path) = self.shared.current_path.lock().clone() else { return };
        let key = TextureKey::new(path, page);
        if self.l1.contains(&key) {
            return;
        }
        if !self.l2.contains(page) {
            return;
        }
        self.texture_manager.request_prepare(key, page);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_pages_single_view_is_one_page() {
        assert_eq!(base_pages(4, false, 100).as_slice(), &[4]);
    }

    #[test]
    fn base_pages_spread_view_is_pair_left() {
        assert_eq!(base_pages(4, true, 100).as_slice(), &[4, 5]);
    }

    #[test]
    fn base_pages_spread_clamps_at_last_page() {
        assert_eq!(base_pages(99, true, 100).as_slice(), &[99]);
    }

    #[test]
    fn window_for_single_base_is_symmetric_and_clamped() {
        let w = window_for(&[0], 10, 100);
        assert_eq!(w, Window { start: 0, end: 11 });
    }

    #[test]
    fn window_for_spread_pair_is_contiguous_union() {
        // base {4,5}, radius 2 -> [2,7] union [3,8] clamped -> contiguous [2,8) -> pages 2..=7
        let w = window_for(&[4, 5], 2, 100);
        assert_eq!(w, Window { start: 2, end: 8 });
    }

    #[test]
    fn window_for_clamps_to_last_page() {
        let w = window_for(&[98, 99], 5, 100);
        assert_eq!(w, Window { start: 93, end: 100 });
    }
}
