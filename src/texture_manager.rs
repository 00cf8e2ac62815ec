//! Texture manager (spec §4.7): the core-side contract with the render
//! thread. Owns a small upload queue populated off-thread by the
//! [`crate::prefetcher::Prefetcher`]; GL work itself only ever happens when
//! the embedder calls [`TextureManager::process_frame`] from its render
//! thread, passing a [`GpuUploader`] it implements on top of whatever GL
//! binding it uses. Grounded on `manga_loader.rs`'s split between
//! `request_texture_load` (any thread, queues) and the coordinator-thread
//! upload step, generalized into an explicit queue/drain pair instead of a
//! channel the render loop blocks on.

use std::collections::{HashSet, VecDeque};
use std::path::PathBuf;

use parking_lot::Mutex;
use tracing::warn;

use crate::entry::{Bitmap, PageIndex, TextureKey};
use crate::error::CoreError;
use crate::events::{CoreEvent, EventBus};
use crate::pixel_cache::PixelCache;
use crate::texture_cache::{TextureCache, TextureEntry};

use std::sync::Arc;

/// Implemented by the embedder on its GL-owning thread. The core never
/// calls a GL API directly (spec §9 open question: "GL only on render
/// thread" is now a hard rule, not a best-effort).
pub trait GpuUploader: Send + Sync {
    /// Upload `bitmap` to the GPU, returning an opaque texture id.
    fn upload(&self, bitmap: &Bitmap) -> Result<u64, String>;

    /// Delete a previously uploaded texture id.
    fn delete(&self, texture_id: u64);
}

struct PendingUpload {
    key: TextureKey,
    page: PageIndex,
}

struct Inner {
    queue: VecDeque<PendingUpload>,
    queued: HashSet<TextureKey>,
    displayed: HashSet<TextureKey>,
    gpu_range: Option<(PathBuf, PageIndex, PageIndex)>,
}

pub struct TextureManager {
    inner: Mutex<Inner>,
    l1: Arc<TextureCache>,
    l2: Arc<PixelCache>,
    events: EventBus,
}

impl TextureManager {
    pub fn new(l1: Arc<TextureCache>, l2: Arc<PixelCache>, events: EventBus) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                queued: HashSet::new(),
                displayed: HashSet::new(),
                gpu_range: None,
            }),
            l1,
            l2,
            events,
        }
    }

    /// Queue a texture-prep request for `page`, deduplicated against both
    /// the pending queue and (implicitly, by the prefetcher's own check
    /// before calling this) L1 residency.
    pub fn request_prepare(&self, key: TextureKey, page: PageIndex) {
        let mut inner = self.inner.lock();
        if inner.queued.contains(&key) {
            return;
        }
        inner.queued.insert(key.clone());
        inner.queue.push_back(PendingUpload { key, page });
    }

    /// Publish the authoritative GPU prefetch range (spec §4.6 step 2). An
    /// upload is skipped at drain time if its key is neither currently
    /// displayed nor inside this range.
    pub fn set_gpu_range(&self, path: PathBuf, start: PageIndex, end: PageIndex) {
        self.inner.lock().gpu_range = Some((path, start, end));
    }

    /// Unpin the previous display keys, pin the new ones (spec §4.8
    /// `display()`). Safe to call from any thread: pin/unpin only touches
    /// L1 bookkeeping, never GL.
    pub fn set_displayed(&self, keys: Vec<TextureKey>) {
        let mut inner = self.inner.lock();
        let new_set: HashSet<TextureKey> = keys.iter().cloned().collect();
        for old in inner.displayed.difference(&new_set) {
            self.l1.unpin(old);
        }
        for key in &keys {
            self.l1.pin(key);
        }
        inner.displayed = new_set;
    }

    /// Render-thread entry point. Drains pending GPU deletions from L1,
    /// then drains the upload queue, performing uploads through `uploader`.
    /// Must be called once per frame, deletions drained before any upload
    /// (spec §4.7, §5: "GL deletions for a given texture id precede no
    /// further use of that id").
    pub fn process_frame(&self, uploader: &dyn GpuUploader, current_page: PageIndex) {
        for texture_id in self.l1.drain_pending_deletions() {
            uploader.delete(texture_id);
        }

        let pending: Vec<PendingUpload> = {
            let mut inner = self.inner.lock();
            std::mem::take(&mut inner.queue).into_iter().collect()
        };

        for req in pending {
            {
                let mut inner = self.inner.lock();
                inner.queued.remove(&req.key);
            }

            if !self.is_eligible(&req.key, req.page) {
                continue;
            }

            let Some(bitmap) = self.l2.get(req.page) else {
                // L2 evicted the page before we got to it; drop, the
                // prefetcher will re-request it if it becomes relevant
                // again on a future navigation.
                continue;
            };

            match uploader.upload(&bitmap) {
                Ok(texture_id) => {
                    self.l1.insert(
                        req.key.clone(),
                        TextureEntry { texture_id, width: bitmap.width, height: bitmap.height },
                        current_page,
                    );
                }
                Err(message) => {
                    let err = CoreError::UploadFailed { page: req.page, message };
                    warn!(page = req.page, error = %err, "texture upload failed");
                    self.events.publish(CoreEvent::UploadError { page: req.page, message: err.to_string() });
                }
            }
        }
    }

    fn is_eligible(&self, key: &TextureKey, page: PageIndex) -> bool {
        let inner = self.inner.lock();
        if inner.displayed.contains(key) {
            return true;
        }
        match &inner.gpu_range {
            Some((path, start, end)) => *path == key.opened_path && page >= *start && page < *end,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct FakeUploader {
        next_id: AtomicU64,
        deleted: Mutex<Vec<u64>>,
    }

    impl FakeUploader {
        fn new() -> Self {
            Self { next_id: AtomicU64::new(1), deleted: Mutex::new(Vec::new()) }
        }
    }

    impl GpuUploader for FakeUploader {
        fn upload(&self, _bitmap: &Bitmap) -> Result<u64, String> {
            Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
        }

        fn delete(&self, texture_id: u64) {
            self.deleted.lock().push(texture_id);
        }
    }

    fn bitmap() -> Bitmap {
        Bitmap::new(4, 4, vec![0u8; 4 * 4 * 3])
    }

    #[test]
    fn upload_outside_displayed_and_range_is_skipped() {
        let l1 = Arc::new(TextureCache::new(10, EventBus::new()));
        let l2 = Arc::new(PixelCache::new(u64::MAX, EventBus::new()));
        let mgr = TextureManager::new(l1.clone(), l2.clone(), EventBus::new());
        let path = PathBuf::from("/book.cbz");
        l2.insert(5, bitmap());

        mgr.request_prepare(TextureKey::new(path.clone(), 5), 5);
        let uploader = FakeUploader::new();
        mgr.process_frame(&uploader, 0);

        assert!(!l1.contains(&TextureKey::new(path, 5)));
    }

    #[test]
    fn upload_inside_gpu_range_succeeds() {
        let l1 = Arc::new(TextureCache::new(10, EventBus::new()));
        let l2 = Arc::new(PixelCache::new(u64::MAX, EventBus::new()));
        let mgr = TextureManager::new(l1.clone(), l2.clone(), EventBus::new());
        let path = PathBuf::from("/book.cbz");
        l2.insert(5, bitmap());

        mgr.set_gpu_range(path.clone(), 0, 10);
        mgr.request_prepare(TextureKey::new(path.clone(), 5), 5);
        let uploader = FakeUploader::new();
        mgr.process_frame(&uploader, 0);

        assert!(l1.contains(&TextureKey::new(path, 5)));
    }

    #[test]
    fn deletions_are_drained_before_uploads_run() {
        let l1 = Arc::new(TextureCache::new(1, EventBus::new()));
        let l2 = Arc::new(PixelCache::new(u64::MAX, EventBus::new()));
        let mgr = TextureManager::new(l1.clone(), l2.clone(), EventBus::new());
        let path = PathBuf::from("/book.cbz");
        l1.insert(TextureKey::new(path.clone(), 0), TextureEntry { texture_id: 42, width: 1, height: 1 }, 0);
        // Force an eviction by inserting a second entry directly.
        l1.insert(TextureKey::new(path.clone(), 50), TextureEntry { texture_id: 43, width: 1, height: 1 }, 50);

        let uploader = FakeUploader::new();
        mgr.process_frame(&uploader, 50);
        assert!(uploader.deleted.lock().contains(&42));
    }
}
