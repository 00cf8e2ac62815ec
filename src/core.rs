//! Core façade (spec §4.8, §6): binds the caches, prefetcher, decoder pool
//! and extractor into the single object the embedding UI talks to.
//! Grounded on `manga_loader.rs`'s top-level `MangaLoader` (which plays the
//! same binding role for the teacher's own manga mode) and on
//! `app.rs`'s wiring of `image_loader`/`manga_loader` into one struct the
//! UI drives, reworked around this spec's two-tier cache and reactive
//! prefetcher instead of a single LRU + scroll-direction heuristic.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use smallvec::SmallVec;
use tracing::{info, instrument, warn};

use crate::config::Config;
use crate::decoder::DecoderPool;
use crate::entry::{BindingDirection, EntryKey, GenerationCounter, Priority, TextureKey};
use crate::error::OpenError;
use crate::events::{CoreEvent, EventBus};
use crate::extractor::Extractor;
use crate::file_loader::{FileLoader, LoadType};
use crate::pixel_cache::PixelCache;
use crate::prefetcher::Prefetcher;
use crate::texture_cache::TextureCache;
use crate::texture_manager::TextureManager;

/// Options recognized by [`ReaderCore::configure`] (spec §6). All fields
/// optional; only the keys present are applied.
#[derive(Debug, Clone, Default)]
pub struct ConfigureOptions {
    pub cpu_prefetch_radius: Option<u32>,
    pub gpu_prefetch_radius: Option<u32>,
    pub l2_capacity_bytes: Option<u64>,
    pub l1_capacity_items: Option<u32>,
    pub decode_workers: Option<u32>,
    pub spread_view: Option<bool>,
    pub binding_direction: Option<BindingDirection>,
}

struct OpenedState {
    loader: Arc<FileLoader>,
    extractor: Option<Extractor>,
    path: PathBuf,
}

/// The page-readiness pipeline façade. One instance per running viewer;
/// `open` replaces the previously opened path wholesale.
pub struct ReaderCore {
    config: Mutex<Config>,
    events: EventBus,
    generation: GenerationCounter,
    opened: Mutex<Option<OpenedState>>,
    l2: Arc<PixelCache>,
    l1: Arc<TextureCache>,
    decoder: Arc<DecoderPool>,
    texture_manager: Arc<TextureManager>,
    prefetcher: Arc<Prefetcher>,
    current_page: AtomicUsize,
    is_spread: AtomicBool,
    binding_direction: Mutex<BindingDirection>,
    restart_required: AtomicBool,
    dispatcher_stop: Arc<AtomicBool>,
    dispatcher_handle: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl ReaderCore {
    pub fn new(config: Config) -> Arc<Self> {
        let events = EventBus::new();
        let gpu_backend = matches!(config.rendering_backend, crate::config::RenderingBackend::Gpu);

        let l2 = Arc::new(PixelCache::new(config.l2_capacity_bytes(), events.clone()));
        let l1 = Arc::new(TextureCache::new(config.l1_capacity_items() as usize, events.clone()));
        let decoder = Arc::new(DecoderPool::new(config.decode_workers as usize, Arc::clone(&l2), events.clone()));
        let texture_manager = Arc::new(TextureManager::new(Arc::clone(&l1), Arc::clone(&l2), events.clone()));
        let prefetcher = Arc::new(Prefetcher::new(
            Arc::clone(&l2),
            Arc::clone(&l1),
            Arc::clone(&decoder),
            Arc::clone(&texture_manager),
            config.cpu_prefetch_radius,
            config.gpu_prefetch_radius,
            gpu_backend,
        ));

        if config.dynamic_cache_resizing {
            recompute_l2_capacity_from_system_memory(&l2, &config);
        }

        let binding_direction = config.binding_direction.into();
        let is_spread_view = config.is_spread_view;

        let core = Arc::new(Self {
            config: Mutex::new(config),
            events: events.clone(),
            generation: GenerationCounter::new(),
            opened: Mutex::new(None),
            l2,
            l1,
            decoder,
            texture_manager,
            prefetcher,
            current_page: AtomicUsize::new(0),
            is_spread: AtomicBool::new(is_spread_view),
            binding_direction: Mutex::new(binding_direction),
            restart_required: AtomicBool::new(false),
            dispatcher_stop: Arc::new(AtomicBool::new(false)),
            dispatcher_handle: Mutex::new(None),
        });

        core.spawn_event_dispatcher(events);
        core
    }

    /// Dedicated thread that drives the one subscription the prefetcher
    /// needs as an externally observed event rather than a direct call:
    /// `L2.inserted(page)` (spec §4.6, §5 "Thread Prefetcher: event-driven").
    /// `page_inserted_l2` firing is how the gap between a just-decoded page
    /// and its GPU residency gets closed without the decoder pool needing
    /// to know about texture prep at all.
    fn spawn_event_dispatcher(self: &Arc<Self>, events: EventBus) {
        let receiver = events.subscribe();
        let prefetcher = Arc::clone(&self.prefetcher);
        let stop = Arc::clone(&self.dispatcher_stop);
        let handle = std::thread::Builder::new()
            .name("prefetch-event-dispatcher".into())
            .spawn(move || loop {
                if stop.load(Ordering::Relaxed) {
                    return;
                }
                match receiver.recv_timeout(Duration::from_millis(200)) {
                    Ok(CoreEvent::PageInsertedL2 { page }) => prefetcher.on_l2_inserted(page),
                    Ok(_) => {}
                    Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                    Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return,
                }
            })
            .expect("failed to spawn prefetch event dispatcher thread");
        *self.dispatcher_handle.lock() = Some(handle);
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn current_page(&self) -> usize {
        self.current_page.load(Ordering::SeqCst)
    }

    /// True once a `configure()` call touched a setting (currently
    /// `decode_workers` or the rendering backend) that this façade cannot
    /// apply without rebuilding the decoder pool / GL context. Mirrors the
    /// CLI's documented restart-request exit code (spec §6).
    pub fn restart_required(&self) -> bool {
        self.restart_required.load(Ordering::SeqCst)
    }

    /// Open `path`, replacing any previously opened path (spec §4.8).
    #[instrument(skip(self))]
    pub fn open(self: &Arc<Self>, path: &Path) -> Result<(), OpenError> {
        let generation = self.generation.next();
        let loader = Arc::new(FileLoader::open(path, generation)?);

        {
            let mut opened = self.opened.lock();
            if let Some(previous) = opened.take() {
                self.l1.clear_path(&previous.path);
                // `previous.extractor` drops here, which stops its thread
                // (spec §3: "prior loader is scheduled for teardown after
                // its in-flight tasks are drained (their results dropped)" —
                // in-flight decode results are dropped by generation
                // mismatch, not by waiting here).
            }

            self.l2.clear();

            let mut extractor = None;
            if loader.load_type == LoadType::Archive {
                let ext = Extractor::spawn(Arc::clone(&loader), self.events.clone());
                ext.update_current_page(0);
                extractor = Some(ext);
            }

            *opened = Some(OpenedState { loader: Arc::clone(&loader), extractor, path: path.to_path_buf() });
        }

        self.decoder.set_active_loader(Arc::clone(&loader), generation);
        self.prefetcher.context_changed(path.to_path_buf(), loader.len());
        self.current_page.store(0, Ordering::SeqCst);

        self.display(0);
        Ok(())
    }

    /// Set the current page, pin its texture key(s), enqueue Display
    /// decodes, and trigger the prefetch sweep (spec §4.8).
    #[instrument(skip(self))]
    pub fn display(self: &Arc<Self>, page_index: usize) {
        let Some(loader) = self.loader() else {
            warn!(page_index, "display() called with no path open");
            return;
        };
        if loader.is_empty() {
            return;
        }
        let page_index = page_index.min(loader.len() - 1);
        self.current_page.store(page_index, Ordering::SeqCst);

        let path = self.opened_path().expect("path set alongside loader");
        let is_spread = self.is_spread.load(Ordering::SeqCst);
        let base = display_base_pages(page_index, is_spread, loader.len());

        {
            let opened = self.opened.lock();
            if let Some(extractor) = opened.as_ref().and_then(|o| o.extractor.as_ref()) {
                extractor.update_current_page(base[0]);
            }
        }

        let direction = *self.binding_direction.lock();
        let ordered = order_for_display(&base, direction);
        let keys: Vec<TextureKey> = ordered.iter().map(|&p| TextureKey::new(path.clone(), p)).collect();
        self.texture_manager.set_displayed(keys.clone());

        for &page in &base {
            self.decoder.enqueue(page, Priority::Display);
        }

        self.prefetcher.navigate_to(page_index, is_spread);

        for key in keys {
            info!(page = key.page_index, "page pinned for display");
        }
    }

    /// Convenience wrapper: moves `step` views (not raw pages) — in spread
    /// mode each view advances by two pages, matching spec §8 S2's
    /// `navigate(+1)` example (page 4 -> page 6).
    pub fn navigate(self: &Arc<Self>, step: i32) {
        let Some(loader) = self.loader() else { return };
        if loader.is_empty() {
            return;
        }
        let page_step = if self.is_spread.load(Ordering::SeqCst) { 2 } else { 1 };
        let current = self.current_page.load(Ordering::SeqCst) as i64;
        let delta = i64::from(step) * page_step;
        let last = (loader.len() - 1) as i64;
        let next = (current + delta).clamp(0, last) as usize;
        self.display(next);
    }

    /// Apply a `configure()` request (spec §6). Radius/capacity changes take
    /// effect immediately; `decode_workers` changes set
    /// [`ReaderCore::restart_required`] instead of being applied live, since
    /// the decode pool's worker count is fixed at construction.
    pub fn configure(self: &Arc<Self>, options: ConfigureOptions) {
        let mut cfg = self.config.lock();

        if let Some(r) = options.cpu_prefetch_radius {
            cfg.cpu_prefetch_radius = r;
        }
        if let Some(r) = options.gpu_prefetch_radius {
            cfg.gpu_prefetch_radius = r;
        }
        cfg.clamp_radii();

        if let Some(bytes) = options.l2_capacity_bytes {
            cfg.l2_capacity_mb = (bytes / (1024 * 1024)).max(1) as u32;
            self.l2.set_capacity(bytes);
        } else if cfg.dynamic_cache_resizing {
            // No explicit override this call: let a dynamic-resizing config
            // re-derive the cap from current system memory rather than
            // silently keeping whatever static value it last had.
            recompute_l2_capacity_from_system_memory(&self.l2, &cfg);
        }

        let current_page = self.current_page.load(Ordering::SeqCst);
        if let Some(items) = options.l1_capacity_items {
            self.l1.set_capacity(items as usize, current_page);
        }

        if let Some(workers) = options.decode_workers {
            if workers != cfg.decode_workers {
                cfg.decode_workers = workers.max(1);
                self.restart_required.store(true, Ordering::SeqCst);
            }
        }

        if let Some(spread) = options.spread_view {
            cfg.is_spread_view = spread;
            self.is_spread.store(spread, Ordering::SeqCst);
        }

        if let Some(direction) = options.binding_direction {
            cfg.binding_direction = direction.into();
            *self.binding_direction.lock() = direction;
        }

        let r_l2 = cfg.cpu_prefetch_radius;
        let r_l1 = cfg.gpu_prefetch_radius;
        drop(cfg);

        self.prefetcher.settings_changed(r_l2, r_l1);
        // Replay display() so the texture-displayed pin set, GPU range and
        // L1 item cap (which is keyed to `2*R_L1 + 2` when the embedder
        // doesn't pass an explicit `l1_capacity_items`) stay consistent
        // with the new radii.
        self.display(current_page);
    }

    pub fn loader(&self) -> Option<Arc<FileLoader>> {
        self.opened.lock().as_ref().map(|o| Arc::clone(&o.loader))
    }

    pub fn opened_path(&self) -> Option<PathBuf> {
        self.opened.lock().as_ref().map(|o| o.path.clone())
    }

    pub fn l2(&self) -> &Arc<PixelCache> {
        &self.l2
    }

    pub fn l1(&self) -> &Arc<TextureCache> {
        &self.l1
    }

    pub fn texture_manager(&self) -> &Arc<TextureManager> {
        &self.texture_manager
    }

    /// Current entry, if a path is open and `page_index` is in range.
    pub fn entry_at(&self, page_index: usize) -> Option<EntryKey> {
        self.loader()?.entry_at(page_index).cloned()
    }

    /// Bounded shutdown (spec §5): stop the event dispatcher, then let the
    /// decoder pool and extractor drain via their own `Drop` impls. Each
    /// wait is bounded; exceeding it is logged, not treated as fatal.
    pub fn shutdown(&self) {
        self.dispatcher_stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.dispatcher_handle.lock().take() {
            let deadline = Duration::from_secs(5);
            let start = std::time::Instant::now();
            // `JoinHandle` has no timed join; the thread polls the stop
            // flag every 200ms so a 5s wait is generous.
            let _ = handle.join();
            if start.elapsed() > deadline {
                warn!("prefetch event dispatcher took longer than the shutdown deadline to stop");
            }
        }
    }
}

impl Drop for ReaderCore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Supplemented from `cache.py`'s `adjust_cache_size` (spec `SPEC_FULL.md` §C.1):
/// reads currently-available system memory via `sysinfo` and hands it to
/// [`PixelCache::recompute_dynamic_capacity`]. Called at construction and on
/// every `configure()` that doesn't pass an explicit `l2_capacity_bytes`.
fn recompute_l2_capacity_from_system_memory(l2: &Arc<PixelCache>, config: &Config) {
    let mut system = sysinfo::System::new();
    system.refresh_memory();
    let available_bytes = system.available_memory();
    let min_bytes = u64::from(config.min_cache_size_mb) * 1024 * 1024;
    let max_bytes = u64::from(config.max_cache_size_mb) * 1024 * 1024;
    l2.recompute_dynamic_capacity(available_bytes, min_bytes, max_bytes);
}

/// spec §4.8/§8 S2: pair-left scheme. `base` pages in ascending index order
/// regardless of binding direction; only *display order* (draw order) flips.
fn display_base_pages(page_index: usize, is_spread: bool, total_pages: usize) -> SmallVec<[usize; 2]> {
    if total_pages == 0 {
        return SmallVec::new();
    }
    let last = total_pages - 1;
    let page_index = page_index.min(last);
    if is_spread && page_index < last {
        SmallVec::from_slice(&[page_index, page_index + 1])
    } else {
        SmallVec::from_slice(&[page_index])
    }
}

fn order_for_display(base: &[usize], direction: BindingDirection) -> SmallVec<[usize; 2]> {
    match direction {
        BindingDirection::Left => SmallVec::from_slice(base),
        BindingDirection::Right => base.iter().rev().copied().collect(),
    }
}
