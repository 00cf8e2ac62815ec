//! End-to-end scenarios S1-S6 from spec.md §8, exercised against the real
//! façade (`ReaderCore`) and real cache tiers rather than mocks, using small
//! synthetic JPEG fixtures written to a temp directory or a temp ZIP. Since
//! there is no real render thread in a test process, a `FakeUploader`
//! (implementing [`GpuUploader`]) stands in for the GL backend and the test
//! drives `TextureManager::process_frame` itself, the same contract a real
//! render loop follows.

use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use rust_manga_core::config::{Config, RenderingBackend};
use rust_manga_core::core::ConfigureOptions;
use rust_manga_core::entry::{ExtractionStatus, Priority, TextureKey};
use rust_manga_core::events::CoreEvent;
use rust_manga_core::file_loader::{FileLoader, LoadType};
use rust_manga_core::texture_manager::GpuUploader;
use rust_manga_core::Bitmap;

struct FakeUploader {
    next_id: AtomicU64,
}

impl FakeUploader {
    fn new() -> Self {
        Self { next_id: AtomicU64::new(1) }
    }
}

impl GpuUploader for FakeUploader {
    fn upload(&self, _bitmap: &Bitmap) -> Result<u64, String> {
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn delete(&self, _texture_id: u64) {}
}

/// A tiny JPEG, `side`x`side`, filled with `shade`. Big enough for `image`'s
/// JPEG encoder/decoder to round-trip reliably, small enough that decode
/// takes microseconds for the fixtures that need to finish fast.
fn jpeg_bytes(side: u32, shade: u8) -> Vec<u8> {
    let img = image::RgbImage::from_pixel(side, side, image::Rgb([shade, shade, shade]));
    let dyn_img = image::DynamicImage::ImageRgb8(img);
    let mut buf = Cursor::new(Vec::new());
    dyn_img.write_to(&mut buf, image::ImageFormat::Jpeg).expect("encode fixture jpeg");
    buf.into_inner()
}

fn write_folder_fixture(dir: &Path, count: usize, slow_page: Option<(usize, u32)>) {
    for i in 0..count {
        let bytes = match slow_page {
            Some((slow_idx, slow_side)) if slow_idx == i => jpeg_bytes(slow_side, 128),
            _ => jpeg_bytes(4, i as u8),
        };
        let name = format!("{:03}.jpg", i);
        std::fs::write(dir.join(name), bytes).unwrap();
    }
}

fn poll_until<F: FnMut() -> bool>(timeout: Duration, mut predicate: F) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn gpu_config() -> Config {
    let mut config = Config::default();
    config.rendering_backend = RenderingBackend::Gpu;
    config.dynamic_cache_resizing = false;
    config.l2_capacity_mb = 512;
    config.decode_workers = 1;
    config.is_spread_view = false;
    config
}

/// S1 — cold open of a 100-page folder, single view, radii L2=10, L1=9:
/// within bounded time L2 holds pages {0..=10} (11 entries), L1 holds pages
/// {0..=9} (10 entries), and `texture_ready((path,0))` fires before any other
/// `texture_ready`.
#[test]
fn s1_cold_open_single_view_populates_both_tiers_page_0_first() {
    let dir = tempfile::tempdir().unwrap();
    write_folder_fixture(dir.path(), 100, None);

    let mut config = gpu_config();
    config.cpu_prefetch_radius = 10;
    config.gpu_prefetch_radius = 9;
    let core = rust_manga_core::core::ReaderCore::new(config);

    let events_rx = core.events().subscribe();
    core.open(dir.path()).expect("open 100-page folder");

    let uploader = FakeUploader::new();
    let path = core.opened_path().unwrap();
    let ok = poll_until(Duration::from_secs(5), || {
        core.texture_manager().process_frame(&uploader, core.current_page());
        core.l2().len() == 11 && core.l1().len() == 10
    });
    assert!(ok, "L2/L1 did not converge to the expected residency window in time");

    for p in 0..=10 {
        assert!(core.l2().contains(p), "L2 missing page {p}");
    }
    for p in 0..10 {
        assert!(core.l1().contains(&TextureKey::new(path.clone(), p)), "L1 missing page {p}");
    }
    assert!(!core.l1().contains(&TextureKey::new(path.clone(), 10)), "L1 should not hold page 10 (outside R_L1=9)");

    let mut first_texture_ready_page = None;
    while let Ok(ev) = events_rx.try_recv() {
        if let CoreEvent::TextureReady { key } = ev {
            if first_texture_ready_page.is_none() {
                first_texture_ready_page = Some(key.page_index);
            }
        }
    }
    assert_eq!(first_texture_ready_page, Some(0), "page 0's texture must become ready before any other page's");
}

/// S2 — spread mode navigation: `is_spread_view = true`,
/// `spread_view_first_page_single = false`, current page 4. `navigate(+1)`
/// moves to page 6 (a step of two pages); the pair-left base is anchored at
/// the new current page, so the displayed/pinned key set becomes {6, 7}, not
/// {5, 6} — asserted on the exact pinned set rather than L1 residency, since
/// `R_L1 = 2` makes both {5,6} and {6,7} resident either way and wouldn't
/// catch an off-by-one base.
#[test]
fn s2_spread_mode_navigate_steps_by_two_pages() {
    let dir = tempfile::tempdir().unwrap();
    write_folder_fixture(dir.path(), 20, None);

    let mut config = gpu_config();
    config.is_spread_view = true;
    config.cpu_prefetch_radius = 3;
    config.gpu_prefetch_radius = 2;
    let core = rust_manga_core::core::ReaderCore::new(config);
    core.open(dir.path()).unwrap();

    core.display(4);
    assert_eq!(core.current_page(), 4);

    core.navigate(1);
    assert_eq!(core.current_page(), 6, "navigate(+1) in spread mode must step by two pages (4 -> 6)");

    let uploader = FakeUploader::new();
    let path = core.opened_path().unwrap();
    let ok = poll_until(Duration::from_secs(5), || {
        core.texture_manager().process_frame(&uploader, core.current_page());
        core.l1().contains(&TextureKey::new(path.clone(), 6)) && core.l1().contains(&TextureKey::new(path.clone(), 7))
    });
    assert!(ok, "displayed pair {{6,7}} did not become resident in L1");

    assert!(
        core.l1().is_pinned(&TextureKey::new(path.clone(), 6)),
        "page 6 must be pinned as part of the displayed pair"
    );
    assert!(
        core.l1().is_pinned(&TextureKey::new(path.clone(), 7)),
        "page 7 must be pinned as part of the displayed pair"
    );
    assert!(
        !core.l1().is_pinned(&TextureKey::new(path, 5)),
        "page 5 is only residency-window buffer, not part of the displayed pair, and must not be pinned"
    );
}

/// S3 — path replacement invalidates stale decodes: open path A (100
/// entries), `display(50)`; immediately open path B (20 entries). Decode
/// results from A delivered after the switch must not insert into L2.
#[test]
fn s3_open_replaces_loader_and_discards_stale_a_results() {
    let dir_a = tempfile::tempdir().unwrap();
    // page 050 is a large image so its decode is still in flight (or at
    // least its result not yet delivered) when we immediately open B.
    write_folder_fixture(dir_a.path(), 100, Some((50, 3000)));

    let dir_b = tempfile::tempdir().unwrap();
    write_folder_fixture(dir_b.path(), 20, None);

    let config = gpu_config();
    let core = rust_manga_core::core::ReaderCore::new(config);

    core.open(dir_a.path()).unwrap();
    core.display(50);

    // Switch paths immediately; page 50's decode (if still in flight) now
    // carries a stale generation.
    core.open(dir_b.path()).unwrap();
    let path_b = core.opened_path().unwrap();
    assert_eq!(path_b, dir_b.path());

    // Give any in-flight A decode plenty of time to attempt (and be refused)
    // delivery into L2.
    std::thread::sleep(Duration::from_millis(400));

    assert!(core.l2().len() <= 20, "L2 must only ever hold pages from the currently opened path B");
    assert!(!core.l2().contains(50), "path A's page 50 (out of range for 20-page path B) must not have leaked into L2");
    assert!(!core.l2().contains(60), "path A's page 60 must not have leaked into L2");
}

/// S5 — eviction-triggered retry: L1 capacity = 3, pinned = {k0}, cache =
/// {k0,k1,k2,k3} (one over capacity). Exactly one eviction occurs, selecting
/// the key with the largest `|page - current|` among the non-pinned keys;
/// its texture id appears in the next `drain_pending_deletions()`.
#[test]
fn s5_eviction_picks_farthest_non_pinned_key() {
    use rust_manga_core::events::EventBus;
    use rust_manga_core::texture_cache::{TextureCache, TextureEntry};

    let path = PathBuf::from("/book.cbz");
    let key = |page: usize| TextureKey::new(path.clone(), page);
    let entry = |id: u64| TextureEntry { texture_id: id, width: 10, height: 10 };

    let cache = TextureCache::new(3, EventBus::new());
    let current_page = 0;
    cache.insert(key(0), entry(100), current_page);
    cache.pin(&key(0));
    cache.insert(key(1), entry(101), current_page);
    cache.insert(key(2), entry(102), current_page);
    // Forces exactly one eviction among {1,2,3}; page 3 is farthest from 0.
    cache.insert(key(3), entry(103), current_page);

    let deleted = cache.drain_pending_deletions();
    assert_eq!(deleted, vec![103]);
    assert!(cache.contains(&key(0)));
    assert!(cache.contains(&key(1)));
    assert!(cache.contains(&key(2)));
    assert!(!cache.contains(&key(3)));
}

/// S6 — configuration change: with current page 50, `configure({
/// gpu_prefetch_radius: 2 })` shrinks L1 to exactly the keys for
/// `{48,49,50,51,52}` after the next prefetcher pass.
#[test]
fn s6_configure_shrinks_l1_to_new_radius() {
    let dir = tempfile::tempdir().unwrap();
    write_folder_fixture(dir.path(), 100, None);

    let mut config = gpu_config();
    config.cpu_prefetch_radius = 10;
    config.gpu_prefetch_radius = 9;
    let core = rust_manga_core::core::ReaderCore::new(config);
    core.open(dir.path()).unwrap();
    core.display(50);

    let uploader = FakeUploader::new();
    let path = core.opened_path().unwrap();
    let ok = poll_until(Duration::from_secs(5), || {
        core.texture_manager().process_frame(&uploader, core.current_page());
        (41..=59).all(|p| core.l1().contains(&TextureKey::new(path.clone(), p)))
    });
    assert!(ok, "L1 did not converge on the initial radius-9 window around page 50");

    core.configure(ConfigureOptions { gpu_prefetch_radius: Some(2), ..Default::default() });

    // `evict_outside` inside `navigate_to`/`settings_changed` runs
    // synchronously on the calling thread, so the shrink is immediate; no
    // further frames need to be processed for eviction (only for any new
    // upload, which none of {48..=52} need since they're already resident).
    for p in 48..=52 {
        assert!(core.l1().contains(&TextureKey::new(path.clone(), p)), "L1 missing page {p} after shrink");
    }
    for p in 0..48 {
        assert!(!core.l1().contains(&TextureKey::new(path.clone(), p)), "L1 should have evicted page {p}");
    }
    for p in 53..100 {
        assert!(!core.l1().contains(&TextureKey::new(path.clone(), p)), "L1 should have evicted page {p}");
    }
    assert_eq!(core.l1().len(), 5);
}

/// S4 — archive display wait: a `fetch(entry, Display)` call on an archive
/// whose extractor is `Running` and does not hold `entry` blocks until the
/// extractor inserts it; a concurrent `fetch(entry, Prefetch)` call for a
/// different entry returns a miss immediately, without blocking.
#[test]
fn s4_archive_display_fetch_blocks_until_extractor_fills_entry() {
    use zip::write::SimpleFileOptions;
    use zip::{CompressionMethod, ZipWriter};

    let dir = tempfile::tempdir().unwrap();
    let archive_path = dir.path().join("book.cbz");
    {
        let file = std::fs::File::create(&archive_path).unwrap();
        let mut writer = ZipWriter::new(file);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        for i in 0..5 {
            writer.start_file(format!("{:02}.jpg", i), options).unwrap();
            std::io::Write::write_all(&mut writer, &jpeg_bytes(4, i as u8)).unwrap();
        }
        writer.finish().unwrap();
    }

    let loader = std::sync::Arc::new(FileLoader::open(&archive_path, 1).unwrap());
    assert_eq!(loader.load_type, LoadType::Archive);
    loader.set_extraction_status(ExtractionStatus::Running);

    let target = loader.entry_at(2).unwrap().clone();
    let other = loader.entry_at(4).unwrap().clone();

    // Prefetch fetch for a different, still-unfilled entry must return a
    // miss immediately rather than blocking.
    let prefetch_start = Instant::now();
    let prefetch_result = loader.fetch(&other, Priority::Prefetch);
    assert!(prefetch_result.is_none());
    assert!(prefetch_start.elapsed() < Duration::from_millis(50), "prefetch fetch must not block");

    // Spawn a delayed "extractor" that fills the target entry after a short
    // pause, to prove the Display fetch actually blocked on it rather than
    // returning a stale/empty result immediately.
    let loader_for_extractor = std::sync::Arc::clone(&loader);
    let target_for_extractor = target.clone();
    let filler = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(150));
        let data = bytes::Bytes::from(jpeg_bytes(4, 77));
        loader_for_extractor.l3_insert(target_for_extractor.as_str().to_string(), data);
    });

    let display_start = Instant::now();
    let display_result = loader.fetch(&target, Priority::Display);
    let elapsed = display_start.elapsed();
    filler.join().unwrap();

    assert!(display_result.is_some(), "display fetch must eventually return the filled bytes");
    assert!(elapsed >= Duration::from_millis(100), "display fetch should have blocked until the entry was filled");
}
