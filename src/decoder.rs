//! Decoder worker pool (spec §4.5): two FIFO lanes (`Display` > `Prefetch`),
//! bounded in-flight parallelism `W`, decode-to-BGR24 normalization, and
//! generation-based staleness filtering on result handling.
//!
//! The coordinator-thread-plus-background-runtime shape is grounded on
//! `manga_loader.rs`'s `coordinator_loop` (dedicated dispatcher thread,
//! `rayon` used as the "underlying runtime" each decode job is submitted to).
//! Format-specific decode follows `loader.py`'s `LoadDecodeRunnable.run`:
//! decode to whatever channel count the codec gives back, expand grayscale,
//! drop alpha, normalize to 3-channel BGR.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use hashbrown::{HashMap, HashSet};
use parking_lot::{Condvar, Mutex};
use tracing::{error, warn};

use crate::entry::{Bitmap, PageIndex, Priority};
use crate::error::CoreError;
use crate::events::{CoreEvent, EventBus};
use crate::file_loader::FileLoader;
use crate::pixel_cache::PixelCache;

struct ActiveLoader {
    loader: Arc<FileLoader>,
    generation: u64,
}

struct Lanes {
    high: VecDeque<PageIndex>,
    low: VecDeque<PageIndex>,
    queued: HashSet<PageIndex>,
    /// Keyed by page index, but a page index alone does not identify a job:
    /// a stale generation's job and a fresh one can share the same page. The
    /// stored generation lets a completing job tell whether the entry still
    /// sitting under its page index is the one it created.
    in_flight: HashMap<PageIndex, (u64, Priority)>,
}

impl Lanes {
    /// Pop the next page to dispatch along with the lane (hence priority) it
    /// came from.
    fn pop_next(&mut self) -> Option<(PageIndex, Priority)> {
        if let Some(page) = self.high.pop_front() {
            return Some((page, Priority::Display));
        }
        self.low.pop_front().map(|page| (page, Priority::Prefetch))
    }

    /// Remove the in-flight entry for `page` only if it still belongs to
    /// `generation` — a later generation's entry for the same page index
    /// must survive a stale job's completion (spec §4.5 parallelism cap).
    fn remove_in_flight(&mut self, page: PageIndex, generation: u64) {
        if let Some(&(gen, _)) = self.in_flight.get(&page) {
            if gen == generation {
                self.in_flight.remove(&page);
            }
        }
    }
}

struct State {
    lanes: Mutex<Lanes>,
    dispatch_cv: Condvar,
    workers: usize,
    active: parking_lot::RwLock<Option<ActiveLoader>>,
    current_generation: AtomicU64,
    l2: Arc<PixelCache>,
    events: EventBus,
    shutdown: AtomicBool,
}

/// Bounded worker pool driving decode-on-demand for both priority lanes.
pub struct DecoderPool {
    state: Arc<State>,
    dispatcher: Option<std::thread::JoinHandle<()>>,
}

impl DecoderPool {
    pub fn new(workers: usize, l2: Arc<PixelCache>, events: EventBus) -> Self {
        let state = Arc::new(State {
            lanes: Mutex::new(Lanes {
                high: VecDeque::new(),
                low: VecDeque::new(),
                queued: HashSet::new(),
                in_flight: HashMap::new(),
            }),
            dispatch_cv: Condvar::new(),
            workers: workers.max(1),
            active: parking_lot::RwLock::new(None),
            current_generation: AtomicU64::new(0),
            l2,
            events,
            shutdown: AtomicBool::new(false),
        });

        let dispatcher_state = Arc::clone(&state);
        let dispatcher = std::thread::Builder::new()
            .name("decoder-dispatcher".into())
            .spawn(move || dispatch_loop(dispatcher_state))
            .expect("failed to spawn decoder dispatcher thread");

        Self { state, dispatcher: Some(dispatcher) }
    }

    /// Called by the façade on `open()`: swaps in the new loader/generation
    /// and drops all bookkeeping for the superseded one. In-flight jobs from
    /// the old generation keep running but their results are discarded on
    /// arrival (generation mismatch).
    pub fn set_active_loader(&self, loader: Arc<FileLoader>, generation: u64) {
        *self.state.active.write() = Some(ActiveLoader { loader, generation });
        self.state.current_generation.store(generation, Ordering::SeqCst);
        let mut lanes = self.state.lanes.lock();
        lanes.high.clear();
        lanes.low.clear();
        lanes.queued.clear();
        lanes.in_flight.clear();
        self.state.dispatch_cv.notify_all();
    }

    /// Enqueue `(page, priority)`. Rejects pages already resident in L2,
    /// already in flight, or already queued in either lane (spec §4.5).
    pub fn enqueue(&self, page: PageIndex, priority: Priority) {
        if self.state.l2.contains(page) {
            return;
        }
        let mut lanes = self.state.lanes.lock();
        if lanes.in_flight.contains_key(&page) || lanes.queued.contains(&page) {
            return;
        }
        lanes.queued.insert(page);
        match priority {
            Priority::Display => lanes.high.push_back(page),
            Priority::Prefetch => lanes.low.push_back(page),
        }
        drop(lanes);
        self.state.dispatch_cv.notify_all();
    }

    pub fn shutdown(&mut self) {
        self.state.shutdown.store(true, Ordering::SeqCst);
        self.state.dispatch_cv.notify_all();
        if let Some(handle) = self.dispatcher.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DecoderPool {
    fn drop(&mut self) {
        self.state.shutdown.store(true, Ordering::SeqCst);
        self.state.dispatch_cv.notify_all();
        if let Some(handle) = self.dispatcher.take() {
            let _ = handle.join();
        }
    }
}

fn dispatch_loop(state: Arc<State>) {
    loop {
        let (page, priority, generation) = {
            let mut lanes = state.lanes.lock();
            loop {
                if state.shutdown.load(Ordering::SeqCst) {
                    return;
                }
                if lanes.in_flight.len() < state.workers {
                    if let Some((page, priority)) = lanes.pop_next() {
                        lanes.queued.remove(&page);
                        let generation = state.current_generation.load(Ordering::SeqCst);
                        lanes.in_flight.insert(page, (generation, priority));
                        break (page, priority, generation);
                    }
                }
                state.dispatch_cv.wait(&mut lanes);
            }
        };

        let Some(job) = build_job(&state, page, priority) else {
            let mut lanes = state.lanes.lock();
            lanes.remove_in_flight(page, generation);
            continue;
        };

        let state_for_job = Arc::clone(&state);
        rayon::spawn(move || run_decode_job(state_for_job, job));
    }
}

struct DecodeJob {
    loader: Arc<FileLoader>,
    generation: u64,
    page: PageIndex,
    entry_name: String,
    priority: Priority,
}

fn build_job(state: &Arc<State>, page: PageIndex, priority: Priority) -> Option<DecodeJob> {
    let active = state.active.read();
    let active = active.as_ref()?;
    let entry = active.loader.entry_at(page)?;
    Some(DecodeJob {
        loader: Arc::clone(&active.loader),
        generation: active.generation,
        page,
        entry_name: entry.as_str().to_string(),
        priority,
    })
}

fn run_decode_job(state: Arc<State>, job: DecodeJob) {
    let start = Instant::now();
    let entry_key = crate::entry::EntryKey::from(job.entry_name.clone());

    let data = job.loader.fetch(&entry_key, job.priority);

    let result = data.ok_or_else(|| "no data available (prefetch miss or read failure)".to_string()).and_then(|bytes| {
        decode_to_bgr24(&job.entry_name, &bytes)
    });

    {
        let mut lanes = state.lanes.lock();
        lanes.remove_in_flight(job.page, job.generation);
    }
    state.dispatch_cv.notify_all();

    if job.generation != state.current_generation.load(Ordering::SeqCst) {
        return;
    }

    match result {
        Ok(bitmap) => {
            let elapsed = start.elapsed();
            state.l2.insert(job.page, bitmap);
            state.events.publish(CoreEvent::DecodeTiming { page: job.page, elapsed });
        }
        Err(message) => {
            let err = CoreError::DecodeFailed { page: job.page, message };
            error!(page = job.page, entry = job.entry_name.as_str(), error = %err, "decode failed");
            state.events.publish(CoreEvent::DecodeError {
                page: job.page,
                path: job.loader.path.clone(),
                message: err.to_string(),
            });
        }
    }
}

/// Decode raw bytes to a 24-bit BGR [`Bitmap`], dispatching by extension.
/// GIFs are flattened to their first frame (spec §3's "one fixed-format
/// bitmap per page" rules out keeping an animation resident in L2).
fn decode_to_bgr24(entry_name: &str, bytes: &[u8]) -> Result<Bitmap, String> {
    let ext = Path::new(entry_name).extension().and_then(|e| e.to_str()).unwrap_or_default().to_lowercase();

    match ext.as_str() {
        "jp2" | "j2k" => decode_jpeg2000(bytes),
        "gif" => decode_gif_first_frame(bytes),
        _ => decode_generic_image(bytes),
    }
}

fn decode_generic_image(bytes: &[u8]) -> Result<Bitmap, String> {
    let img = image::load_from_memory(bytes).map_err(|e| e.to_string())?;
    let rgb = img.to_rgb8();
    let (width, height) = rgb.dimensions();
    let mut bgr = Vec::with_capacity((width * height * 3) as usize);
    for px in rgb.pixels() {
        bgr.push(px[2]);
        bgr.push(px[1]);
        bgr.push(px[0]);
    }
    Ok(Bitmap::new(width, height, bgr))
}

fn decode_gif_first_frame(bytes: &[u8]) -> Result<Bitmap, String> {
    // `image::load_from_memory` already yields only the first frame for an
    // animated GIF when loaded through the generic decoder path.
    decode_generic_image(bytes)
}

fn decode_jpeg2000(bytes: &[u8]) -> Result<Bitmap, String> {
    let image = jpeg2k::Image::from_bytes(bytes).map_err(|e| e.to_string())?;
    let rgb = image.get_pixels(None).map_err(|e| e.to_string())?;
    let width = rgb.width;
    let height = rgb.height;
    let data = rgb.data;
    let channels = if height == 0 || width == 0 { 0 } else { data.len() as u32 / (width * height) };

    let mut bgr = Vec::with_capacity((width * height * 3) as usize);
    match channels {
        1 => {
            for &g in data.iter() {
                bgr.push(g);
                bgr.push(g);
                bgr.push(g);
            }
        }
        3 => {
            for chunk in data.chunks_exact(3) {
                bgr.push(chunk[2]);
                bgr.push(chunk[1]);
                bgr.push(chunk[0]);
            }
        }
        4 => {
            for chunk in data.chunks_exact(4) {
                bgr.push(chunk[2]);
                bgr.push(chunk[1]);
                bgr.push(chunk[0]);
            }
        }
        other => {
            warn!(channels = other, "unexpected jpeg2000 channel count, treating as grayscale");
            for &g in data.iter() {
                bgr.push(g);
                bgr.push(g);
                bgr.push(g);
            }
        }
    }
    Ok(Bitmap::new(width, height, bgr))
}
