//! `FileLoader` + L3 ByteCache (spec §4.3). Owns the resolved, naturally
//! ordered entry list for one opened path and the raw-bytes cache the
//! extractor fills. Grounded on `loader.py`'s `FileLoader`: `_determine_load_type`,
//! `_create_image_list`, and the wait-then-fallback `get_image_data` protocol,
//! ported from Qt's `QMutex`/`QWaitCondition` onto `parking_lot`'s
//! `Mutex`/`Condvar` — the same pairing `cosmokud-rust-image-viewer` uses
//! elsewhere in this repo for blocking handoffs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering as AtomicOrdering};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tracing::{error, info, warn};

use crate::archive::{self, is_supported_archive_name, is_supported_image_name, ArchiveReader};
use crate::entry::{EntryKey, ExtractionStatus, PageIndex, Priority};
use crate::error::OpenError;
use crate::natural_sort;

/// What kind of path `FileLoader` was opened against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadType {
    SingleImage,
    Folder,
    Archive,
}

fn status_from_u8(v: u8) -> ExtractionStatus {
    match v {
        0 => ExtractionStatus::Pending,
        1 => ExtractionStatus::Running,
        2 => ExtractionStatus::Completed,
        3 => ExtractionStatus::Failed,
        _ => ExtractionStatus::Cancelled,
    }
}

fn status_to_u8(s: ExtractionStatus) -> u8 {
    match s {
        ExtractionStatus::Pending => 0,
        ExtractionStatus::Running => 1,
        ExtractionStatus::Completed => 2,
        ExtractionStatus::Failed => 3,
        ExtractionStatus::Cancelled => 4,
    }
}

/// L3 ByteCache: raw bytes per entry name, guarded by a mutex/condvar pair
/// so `fetch` can block a Display-priority waiter until the extractor (or a
/// fallback read) fills the slot. Entries are stored as `Bytes` rather than
/// `Vec<u8>` so a cache hit clones a refcount, not the page's raw data.
struct ByteCache {
    mutex: Mutex<HashMap<String, Bytes>>,
    condvar: Condvar,
}

impl ByteCache {
    fn new() -> Self {
        Self { mutex: Mutex::new(HashMap::new()), condvar: Condvar::new() }
    }

    fn contains(&self, name: &str) -> bool {
        self.mutex.lock().contains_key(name)
    }

    fn insert(&self, name: String, data: Bytes) {
        self.mutex.lock().insert(name, data);
        self.condvar.notify_all();
    }

    fn get_cloned(&self, name: &str) -> Option<Bytes> {
        self.mutex.lock().get(name).cloned()
    }
}

pub struct FileLoader {
    pub path: PathBuf,
    pub load_type: LoadType,
    pub generation: u64,
    entries: Vec<EntryKey>,
    reader: Option<Mutex<Box<dyn ArchiveReader>>>,
    l3: ByteCache,
    extraction_status: AtomicU8,
}

impl FileLoader {
    /// Open `path` and resolve its entry list. Mirrors
    /// `FileLoader.__init__`/`_determine_load_type`/`_create_image_list`.
    pub fn open(path: &Path, generation: u64) -> Result<Self, OpenError> {
        if !path.exists() {
            return Err(OpenError::NotFound(path.to_path_buf()));
        }

        if path.is_dir() {
            // Probe the top-level directory first so a permission failure
            // surfaces as `ReadFailed` rather than silently producing an
            // empty list (jwalk's iterator swallows per-entry errors).
            std::fs::read_dir(path).map_err(|e| OpenError::ReadFailed { path: path.to_path_buf(), source: e })?;

            // Walk recursively (jwalk parallelizes the directory scan) so a
            // folder containing per-chapter subfolders reads as one flat
            // page list, same as an archive with directory-prefixed members.
            let mut names: Vec<String> = jwalk::WalkDir::new(path)
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
                .map(|entry| entry.path())
                .filter(|p| is_supported_image_name(&p.to_string_lossy()))
                .map(|p| p.to_string_lossy().into_owned())
                .collect();
            natural_sort::sort_by_key(&mut names, |n| n.as_str());
            let entries: Vec<EntryKey> = names.into_iter().map(EntryKey::from).collect();
            if entries.is_empty() {
                return Err(OpenError::Empty(path.to_path_buf()));
            }
            return Ok(Self {
                path: path.to_path_buf(),
                load_type: LoadType::Folder,
                generation,
                entries,
                reader: None,
                l3: ByteCache::new(),
                extraction_status: AtomicU8::new(status_to_u8(ExtractionStatus::Completed)),
            });
        }

        if is_supported_archive_name(&path.to_string_lossy()) {
            let mut reader = archive::open(path).map_err(|_| OpenError::Unsupported(path.to_path_buf()))?;
            let mut names = reader.list().map_err(|_| OpenError::Unsupported(path.to_path_buf()))?;
            natural_sort::sort_by_key(&mut names, |k| k.as_str());
            if names.is_empty() {
                return Err(OpenError::Empty(path.to_path_buf()));
            }
            return Ok(Self {
                path: path.to_path_buf(),
                load_type: LoadType::Archive,
                generation,
                entries: names,
                reader: Some(Mutex::new(reader)),
                l3: ByteCache::new(),
                extraction_status: AtomicU8::new(status_to_u8(ExtractionStatus::Pending)),
            });
        }

        if is_supported_image_name(&path.to_string_lossy()) {
            let name = path.to_string_lossy().into_owned();
            return Ok(Self {
                path: path.to_path_buf(),
                load_type: LoadType::SingleImage,
                generation,
                entries: vec![EntryKey::from(name)],
                reader: None,
                l3: ByteCache::new(),
                extraction_status: AtomicU8::new(status_to_u8(ExtractionStatus::Completed)),
            });
        }

        Err(OpenError::Unsupported(path.to_path_buf()))
    }

    pub fn entries(&self) -> &[EntryKey] {
        &self.entries
    }

    pub fn entry_at(&self, index: PageIndex) -> Option<&EntryKey> {
        self.entries.get(index)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn extraction_status(&self) -> ExtractionStatus {
        status_from_u8(self.extraction_status.load(AtomicOrdering::Acquire))
    }

    /// Called by the extractor (or the façade on archive-open-without-extraction)
    /// to move the terminal status forward so waiting `fetch` calls stop.
    pub fn set_extraction_status(&self, status: ExtractionStatus) {
        self.extraction_status.store(status_to_u8(status), AtomicOrdering::Release);
        if matches!(status, ExtractionStatus::Completed | ExtractionStatus::Failed | ExtractionStatus::Cancelled) {
            self.l3.condvar.notify_all();
        }
    }

    /// Called by the extractor after each insertion into L3.
    pub fn l3_insert(&self, name: String, data: Bytes) {
        self.l3.insert(name, data);
    }

    pub fn l3_contains(&self, name: &str) -> bool {
        self.l3.contains(name)
    }

    /// `fetch(entry, priority)` per spec §4.3: wait-then-fallback protocol.
    pub fn fetch(&self, entry: &EntryKey, priority: Priority) -> Option<Bytes> {
        {
            let mut guard = self.l3.mutex.lock();
            while !guard.contains_key(entry.as_str()) {
                let should_wait = self.load_type == LoadType::Archive
                    && self.extraction_status() == ExtractionStatus::Running
                    && priority == Priority::Display;

                if should_wait {
                    self.l3.condvar.wait(&mut guard);
                    continue;
                }

                if priority == Priority::Prefetch && self.load_type == LoadType::Archive {
                    return None;
                }
                break;
            }

            if let Some(data) = guard.get(entry.as_str()) {
                return Some(data.clone());
            }
        }

        match self.load_type {
            LoadType::Archive => {
                let Some(reader) = &self.reader else {
                    error!(entry = entry.as_str(), "archive reader missing, cannot fetch");
                    return None;
                };
                let data = match reader.lock().read(entry.as_str()) {
                    Ok(data) => Bytes::from(data),
                    Err(e) => {
                        warn!(entry = entry.as_str(), error = %e, "fallback archive read failed");
                        return None;
                    }
                };
                self.l3.insert(entry.as_str().to_string(), data.clone());
                info!(entry = entry.as_str(), bytes = data.len(), "fetched via fallback archive read");
                Some(data)
            }
            LoadType::Folder | LoadType::SingleImage => read_whole_file(entry.as_str()),
        }
    }

    /// Snapshot used by the extractor to know which entries remain unfilled,
    /// without holding the L3 lock across the whole scan.
    pub fn l3_missing(&self) -> Vec<String> {
        let guard = self.l3.mutex.lock();
        self.entries.iter().map(|e| e.as_str().to_string()).filter(|n| !guard.contains_key(n)).collect()
    }

    pub fn l3_get(&self, name: &str) -> Option<Bytes> {
        self.l3.get_cloned(name)
    }

    /// Used by the extractor thread to perform the primary fill read. Not
    /// used by `fetch`'s fallback path, which goes through the same reader
    /// but records bytes directly rather than going through this helper.
    pub(crate) fn extractor_read(&self, name: &str) -> Result<Bytes, String> {
        match &self.reader {
            Some(reader) => reader.lock().read(name).map(Bytes::from),
            None => Err("no archive reader".to_string()),
        }
    }
}

/// Read a loose image file straight off disk via a read-only mmap rather
/// than `std::fs::read`'s grow-and-copy buffer, since a folder page is
/// typically read once, in full, right before decode. `Ok(None)` on an
/// empty file (`memmap2` refuses to map zero-length files).
fn read_whole_file(path: &str) -> Option<Bytes> {
    let file = std::fs::File::open(path).ok()?;
    let meta = file.metadata().ok()?;
    if meta.len() == 0 {
        return Some(Bytes::new());
    }
    // Safety: the file is only ever read by this process's own decode
    // pipeline; nothing in this crate truncates or rewrites opened pages
    // concurrently with a fetch.
    let mmap = unsafe { memmap2::Mmap::map(&file) }.ok()?;
    Some(Bytes::copy_from_slice(&mmap[..]))
}
