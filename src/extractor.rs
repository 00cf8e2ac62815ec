//! Background archive extractor (spec §4.4). One thread per archive
//! `FileLoader`, filling the L3 ByteCache in folder-prioritized order.
//! Grounded on `archive.py`'s `ExtractionThread`, generalized from its
//! single-closest-member scheme to the spec's folder-partitioned one: members
//! are grouped by directory prefix and whole folders are extracted together,
//! which keeps a spread of pages in the same chapter/subfolder arriving as a
//! unit rather than file-by-file.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use crate::entry::{ExtractionStatus, PageIndex};
use crate::error::CoreError;
use crate::events::{CoreEvent, EventBus};
use crate::file_loader::FileLoader;

struct Folder {
    start: usize,
    member_indices: Vec<usize>,
}

fn partition_by_directory(names: &[String]) -> Vec<Folder> {
    let mut folders: Vec<Folder> = Vec::new();
    let mut by_prefix: std::collections::HashMap<String, usize> = std::collections::HashMap::new();

    for (idx, name) in names.iter().enumerate() {
        let prefix = Path::new(name).parent().map(|p| p.to_string_lossy().into_owned()).unwrap_or_default();
        match by_prefix.get(&prefix) {
            Some(&folder_idx) => folders[folder_idx].member_indices.push(idx),
            None => {
                by_prefix.insert(prefix, folders.len());
                folders.push(Folder { start: idx, member_indices: vec![idx] });
            }
        }
    }
    folders
}

/// Handle to a running extractor thread. Dropping this does not stop the
/// thread; call [`Extractor::stop`] explicitly (the façade does this when
/// tearing down a superseded loader).
pub struct Extractor {
    current_page: Arc<AtomicUsize>,
    running: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl Extractor {
    /// Spawn the extractor thread for `loader`. `loader.load_type` must be
    /// `Archive`; folder/single-image loaders have nothing to extract and
    /// already report a terminal status from `FileLoader::open`.
    pub fn spawn(loader: Arc<FileLoader>, events: EventBus) -> Self {
        let current_page = Arc::new(AtomicUsize::new(0));
        let running = Arc::new(AtomicBool::new(true));

        let thread_page = Arc::clone(&current_page);
        let thread_running = Arc::clone(&running);
        let handle = std::thread::spawn(move || {
            run_extraction(loader, events, thread_page, thread_running);
        });

        Self { current_page, running, handle: Some(handle) }
    }

    /// Non-blocking setter the façade calls on every navigation so the
    /// extractor re-reads it between folders (spec §4.4).
    pub fn update_current_page(&self, page: PageIndex) {
        self.current_page.store(page, Ordering::Relaxed);
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Extractor {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_extraction(
    loader: Arc<FileLoader>,
    events: EventBus,
    current_page: Arc<AtomicUsize>,
    running: Arc<AtomicBool>,
) {
    loader.set_extraction_status(ExtractionStatus::Running);

    let names: Vec<String> = loader.entries().iter().map(|e| e.as_str().to_string()).collect();
    let total = names.len();
    let mut folders = partition_by_directory(&names);
    let mut first_emitted = false;
    let mut extracted_count = 0usize;

    while running.load(Ordering::Relaxed) && !folders.is_empty() {
        let page = current_page.load(Ordering::Relaxed);

        let chosen = folders
            .iter()
            .position(|f| {
                let end = f.start + f.member_indices.len();
                page >= f.start && page < end
            })
            .unwrap_or_else(|| {
                folders
                    .iter()
                    .enumerate()
                    .min_by_key(|(_, f)| ((f.start as i64 - page as i64).unsigned_abs(), f.start))
                    .map(|(i, _)| i)
                    .expect("folders non-empty")
            });

        let folder = folders.remove(chosen);

        for &idx in &folder.member_indices {
            if !running.load(Ordering::Relaxed) {
                break;
            }
            let name = &names[idx];
            if loader.l3_contains(name) {
                extracted_count += 1;
                continue;
            }
            match loader.extractor_read(name) {
                Ok(data) => {
                    let size = data.len();
                    loader.l3_insert(name.clone(), data);
                    if !first_emitted {
                        events.publish(CoreEvent::FirstFileExtracted { name: name.clone() });
                        first_emitted = true;
                    }
                    info!(name, size, "extracted archive member");
                }
                Err(e) => {
                    let err = CoreError::ArchiveReadFailed { name: name.clone(), message: e };
                    warn!(name, error = %err, "failed to extract archive member, skipping (failed-final)");
                }
            }
            extracted_count += 1;
            events.publish(CoreEvent::ExtractionProgress { done: extracted_count, total });
        }
    }

    let status = if running.load(Ordering::Relaxed) { ExtractionStatus::Completed } else { ExtractionStatus::Cancelled };
    loader.set_extraction_status(status);
    events.publish(CoreEvent::ExtractionFinished { status });
    info!(?status, "extraction finished");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partitions_group_consecutive_same_directory_members() {
        let names = vec![
            "ch1/p1.jpg".to_string(),
            "ch1/p2.jpg".to_string(),
            "ch2/p1.jpg".to_string(),
            "ch2/p2.jpg".to_string(),
        ];
        let folders = partition_by_directory(&names);
        assert_eq!(folders.len(), 2);
        assert_eq!(folders[0].start, 0);
        assert_eq!(folders[0].member_indices, vec![0, 1]);
        assert_eq!(folders[1].start, 2);
        assert_eq!(folders[1].member_indices, vec![2, 3]);
    }

    #[test]
    fn flat_archive_is_a_single_folder() {
        let names = vec!["1.jpg".to_string(), "2.jpg".to_string(), "3.jpg".to_string()];
        let folders = partition_by_directory(&names);
        assert_eq!(folders.len(), 1);
        assert_eq!(folders[0].member_indices, vec![0, 1, 2]);
    }
}
