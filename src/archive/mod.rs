//! `ArchiveReader` (spec §4 component 1, §6): opens a container and exposes
//! `list()` / `read()`. Grounded on `examples/original_source/app/io/archive.py`'s
//! `IArchiveReader` trait and its three implementations (`ZipReader`,
//! `SevenZipReader`, `RarReader`), reworked onto real crates the teacher
//! repo doesn't carry (`zip`, `sevenz-rust`, `unrar`) since no example repo
//! in the pack reads archives.

mod rar;
mod sevenz;
mod zip_reader;

pub use rar::RarReader;
pub use sevenz::SevenZipReader;
pub use zip_reader::ZipReader;

use crate::entry::EntryKey;

/// Supported archive extensions, case-insensitive (spec §6).
pub const SUPPORTED_ARCHIVE_EXTENSIONS: &[&str] = &["zip", "cbz", "7z", "cb7", "rar", "cbr"];

/// Supported image extensions, case-insensitive (spec §6).
pub const SUPPORTED_IMAGE_EXTENSIONS: &[&str] =
    &["jpg", "jpeg", "png", "bmp", "webp", "avif", "jp2", "j2k"];

pub fn is_supported_image_name(name: &str) -> bool {
    std::path::Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| SUPPORTED_IMAGE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

pub fn is_supported_archive_name(name: &str) -> bool {
    std::path::Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| SUPPORTED_ARCHIVE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

/// Reads a single archive container. Implementations must be safe to call
/// `read` on repeatedly and concurrently is NOT required — the extractor is
/// the sole reader thread; the façade only calls `read` synchronously as a
/// last-resort fallback after the extractor has gone through a terminal
/// status (spec §4.3 step 3).
pub trait ArchiveReader: Send {
    /// Ordered (insertion order, not yet naturally sorted) list of
    /// supported-image member names.
    fn list(&mut self) -> Result<Vec<EntryKey>, String>;

    /// Read one member's raw bytes.
    fn read(&mut self, name: &str) -> Result<Vec<u8>, String>;
}

/// Open the archive at `path`, selecting a reader by extension (spec §6).
pub fn open(path: &std::path::Path) -> Result<Box<dyn ArchiveReader>, String> {
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "zip" | "cbz" => Ok(Box::new(ZipReader::open(path)?)),
        "7z" | "cb7" => Ok(Box::new(SevenZipReader::open(path)?)),
        "rar" | "cbr" => Ok(Box::new(RarReader::open(path)?)),
        other => Err(format!("unsupported archive extension: {other}")),
    }
}
