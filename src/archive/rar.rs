//! RAR/CBR backend. Grounded on `archive.py`'s `RarReader`. The `unrar` crate
//! only exposes a sequential header-by-header reader (no random access), so
//! both `list` and `read` walk the archive from the start, same as `py7zr`'s
//! reopen-per-read pattern used for 7z above.

use std::path::{Path, PathBuf};

use unrar::Archive;

use crate::entry::EntryKey;

use super::{is_supported_image_name, ArchiveReader};

pub struct RarReader {
    path: PathBuf,
}

impl RarReader {
    pub fn open(path: &Path) -> Result<Self, String> {
        Archive::new(path).open_for_listing().map_err(|e| e.to_string())?;
        Ok(Self { path: path.to_path_buf() })
    }
}

impl ArchiveReader for RarReader {
    fn list(&mut self) -> Result<Vec<EntryKey>, String> {
        let listing = Archive::new(&self.path).open_for_listing().map_err(|e| e.to_string())?;
        let mut names = Vec::new();
        for entry in listing {
            let entry = entry.map_err(|e| e.to_string())?;
            if !entry.is_directory() && is_supported_image_name(&entry.filename.to_string_lossy()) {
                names.push(entry.filename.to_string_lossy().into_owned());
            }
        }
        Ok(names.into_iter().map(EntryKey::from).collect())
    }

    fn read(&mut self, name: &str) -> Result<Vec<u8>, String> {
        let mut archive = Archive::new(&self.path).open_for_processing().map_err(|e| e.to_string())?;
        while let Some(header) = archive.read_header().map_err(|e| e.to_string())? {
            let is_match = header.entry().filename.to_string_lossy() == name;
            if is_match {
                let (data, _rest) = header.read().map_err(|e| e.to_string())?;
                return Ok(data);
            }
            archive = header.skip().map_err(|e| e.to_string())?;
        }
        Err(format!("'{name}' not found in rar archive"))
    }
}
