//! 7Z/CB7 backend. Grounded on `archive.py`'s `SevenZipReader`, which caches
//! the member list on first access and re-opens the archive on every
//! `read_file` (py7zr has no cheap random-access reader). `sevenz-rust`'s
//! `for_each_entries` callback plays the same role as py7zr's
//! `MemoryWriterFactory`-based `extract`.

use std::io::Read;
use std::path::{Path, PathBuf};

use sevenz_rust::{Password, SevenZReader};

use crate::entry::EntryKey;

use super::{is_supported_image_name, ArchiveReader};

pub struct SevenZipReader {
    path: PathBuf,
    cached_names: Option<Vec<String>>,
}

impl SevenZipReader {
    pub fn open(path: &Path) -> Result<Self, String> {
        // Validate the archive opens before accepting it.
        SevenZReader::open(path, Password::empty()).map_err(|e| e.to_string())?;
        Ok(Self { path: path.to_path_buf(), cached_names: None })
    }
}

impl ArchiveReader for SevenZipReader {
    fn list(&mut self) -> Result<Vec<EntryKey>, String> {
        if self.cached_names.is_none() {
            let mut reader = SevenZReader::open(&self.path, Password::empty()).map_err(|e| e.to_string())?;
            let mut names = Vec::new();
            reader
                .for_each_entries(|entry, _| {
                    let name = entry.name().to_string();
                    if !entry.is_directory() && is_supported_image_name(&name) {
                        names.push(name);
                    }
                    Ok(true)
                })
                .map_err(|e| e.to_string())?;
            self.cached_names = Some(names);
        }
        Ok(self.cached_names.clone().unwrap_or_default().into_iter().map(EntryKey::from).collect())
    }

    fn read(&mut self, name: &str) -> Result<Vec<u8>, String> {
        let mut reader = SevenZReader::open(&self.path, Password::empty()).map_err(|e| e.to_string())?;
        let mut result: Option<Vec<u8>> = None;
        let target = name.to_string();
        reader
            .for_each_entries(|entry, entry_reader| {
                if entry.name() == target {
                    let mut buf = Vec::new();
                    entry_reader.read_to_end(&mut buf)?;
                    result = Some(buf);
                    return Ok(false);
                }
                Ok(true)
            })
            .map_err(|e| e.to_string())?;
        result.ok_or_else(|| format!("'{name}' not found in 7z archive"))
    }
}
