//! ZIP/CBZ backend. Grounded on `archive.py`'s `ZipReader`, ported onto the
//! `zip` crate in place of Python's `zipfile`.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use zip::ZipArchive;

use crate::entry::EntryKey;

use super::{is_supported_image_name, ArchiveReader};

pub struct ZipReader {
    archive: ZipArchive<File>,
}

impl ZipReader {
    pub fn open(path: &Path) -> Result<Self, String> {
        let file = File::open(path).map_err(|e| e.to_string())?;
        let archive = ZipArchive::new(file).map_err(|e| e.to_string())?;
        Ok(Self { archive })
    }
}

impl ArchiveReader for ZipReader {
    fn list(&mut self) -> Result<Vec<EntryKey>, String> {
        let mut names = Vec::with_capacity(self.archive.len());
        for i in 0..self.archive.len() {
            let entry = self.archive.by_index(i).map_err(|e| e.to_string())?;
            let name = entry.name().to_string();
            if !entry.is_dir() && is_supported_image_name(&name) {
                names.push(EntryKey::from(name));
            }
        }
        Ok(names)
    }

    fn read(&mut self, name: &str) -> Result<Vec<u8>, String> {
        let mut entry = self.archive.by_name(name).map_err(|e| e.to_string())?;
        let mut buf = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut buf).map_err(|e| e.to_string())?;
        Ok(buf)
    }
}
