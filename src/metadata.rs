//! Per-filesystem file metadata cache.
//!
//! Currently holds the directory entry and the sniffed media type. Owned by the
//! device that created it rather than living in any global table.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Mutex;

use crate::filesystem::{DeviceFilesystem, DirEntry};
use crate::utils::*;

/// How many leading bytes are enough for type sniffing. Chosen by reference to the
/// longest magic-number offset the matcher understands.
pub const FILE_HEADER_GUESS_LENGTH: usize = 261;

#[derive(Debug, Clone)]
pub struct Metadata {
    pub dir_entry: DirEntry,
    pub mime_type: Option<String>,
}

impl Metadata {
    pub fn from_direntry(fs: &dyn DeviceFilesystem, dir_entry: &DirEntry) -> Result<Metadata> {
        let mut handle = fs.open(&dir_entry.path)?;
        let mut header = vec![0u8; FILE_HEADER_GUESS_LENGTH];
        let mut read = 0;
        while read < header.len() {
            match handle.read(&mut header[read..])? {
                0 => break,
                n => read += n,
            }
        }
        header.truncate(read);
        ensure!(!header.is_empty(), "File {} is empty", dir_entry.path);

        Ok(Metadata {
            dir_entry: dir_entry.clone(),
            mime_type: infer::get(&header).map(|t| t.mime_type().to_owned()),
        })
    }
}

/// Cache of `Metadata` keyed by virtual path. Failed sniffs are cached as `None`.
#[derive(Default)]
pub struct FsMetadata {
    cache: Mutex<HashMap<String, Option<Metadata>>>,
}

impl FsMetadata {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn get(&self, fs: &dyn DeviceFilesystem, dir_entry: &DirEntry) -> Option<Metadata> {
        let mut cache = self.cache.lock().unwrap();
        cache.entry(dir_entry.path.clone())
            .or_insert_with(|| Metadata::from_direntry(fs, dir_entry).ok())
            .clone()
    }

    pub fn get_path(&self, path: &str) -> Option<Metadata> {
        self.cache.lock().unwrap().get(path).cloned().flatten()
    }
}
