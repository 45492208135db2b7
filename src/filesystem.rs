//! The device-filesystem abstraction.
//!
//! Five backup layouts are unified behind one trait: loose Android trees, zipped
//! Android trees, iOS backup directories (hash-addressed via `Manifest.db`), zipped
//! iOS backups, and encrypted iOS backups. Paths passed to a filesystem are virtual:
//! '/'-separated and relative to the backup root, with iOS paths written as
//! `domain/relativePath`.

use std::io::{Read, Write};

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::utils::*;

pub mod settings;
pub mod android;
pub mod ios;
pub mod ios_manifest;
pub mod ios_encrypted;
pub mod keybag;
pub mod registry;

pub use registry::FilesystemRegistry;
pub use settings::DeviceSettings;

pub const SETTINGS_FILENAME: &str = "_rime_settings.db";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FilesystemKind {
    Android,
    AndroidZipped,
    Ios,
    IosZipped,
    IosEncrypted,
}

impl FilesystemKind {
    pub fn name(&self) -> &'static str {
        match self {
            FilesystemKind::Android => "android",
            FilesystemKind::AndroidZipped => "android-zipped",
            FilesystemKind::Ios => "ios",
            FilesystemKind::IosZipped => "ios-zipped",
            FilesystemKind::IosEncrypted => "ios-encrypted",
        }
    }
}

/// Directory entry metadata captured at scan time rather than queried lazily.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    /// Virtual path of the entry.
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub created: Option<DateTime<Utc>>,
}

impl DirEntry {
    pub fn is_dir(&self) -> bool {
        self.is_dir
    }

    pub fn is_file(&self) -> bool {
        !self.is_dir
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.created.or(self.modified).unwrap_or(DateTime::UNIX_EPOCH)
    }

    pub fn from_fs_metadata(name: String, path: String, meta: &std::fs::Metadata) -> DirEntry {
        DirEntry {
            name,
            path,
            is_dir: meta.is_dir(),
            size: meta.len(),
            modified: meta.modified().ok().map(DateTime::<Utc>::from),
            created: meta.created().ok().map(DateTime::<Utc>::from),
        }
    }
}

pub trait DeviceFilesystem: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> FilesystemKind;

    /// Is this a subset produced by RIME rather than an acquired backup?
    fn is_subset_filesystem(&self) -> bool;

    fn scandir(&self, path: &str) -> Result<Vec<DirEntry>>;

    fn exists(&self, path: &str) -> bool;

    fn getsize(&self, path: &str) -> Result<u64>;

    fn open(&self, path: &str) -> Result<Box<dyn Read + Send>>;

    /// Opens a path without any manifest translation. Only differs from `open` on
    /// iOS variants, where it reaches files like `Info.plist` that live outside the
    /// hash-addressed store.
    fn open_raw(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        self.open(path)
    }

    fn create_file(&self, path: &str) -> Result<Box<dyn Write + Send>>;

    fn sqlite3_connect(&self, path: &str, read_only: bool) -> Result<Connection>;

    fn sqlite3_create(&self, path: &str) -> Result<Connection>;

    /// A locked filesystem refuses provider access; used to hide half-built subsets.
    /// Lock state persists across restarts.
    fn lock(&self, locked: bool) -> EmptyRes;

    fn is_locked(&self) -> bool;

    fn dirname(&self, path: &str) -> String {
        vpath_dirname(path).to_owned()
    }

    fn path_to_direntry(&self, path: &str) -> Result<DirEntry>;

    /// The encrypted capability, present on encrypted variants only.
    fn as_encrypted(&self) -> Option<&dyn EncryptedDeviceFilesystem> {
        None
    }
}

pub trait EncryptedDeviceFilesystem: DeviceFilesystem {
    fn is_encrypted(&self) -> bool;

    /// Derives keys from `passphrase` and enables decrypted access. Fails with
    /// `WrongPassphrase` on a bad key and `NoPassphrase` when none was supplied.
    fn decrypt(&self, passphrase: &str) -> EmptyRes;
}

/// Depth-first walk over the files (not directories) below `path`.
///
/// The walk is lazy: directories are scanned as the iterator reaches them.
pub fn walk<'a>(fs: &'a dyn DeviceFilesystem, path: &str) -> Walk<'a> {
    Walk { fs, pending_dirs: vec![path.to_owned()], pending_files: vec![] }
}

pub struct Walk<'a> {
    fs: &'a dyn DeviceFilesystem,
    pending_dirs: Vec<String>,
    pending_files: Vec<DirEntry>,
}

impl<'a> Iterator for Walk<'a> {
    type Item = DirEntry;

    fn next(&mut self) -> Option<DirEntry> {
        loop {
            if let Some(entry) = self.pending_files.pop() {
                return Some(entry);
            }
            let dir = self.pending_dirs.pop()?;
            match self.fs.scandir(&dir) {
                Ok(entries) => {
                    for entry in entries {
                        if entry.is_dir() {
                            self.pending_dirs.push(entry.path.clone());
                        } else {
                            self.pending_files.push(entry);
                        }
                    }
                }
                Err(e) => log::warn!("Cannot scan {dir}: {e}"),
            }
        }
    }
}
