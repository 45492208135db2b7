//! iOS backups: loose backup directories and their zipped form.
//!
//! A loose iOS backup contains `Manifest.db` and `Info.plist`, with file content
//! stored at `<fileID[0:2]>/<fileID>`. The optional `Manifest.plist` carries the
//! `IsEncrypted` flag which routes detection to the encrypted variant instead.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::DateTime;
use rusqlite::Connection;

use crate::errors::RimeError;
use crate::filesystem::{DeviceFilesystem, DeviceSettings, DirEntry, FilesystemKind};
use crate::filesystem::android::ZippedTree;
use crate::filesystem::ios_manifest::IosManifest;
use crate::sql;
use crate::utils::*;

pub const MANIFEST_DB: &str = "Manifest.db";
pub const MANIFEST_PLIST: &str = "Manifest.plist";
pub const INFO_PLIST: &str = "Info.plist";

pub fn ios_filesystem_is_encrypted(path: &Path) -> bool {
    let manifest_plist = path.join(MANIFEST_PLIST);
    if !manifest_plist.exists() {
        return false;
    }
    match plist::Value::from_file(&manifest_plist) {
        Ok(value) => value.as_dictionary()
            .and_then(|dict| dict.get("IsEncrypted"))
            .and_then(|v| v.as_boolean())
            .unwrap_or(false),
        Err(e) => {
            log::warn!("Cannot parse {manifest_plist:?}: {e}");
            false
        }
    }
}

pub struct IosDeviceFilesystem {
    id: String,
    root: PathBuf,
    manifest: Arc<IosManifest>,
    settings: DeviceSettings,
}

impl IosDeviceFilesystem {
    pub fn new(id: &str, root: &Path) -> Result<Self> {
        let manifest_conn = sql::sqlite3_connect(&root.join(MANIFEST_DB))?;
        Ok(IosDeviceFilesystem {
            id: id.to_owned(),
            root: root.to_owned(),
            manifest: Arc::new(IosManifest::new(manifest_conn)),
            settings: DeviceSettings::new(root)?,
        })
    }

    pub fn is_device_filesystem(path: &Path) -> bool {
        path.join(MANIFEST_DB).exists()
            && path.join(INFO_PLIST).exists()
            && !ios_filesystem_is_encrypted(path)
    }

    pub fn create(id: &str, root: &Path,
                  template: Option<&dyn DeviceFilesystem>) -> Result<Self> {
        if root.exists() {
            bail!(RimeError::FileExists(path_to_str(root)?.to_owned()));
        }
        std::fs::create_dir_all(root)?;

        // Create the manifest by hand since there's no device to copy it from.
        let manifest_conn = sql::sqlite3_create(&root.join(MANIFEST_DB))?;
        IosManifest::create_schema(&manifest_conn)?;
        drop(manifest_conn);

        match template {
            None => {
                // Touch Info.plist so the layout is recognised as an iOS backup.
                File::create(root.join(INFO_PLIST))?;
            }
            Some(template) => {
                let mut src = template.open_raw(INFO_PLIST)?;
                let mut dst = File::create(root.join(INFO_PLIST))?;
                std::io::copy(&mut src, &mut dst)?;
            }
        }

        let fs = Self::new(id, root)?;
        fs.settings.set_subset_fs(true)?;
        Ok(fs)
    }

    fn hashed_syspath(&self, path: &str) -> Result<PathBuf> {
        Ok(syspath(&self.root, &self.manifest.get_hashed_pathname(path)?))
    }
}

impl DeviceFilesystem for IosDeviceFilesystem {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> FilesystemKind {
        FilesystemKind::Ios
    }

    fn is_subset_filesystem(&self) -> bool {
        self.settings.is_subset_fs()
    }

    fn scandir(&self, path: &str) -> Result<Vec<DirEntry>> {
        self.manifest.scandir(path)
    }

    fn exists(&self, path: &str) -> bool {
        self.hashed_syspath(path).map(|p| p.exists()).unwrap_or(false)
    }

    fn getsize(&self, path: &str) -> Result<u64> {
        Ok(std::fs::metadata(self.hashed_syspath(path)?)?.len())
    }

    fn open(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(self.hashed_syspath(path)?)?))
    }

    fn open_raw(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(syspath(&self.root, path))?))
    }

    fn create_file(&self, path: &str) -> Result<Box<dyn Write + Send>> {
        self.manifest.add_file(path)?;
        let syspath = self.hashed_syspath(path)?;
        if let Some(parent) = syspath.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Box::new(File::create(syspath)?))
    }

    fn sqlite3_connect(&self, path: &str, read_only: bool) -> Result<Connection> {
        let syspath = self.hashed_syspath(path)?;
        log::debug!("iOS connecting to {syspath:?} ({path})");
        if read_only {
            sql::sqlite3_connect_read_only(&syspath)
        } else {
            sql::sqlite3_connect(&syspath)
        }
    }

    fn sqlite3_create(&self, path: &str) -> Result<Connection> {
        self.manifest.add_file(path)?;

        let syspath = self.hashed_syspath(path)?;
        if syspath.exists() {
            bail!(RimeError::FileExists(path.to_owned()));
        }
        sql::sqlite3_create(&syspath)
    }

    fn lock(&self, locked: bool) -> EmptyRes {
        self.settings.set_locked(locked)
    }

    fn is_locked(&self) -> bool {
        self.settings.is_locked()
    }

    fn path_to_direntry(&self, path: &str) -> Result<DirEntry> {
        let name = path.rsplit('/').next().unwrap_or(path).to_owned();
        match self.manifest.file_record(path)? {
            Some(record) => Ok(DirEntry {
                name,
                path: path.to_owned(),
                is_dir: record.is_dir(),
                size: record.size,
                modified: record.last_modified.and_then(|ts| DateTime::from_timestamp(ts, 0)),
                created: record.birth.and_then(|ts| DateTime::from_timestamp(ts, 0)),
            }),
            None => {
                let metadata = std::fs::metadata(self.hashed_syspath(path)?)?;
                Ok(DirEntry::from_fs_metadata(name, path.to_owned(), &metadata))
            }
        }
    }
}

pub struct IosZippedDeviceFilesystem {
    id: String,
    tree: ZippedTree,
    manifest: Arc<IosManifest>,
    settings: DeviceSettings,
}

impl IosZippedDeviceFilesystem {
    pub fn new(id: &str, root: &Path) -> Result<Self> {
        let tree = ZippedTree::open(root)?;

        // The manifest and settings databases are materialised up front so SQLite
        // can open them; everything else is extracted per request.
        let manifest_path = tree.extract_to_temp_path(MANIFEST_DB)?;
        let settings = tree.extract_settings()?;
        let manifest_conn = sql::sqlite3_connect(&manifest_path)?;

        Ok(IosZippedDeviceFilesystem {
            id: id.to_owned(),
            tree,
            manifest: Arc::new(IosManifest::new(manifest_conn)),
            settings,
        })
    }

    pub fn is_device_filesystem(path: &Path) -> bool {
        let Ok(file) = File::open(path) else { return false };
        let Ok(mut archive) = zip::ZipArchive::new(file) else { return false };
        let Some(main_dir) = ZippedTree::main_dir_of(&mut archive) else { return false };

        let mut has = |name: &str| archive.by_name(&format!("{main_dir}{name}")).is_ok();
        has(MANIFEST_DB) && has(INFO_PLIST)
    }
}

impl DeviceFilesystem for IosZippedDeviceFilesystem {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> FilesystemKind {
        FilesystemKind::IosZipped
    }

    fn is_subset_filesystem(&self) -> bool {
        self.settings.is_subset_fs()
    }

    fn scandir(&self, path: &str) -> Result<Vec<DirEntry>> {
        self.manifest.scandir(path)
    }

    fn exists(&self, path: &str) -> bool {
        match self.manifest.get_hashed_pathname(path) {
            Ok(hashed) => self.tree.entry_exists(&hashed),
            Err(_) => false,
        }
    }

    fn getsize(&self, path: &str) -> Result<u64> {
        self.tree.entry_size(&self.manifest.get_hashed_pathname(path)?)
    }

    fn open(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        let hashed = self.manifest.get_hashed_pathname(path)?;
        Ok(Box::new(self.tree.extract_to_tempfile(&hashed)?))
    }

    fn open_raw(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(self.tree.extract_to_tempfile(path)?))
    }

    fn create_file(&self, _path: &str) -> Result<Box<dyn Write + Send>> {
        Err(RimeError::UnsupportedOperation("zipped filesystems are read-only").into())
    }

    fn sqlite3_connect(&self, path: &str, read_only: bool) -> Result<Connection> {
        let extracted = self.tree.extract_to_temp_path(&self.manifest.get_hashed_pathname(path)?)?;
        log::debug!("iOS (zipped) connecting to {extracted:?} ({path})");
        if read_only {
            sql::sqlite3_connect_read_only(&extracted)
        } else {
            sql::sqlite3_connect(&extracted)
        }
    }

    fn sqlite3_create(&self, _path: &str) -> Result<Connection> {
        Err(RimeError::UnsupportedOperation("zipped filesystems are read-only").into())
    }

    fn lock(&self, locked: bool) -> EmptyRes {
        self.settings.set_locked(locked)
    }

    fn is_locked(&self) -> bool {
        self.settings.is_locked()
    }

    fn path_to_direntry(&self, path: &str) -> Result<DirEntry> {
        let name = path.rsplit('/').next().unwrap_or(path).to_owned();
        match self.manifest.file_record(path)? {
            Some(record) => Ok(DirEntry {
                name,
                path: path.to_owned(),
                is_dir: record.is_dir(),
                size: record.size,
                modified: record.last_modified.and_then(|ts| DateTime::from_timestamp(ts, 0)),
                created: record.birth.and_then(|ts| DateTime::from_timestamp(ts, 0)),
            }),
            None => err!("No manifest entry for {path}"),
        }
    }
}

#[cfg(test)]
#[path = "ios_tests.rs"]
mod tests;
