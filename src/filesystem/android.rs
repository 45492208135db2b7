//! Android backups: loose directory trees and their zipped form.
//!
//! A loose Android backup is a directory containing `data/data/android`. The zipped
//! form is a ZIP with exactly one top-level directory of the same shape; it is
//! extracted lazily, with only the settings database materialised up front.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::Connection;
use zip::ZipArchive;

use crate::errors::RimeError;
use crate::filesystem::{DeviceFilesystem, DeviceSettings, DirEntry, FilesystemKind, SETTINGS_FILENAME};
use crate::sql;
use crate::utils::*;

const ANDROID_MARKER: &str = "data/data/android";

fn vjoin(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() {
        format!("/{name}")
    } else {
        format!("{dir}/{name}")
    }
}

#[derive(Debug)]
pub struct AndroidDeviceFilesystem {
    id: String,
    root: PathBuf,
    settings: DeviceSettings,
}

impl AndroidDeviceFilesystem {
    pub fn new(id: &str, root: &Path) -> Result<Self> {
        Ok(AndroidDeviceFilesystem {
            id: id.to_owned(),
            root: root.to_owned(),
            settings: DeviceSettings::new(root)?,
        })
    }

    pub fn is_device_filesystem(path: &Path) -> bool {
        syspath(path, ANDROID_MARKER).exists()
    }

    pub fn create(id: &str, root: &Path,
                  _template: Option<&dyn DeviceFilesystem>) -> Result<Self> {
        if root.exists() {
            bail!(RimeError::FileExists(path_to_str(root)?.to_owned()));
        }
        std::fs::create_dir_all(syspath(root, ANDROID_MARKER))?;

        let fs = Self::new(id, root)?;
        fs.settings.set_subset_fs(true)?;
        Ok(fs)
    }

    fn syspath(&self, vpath: &str) -> PathBuf {
        syspath(&self.root, vpath)
    }
}

impl DeviceFilesystem for AndroidDeviceFilesystem {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> FilesystemKind {
        FilesystemKind::Android
    }

    fn is_subset_filesystem(&self) -> bool {
        self.settings.is_subset_fs()
    }

    fn scandir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let mut entries = vec![];
        for dir_entry in std::fs::read_dir(self.syspath(path))? {
            let dir_entry = dir_entry?;
            let name = dir_entry.file_name().to_string_lossy().into_owned();
            let metadata = dir_entry.metadata()?;
            entries.push(DirEntry::from_fs_metadata(name.clone(), vjoin(path, &name), &metadata));
        }
        Ok(entries)
    }

    fn exists(&self, path: &str) -> bool {
        self.syspath(path).exists()
    }

    fn getsize(&self, path: &str) -> Result<u64> {
        Ok(std::fs::metadata(self.syspath(path))?.len())
    }

    fn open(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(self.syspath(path))?))
    }

    fn create_file(&self, path: &str) -> Result<Box<dyn Write + Send>> {
        let syspath = self.syspath(path);
        if let Some(parent) = syspath.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Box::new(File::create(syspath)?))
    }

    fn sqlite3_connect(&self, path: &str, read_only: bool) -> Result<Connection> {
        let syspath = self.syspath(path);
        log::debug!("Android connecting to {syspath:?} (read_only: {read_only})");
        if read_only {
            sql::sqlite3_connect_read_only(&syspath)
        } else {
            sql::sqlite3_connect(&syspath)
        }
    }

    fn sqlite3_create(&self, path: &str) -> Result<Connection> {
        sql::sqlite3_create(&self.syspath(path))
    }

    fn lock(&self, locked: bool) -> EmptyRes {
        self.settings.set_locked(locked)
    }

    fn is_locked(&self) -> bool {
        self.settings.is_locked()
    }

    fn path_to_direntry(&self, path: &str) -> Result<DirEntry> {
        let metadata = std::fs::metadata(self.syspath(path))?;
        let name = path.rsplit('/').next().unwrap_or(path).to_owned();
        Ok(DirEntry::from_fs_metadata(name, path.to_owned(), &metadata))
    }
}

/// Shared plumbing for the two zipped backup kinds.
pub(crate) struct ZippedTree {
    pub archive: Mutex<ZipArchive<File>>,
    /// Name of the single top-level directory, with trailing slash.
    pub main_dir: String,
    /// Holds lazily extracted copies for the lifetime of the filesystem.
    pub temp: tempfile::TempDir,
}

impl ZippedTree {
    pub fn open(root: &Path) -> Result<Self> {
        let mut archive = ZipArchive::new(File::open(root)?)?;
        let main_dir = Self::main_dir_of(&mut archive)
            .with_context(|| format!("{root:?} does not contain a single top-level directory"))?;
        Ok(ZippedTree {
            archive: Mutex::new(archive),
            main_dir,
            temp: tempfile::tempdir()?,
        })
    }

    /// The single top-level directory all content lives under, or None.
    pub fn main_dir_of<R: Read + Seek>(archive: &mut ZipArchive<R>) -> Option<String> {
        let mut top_level: Option<&str> = None;
        for name in archive.file_names() {
            let first = name.split('/').next()?;
            match top_level {
                None => top_level = Some(first),
                Some(existing) if existing == first => {}
                Some(_) => return None,
            }
        }
        top_level.map(|dir| format!("{dir}/"))
    }

    fn member_name(&self, vpath: &str) -> String {
        format!("{}{}", self.main_dir, vpath.trim_start_matches('/'))
    }

    pub fn entry_exists(&self, vpath: &str) -> bool {
        let member = self.member_name(vpath);
        let dir_prefix = format!("{}/", member.trim_end_matches('/'));
        let archive = self.archive.lock().unwrap();
        let found = archive.file_names().any(|name| name == member || name.starts_with(&dir_prefix));
        found
    }

    pub fn entry_size(&self, vpath: &str) -> Result<u64> {
        let mut archive = self.archive.lock().unwrap();
        let size = archive.by_name(&self.member_name(vpath))?.size();
        Ok(size)
    }

    /// Streams an archived file into an anonymous temporary file.
    pub fn extract_to_tempfile(&self, vpath: &str) -> Result<File> {
        let mut archive = self.archive.lock().unwrap();
        let mut entry = archive.by_name(&self.member_name(vpath))?;
        let mut out = tempfile::tempfile()?;
        std::io::copy(&mut entry, &mut out)?;
        out.seek(SeekFrom::Start(0))?;
        Ok(out)
    }

    /// Extracts an archived file to a stable location under the temp root, reusing a
    /// previous extraction if present. Used where a real pathname is needed (SQLite).
    pub fn extract_to_temp_path(&self, vpath: &str) -> Result<PathBuf> {
        let out_path = syspath(&self.temp.path().join("extracted"), vpath);
        if !out_path.exists() {
            let mut archive = self.archive.lock().unwrap();
            let mut entry = archive.by_name(&self.member_name(vpath))?;
            if let Some(parent) = out_path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&out_path)?;
            std::io::copy(&mut entry, &mut out)?;
        }
        Ok(out_path)
    }

    pub fn scandir(&self, path: &str) -> Result<Vec<DirEntry>> {
        let member = self.member_name(path);
        let prefix = format!("{}/", member.trim_end_matches('/'));

        let mut names: Vec<(String, bool)> = vec![];
        {
            let archive = self.archive.lock().unwrap();
            for name in archive.file_names() {
                let Some(rest) = name.strip_prefix(&prefix) else { continue };
                if rest.is_empty() {
                    continue;
                }
                match rest.split_once('/') {
                    None => names.push((rest.to_owned(), false)),
                    Some((dir, _)) => {
                        let dir = dir.to_owned();
                        if !names.iter().any(|(n, is_dir)| *is_dir && *n == dir) {
                            names.push((dir, true));
                        }
                    }
                }
            }
        }

        let mut entries = vec![];
        for (name, is_dir) in names {
            let vpath = vjoin(path, &name);
            let size = if is_dir { 0 } else { self.entry_size(&vpath).unwrap_or(0) };
            entries.push(DirEntry {
                name,
                path: vpath,
                is_dir,
                size,
                modified: None,
                created: None,
            });
        }
        Ok(entries)
    }

    /// Materialises the settings DB shipped inside the archive (or an empty one).
    pub fn extract_settings(&self) -> Result<DeviceSettings> {
        let extracted = self.temp.path().join("extracted");
        std::fs::create_dir_all(&extracted)?;
        if self.entry_exists(SETTINGS_FILENAME) {
            self.extract_to_temp_path(SETTINGS_FILENAME)?;
        }
        DeviceSettings::new(&extracted)
    }
}

pub struct AndroidZippedDeviceFilesystem {
    id: String,
    tree: ZippedTree,
    settings: DeviceSettings,
}

impl AndroidZippedDeviceFilesystem {
    pub fn new(id: &str, root: &Path) -> Result<Self> {
        let tree = ZippedTree::open(root)?;
        let settings = tree.extract_settings()?;
        Ok(AndroidZippedDeviceFilesystem { id: id.to_owned(), tree, settings })
    }

    pub fn is_device_filesystem(path: &Path) -> bool {
        let Ok(file) = File::open(path) else { return false };
        let Ok(mut archive) = ZipArchive::new(file) else { return false };
        let Some(main_dir) = ZippedTree::main_dir_of(&mut archive) else { return false };

        let marker = format!("{main_dir}{ANDROID_MARKER}/");
        let found = archive.file_names().any(|name| name.starts_with(&marker));
        found
    }
}

impl DeviceFilesystem for AndroidZippedDeviceFilesystem {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> FilesystemKind {
        FilesystemKind::AndroidZipped
    }

    fn is_subset_filesystem(&self) -> bool {
        self.settings.is_subset_fs()
    }

    fn scandir(&self, path: &str) -> Result<Vec<DirEntry>> {
        self.tree.scandir(path)
    }

    fn exists(&self, path: &str) -> bool {
        self.tree.entry_exists(path)
    }

    fn getsize(&self, path: &str) -> Result<u64> {
        self.tree.entry_size(path)
    }

    fn open(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(self.tree.extract_to_tempfile(path)?))
    }

    fn create_file(&self, _path: &str) -> Result<Box<dyn Write + Send>> {
        Err(RimeError::UnsupportedOperation("zipped filesystems are read-only").into())
    }

    fn sqlite3_connect(&self, path: &str, read_only: bool) -> Result<Connection> {
        // Always connect to a temporary copy; the archive itself is never modified.
        let extracted = self.tree.extract_to_temp_path(path)?;
        log::debug!("Android (zipped) connecting to {extracted:?}");
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
        Ok(DirEntry {
            name,
            path: path.to_owned(),
            is_dir: !self.tree.entry_exists(path) || self.tree.entry_size(path).is_err(),
            size: self.tree.entry_size(path).unwrap_or(0),
            modified: None,
            created: None,
        })
    }
}

#[cfg(test)]
#[path = "android_tests.rs"]
mod tests;
