//! Discovery and lifetime of device filesystems under a base path.
//!
//! Filesystems are keyed by the name of their directory (or archive) under the base
//! path; that name is the device id.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lazy_static::lazy_static;
use regex::Regex;

use crate::errors::RimeError;
use crate::filesystem::{DeviceFilesystem, FilesystemKind};
use crate::filesystem::android::{AndroidDeviceFilesystem, AndroidZippedDeviceFilesystem};
use crate::filesystem::ios::{IosDeviceFilesystem, IosZippedDeviceFilesystem};
use crate::filesystem::ios_encrypted::IosEncryptedDeviceFilesystem;
use crate::utils::*;

lazy_static! {
    static ref VALID_DEVICE_ID_REGEX: Regex = Regex::new(r"^[A-Za-z0-9_-]+$").unwrap();
}

/// Detection order matters: first match wins.
const DETECTION_ORDER: &[FilesystemKind] = &[
    FilesystemKind::Android,
    FilesystemKind::AndroidZipped,
    FilesystemKind::Ios,
    FilesystemKind::IosEncrypted,
    FilesystemKind::IosZipped,
];

pub fn identify_filesystem(path: &Path) -> Option<FilesystemKind> {
    DETECTION_ORDER.iter().copied().find(|kind| match kind {
        FilesystemKind::Android => AndroidDeviceFilesystem::is_device_filesystem(path),
        FilesystemKind::AndroidZipped => AndroidZippedDeviceFilesystem::is_device_filesystem(path),
        FilesystemKind::Ios => IosDeviceFilesystem::is_device_filesystem(path),
        FilesystemKind::IosEncrypted => IosEncryptedDeviceFilesystem::is_device_filesystem(path),
        FilesystemKind::IosZipped => IosZippedDeviceFilesystem::is_device_filesystem(path),
    })
}

fn attach_filesystem(kind: FilesystemKind, id: &str, path: &Path) -> Result<Arc<dyn DeviceFilesystem>> {
    Ok(match kind {
        FilesystemKind::Android => Arc::new(AndroidDeviceFilesystem::new(id, path)?),
        FilesystemKind::AndroidZipped => Arc::new(AndroidZippedDeviceFilesystem::new(id, path)?),
        FilesystemKind::Ios => Arc::new(IosDeviceFilesystem::new(id, path)?),
        FilesystemKind::IosEncrypted => Arc::new(IosEncryptedDeviceFilesystem::new(id, path)?),
        FilesystemKind::IosZipped => Arc::new(IosZippedDeviceFilesystem::new(id, path)?),
    })
}

pub fn is_valid_device_id(key: &str) -> bool {
    VALID_DEVICE_ID_REGEX.is_match(key)
}

pub struct FilesystemRegistry {
    base_path: PathBuf,
    passphrases: HashMap<String, String>,
    filesystems: HashMap<String, Arc<dyn DeviceFilesystem>>,
}

impl FilesystemRegistry {
    pub fn new(base_path: &Path, passphrases: HashMap<String, String>) -> Self {
        let mut registry = FilesystemRegistry {
            base_path: base_path.to_owned(),
            passphrases,
            filesystems: HashMap::new(),
        };
        registry.rescan();
        registry
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn rescan(&mut self) {
        self.filesystems = self.find_available_filesystems();
    }

    fn find_available_filesystems(&self) -> HashMap<String, Arc<dyn DeviceFilesystem>> {
        let mut filesystems: HashMap<String, Arc<dyn DeviceFilesystem>> = HashMap::new();

        let listing = match std::fs::read_dir(&self.base_path) {
            Ok(listing) => listing,
            Err(e) => {
                log::warn!("Could not find filesystem directory {:?}: {e}", self.base_path);
                return filesystems;
            }
        };

        for dir_entry in listing.flatten() {
            let path = dir_entry.path();
            let key = dir_entry.file_name().to_string_lossy().into_owned();

            let Some(kind) = identify_filesystem(&path) else { continue };
            let fs = match attach_filesystem(kind, &key, &path) {
                Ok(fs) => fs,
                Err(e) => {
                    log::warn!("Cannot attach {} filesystem at {path:?}: {e}", kind.name());
                    continue;
                }
            };

            if let Some(encrypted) = fs.as_encrypted() {
                if let Some(passphrase) = self.passphrases.get(&key) {
                    if let Err(e) = encrypted.decrypt(passphrase) {
                        log::warn!("Cannot decrypt {key} with the configured passphrase: {e}");
                    }
                }
            }

            filesystems.insert(key, fs);
        }

        filesystems
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn DeviceFilesystem>> {
        self.filesystems.get(key).cloned()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.filesystems.contains_key(key)
    }

    pub fn device_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.filesystems.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Creates an empty, locked-or-not subset filesystem of the same kind as `source`.
    pub fn create_empty_subset_of(&mut self, source: &Arc<dyn DeviceFilesystem>, key: &str,
                                  locked: bool) -> Result<Arc<dyn DeviceFilesystem>> {
        if !is_valid_device_id(key) {
            bail!("Invalid device ID: {key}");
        }

        let path = self.base_path.join(key);
        if path.exists() {
            bail!(RimeError::FileExists(key.to_owned()));
        }

        let fs: Arc<dyn DeviceFilesystem> = match source.kind() {
            FilesystemKind::Android =>
                Arc::new(AndroidDeviceFilesystem::create(key, &path, Some(source.as_ref()))?),
            FilesystemKind::Ios =>
                Arc::new(IosDeviceFilesystem::create(key, &path, Some(source.as_ref()))?),
            FilesystemKind::AndroidZipped | FilesystemKind::IosZipped =>
                bail!(RimeError::UnsupportedOperation("subsetting a zipped filesystem")),
            FilesystemKind::IosEncrypted =>
                bail!(RimeError::UnsupportedOperation("subsetting an encrypted filesystem")),
        };

        fs.lock(locked)?;
        self.filesystems.insert(key.to_owned(), Arc::clone(&fs));
        Ok(fs)
    }

    pub fn delete(&mut self, key: &str) -> EmptyRes {
        if !self.filesystems.contains_key(key) {
            bail!(RimeError::DeviceNotFound(key.to_owned()));
        }

        let path = self.base_path.join(key);
        if path.is_dir() {
            std::fs::remove_dir_all(&path)?;
        } else {
            std::fs::remove_file(&path)?;
        }
        self.filesystems.remove(key);
        Ok(())
    }
}
