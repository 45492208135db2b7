//! Encrypted iOS backups.
//!
//! Until `decrypt` succeeds, every operation needing the manifest fails with
//! `NotDecrypted`. Decryption writes a `Manifest-decrypted.db` sidecar next to the
//! encrypted manifest, then decrypts individual files on demand into `<hashed>-decrypted`
//! sidecars.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rusqlite::Connection;

use crate::errors::RimeError;
use crate::filesystem::{DeviceFilesystem, DeviceSettings, DirEntry, EncryptedDeviceFilesystem,
                        FilesystemKind};
use crate::filesystem::ios::{ios_filesystem_is_encrypted, INFO_PLIST, MANIFEST_DB};
use crate::filesystem::ios_manifest::IosManifest;
use crate::filesystem::keybag::EncryptedBackup;
use crate::sql;
use crate::utils::*;

pub const DECRYPTED_MANIFEST_FILENAME: &str = "Manifest-decrypted.db";
const DECRYPTED_SUFFIX: &str = "-decrypted";

#[derive(Default)]
struct EncryptedState {
    manifest: Option<Arc<IosManifest>>,
    backup: Option<EncryptedBackup>,
    passphrase: Option<String>,
}

pub struct IosEncryptedDeviceFilesystem {
    id: String,
    root: PathBuf,
    settings: DeviceSettings,
    state: Mutex<EncryptedState>,
}

impl IosEncryptedDeviceFilesystem {
    pub fn new(id: &str, root: &Path) -> Result<Self> {
        let settings = DeviceSettings::new(root)?;
        let mut state = EncryptedState::default();

        // A decrypted manifest sidecar from an earlier session lets us skip key
        // derivation until an actual file read needs it.
        let decrypted_manifest = root.join(DECRYPTED_MANIFEST_FILENAME);
        if decrypted_manifest.exists() {
            state.manifest = Some(Arc::new(IosManifest::new(sql::sqlite3_connect(&decrypted_manifest)?)));
            settings.set_encrypted(false)?;
        } else {
            settings.set_encrypted(true)?;
        }

        Ok(IosEncryptedDeviceFilesystem {
            id: id.to_owned(),
            root: root.to_owned(),
            settings,
            state: Mutex::new(state),
        })
    }

    pub fn is_device_filesystem(path: &Path) -> bool {
        path.join(MANIFEST_DB).exists()
            && path.join(INFO_PLIST).exists()
            && ios_filesystem_is_encrypted(path)
    }

    fn manifest(&self) -> Result<Arc<IosManifest>> {
        self.state.lock().unwrap().manifest.clone()
            .ok_or_else(|| RimeError::NotDecrypted.into())
    }

    /// Ensures a decrypted sidecar exists for `path` and returns its location.
    fn decrypted_syspath(&self, path: &str) -> Result<PathBuf> {
        let manifest = self.manifest()?;
        let hashed = manifest.get_hashed_pathname(path)?;
        let sidecar = syspath(&self.root, &format!("{hashed}{DECRYPTED_SUFFIX}"));

        if !sidecar.exists() {
            let record = manifest.file_record(path)?
                .with_context(|| format!("No manifest entry for {path}"))?;

            let mut state = self.state.lock().unwrap();
            self.ensure_backup(&mut state)?;
            state.backup.as_ref().unwrap().decrypt_file(&record, &hashed, &sidecar)?;
        }
        Ok(sidecar)
    }

    /// Opens and unlocks the keybag, using the stored passphrase.
    fn ensure_backup(&self, state: &mut EncryptedState) -> EmptyRes {
        if state.backup.as_ref().is_some_and(|b| b.is_unlocked()) {
            return Ok(());
        }
        let passphrase = state.passphrase.clone()
            .ok_or(RimeError::NoPassphrase)?;

        log::info!("Deriving keys for encrypted backup {}", self.id);
        let mut backup = EncryptedBackup::open(&self.root)?;
        backup.unlock(&passphrase)?;
        state.backup = Some(backup);
        Ok(())
    }
}

impl DeviceFilesystem for IosEncryptedDeviceFilesystem {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> FilesystemKind {
        FilesystemKind::IosEncrypted
    }

    fn is_subset_filesystem(&self) -> bool {
        self.settings.is_subset_fs()
    }

    fn scandir(&self, _path: &str) -> Result<Vec<DirEntry>> {
        // Stat metadata for encrypted backups would need the blob plists decrypted
        // per entry; providers only address known database paths here.
        Ok(vec![])
    }

    fn exists(&self, path: &str) -> bool {
        match self.manifest() {
            Ok(manifest) => manifest.get_hashed_pathname(path)
                .map(|hashed| syspath(&self.root, &hashed).exists())
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    fn getsize(&self, path: &str) -> Result<u64> {
        let manifest = self.manifest()?;
        if let Some(record) = manifest.file_record(path)? {
            return Ok(record.size);
        }
        let hashed = manifest.get_hashed_pathname(path)?;
        Ok(std::fs::metadata(syspath(&self.root, &hashed))?.len())
    }

    fn open(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(self.decrypted_syspath(path)?)?))
    }

    fn open_raw(&self, path: &str) -> Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(syspath(&self.root, path))?))
    }

    fn create_file(&self, _path: &str) -> Result<Box<dyn Write + Send>> {
        Err(RimeError::UnsupportedOperation("encrypted filesystems are read-only").into())
    }

    fn sqlite3_connect(&self, path: &str, read_only: bool) -> Result<Connection> {
        let decrypted = self.decrypted_syspath(path)?;
        log::debug!("iOS (encrypted) connecting to {decrypted:?} ({path})");
        if read_only {
            sql::sqlite3_connect_read_only(&decrypted)
        } else {
            sql::sqlite3_connect(&decrypted)
        }
    }

    fn sqlite3_create(&self, _path: &str) -> Result<Connection> {
        Err(RimeError::UnsupportedOperation("encrypted filesystems are read-only").into())
    }

    fn lock(&self, locked: bool) -> EmptyRes {
        self.settings.set_locked(locked)
    }

    fn is_locked(&self) -> bool {
        self.settings.is_locked()
    }

    fn path_to_direntry(&self, path: &str) -> Result<DirEntry> {
        let record = self.manifest()?.file_record(path)?
            .with_context(|| format!("No manifest entry for {path}"))?;
        let name = path.rsplit('/').next().unwrap_or(path).to_owned();
        Ok(DirEntry {
            name,
            path: path.to_owned(),
            is_dir: record.is_dir(),
            size: record.size,
            modified: record.last_modified.and_then(|ts| chrono::DateTime::from_timestamp(ts, 0)),
            created: record.birth.and_then(|ts| chrono::DateTime::from_timestamp(ts, 0)),
        })
    }

    fn as_encrypted(&self) -> Option<&dyn EncryptedDeviceFilesystem> {
        Some(self)
    }
}

impl EncryptedDeviceFilesystem for IosEncryptedDeviceFilesystem {
    fn is_encrypted(&self) -> bool {
        self.state.lock().unwrap().manifest.is_none()
    }

    fn decrypt(&self, passphrase: &str) -> EmptyRes {
        let mut state = self.state.lock().unwrap();
        state.passphrase = Some(passphrase.to_owned());

        let decrypted_manifest = self.root.join(DECRYPTED_MANIFEST_FILENAME);
        if !decrypted_manifest.exists() {
            self.ensure_backup(&mut state)?;
            state.backup.as_ref().unwrap().decrypt_manifest_db(&decrypted_manifest)?;
        }

        state.manifest = Some(Arc::new(IosManifest::new(sql::sqlite3_connect(&decrypted_manifest)?)));
        drop(state);

        self.settings.set_encrypted(false)?;
        Ok(())
    }
}
