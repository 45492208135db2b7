//! Key derivation and content decryption for encrypted iOS backups.
//!
//! `Manifest.plist` carries a `BackupKeyBag` (a TLV blob of per-protection-class
//! wrapped keys) and a `ManifestKey`. Unlocking runs the two-stage passphrase
//! derivation (PBKDF2-SHA256 over DPSL/DPIC, then PBKDF2-SHA1 over SALT/ITER) and
//! AES-unwraps every passphrase-protected class key. File content is AES-256-CBC
//! with a zero IV, keyed per file by unwrapping its `EncryptionKey` with the class
//! key for its protection class.

use std::collections::HashMap;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use aes::Aes256;
use aes_kw::KekAes256;
use cbc::cipher::{BlockDecryptMut, KeyIvInit};
use cbc::cipher::block_padding::NoPadding;
use pbkdf2::pbkdf2_hmac;
use sha1::Sha1;
use sha2::Sha256;

use crate::errors::RimeError;
use crate::filesystem::ios_manifest::FileRecord;
use crate::utils::*;

type Aes256CbcDec = cbc::Decryptor<Aes256>;

const WRAP_PASSPHRASE: u32 = 2;

#[derive(Debug, Default)]
struct ClassKey {
    class: u32,
    wrap: u32,
    wrapped_key: Vec<u8>,
    key: Option<[u8; 32]>,
}

#[derive(Debug, Default)]
pub struct Keybag {
    salt: Vec<u8>,
    iterations: u32,
    dp_salt: Vec<u8>,
    dp_iterations: u32,
    class_keys: HashMap<u32, ClassKey>,
    unlocked: bool,
}

fn be_u32(data: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&data[..4]);
    u32::from_be_bytes(buf)
}

impl Keybag {
    /// Parses the TLV blob: 4-byte tag, 4-byte big-endian length, payload. The first
    /// UUID block introduces the bag itself; each further UUID starts a class key.
    pub fn parse(data: &[u8]) -> Result<Keybag> {
        let mut keybag = Keybag::default();
        let mut current: Option<ClassKey> = None;
        let mut seen_bag_uuid = false;

        let mut pos = 0;
        while pos + 8 <= data.len() {
            let tag = &data[pos..pos + 4];
            let length = be_u32(&data[pos + 4..pos + 8]) as usize;
            pos += 8;
            ensure!(pos + length <= data.len(), "Truncated keybag block");
            let value = &data[pos..pos + length];
            pos += length;

            match tag {
                b"UUID" if !seen_bag_uuid => seen_bag_uuid = true,
                b"UUID" => {
                    if let Some(ck) = current.take() {
                        keybag.class_keys.insert(ck.class, ck);
                    }
                    current = Some(ClassKey::default());
                }
                b"SALT" => keybag.salt = value.to_vec(),
                b"ITER" => keybag.iterations = be_u32(value),
                b"DPSL" => keybag.dp_salt = value.to_vec(),
                b"DPIC" => keybag.dp_iterations = be_u32(value),
                b"CLAS" => {
                    if let Some(ck) = current.as_mut() {
                        ck.class = be_u32(value);
                    }
                }
                b"WRAP" => {
                    if let Some(ck) = current.as_mut() {
                        ck.wrap = be_u32(value);
                    }
                }
                b"WPKY" => {
                    if let Some(ck) = current.as_mut() {
                        ck.wrapped_key = value.to_vec();
                    }
                }
                _ => {}
            }
        }
        if let Some(ck) = current.take() {
            keybag.class_keys.insert(ck.class, ck);
        }

        ensure!(!keybag.salt.is_empty() && keybag.iterations > 0, "Keybag has no KDF parameters");
        Ok(keybag)
    }

    fn derive_passphrase_key(&self, passphrase: &str) -> [u8; 32] {
        // iOS 10.2+ double derivation.
        let mut intermediate = [0u8; 32];
        if !self.dp_salt.is_empty() && self.dp_iterations > 0 {
            pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), &self.dp_salt, self.dp_iterations,
                                  &mut intermediate);
        } else {
            intermediate[..passphrase.len().min(32)]
                .copy_from_slice(&passphrase.as_bytes()[..passphrase.len().min(32)]);
        }

        let mut key = [0u8; 32];
        pbkdf2_hmac::<Sha1>(&intermediate, &self.salt, self.iterations, &mut key);
        key
    }

    /// Unwraps all passphrase-protected class keys. A wrong passphrase makes the
    /// AES unwrap integrity check fail, which is reported as `WrongPassphrase`.
    pub fn unlock(&mut self, passphrase: &str) -> EmptyRes {
        let kek = KekAes256::from(self.derive_passphrase_key(passphrase));

        for class_key in self.class_keys.values_mut() {
            if class_key.wrap & WRAP_PASSPHRASE == 0 || class_key.wrapped_key.len() != 40 {
                continue;
            }
            let mut unwrapped = [0u8; 32];
            kek.unwrap(&class_key.wrapped_key, &mut unwrapped)
                .map_err(|_| RimeError::WrongPassphrase)?;
            class_key.key = Some(unwrapped);
        }

        ensure!(self.class_keys.values().any(|ck| ck.key.is_some()),
            RimeError::WrongPassphrase);
        self.unlocked = true;
        Ok(())
    }

    pub fn is_unlocked(&self) -> bool {
        self.unlocked
    }

    /// Unwraps a per-file (or manifest) key with the class key of its class.
    pub fn unwrap_key_for_class(&self, class: u32, wrapped: &[u8]) -> Result<[u8; 32]> {
        let class_key = self.class_keys.get(&class)
            .with_context(|| format!("No class key for protection class {class}"))?;
        let key = class_key.key
            .with_context(|| format!("Class key {class} is still wrapped"))?;

        let mut unwrapped = [0u8; 32];
        KekAes256::from(key).unwrap(wrapped, &mut unwrapped)
            .map_err(|e| anyhow!("Cannot unwrap key for class {class}: {e}"))?;
        Ok(unwrapped)
    }
}

pub fn aes256_cbc_decrypt(key: &[u8; 32], data: &mut [u8]) -> EmptyRes {
    ensure!(data.len() % 16 == 0, "Ciphertext length is not a multiple of the block size");
    let decryptor = Aes256CbcDec::new(key.into(), &[0u8; 16].into());
    decryptor.decrypt_padded_mut::<NoPadding>(data)
        .map_err(|e| anyhow!("AES-CBC decryption failed: {e}"))?;
    Ok(())
}

/// An encrypted backup directory with its keybag.
pub struct EncryptedBackup {
    root: PathBuf,
    keybag: Keybag,
    manifest_class: u32,
    manifest_wrapped_key: Vec<u8>,
}

impl EncryptedBackup {
    pub fn open(root: &Path) -> Result<Self> {
        let manifest_plist = plist::Value::from_file(root.join(super::ios::MANIFEST_PLIST))
            .context("Cannot parse Manifest.plist")?;
        let dict = manifest_plist.as_dictionary()
            .context("Manifest.plist is not a dictionary")?;

        let keybag_data = dict.get("BackupKeyBag")
            .and_then(|v| v.as_data())
            .context("Manifest.plist has no BackupKeyBag")?;
        let keybag = Keybag::parse(keybag_data)?;

        // ManifestKey is a 4-byte little-endian protection class followed by the
        // wrapped manifest database key.
        let manifest_key = dict.get("ManifestKey")
            .and_then(|v| v.as_data())
            .context("Manifest.plist has no ManifestKey")?;
        ensure!(manifest_key.len() > 4, "Malformed ManifestKey");
        let manifest_class = u32::from_le_bytes(manifest_key[..4].try_into()?);

        Ok(EncryptedBackup {
            root: root.to_owned(),
            keybag,
            manifest_class,
            manifest_wrapped_key: manifest_key[4..].to_vec(),
        })
    }

    pub fn unlock(&mut self, passphrase: &str) -> EmptyRes {
        self.keybag.unlock(passphrase)
    }

    pub fn is_unlocked(&self) -> bool {
        self.keybag.is_unlocked()
    }

    /// Decrypts `Manifest.db` to `out`.
    pub fn decrypt_manifest_db(&self, out: &Path) -> EmptyRes {
        let key = self.keybag.unwrap_key_for_class(self.manifest_class, &self.manifest_wrapped_key)?;
        let mut data = std::fs::read(self.root.join(super::ios::MANIFEST_DB))?;
        aes256_cbc_decrypt(&key, &mut data)?;
        File::create(out)?.write_all(&data)?;
        Ok(())
    }

    /// Decrypts the file stored at `hashed` (store-relative) to `out`, truncating to
    /// the real size recorded in its manifest entry.
    pub fn decrypt_file(&self, record: &FileRecord, hashed: &str, out: &Path) -> EmptyRes {
        let class = record.protection_class
            .with_context(|| format!("File {hashed} has no protection class"))?;
        let encryption_key = record.encryption_key.as_ref()
            .with_context(|| format!("File {hashed} has no encryption key"))?;
        ensure!(encryption_key.len() > 4, "Malformed file encryption key");

        // As with ManifestKey, the first four bytes repeat the protection class.
        let key = self.keybag.unwrap_key_for_class(class as u32, &encryption_key[4..])?;

        let mut data = std::fs::read(syspath(&self.root, hashed))?;
        aes256_cbc_decrypt(&key, &mut data)?;
        data.truncate(record.size as usize);
        File::create(out)?.write_all(&data)?;
        Ok(())
    }
}

#[cfg(test)]
#[path = "keybag_tests.rs"]
mod tests;
