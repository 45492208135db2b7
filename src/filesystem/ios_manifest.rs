//! Translation between logical iOS paths and the content-addressed backup store.
//!
//! Logical paths have the form `domain/relativePath`. `Manifest.db` maps
//! (domain, relativePath) to a `fileID`; files live at `<fileID[0:2]>/<fileID>`
//! beneath the backup root. Paths missing from the manifest hash to
//! `sha1("domain-relativePath")`, which is also how new subset files are placed.

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Mutex;

use chrono::DateTime;
use rusqlite::{Connection, OptionalExtension};
use sha1::{Digest, Sha1};

use crate::errors::RimeError;
use crate::filesystem::DirEntry;
use crate::utils::*;

/// Splits `domain/relativePath` at the first slash. The first slash is the domain
/// boundary; domains themselves can contain hyphens but never slashes.
pub fn split_domain(path: &str) -> Result<(&str, &str)> {
    path.split_once('/')
        .with_context(|| format!("iOS path {path:?} has no domain component"))
}

fn ios_hash(domain: &str, relative_path: &str) -> String {
    // The hashed string is the logical path with the first slash replaced by a
    // hyphen. We don't use that form elsewhere because domains can contain hyphens,
    // so it couldn't be split again.
    let mut hasher = Sha1::new();
    hasher.update(format!("{domain}-{relative_path}").as_bytes());
    to_hex(&hasher.finalize())
}

/// Metadata recovered from the binary plist in the `file` column of `Files`.
#[derive(Debug, Clone, Default)]
pub struct FileRecord {
    pub mode: u32,
    pub size: u64,
    pub last_modified: Option<i64>,
    pub birth: Option<i64>,
    pub protection_class: Option<u64>,
    pub encryption_key: Option<Vec<u8>>,
}

impl FileRecord {
    pub fn is_dir(&self) -> bool {
        self.mode & 0o170000 == 0o040000
    }

    /// Decodes the NSKeyedArchiver plist blob: the file metadata is the dictionary
    /// at `$objects[1]`, with the encryption key (if any) stored as a UID reference
    /// to an `NS.data` object.
    pub fn from_blob(blob: &[u8]) -> Result<FileRecord> {
        let value = plist::Value::from_reader(Cursor::new(blob))
            .context("Cannot parse manifest file blob")?;
        let objects = value.as_dictionary()
            .and_then(|dict| dict.get("$objects"))
            .and_then(|objs| objs.as_array())
            .context("Manifest file blob has no $objects")?;
        let metadata = objects.get(1)
            .and_then(|obj| obj.as_dictionary())
            .context("Manifest file blob has no metadata object")?;

        let get_int = |key: &str| metadata.get(key).and_then(|v| v.as_unsigned_integer());

        let encryption_key = metadata.get("EncryptionKey")
            .and_then(|v| match v {
                plist::Value::Uid(uid) => Some(uid.get()),
                _ => None,
            })
            .and_then(|uid| objects.get(uid as usize))
            .and_then(|obj| obj.as_dictionary())
            .and_then(|dict| dict.get("NS.data"))
            .and_then(|v| v.as_data())
            .map(|data| data.to_vec());

        Ok(FileRecord {
            mode: get_int("Mode").unwrap_or(0) as u32,
            size: get_int("Size").unwrap_or(0),
            last_modified: metadata.get("LastModified").and_then(|v| v.as_signed_integer()),
            birth: metadata.get("Birth").and_then(|v| v.as_signed_integer()),
            protection_class: get_int("ProtectionClass"),
            encryption_key,
        })
    }
}

pub struct IosManifest {
    conn: Mutex<Connection>,
    scandir_cache: Mutex<HashMap<String, Vec<DirEntry>>>,
}

impl IosManifest {
    pub fn new(conn: Connection) -> Self {
        IosManifest {
            conn: Mutex::new(conn),
            scandir_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Creates the `Files`/`Properties` schema of a fresh manifest, for subsets.
    pub fn create_schema(conn: &Connection) -> EmptyRes {
        conn.execute(
            "CREATE TABLE Files (
                fileID TEXT PRIMARY KEY,
                domain TEXT,
                relativePath TEXT,
                flags INTEGER,
                file BLOB)",
            [],
        )?;
        conn.execute("CREATE TABLE Properties (key TEXT PRIMARY KEY, value BLOB)", [])?;
        Ok(())
    }

    /// Returns the store-relative pathname (`ab/abcdef...`) of the logical `path`.
    pub fn get_hashed_pathname(&self, path: &str) -> Result<String> {
        let (domain, relative_path) = split_domain(path)?;

        // Prefer the manifest's own mapping; fall back to the derived hash. The
        // lookup can fail wholesale on a manifest with no Files table (fresh
        // subsets mid-creation), which is treated the same as no row.
        let conn = self.conn.lock().unwrap();
        let file_id: Option<String> = conn.query_row(
            "SELECT fileID FROM Files WHERE domain = ?1 AND relativePath = ?2",
            [domain, relative_path],
            |row| row.get(0),
        ).optional().unwrap_or(None);

        let file_id = file_id.unwrap_or_else(|| ios_hash(domain, relative_path));
        Ok(format!("{}/{}", &file_id[..2], file_id))
    }

    /// Adds `path` to the manifest. Adding the same path twice is fine (one entry);
    /// a hash collision with a different path fails with `FileExists`.
    pub fn add_file(&self, path: &str) -> EmptyRes {
        let (domain, relative_path) = split_domain(path)?;
        let file_id = ios_hash(domain, relative_path);

        let conn = self.conn.lock().unwrap();
        let existing: Option<(String, String)> = conn.query_row(
            "SELECT relativePath, domain FROM Files WHERE fileID = ?1",
            [&file_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        ).optional()?;

        match existing {
            None => {
                conn.execute(
                    "INSERT INTO Files (fileID, domain, relativePath, flags) VALUES (?1, ?2, ?3, 1)",
                    [file_id.as_str(), domain, relative_path],
                )?;
                Ok(())
            }
            Some((existing_path, existing_domain))
                if existing_path == relative_path && existing_domain == domain => Ok(()),
            Some(_) => Err(RimeError::FileExists(path.to_owned()).into()),
        }
    }

    /// Looks up the `Files` row for a logical path, with decoded metadata.
    pub fn file_record(&self, path: &str) -> Result<Option<FileRecord>> {
        let (domain, relative_path) = split_domain(path)?;
        let conn = self.conn.lock().unwrap();
        let blob: Option<Option<Vec<u8>>> = conn.query_row(
            "SELECT file FROM Files WHERE domain = ?1 AND relativePath = ?2",
            [domain, relative_path],
            |row| row.get(0),
        ).optional()?;
        match blob {
            Some(Some(blob)) => Ok(Some(FileRecord::from_blob(&blob)?)),
            _ => Ok(None),
        }
    }

    /// Lists the entries directly below the logical directory `path`. File stat
    /// information comes from the plist blobs in the manifest, so results are cached.
    pub fn scandir(&self, path: &str) -> Result<Vec<DirEntry>> {
        {
            let cache = self.scandir_cache.lock().unwrap();
            if let Some(entries) = cache.get(path) {
                return Ok(entries.clone());
            }
        }

        let (domain, relative_path) = split_domain(path)?;
        let prefix = format!("{relative_path}/");

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT relativePath, file FROM Files WHERE domain = ?1")?;
        let mut rows = stmt.query([domain])?;

        let mut entries = vec![];
        while let Some(row) = rows.next()? {
            let child_path: String = row.get(0)?;

            // Only direct children of this directory.
            let name = match child_path.strip_prefix(&prefix) {
                Some(name) if !name.is_empty() && !name.contains('/') => name.to_owned(),
                _ => continue,
            };

            let record = match row.get::<_, Option<Vec<u8>>>(1)? {
                Some(blob) => FileRecord::from_blob(&blob)?,
                None => FileRecord::default(),
            };

            entries.push(DirEntry {
                path: format!("{domain}/{child_path}"),
                name,
                is_dir: record.is_dir(),
                size: record.size,
                modified: record.last_modified.and_then(|ts| DateTime::from_timestamp(ts, 0)),
                created: record.birth.and_then(|ts| DateTime::from_timestamp(ts, 0)),
            });
        }
        drop(rows);
        drop(stmt);
        drop(conn);

        let mut cache = self.scandir_cache.lock().unwrap();
        cache.insert(path.to_owned(), entries.clone());
        Ok(entries)
    }
}

#[cfg(test)]
#[path = "ios_manifest_tests.rs"]
mod tests;
