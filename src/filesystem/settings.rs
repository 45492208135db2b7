//! Per-device key/value settings stored in `_rime_settings.db` at the backup root.
//!
//! Three recognised keys: `subset_fs`, `locked`, `encrypted`, stored as "0"/"1".

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension};

use crate::sql;
use crate::utils::*;

#[derive(Debug)]
pub struct DeviceSettings {
    conn: Mutex<Connection>,
}

impl DeviceSettings {
    pub fn new(dir: &Path) -> Result<Self> {
        Self::new_named(dir, super::SETTINGS_FILENAME)
    }

    pub fn new_named(dir: &Path, filename: &str) -> Result<Self> {
        Self::open_file(&dir.join(filename))
    }

    pub fn open_file(db_path: &PathBuf) -> Result<Self> {
        let conn = sql::sqlite3_connect(db_path)?;
        conn.execute("CREATE TABLE IF NOT EXISTS settings (key TEXT, value TEXT)", [])?;
        Ok(DeviceSettings { conn: Mutex::new(conn) })
    }

    fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.query_row("SELECT value FROM settings WHERE key = ?1", [key], |row| row.get(0))
            .optional()?)
    }

    fn set_setting(&self, key: &str, value: &str) -> EmptyRes {
        let conn = self.conn.lock().unwrap();
        let updated = conn.execute("UPDATE settings SET value = ?1 WHERE key = ?2", [value, key])?;
        if updated == 0 {
            conn.execute("INSERT INTO settings (key, value) VALUES (?1, ?2)", [key, value])?;
        }
        Ok(())
    }

    fn get_flag(&self, key: &str) -> bool {
        matches!(self.get_setting(key), Ok(Some(v)) if v == "1")
    }

    fn set_flag(&self, key: &str, value: bool) -> EmptyRes {
        self.set_setting(key, if value { "1" } else { "0" })
    }

    pub fn is_subset_fs(&self) -> bool {
        self.get_flag("subset_fs")
    }

    pub fn set_subset_fs(&self, is_subset_fs: bool) -> EmptyRes {
        self.set_flag("subset_fs", is_subset_fs)
    }

    pub fn is_locked(&self) -> bool {
        self.get_flag("locked")
    }

    pub fn set_locked(&self, is_locked: bool) -> EmptyRes {
        self.set_flag("locked", is_locked)
    }

    pub fn is_encrypted(&self) -> bool {
        self.get_flag("encrypted")
    }

    pub fn set_encrypted(&self, is_encrypted: bool) -> EmptyRes {
        self.set_flag("encrypted", is_encrypted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_default_to_false_and_persist() {
        let dir = tempfile::tempdir().unwrap();
        {
            let settings = DeviceSettings::new(dir.path()).unwrap();
            assert!(!settings.is_locked());
            assert!(!settings.is_subset_fs());
            assert!(!settings.is_encrypted());
            settings.set_locked(true).unwrap();
            settings.set_subset_fs(true).unwrap();
        }
        let settings = DeviceSettings::new(dir.path()).unwrap();
        assert!(settings.is_locked());
        assert!(settings.is_subset_fs());
        settings.set_locked(false).unwrap();
        assert!(!settings.is_locked());
    }
}
