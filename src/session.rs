//! Persistent per-device settings that live outside any one backup, currently just
//! the country code used for phone number canonicalisation.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;

use crate::sql;
use crate::utils::*;

pub const DEFAULT_COUNTRY_CODE: &str = "GB";

pub struct Session {
    conn: Mutex<Connection>,
}

impl Session {
    pub fn open(db_path: &Path) -> Result<Self> {
        let conn = sql::sqlite3_connect(db_path)?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS device_country_code (
                id TEXT PRIMARY KEY,
                country_code TEXT
            )",
            [],
        )?;
        Ok(Session { conn: Mutex::new(conn) })
    }

    pub fn get_device_country_code(&self, device_id: &str) -> String {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT country_code FROM device_country_code WHERE id = ?1",
            [device_id],
            |row| row.get(0),
        ).unwrap_or_else(|_| DEFAULT_COUNTRY_CODE.to_owned())
    }

    pub fn set_device_country_code(&self, device_id: &str, country_code: &str) -> EmptyRes {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO device_country_code (id, country_code) VALUES (?1, ?2)",
            [device_id, country_code],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn country_code_defaults_and_persists() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("session.db");
        {
            let session = Session::open(&db).unwrap();
            assert_eq!(session.get_device_country_code("phone-1"), "GB");
            session.set_device_country_code("phone-1", "US").unwrap();
            assert_eq!(session.get_device_country_code("phone-1"), "US");
        }
        let session = Session::open(&db).unwrap();
        assert_eq!(session.get_device_country_code("phone-1"), "US");
    }
}
