//! Configuration consumed by the core. Parsing a config file into this structure is
//! the caller's concern.

use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory scanned for device backups.
    pub base_path: PathBuf,
    /// Location of the persistent session database.
    pub session_database: PathBuf,
    /// Prefix prepended to media ids when building media URLs.
    pub media_url_prefix: String,
    /// Passphrases for encrypted devices, keyed by device id.
    pub passphrases: HashMap<String, String>,
}

impl Config {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        let base_path = base_path.into();
        Config {
            session_database: base_path.join("_rime_session.db"),
            base_path,
            media_url_prefix: "/media/".to_owned(),
            passphrases: HashMap::new(),
        }
    }
}
