//! SQLite access helper.
//!
//! All database connections in RIME are opened through here so that they share the
//! REGEXP scalar function and the read-only URI convention (`mode=ro&immutable=1`,
//! so that evidence files are never touched, not even for a journal).

use std::collections::HashMap;
use std::path::Path;

use rusqlite::{Connection, OpenFlags};
use rusqlite::functions::FunctionFlags;
use regex::Regex;

use crate::utils::*;

/// Number of bound parameters per batched `IN (...)` query.
pub const MAX_BATCH_PARAMS: usize = 500;

fn add_regexp_function(conn: &Connection) -> EmptyRes {
    // Compiled patterns are cached per connection.
    let mut cache: HashMap<String, Regex> = HashMap::new();
    conn.create_scalar_function(
        "regexp",
        2,
        FunctionFlags::SQLITE_UTF8 | FunctionFlags::SQLITE_DETERMINISTIC,
        move |ctx| {
            let pattern: String = ctx.get(0)?;
            let input: String = ctx.get(1)?;
            if !cache.contains_key(&pattern) {
                let regex = Regex::new(&pattern)
                    .map_err(|e| rusqlite::Error::UserFunctionError(Box::new(e)))?;
                cache.insert(pattern.clone(), regex);
            }
            Ok(cache[&pattern].is_match(&input))
        },
    )?;
    Ok(())
}

/// Opens a read-write connection to an existing or new database file.
pub fn sqlite3_connect(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)
        .with_context(|| format!("Cannot open database {path:?}"))?;
    add_regexp_function(&conn)?;
    Ok(conn)
}

/// Opens a connection to an existing database, read-only and immutable so SQLite
/// never writes journal or WAL files next to the evidence.
pub fn sqlite3_connect_read_only(path: &Path) -> Result<Connection> {
    let uri = format!("file:{}?mode=ro&immutable=1", path_to_str(path)?);
    let conn = Connection::open_with_flags(
        uri,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    ).with_context(|| format!("Cannot open database {path:?} read-only"))?;
    add_regexp_function(&conn)?;
    Ok(conn)
}

/// Creates a new database, failing if one is already present. Parent directories are
/// created as needed.
pub fn sqlite3_create(path: &Path) -> Result<Connection> {
    if path.exists() {
        bail!(crate::errors::RimeError::FileExists(path_to_str(path)?.to_owned()));
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    sqlite3_connect(path)
}

/// RIME confines SQLite connections to the executor that opened them, which is only
/// sound when the library itself is built thread-safe. Refuse to run otherwise.
pub fn ensure_threadsafe() -> EmptyRes {
    let conn = Connection::open_in_memory()?;
    let opt: Option<String> = conn.query_row(
        "SELECT compile_options FROM pragma_compile_options WHERE compile_options LIKE 'THREADSAFE%'",
        [],
        |row| row.get(0),
    ).map(Some).or_else(|e| match e {
        rusqlite::Error::QueryReturnedNoRows => Ok(None),
        e => Err(e),
    })?;
    match opt.as_deref() {
        Some("THREADSAFE=1") | Some("THREADSAFE=2") => Ok(()),
        other => err!("RIME requires a thread-safe SQLite build, got {other:?}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regexp_function_is_available() {
        let conn = Connection::open_in_memory().unwrap();
        add_regexp_function(&conn).unwrap();
        let matched: bool = conn
            .query_row("SELECT 'hello-123' REGEXP '[a-z]+-[0-9]+'", [], |r| r.get(0))
            .unwrap();
        assert!(matched);
        let matched: bool = conn
            .query_row("SELECT 'hello' REGEXP '^[0-9]+$'", [], |r| r.get(0))
            .unwrap();
        assert!(!matched);
    }

    #[test]
    fn bundled_sqlite_is_threadsafe() {
        ensure_threadsafe().unwrap();
    }

    #[test]
    fn read_only_refuses_writes() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("test.db");
        sqlite3_connect(&db).unwrap()
            .execute("CREATE TABLE t (x INTEGER)", []).unwrap();

        let conn = sqlite3_connect_read_only(&db).unwrap();
        assert!(conn.execute("INSERT INTO t VALUES (1)", []).is_err());
    }
}
