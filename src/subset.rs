//! The subsetter: copies selected rows and files into a new device filesystem.
//!
//! Providers accumulate primary keys into `RowSubset`s (or request whole lookup
//! tables via `CompleteTable`); the engine then clones each table's schema from the
//! source `sqlite_master` and re-inserts only the referenced rows.

use std::collections::BTreeSet;
use std::io::Read;
use std::sync::Arc;

use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;
use rusqlite::Connection;
use rusqlite::types::{ToSql, ToSqlOutput, Value};

use crate::filesystem::DeviceFilesystem;
use crate::utils::*;

lazy_static! {
    static ref MATCH_COLLATE: Regex = Regex::new(r"(?i)COLLATE \w+").unwrap();
}

/// Custom collation sequences only affect sort order, which the copy does not rely
/// on, and the destination connection doesn't have them registered.
fn sanitise_create_table_sql(sql: &str) -> String {
    MATCH_COLLATE.replace_all(sql, "").into_owned()
}

/// A primary key value. Providers deal in both integer row ids and string ids.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum RowKey {
    Int(i64),
    Text(String),
}

impl ToSql for RowKey {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        match self {
            RowKey::Int(i) => i.to_sql(),
            RowKey::Text(s) => s.to_sql(),
        }
    }
}

impl From<i64> for RowKey {
    fn from(value: i64) -> Self {
        RowKey::Int(value)
    }
}

impl From<&str> for RowKey {
    fn from(value: &str) -> Self {
        // Numeric-looking ids compare against INTEGER columns, so keep them typed.
        match value.parse::<i64>() {
            Ok(i) => RowKey::Int(i),
            Err(_) => RowKey::Text(value.to_owned()),
        }
    }
}

impl From<String> for RowKey {
    fn from(value: String) -> Self {
        RowKey::from(value.as_str())
    }
}

pub trait TableCopy {
    fn copy(&self, src_conn: &Connection, dst_conn: &Connection) -> EmptyRes;
}

/// The set of primary keys to retain from one table.
pub struct RowSubset {
    pub table_name: String,
    pub primary_key: String,
    rows: BTreeSet<RowKey>,
}

impl RowSubset {
    pub fn add(&mut self, key: impl Into<RowKey>) {
        self.rows.insert(key.into());
    }

    pub fn update<K: Into<RowKey>>(&mut self, keys: impl IntoIterator<Item = K>) {
        self.rows.extend(keys.into_iter().map(Into::into));
    }

    pub fn rows(&self) -> &BTreeSet<RowKey> {
        &self.rows
    }
}

impl TableCopy for RowSubset {
    fn copy(&self, src_conn: &Connection, dst_conn: &Connection) -> EmptyRes {
        create_table_like(src_conn, dst_conn, &self.table_name)?;

        // IN-lists are bounded by SQLite's parameter limit, so copy in batches.
        for batch in &self.rows.iter().chunks(crate::sql::MAX_BATCH_PARAMS) {
            let batch = batch.collect_vec();
            let placeholders = (1..=batch.len()).map(|i| format!("?{i}")).join(", ");
            let select_sql = format!(
                "SELECT * FROM {} WHERE {} IN ({placeholders})",
                self.table_name, self.primary_key);
            copy_rows(src_conn, dst_conn, &self.table_name, &select_sql,
                      rusqlite::params_from_iter(batch))?;
        }
        Ok(())
    }
}

/// A small lookup table copied wholesale (e.g. `mimetypes`).
pub struct CompleteTable {
    pub table_name: String,
}

impl TableCopy for CompleteTable {
    fn copy(&self, src_conn: &Connection, dst_conn: &Connection) -> EmptyRes {
        create_table_like(src_conn, dst_conn, &self.table_name)?;
        copy_rows(src_conn, dst_conn, &self.table_name,
                  &format!("SELECT * FROM {}", self.table_name), [])?;
        Ok(())
    }
}

fn create_table_like(src_conn: &Connection, dst_conn: &Connection, table_name: &str) -> EmptyRes {
    let sql: String = src_conn.query_row(
        "SELECT sql FROM sqlite_master WHERE name = ?1",
        [table_name],
        |row| row.get(0),
    ).with_context(|| format!("Table {table_name} not found in source database"))?;

    dst_conn.execute(&sanitise_create_table_sql(&sql), [])?;
    Ok(())
}

fn copy_rows<P: rusqlite::Params>(src_conn: &Connection, dst_conn: &Connection,
                                  table_name: &str, select_sql: &str, params: P) -> EmptyRes {
    let mut stmt = src_conn.prepare(select_sql)?;
    let column_count = stmt.column_count();

    let insert_sql = format!(
        "INSERT INTO {table_name} VALUES ({})",
        (1..=column_count).map(|i| format!("?{i}")).join(", "));
    let mut insert_stmt = dst_conn.prepare(&insert_sql)?;

    let mut rows = stmt.query(params)?;
    while let Some(row) = rows.next()? {
        let values: Vec<Value> = (0..column_count)
            .map(|idx| row.get::<_, Value>(idx))
            .try_collect()?;
        insert_stmt.execute(rusqlite::params_from_iter(values))?;
    }
    Ok(())
}

/// Bound to the destination filesystem of one subset operation.
pub struct Subsetter {
    fs_dest: Arc<dyn DeviceFilesystem>,
}

impl Subsetter {
    pub fn new(fs_dest: Arc<dyn DeviceFilesystem>) -> Self {
        Subsetter { fs_dest }
    }

    pub fn row_subset(&self, table_name: &str, primary_key: &str) -> RowSubset {
        RowSubset {
            table_name: table_name.to_owned(),
            primary_key: primary_key.to_owned(),
            rows: BTreeSet::new(),
        }
    }

    pub fn complete_table(&self, table_name: &str) -> CompleteTable {
        CompleteTable { table_name: table_name.to_owned() }
    }

    /// Streams a source handle into the destination at the same logical path.
    pub fn copy_file(&self, mut handle: Box<dyn Read + Send>, dst_path: &str) -> EmptyRes {
        let mut dest = self.fs_dest.create_file(dst_path)?;
        std::io::copy(&mut handle, &mut dest)?;
        Ok(())
    }

    /// Creates the destination database and copies the given table subsets into it.
    pub fn create_db_and_copy_rows(&self, src_conn: &Connection, new_db_pathname: &str,
                                   tables: &[&dyn TableCopy]) -> EmptyRes {
        let dst_conn = self.fs_dest.sqlite3_create(new_db_pathname)?;
        for table in tables {
            table.copy(src_conn, &dst_conn)?;
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "subset_tests.rs"]
mod tests;
