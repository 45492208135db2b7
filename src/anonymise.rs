//! PII anonymisation for subset devices.
//!
//! The same real input always maps to the same synthetic output within one run, so
//! cross-references survive anonymisation; distinct inputs map to distinct outputs.
//! The detection patterns are fixed design choices and may miss exotic formats.

use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::Regex;
use rusqlite::Connection;

use crate::errors::RimeError;
use crate::filesystem::DeviceFilesystem;
use crate::merge::canonicalise_phone;
use crate::provider::{AnonKind, Provider};
use crate::utils::*;

lazy_static! {
    static ref RE_PHONE: Regex = Regex::new(r"\+?[0-9 -]{8,15}").unwrap();
    static ref RE_EMAIL: Regex = Regex::new(r"[^@\s]+@[^@\s]+\.[^@\s]+").unwrap();
}

/// Pluggable name anonymiser. Name recognition itself is an external concern.
pub trait NameAnonymiser: Send {
    fn anonymise(&self, value: &str) -> String;
}

/// Stores the mapping between original and anonymised values for one run.
#[derive(Default)]
pub struct AnonMap {
    next_phone: u64,
    next_email: u64,
    phones: HashMap<String, String>,
    emails: HashMap<String, String>,
}

impl AnonMap {
    pub fn new() -> Self {
        Default::default()
    }

    /// `phone` must already be canonicalised where possible. The synthetic number
    /// keeps the length and, for international numbers, the country-code prefix, so
    /// it still looks like the original to downstream parsers.
    pub fn anonymise_phone(&mut self, phone: &str) -> String {
        if let Some(anon) = self.phones.get(phone) {
            return anon.clone();
        }

        let fill_to_length = |counter: u64, length: usize| {
            let digits = counter.to_string();
            let padding = length.saturating_sub(digits.len());
            format!("{}{digits}", "0".repeat(padding))
        };

        self.next_phone += 1;
        let anon = if let Some(rest) = phone.strip_prefix('+') {
            // Keep what is most likely the country code.
            let (cc, rest) = rest.split_at(2.min(rest.len()));
            format!("+{cc}{}", fill_to_length(self.next_phone, rest.len()))
        } else {
            fill_to_length(self.next_phone, phone.len())
        };

        self.phones.insert(phone.to_owned(), anon.clone());
        // Anonymising an already-anonymised value must be a fixed point.
        self.phones.insert(anon.clone(), anon.clone());
        anon
    }

    pub fn anonymise_email(&mut self, email: &str) -> String {
        if let Some(anon) = self.emails.get(email) {
            return anon.clone();
        }
        self.next_email += 1;
        let anon = format!("anon-{}@example.com", self.next_email);
        self.emails.insert(email.to_owned(), anon.clone());
        self.emails.insert(anon.clone(), anon.clone());
        anon
    }
}

/// Rewrites PII columns of one (already subsetted) database in place.
pub struct DbAnonymiser<'a> {
    conn: Connection,
    country_code: &'a str,
    anon_map: &'a mut AnonMap,
    name_anonymisers: &'a [Box<dyn NameAnonymiser>],
}

impl<'a> DbAnonymiser<'a> {
    pub fn new(fs: &dyn DeviceFilesystem, db_path: &str, country_code: &'a str,
               anon_map: &'a mut AnonMap,
               name_anonymisers: &'a [Box<dyn NameAnonymiser>]) -> Result<Self> {
        Ok(DbAnonymiser {
            conn: fs.sqlite3_connect(db_path, false)?,
            country_code,
            anon_map,
            name_anonymisers,
        })
    }

    pub fn anonymise_column(&mut self, table: &str, column: &str, kind: AnonKind) -> EmptyRes {
        match kind {
            AnonKind::Phone => self.anonymise_phone(table, column),
            AnonKind::Email => self.anonymise_email(table, column),
            AnonKind::Name => self.anonymise_name(table, column),
        }
    }

    fn anonymise_phone(&mut self, table: &str, column: &str) -> EmptyRes {
        let country_code = self.country_code;
        let anon_map = &mut *self.anon_map;
        Self::rewrite_column(&self.conn, table, column, |value| {
            RE_PHONE.replace_all(value, |caps: &regex::Captures<'_>| {
                let raw = caps.get(0).unwrap().as_str();
                let canonical = canonicalise_phone(raw, country_code)
                    .unwrap_or_else(|| raw.to_owned());
                anon_map.anonymise_phone(&canonical)
            }).into_owned()
        })
    }

    fn anonymise_email(&mut self, table: &str, column: &str) -> EmptyRes {
        let anon_map = &mut *self.anon_map;
        Self::rewrite_column(&self.conn, table, column, |value| {
            RE_EMAIL.replace_all(value, |caps: &regex::Captures<'_>| {
                anon_map.anonymise_email(caps.get(0).unwrap().as_str())
            }).into_owned()
        })
    }

    fn anonymise_name(&mut self, table: &str, column: &str) -> EmptyRes {
        for plugin in self.name_anonymisers {
            Self::rewrite_column(&self.conn, table, column, |value| plugin.anonymise(value))?;
        }
        Ok(())
    }

    fn rewrite_column<F>(conn: &Connection, table: &str, column: &str, mut rewrite: F) -> EmptyRes
        where F: FnMut(&str) -> String
    {
        let mut stmt = conn.prepare(&format!("SELECT rowid, {column} FROM {table}"))?;
        let mut updates: Vec<(i64, String)> = vec![];

        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let rowid: i64 = row.get(0)?;
            // Only text cells carry PII of the kinds we rewrite.
            if let Some(value) = row.get::<_, Option<String>>(1)? {
                let new_value = rewrite(&value);
                if new_value != value {
                    updates.push((rowid, new_value));
                }
            }
        }
        drop(rows);
        drop(stmt);

        for (rowid, new_value) in updates {
            conn.execute(
                &format!("UPDATE {table} SET {column} = ?1 WHERE rowid = ?2"),
                rusqlite::params![new_value, rowid],
            )?;
        }
        Ok(())
    }
}

/// Applies every provider's PII descriptor over a subset device, sharing one
/// `AnonMap` so substitutions agree across tables and providers.
pub struct Anonymiser<'p> {
    anon_map: AnonMap,
    name_anonymisers: &'p [Box<dyn NameAnonymiser>],
}

impl<'p> Anonymiser<'p> {
    pub fn new(name_anonymisers: &'p [Box<dyn NameAnonymiser>]) -> Self {
        Anonymiser { anon_map: AnonMap::new(), name_anonymisers }
    }

    pub fn anonymise_device_provider(&mut self, fs: &dyn DeviceFilesystem, country_code: &str,
                                     provider: &dyn Provider) -> EmptyRes {
        let pii_fields = provider.pii_fields();
        pii_fields.validate(provider.name())?;

        for db in &pii_fields.sqlite3 {
            // Databases a provider declares but the subset didn't materialise are
            // fine; nothing was copied, so there is nothing to anonymise.
            if !fs.exists(db.db_path) {
                continue;
            }

            let mut db_anonymiser = DbAnonymiser::new(
                fs, db.db_path, country_code, &mut self.anon_map, self.name_anonymisers)?;
            for table in &db.tables {
                for (column, kinds) in &table.columns {
                    for kind in kinds.iter() {
                        db_anonymiser.anonymise_column(table.table, column, *kind)
                            .map_err(|e| RimeError::AnonymisationFailed(format!(
                                "{} {}.{column}: {e}", provider.name(), table.table)))?;
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[path = "anonymise_tests.rs"]
mod tests;
