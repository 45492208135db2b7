//! The iOS address book (`AddressBook.sqlitedb`).

use std::sync::Arc;

use rusqlite::Connection;

use crate::contact::{Contact, Name};
use crate::event::{Event, MediaData};
use crate::filesystem::DeviceFilesystem;
use crate::filter::{ContactsFilter, EventsFilter};
use crate::provider::{self, DeviceContext, PiiDatabase, PiiFields, PiiTable, Provider};
use crate::providers::names::{IOS_CONTACTS, IOS_CONTACTS_FRIENDLY};
use crate::subset::{Subsetter, TableCopy};
use crate::utils::*;

pub const DB_PATH: &str = "HomeDomain/Library/AddressBook/AddressBook.sqlitedb";

// ABMultiValue.property discriminators.
const PROPERTY_PHONE: i64 = 3;
const PROPERTY_EMAIL: i64 = 4;

pub struct IosContacts {
    fs: Arc<dyn DeviceFilesystem>,
    conn: Connection,
}

impl IosContacts {
    pub fn from_filesystem(fs: &Arc<dyn DeviceFilesystem>) -> Result<Option<Self>> {
        if !fs.exists(DB_PATH) {
            return Ok(None);
        }
        Ok(Some(IosContacts {
            fs: Arc::clone(fs),
            conn: fs.sqlite3_connect(DB_PATH, true)?,
        }))
    }
}

impl Provider for IosContacts {
    fn name(&self) -> &'static str {
        IOS_CONTACTS
    }

    fn friendly_name(&self) -> &'static str {
        IOS_CONTACTS_FRIENDLY
    }

    fn search_events(&self, _device: &DeviceContext, _filter: &EventsFilter) -> Result<Vec<Event>> {
        Ok(vec![])
    }

    fn search_contacts(&self, filter: &ContactsFilter) -> Result<Vec<Contact>> {
        // Several rows per person, ordered by ROWID so one person's values arrive
        // together: property 3 rows are phones, 4 are emails, some are neither.
        let mut stmt = self.conn.prepare(
            "SELECT ABPerson.ROWID AS rowid, ABPerson.First AS first, ABPerson.Last AS last,
                    ABMultiValue.property AS property, ABMultiValue.value AS value
             FROM ABPerson
             LEFT JOIN ABMultiValue ON ABPerson.ROWID = ABMultiValue.record_id
             ORDER BY ABPerson.ROWID")?;
        let mut rows = stmt.query([])?;

        let mut contacts = vec![];
        let mut current: Option<Contact> = None;

        while let Some(row) = rows.next()? {
            let rowid: i64 = row.get("rowid")?;
            let local_id = rowid.to_string();

            if current.as_ref().is_some_and(|c| c.local_id != local_id) {
                contacts.push(current.take().unwrap());
            }

            let contact = current.get_or_insert_with(|| {
                let mut contact = Contact::new(local_id, self.fs.id(), IOS_CONTACTS);
                contact.provider_friendly_name = Some(IOS_CONTACTS_FRIENDLY.to_owned());
                contact.name = Name {
                    first: row.get("first").unwrap_or(None),
                    last: row.get("last").unwrap_or(None),
                    display: None,
                };
                contact
            });

            match row.get::<_, Option<i64>>("property")? {
                Some(PROPERTY_PHONE) => contact.phone = row.get("value")?,
                Some(PROPERTY_EMAIL) => contact.email = row.get("value")?,
                _ => {}
            }
        }

        // Emit the trailing contact once the rows run out.
        if let Some(contact) = current.take() {
            contacts.push(contact);
        }

        Ok(contacts.into_iter().filter(|c| filter.matches(c)).collect())
    }

    fn get_media(&self, local_id: &str) -> Result<MediaData> {
        err!("Contacts provider has no media (requested {local_id})")
    }

    fn subset(&self, subsetter: &Subsetter, _events: &[Event], contacts: &[Contact]) -> EmptyRes {
        let mut rows_abperson = subsetter.row_subset("ABPerson", "ROWID");
        let mut rows_abmultivalue = subsetter.row_subset("ABMultiValue", "record_id");

        for contact in contacts {
            if contact.provider_name != IOS_CONTACTS {
                continue;
            }
            rows_abperson.add(contact.local_id.as_str());
            rows_abmultivalue.add(contact.local_id.as_str());
        }

        subsetter.create_db_and_copy_rows(&self.conn, DB_PATH, &[
            &rows_abperson as &dyn TableCopy,
            &rows_abmultivalue,
        ])
    }

    fn pii_fields(&self) -> PiiFields {
        PiiFields {
            sqlite3: vec![PiiDatabase {
                db_path: DB_PATH,
                tables: vec![
                    PiiTable {
                        table: "ABPerson",
                        columns: vec![
                            ("First", provider::NAME),
                            ("Last", provider::NAME),
                        ],
                    },
                    PiiTable {
                        table: "ABMultiValue",
                        columns: vec![("value", provider::PHONE_EMAIL_NAME)],
                    },
                ],
            }],
        }
    }
}

#[cfg(test)]
#[path = "ios_contacts_tests.rs"]
mod tests;
