//! The Android contacts provider (`contacts2.db`).
//!
//! raw_contacts stores one row per account, linked to the contacts table which has
//! one row per actual person. The data lives in the data table, typed by a MIME id
//! from the mimetypes lookup table. To find contacts we join all three and keep the
//! rows whose MIME types we understand.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use rusqlite::Connection;

use crate::contact::{Contact, ContactData};
use crate::event::{Event, MediaData};
use crate::filesystem::DeviceFilesystem;
use crate::filter::{ContactsFilter, EventsFilter};
use crate::provider::{self, DeviceContext, PiiDatabase, PiiFields, PiiTable, Provider};
use crate::providers::names::{ANDROID_CONTACTS, ANDROID_CONTACTS_FRIENDLY};
use crate::subset::{Subsetter, TableCopy};
use crate::utils::*;

pub const DB_PATH: &str = "data/data/com.android.providers.contacts/databases/contacts2.db";

const MIMETYPE_NAME: &str = "vnd.android.cursor.item/name";
const MIMETYPE_PHONE: &str = "vnd.android.cursor.item/phone_v2";
const MIMETYPE_EMAIL: &str = "vnd.android.cursor.item/email_v2";

pub struct AndroidContacts {
    fs: Arc<dyn DeviceFilesystem>,
    conn: Connection,
    mime_types: RefCell<Option<HashMap<i64, String>>>,
}

impl AndroidContacts {
    pub fn from_filesystem(fs: &Arc<dyn DeviceFilesystem>) -> Result<Option<Self>> {
        if !fs.exists(DB_PATH) {
            return Ok(None);
        }
        Ok(Some(AndroidContacts {
            fs: Arc::clone(fs),
            conn: fs.sqlite3_connect(DB_PATH, true)?,
            mime_types: RefCell::new(None),
        }))
    }

    fn mime_types(&self) -> Result<HashMap<i64, String>> {
        if self.mime_types.borrow().is_none() {
            let mut stmt = self.conn.prepare(
                "SELECT _id, mimetype FROM mimetypes WHERE mimetype IN (?1, ?2, ?3)")?;
            let mut rows = stmt.query([MIMETYPE_NAME, MIMETYPE_PHONE, MIMETYPE_EMAIL])?;
            let mut map = HashMap::new();
            while let Some(row) = rows.next()? {
                map.insert(row.get::<_, i64>(0)?, row.get::<_, String>(1)?);
            }
            drop(rows);
            drop(stmt);
            *self.mime_types.borrow_mut() = Some(map);
        }
        Ok(self.mime_types.borrow().as_ref().unwrap().clone())
    }
}

impl Provider for AndroidContacts {
    fn name(&self) -> &'static str {
        ANDROID_CONTACTS
    }

    fn friendly_name(&self) -> &'static str {
        ANDROID_CONTACTS_FRIENDLY
    }

    fn search_events(&self, _device: &DeviceContext, _filter: &EventsFilter) -> Result<Vec<Event>> {
        Ok(vec![])
    }

    fn search_contacts(&self, filter: &ContactsFilter) -> Result<Vec<Contact>> {
        let mime_types = self.mime_types()?;
        if mime_types.is_empty() {
            return Ok(vec![]);
        }

        let id_list = mime_types.keys().map(|id| id.to_string()).collect::<Vec<_>>().join(", ");
        let mut stmt = self.conn.prepare(&format!(
            "SELECT contacts._id AS _id, contacts.name_raw_contact_id AS name_raw_contact_id,
                    data.mimetype_id AS mimetype_id, data.data1 AS data1
             FROM contacts
             JOIN raw_contacts ON contacts.name_raw_contact_id = raw_contacts._id
             JOIN data ON raw_contacts._id = data.raw_contact_id
             WHERE data.mimetype_id IN ({id_list})"))?;
        let mut rows = stmt.query([])?;

        let mut contacts: HashMap<i64, Contact> = HashMap::new();
        let mut order: Vec<i64> = vec![];

        while let Some(row) = rows.next()? {
            let contact_id: i64 = row.get("_id")?;
            let raw_contact_id: i64 = row.get("name_raw_contact_id")?;
            let mimetype_id: i64 = row.get("mimetype_id")?;
            let data: Option<String> = row.get("data1")?;

            let contact = contacts.entry(contact_id).or_insert_with(|| {
                order.push(contact_id);
                let mut contact = Contact::new(contact_id.to_string(), self.fs.id(), ANDROID_CONTACTS);
                contact.provider_friendly_name = Some(ANDROID_CONTACTS_FRIENDLY.to_owned());
                contact.provider_data = ContactData::AndroidContact {
                    contact_row_id: contact_id,
                    raw_contact_row_ids: BTreeSet::new(),
                };
                contact
            });
            if let ContactData::AndroidContact { raw_contact_row_ids, .. } = &mut contact.provider_data {
                raw_contact_row_ids.insert(raw_contact_id);
            }

            match mime_types.get(&mimetype_id).map(String::as_str) {
                Some(MIMETYPE_NAME) => contact.name.display = data,
                Some(MIMETYPE_PHONE) => contact.phone = data,
                Some(MIMETYPE_EMAIL) => contact.email = data,
                _ => {}
            }
        }

        Ok(order.into_iter()
            .map(|id| contacts.remove(&id).unwrap())
            .filter(|c| filter.matches(c))
            .collect())
    }

    fn get_media(&self, local_id: &str) -> Result<MediaData> {
        err!("Contacts provider has no media (requested {local_id})")
    }

    fn subset(&self, subsetter: &Subsetter, _events: &[Event], contacts: &[Contact]) -> EmptyRes {
        let mut rows_contacts = subsetter.row_subset("contacts", "_id");
        let mut rows_raw_contacts = subsetter.row_subset("raw_contacts", "_id");
        let mut rows_data = subsetter.row_subset("data", "raw_contact_id");
        let mimetypes = subsetter.complete_table("mimetypes");

        for contact in contacts {
            if contact.provider_name != ANDROID_CONTACTS {
                continue;
            }
            rows_contacts.add(contact.local_id.as_str());
            if let ContactData::AndroidContact { raw_contact_row_ids, .. } = &contact.provider_data {
                rows_raw_contacts.update(raw_contact_row_ids.iter().copied());
                rows_data.update(raw_contact_row_ids.iter().copied());
            }
        }

        subsetter.create_db_and_copy_rows(&self.conn, DB_PATH, &[
            &rows_contacts as &dyn TableCopy,
            &rows_raw_contacts,
            &rows_data,
            &mimetypes,
        ])
    }

    fn pii_fields(&self) -> PiiFields {
        PiiFields {
            sqlite3: vec![PiiDatabase {
                db_path: DB_PATH,
                tables: vec![
                    PiiTable {
                        table: "contacts",
                        columns: vec![("default_number", provider::PHONE)],
                    },
                    PiiTable {
                        table: "raw_contacts",
                        columns: vec![("sync1", provider::PHONE)],
                    },
                    PiiTable {
                        table: "data",
                        columns: vec![
                            ("data1", provider::PHONE_EMAIL_NAME),
                            ("data2", provider::PHONE_EMAIL_NAME),
                            ("data3", provider::PHONE_EMAIL_NAME),
                            ("data4", provider::PHONE_EMAIL_NAME),
                        ],
                    },
                ],
            }],
        }
    }
}

#[cfg(test)]
#[path = "android_contacts_tests.rs"]
mod tests;
