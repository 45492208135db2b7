//! Android SMS/MMS, from the telephony provider's `mmssms.db`.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::contact::{Contact, Name};
use crate::event::{Event, EventData, MediaData, MessageEvent, MessageSession, SessionData};
use crate::filesystem::DeviceFilesystem;
use crate::filter::{ContactsFilter, EventsFilter};
use crate::provider::{self, DeviceContext, LazyContacts, LazyContactSource, PiiDatabase,
                      PiiFields, PiiTable, Provider};
use crate::providers::names::{ANDROID_TELEPHONY, ANDROID_TELEPHONY_FRIENDLY};
use crate::subset::{Subsetter, TableCopy};
use crate::utils::*;

pub const MMSSMS_DB: &str = "data/data/com.android.providers.telephony/databases/mmssms.db";

#[allow(dead_code)]
const TYPE_TO_ME: i64 = 1;
const TYPE_FROM_ME: i64 = 2;

pub struct AndroidTelephony {
    fs: Arc<dyn DeviceFilesystem>,
    db: Connection,
    contacts: LazyContacts,
    sessions: RefCell<HashMap<i64, MessageSession>>,
}

impl AndroidTelephony {
    pub fn from_filesystem(fs: &Arc<dyn DeviceFilesystem>) -> Result<Option<Self>> {
        if !fs.exists(MMSSMS_DB) {
            return Ok(None);
        }
        Ok(Some(AndroidTelephony {
            fs: Arc::clone(fs),
            db: fs.sqlite3_connect(MMSSMS_DB, true)?,
            contacts: LazyContacts::new(),
            sessions: RefCell::new(HashMap::new()),
        }))
    }

    // Milliseconds since the Unix epoch.
    fn timestamp_to_datetime(timestamp: i64) -> Result<DateTime<Utc>> {
        DateTime::from_timestamp_millis(timestamp)
            .with_context(|| format!("Timestamp {timestamp} out of range"))
    }

    fn find_session(&self, thread_id: i64, sender_address_id: Option<i64>) -> Result<MessageSession> {
        let mut sessions = self.sessions.borrow_mut();
        if let Some(session) = sessions.get(&thread_id) {
            return Ok(session.clone());
        }

        // TODO: group MMS threads have more than one recipient.
        let participants = match sender_address_id {
            Some(address_id) => self.contacts.get(self, &address_id.to_string())?
                .into_iter().collect(),
            None => vec![],
        };
        let session = MessageSession {
            local_id: thread_id.to_string(),
            provider_name: ANDROID_TELEPHONY.to_owned(),
            name: None,
            participants,
            provider_data: SessionData::None,
            global_id: None,
        };
        sessions.insert(thread_id, session.clone());
        Ok(session)
    }
}

impl LazyContactSource for AndroidTelephony {
    fn contacts_load_all(&self) -> Result<Vec<Contact>> {
        // There is no real contact table; canonical_addresses is the closest thing.
        let mut stmt = self.db.prepare("SELECT _id, address FROM canonical_addresses")?;
        let mut rows = stmt.query([])?;
        let mut contacts = vec![];
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let address: String = row.get(1)?;
            let mut contact = Contact::new(id.to_string(), self.fs.id(), ANDROID_TELEPHONY);
            contact.provider_friendly_name = Some(ANDROID_TELEPHONY_FRIENDLY.to_owned());
            contact.name = Name::display(&address);
            contact.phone = Some(address);
            contacts.push(contact);
        }
        Ok(contacts)
    }

    fn contact_unknown(&self, _local_id: &str) -> Option<Contact> {
        None
    }
}

impl Provider for AndroidTelephony {
    fn name(&self) -> &'static str {
        ANDROID_TELEPHONY
    }

    fn friendly_name(&self) -> &'static str {
        ANDROID_TELEPHONY_FRIENDLY
    }

    fn search_events(&self, _device: &DeviceContext, filter: &EventsFilter) -> Result<Vec<Event>> {
        if !filter.accepts_type("MessageEvent") {
            return Ok(vec![]);
        }

        let mut stmt = self.db.prepare(
            "SELECT sms._id AS sms_id, canonical_addresses._id AS address_id,
                    sms.thread_id AS thread_id, sms.type AS type, sms.date AS date,
                    sms.body AS body
             FROM sms
             LEFT JOIN threads ON sms.thread_id = threads._id
             LEFT JOIN canonical_addresses ON threads.recipient_ids = canonical_addresses._id")?;
        let mut rows = stmt.query([])?;

        let mut events = vec![];
        while let Some(row) = rows.next()? {
            let sms_id: i64 = row.get("sms_id")?;
            let thread_id: i64 = row.get("thread_id")?;
            let address_id: Option<i64> = row.get("address_id")?;

            let session = self.find_session(thread_id, address_id)?;
            let sender = match address_id {
                Some(address_id) => self.contacts.get(self, &address_id.to_string())?,
                None => None,
            };

            events.push(Event::Message(MessageEvent {
                local_id: sms_id.to_string(),
                session_id: session.local_id.clone(),
                session: Some(session),
                from_me: row.get::<_, i64>("type")? == TYPE_FROM_ME,
                timestamp: Self::timestamp_to_datetime(row.get("date")?)?,
                provider_name: ANDROID_TELEPHONY.to_owned(),
                device_id: None,
                text: row.get("body")?,
                sender,
                media: None,
                provider_data: EventData::Telephony {
                    thread_row_id: thread_id,
                    address_row_id: address_id,
                },
            }));
        }

        Ok(events)
    }

    fn search_contacts(&self, filter: &ContactsFilter) -> Result<Vec<Contact>> {
        Ok(self.contacts.values(self)?.into_iter().filter(|c| filter.matches(c)).collect())
    }

    fn get_media(&self, local_id: &str) -> Result<MediaData> {
        err!("Telephony provider has no media (requested {local_id})")
    }

    fn subset(&self, subsetter: &Subsetter, events: &[Event], contacts: &[Contact]) -> EmptyRes {
        let mut rows_sms = subsetter.row_subset("sms", "_id");
        let mut rows_threads = subsetter.row_subset("threads", "_id");
        let mut rows_address = subsetter.row_subset("canonical_addresses", "_id");

        rows_address.update(contacts.iter()
            .filter(|c| c.provider_name == ANDROID_TELEPHONY)
            .map(|c| c.local_id.as_str()));

        for event in events {
            let Event::Message(message) = event else { continue };
            let EventData::Telephony { thread_row_id, address_row_id } = message.provider_data
                else { continue };

            rows_sms.add(message.local_id.as_str());
            rows_threads.add(thread_row_id);
            if let Some(address_row_id) = address_row_id {
                rows_address.add(address_row_id);
            }
        }

        subsetter.create_db_and_copy_rows(&self.db, MMSSMS_DB, &[
            &rows_sms as &dyn TableCopy,
            &rows_threads,
            &rows_address,
        ])
    }

    fn pii_fields(&self) -> PiiFields {
        PiiFields {
            sqlite3: vec![PiiDatabase {
                db_path: MMSSMS_DB,
                tables: vec![
                    PiiTable {
                        table: "sms",
                        columns: vec![
                            ("address", provider::PHONE),
                            ("service_center", provider::PHONE),
                            ("body", provider::PHONE_NAME),
                        ],
                    },
                    PiiTable {
                        table: "canonical_addresses",
                        columns: vec![("address", provider::PHONE)],
                    },
                    PiiTable {
                        table: "threads",
                        columns: vec![("snippet", provider::PHONE_NAME)],
                    },
                ],
            }],
        }
    }
}

#[cfg(test)]
#[path = "android_telephony_tests.rs"]
mod tests;
