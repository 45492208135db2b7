//! Apple Messages, from `HomeDomain/Library/SMS/sms.db`.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use crate::contact::{Contact, ContactData, Name};
use crate::event::{Event, EventData, MediaData, MessageEvent, MessageSession, SessionData};
use crate::filesystem::DeviceFilesystem;
use crate::filter::{ContactsFilter, EventsFilter};
use crate::provider::{self, DeviceContext, LazyContacts, LazyContactSource, PiiDatabase,
                      PiiFields, PiiTable, Provider};
use crate::providers::names::{IOS_IMESSAGE, IOS_IMESSAGE_FRIENDLY};
use crate::subset::{Subsetter, TableCopy};
use crate::utils::*;

pub const MESSAGE_DB: &str = "HomeDomain/Library/SMS/sms.db";

// Timestamps are nanoseconds since 2001-01-01 (UTC).
const EPOCH_2001: i64 = 978307200;

fn timestamp_to_datetime(timestamp: i64) -> Result<DateTime<Utc>> {
    let secs = EPOCH_2001 + timestamp.div_euclid(1_000_000_000);
    let nanos = timestamp.rem_euclid(1_000_000_000) as u32;
    DateTime::from_timestamp(secs, nanos)
        .with_context(|| format!("Timestamp {timestamp} out of range"))
}

fn datetime_to_timestamp(dt: &DateTime<Utc>) -> i64 {
    (dt.timestamp() - EPOCH_2001) * 1_000_000_000 + dt.timestamp_subsec_nanos() as i64
}

pub struct Imessage {
    fs: Arc<dyn DeviceFilesystem>,
    conn: Connection,
    contacts: LazyContacts,
}

impl Imessage {
    pub fn from_filesystem(fs: &Arc<dyn DeviceFilesystem>) -> Result<Option<Self>> {
        if !fs.exists(MESSAGE_DB) {
            return Ok(None);
        }
        Ok(Some(Imessage {
            fs: Arc::clone(fs),
            conn: fs.sqlite3_connect(MESSAGE_DB, true)?,
            contacts: LazyContacts::new(),
        }))
    }

    fn create_session(&self, chat_id: i64) -> Result<MessageSession> {
        let mut stmt = self.conn.prepare(
            "SELECT handle.ROWID FROM handle
             JOIN chat_handle_join ON chat_handle_join.handle_id = handle.ROWID
             JOIN chat ON chat.ROWID = chat_handle_join.chat_id
             WHERE chat.ROWID = ?1")?;
        let mut rows = stmt.query([chat_id])?;

        let mut participants = vec![];
        while let Some(row) = rows.next()? {
            let handle_id: i64 = row.get(0)?;
            if let Some(contact) = self.contacts.get(self, &handle_id.to_string())? {
                participants.push(contact);
            }
        }

        Ok(MessageSession {
            local_id: chat_id.to_string(),
            provider_name: IOS_IMESSAGE.to_owned(),
            name: None,
            participants,
            provider_data: SessionData::None,
            global_id: None,
        })
    }
}

impl LazyContactSource for Imessage {
    fn contacts_load_all(&self) -> Result<Vec<Contact>> {
        let mut stmt = self.conn.prepare("SELECT ROWID, id FROM handle")?;
        let mut rows = stmt.query([])?;
        let mut contacts = vec![];
        while let Some(row) = rows.next()? {
            let rowid: i64 = row.get(0)?;
            let id: String = row.get(1)?;
            let mut contact = Contact::new(rowid.to_string(), self.fs.id(), IOS_IMESSAGE);
            contact.provider_friendly_name = Some(IOS_IMESSAGE_FRIENDLY.to_owned());
            contact.name = Name::default();
            // No explicit link to the address book; contact merging joins them up.
            contact.phone = Some(id);
            contact.provider_data = ContactData::ImessageHandle { row_id: rowid };
            contacts.push(contact);
        }
        Ok(contacts)
    }

    fn contact_unknown(&self, _local_id: &str) -> Option<Contact> {
        None
    }
}

impl Provider for Imessage {
    fn name(&self) -> &'static str {
        IOS_IMESSAGE
    }

    fn friendly_name(&self) -> &'static str {
        IOS_IMESSAGE_FRIENDLY
    }

    fn search_events(&self, _device: &DeviceContext, filter: &EventsFilter) -> Result<Vec<Event>> {
        if !filter.accepts_type("MessageEvent") {
            return Ok(vec![]);
        }

        let mut sql =
            "SELECT message.ROWID AS rowid, message.guid AS guid, message.text AS text,
                    message.date AS date, message.handle_id AS handle_id,
                    message.is_from_me AS is_from_me, chat_message_join.chat_id AS chat_id
             FROM message
             JOIN chat_message_join ON chat_message_join.message_id = message.ROWID".to_owned();
        let mut clauses = vec![];
        if let Some(start) = &filter.timestamp_start {
            clauses.push(format!("message.date >= {}", datetime_to_timestamp(start)));
        }
        if let Some(end) = &filter.timestamp_end {
            clauses.push(format!("message.date <= {}", datetime_to_timestamp(end)));
        }
        if !clauses.is_empty() {
            sql.push_str(&format!(" WHERE {}", clauses.join(" AND ")));
        }

        let mut stmt = self.conn.prepare(&sql)?;
        let mut rows = stmt.query([])?;

        let mut sessions: HashMap<i64, MessageSession> = HashMap::new();
        let mut events = vec![];
        while let Some(row) = rows.next()? {
            let message_row_id: i64 = row.get("rowid")?;
            let chat_id: i64 = row.get("chat_id")?;
            let handle_id: i64 = row.get("handle_id")?;

            if !sessions.contains_key(&chat_id) {
                let session = self.create_session(chat_id)?;
                sessions.insert(chat_id, session);
            }

            events.push(Event::Message(MessageEvent {
                local_id: row.get::<_, String>("guid")?,
                session_id: chat_id.to_string(),
                session: Some(sessions[&chat_id].clone()),
                from_me: row.get::<_, i64>("is_from_me")? != 0,
                timestamp: timestamp_to_datetime(row.get("date")?)?,
                provider_name: IOS_IMESSAGE.to_owned(),
                device_id: None,
                text: row.get("text")?,
                sender: self.contacts.get(self, &handle_id.to_string())?,
                media: None,
                provider_data: EventData::Imessage { message_row_id, chat_row_id: chat_id },
            }));
        }

        Ok(events)
    }

    fn search_contacts(&self, filter: &ContactsFilter) -> Result<Vec<Contact>> {
        Ok(self.contacts.values(self)?.into_iter().filter(|c| filter.matches(c)).collect())
    }

    fn get_media(&self, local_id: &str) -> Result<MediaData> {
        err!("Apple Messages attachments are not indexed (requested {local_id})")
    }

    fn subset(&self, subsetter: &Subsetter, events: &[Event], contacts: &[Contact]) -> EmptyRes {
        let mut rows_handle = subsetter.row_subset("handle", "ROWID");
        let mut rows_message = subsetter.row_subset("message", "ROWID");
        let mut rows_chat = subsetter.row_subset("chat", "ROWID");
        let mut rows_chat_message_join = subsetter.row_subset("chat_message_join", "chat_id");
        let mut rows_chat_handle_join = subsetter.row_subset("chat_handle_join", "chat_id");

        for contact in contacts {
            if contact.provider_name != IOS_IMESSAGE {
                continue;
            }
            if let ContactData::ImessageHandle { row_id } = contact.provider_data {
                rows_handle.add(row_id);
            }
        }

        for event in events {
            let Event::Message(message) = event else { continue };
            let EventData::Imessage { message_row_id, chat_row_id } = message.provider_data
                else { continue };

            rows_message.add(message_row_id);
            rows_chat.add(chat_row_id);
            rows_chat_message_join.add(chat_row_id);
            rows_chat_handle_join.add(chat_row_id);
            if let Some(session) = &message.session {
                for participant in &session.participants {
                    if let ContactData::ImessageHandle { row_id } = participant.provider_data {
                        rows_handle.add(row_id);
                    }
                }
            }
        }

        subsetter.create_db_and_copy_rows(&self.conn, MESSAGE_DB, &[
            &rows_handle as &dyn TableCopy,
            &rows_message,
            &rows_chat,
            &rows_chat_message_join,
            &rows_chat_handle_join,
        ])
    }

    fn pii_fields(&self) -> PiiFields {
        PiiFields {
            sqlite3: vec![PiiDatabase {
                db_path: MESSAGE_DB,
                tables: vec![
                    PiiTable {
                        table: "handle",
                        columns: vec![
                            ("id", provider::PHONE),
                            ("uncanonicalized_id", provider::PHONE),
                        ],
                    },
                    PiiTable {
                        table: "chat",
                        columns: vec![
                            ("guid", provider::PHONE),
                            ("chat_identifier", provider::PHONE),
                            ("account_login", provider::PHONE),
                            ("last_addressed_handle", provider::PHONE),
                        ],
                    },
                    PiiTable {
                        table: "message",
                        columns: vec![
                            ("text", provider::PHONE_NAME),
                            ("account", provider::PHONE),
                            ("destination_caller_id", provider::PHONE),
                        ],
                    },
                ],
            }],
        }
    }
}

#[cfg(test)]
#[path = "imessage_tests.rs"]
mod tests;
