//! Android WhatsApp: `msgstore.db` (messages, jids, chats) and `wa.db` (contacts).

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};

use crate::contact::{Contact, ContactData, Name};
use crate::event::{Event, EventData, Media, MediaData, MessageEvent, MessageSession, SessionData};
use crate::filesystem::DeviceFilesystem;
use crate::filter::{ContactsFilter, EventsFilter};
use crate::provider::{self, DeviceContext, PiiDatabase, PiiFields, PiiTable, Provider};
use crate::providers::names::{ANDROID_WHATSAPP, ANDROID_WHATSAPP_FRIENDLY};
use crate::subset::{Subsetter, TableCopy};
use crate::utils::*;

pub const MESSAGE_DB: &str = "data/data/com.whatsapp/databases/msgstore.db";
pub const WA_DB: &str = "data/data/com.whatsapp/databases/wa.db";

// message.message_type values we surface.
const MESSAGE_TYPE_TEXT: i64 = 0;
const MESSAGE_TYPE_IMAGE: i64 = 1;
const MESSAGE_TYPE_AUDIO: i64 = 2;
const MESSAGE_TYPE_VIDEO: i64 = 3;

const MEDIA_MESSAGE_TYPES: &[i64] = &[MESSAGE_TYPE_IMAGE, MESSAGE_TYPE_AUDIO, MESSAGE_TYPE_VIDEO];

// jid.type values.
const JID_TYPE_GROUP: i32 = 1;
#[allow(dead_code)]
const JID_TYPE_BROADCAST: i32 = 5;
#[allow(dead_code)]
const JID_TYPE_ME: i32 = 11;
const JID_TYPE_USER: i32 = 17;

/// One row of `msgstore.db`'s jid table. A contact may be referenced by several.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaJid {
    pub row_id: i64,
    pub raw_string: String,
    pub typ: i32,
}

/// The wa.db side of a contact, kept so subsetting can recreate its rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WaContactData {
    pub row_id: i64,
    pub jid: String,
    pub jids: Vec<WaJid>,
}

impl WaContactData {
    fn typ_contains(&self, typ: i32) -> bool {
        self.jids.iter().any(|jid| jid.typ == typ)
    }
}

fn wa_contact_data(contact: &Contact) -> Result<&WaContactData> {
    match &contact.provider_data {
        ContactData::WhatsappAndroid(data) => Ok(data),
        other => err!("Not a WhatsApp contact payload: {other:?}"),
    }
}

// Timestamps are milliseconds since the Unix epoch.
fn timestamp_to_datetime(timestamp: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(timestamp)
        .with_context(|| format!("Timestamp {timestamp} out of range"))
}

fn datetime_to_timestamp(dt: &DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

#[derive(Default)]
struct Contacts {
    by_jid_row_id: HashMap<i64, Contact>,
    by_local_id: HashMap<String, Contact>,
    /// group jid row id -> (group_participant_user._id, user_jid_row_id) pairs
    group_members: HashMap<i64, Vec<(i64, i64)>>,
}

pub struct AndroidWhatsApp {
    fs: Arc<dyn DeviceFilesystem>,
    msgdb: Connection,
    wadb: Connection,
    contacts: RefCell<Option<Contacts>>,
}

impl AndroidWhatsApp {
    pub fn from_filesystem(fs: &Arc<dyn DeviceFilesystem>) -> Result<Option<Self>> {
        if !fs.exists(MESSAGE_DB) {
            return Ok(None);
        }
        Ok(Some(AndroidWhatsApp {
            fs: Arc::clone(fs),
            msgdb: fs.sqlite3_connect(MESSAGE_DB, true)?,
            wadb: fs.sqlite3_connect(WA_DB, true)?,
            contacts: RefCell::new(None),
        }))
    }

    /// Reads and caches all contacts from wa.db, plus every JID mentioned in the
    /// message store (a JID may be referenced by messages without any wa_contacts row).
    fn load_contacts(&self) -> Result<std::cell::Ref<'_, Contacts>> {
        if self.contacts.borrow().is_none() {
            let mut contacts = Contacts::default();

            let mut stmt = self.wadb.prepare(
                "SELECT _id, jid, number, display_name, given_name, family_name, wa_name
                 FROM wa_contacts")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let jid: String = row.get("jid")?;
                let number: Option<String> = row.get("number")?;
                let display_name: Option<String> = row.get("display_name")?;
                let wa_name: Option<String> = row.get("wa_name")?;

                let mut contact = Contact::new(jid.clone(), self.fs.id(), ANDROID_WHATSAPP);
                contact.provider_friendly_name = Some(ANDROID_WHATSAPP_FRIENDLY.to_owned());
                contact.name = Name {
                    first: row.get("given_name")?,
                    last: row.get("family_name")?,
                    display: display_name.or(wa_name),
                };
                // A missing number can be recovered from the user part of the JID.
                contact.phone = Some(number.unwrap_or_else(|| {
                    format!("+{}", jid.split('@').next().unwrap_or(&jid))
                }));
                contact.provider_data = ContactData::WhatsappAndroid(WaContactData {
                    row_id: row.get("_id")?,
                    jid: jid.clone(),
                    jids: vec![],
                });
                contacts.by_local_id.insert(jid, contact);
            }
            drop(rows);
            drop(stmt);

            let mut stmt = self.msgdb.prepare(
                "SELECT _id, user, server, type, raw_string FROM jid")?;
            let mut rows = stmt.query([])?;
            while let Some(row) = rows.next()? {
                let user: String = row.get("user")?;
                let server: String = row.get("server")?;
                let jid = format!("{user}@{server}");

                if !contacts.by_local_id.contains_key(&jid) {
                    let mut contact = Contact::new(jid.clone(), self.fs.id(), ANDROID_WHATSAPP);
                    contact.provider_friendly_name = Some(ANDROID_WHATSAPP_FRIENDLY.to_owned());
                    contact.name = Name::display("Unknown");
                    contact.phone = Some(user.clone());
                    contact.provider_data = ContactData::WhatsappAndroid(WaContactData {
                        row_id: -1,
                        jid: jid.clone(),
                        jids: vec![],
                    });
                    contacts.by_local_id.insert(jid.clone(), contact);
                }

                let contact = contacts.by_local_id.get_mut(&jid).unwrap();
                let jid_row_id: i64 = row.get("_id")?;
                if let ContactData::WhatsappAndroid(data) = &mut contact.provider_data {
                    data.jids.push(WaJid {
                        row_id: jid_row_id,
                        raw_string: row.get("raw_string")?,
                        typ: row.get("type")?,
                    });
                }
                contacts.by_jid_row_id.insert(jid_row_id, contact.clone());
            }
            drop(rows);
            drop(stmt);

            // by_jid_row_id was populated while jid lists were still filling up;
            // refresh so every copy has the full list.
            for contact in contacts.by_jid_row_id.values_mut() {
                *contact = contacts.by_local_id[&contact.local_id].clone();
            }

            *self.contacts.borrow_mut() = Some(contacts);
        }

        Ok(std::cell::Ref::map(self.contacts.borrow(), |c| c.as_ref().unwrap()))
    }

    fn get_contact(&self, jid_row_id: i64) -> Result<Option<Contact>> {
        Ok(self.load_contacts()?.by_jid_row_id.get(&jid_row_id).cloned())
    }

    /// The other users in a group: member contacts of type user, with the
    /// group_participant_user row ids remembered for subsetting.
    fn group_members(&self, group_jid_row_id: i64) -> Result<Vec<(i64, i64)>> {
        {
            let contacts = self.load_contacts()?;
            if let Some(members) = contacts.group_members.get(&group_jid_row_id) {
                return Ok(members.clone());
            }
        }

        let mut stmt = self.msgdb.prepare(
            "SELECT _id, user_jid_row_id FROM group_participant_user WHERE group_jid_row_id = ?1")?;
        let mut rows = stmt.query([group_jid_row_id])?;
        let mut members = vec![];
        while let Some(row) = rows.next()? {
            members.push((row.get(0)?, row.get(1)?));
        }
        drop(rows);
        drop(stmt);

        let mut cache = self.contacts.borrow_mut();
        cache.as_mut().unwrap().group_members.insert(group_jid_row_id, members.clone());
        Ok(members)
    }

    fn create_session(&self, chat_row_id: i64) -> Result<Option<MessageSession>> {
        let row: Option<(i64, Option<String>)> = self.msgdb.query_row(
            "SELECT jid_row_id, subject FROM chat WHERE _id = ?1",
            [chat_row_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        ).optional()?;
        let Some((jid_row_id, subject)) = row else { return Ok(None) };

        let contact = self.get_contact(jid_row_id)?;

        let mut participants = vec![];
        let mut provider_data = SessionData::None;
        if let Some(contact) = contact {
            let data = wa_contact_data(&contact)?;
            if data.typ_contains(JID_TYPE_GROUP) {
                let members = self.group_members(jid_row_id)?;
                let contacts = self.load_contacts()?;
                for (_, user_jid_row_id) in &members {
                    if let Some(member) = contacts.by_jid_row_id.get(user_jid_row_id) {
                        if wa_contact_data(member)?.typ_contains(JID_TYPE_USER) {
                            participants.push(member.clone());
                        }
                    }
                }
                // Record the group's own contact too so that subsetting includes it.
                provider_data = SessionData::WhatsappAndroid {
                    group_participant_user_ids: members.iter().map(|(id, _)| *id).collect(),
                    group_user_id: Some(data.row_id),
                    group_jid_row_id: Some(jid_row_id),
                };
            } else {
                provider_data = SessionData::WhatsappAndroid {
                    group_participant_user_ids: vec![],
                    group_user_id: None,
                    group_jid_row_id: None,
                };
                participants.push(contact);
            }
        }

        Ok(Some(MessageSession {
            local_id: chat_row_id.to_string(),
            provider_name: ANDROID_WHATSAPP.to_owned(),
            name: subject,
            participants,
            provider_data,
            global_id: None,
        }))
    }

    fn media_path(local_id: &str) -> String {
        // Media lives on the SD card, outside the databases.
        format!("/sdcard/WhatsApp/{local_id}")
    }
}

impl Provider for AndroidWhatsApp {
    fn name(&self) -> &'static str {
        ANDROID_WHATSAPP
    }

    fn friendly_name(&self) -> &'static str {
        ANDROID_WHATSAPP_FRIENDLY
    }

    fn search_events(&self, _device: &DeviceContext, filter: &EventsFilter) -> Result<Vec<Event>> {
        if !filter.accepts_type("MessageEvent") {
            return Ok(vec![]);
        }

        let mut sessions: HashMap<i64, Option<MessageSession>> = HashMap::new();
        let mut events = vec![];

        // The timestamp window is pushed into SQL; everything else is filtered by
        // the caller via `EventsFilter::matches`.
        let type_list = std::iter::once(MESSAGE_TYPE_TEXT)
            .chain(MEDIA_MESSAGE_TYPES.iter().copied())
            .map(|t| t.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        let mut sql = format!(
            "SELECT message._id AS _id, message.chat_row_id AS chat_row_id,
                    message.sender_jid_row_id AS sender_jid_row_id,
                    message.message_type AS message_type, message.text_data AS text_data,
                    message.timestamp AS timestamp, message.from_me AS from_me,
                    message_details.author_device_jid AS author_device_jid,
                    message_media.file_path AS file_path, message_media.mime_type AS mime_type
             FROM message
             JOIN chat ON chat._id = message.chat_row_id
             JOIN message_details ON message_details.message_row_id = message._id
             LEFT JOIN message_media ON message_media.message_row_id = message._id
             WHERE message.message_type IN ({type_list})");
        if let Some(start) = &filter.timestamp_start {
            sql.push_str(&format!(" AND message.timestamp >= {}", datetime_to_timestamp(start)));
        }
        if let Some(end) = &filter.timestamp_end {
            sql.push_str(&format!(" AND message.timestamp <= {}", datetime_to_timestamp(end)));
        }

        let mut stmt = self.msgdb.prepare(&sql)?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let message_row_id: i64 = row.get("_id")?;
            let chat_row_id: i64 = row.get("chat_row_id")?;
            let sender_jid_row_id: i64 = row.get("sender_jid_row_id")?;
            let message_type: i64 = row.get("message_type")?;

            // sender_jid_row_id == 0 marks a group chat message; the author is in
            // message_details. Otherwise it points at the private chat sender.
            let sender = if sender_jid_row_id == 0 {
                match row.get::<_, Option<i64>>("author_device_jid")? {
                    Some(author_jid_row_id) => self.get_contact(author_jid_row_id)?,
                    None => None,
                }
            } else {
                self.get_contact(sender_jid_row_id)?
            };

            if !sessions.contains_key(&chat_row_id) {
                let session = self.create_session(chat_row_id)?;
                sessions.insert(chat_row_id, session);
            }

            let media = if MEDIA_MESSAGE_TYPES.contains(&message_type) {
                Some(Media {
                    mime_type: row.get::<_, Option<String>>("mime_type")?.unwrap_or_default(),
                    local_id: row.get::<_, Option<String>>("file_path")?.unwrap_or_default(),
                })
            } else {
                None
            };

            events.push(Event::Message(MessageEvent {
                local_id: message_row_id.to_string(),
                session_id: chat_row_id.to_string(),
                session: sessions[&chat_row_id].clone(),
                timestamp: timestamp_to_datetime(row.get("timestamp")?)?,
                provider_name: ANDROID_WHATSAPP.to_owned(),
                device_id: None,
                text: row.get("text_data")?,
                from_me: row.get::<_, i64>("from_me")? != 0,
                sender,
                media,
                provider_data: EventData::WhatsappAndroid { message_row_id, chat_row_id },
            }));
        }

        Ok(events)
    }

    fn search_contacts(&self, filter: &ContactsFilter) -> Result<Vec<Contact>> {
        let contacts = self.load_contacts()?;
        Ok(contacts.by_local_id.values()
            .filter(|c| matches!(&c.provider_data,
                ContactData::WhatsappAndroid(data) if data.typ_contains(JID_TYPE_USER)))
            .filter(|c| filter.matches(c))
            .cloned()
            .collect())
    }

    fn get_media(&self, local_id: &str) -> Result<MediaData> {
        let mime_type: String = self.msgdb.query_row(
            "SELECT mime_type FROM message_media WHERE file_path = ?1",
            [local_id],
            |row| row.get(0),
        ).optional()?.with_context(|| format!("No media found for local id {local_id}"))?;

        let media_path = Self::media_path(local_id);
        Ok(MediaData {
            mime_type,
            length: self.fs.getsize(&media_path)?,
            handle: self.fs.open(&media_path)?,
        })
    }

    fn subset(&self, subsetter: &Subsetter, events: &[Event], contacts: &[Contact]) -> EmptyRes {
        let mut rows_wa_contacts = subsetter.row_subset("wa_contacts", "_id");
        let mut rows_group_participant_user = subsetter.row_subset("group_participant_user", "_id");
        let mut rows_message = subsetter.row_subset("message", "_id");
        let mut rows_message_media = subsetter.row_subset("message_media", "message_row_id");
        let mut rows_message_details = subsetter.row_subset("message_details", "message_row_id");
        let mut rows_jid = subsetter.row_subset("jid", "_id");
        let mut rows_chat = subsetter.row_subset("chat", "_id");

        for contact in contacts {
            if contact.provider_name != ANDROID_WHATSAPP {
                continue;
            }
            let data = wa_contact_data(contact)?;
            if data.row_id >= 0 {
                rows_wa_contacts.add(data.row_id);
            }
            rows_jid.update(data.jids.iter().map(|jid| jid.row_id));
        }

        for event in events {
            let Event::Message(message) = event else { continue };
            let EventData::WhatsappAndroid { message_row_id, chat_row_id } = message.provider_data
                else { continue };

            rows_message.add(message_row_id);
            rows_message_details.add(message_row_id);
            rows_message_media.add(message_row_id);
            rows_chat.add(chat_row_id);

            if let Some(sender) = &message.sender {
                rows_jid.update(wa_contact_data(sender)?.jids.iter().map(|jid| jid.row_id));
            }

            if let Some(SessionData::WhatsappAndroid {
                group_participant_user_ids, group_user_id, group_jid_row_id,
            }) = message.session.as_ref().map(|s| &s.provider_data) {
                rows_group_participant_user.update(group_participant_user_ids.iter().copied());
                if let Some(group_user_id) = group_user_id {
                    rows_wa_contacts.add(*group_user_id);
                }
                if let Some(group_jid_row_id) = group_jid_row_id {
                    rows_jid.add(*group_jid_row_id);
                }
            }
        }

        subsetter.create_db_and_copy_rows(&self.msgdb, MESSAGE_DB, &[
            &rows_message as &dyn TableCopy,
            &rows_message_details,
            &rows_message_media,
            &rows_jid,
            &rows_chat,
            &rows_group_participant_user,
        ])?;
        subsetter.create_db_and_copy_rows(&self.wadb, WA_DB, &[&rows_wa_contacts as &dyn TableCopy])?;

        // Media is copied file by file, named by the message_media rows we kept.
        let mut paths = vec![];
        {
            let mut stmt = self.msgdb.prepare(
                "SELECT file_path FROM message_media WHERE message_row_id = ?1")?;
            for key in rows_message_media.rows() {
                let mut key_rows = stmt.query([key])?;
                while let Some(row) = key_rows.next()? {
                    if let Some(file_path) = row.get::<_, Option<String>>(0)? {
                        paths.push(file_path);
                    }
                }
            }
        }
        for file_path in paths {
            let media_path = Self::media_path(&file_path);
            if self.fs.exists(&media_path) {
                subsetter.copy_file(self.fs.open(&media_path)?, &media_path)?;
            }
        }
        Ok(())
    }

    fn pii_fields(&self) -> PiiFields {
        PiiFields {
            sqlite3: vec![
                PiiDatabase {
                    db_path: WA_DB,
                    tables: vec![PiiTable {
                        table: "wa_contacts",
                        columns: vec![
                            ("jid", provider::PHONE),
                            ("number", provider::PHONE),
                            ("display_name", provider::NAME),
                            ("given_name", provider::NAME),
                            ("family_name", provider::NAME),
                            ("wa_name", provider::NAME),
                            ("sort_name", provider::NAME),
                            ("nickname", provider::NAME),
                        ],
                    }],
                },
                PiiDatabase {
                    db_path: MESSAGE_DB,
                    tables: vec![
                        PiiTable {
                            table: "jid",
                            columns: vec![
                                ("user", provider::PHONE),
                                ("raw_string", provider::PHONE),
                            ],
                        },
                        PiiTable {
                            table: "message",
                            columns: vec![("text_data", provider::PHONE_NAME)],
                        },
                    ],
                },
            ],
        }
    }
}

#[cfg(test)]
#[path = "android_whatsapp_tests.rs"]
mod tests;
