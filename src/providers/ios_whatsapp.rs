//! iOS WhatsApp, from `ChatStorage.sqlite` in the shared app-group domain.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};

use crate::contact::{Contact, ContactData, Name};
use crate::event::{Event, EventData, MediaData, MessageEvent, MessageSession, SessionData};
use crate::filesystem::DeviceFilesystem;
use crate::filter::{ContactsFilter, EventsFilter};
use crate::provider::{self, DeviceContext, PiiDatabase, PiiFields, PiiTable, Provider};
use crate::providers::names::{IOS_WHATSAPP, IOS_WHATSAPP_FRIENDLY};
use crate::subset::{Subsetter, TableCopy};
use crate::utils::*;

pub const CHATSTORAGE_DB: &str = "AppDomainGroup-group.net.whatsapp.WhatsApp.shared/ChatStorage.sqlite";

// ZWAMESSAGE.ZMESSAGETYPE for plain text.
const MESSAGE_TYPE_TEXT: i64 = 0;

// WhatsApp iOS stores timestamps as seconds since 2001-01-01.
const WA_IOS_TS_OFFSET: i64 = 978307200;

fn timestamp_to_datetime(timestamp: f64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(WA_IOS_TS_OFFSET + timestamp as i64, 0)
        .with_context(|| format!("Timestamp {timestamp} out of range"))
}

fn jid_to_phone(jid: &str) -> Option<String> {
    jid.split_once('@').map(|(user, _)| user.to_owned())
}

/// Contact information is split between ZWACHATSESSION (partners), ZWAGROUPMEMBER
/// (group-only members) and ZWAPROFILEPUSHNAME; the row ids of each are kept so
/// subsetting can retain them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IosWaContactData {
    pub chat_session_ids: Vec<i64>,
    pub profile_push_name_id: Option<i64>,
    pub group_member_pks: Vec<i64>,
}

pub struct IosWhatsApp {
    fs: Arc<dyn DeviceFilesystem>,
    msgdb: Connection,
    contacts: RefCell<Option<HashMap<String, Contact>>>,
}

impl IosWhatsApp {
    pub fn from_filesystem(fs: &Arc<dyn DeviceFilesystem>) -> Result<Option<Self>> {
        if !fs.exists(CHATSTORAGE_DB) {
            return Ok(None);
        }
        Ok(Some(IosWhatsApp {
            fs: Arc::clone(fs),
            msgdb: fs.sqlite3_connect(CHATSTORAGE_DB, true)?,
            contacts: RefCell::new(None),
        }))
    }

    fn load_contacts(&self) -> EmptyRes {
        if self.contacts.borrow().is_some() {
            return Ok(());
        }
        let mut contacts: HashMap<String, Contact> = HashMap::new();

        // Chat partners, with push names where known.
        let mut stmt = self.msgdb.prepare(
            "SELECT ZWACHATSESSION.Z_PK AS Z_PK, ZWACHATSESSION.ZCONTACTJID AS ZCONTACTJID,
                    ZWACHATSESSION.ZPARTNERNAME AS ZPARTNERNAME,
                    ZWAPROFILEPUSHNAME.ZPUSHNAME AS ZPUSHNAME,
                    ZWAPROFILEPUSHNAME.Z_PK AS PUSH_PK
             FROM ZWACHATSESSION
             LEFT JOIN ZWAPROFILEPUSHNAME ON ZWACHATSESSION.ZCONTACTJID = ZWAPROFILEPUSHNAME.ZJID
             WHERE ZWACHATSESSION.ZCONTACTIDENTIFIER IS NOT NULL")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let Some(jid) = row.get::<_, Option<String>>("ZCONTACTJID")? else { continue };
            Self::make_or_update_contact(
                &mut contacts, self.fs.id(), &jid,
                row.get("ZPARTNERNAME")?,
                row.get("ZPUSHNAME")?,
                row.get("Z_PK")?,
                row.get("PUSH_PK")?,
                None,
            );
        }
        drop(rows);
        drop(stmt);

        // Members that only ever appear in group chats.
        let mut stmt = self.msgdb.prepare(
            "SELECT ZWAGROUPMEMBER.Z_PK AS Z_PK, ZWAGROUPMEMBER.ZMEMBERJID AS ZMEMBERJID,
                    ZWAPROFILEPUSHNAME.ZPUSHNAME AS ZPUSHNAME,
                    ZWAPROFILEPUSHNAME.Z_PK AS PUSH_PK
             FROM ZWAGROUPMEMBER
             LEFT JOIN ZWAPROFILEPUSHNAME ON ZWAGROUPMEMBER.ZMEMBERJID = ZWAPROFILEPUSHNAME.ZJID")?;
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let Some(jid) = row.get::<_, Option<String>>("ZMEMBERJID")? else { continue };
            Self::make_or_update_contact(
                &mut contacts, self.fs.id(), &jid,
                None,
                row.get("ZPUSHNAME")?,
                None,
                row.get("PUSH_PK")?,
                row.get("Z_PK")?,
            );
        }
        drop(rows);
        drop(stmt);

        *self.contacts.borrow_mut() = Some(contacts);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn make_or_update_contact(contacts: &mut HashMap<String, Contact>, device_id: &str, jid: &str,
                              partner_name: Option<String>, push_name: Option<String>,
                              chat_session_id: Option<i64>, profile_push_name_id: Option<i64>,
                              group_member_pk: Option<i64>) {
        let contact = contacts.entry(jid.to_owned()).or_insert_with(|| {
            let mut contact = Contact::new(jid, device_id, IOS_WHATSAPP);
            contact.provider_friendly_name = Some(IOS_WHATSAPP_FRIENDLY.to_owned());
            contact.name = Name::display(
                partner_name.clone().or(push_name.clone()).unwrap_or_else(|| jid.to_owned()));
            contact.phone = jid_to_phone(jid);
            contact.provider_data = ContactData::IosWhatsapp(IosWaContactData {
                profile_push_name_id,
                ..Default::default()
            });
            contact
        });

        if let ContactData::IosWhatsapp(data) = &mut contact.provider_data {
            data.chat_session_ids.extend(chat_session_id);
            data.group_member_pks.extend(group_member_pk);
            if data.profile_push_name_id.is_none() {
                data.profile_push_name_id = profile_push_name_id;
            }
        }
    }

    fn jid_to_contact(&self, jid: &str) -> Result<Contact> {
        self.load_contacts()?;
        {
            let contacts = self.contacts.borrow();
            if let Some(contact) = contacts.as_ref().unwrap().get(jid) {
                return Ok(contact.clone());
            }
        }
        // An unexpected JID; fabricate a contact rather than dropping the message.
        let mut contacts = self.contacts.borrow_mut();
        let contacts = contacts.as_mut().unwrap();
        Self::make_or_update_contact(contacts, self.fs.id(), jid, None, None, None, None, None);
        Ok(contacts[jid].clone())
    }

    fn create_session(&self, session_id: i64) -> Result<MessageSession> {
        let chat: Option<(Option<String>, Option<String>, Option<String>)> = self.msgdb.query_row(
            "SELECT ZCONTACTJID, ZPARTNERNAME, ZGROUPINFO FROM ZWACHATSESSION WHERE Z_PK = ?1",
            [session_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        ).optional()?;

        let Some((contact_jid, partner_name, group_info)) = chat else {
            return Ok(MessageSession {
                local_id: session_id.to_string(),
                provider_name: IOS_WHATSAPP.to_owned(),
                name: Some("Unknown wa-ios session".to_owned()),
                participants: vec![],
                provider_data: SessionData::None,
                global_id: None,
            });
        };

        let participants = if group_info.is_some() {
            // Group chat: membership comes from ZWAGROUPMEMBER.
            let mut stmt = self.msgdb.prepare(
                "SELECT ZMEMBERJID FROM ZWAGROUPMEMBER WHERE ZCHATSESSION = ?1")?;
            let mut rows = stmt.query([session_id])?;
            let mut participants = vec![];
            while let Some(row) = rows.next()? {
                if let Some(jid) = row.get::<_, Option<String>>(0)? {
                    participants.push(self.jid_to_contact(&jid)?);
                }
            }
            participants
        } else {
            match contact_jid {
                Some(jid) => vec![self.jid_to_contact(&jid)?],
                None => vec![],
            }
        };

        Ok(MessageSession {
            local_id: session_id.to_string(),
            provider_name: IOS_WHATSAPP.to_owned(),
            name: partner_name,
            participants,
            provider_data: SessionData::None,
            global_id: None,
        })
    }
}

impl Provider for IosWhatsApp {
    fn name(&self) -> &'static str {
        IOS_WHATSAPP
    }

    fn friendly_name(&self) -> &'static str {
        IOS_WHATSAPP_FRIENDLY
    }

    fn search_events(&self, _device: &DeviceContext, filter: &EventsFilter) -> Result<Vec<Event>> {
        if !filter.accepts_type("MessageEvent") {
            return Ok(vec![]);
        }
        self.load_contacts()?;

        let mut stmt = self.msgdb.prepare(&format!(
            "SELECT ZWAMESSAGE.Z_PK AS Z_PK, ZWAMESSAGE.ZTEXT AS ZTEXT,
                    ZWAMESSAGE.ZMESSAGEDATE AS ZMESSAGEDATE, ZWAMESSAGE.ZISFROMME AS ZISFROMME,
                    ZWAMESSAGE.ZFROMJID AS ZFROMJID, ZWAMESSAGE.ZCHATSESSION AS ZCHATSESSION,
                    ZWAMESSAGE.ZGROUPMEMBER AS ZGROUPMEMBER,
                    ZWAGROUPMEMBER.ZMEMBERJID AS ZMEMBERJID
             FROM ZWAMESSAGE
             LEFT JOIN ZWAGROUPMEMBER ON ZWAMESSAGE.ZGROUPMEMBER = ZWAGROUPMEMBER.Z_PK
             WHERE ZWAMESSAGE.ZMESSAGETYPE = {MESSAGE_TYPE_TEXT}"))?;
        let mut rows = stmt.query([])?;

        let mut sessions: HashMap<i64, MessageSession> = HashMap::new();
        let mut events = vec![];

        while let Some(row) = rows.next()? {
            let message_row_id: i64 = row.get("Z_PK")?;
            let Some(session_id) = row.get::<_, Option<i64>>("ZCHATSESSION")? else { continue };
            let from_me = row.get::<_, Option<i64>>("ZISFROMME")? == Some(1);
            let group_member: Option<i64> = row.get("ZGROUPMEMBER")?;

            if !sessions.contains_key(&session_id) {
                let session = self.create_session(session_id)?;
                sessions.insert(session_id, session);
            }

            // From ourselves: no sender. In group chats ZFROMJID is the group JID
            // and the real sender is the referenced group member row.
            let sender_jid: Option<String> = if from_me {
                None
            } else if group_member.is_some() {
                row.get("ZMEMBERJID")?
            } else {
                row.get("ZFROMJID")?
            };
            let sender = match &sender_jid {
                Some(jid) => Some(self.jid_to_contact(jid)?),
                None => None,
            };

            events.push(Event::Message(MessageEvent {
                local_id: message_row_id.to_string(),
                session_id: session_id.to_string(),
                session: Some(sessions[&session_id].clone()),
                timestamp: timestamp_to_datetime(row.get::<_, Option<f64>>("ZMESSAGEDATE")?.unwrap_or(0.0))?,
                provider_name: IOS_WHATSAPP.to_owned(),
                device_id: None,
                text: row.get("ZTEXT")?,
                from_me,
                sender,
                media: None,
                provider_data: EventData::IosWhatsapp {
                    group_member,
                    chat_session_id: session_id,
                },
            }));
        }

        Ok(events)
    }

    fn search_contacts(&self, filter: &ContactsFilter) -> Result<Vec<Contact>> {
        self.load_contacts()?;
        let contacts = self.contacts.borrow();
        Ok(contacts.as_ref().unwrap().values()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect())
    }

    fn get_media(&self, local_id: &str) -> Result<MediaData> {
        err!("iOS WhatsApp media is not indexed (requested {local_id})")
    }

    fn subset(&self, subsetter: &Subsetter, events: &[Event], contacts: &[Contact]) -> EmptyRes {
        let mut rows_push_name = subsetter.row_subset("ZWAPROFILEPUSHNAME", "Z_PK");
        let mut rows_group_member = subsetter.row_subset("ZWAGROUPMEMBER", "Z_PK");
        let mut rows_chat_session = subsetter.row_subset("ZWACHATSESSION", "Z_PK");
        let mut rows_message = subsetter.row_subset("ZWAMESSAGE", "Z_PK");

        for contact in contacts {
            if contact.provider_name != IOS_WHATSAPP {
                continue;
            }
            if let ContactData::IosWhatsapp(data) = &contact.provider_data {
                if let Some(push_pk) = data.profile_push_name_id {
                    rows_push_name.add(push_pk);
                }
                rows_group_member.update(data.group_member_pks.iter().copied());
                rows_chat_session.update(data.chat_session_ids.iter().copied());
            }
        }

        for event in events {
            let Event::Message(message) = event else { continue };
            let EventData::IosWhatsapp { group_member, chat_session_id } = message.provider_data
                else { continue };

            rows_message.add(message.local_id.as_str());
            rows_chat_session.add(chat_session_id);
            if let Some(group_member) = group_member {
                rows_group_member.add(group_member);
            }
        }

        subsetter.create_db_and_copy_rows(&self.msgdb, CHATSTORAGE_DB, &[
            &rows_push_name as &dyn TableCopy,
            &rows_group_member,
            &rows_chat_session,
            &rows_message,
        ])
    }

    fn pii_fields(&self) -> PiiFields {
        PiiFields {
            sqlite3: vec![PiiDatabase {
                db_path: CHATSTORAGE_DB,
                tables: vec![
                    PiiTable {
                        table: "ZWAPROFILEPUSHNAME",
                        columns: vec![("ZJID", provider::PHONE)],
                    },
                    PiiTable {
                        table: "ZWAGROUPMEMBER",
                        columns: vec![("ZMEMBERJID", provider::PHONE)],
                    },
                    PiiTable {
                        table: "ZWACHATSESSION",
                        columns: vec![
                            ("ZCONTACTJID", provider::PHONE),
                            ("ZPARTNERNAME", provider::PHONE),
                        ],
                    },
                    PiiTable {
                        table: "ZWAMESSAGE",
                        columns: vec![
                            ("ZFROMJID", provider::PHONE),
                            ("ZTOJID", provider::PHONE),
                            ("ZTEXT", provider::PHONE_NAME),
                        ],
                    },
                ],
            }],
        }
    }
}

#[cfg(test)]
#[path = "ios_whatsapp_tests.rs"]
mod tests;
