//! Events, sessions and media.
//!
//! An event is something that occurred at a particular time in the dataset of one
//! provider. Events are constructed per query and never cached.

use std::io::Read;

use chrono::{DateTime, Utc};

use crate::contact::Contact;

/// Labelling attached by providers that classify content generically (currently the
/// media scanners): where the content came from and whether the user made it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericEventInfo {
    pub category: String,
    pub is_user_generated: bool,
}

/// Provider-specific payload that lets a message event be recreated during subsetting.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum EventData {
    #[default]
    None,
    WhatsappAndroid {
        message_row_id: i64,
        chat_row_id: i64,
    },
    Telephony {
        thread_row_id: i64,
        address_row_id: Option<i64>,
    },
    Imessage {
        message_row_id: i64,
        chat_row_id: i64,
    },
    IosWhatsapp {
        group_member: Option<i64>,
        chat_session_id: i64,
    },
}

#[derive(Debug, Clone, Default, PartialEq)]
pub enum SessionData {
    #[default]
    None,
    WhatsappAndroid {
        group_participant_user_ids: Vec<i64>,
        group_user_id: Option<i64>,
        group_jid_row_id: Option<i64>,
    },
}

/// A conversation: participants plus a name, grouping related message events.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageSession {
    /// Unique per provider.
    pub local_id: String,
    pub provider_name: String,
    pub name: Option<String>,
    pub participants: Vec<Contact>,
    pub provider_data: SessionData,
    /// `device:provider:local`, set by the query layer.
    pub global_id: Option<String>,
}

/// Media referenced by a message event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Media {
    pub mime_type: String,
    /// Provider-specific reference, resolved by `Provider::get_media`.
    pub local_id: String,
}

/// An open media stream, transient per request.
pub struct MediaData {
    pub mime_type: String,
    pub length: u64,
    pub handle: Box<dyn Read + Send>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MessageEvent {
    pub local_id: String,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub provider_name: String,
    /// Added by the query layer.
    pub device_id: Option<String>,
    pub text: Option<String>,
    pub from_me: bool,
    pub sender: Option<Contact>,
    pub session: Option<MessageSession>,
    pub media: Option<Media>,
    pub provider_data: EventData,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaEvent {
    pub local_id: String,
    pub timestamp: DateTime<Utc>,
    pub provider_name: String,
    pub device_id: Option<String>,
    pub mime_type: String,
    pub sender: Option<Contact>,
    pub generic_event_info: Option<GenericEventInfo>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Message(MessageEvent),
    Media(MediaEvent),
}

impl Event {
    /// Discriminator name used by the type filter.
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::Message(_) => "MessageEvent",
            Event::Media(_) => "MediaEvent",
        }
    }

    pub fn local_id(&self) -> &str {
        match self {
            Event::Message(m) => &m.local_id,
            Event::Media(m) => &m.local_id,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Event::Message(m) => m.timestamp,
            Event::Media(m) => m.timestamp,
        }
    }

    pub fn provider_name(&self) -> &str {
        match self {
            Event::Message(m) => &m.provider_name,
            Event::Media(m) => &m.provider_name,
        }
    }

    pub fn device_id(&self) -> Option<&str> {
        match self {
            Event::Message(m) => m.device_id.as_deref(),
            Event::Media(m) => m.device_id.as_deref(),
        }
    }

    pub fn set_device_id(&mut self, device_id: &str) {
        match self {
            Event::Message(m) => m.device_id = Some(device_id.to_owned()),
            Event::Media(m) => m.device_id = Some(device_id.to_owned()),
        }
    }

    pub fn sender(&self) -> Option<&Contact> {
        match self {
            Event::Message(m) => m.sender.as_ref(),
            Event::Media(m) => m.sender.as_ref(),
        }
    }

    pub fn generic_event_info(&self) -> Option<&GenericEventInfo> {
        match self {
            Event::Message(_) => None,
            Event::Media(m) => m.generic_event_info.as_ref(),
        }
    }

    pub fn session(&self) -> Option<&MessageSession> {
        match self {
            Event::Message(m) => m.session.as_ref(),
            Event::Media(_) => None,
        }
    }
}
