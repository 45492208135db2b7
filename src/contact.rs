//! Contacts and cross-system contact identity.

use std::collections::BTreeSet;

use crate::utils::*;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Name {
    pub first: Option<String>,
    pub last: Option<String>,
    pub display: Option<String>,
}

impl Name {
    pub fn display(s: impl Into<String>) -> Self {
        Name { display: Some(s.into()), ..Default::default() }
    }

    pub fn full_name(&self) -> String {
        match (&self.display, &self.first, &self.last) {
            (Some(display), _, _) => display.clone(),
            (None, Some(first), Some(last)) => format!("{first} {last}"),
            (None, Some(first), None) => first.clone(),
            (None, None, Some(last)) => last.clone(),
            (None, None, None) => String::new(),
        }
    }
}

/// Provider-specific payload that lets a contact be recreated during subsetting.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ContactData {
    #[default]
    None,
    WhatsappAndroid(crate::providers::android_whatsapp::WaContactData),
    AndroidContact {
        contact_row_id: i64,
        raw_contact_row_ids: BTreeSet<i64>,
    },
    ImessageHandle {
        row_id: i64,
    },
    IosWhatsapp(crate::providers::ios_whatsapp::IosWaContactData),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Contact {
    /// Unique within (provider, device) only.
    pub local_id: String,
    pub device_id: String,
    pub provider_name: String,
    pub provider_friendly_name: Option<String>,
    pub name: Name,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub provider_data: ContactData,
}

impl Contact {
    pub fn new(local_id: impl Into<String>, device_id: impl Into<String>,
               provider_name: impl Into<String>) -> Self {
        Contact {
            local_id: local_id.into(),
            device_id: device_id.into(),
            provider_name: provider_name.into(),
            provider_friendly_name: None,
            name: Name::default(),
            phone: None,
            email: None,
            provider_data: ContactData::None,
        }
    }

    pub fn global_id(&self) -> GlobalContactId {
        GlobalContactId::from_contact(self)
    }
}

/// Uniquely identifies a contact across all devices.
///
/// The string form is `device:provider:local`; device and provider ids contain no
/// colons by construction, the local id may.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GlobalContactId {
    pub device_id: String,
    pub provider_name: String,
    pub local_id: String,
}

impl GlobalContactId {
    pub fn from_contact(contact: &Contact) -> Self {
        GlobalContactId {
            device_id: contact.device_id.clone(),
            provider_name: contact.provider_name.clone(),
            local_id: contact.local_id.clone(),
        }
    }

    pub fn from_string(s: &str) -> Result<Self> {
        let mut parts = s.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(device_id), Some(provider_name), Some(local_id)) => Ok(GlobalContactId {
                device_id: device_id.to_owned(),
                provider_name: provider_name.to_owned(),
                local_id: local_id.to_owned(),
            }),
            _ => err!("Malformed global contact id: {s}"),
        }
    }

    pub fn make_global_id_str(contact: &Contact) -> String {
        format!("{}:{}:{}", contact.device_id, contact.provider_name, contact.local_id)
    }
}

impl std::fmt::Display for GlobalContactId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}:{}", self.device_id, self.provider_name, self.local_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_id_round_trips() {
        let mut contact = Contact::new("7-jid@s.whatsapp.net", "my-phone", "android-com.whatsapp.android");
        contact.name = Name::display("Somebody");
        let s = GlobalContactId::make_global_id_str(&contact);
        assert_eq!(GlobalContactId::from_string(&s).unwrap(), contact.global_id());
    }

    #[test]
    fn global_id_local_part_may_contain_colons() {
        let id = GlobalContactId::from_string("dev:prov:a:b:c").unwrap();
        assert_eq!(id.device_id, "dev");
        assert_eq!(id.provider_name, "prov");
        assert_eq!(id.local_id, "a:b:c");
    }

    #[test]
    fn full_name_prefers_display() {
        let name = Name {
            first: Some("Ada".to_owned()),
            last: Some("Lovelace".to_owned()),
            display: Some("Ada L".to_owned()),
        };
        assert_eq!(name.full_name(), "Ada L");
        let name = Name { display: None, ..name };
        assert_eq!(name.full_name(), "Ada Lovelace");
    }
}
