//! The provider model: per-application adapters over one device filesystem.

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;

use crate::contact::{Contact, Name};
use crate::errors::RimeError;
use crate::event::{Event, MediaData};
use crate::filesystem::DeviceFilesystem;
use crate::filter::{ContactsFilter, EventsFilter};
use crate::metadata::FsMetadata;
use crate::providers;
use crate::providers::names;
use crate::subset::Subsetter;
use crate::utils::*;

/// What kind of substitution to run over a column during anonymisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnonKind {
    Phone,
    Email,
    Name,
}

pub const PHONE: &[AnonKind] = &[AnonKind::Phone];
pub const EMAIL: &[AnonKind] = &[AnonKind::Email];
pub const NAME: &[AnonKind] = &[AnonKind::Name];
pub const PHONE_NAME: &[AnonKind] = &[AnonKind::Phone, AnonKind::Name];
pub const PHONE_EMAIL_NAME: &[AnonKind] = &[AnonKind::Phone, AnonKind::Email, AnonKind::Name];

/// Declarative PII descriptor, consumed by the anonymiser. Validated when the
/// provider is discovered.
#[derive(Debug, Clone, Default)]
pub struct PiiFields {
    pub sqlite3: Vec<PiiDatabase>,
}

#[derive(Debug, Clone)]
pub struct PiiDatabase {
    pub db_path: &'static str,
    pub tables: Vec<PiiTable>,
}

#[derive(Debug, Clone)]
pub struct PiiTable {
    pub table: &'static str,
    pub columns: Vec<(&'static str, &'static [AnonKind])>,
}

impl PiiFields {
    pub fn validate(&self, provider_name: &str) -> EmptyRes {
        for db in &self.sqlite3 {
            if db.db_path.is_empty() || db.tables.is_empty() {
                bail!(RimeError::AnonymisationFailed(
                    format!("Provider {provider_name} declared malformed PII fields")));
            }
            for table in &db.tables {
                if table.table.is_empty() || table.columns.is_empty()
                    || table.columns.iter().any(|(col, kinds)| col.is_empty() || kinds.is_empty())
                {
                    bail!(RimeError::AnonymisationFailed(
                        format!("Provider {provider_name} declared malformed PII fields for {}", table.table)));
                }
            }
        }
        Ok(())
    }
}

/// Per-device synthetic contacts: the operator, an unknown sender, the device
/// itself, and lazily created per-provider contacts for attributing non-user content.
pub struct DeviceContext {
    pub device_id: String,
    pub operator_contact: Contact,
    pub unknown_contact: Contact,
    pub device_contact: Contact,
    provider_contacts: RefCell<HashMap<String, Contact>>,
}

impl DeviceContext {
    pub fn new(device_id: &str) -> Self {
        let special = |local_id: &str, display: &str| {
            let mut contact = Contact::new(local_id, device_id, "device");
            contact.name = Name::display(display);
            contact
        };
        DeviceContext {
            device_id: device_id.to_owned(),
            operator_contact: special("operator", "Device operator"),
            unknown_contact: special("unknown", "Unknown"),
            device_contact: special("device", "System"),
            provider_contacts: RefCell::new(HashMap::new()),
        }
    }

    pub fn provider_contact(&self, provider_name: &str) -> Contact {
        let mut cache = self.provider_contacts.borrow_mut();
        cache.entry(provider_name.to_owned())
            .or_insert_with(|| {
                let friendly = names::friendly_name_for(provider_name)
                    .map(str::to_owned)
                    .unwrap_or_else(|| provider_name.to_owned());
                let mut contact = Contact::new(provider_name, &self.device_id, provider_name);
                contact.provider_friendly_name = Some(friendly.clone());
                contact.name = Name::display(friendly);
                contact
            })
            .clone()
    }
}

pub trait Provider {
    fn name(&self) -> &'static str;

    fn friendly_name(&self) -> &'static str;

    /// Events matching `filter`, in provider-defined order.
    fn search_events(&self, device: &DeviceContext, filter: &EventsFilter) -> Result<Vec<Event>>;

    /// Contacts matching `filter`.
    fn search_contacts(&self, filter: &ContactsFilter) -> Result<Vec<Contact>>;

    /// Opens the media identified by a provider-specific local id.
    fn get_media(&self, local_id: &str) -> Result<MediaData>;

    /// Writes the retained events/contacts of this provider into a subset device.
    fn subset(&self, subsetter: &Subsetter, events: &[Event], contacts: &[Contact]) -> EmptyRes;

    fn pii_fields(&self) -> PiiFields;
}

/// Instantiates every provider that recognises data on this filesystem.
///
/// A locked filesystem exposes no providers at all; that is how half-built subsets
/// stay hidden until anonymisation completes.
pub fn find_providers(fs: &Arc<dyn DeviceFilesystem>,
                      metadata: &Arc<FsMetadata>) -> Result<HashMap<String, Box<dyn Provider>>> {
    let mut found: HashMap<String, Box<dyn Provider>> = HashMap::new();

    if fs.is_locked() {
        return Ok(found);
    }

    let candidates: Vec<Option<Box<dyn Provider>>> = vec![
        providers::android_whatsapp::AndroidWhatsApp::from_filesystem(fs)?.map(boxed),
        providers::android_telephony::AndroidTelephony::from_filesystem(fs)?.map(boxed),
        providers::android_contacts::AndroidContacts::from_filesystem(fs)?.map(boxed),
        providers::android_generic_media::AndroidGenericMedia::from_filesystem(fs, metadata)?.map(boxed),
        providers::ios_whatsapp::IosWhatsApp::from_filesystem(fs)?.map(boxed),
        providers::imessage::Imessage::from_filesystem(fs)?.map(boxed),
        providers::ios_contacts::IosContacts::from_filesystem(fs)?.map(boxed),
    ];

    for provider in candidates.into_iter().flatten() {
        provider.pii_fields().validate(provider.name())?;
        found.insert(provider.name().to_owned(), provider);
    }
    Ok(found)
}

fn boxed<P: Provider + 'static>(provider: P) -> Box<dyn Provider> {
    Box::new(provider)
}

/// Load-on-first-use contact map for providers that only know contacts by row id.
///
/// On a miss the source may fabricate a "seen by id only" contact; `None` means the
/// id is genuinely unknown.
pub trait LazyContactSource {
    fn contacts_load_all(&self) -> Result<Vec<Contact>>;

    fn contact_unknown(&self, local_id: &str) -> Option<Contact>;
}

#[derive(Default)]
pub struct LazyContacts {
    loaded: RefCell<bool>,
    map: RefCell<HashMap<String, Contact>>,
}

impl LazyContacts {
    pub fn new() -> Self {
        Default::default()
    }

    fn ensure_loaded(&self, source: &dyn LazyContactSource) -> EmptyRes {
        if !*self.loaded.borrow() {
            let mut map = self.map.borrow_mut();
            for contact in source.contacts_load_all()? {
                map.insert(contact.local_id.clone(), contact);
            }
            *self.loaded.borrow_mut() = true;
        }
        Ok(())
    }

    pub fn get(&self, source: &dyn LazyContactSource, local_id: &str) -> Result<Option<Contact>> {
        self.ensure_loaded(source)?;
        if let Some(contact) = self.map.borrow().get(local_id) {
            return Ok(Some(contact.clone()));
        }
        match source.contact_unknown(local_id) {
            Some(contact) => {
                self.map.borrow_mut().insert(local_id.to_owned(), contact.clone());
                Ok(Some(contact))
            }
            None => Ok(None),
        }
    }

    pub fn values(&self, source: &dyn LazyContactSource) -> Result<Vec<Contact>> {
        self.ensure_loaded(source)?;
        Ok(self.map.borrow().values().cloned().collect())
    }
}
