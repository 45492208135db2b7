//! Catch-all media provider: walks `/sdcard` and yields an event for every image or
//! video not claimed by a dedicated provider, classified by where it was found.

use std::sync::Arc;

use crate::contact::Contact;
use crate::event::{Event, GenericEventInfo, MediaData, MediaEvent};
use crate::filesystem::{self, DeviceFilesystem};
use crate::filter::{ContactsFilter, EventsFilter};
use crate::metadata::FsMetadata;
use crate::provider::{DeviceContext, PiiFields, Provider};
use crate::providers::names;
use crate::subset::Subsetter;
use crate::utils::*;

const SDCARD: &str = "/sdcard";

struct PrefixProviderInfo {
    prefix: &'static str,
    provider_name: &'static str,
    is_user_content: bool,
}

/// Known locations and the applications that write them. Paths outside this table
/// are treated as user content of unknown origin.
const PREFIX_TO_PROVIDER: &[PrefixProviderInfo] = &[
    PrefixProviderInfo {
        prefix: "/sdcard/Android/data/com.hmdglobal.camera2/",
        provider_name: names::ANDROID_CAMERA2_HMDGLOBAL,
        is_user_content: false,
    },
    PrefixProviderInfo {
        prefix: "/sdcard/DCIM/Camera/",
        provider_name: names::ANDROID_CAMERA,
        is_user_content: true,
    },
    PrefixProviderInfo {
        prefix: "/sdcard/WhatsApp/Media/",
        provider_name: names::ANDROID_WHATSAPP,
        is_user_content: true,
    },
    PrefixProviderInfo {
        prefix: "/sdcard/com.whatsapp/files/",
        provider_name: names::ANDROID_WHATSAPP,
        is_user_content: false,
    },
];

fn guess_provider_for_category(category: &str) -> Option<&'static PrefixProviderInfo> {
    PREFIX_TO_PROVIDER.iter().find(|info| category.starts_with(info.prefix.trim_end_matches('/')))
}

pub struct AndroidGenericMedia {
    fs: Arc<dyn DeviceFilesystem>,
    metadata: Arc<FsMetadata>,
}

impl AndroidGenericMedia {
    pub fn from_filesystem(fs: &Arc<dyn DeviceFilesystem>,
                           metadata: &Arc<FsMetadata>) -> Result<Option<Self>> {
        // Only meaningful where an sdcard tree exists.
        if !fs.exists(SDCARD) {
            return Ok(None);
        }
        Ok(Some(AndroidGenericMedia {
            fs: Arc::clone(fs),
            metadata: Arc::clone(metadata),
        }))
    }
}

impl Provider for AndroidGenericMedia {
    fn name(&self) -> &'static str {
        names::ANDROID_GENERIC_MEDIA
    }

    fn friendly_name(&self) -> &'static str {
        names::ANDROID_GENERIC_MEDIA_FRIENDLY
    }

    fn search_events(&self, device: &DeviceContext, filter: &EventsFilter) -> Result<Vec<Event>> {
        if !filter.accepts_type("MediaEvent") {
            return Ok(vec![]);
        }

        let mut events = vec![];
        for entry in filesystem::walk(self.fs.as_ref(), SDCARD) {
            let Some(metadata) = self.metadata.get(self.fs.as_ref(), &entry) else { continue };
            let Some(mime_type) = metadata.mime_type else { continue };
            if !mime_type.starts_with("image/") && !mime_type.starts_with("video/") {
                continue;
            }

            let category = self.fs.dirname(&entry.path);

            // Attribute content either to the application that definitively wrote
            // it, or to the unknown contact for user/unrecognised content.
            let (sender, is_user_generated): (Contact, bool) =
                match guess_provider_for_category(&category) {
                    Some(info) if !info.is_user_content =>
                        (device.provider_contact(info.provider_name), false),
                    _ => (device.unknown_contact.clone(), true),
                };

            events.push(Event::Media(MediaEvent {
                local_id: entry.path.clone(),
                timestamp: entry.timestamp(),
                provider_name: names::ANDROID_GENERIC_MEDIA.to_owned(),
                device_id: None,
                mime_type,
                sender: Some(sender),
                generic_event_info: Some(GenericEventInfo { category, is_user_generated }),
            }));
        }

        Ok(events)
    }

    fn search_contacts(&self, _filter: &ContactsFilter) -> Result<Vec<Contact>> {
        Ok(vec![])
    }

    fn get_media(&self, local_id: &str) -> Result<MediaData> {
        let entry = self.fs.path_to_direntry(local_id)?;
        let metadata = self.metadata.get(self.fs.as_ref(), &entry)
            .with_context(|| format!("No metadata for {local_id}"))?;

        Ok(MediaData {
            mime_type: metadata.mime_type.unwrap_or_else(|| "application/octet-stream".to_owned()),
            length: entry.size,
            handle: self.fs.open(local_id)?,
        })
    }

    fn subset(&self, subsetter: &Subsetter, events: &[Event], _contacts: &[Contact]) -> EmptyRes {
        for event in events {
            let Event::Media(media) = event else { continue };
            if media.provider_name != names::ANDROID_GENERIC_MEDIA {
                continue;
            }
            subsetter.copy_file(self.fs.open(&media.local_id)?, &media.local_id)?;
        }
        Ok(())
    }

    fn pii_fields(&self) -> PiiFields {
        // File content is copied verbatim; there are no databases to rewrite.
        PiiFields::default()
    }
}
