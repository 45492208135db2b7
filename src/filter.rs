//! Query filters. Unset fields act as identity.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::contact::{Contact, GlobalContactId};
use crate::event::Event;

#[derive(Debug, Clone, Default)]
pub struct EventsFilter {
    pub participant_ids: Option<HashSet<GlobalContactId>>,
    /// Inclusive.
    pub timestamp_start: Option<DateTime<Utc>>,
    /// Inclusive.
    pub timestamp_end: Option<DateTime<Utc>>,
    /// Event discriminator names, e.g. `MessageEvent`.
    pub type_names: Option<HashSet<String>>,
    pub provider_names: Option<HashSet<String>>,
    /// Applies to events carrying `GenericEventInfo`.
    pub generic_category: Option<Regex>,
}

impl EventsFilter {
    pub fn empty() -> Self {
        Default::default()
    }

    pub fn accepts_type(&self, type_name: &str) -> bool {
        self.type_names.as_ref().map_or(true, |names| names.contains(type_name))
    }

    pub fn accepts_provider(&self, provider_name: &str) -> bool {
        self.provider_names.as_ref().map_or(true, |names| names.contains(provider_name))
    }

    pub fn matches(&self, event: &Event) -> bool {
        if !self.accepts_type(event.type_name()) {
            return false;
        }

        if !self.accepts_provider(event.provider_name()) {
            return false;
        }

        if let Some(participant_ids) = &self.participant_ids {
            // The sender or any session participant must be in the set.
            let mut event_participants: Vec<GlobalContactId> =
                event.sender().map(GlobalContactId::from_contact).into_iter().collect();
            if let Some(session) = event.session() {
                event_participants.extend(session.participants.iter().map(GlobalContactId::from_contact));
            }
            if !event_participants.iter().any(|p| participant_ids.contains(p)) {
                return false;
            }
        }

        let ts = event.timestamp();
        if self.timestamp_start.is_some_and(|start| ts < start) {
            return false;
        }
        if self.timestamp_end.is_some_and(|end| ts > end) {
            return false;
        }

        if let Some(category_regex) = &self.generic_category {
            if let Some(info) = event.generic_event_info() {
                if !category_regex.is_match(&info.category) {
                    return false;
                }
            }
        }

        true
    }

    pub fn apply(&self, events: Vec<Event>) -> Vec<Event> {
        events.into_iter().filter(|e| self.matches(e)).collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ContactsFilter {
    pub name_regex: Option<Regex>,
}

impl ContactsFilter {
    pub fn empty() -> Self {
        Default::default()
    }

    pub fn matches(&self, contact: &Contact) -> bool {
        self.name_regex.as_ref().map_or(true, |re| re.is_match(&contact.name.full_name()))
    }

    pub fn apply(&self, contacts: Vec<Contact>) -> Vec<Contact> {
        contacts.into_iter().filter(|c| self.matches(c)).collect()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ProvidersFilter {
    pub name_regex: Option<Regex>,
}

impl ProvidersFilter {
    pub fn empty() -> Self {
        Default::default()
    }

    pub fn matches(&self, provider_name: &str) -> bool {
        self.name_regex.as_ref().map_or(true, |re| re.is_match(provider_name))
    }
}

#[cfg(test)]
#[path = "filter_tests.rs"]
mod tests;
