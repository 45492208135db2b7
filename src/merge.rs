//! Cross-provider contact merging.
//!
//! Contacts from every device are grouped by canonical (E.164) phone number; each
//! group becomes one `MergedContact` with a stable id derived from its members.

use std::collections::HashMap;

use lazy_static::lazy_static;
use regex::Regex;
use sha2::{Digest, Sha256};

use crate::contact::{Contact, Name};
use crate::utils::*;

lazy_static! {
    static ref NON_DIAL_CHARS: Regex = Regex::new(r"[\s().-]").unwrap();
    static ref DIGITS: Regex = Regex::new(r"^[0-9]{6,15}$").unwrap();
}

// Dialling prefixes for the country codes devices are expected to report. The device
// country code only matters for numbers written in national format.
const DIAL_CODES: &[(&str, &str)] = &[
    ("GB", "44"),
    ("US", "1"),
    ("IE", "353"),
    ("FR", "33"),
    ("DE", "49"),
    ("ES", "34"),
    ("IT", "39"),
    ("NL", "31"),
    ("AU", "61"),
    ("NZ", "64"),
    ("IN", "91"),
];

/// Returns the E.164 form of `raw` relative to `country_code` (alpha-2), or `None`
/// when the input is not recognisably a phone number.
pub fn canonicalise_phone(raw: &str, country_code: &str) -> Option<String> {
    let cleaned = NON_DIAL_CHARS.replace_all(raw.trim(), "").into_owned();

    if let Some(rest) = cleaned.strip_prefix('+') {
        return DIGITS.is_match(rest).then(|| format!("+{rest}"));
    }
    // 00 is the international call prefix in most numbering plans.
    if let Some(rest) = cleaned.strip_prefix("00") {
        if DIGITS.is_match(rest) {
            return Some(format!("+{rest}"));
        }
    }
    if !DIGITS.is_match(&cleaned) {
        return None;
    }

    let dial_code = DIAL_CODES.iter()
        .find(|(cc, _)| *cc == country_code)
        .map(|(_, dial)| *dial)?;

    match cleaned.strip_prefix('0') {
        // National format: replace the trunk prefix with the country code.
        Some(national) if !national.is_empty() => Some(format!("+{dial_code}{national}")),
        // No trunk prefix: assume the number is already fully qualified nationally.
        _ => Some(format!("+{dial_code}{cleaned}")),
    }
}

#[derive(Debug, Clone)]
pub struct MergedContact {
    /// SHA-256 over the member (device, provider, local) triples, stable across runs.
    pub local_id: String,
    pub contacts: Vec<Contact>,
    pub name: Option<Name>,
    pub phone: Option<String>,
    pub email: Option<String>,
}

fn hash_contact_ids(contacts: &[Contact]) -> String {
    let mut hasher = Sha256::new();
    for contact in contacts {
        hasher.update(contact.local_id.as_bytes());
        hasher.update(contact.device_id.as_bytes());
        hasher.update(contact.provider_name.as_bytes());
    }
    to_hex(&hasher.finalize())
}

fn merged_from_group(phone: Option<String>, contacts: Vec<Contact>) -> MergedContact {
    // Take the longest display name and the longest email among members.
    let name = contacts.iter()
        .map(|c| &c.name)
        .max_by_key(|name| name.full_name().len())
        .filter(|name| !name.full_name().is_empty())
        .cloned();
    let email = contacts.iter()
        .filter_map(|c| c.email.as_ref())
        .max_by_key(|email| email.len())
        .cloned();

    MergedContact {
        local_id: hash_contact_ids(&contacts),
        phone: phone.or_else(|| contacts[0].phone.clone()),
        email,
        name,
        contacts,
    }
}

/// Merges contacts that share a canonical phone number. Every input contact is
/// accounted for: contacts with no parseable phone become singleton merged contacts.
/// Grouping preserves first-seen order so merged ids are stable for a given input.
pub fn merge_contacts<F>(contacts: Vec<Contact>, country_code_for_device: F) -> Vec<MergedContact>
    where F: Fn(&str) -> String
{
    let mut groups: Vec<(String, Vec<Contact>)> = vec![];
    let mut group_index: HashMap<String, usize> = HashMap::new();
    let mut unmergeable: Vec<MergedContact> = vec![];

    for contact in contacts {
        let canonical = contact.phone.as_ref()
            .and_then(|phone| canonicalise_phone(phone, &country_code_for_device(&contact.device_id)));

        match canonical {
            Some(number) => {
                let idx = *group_index.entry(number.clone()).or_insert_with(|| {
                    groups.push((number, vec![]));
                    groups.len() - 1
                });
                groups[idx].1.push(contact);
            }
            None => unmergeable.push(merged_from_group(None, vec![contact])),
        }
    }

    let mut merged: Vec<MergedContact> = groups.into_iter()
        .map(|(number, members)| merged_from_group(Some(number), members))
        .collect();
    merged.extend(unmergeable);
    merged
}

#[cfg(test)]
#[path = "merge_tests.rs"]
mod tests;
