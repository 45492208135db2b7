use pretty_assertions::assert_eq;

use super::*;
use crate::contact::Contact;

fn contact(device: &str, provider: &str, local: &str, phone: Option<&str>,
           display: Option<&str>, email: Option<&str>) -> Contact {
    let mut contact = Contact::new(local, device, provider);
    contact.phone = phone.map(str::to_owned);
    contact.email = email.map(str::to_owned);
    if let Some(display) = display {
        contact.name = Name::display(display);
    }
    contact
}

#[test]
fn canonicalises_national_and_international_forms() {
    assert_eq!(canonicalise_phone("07700 900123", "GB"), Some("+447700900123".to_owned()));
    assert_eq!(canonicalise_phone("+44 7700 900123", "GB"), Some("+447700900123".to_owned()));
    assert_eq!(canonicalise_phone("+447700900123", "US"), Some("+447700900123".to_owned()));
    assert_eq!(canonicalise_phone("00447700900123", "GB"), Some("+447700900123".to_owned()));
    assert_eq!(canonicalise_phone("(555) 010-4477", "US"), Some("+15550104477".to_owned()));
    assert_eq!(canonicalise_phone("not a number", "GB"), None);
    assert_eq!(canonicalise_phone("12", "GB"), None);
}

#[test]
fn contacts_sharing_a_number_are_merged_across_devices() {
    // S3: two devices, same number in different formats.
    let contacts = vec![
        contact("phone-a", "android-com.whatsapp.android", "447700900123@s.whatsapp.net",
                Some("07700 900123"), Some("Alice"), None),
        contact("phone-b", "android-com.whatsapp.android", "447700900123@s.whatsapp.net",
                Some("+44 7700 900123"), Some("Alice Example"), Some("alice@example.org")),
    ];

    let merged = merge_contacts(contacts, |_| "GB".to_owned());
    assert_eq!(merged.len(), 1);
    assert_eq!(merged[0].phone.as_deref(), Some("+447700900123"));
    assert_eq!(merged[0].contacts.len(), 2);
    // Longest display name and email win.
    assert_eq!(merged[0].name.as_ref().unwrap().full_name(), "Alice Example");
    assert_eq!(merged[0].email.as_deref(), Some("alice@example.org"));
}

#[test]
fn unparseable_phones_become_singletons() {
    let contacts = vec![
        contact("dev", "p", "1", Some("what"), Some("A"), None),
        contact("dev", "p", "2", None, Some("B"), None),
    ];
    let merged = merge_contacts(contacts, |_| "GB".to_owned());
    assert_eq!(merged.len(), 2);
    assert!(merged.iter().all(|m| m.contacts.len() == 1));
}

#[test]
fn merged_id_is_stable_and_hex() {
    let make = || vec![
        contact("dev-a", "p", "1", Some("07700 900123"), None, None),
        contact("dev-b", "p", "2", Some("+447700900123"), None, None),
    ];
    let merged_1 = merge_contacts(make(), |_| "GB".to_owned());
    let merged_2 = merge_contacts(make(), |_| "GB".to_owned());
    assert_eq!(merged_1[0].local_id, merged_2[0].local_id);
    assert_eq!(merged_1[0].local_id.len(), 64);
    assert!(merged_1[0].local_id.chars().all(|c| c.is_ascii_hexdigit()));
}

#[test]
fn every_input_contact_is_accounted_for() {
    let contacts = vec![
        contact("a", "p", "1", Some("07700 900123"), None, None),
        contact("b", "p", "2", Some("+447700900123"), None, None),
        contact("c", "p", "3", Some("garbage"), None, None),
        contact("d", "p", "4", None, None, None),
    ];
    let merged = merge_contacts(contacts, |_| "GB".to_owned());
    let total: usize = merged.iter().map(|m| m.contacts.len()).sum();
    assert_eq!(total, 4);
}
