use std::sync::Arc;

use chrono::{TimeZone, Utc};
use pretty_assertions::assert_eq;

use super::*;
use crate::filesystem::android::AndroidDeviceFilesystem;
use crate::provider::Provider;
use crate::utils::test_utils::*;

fn fixture_fs(dir: &std::path::Path) -> Arc<dyn DeviceFilesystem> {
    let root = android_backup(dir);
    telephony_fixture(&root);
    Arc::new(AndroidDeviceFilesystem::new("phone-a", &root).unwrap())
}

#[test]
fn sms_events_map_type_to_direction() {
    let dir = tempfile::tempdir().unwrap();
    let provider = AndroidTelephony::from_filesystem(&fixture_fs(dir.path())).unwrap().unwrap();

    let events = provider
        .search_events(&DeviceContext::new("phone-a"), &EventsFilter::empty()).unwrap();
    assert_eq!(events.len(), 2);

    let Event::Message(inbound) = &events[0] else { panic!() };
    assert!(!inbound.from_me);
    assert_eq!(inbound.text.as_deref(), Some("on my way"));
    assert_eq!(inbound.timestamp, Utc.timestamp_millis_opt(1000).unwrap());
    assert_eq!(inbound.sender.as_ref().unwrap().phone.as_deref(), Some("+447700900123"));

    let Event::Message(outbound) = &events[1] else { panic!() };
    assert!(outbound.from_me);

    // Both messages share one session keyed by the thread.
    assert_eq!(inbound.session.as_ref().unwrap().local_id, "1");
    assert_eq!(outbound.session.as_ref().unwrap().local_id, "1");
}

#[test]
fn contacts_come_from_canonical_addresses() {
    let dir = tempfile::tempdir().unwrap();
    let provider = AndroidTelephony::from_filesystem(&fixture_fs(dir.path())).unwrap().unwrap();

    let contacts = provider.search_contacts(&ContactsFilter::empty()).unwrap();
    assert_eq!(contacts.len(), 1);
    assert_eq!(contacts[0].local_id, "1");
    assert_eq!(contacts[0].phone.as_deref(), Some("+447700900123"));
}

#[test]
fn subset_retains_messages_threads_and_addresses() {
    let dir = tempfile::tempdir().unwrap();
    let fs = fixture_fs(dir.path());
    let provider = AndroidTelephony::from_filesystem(&fs).unwrap().unwrap();

    let device = DeviceContext::new("phone-a");
    let events = provider.search_events(&device, &EventsFilter::empty()).unwrap();
    let contacts = provider.search_contacts(&ContactsFilter::empty()).unwrap();

    let dest: Arc<dyn DeviceFilesystem> = Arc::new(
        AndroidDeviceFilesystem::create("subset", &dir.path().join("subset"), None).unwrap());
    provider.subset(&crate::subset::Subsetter::new(Arc::clone(&dest)), &events, &contacts).unwrap();

    let conn = dest.sqlite3_connect(MMSSMS_DB, true).unwrap();
    let sms: i64 = conn.query_row("SELECT COUNT(*) FROM sms", [], |r| r.get(0)).unwrap();
    let threads: i64 = conn.query_row("SELECT COUNT(*) FROM threads", [], |r| r.get(0)).unwrap();
    let addresses: i64 = conn.query_row(
        "SELECT COUNT(*) FROM canonical_addresses", [], |r| r.get(0)).unwrap();
    assert_eq!((sms, threads, addresses), (2, 1, 1));

    // The subset parses again with the same provider code.
    let reopened = AndroidTelephony::from_filesystem(&dest).unwrap().unwrap();
    let reopened_events = reopened.search_events(&device, &EventsFilter::empty()).unwrap();
    assert_eq!(reopened_events.len(), 2);
}
