use pretty_assertions::assert_eq;

use super::*;
use crate::filesystem::registry::identify_filesystem;
use crate::filesystem::FilesystemKind;
use crate::utils::test_utils::*;

#[test]
fn detects_loose_ios_backups() {
    let dir = tempfile::tempdir().unwrap();
    assert!(!IosDeviceFilesystem::is_device_filesystem(dir.path()));

    let root = ios_backup(dir.path());
    assert!(IosDeviceFilesystem::is_device_filesystem(&root));
    assert_eq!(identify_filesystem(&root), Some(FilesystemKind::Ios));
}

#[test]
fn encrypted_flag_routes_detection_to_the_encrypted_variant() {
    let dir = tempfile::tempdir().unwrap();
    let root = ios_backup(dir.path());

    let mut manifest = plist::Dictionary::new();
    manifest.insert("IsEncrypted".to_owned(), plist::Value::Boolean(true));
    plist::Value::Dictionary(manifest)
        .to_file_xml(root.join("Manifest.plist")).unwrap();

    assert!(!IosDeviceFilesystem::is_device_filesystem(&root));
    assert!(super::super::ios_encrypted::IosEncryptedDeviceFilesystem::is_device_filesystem(&root));
    assert_eq!(identify_filesystem(&root), Some(FilesystemKind::IosEncrypted));
}

#[test]
fn files_are_reached_through_the_manifest() {
    let dir = tempfile::tempdir().unwrap();
    let root = ios_backup(dir.path());
    imessage_fixture(&root);

    let fs = IosDeviceFilesystem::new("iphone", &root).unwrap();
    assert!(fs.exists("HomeDomain/Library/SMS/sms.db"));
    assert!(!fs.exists("HomeDomain/Library/SMS/other.db"));

    let conn = fs.sqlite3_connect("HomeDomain/Library/SMS/sms.db", true).unwrap();
    let count: i64 = conn.query_row("SELECT COUNT(*) FROM message", [], |r| r.get(0)).unwrap();
    assert_eq!(count, 2);
}

#[test]
fn sqlite3_create_registers_the_manifest_entry() {
    let dir = tempfile::tempdir().unwrap();
    let root = ios_backup(dir.path());
    let fs = IosDeviceFilesystem::new("iphone", &root).unwrap();

    let conn = fs.sqlite3_create("HomeDomain/Library/Notes/notes.db").unwrap();
    conn.execute("CREATE TABLE n (x INTEGER)", []).unwrap();
    drop(conn);

    // The file landed at its hashed location and is now visible.
    let h = ios_hash("HomeDomain", "Library/Notes/notes.db");
    assert!(root.join(&h[..2]).join(&h).exists());
    assert!(fs.exists("HomeDomain/Library/Notes/notes.db"));
}

#[test]
fn create_copies_info_plist_from_the_template() {
    let dir = tempfile::tempdir().unwrap();
    let template_root = ios_backup(&dir.path().join("src"));
    create_named_file(&template_root.join("Info.plist"), b"template-info");
    let template = IosDeviceFilesystem::new("iphone", &template_root).unwrap();

    let subset = IosDeviceFilesystem::create(
        "subset-1", &dir.path().join("subset-1"), Some(&template)).unwrap();
    assert!(subset.is_subset_filesystem());

    let content = std::fs::read(dir.path().join("subset-1/Info.plist")).unwrap();
    assert_eq!(content, b"template-info");
    // The fresh layout is recognised as an iOS backup right away.
    assert_eq!(identify_filesystem(&dir.path().join("subset-1")), Some(FilesystemKind::Ios));
}

mod zipped {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn zipped_backups_are_detected_and_readable() {
        let dir = tempfile::tempdir().unwrap();
        let root = ios_backup(&dir.path().join("iphone"));
        imessage_fixture(&root);
        crate::filesystem::DeviceSettings::new(&root).unwrap().set_locked(false).unwrap();

        let zip_path = dir.path().join("iphone.zip");
        zip_directory(&root, &zip_path);

        assert!(IosZippedDeviceFilesystem::is_device_filesystem(&zip_path));
        assert_eq!(identify_filesystem(&zip_path), Some(FilesystemKind::IosZipped));

        let fs = IosZippedDeviceFilesystem::new("iphone", &zip_path).unwrap();
        assert!(fs.exists("HomeDomain/Library/SMS/sms.db"));
        let conn = fs.sqlite3_connect("HomeDomain/Library/SMS/sms.db", true).unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM handle", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);

        // No write access of any kind.
        assert!(fs.sqlite3_create("HomeDomain/Library/Notes/notes.db").is_err());
        assert!(fs.create_file("HomeDomain/foo").is_err());
    }
}
