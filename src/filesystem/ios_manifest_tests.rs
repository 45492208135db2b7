use pretty_assertions::assert_eq;

use super::*;
use crate::sql;
use crate::utils::test_utils::*;

fn manifest_for(dir: &std::path::Path) -> IosManifest {
    let root = ios_backup(dir);
    IosManifest::new(sql::sqlite3_connect(&root.join("Manifest.db")).unwrap())
}

#[test]
fn hashed_pathname_prefers_the_manifest_row() {
    let dir = tempfile::tempdir().unwrap();
    let root = ios_backup(dir.path());
    let conn = sql::sqlite3_connect(&root.join("Manifest.db")).unwrap();
    conn.execute(
        "INSERT INTO Files (fileID, domain, relativePath, flags) VALUES (?1, ?2, ?3, 1)",
        ["abcdef0123456789abcdef0123456789abcdef01", "HomeDomain", "Library/SMS/sms.db"],
    ).unwrap();

    let manifest = IosManifest::new(conn);
    assert_eq!(
        manifest.get_hashed_pathname("HomeDomain/Library/SMS/sms.db").unwrap(),
        "ab/abcdef0123456789abcdef0123456789abcdef01");
}

#[test]
fn hashed_pathname_falls_back_to_sha1() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = manifest_for(dir.path());

    // h = sha1("HomeDomain-Library/SMS/sms.db"); on-disk location is h[0:2]/h.
    let h = super::ios_hash("HomeDomain", "Library/SMS/sms.db");
    assert_eq!(
        manifest.get_hashed_pathname("HomeDomain/Library/SMS/sms.db").unwrap(),
        format!("{}/{h}", &h[..2]));
}

#[test]
fn add_file_is_idempotent_but_rejects_collisions() {
    let dir = tempfile::tempdir().unwrap();
    let manifest = manifest_for(dir.path());

    manifest.add_file("HomeDomain/Library/SMS/sms.db").unwrap();
    // Same path again: fine, still one entry.
    manifest.add_file("HomeDomain/Library/SMS/sms.db").unwrap();

    let hashed = manifest.get_hashed_pathname("HomeDomain/Library/SMS/sms.db").unwrap();
    assert_eq!(hashed, {
        let h = super::ios_hash("HomeDomain", "Library/SMS/sms.db");
        format!("{}/{h}", &h[..2])
    });
}

#[test]
fn add_file_collision_with_different_path_fails() {
    let dir = tempfile::tempdir().unwrap();
    let root = ios_backup(dir.path());
    let conn = sql::sqlite3_connect(&root.join("Manifest.db")).unwrap();

    // Plant a row whose fileID equals the hash of the path we'll add, but which
    // maps to a different logical path.
    let h = super::ios_hash("HomeDomain", "Library/SMS/sms.db");
    conn.execute(
        "INSERT INTO Files (fileID, domain, relativePath, flags) VALUES (?1, 'OtherDomain', 'other', 1)",
        [h],
    ).unwrap();

    let manifest = IosManifest::new(conn);
    let err = manifest.add_file("HomeDomain/Library/SMS/sms.db").unwrap_err();
    assert!(matches!(err.downcast_ref::<crate::errors::RimeError>(),
                     Some(crate::errors::RimeError::FileExists(_))));
}

#[test]
fn scandir_reads_stat_metadata_from_file_blobs() {
    let dir = tempfile::tempdir().unwrap();
    let root = ios_backup(dir.path());
    let conn = sql::sqlite3_connect(&root.join("Manifest.db")).unwrap();

    // A file blob in the NSKeyedArchiver shape the backups use: $objects[1] is the
    // metadata dictionary.
    let mut blob = vec![];
    let mut objects = plist::Dictionary::new();
    objects.insert("$objects".to_owned(), plist::Value::Array(vec![
        plist::Value::String("$null".to_owned()),
        plist::Value::Dictionary({
            let mut meta = plist::Dictionary::new();
            meta.insert("Mode".to_owned(), plist::Value::Integer(0o100644u64.into()));
            meta.insert("Size".to_owned(), plist::Value::Integer(1234u64.into()));
            meta.insert("LastModified".to_owned(), plist::Value::Integer(1_700_000_000u64.into()));
            meta.insert("Birth".to_owned(), plist::Value::Integer(1_600_000_000u64.into()));
            meta
        }),
    ]));
    plist::Value::Dictionary(objects).to_writer_binary(&mut blob).unwrap();

    conn.execute(
        "INSERT INTO Files (fileID, domain, relativePath, flags, file) VALUES
         ('ff00', 'CameraRollDomain', 'Media/DCIM/IMG_0001.JPG', 1, ?1)",
        [blob],
    ).unwrap();

    let manifest = IosManifest::new(conn);
    let entries = manifest.scandir("CameraRollDomain/Media/DCIM").unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "IMG_0001.JPG");
    assert_eq!(entries[0].path, "CameraRollDomain/Media/DCIM/IMG_0001.JPG");
    assert_eq!(entries[0].size, 1234);
    assert!(entries[0].is_file());
    assert_eq!(entries[0].modified.unwrap().timestamp(), 1_700_000_000);
    assert_eq!(entries[0].created.unwrap().timestamp(), 1_600_000_000);

    // Files in deeper directories are not direct children.
    assert_eq!(manifest.scandir("CameraRollDomain/Media").unwrap().len(), 0);
}
