use pretty_assertions::assert_eq;

use super::*;
use crate::filesystem::registry::identify_filesystem;
use crate::utils::test_utils::*;

#[test]
fn detects_loose_android_trees() {
    let dir = tempfile::tempdir().unwrap();
    assert!(!AndroidDeviceFilesystem::is_device_filesystem(dir.path()));

    let root = android_backup(dir.path());
    assert!(AndroidDeviceFilesystem::is_device_filesystem(&root));
    assert_eq!(identify_filesystem(&root), Some(FilesystemKind::Android));
}

#[test]
fn create_refuses_existing_path_and_marks_subset() {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("subset-1");

    let fs = AndroidDeviceFilesystem::create("subset-1", &root, None).unwrap();
    assert!(fs.is_subset_filesystem());
    assert!(AndroidDeviceFilesystem::is_device_filesystem(&root));

    let err = AndroidDeviceFilesystem::create("subset-1", &root, None).unwrap_err();
    assert!(matches!(err.downcast_ref::<crate::errors::RimeError>(),
                     Some(crate::errors::RimeError::FileExists(_))));
}

#[test]
fn lock_state_survives_reopening() {
    let dir = tempfile::tempdir().unwrap();
    let root = android_backup(dir.path());

    let fs = AndroidDeviceFilesystem::new("dev", &root).unwrap();
    assert!(!fs.is_locked());
    fs.lock(true).unwrap();
    drop(fs);

    let fs = AndroidDeviceFilesystem::new("dev", &root).unwrap();
    assert!(fs.is_locked());
    fs.lock(false).unwrap();
    assert!(!fs.is_locked());
}

#[test]
fn file_access_goes_through_virtual_paths() {
    let dir = tempfile::tempdir().unwrap();
    let root = android_backup(dir.path());
    create_named_file(&root.join("sdcard/notes.txt"), b"hello");

    let fs = AndroidDeviceFilesystem::new("dev", &root).unwrap();
    assert!(fs.exists("/sdcard/notes.txt"));
    assert!(!fs.exists("/sdcard/missing.txt"));
    assert_eq!(fs.getsize("/sdcard/notes.txt").unwrap(), 5);

    let mut content = String::new();
    fs.open("/sdcard/notes.txt").unwrap().read_to_string(&mut content).unwrap();
    assert_eq!(content, "hello");

    let entries = fs.scandir("/sdcard").unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].name, "notes.txt");
    assert_eq!(entries[0].path, "/sdcard/notes.txt");
    assert!(entries[0].is_file());
}

#[test]
fn walk_yields_files_below_a_directory() {
    let dir = tempfile::tempdir().unwrap();
    let root = android_backup(dir.path());
    create_named_file(&root.join("sdcard/DCIM/Camera/a.jpg"), b"a");
    create_named_file(&root.join("sdcard/DCIM/Camera/b.jpg"), b"b");
    create_named_file(&root.join("sdcard/notes.txt"), b"n");

    let fs = AndroidDeviceFilesystem::new("dev", &root).unwrap();
    let mut paths: Vec<String> = crate::filesystem::walk(&fs, "/sdcard")
        .map(|entry| entry.path)
        .collect();
    paths.sort();
    assert_eq!(paths, vec![
        "/sdcard/DCIM/Camera/a.jpg".to_owned(),
        "/sdcard/DCIM/Camera/b.jpg".to_owned(),
        "/sdcard/notes.txt".to_owned(),
    ]);
}

mod zipped {
    use super::*;
    use pretty_assertions::assert_eq;

    fn zipped_backup(dir: &std::path::Path) -> std::path::PathBuf {
        let src = android_backup(&dir.join("phone"));
        whatsapp_fixture(&src);
        // Settings shipped inside the archive.
        DeviceSettings::new(&src).unwrap().set_locked(false).unwrap();
        let zip_path = dir.join("phone.zip");
        zip_directory(&src, &zip_path);
        zip_path
    }

    #[test]
    fn detects_zipped_android_trees() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = zipped_backup(dir.path());
        assert!(AndroidZippedDeviceFilesystem::is_device_filesystem(&zip_path));
        assert_eq!(identify_filesystem(&zip_path), Some(FilesystemKind::AndroidZipped));
        assert!(!AndroidDeviceFilesystem::is_device_filesystem(&zip_path));
    }

    #[test]
    fn rejects_zip_without_single_top_level_directory() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("bad.zip");
        let mut zip = zip::ZipWriter::new(std::fs::File::create(&zip_path).unwrap());
        zip.start_file("a/data/data/android/x", zip::write::FileOptions::default()).unwrap();
        zip.start_file("b/file", zip::write::FileOptions::default()).unwrap();
        zip.finish().unwrap();
        assert!(!AndroidZippedDeviceFilesystem::is_device_filesystem(&zip_path));
    }

    #[test]
    fn reads_files_and_databases_lazily() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = zipped_backup(dir.path());
        let fs = AndroidZippedDeviceFilesystem::new("phone", &zip_path).unwrap();

        assert!(fs.exists("data/data/com.whatsapp/databases/msgstore.db"));
        assert!(fs.exists("/sdcard/WhatsApp/Media/WhatsApp Images/IMG-1.jpg"));
        assert!(!fs.exists("/nope"));

        let conn = fs.sqlite3_connect("data/data/com.whatsapp/databases/msgstore.db", true).unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM message", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 4);

        let mut content = vec![];
        fs.open("/sdcard/WhatsApp/Media/WhatsApp Images/IMG-1.jpg").unwrap()
            .read_to_end(&mut content).unwrap();
        assert!(content.starts_with(b"\xff\xd8\xff\xe0"));
    }

    #[test]
    fn zipped_filesystems_refuse_writes() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = zipped_backup(dir.path());
        let fs = AndroidZippedDeviceFilesystem::new("phone", &zip_path).unwrap();

        assert!(fs.create_file("/sdcard/new.txt").is_err());
        assert!(fs.sqlite3_create("data/new.db").is_err());
    }

    #[test]
    fn scandir_lists_direct_children() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = zipped_backup(dir.path());
        let fs = AndroidZippedDeviceFilesystem::new("phone", &zip_path).unwrap();

        let entries = fs.scandir("/sdcard/WhatsApp").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "Media");
        assert!(entries[0].is_dir());
    }
}
