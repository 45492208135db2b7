use std::sync::Arc;

use pretty_assertions::assert_eq;
use rusqlite::Connection;

use super::*;
use crate::filesystem::android::AndroidDeviceFilesystem;
use crate::utils::test_utils::*;

fn source_db(dir: &std::path::Path) -> Connection {
    let conn = crate::sql::sqlite3_connect(&dir.join("src.db")).unwrap();
    conn.execute_batch(r#"
        CREATE TABLE people (_id INTEGER PRIMARY KEY, name TEXT COLLATE NOCASE, age INTEGER);
        CREATE TABLE kinds (_id INTEGER PRIMARY KEY, kind TEXT);
        INSERT INTO people VALUES (1, 'Alice', 40);
        INSERT INTO people VALUES (2, 'Bob', 41);
        INSERT INTO people VALUES (3, 'Carol', 42);
        INSERT INTO kinds VALUES (1, 'adult');
    "#).unwrap();
    conn
}

fn dest_fs(dir: &std::path::Path) -> Arc<dyn crate::filesystem::DeviceFilesystem> {
    Arc::new(AndroidDeviceFilesystem::create("subset", &dir.join("subset"), None).unwrap())
}

fn column_names(conn: &Connection, table: &str) -> Vec<String> {
    conn.prepare(&format!("SELECT name FROM pragma_table_info('{table}')")).unwrap()
        .query_map([], |row| row.get(0)).unwrap()
        .collect::<Result<_, _>>().unwrap()
}

#[test]
fn copies_only_selected_rows() {
    let dir = tempfile::tempdir().unwrap();
    let src = source_db(dir.path());
    let subsetter = Subsetter::new(dest_fs(dir.path()));

    let mut rows = subsetter.row_subset("people", "_id");
    rows.add(1i64);
    rows.add(3i64);
    subsetter.create_db_and_copy_rows(&src, "data/out.db", &[&rows as &dyn TableCopy]).unwrap();

    let dst = crate::sql::sqlite3_connect(&dir.path().join("subset/data/out.db")).unwrap();
    let names: Vec<String> = dst.prepare("SELECT name FROM people ORDER BY _id").unwrap()
        .query_map([], |row| row.get(0)).unwrap()
        .collect::<Result<_, _>>().unwrap();
    assert_eq!(names, vec!["Alice".to_owned(), "Carol".to_owned()]);
}

#[test]
fn complete_table_copies_everything() {
    let dir = tempfile::tempdir().unwrap();
    let src = source_db(dir.path());
    let subsetter = Subsetter::new(dest_fs(dir.path()));

    let kinds = subsetter.complete_table("kinds");
    subsetter.create_db_and_copy_rows(&src, "data/out.db", &[&kinds as &dyn TableCopy]).unwrap();

    let dst = crate::sql::sqlite3_connect(&dir.path().join("subset/data/out.db")).unwrap();
    let count: i64 = dst.query_row("SELECT COUNT(*) FROM kinds", [], |row| row.get(0)).unwrap();
    assert_eq!(count, 1);
}

#[test]
fn schema_is_copied_without_collations() {
    let dir = tempfile::tempdir().unwrap();
    let src = source_db(dir.path());
    let subsetter = Subsetter::new(dest_fs(dir.path()));

    let rows = subsetter.row_subset("people", "_id");
    subsetter.create_db_and_copy_rows(&src, "data/out.db", &[&rows as &dyn TableCopy]).unwrap();

    let dst = crate::sql::sqlite3_connect(&dir.path().join("subset/data/out.db")).unwrap();
    // Same column ordering as the source, COLLATE clause gone.
    assert_eq!(column_names(&dst, "people"), column_names(&src, "people"));
    let sql: String = dst.query_row(
        "SELECT sql FROM sqlite_master WHERE name = 'people'", [], |row| row.get(0)).unwrap();
    assert!(!sql.to_uppercase().contains("COLLATE"));
}

#[test]
fn copying_the_same_plan_twice_is_identical() {
    let dir = tempfile::tempdir().unwrap();
    let src = source_db(dir.path());

    let dump = |db: &std::path::Path| -> Vec<(i64, String, i64)> {
        let conn = crate::sql::sqlite3_connect(db).unwrap();
        let rows = conn.prepare("SELECT _id, name, age FROM people ORDER BY _id").unwrap()
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?))).unwrap()
            .collect::<Result<_, _>>().unwrap();
        rows
    };

    for out in ["one", "two"] {
        let fs: Arc<dyn crate::filesystem::DeviceFilesystem> = Arc::new(
            AndroidDeviceFilesystem::create(out, &dir.path().join(out), None).unwrap());
        let subsetter = Subsetter::new(fs);
        let mut rows = subsetter.row_subset("people", "_id");
        rows.update([1i64, 2i64]);
        subsetter.create_db_and_copy_rows(&src, "data/out.db", &[&rows as &dyn TableCopy]).unwrap();
    }

    assert_eq!(dump(&dir.path().join("one/data/out.db")),
               dump(&dir.path().join("two/data/out.db")));
}

#[test]
fn large_key_sets_are_batched() {
    let dir = tempfile::tempdir().unwrap();
    let src = crate::sql::sqlite3_connect(&dir.path().join("big.db")).unwrap();
    src.execute("CREATE TABLE t (_id INTEGER PRIMARY KEY, v TEXT)", []).unwrap();
    for i in 0..1500i64 {
        src.execute("INSERT INTO t VALUES (?1, ?2)", rusqlite::params![i, format!("v{i}")]).unwrap();
    }

    let subsetter = Subsetter::new(dest_fs(dir.path()));
    let mut rows = subsetter.row_subset("t", "_id");
    rows.update(0..1500i64);
    subsetter.create_db_and_copy_rows(&src, "data/out.db", &[&rows as &dyn TableCopy]).unwrap();

    let dst = crate::sql::sqlite3_connect(&dir.path().join("subset/data/out.db")).unwrap();
    let count: i64 = dst.query_row("SELECT COUNT(*) FROM t", [], |row| row.get(0)).unwrap();
    assert_eq!(count, 1500);
}

#[test]
fn copies_binary_files_at_the_same_logical_path() {
    let dir = tempfile::tempdir().unwrap();
    let src_root = android_backup(&dir.path().join("src"));
    create_named_file(&src_root.join("sdcard/DCIM/pic.jpg"), b"pixels");
    let src_fs = AndroidDeviceFilesystem::new("src", &src_root).unwrap();

    let subsetter = Subsetter::new(dest_fs(dir.path()));
    use crate::filesystem::DeviceFilesystem;
    subsetter.copy_file(src_fs.open("/sdcard/DCIM/pic.jpg").unwrap(), "/sdcard/DCIM/pic.jpg")
        .unwrap();

    assert_eq!(std::fs::read(dir.path().join("subset/sdcard/DCIM/pic.jpg")).unwrap(), b"pixels");
}

#[test]
fn missing_table_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let src = source_db(dir.path());
    let subsetter = Subsetter::new(dest_fs(dir.path()));
    let rows = subsetter.row_subset("no_such_table", "_id");
    assert!(subsetter.create_db_and_copy_rows(&src, "data/out.db", &[&rows as &dyn TableCopy])
        .is_err());
}
