#![allow(dead_code)]

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use rusqlite::Connection;
use sha1::{Digest, Sha1};

use crate::sql;
use crate::utils::*;

pub fn create_named_file(path: &Path, content: &[u8]) {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    let mut file = File::create(path).unwrap();
    file.write_all(content).unwrap();
}

pub fn random_alphanumeric(length: usize) -> String {
    use rand::Rng;
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

//
// Android fixtures
//

/// Creates a bare Android backup tree under `dir` and returns its root.
pub fn android_backup(dir: &Path) -> PathBuf {
    let root = dir.to_path_buf();
    fs::create_dir_all(root.join("data/data/android")).unwrap();
    root
}

/// A small msgstore.db + wa.db pair:
/// - Alice (jid row 1, wa_contacts 1) and Bob (jid row 2, wa_contacts 2)
/// - a group jid (row 3) with Alice and Bob as participants
/// - chat 1 (private, Alice), chat 2 (group "Test Group")
/// - messages at t=1000/2000 in chat 1, t=3000 in chat 2 (sent by Bob),
///   and an image message at t=4000 with a media file on the sdcard.
pub fn whatsapp_fixture(root: &Path) {
    let db_dir = root.join("data/data/com.whatsapp/databases");
    fs::create_dir_all(&db_dir).unwrap();

    let conn = sql::sqlite3_connect(&db_dir.join("msgstore.db")).unwrap();
    conn.execute_batch(r#"
        CREATE TABLE jid (_id INTEGER PRIMARY KEY, user TEXT, server TEXT,
                          type INTEGER, raw_string TEXT);
        CREATE TABLE chat (_id INTEGER PRIMARY KEY, jid_row_id INTEGER, subject TEXT);
        CREATE TABLE message (_id INTEGER PRIMARY KEY, chat_row_id INTEGER,
                              sender_jid_row_id INTEGER, message_type INTEGER,
                              text_data TEXT COLLATE NOCASE, timestamp INTEGER,
                              from_me INTEGER);
        CREATE TABLE message_details (message_row_id INTEGER PRIMARY KEY,
                                      author_device_jid INTEGER);
        CREATE TABLE message_media (message_row_id INTEGER PRIMARY KEY,
                                    file_path TEXT, mime_type TEXT);
        CREATE TABLE group_participant_user (_id INTEGER PRIMARY KEY,
                                             group_jid_row_id INTEGER,
                                             user_jid_row_id INTEGER);

        INSERT INTO jid VALUES (1, '447700900123', 's.whatsapp.net', 17, '447700900123@s.whatsapp.net');
        INSERT INTO jid VALUES (2, '447700900456', 's.whatsapp.net', 17, '447700900456@s.whatsapp.net');
        INSERT INTO jid VALUES (3, '447700900123-1600000000', 'g.us', 1, '447700900123-1600000000@g.us');

        INSERT INTO chat VALUES (1, 1, NULL);
        INSERT INTO chat VALUES (2, 3, 'Test Group');

        INSERT INTO message VALUES (1, 1, 1, 0, 'hello', 1000, 0);
        INSERT INTO message VALUES (2, 1, 1, 0, 'world', 2000, 0);
        INSERT INTO message VALUES (3, 2, 0, 0, 'group msg', 3000, 0);
        INSERT INTO message VALUES (4, 1, 1, 1, NULL, 4000, 0);

        INSERT INTO message_details VALUES (1, NULL);
        INSERT INTO message_details VALUES (2, NULL);
        INSERT INTO message_details VALUES (3, 2);
        INSERT INTO message_details VALUES (4, NULL);

        INSERT INTO message_media VALUES (4, 'Media/WhatsApp Images/IMG-1.jpg', 'image/jpeg');

        INSERT INTO group_participant_user VALUES (1, 3, 1);
        INSERT INTO group_participant_user VALUES (2, 3, 2);
    "#).unwrap();

    let conn = sql::sqlite3_connect(&db_dir.join("wa.db")).unwrap();
    conn.execute_batch(r#"
        CREATE TABLE wa_contacts (_id INTEGER PRIMARY KEY, jid TEXT, number TEXT,
                                  display_name TEXT, given_name TEXT, family_name TEXT,
                                  wa_name TEXT, sort_name TEXT, nickname TEXT);
        INSERT INTO wa_contacts VALUES (1, '447700900123@s.whatsapp.net', '07700 900123',
                                        'Alice Example', 'Alice', 'Example', 'alice',
                                        'Alice Example', NULL);
        INSERT INTO wa_contacts VALUES (2, '447700900456@s.whatsapp.net', '+447700900456',
                                        'Bob', 'Bob', NULL, 'bob', 'Bob', 'bobby');
    "#).unwrap();

    create_named_file(&root.join("sdcard/WhatsApp/Media/WhatsApp Images/IMG-1.jpg"),
                      b"\xff\xd8\xff\xe0fakejpegdata");
}

pub fn telephony_fixture(root: &Path) {
    let db_dir = root.join("data/data/com.android.providers.telephony/databases");
    fs::create_dir_all(&db_dir).unwrap();

    let conn = sql::sqlite3_connect(&db_dir.join("mmssms.db")).unwrap();
    conn.execute_batch(r#"
        CREATE TABLE canonical_addresses (_id INTEGER PRIMARY KEY, address TEXT);
        CREATE TABLE threads (_id INTEGER PRIMARY KEY, recipient_ids TEXT, snippet TEXT);
        CREATE TABLE sms (_id INTEGER PRIMARY KEY, thread_id INTEGER, address TEXT,
                          type INTEGER, date INTEGER, body TEXT, service_center TEXT);

        INSERT INTO canonical_addresses VALUES (1, '+447700900123');
        INSERT INTO threads VALUES (1, '1', 'see you then');
        INSERT INTO sms VALUES (1, 1, '+447700900123', 1, 1000, 'on my way', '+447958879879');
        INSERT INTO sms VALUES (2, 1, '+447700900123', 2, 2000, 'see you then', NULL);
    "#).unwrap();
}

pub fn android_contacts_fixture(root: &Path) {
    let db_dir = root.join("data/data/com.android.providers.contacts/databases");
    fs::create_dir_all(&db_dir).unwrap();

    let conn = sql::sqlite3_connect(&db_dir.join("contacts2.db")).unwrap();
    conn.execute_batch(r#"
        CREATE TABLE mimetypes (_id INTEGER PRIMARY KEY, mimetype TEXT);
        CREATE TABLE contacts (_id INTEGER PRIMARY KEY, name_raw_contact_id INTEGER,
                               default_number TEXT);
        CREATE TABLE raw_contacts (_id INTEGER PRIMARY KEY, sync1 TEXT);
        CREATE TABLE data (_id INTEGER PRIMARY KEY, raw_contact_id INTEGER,
                           mimetype_id INTEGER, data1 TEXT, data2 TEXT, data3 TEXT,
                           data4 TEXT);

        INSERT INTO mimetypes VALUES (1, 'vnd.android.cursor.item/name');
        INSERT INTO mimetypes VALUES (2, 'vnd.android.cursor.item/phone_v2');
        INSERT INTO mimetypes VALUES (3, 'vnd.android.cursor.item/email_v2');

        INSERT INTO contacts VALUES (1, 10, NULL);
        INSERT INTO raw_contacts VALUES (10, NULL);
        INSERT INTO data VALUES (1, 10, 1, 'Carol Jones', NULL, NULL, NULL);
        INSERT INTO data VALUES (2, 10, 2, '07700 900123', NULL, NULL, NULL);
        INSERT INTO data VALUES (3, 10, 3, 'carol@example.org', NULL, NULL, NULL);
    "#).unwrap();
}

//
// iOS fixtures
//

pub fn ios_hash(domain: &str, relative_path: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(format!("{domain}-{relative_path}").as_bytes());
    to_hex(&hasher.finalize())
}

/// Creates a bare iOS backup (manifest with the Files schema, empty Info.plist)
/// under `dir` and returns its root.
pub fn ios_backup(dir: &Path) -> PathBuf {
    let root = dir.to_path_buf();
    fs::create_dir_all(&root).unwrap();

    let conn = sql::sqlite3_connect(&root.join("Manifest.db")).unwrap();
    conn.execute_batch(r#"
        CREATE TABLE Files (fileID TEXT PRIMARY KEY, domain TEXT, relativePath TEXT,
                            flags INTEGER, file BLOB);
        CREATE TABLE Properties (key TEXT PRIMARY KEY, value BLOB);
    "#).unwrap();

    create_named_file(&root.join("Info.plist"), b"");
    root
}

/// Registers `domain/relative_path` in the manifest and returns a read-write
/// connection to a fresh database at its hashed location.
pub fn ios_create_db(root: &Path, logical_path: &str) -> Connection {
    let (domain, relative_path) = logical_path.split_once('/').unwrap();
    let file_id = ios_hash(domain, relative_path);

    let manifest = sql::sqlite3_connect(&root.join("Manifest.db")).unwrap();
    manifest.execute(
        "INSERT INTO Files (fileID, domain, relativePath, flags) VALUES (?1, ?2, ?3, 1)",
        [file_id.as_str(), domain, relative_path],
    ).unwrap();

    let db_path = root.join(&file_id[..2]).join(&file_id);
    fs::create_dir_all(db_path.parent().unwrap()).unwrap();
    sql::sqlite3_connect(&db_path).unwrap()
}

/// An sms.db with two one-to-one messages from one handle. The second message is
/// S4's 2023-01-01T00:00:00Z (694224000000000000 ns since 2001-01-01).
pub fn imessage_fixture(root: &Path) {
    let conn = ios_create_db(root, "HomeDomain/Library/SMS/sms.db");
    conn.execute_batch(r#"
        CREATE TABLE handle (ROWID INTEGER PRIMARY KEY, id TEXT, uncanonicalized_id TEXT);
        CREATE TABLE chat (ROWID INTEGER PRIMARY KEY, guid TEXT, chat_identifier TEXT,
                           account_login TEXT, last_addressed_handle TEXT);
        CREATE TABLE message (ROWID INTEGER PRIMARY KEY, guid TEXT, text TEXT,
                              date INTEGER, handle_id INTEGER, is_from_me INTEGER,
                              account TEXT, destination_caller_id TEXT);
        CREATE TABLE chat_message_join (chat_id INTEGER, message_id INTEGER);
        CREATE TABLE chat_handle_join (chat_id INTEGER, handle_id INTEGER);

        INSERT INTO handle VALUES (1, '+447700900123', NULL);
        INSERT INTO chat VALUES (1, 'iMessage;-;+447700900123', '+447700900123',
                                 'E:owner@example.org', '+447700900999');
        INSERT INTO message VALUES (1, 'guid-1', 'hi there', 694223999000000000, 1, 0, NULL, NULL);
        INSERT INTO message VALUES (2, 'guid-2', 'happy new year', 694224000000000000, 1, 1, NULL, NULL);
        INSERT INTO chat_message_join VALUES (1, 1);
        INSERT INTO chat_message_join VALUES (1, 2);
        INSERT INTO chat_handle_join VALUES (1, 1);
    "#).unwrap();
}

/// An AddressBook with two people; the trailing one only has a name row.
pub fn addressbook_fixture(root: &Path) {
    let conn = ios_create_db(root, "HomeDomain/Library/AddressBook/AddressBook.sqlitedb");
    conn.execute_batch(r#"
        CREATE TABLE ABPerson (ROWID INTEGER PRIMARY KEY, First TEXT, Last TEXT);
        CREATE TABLE ABMultiValue (UID INTEGER PRIMARY KEY, record_id INTEGER,
                                   property INTEGER, label INTEGER, value TEXT);

        INSERT INTO ABPerson VALUES (1, 'Alice', 'Example');
        INSERT INTO ABPerson VALUES (2, 'Dave', 'Last');
        INSERT INTO ABMultiValue VALUES (1, 1, 3, 0, '+447700900123');
        INSERT INTO ABMultiValue VALUES (2, 1, 4, 0, 'alice@example.org');
    "#).unwrap();
}

/// A ChatStorage.sqlite with a private chat and a group chat.
pub fn ios_whatsapp_fixture(root: &Path) {
    let conn = ios_create_db(root, "AppDomainGroup-group.net.whatsapp.WhatsApp.shared/ChatStorage.sqlite");
    conn.execute_batch(r#"
        CREATE TABLE ZWACHATSESSION (Z_PK INTEGER PRIMARY KEY, ZCONTACTJID TEXT,
                                     ZPARTNERNAME TEXT, ZGROUPINFO INTEGER,
                                     ZCONTACTIDENTIFIER TEXT);
        CREATE TABLE ZWAPROFILEPUSHNAME (Z_PK INTEGER PRIMARY KEY, ZJID TEXT, ZPUSHNAME TEXT);
        CREATE TABLE ZWAGROUPMEMBER (Z_PK INTEGER PRIMARY KEY, ZCHATSESSION INTEGER,
                                     ZMEMBERJID TEXT);
        CREATE TABLE ZWAMESSAGE (Z_PK INTEGER PRIMARY KEY, ZTEXT TEXT, ZMESSAGEDATE REAL,
                                 ZISFROMME INTEGER, ZMESSAGETYPE INTEGER, ZFROMJID TEXT,
                                 ZTOJID TEXT, ZCHATSESSION INTEGER, ZGROUPMEMBER INTEGER);

        INSERT INTO ZWACHATSESSION VALUES (1, '447700900123@s.whatsapp.net', 'Alice Example', NULL, 'abc');
        INSERT INTO ZWACHATSESSION VALUES (2, '447700900123-1600000000@g.us', 'Test Group', 1, 'def');
        INSERT INTO ZWAPROFILEPUSHNAME VALUES (1, '447700900123@s.whatsapp.net', 'alice');
        INSERT INTO ZWAGROUPMEMBER VALUES (1, 2, '447700900123@s.whatsapp.net');
        INSERT INTO ZWAGROUPMEMBER VALUES (2, 2, '447700900456@s.whatsapp.net');

        INSERT INTO ZWAMESSAGE VALUES (1, 'hello from ios', 694224000.0, 0, 0,
                                       '447700900123@s.whatsapp.net', NULL, 1, NULL);
        INSERT INTO ZWAMESSAGE VALUES (2, 'group hello', 694224100.0, 0, 0,
                                       '447700900123-1600000000@g.us', NULL, 2, 2);
    "#).unwrap();
}

//
// Archives
//

/// Zips `src_dir` into `zip_path`, under a single top-level directory named after
/// `src_dir` itself.
pub fn zip_directory(src_dir: &Path, zip_path: &Path) {
    let file = File::create(zip_path).unwrap();
    let mut zip = zip::ZipWriter::new(file);
    let options = zip::write::FileOptions::default();
    let top = src_dir.file_name().unwrap().to_str().unwrap().to_owned();

    fn add_dir(zip: &mut zip::ZipWriter<File>, options: zip::write::FileOptions,
               dir: &Path, prefix: &str) {
        for dir_entry in fs::read_dir(dir).unwrap() {
            let dir_entry = dir_entry.unwrap();
            let name = format!("{prefix}/{}", dir_entry.file_name().to_str().unwrap());
            if dir_entry.path().is_dir() {
                add_dir(zip, options, &dir_entry.path(), &name);
            } else {
                zip.start_file(&name, options).unwrap();
                let mut src = File::open(dir_entry.path()).unwrap();
                std::io::copy(&mut src, zip).unwrap();
            }
        }
    }

    add_dir(&mut zip, options, src_dir, &top);
    zip.finish().unwrap();
}
