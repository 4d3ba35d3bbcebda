//! File-backed credential store.

use std::collections::BTreeMap;

use serde_json::json;

use wa_relay::whatsapp::CredentialStore;

#[test]
fn load_creates_missing_directory() {
    let root = tempfile::tempdir().expect("tempdir");
    let dir = root.path().join("auth");
    let store = CredentialStore::new(&dir);

    let auth = store.load().expect("load");
    assert!(auth.is_empty());
    assert!(dir.is_dir());
}

#[cfg(unix)]
#[test]
fn created_directory_is_private() {
    use std::os::unix::fs::PermissionsExt;

    let root = tempfile::tempdir().expect("tempdir");
    let dir = root.path().join("auth");
    CredentialStore::new(&dir).load().expect("load");

    let mode = std::fs::metadata(&dir).expect("metadata").permissions().mode();
    assert_eq!(mode & 0o777, 0o700);
}

#[test]
fn persisted_files_load_back() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = CredentialStore::new(dir.path());

    let mut files = BTreeMap::new();
    files.insert("creds.json".to_owned(), json!({"me": {"id": "549"}}));
    files.insert("app-state-sync-key-AAA.json".to_owned(), json!({"key": [1, 2, 3]}));
    store.persist(&files).expect("persist");

    let auth = store.load().expect("load");
    assert_eq!(auth.len(), 2);
    assert_eq!(auth.get("creds.json"), Some(&json!({"me": {"id": "549"}})));
}

#[test]
fn null_value_deletes_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = CredentialStore::new(dir.path());

    let mut files = BTreeMap::new();
    files.insert("session-1.json".to_owned(), json!({"k": 1}));
    store.persist(&files).expect("persist");
    assert!(dir.path().join("session-1.json").exists());

    files.insert("session-1.json".to_owned(), serde_json::Value::Null);
    store.persist(&files).expect("delete");
    assert!(!dir.path().join("session-1.json").exists());

    // Deleting again is not an error.
    store.persist(&files).expect("delete twice");
}

#[test]
fn non_json_files_are_ignored_on_load() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("README.txt"), "not credentials").expect("write");
    std::fs::write(dir.path().join("creds.json"), "{\"a\":1}").expect("write");

    let auth = CredentialStore::new(dir.path()).load().expect("load");
    assert_eq!(auth.len(), 1);
}

#[test]
fn corrupt_file_fails_load() {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::write(dir.path().join("creds.json"), "{truncated").expect("write");

    assert!(CredentialStore::new(dir.path()).load().is_err());
}

#[test]
fn file_names_cannot_escape_directory() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = CredentialStore::new(dir.path());

    for name in ["../escape.json", ".hidden.json", "nested/creds.json", "creds.txt", ""] {
        let mut files = BTreeMap::new();
        files.insert(name.to_owned(), json!({}));
        assert!(store.persist(&files).is_err(), "{name:?} should be rejected");
    }
}

#[test]
fn no_temporary_files_left_behind() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = CredentialStore::new(dir.path());

    let mut files = BTreeMap::new();
    files.insert("creds.json".to_owned(), json!({"v": 1}));
    store.persist(&files).expect("persist");
    files.insert("creds.json".to_owned(), json!({"v": 2}));
    store.persist(&files).expect("persist");

    let names: Vec<String> = std::fs::read_dir(dir.path())
        .expect("read_dir")
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    assert_eq!(names, vec!["creds.json".to_owned()]);
}
