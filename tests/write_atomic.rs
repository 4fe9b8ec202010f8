use repairkit_lib::db::write_atomic;
use std::fs;
use tempfile::tempdir;

#[test]
fn commit_writes_file() {
    let dir = tempdir().expect("temp dir");
    let path = dir.path().join("schema.snapshot");
    write_atomic(&path, b"hello").expect("atomic write");
    assert_eq!(fs::read(&path).expect("read file"), b"hello");
}

#[test]
fn overwrite_replaces_contents() {
    let dir = tempdir().expect("temp dir");
    let path = dir.path().join("schema.snapshot");
    fs::write(&path, b"old").expect("write file");
    write_atomic(&path, b"new").expect("atomic write");
    assert_eq!(fs::read(&path).expect("read file"), b"new");
    assert_eq!(fs::read_dir(dir.path()).expect("list dir").count(), 1);
}

#[test]
fn failure_leaves_original() {
    let dir = tempdir().expect("temp dir");
    let existing = dir.path().join("orig.snapshot");
    fs::write(&existing, b"old").expect("write file");
    let bad_path = dir.path().join("missing").join("file.snapshot");
    let err = write_atomic(&bad_path, b"data").expect_err("missing parent dir");
    assert_eq!(err.context().get("operation").map(String::as_str), Some("create_temp_file"));
    assert_eq!(fs::read(&existing).expect("read file"), b"old");
    assert!(!bad_path.parent().expect("parent dir").exists());
}
