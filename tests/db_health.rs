mod util;

use std::path::Path;

use repairkit_lib::db::health::{open_health_pool, run_health_checks, DbHealthReport, DbHealthStatus};
use rusqlite::Connection;
use tempfile::tempdir;

async fn check(db_path: &Path) -> DbHealthReport {
    let pool = open_health_pool(db_path).await.expect("open pool");
    let report = run_health_checks(&pool, db_path)
        .await
        .expect("health check succeeds");
    pool.close().await;
    report
}

fn storage_check(report: &DbHealthReport) -> &repairkit_lib::db::health::DbHealthCheck {
    report
        .checks
        .iter()
        .find(|c| c.name == "storage_sanity")
        .expect("storage check present")
}

#[tokio::test]
async fn health_passes_on_clean_db() {
    let dir = tempdir().expect("temp dir");
    let db_path = dir.path().join("clean.sqlite3");
    util::seed_two_tables(&db_path);

    let report = check(&db_path).await;
    assert_eq!(report.status, DbHealthStatus::Ok);
    assert!(report.checks.iter().all(|c| c.passed));
    assert!(report.offenders.is_empty());
    assert_eq!(report.schema_hash.len(), 64);
}

#[tokio::test]
async fn foreign_key_violations_are_reported() {
    let dir = tempdir().expect("temp dir");
    let db_path = dir.path().join("fk.sqlite3");
    Connection::open(&db_path)
        .expect("open")
        .execute_batch(
            "CREATE TABLE parent(id INTEGER PRIMARY KEY);
             CREATE TABLE child(id INTEGER PRIMARY KEY, parent_id INTEGER REFERENCES parent(id));
             INSERT INTO child(id, parent_id) VALUES (1, 999);",
        )
        .expect("seed violation");

    let report = check(&db_path).await;
    assert_eq!(report.status, DbHealthStatus::Error);
    let fk_check = report
        .checks
        .iter()
        .find(|c| c.name == "foreign_key_check")
        .expect("fk check present");
    assert!(!fk_check.passed);
    assert_eq!(report.offenders[0].table, "child");
    assert_eq!(report.offenders[0].rowid, 1);
}

#[tokio::test]
async fn junk_wal_file_is_detected() {
    let dir = tempdir().expect("temp dir");
    let db_path = dir.path().join("wal.sqlite3");
    util::seed_two_tables(&db_path);
    std::fs::write(db_path.with_extension("sqlite3-wal"), vec![0x42u8; 64]).expect("write junk wal");

    let report = check(&db_path).await;
    assert_eq!(report.status, DbHealthStatus::Error);
    let storage = storage_check(&report);
    assert!(!storage.passed);
    assert!(storage.details.as_deref().unwrap_or_default().contains("wal"));
}

#[tokio::test]
async fn damaged_leaf_fails_integrity_check() {
    let dir = tempdir().expect("temp dir");
    let db_path = dir.path().join("damaged.sqlite3");
    util::seed_rows(
        &db_path,
        "CREATE TABLE big(id INTEGER PRIMARY KEY, val TEXT);",
        "big",
        1_000,
        200,
    );
    let pages = util::page_count(&db_path);
    util::overwrite_page(&db_path, pages - 2, 0xA5);

    let report = check(&db_path).await;
    assert_eq!(report.status, DbHealthStatus::Error);
    assert!(storage_check(&report).passed);
    let integrity = report
        .checks
        .iter()
        .find(|c| c.name == "integrity_check")
        .expect("integrity check present");
    assert!(!integrity.passed);
}

#[tokio::test]
async fn missing_file_is_an_open_error() {
    let dir = tempdir().expect("temp dir");
    let err = open_health_pool(&dir.path().join("absent.sqlite3"))
        .await
        .expect_err("missing");
    assert_eq!(err.code(), "OPEN/NOT_FOUND");
}
