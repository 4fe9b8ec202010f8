mod util;

use std::process::Output;

use anyhow::Result;
use assert_cmd::Command;
use repairkit_lib::db::health::{DbHealthReport, DbHealthStatus};
use rusqlite::Connection;
use tempfile::tempdir;

fn repairkit() -> Result<Command> {
    let mut cmd = Command::cargo_bin("repairkit")?;
    cmd.env("REPAIRKIT_LOG", "repairkit=warn")
        .env("REPAIRKIT_KDF_ITERATIONS", "1")
        .env_remove("REPAIRKIT_FAKE_FREE_BYTES");
    Ok(cmd)
}

fn explain(output: &Output) -> String {
    format!(
        "stdout: {}\nstderr: {}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    )
}

#[test]
fn status_reports_ok_for_a_clean_database() -> Result<()> {
    let tmp = tempdir()?;
    let db = tmp.path().join("clean.sqlite3");
    util::seed_two_tables(&db);

    let output = repairkit()?.arg("status").arg(&db).output()?;
    assert!(output.status.success(), "{}", explain(&output));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Status       : ok"));
    assert!(stdout.contains("storage_sanity"));

    let json_output = repairkit()?.arg("status").arg(&db).arg("--json").output()?;
    assert!(json_output.status.success(), "{}", explain(&json_output));
    let report: DbHealthReport = serde_json::from_slice(&json_output.stdout)?;
    assert_eq!(report.status, DbHealthStatus::Ok);
    assert!(!report.schema_hash.is_empty());
    Ok(())
}

#[test]
fn status_exits_nonzero_on_foreign_key_violations() -> Result<()> {
    let tmp = tempdir()?;
    let db = tmp.path().join("fk.sqlite3");
    let conn = Connection::open(&db)?;
    conn.execute_batch(
        "CREATE TABLE parent(id INTEGER PRIMARY KEY);
         CREATE TABLE child(id INTEGER PRIMARY KEY, parent_id INTEGER REFERENCES parent(id));
         INSERT INTO child(id, parent_id) VALUES (1, 999);",
    )?;
    drop(conn);

    let output = repairkit()?.arg("status").arg(&db).output()?;
    assert_eq!(output.status.code(), Some(1), "{}", explain(&output));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Status       : error"));
    assert!(stdout.contains("child"));
    Ok(())
}

#[test]
fn backup_and_restore_round_trip() -> Result<()> {
    let tmp = tempdir()?;
    let db = tmp.path().join("live.sqlite3");
    util::seed_two_tables(&db);
    let out = tmp.path().join("live.rkbk");

    let output = repairkit()?
        .arg("backup")
        .arg(&db)
        .arg(&out)
        .args(["--key", "pw", "--table", "t1=id <= 10", "--json"])
        .output()?;
    assert!(output.status.success(), "{}", explain(&output));
    let payload: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(payload["outcome"], "ok");
    assert_eq!(payload["statements"], 11);
    assert!(payload["sha256"].as_str().is_some_and(|s| s.len() == 64));

    let restored = tmp.path().join("restored.sqlite3");
    let output = repairkit()?
        .arg("restore")
        .arg(&out)
        .arg(&restored)
        .args(["--key", "pw"])
        .output()?;
    assert!(output.status.success(), "{}", explain(&output));
    assert_eq!(util::count_rows(&restored, "t1"), 10);
    Ok(())
}

#[test]
fn backup_refuses_to_start_on_a_full_disk() -> Result<()> {
    let tmp = tempdir()?;
    let db = tmp.path().join("live.sqlite3");
    util::seed_two_tables(&db);
    let out = tmp.path().join("live.rkbk");

    let output = repairkit()?
        .env("REPAIRKIT_FAKE_FREE_BYTES", "1")
        .arg("backup")
        .arg(&db)
        .arg(&out)
        .arg("--json")
        .output()?;
    assert_eq!(output.status.code(), Some(1), "{}", explain(&output));
    let payload: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(payload["outcome"], "failed");
    assert_eq!(payload["error"]["code"], "IO/LOW_DISK");
    Ok(())
}

#[test]
fn repair_in_place_archives_the_damaged_file() -> Result<()> {
    let tmp = tempdir()?;
    let db = tmp.path().join("live.sqlite3");
    util::seed_two_tables(&db);
    let expected = util::rows(&db, "t1");

    let output = repairkit()?
        .arg("repair")
        .arg(&db)
        .args(["--in-place", "--json"])
        .output()?;
    assert!(output.status.success(), "{}", explain(&output));
    let report: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(report["rowsRecovered"], 25);

    assert_eq!(util::rows(&db, "t1"), expected);
    let archived = std::fs::read_dir(tmp.path())?
        .filter_map(|entry| entry.ok())
        .any(|entry| entry.file_name().to_string_lossy().contains(".pre-repair-"));
    assert!(archived);
    Ok(())
}

#[test]
fn snapshot_save_then_show() -> Result<()> {
    let tmp = tempdir()?;
    let db = tmp.path().join("live.sqlite3");
    util::seed_two_tables(&db);
    let snap = tmp.path().join("live.snapshot");

    let output = repairkit()?
        .args(["snapshot", "save"])
        .arg(&db)
        .arg(&snap)
        .output()?;
    assert!(output.status.success(), "{}", explain(&output));

    let output = repairkit()?
        .args(["snapshot", "show"])
        .arg(&snap)
        .arg("--json")
        .output()?;
    assert!(output.status.success(), "{}", explain(&output));
    let payload: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    let entries = payload["entries"].as_array().cloned().unwrap_or_default();
    assert_eq!(entries.len(), 3);
    assert_eq!(payload["hasSalt"], false);
    Ok(())
}
