use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{pool::PoolConnection, Row, Sqlite, SqlitePool};

use crate::cipher::is_valid_page_size;
use crate::repair::pager::{header_page_size, DB_HEADER_LEN, SQLITE_MAGIC};
use crate::{AppError, AppResult};

const WAL_HEADER_LEN: usize = 32;
const WAL_FRAME_HEADER_LEN: u64 = 24;
const WAL_MAGIC_BE: u32 = 0x377f_0682;
const WAL_MAGIC_LE: u32 = 0x377f_0683;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum DbHealthStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbHealthCheck {
    pub name: String,
    pub passed: bool,
    #[serde(default)]
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl DbHealthCheck {
    fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            passed: true,
            duration_ms: 0,
            details: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbHealthOffender {
    pub table: String,
    pub rowid: i64,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbHealthReport {
    pub status: DbHealthStatus,
    pub checks: Vec<DbHealthCheck>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub offenders: Vec<DbHealthOffender>,
    pub schema_hash: String,
    pub app_version: String,
    pub generated_at: String,
}

impl DbHealthReport {
    pub fn is_ok(&self) -> bool {
        self.status == DbHealthStatus::Ok
    }
}

/// Read-only single-connection pool used by the health checks.
pub async fn open_health_pool(db_path: &Path) -> AppResult<SqlitePool> {
    if !db_path.is_file() {
        return Err(AppError::open("NOT_FOUND", "Database file does not exist")
            .with_context("path", db_path.display().to_string()));
    }
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .read_only(true)
        .busy_timeout(Duration::from_millis(5_000));
    SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "open_health_pool")
                .with_context("path", db_path.display().to_string())
        })
}

/// Runs the SQLite consistency checks plus a raw look at the file header and
/// WAL. A damaged file yields a failing report, not an error.
pub async fn run_health_checks(pool: &SqlitePool, db_path: &Path) -> AppResult<DbHealthReport> {
    let mut conn = pool
        .acquire()
        .await
        .map_err(|err| AppError::from(err).with_context("operation", "acquire_health_connection"))?;

    let mut checks: Vec<DbHealthCheck> = Vec::new();
    let mut offenders: Vec<DbHealthOffender> = Vec::new();
    let mut overall_ok = true;

    let storage_check = run_storage_sanity(db_path);
    overall_ok &= storage_check.passed;
    checks.push(storage_check);

    let quick_check = run_pragma_check(&mut conn, "quick_check", "PRAGMA quick_check;").await;
    overall_ok &= quick_check.passed;
    checks.push(quick_check);

    let integrity_check =
        run_pragma_check(&mut conn, "integrity_check", "PRAGMA integrity_check(1);").await;
    overall_ok &= integrity_check.passed;
    checks.push(integrity_check);

    let fk_result = run_foreign_key_check(&mut conn).await;
    overall_ok &= fk_result.check.passed;
    offenders.extend(fk_result.offenders);
    checks.push(fk_result.check);

    let schema_hash = compute_schema_hash(&mut conn).await.unwrap_or_default();

    let status = if overall_ok {
        DbHealthStatus::Ok
    } else {
        DbHealthStatus::Error
    };
    tracing::info!(
        target: "repairkit",
        event = "health_checks_finished",
        path = %db_path.display(),
        status = ?status,
        offenders = offenders.len()
    );

    Ok(DbHealthReport {
        status,
        checks,
        offenders,
        schema_hash,
        app_version: env!("CARGO_PKG_VERSION").to_string(),
        generated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    })
}

struct ForeignKeyCheckResult {
    check: DbHealthCheck,
    offenders: Vec<DbHealthOffender>,
}

async fn run_pragma_check(conn: &mut PoolConnection<Sqlite>, name: &str, sql: &str) -> DbHealthCheck {
    let start = Instant::now();
    let mut check = DbHealthCheck::named(name);

    match sqlx::query_scalar::<_, String>(sql).fetch_one(conn.as_mut()).await {
        Ok(result) => {
            if !result.eq_ignore_ascii_case("ok") {
                check.passed = false;
                check.details = Some(result);
            }
        }
        Err(err) => {
            check.passed = false;
            check.details = Some(format!("{name} failed: {err}"));
        }
    }

    check.duration_ms = start.elapsed().as_millis() as u64;
    check
}

async fn run_foreign_key_check(conn: &mut PoolConnection<Sqlite>) -> ForeignKeyCheckResult {
    let start = Instant::now();
    let mut check = DbHealthCheck::named("foreign_key_check");

    let rows = sqlx::query("PRAGMA foreign_key_check;")
        .fetch_all(conn.as_mut())
        .await;

    let mut offenders = Vec::new();
    match rows {
        Ok(rows) => {
            offenders.extend(rows.iter().filter_map(offender_from_row));
            if !offenders.is_empty() {
                check.passed = false;
                check.details = Some(format!("{} foreign key violation(s)", offenders.len()));
            }
        }
        Err(err) => {
            check.passed = false;
            check.details = Some(format!("foreign_key_check failed: {err}"));
        }
    }

    check.duration_ms = start.elapsed().as_millis() as u64;
    ForeignKeyCheckResult { check, offenders }
}

fn offender_from_row(row: &SqliteRow) -> Option<DbHealthOffender> {
    let table: String = row.try_get("table").ok()?;
    let rowid: i64 = row.try_get::<Option<i64>, _>("rowid").ok().flatten().unwrap_or(-1);
    let parent: Option<String> = row.try_get("parent").ok();
    let fkid: Option<i64> = row.try_get("fkid").ok();

    let mut parts = Vec::new();
    if let Some(parent) = parent {
        parts.push(format!("missing parent '{parent}'"));
    }
    if let Some(fkid) = fkid {
        parts.push(format!("constraint #{fkid}"));
    }
    let message = if parts.is_empty() {
        "foreign key violation".to_string()
    } else {
        parts.join(", ")
    };

    Some(DbHealthOffender {
        table,
        rowid,
        message,
    })
}

/// Looks at the raw header and WAL without going through SQLite.
fn run_storage_sanity(db_path: &Path) -> DbHealthCheck {
    let start = Instant::now();
    let mut check = DbHealthCheck::named("storage_sanity");
    let mut messages: Vec<String> = Vec::new();

    let page_size = match inspect_header(db_path) {
        Ok(page_size) => {
            messages.push(format!("page_size={page_size}"));
            Some(page_size)
        }
        Err(details) => {
            check.passed = false;
            messages.push(details);
            None
        }
    };

    let wal = inspect_wal_file(db_path, page_size);
    if !wal.passed {
        check.passed = false;
    }
    messages.push(wal.details);

    check.duration_ms = start.elapsed().as_millis() as u64;
    check.details = Some(messages.join("; "));
    check
}

fn inspect_header(db_path: &Path) -> Result<u32, String> {
    let mut header = [0u8; DB_HEADER_LEN];
    File::open(db_path)
        .and_then(|mut f| f.read_exact(&mut header))
        .map_err(|err| format!("header read error: {err}"))?;
    if &header[..SQLITE_MAGIC.len()] != SQLITE_MAGIC {
        return Err("header magic mismatch".to_string());
    }
    match header_page_size(&header) {
        Some(size) if is_valid_page_size(size) => Ok(size),
        _ => Err("header page size invalid".to_string()),
    }
}

struct WalOutcome {
    passed: bool,
    details: String,
}

impl WalOutcome {
    fn ok(details: impl Into<String>) -> Self {
        Self {
            passed: true,
            details: details.into(),
        }
    }

    fn failed(details: impl Into<String>) -> Self {
        Self {
            passed: false,
            details: details.into(),
        }
    }
}

fn inspect_wal_file(db_path: &Path, page_size: Option<u32>) -> WalOutcome {
    let wal_path = wal_path(db_path);
    let len = match std::fs::metadata(&wal_path) {
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return WalOutcome::ok("wal=absent"),
        Err(err) => return WalOutcome::failed(format!("wal metadata error: {err}")),
        Ok(meta) => meta.len(),
    };
    if len == 0 {
        return WalOutcome::ok("wal=empty");
    }
    if len < WAL_HEADER_LEN as u64 {
        return WalOutcome::failed(format!("wal too small: {len} bytes"));
    }

    let mut header = [0u8; WAL_HEADER_LEN];
    if let Err(err) = File::open(&wal_path).and_then(|mut f| f.read_exact(&mut header)) {
        return WalOutcome::failed(format!("wal read error: {err}"));
    }
    let magic = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
    if magic != WAL_MAGIC_BE && magic != WAL_MAGIC_LE {
        return WalOutcome::failed("wal magic header mismatch");
    }

    let wal_page_size = u32::from_be_bytes([header[8], header[9], header[10], header[11]]);
    if let Some(page_size) = page_size {
        if wal_page_size != page_size {
            return WalOutcome::failed(format!(
                "wal page size mismatch: expected {page_size}, header {wal_page_size}"
            ));
        }
    }
    if wal_page_size == 0 {
        return WalOutcome::failed("wal page size is zero");
    }

    let frame_size = u64::from(wal_page_size) + WAL_FRAME_HEADER_LEN;
    let payload = len - WAL_HEADER_LEN as u64;
    if payload % frame_size != 0 {
        return WalOutcome::failed(format!(
            "wal size misaligned: len={len}, frame_size={frame_size}"
        ));
    }
    WalOutcome::ok(format!("wal frames={}", payload / frame_size))
}

fn wal_path(db_path: &Path) -> PathBuf {
    let mut os_string = db_path.as_os_str().to_os_string();
    os_string.push("-wal");
    PathBuf::from(os_string)
}

async fn compute_schema_hash(conn: &mut PoolConnection<Sqlite>) -> AppResult<String> {
    let rows = sqlx::query(
        "SELECT type, name, tbl_name, sql FROM sqlite_master\n         WHERE type IN ('table','index','trigger','view')\n         ORDER BY type, name",
    )
    .fetch_all(conn.as_mut())
    .await?;

    let mut hasher = Sha256::new();
    for row in rows {
        let ty: String = row.try_get("type")?;
        let name: String = row.try_get("name")?;
        let tbl: String = row.try_get("tbl_name")?;
        let sql: Option<String> = row.try_get("sql").ok().flatten();

        for part in [ty.as_bytes(), name.as_bytes(), tbl.as_bytes()] {
            hasher.update(part);
            hasher.update([0]);
        }
        if let Some(sql) = sql {
            hasher.update(sql.as_bytes());
        }
        hasher.update([0]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_wal_passes() {
        let dir = tempdir().expect("tempdir");
        let outcome = inspect_wal_file(&dir.path().join("db.sqlite3"), Some(4096));
        assert!(outcome.passed);
        assert_eq!(outcome.details, "wal=absent");
    }

    #[test]
    fn misaligned_wal_fails() {
        let dir = tempdir().expect("tempdir");
        let db = dir.path().join("db.sqlite3");
        let mut wal = vec![0u8; WAL_HEADER_LEN + 10];
        wal[..4].copy_from_slice(&WAL_MAGIC_BE.to_be_bytes());
        wal[8..12].copy_from_slice(&4096u32.to_be_bytes());
        std::fs::write(wal_path(&db), wal).expect("write wal");
        let outcome = inspect_wal_file(&db, Some(4096));
        assert!(!outcome.passed);
        assert!(outcome.details.contains("misaligned"));
    }

    #[test]
    fn junk_header_is_reported() {
        let dir = tempdir().expect("tempdir");
        let db = dir.path().join("db.sqlite3");
        std::fs::write(&db, vec![7u8; 512]).expect("write");
        let check = run_storage_sanity(&db);
        assert!(!check.passed);
        assert!(check.details.unwrap_or_default().contains("magic"));
    }
}
