use std::env;
use std::fs;
use std::io::Write;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fs2::available_space;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OpenFlags, OptionalExtension};
use tempfile::NamedTempFile;

use crate::cipher::KdfSalt;
use crate::{config, AppError, AppResult};

pub mod health;
pub mod introspect;
pub mod swap;

const BUSY_TIMEOUT: Duration = Duration::from_millis(5_000);

/// How a raw connection is going to be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenIntent {
    ReadOnly,
    ReadWrite,
}

/// An unpooled connection checked out from a [`DatabaseHandle`].
///
/// The checkout is returned when the guard is dropped, on every exit path.
pub struct RawConnection {
    conn: Connection,
    purpose: String,
    checkouts: Arc<AtomicUsize>,
}

impl RawConnection {
    pub fn new(conn: Connection, purpose: impl Into<String>, checkouts: Arc<AtomicUsize>) -> Self {
        checkouts.fetch_add(1, Ordering::SeqCst);
        Self {
            conn,
            purpose: purpose.into(),
            checkouts,
        }
    }

    pub fn purpose(&self) -> &str {
        &self.purpose
    }
}

impl Deref for RawConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        &self.conn
    }
}

impl DerefMut for RawConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

impl Drop for RawConnection {
    fn drop(&mut self) {
        self.checkouts.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!(
            target: "repairkit",
            event = "raw_connection_released",
            purpose = %self.purpose
        );
    }
}

/// The live database engine as seen by the snapshot, repair and backup
/// components.
pub trait DatabaseHandle: Send + Sync {
    fn path(&self) -> &Path;

    /// Checks out a fresh connection outside of any pool, labelled with the
    /// purpose for diagnostics.
    fn acquire_raw(&self, purpose: &str, intent: OpenIntent) -> AppResult<RawConnection>;

    fn execute(&self, sql: &str, params: &[Value]) -> AppResult<usize>;

    fn query_scalar(&self, sql: &str, params: &[Value]) -> AppResult<Option<Value>>;

    /// Salt used by the engine's cipher, when the database is encrypted.
    fn kdf_salt(&self) -> Option<KdfSalt> {
        None
    }
}

/// [`DatabaseHandle`] over a SQLite file.
pub struct SqliteDatabase {
    path: PathBuf,
    managed: Mutex<Connection>,
    checkouts: Arc<AtomicUsize>,
    kdf_salt: Option<KdfSalt>,
}

impl std::fmt::Debug for SqliteDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteDatabase")
            .field("path", &self.path)
            .field("raw_checkouts", &self.raw_checkouts())
            .finish()
    }
}

impl SqliteDatabase {
    /// Opens the database, creating an empty file when it does not exist.
    pub fn open(path: &Path) -> AppResult<Self> {
        let conn = open_connection(path, OpenIntent::ReadWrite, "managed")?;
        Ok(Self {
            path: path.to_path_buf(),
            managed: Mutex::new(conn),
            checkouts: Arc::new(AtomicUsize::new(0)),
            kdf_salt: None,
        })
    }

    /// Opens a database that must already exist.
    pub fn open_existing(path: &Path) -> AppResult<Self> {
        if !path.is_file() {
            return Err(AppError::open("NOT_FOUND", "Database file does not exist")
                .with_context("path", path.display().to_string()));
        }
        Self::open(path)
    }

    /// Attaches the salt of the engine's page cipher so snapshots taken from
    /// this handle carry it.
    pub fn with_kdf_salt(mut self, salt: KdfSalt) -> Self {
        self.kdf_salt = Some(salt);
        self
    }

    /// Number of raw connections currently checked out.
    pub fn raw_checkouts(&self) -> usize {
        self.checkouts.load(Ordering::SeqCst)
    }

    fn with_managed<T>(&self, f: impl FnOnce(&Connection) -> AppResult<T>) -> AppResult<T> {
        let guard = self.managed.lock().map_err(|_| {
            AppError::new("DB/LOCK_POISONED", "Managed connection lock is poisoned")
                .with_context("path", self.path.display().to_string())
        })?;
        f(&guard)
    }
}

impl DatabaseHandle for SqliteDatabase {
    fn path(&self) -> &Path {
        &self.path
    }

    fn acquire_raw(&self, purpose: &str, intent: OpenIntent) -> AppResult<RawConnection> {
        let conn = open_connection(&self.path, intent, purpose)?;
        tracing::debug!(
            target: "repairkit",
            event = "raw_connection_acquired",
            purpose = %purpose,
            read_only = matches!(intent, OpenIntent::ReadOnly),
            path = %self.path.display()
        );
        Ok(RawConnection::new(conn, purpose, self.checkouts.clone()))
    }

    fn execute(&self, sql: &str, params: &[Value]) -> AppResult<usize> {
        self.with_managed(|conn| {
            conn.execute(sql, params_from_iter(params.iter()))
                .map_err(|err| AppError::from(err).with_context("operation", "execute"))
        })
    }

    fn query_scalar(&self, sql: &str, params: &[Value]) -> AppResult<Option<Value>> {
        self.with_managed(|conn| {
            conn.query_row(sql, params_from_iter(params.iter()), |row| row.get::<_, Value>(0))
                .optional()
                .map_err(|err| AppError::from(err).with_context("operation", "query_scalar"))
        })
    }

    fn kdf_salt(&self) -> Option<KdfSalt> {
        self.kdf_salt
    }
}

fn open_connection(path: &Path, intent: OpenIntent, purpose: &str) -> AppResult<Connection> {
    let flags = match intent {
        OpenIntent::ReadOnly => OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_URI,
        OpenIntent::ReadWrite => {
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI
        }
    } | OpenFlags::SQLITE_OPEN_NO_MUTEX;
    let conn = Connection::open_with_flags(path, flags).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "open_connection")
            .with_context("purpose", purpose.to_string())
            .with_context("path", path.display().to_string())
    })?;
    conn.busy_timeout(BUSY_TIMEOUT)
        .map_err(|err| AppError::from(err).with_context("operation", "busy_timeout"))?;
    Ok(conn)
}

/// Replaces `path` with `bytes` via a temporary file in the same directory.
/// On failure the previous contents are untouched.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> AppResult<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => env::current_dir().map_err(AppError::from)?,
    };
    let mut tmp = NamedTempFile::new_in(&parent).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "create_temp_file")
            .with_context("path", path.display().to_string())
    })?;
    tmp.write_all(bytes)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "write_temp_file")
                .with_context("path", path.display().to_string())
        })?;
    tmp.persist(path).map_err(|err| {
        AppError::from(err.error)
            .with_context("operation", "persist_temp_file")
            .with_context("path", path.display().to_string())
    })?;
    if let Ok(dir) = fs::File::open(&parent) {
        dir.sync_all().ok();
    }
    Ok(())
}

/// Free bytes on the volume holding `path` (or its parent when it does not
/// exist yet). Honours the `REPAIRKIT_FAKE_FREE_BYTES` test hook.
pub fn free_disk_space(path: &Path) -> AppResult<u64> {
    if let Some(fake) = config::fake_free_bytes() {
        return Ok(fake);
    }

    let target = if path.exists() {
        path.to_path_buf()
    } else {
        match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => env::current_dir().unwrap_or_else(|_| PathBuf::from("/")),
        }
    };

    available_space(&target).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "available_space")
            .with_context("path", target.display().to_string())
    })
}

/// Fails with `IO/LOW_DISK` unless the volume of `dest` can hold an output
/// derived from `source_bytes`.
pub fn ensure_free_space(dest: &Path, source_bytes: u64) -> AppResult<()> {
    let required = config::required_free_bytes(source_bytes);
    let available = free_disk_space(dest)?;
    if available < required {
        return Err(AppError::new(
            "IO/LOW_DISK",
            format!("Not enough disk space (need ~{}).", format_bytes(required)),
        )
        .with_context("available_bytes", available.to_string())
        .with_context("required_bytes", required.to_string()));
    }
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    if bytes == 0 {
        return "0 MB".to_string();
    }
    let mb = (bytes as f64) / 1_000_000.0;
    if mb < 1.0 {
        "1 MB".to_string()
    } else {
        format!("{:.0} MB", mb.ceil())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn raw_checkouts_are_returned_on_drop() {
        let dir = tempdir().expect("tempdir");
        let db = SqliteDatabase::open(&dir.path().join("live.sqlite3")).expect("open");
        {
            let first = db
                .acquire_raw("test-read", OpenIntent::ReadWrite)
                .expect("raw");
            assert_eq!(first.purpose(), "test-read");
            let _second = db.acquire_raw("test-read-2", OpenIntent::ReadOnly).expect("raw");
            assert_eq!(db.raw_checkouts(), 2);
        }
        assert_eq!(db.raw_checkouts(), 0);
    }

    #[test]
    fn execute_and_query_scalar_round_trip() {
        let dir = tempdir().expect("tempdir");
        let db = SqliteDatabase::open(&dir.path().join("live.sqlite3")).expect("open");
        db.execute("CREATE TABLE t(id INTEGER PRIMARY KEY, v TEXT)", &[])
            .expect("create");
        db.execute(
            "INSERT INTO t(v) VALUES (?1)",
            &[Value::Text("hello".into())],
        )
        .expect("insert");
        let value = db
            .query_scalar("SELECT v FROM t WHERE id = ?1", &[Value::Integer(1)])
            .expect("query");
        assert_eq!(value, Some(Value::Text("hello".into())));
        let missing = db
            .query_scalar("SELECT v FROM t WHERE id = ?1", &[Value::Integer(9)])
            .expect("query");
        assert_eq!(missing, None);
    }

    #[test]
    fn open_existing_rejects_missing_file() {
        let dir = tempdir().expect("tempdir");
        let err = SqliteDatabase::open_existing(&dir.path().join("absent.sqlite3"))
            .expect_err("missing");
        assert_eq!(err.code(), "OPEN/NOT_FOUND");
    }

    #[test]
    fn format_bytes_rounds_up_to_megabytes() {
        assert_eq!(format_bytes(0), "0 MB");
        assert_eq!(format_bytes(10), "1 MB");
        assert_eq!(format_bytes(2_500_000), "3 MB");
    }
}
