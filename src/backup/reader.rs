use std::fs::File;
use std::io::{BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use serde::Serialize;

use super::format::{read_frame, read_header, BackupHeader, BackupRecord, FrameCodec, FrameRead, HEADER_LEN};
use crate::cipher::PageCipher;
use crate::db::introspect::build_replace_sql;
use crate::db::{DatabaseHandle, OpenIntent};
use crate::{AppError, AppResult};

/// Sequential reader over the frames of a backup file.
pub struct BackupReader {
    path: PathBuf,
    reader: BufReader<File>,
    header: BackupHeader,
    codec: FrameCodec,
    next_frame: u64,
    truncated: bool,
    done: bool,
}

impl std::fmt::Debug for BackupReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupReader")
            .field("path", &self.path)
            .field("header", &self.header)
            .field("next_frame", &self.next_frame)
            .finish()
    }
}

impl BackupReader {
    /// Opens a backup and checks `key` against its first frame.
    pub fn open(path: &Path, key: Option<&[u8]>) -> AppResult<Self> {
        let file = File::open(path).map_err(|err| {
            let code = if err.kind() == std::io::ErrorKind::NotFound {
                "NOT_FOUND"
            } else {
                "CANNOT_OPEN"
            };
            AppError::open(code, "Backup file could not be opened")
                .with_cause(err)
                .with_context("path", path.display().to_string())
        })?;
        let mut reader = BufReader::new(file);
        let header = read_header(&mut reader)
            .map_err(|err| err.with_context("path", path.display().to_string()))?;

        let cipher = match (header.cipher, key) {
            (false, _) => None,
            (true, None) => {
                return Err(AppError::crypto("KEY_REQUIRED", "Backup is encrypted and no key was supplied")
                    .with_context("path", path.display().to_string()))
            }
            (true, Some(key)) => Some(PageCipher::from_passphrase(key, &header.salt, header.kdf_iterations)?),
        };
        let level = header.compress.then_some(0);
        let mut this = Self {
            path: path.to_path_buf(),
            reader,
            header,
            codec: FrameCodec::new(cipher, level),
            next_frame: 0,
            truncated: false,
            done: false,
        };

        if this.header.cipher {
            if let FrameRead::Frame(payload) = read_frame(&mut this.reader)? {
                this.codec.decode(0, &payload).map_err(|err| {
                    AppError::crypto("WRONG_KEY", "Backup cannot be decrypted with this key")
                        .with_cause(err)
                        .with_context("path", path.display().to_string())
                })?;
            }
            this.reader.seek(SeekFrom::Start(HEADER_LEN as u64))?;
        }
        Ok(this)
    }

    pub fn header(&self) -> &BackupHeader {
        &self.header
    }

    /// Whether reading stopped at an incomplete or damaged tail frame.
    pub fn truncated(&self) -> bool {
        self.truncated
    }

    /// Records of the next frame, or `None` once the intact part of the file
    /// is exhausted.
    pub fn next_frame(&mut self) -> AppResult<Option<Vec<BackupRecord>>> {
        if self.done {
            return Ok(None);
        }
        match read_frame(&mut self.reader)? {
            FrameRead::Frame(payload) => {
                let records = self.codec.decode(self.next_frame, &payload)?;
                self.next_frame += 1;
                Ok(Some(records))
            }
            FrameRead::End => {
                self.done = true;
                Ok(None)
            }
            FrameRead::Torn => {
                self.done = true;
                self.truncated = true;
                tracing::warn!(
                    target: "repairkit",
                    event = "backup_torn_tail",
                    path = %self.path.display(),
                    frames = self.next_frame
                );
                Ok(None)
            }
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RestoreReport {
    pub frames: u64,
    pub statements_applied: u64,
    pub statements_failed: u64,
    pub truncated: bool,
    pub tables: Vec<String>,
}

struct TableContext {
    with_rowid: String,
    without_rowid: String,
}

fn apply_schema(conn: &Connection, sql: &str) -> rusqlite::Result<()> {
    match conn.execute_batch(sql) {
        Err(err) if err.to_string().contains("already exists") => Ok(()),
        other => other,
    }
}

/// Replays a backup into `dest`. Rows with an existing key are replaced;
/// statements that fail are counted and skipped.
pub fn restore(path: &Path, key: Option<&[u8]>, dest: &dyn DatabaseHandle) -> AppResult<RestoreReport> {
    let mut reader = BackupReader::open(path, key)?;
    let mut conn = dest.acquire_raw("restore", OpenIntent::ReadWrite)?;
    conn.execute_batch("PRAGMA foreign_keys = OFF;")
        .map_err(|err| AppError::from(err).with_context("operation", "disable_foreign_keys"))?;

    let mut report = RestoreReport::default();
    let mut current: Option<TableContext> = None;
    while let Some(records) = reader.next_frame()? {
        let tx = conn
            .transaction()
            .map_err(|err| AppError::from(err).with_context("operation", "restore_begin"))?;
        for record in records {
            match record {
                BackupRecord::Schema { sql } => match apply_schema(&tx, &sql) {
                    Ok(()) => report.statements_applied += 1,
                    Err(err) => {
                        report.statements_failed += 1;
                        tracing::debug!(target: "repairkit", event = "restore_schema_failed", error = %err);
                    }
                },
                BackupRecord::Table { name, columns } => {
                    current = Some(TableContext {
                        with_rowid: build_replace_sql(&name, &columns, true),
                        without_rowid: build_replace_sql(&name, &columns, false),
                    });
                    if !report.tables.contains(&name) {
                        report.tables.push(name);
                    }
                }
                BackupRecord::Row { rowid, values } => {
                    let Some(table) = current.as_ref() else {
                        report.statements_failed += 1;
                        continue;
                    };
                    let mut params: Vec<Value> = Vec::with_capacity(values.len() + 1);
                    let sql = match rowid {
                        Some(rowid) => {
                            params.push(Value::Integer(rowid));
                            &table.with_rowid
                        }
                        None => &table.without_rowid,
                    };
                    params.extend(values.into_iter().map(Value::from));
                    let result = tx
                        .prepare_cached(sql)
                        .and_then(|mut stmt| stmt.execute(params_from_iter(params.iter())));
                    match result {
                        Ok(_) => report.statements_applied += 1,
                        Err(err) => {
                            report.statements_failed += 1;
                            tracing::debug!(target: "repairkit", event = "restore_row_failed", error = %err);
                        }
                    }
                }
            }
        }
        tx.commit()
            .map_err(|err| AppError::from(err).with_context("operation", "restore_commit"))?;
        report.frames += 1;
    }
    report.truncated = reader.truncated();

    tracing::info!(
        target: "repairkit",
        event = "backup_restored",
        path = %path.display(),
        frames = report.frames,
        applied = report.statements_applied,
        failed = report.statements_failed,
        truncated = report.truncated
    );
    Ok(report)
}
