use std::fs;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rusqlite::types::Value;
use rusqlite::Connection;
use serde::Serialize;

use super::format::{BackupRecord, SqlValue};
use super::writer::BackupWriter;
use super::{BackupFlags, BackupOutcome, TableDesc};
use crate::cancel::CancelToken;
use crate::cipher::CipherParams;
use crate::config::EngineConfig;
use crate::db::introspect::{
    insertable_columns, list_tables, master_rows, quote_ident, table_columns, table_order, MasterRow,
};
use crate::db::{ensure_free_space, DatabaseHandle, OpenIntent};
use crate::repair::pager::Pager;
use crate::repair::{decode_record, walk_table, RecordShape};
use crate::{AppError, AppResult};

const HANDLE_NAME: &str = "BackupSession";

/// Counters of the last [`BackupSession::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupRunStats {
    pub tables: u64,
    pub rows: u64,
    /// Rows read by the page walker after the source failed mid-table.
    pub rows_salvaged: u64,
    /// Rows the page walker saw but could not decode or filter.
    pub rows_skipped: u64,
}

enum RunEnd {
    Completed,
    Canceled,
}

/// Streams the schema and rows of a live database into a backup file.
///
/// One run at a time; [`BackupSession::cancel_token`] is the only handle
/// meant for other threads.
pub struct BackupSession {
    source: Arc<dyn DatabaseHandle>,
    out_path: PathBuf,
    flags: BackupFlags,
    tables: Option<Vec<TableDesc>>,
    writer: Option<BackupWriter>,
    cancel: CancelToken,
    statement_count: u64,
    stats: BackupRunStats,
    last_error: Option<AppError>,
}

impl std::fmt::Debug for BackupSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupSession")
            .field("source", &self.source.path())
            .field("out_path", &self.out_path)
            .field("flags", &self.flags)
            .field("released", &self.writer.is_none())
            .finish()
    }
}

impl BackupSession {
    /// Binds a session to `out_path` and opens the output without
    /// truncating it.
    pub fn new(
        source: Arc<dyn DatabaseHandle>,
        out_path: &Path,
        key: Option<&[u8]>,
        flags: BackupFlags,
        tables: Option<Vec<TableDesc>>,
    ) -> AppResult<Self> {
        if out_path.as_os_str().is_empty() {
            return Err(AppError::argument("NO_OUTPUT_PATH", "Backup output path is required"));
        }
        let config = EngineConfig::load();
        let writer = BackupWriter::open(out_path, key, flags, &config)?;
        tracing::debug!(
            target: "repairkit",
            event = "backup_session_created",
            source = %source.path().display(),
            out = %out_path.display(),
            flags = ?flags,
            cipher = writer.header().cipher,
            compress = writer.header().compress
        );
        Ok(Self {
            source,
            out_path: out_path.to_path_buf(),
            flags,
            tables,
            writer: Some(writer),
            cancel: CancelToken::new(),
            statement_count: 0,
            stats: BackupRunStats::default(),
            last_error: None,
        })
    }

    /// Like [`BackupSession::new`] with alternating name/condition entries.
    /// An odd-length list is rejected before the output is touched.
    pub fn with_flat_tables(
        source: Arc<dyn DatabaseHandle>,
        out_path: &Path,
        key: Option<&[u8]>,
        flags: BackupFlags,
        flat: Option<&[Option<String>]>,
    ) -> AppResult<Self> {
        let tables = flat.map(TableDesc::from_flat).transpose()?;
        Self::new(source, out_path, key, flags, tables)
    }

    pub fn run(&mut self) -> BackupOutcome {
        let Some(writer) = self.writer.as_mut() else {
            self.last_error = Some(AppError::released(HANDLE_NAME));
            return BackupOutcome::Failed;
        };
        self.stats = BackupRunStats::default();
        let mut job = BackupJob {
            source: self.source.as_ref(),
            out_path: &self.out_path,
            flags: self.flags,
            tables: self.tables.as_deref(),
            cancel: &self.cancel,
            writer: &mut *writer,
            stats: &mut self.stats,
        };
        let result = job.run();
        let outcome = match result {
            Ok(RunEnd::Completed) => BackupOutcome::Ok,
            Ok(RunEnd::Canceled) => BackupOutcome::Canceled,
            Err(err) => {
                // Frames already on disk stay readable; push out what is buffered.
                if let Err(flush_err) = writer.finish() {
                    tracing::debug!(target: "repairkit", event = "backup_flush_after_error_failed", error = %flush_err);
                }
                tracing::warn!(
                    target: "repairkit",
                    event = "backup_failed",
                    out = %self.out_path.display(),
                    error = %err
                );
                self.last_error = Some(err);
                BackupOutcome::Failed
            }
        };
        self.statement_count = writer.statement_count();
        tracing::info!(
            target: "repairkit",
            event = "backup_finished",
            out = %self.out_path.display(),
            outcome = ?outcome,
            statements = self.statement_count,
            tables = self.stats.tables,
            rows = self.stats.rows,
            rows_salvaged = self.stats.rows_salvaged,
            rows_skipped = self.stats.rows_skipped
        );
        outcome
    }

    /// Statements written by the last run.
    pub fn statement_count(&self) -> u64 {
        self.statement_count
    }

    pub fn stats(&self) -> &BackupRunStats {
        &self.stats
    }

    /// Error of the last failed run, if any.
    pub fn last_error(&self) -> Option<&AppError> {
        self.last_error.as_ref()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn out_path(&self) -> &Path {
        &self.out_path
    }

    pub fn is_released(&self) -> bool {
        self.writer.is_none()
    }

    /// Closes the output. Safe to call more than once.
    pub fn release(&mut self) {
        if self.writer.take().is_some() {
            tracing::debug!(
                target: "repairkit",
                event = "backup_session_released",
                out = %self.out_path.display()
            );
        }
    }
}

impl Drop for BackupSession {
    fn drop(&mut self) {
        self.release();
    }
}

struct BackupJob<'a> {
    source: &'a dyn DatabaseHandle,
    out_path: &'a Path,
    flags: BackupFlags,
    tables: Option<&'a [TableDesc]>,
    cancel: &'a CancelToken,
    writer: &'a mut BackupWriter,
    stats: &'a mut BackupRunStats,
}

/// Why the SQL read path of a table stopped early.
struct ReadInterrupted {
    last_rowid: Option<i64>,
    error: AppError,
    /// SQLite reported damaged pages rather than a bad statement or a
    /// failed write.
    corrupt: bool,
}

impl ReadInterrupted {
    fn sqlite(last_rowid: Option<i64>, err: rusqlite::Error, op: &str) -> Self {
        let corrupt = matches!(
            err.sqlite_error_code(),
            Some(rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase)
        );
        Self {
            last_rowid,
            error: AppError::from(err).with_context("operation", op.to_string()),
            corrupt,
        }
    }
}

fn job_canceled(cancel: &CancelToken, stats: &BackupRunStats) -> bool {
    #[cfg(test)]
    if test_hooks::should_cancel(stats) {
        cancel.cancel();
    }
    #[cfg(not(test))]
    let _ = stats;
    cancel.is_canceled()
}

impl BackupJob<'_> {
    fn canceled(&self) -> bool {
        job_canceled(self.cancel, self.stats)
    }

    fn stop(&mut self) -> AppResult<RunEnd> {
        self.writer.finish()?;
        Ok(RunEnd::Canceled)
    }

    fn run(&mut self) -> AppResult<RunEnd> {
        if self.canceled() {
            return Ok(RunEnd::Canceled);
        }
        let source_bytes = fs::metadata(self.source.path()).map(|m| m.len()).unwrap_or(0);
        ensure_free_space(self.out_path, source_bytes)?;

        let conn = self.source.acquire_raw("backup", OpenIntent::ReadOnly)?;
        let tx = conn
            .unchecked_transaction()
            .map_err(|err| AppError::from(err).with_context("operation", "backup_begin"))?;

        let master = master_rows(&tx)?;
        let plan: Vec<TableDesc> = match self.tables {
            Some(tables) => tables.to_vec(),
            None => table_order(&tx, list_tables(&tx)?)?
                .into_sequence()
                .into_iter()
                .map(|name| TableDesc::new(name, None))
                .collect(),
        };

        self.writer.begin()?;
        for desc in &plan {
            if self.canceled() {
                return self.stop();
            }
            let Some(table) = master.iter().find(|row| row.kind == "table" && row.name == desc.name) else {
                tracing::warn!(target: "repairkit", event = "backup_table_missing", table = %desc.name);
                continue;
            };
            if let RunEnd::Canceled = self.backup_table(&tx, &master, table, desc)? {
                return self.stop();
            }
            self.stats.tables += 1;
        }
        drop(tx);
        self.writer.finish()?;
        Ok(RunEnd::Completed)
    }

    fn backup_table(
        &mut self,
        conn: &Connection,
        master: &[MasterRow],
        table: &MasterRow,
        desc: &TableDesc,
    ) -> AppResult<RunEnd> {
        if !self.flags.contains(BackupFlags::NO_CREATE_TABLE) {
            self.writer.push(BackupRecord::Schema {
                sql: table.sql.clone(),
            })?;
            for index in master
                .iter()
                .filter(|row| row.kind == "index" && row.tbl_name == table.name)
            {
                self.writer.push(BackupRecord::Schema {
                    sql: index.sql.clone(),
                })?;
            }
        }
        let columns = insertable_columns(conn, &table.name)?;
        self.writer.push(BackupRecord::Table {
            name: table.name.clone(),
            columns: columns.clone(),
        })?;

        match self.copy_rows(conn, &table.name, &columns, desc.condition.as_deref()) {
            Ok(end) => Ok(end),
            Err(interrupted) if interrupted.corrupt && self.flags.contains(BackupFlags::FIX_CORRUPTION) => {
                tracing::warn!(
                    target: "repairkit",
                    event = "backup_table_read_failed",
                    table = %table.name,
                    last_rowid = ?interrupted.last_rowid,
                    error = %interrupted.error
                );
                self.salvage_rows(conn, table, desc.condition.as_deref(), interrupted.last_rowid)
            }
            Err(interrupted) => Err(interrupted.error.with_context("table", table.name.clone())),
        }
    }

    fn copy_rows(
        &mut self,
        conn: &Connection,
        table: &str,
        columns: &[String],
        condition: Option<&str>,
    ) -> Result<RunEnd, ReadInterrupted> {
        let (mut stmt, has_rowid) = match conn.prepare(&select_sql(table, columns, condition, true)) {
            Ok(stmt) => (stmt, true),
            Err(err) if err.to_string().contains("no such column: rowid") => {
                let stmt = conn
                    .prepare(&select_sql(table, columns, condition, false))
                    .map_err(|err| ReadInterrupted::sqlite(None, err, "prepare_select"))?;
                (stmt, false)
            }
            Err(err) => return Err(ReadInterrupted::sqlite(None, err, "prepare_select")),
        };
        let mut rows = stmt
            .query([])
            .map_err(|err| ReadInterrupted::sqlite(None, err, "query_select"))?;

        let mut last_rowid = None;
        let offset = usize::from(has_rowid);
        loop {
            if self.canceled() {
                return Ok(RunEnd::Canceled);
            }
            let row = match rows.next() {
                Ok(Some(row)) => row,
                Ok(None) => break,
                Err(err) => return Err(ReadInterrupted::sqlite(last_rowid, err, "select_iter")),
            };
            let rowid = if has_rowid {
                row.get::<_, Option<i64>>(0)
                    .map_err(|err| ReadInterrupted::sqlite(last_rowid, err, "read_rowid"))?
            } else {
                None
            };
            let mut values = Vec::with_capacity(columns.len());
            for idx in 0..columns.len() {
                let value: Value = row
                    .get(idx + offset)
                    .map_err(|err| ReadInterrupted::sqlite(last_rowid, err, "read_value"))?;
                values.push(SqlValue::from(value));
            }
            self.writer
                .push(BackupRecord::Row { rowid, values })
                .map_err(|error| ReadInterrupted {
                    last_rowid,
                    error,
                    corrupt: false,
                })?;
            self.stats.rows += 1;
            if rowid.is_some() {
                last_rowid = rowid;
            }
        }
        Ok(RunEnd::Completed)
    }

    /// Reads the rest of `table` straight from the pages of the source file.
    /// Rows are filtered and written as the walker reaches them.
    fn salvage_rows(
        &mut self,
        conn: &Connection,
        table: &MasterRow,
        condition: Option<&str>,
        after: Option<i64>,
    ) -> AppResult<RunEnd> {
        let root = u32::try_from(table.rootpage).unwrap_or(0);
        let (mut pager, _) = Pager::open(self.source.path(), None, CipherParams::default(), None)?;
        let shape = RecordShape::new(&table_columns(conn, &table.name)?);
        let filter = condition.map(|cond| condition_sql(&table.name, shape.columns(), cond));
        let encoding = pager.encoding();

        let cancel = self.cancel;
        let writer = &mut *self.writer;
        let stats = &mut *self.stats;
        let mut skipped = 0;
        let mut canceled = false;
        let mut failure = None;
        let walk = walk_table(&mut pager, root, |rowid, payload| {
            if after.is_some_and(|last| rowid <= last) {
                return ControlFlow::Continue(());
            }
            if job_canceled(cancel, stats) {
                canceled = true;
                return ControlFlow::Break(());
            }
            let Ok(record) = decode_record(payload, encoding) else {
                skipped += 1;
                return ControlFlow::Continue(());
            };
            let values = shape.project(rowid, record);
            if let Some(sql) = &filter {
                let keep: rusqlite::Result<i64> =
                    conn.query_row(sql, rusqlite::params_from_iter(values.iter()), |row| row.get(0));
                match keep {
                    Ok(0) => return ControlFlow::Continue(()),
                    Ok(_) => {}
                    Err(_) => {
                        skipped += 1;
                        return ControlFlow::Continue(());
                    }
                }
            }
            let record = BackupRecord::Row {
                rowid: Some(rowid),
                values: values.into_iter().map(SqlValue::from).collect(),
            };
            if let Err(err) = writer.push(record) {
                failure = Some(err);
                return ControlFlow::Break(());
            }
            stats.rows += 1;
            stats.rows_salvaged += 1;
            ControlFlow::Continue(())
        });
        self.stats.rows_skipped += skipped + walk.damaged_cells;

        if let Some(err) = failure {
            return Err(err.with_context("table", table.name.clone()));
        }
        if canceled {
            return Ok(RunEnd::Canceled);
        }
        Ok(RunEnd::Completed)
    }
}

fn select_sql(table: &str, columns: &[String], condition: Option<&str>, with_rowid: bool) -> String {
    let mut names: Vec<String> = Vec::with_capacity(columns.len() + 1);
    if with_rowid {
        names.push("rowid".to_string());
    }
    names.extend(columns.iter().map(|c| quote_ident(c)));
    let select = if names.is_empty() { "NULL".to_string() } else { names.join(", ") };
    let mut sql = format!("SELECT {select} FROM {}", quote_ident(table));
    if let Some(condition) = condition {
        sql.push_str(&format!(" WHERE ({condition})"));
    }
    if with_rowid {
        sql.push_str(" ORDER BY rowid");
    }
    sql
}

/// Evaluates a row condition against values bound as a one-row table of
/// the same name.
fn condition_sql(table: &str, columns: &[String], condition: &str) -> String {
    let names: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|idx| format!("?{idx}")).collect();
    format!(
        "WITH {}({}) AS (VALUES({})) SELECT count(*) FROM {} WHERE ({condition})",
        quote_ident(table),
        names.join(", "),
        placeholders.join(", "),
        quote_ident(table),
    )
}

#[cfg(test)]
mod test_hooks {
    use std::cell::Cell;

    use super::BackupRunStats;

    // Sessions run on the calling thread, so per-thread limits keep
    // parallel tests apart.
    thread_local! {
        static CANCEL_AFTER_ROWS: Cell<u64> = const { Cell::new(0) };
        static CANCEL_AFTER_SALVAGED: Cell<u64> = const { Cell::new(0) };
    }

    pub(super) fn should_cancel(stats: &BackupRunStats) -> bool {
        let rows = CANCEL_AFTER_ROWS.with(Cell::get);
        let salvaged = CANCEL_AFTER_SALVAGED.with(Cell::get);
        (rows > 0 && stats.rows >= rows) || (salvaged > 0 && stats.rows_salvaged >= salvaged)
    }

    pub(super) fn set_cancel_after_rows(rows: u64) {
        CANCEL_AFTER_ROWS.with(|limit| limit.set(rows));
    }

    pub(super) fn set_cancel_after_salvaged(rows: u64) {
        CANCEL_AFTER_SALVAGED.with(|limit| limit.set(rows));
    }
}
