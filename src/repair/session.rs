use std::collections::{BTreeMap, BTreeSet};
use std::ops::ControlFlow;

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};
use serde::Serialize;

use super::btree::{walk_table, WalkStats};
use super::integrity::{IntegrityReport, IntegrityState};
use super::pager::Pager;
use super::record::decode_record;
use super::RepairFlags;
use crate::cancel::CancelToken;
use crate::config::EngineConfig;
use crate::db::introspect::{
    build_insert_sql, foreign_key_violations, is_without_rowid, rowid_alias_index, table_columns,
    table_order, ColumnInfo,
};
use crate::db::{DatabaseHandle, OpenIntent};
use crate::snapshot::{EntryKind, SchemaEntry};
use crate::{AppError, AppResult};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableRepairStats {
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub damaged_pages: u64,
    pub damaged_cells: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedRow {
    pub table: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rowid: Option<i64>,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedTable {
    pub name: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairReport {
    pub app_version: String,
    pub tables: BTreeMap<String, TableRepairStats>,
    pub skipped_tables: Vec<SkippedTable>,
    pub skipped_examples: Vec<SkippedRow>,
    pub rows_recovered: u64,
    pub rows_failed: u64,
    pub damaged_pages: u64,
    pub damaged_cells: u64,
    pub index_failures: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub foreign_key_errors: Vec<SkippedRow>,
    /// Tables restored after the acyclic ones because their foreign keys
    /// loop back on each other.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub foreign_key_cycles: Vec<String>,
    pub integrity: IntegrityReport,
    pub canceled: bool,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
}

/// Maps decoded records onto the insertable columns of a destination table.
#[derive(Debug, Clone)]
pub(crate) struct RecordShape {
    /// For each stored column in record order: whether it is insertable.
    stored: Vec<bool>,
    /// Position of the rowid alias among stored columns.
    alias: Option<usize>,
    insertable: Vec<String>,
}

impl RecordShape {
    pub(crate) fn new(columns: &[ColumnInfo]) -> Self {
        let stored_columns: Vec<&ColumnInfo> = columns.iter().filter(|c| c.is_stored()).collect();
        let alias = rowid_alias_index(columns).and_then(|idx| {
            let name = &columns[idx].name;
            stored_columns.iter().position(|c| &c.name == name)
        });
        Self {
            stored: stored_columns.iter().map(|c| c.is_insertable()).collect(),
            alias,
            insertable: columns
                .iter()
                .filter(|c| c.is_insertable())
                .map(|c| c.name.clone())
                .collect(),
        }
    }

    pub(crate) fn columns(&self) -> &[String] {
        &self.insertable
    }

    /// Values for the insertable columns. Short records (columns added by
    /// `ALTER TABLE`) are padded with NULL.
    pub(crate) fn project(&self, rowid: i64, mut record: Vec<Value>) -> Vec<Value> {
        record.resize(self.stored.len().max(record.len()), Value::Null);
        let mut out = Vec::with_capacity(self.insertable.len());
        for (idx, (value, insertable)) in record.into_iter().zip(self.stored.iter()).enumerate() {
            if !insertable {
                continue;
            }
            if Some(idx) == self.alias && value == Value::Null {
                out.push(Value::Integer(rowid));
            } else {
                out.push(value);
            }
        }
        out
    }
}

/// One pass of recovered rows from a [`Pager`] into a destination.
pub(crate) struct RepairSession<'a> {
    pub pager: &'a mut Pager,
    pub entries: &'a [SchemaEntry],
    /// Tables to transfer; `None` means every table in `entries`.
    pub scope: Option<&'a BTreeSet<String>>,
    pub flags: RepairFlags,
    pub cancel: &'a CancelToken,
    pub schema_stats: WalkStats,
}

impl RepairSession<'_> {
    pub(crate) fn run(mut self, dest: &dyn DatabaseHandle) -> AppResult<RepairReport> {
        let started_at = Utc::now();
        let config = EngineConfig::load();
        let mut conn = dest.acquire_raw("repair-output", OpenIntent::ReadWrite)?;
        conn.execute_batch("PRAGMA foreign_keys = OFF;")
            .map_err(|err| AppError::from(err).with_context("operation", "disable_foreign_keys"))?;

        let mut report = RepairReport {
            app_version: env!("CARGO_PKG_VERSION").to_string(),
            tables: BTreeMap::new(),
            skipped_tables: Vec::new(),
            skipped_examples: Vec::new(),
            rows_recovered: 0,
            rows_failed: 0,
            damaged_pages: self.schema_stats.damaged_pages,
            damaged_cells: self.schema_stats.damaged_cells,
            index_failures: 0,
            foreign_key_errors: Vec::new(),
            foreign_key_cycles: Vec::new(),
            integrity: IntegrityReport::default(),
            canceled: false,
            started_at,
            completed_at: started_at,
        };

        let tables: Vec<&SchemaEntry> = self
            .entries
            .iter()
            .filter(|e| e.kind == EntryKind::Table)
            .filter(|e| self.scope.map_or(true, |scope| scope.contains(&e.name)))
            .collect();

        let mut ready = Vec::new();
        for table in &tables {
            if is_without_rowid(&table.sql) {
                report.skipped_tables.push(SkippedTable {
                    name: table.name.clone(),
                    reason: "WITHOUT ROWID tables are not recovered".to_string(),
                });
                continue;
            }
            if !self.flags.contains(RepairFlags::NO_CREATE_TABLES) {
                if let Err(err) = run_ddl(&conn, &table.sql) {
                    report.skipped_tables.push(SkippedTable {
                        name: table.name.clone(),
                        reason: err.to_string(),
                    });
                    continue;
                }
                for index in self
                    .entries
                    .iter()
                    .filter(|e| e.kind == EntryKind::Index && e.table_name == table.name)
                {
                    if let Err(err) = run_ddl(&conn, &index.sql) {
                        report.index_failures += 1;
                        tracing::warn!(
                            target: "repairkit",
                            event = "repair_index_failed",
                            index = %index.name,
                            error = %err
                        );
                    }
                }
            }
            ready.push(table.name.clone());
        }

        let order = table_order(&conn, ready)?;
        report.foreign_key_cycles = order.cyclic.clone();
        let roots: BTreeMap<&str, u32> = tables.iter().map(|t| (t.name.as_str(), t.root_page)).collect();

        for name in order.into_sequence() {
            if self.cancel.is_canceled() {
                report.canceled = true;
                break;
            }
            let Some(&root) = roots.get(name.as_str()) else {
                continue;
            };
            let columns = table_columns(&conn, &name)?;
            if columns.is_empty() {
                report.skipped_tables.push(SkippedTable {
                    name: name.clone(),
                    reason: "table does not exist in the destination".to_string(),
                });
                continue;
            }
            let shape = RecordShape::new(&columns);
            let (stats, canceled) =
                transfer_table(&mut *self.pager, &mut conn, &name, root, &shape, self.cancel, &config, &mut report)?;

            tracing::info!(
                target: "repairkit",
                event = "repair_table_done",
                table = %name,
                attempted = stats.attempted,
                succeeded = stats.succeeded,
                failed = stats.failed,
                damaged_pages = stats.damaged_pages,
                damaged_cells = stats.damaged_cells
            );
            report.rows_recovered += stats.succeeded;
            report.rows_failed += stats.failed;
            report.damaged_pages += stats.damaged_pages;
            report.damaged_cells += stats.damaged_cells;
            report.tables.insert(name, stats);
            if canceled {
                report.canceled = true;
                break;
            }
        }

        match foreign_key_violations(&conn) {
            Ok(rows) => {
                report.foreign_key_errors = rows
                    .into_iter()
                    .map(|(table, rowid, parent)| SkippedRow {
                        table,
                        rowid,
                        error: format!("references missing {parent}"),
                    })
                    .collect();
            }
            Err(err) => {
                tracing::warn!(target: "repairkit", event = "repair_fk_check_failed", error = %err);
            }
        }

        let damaged = report.damaged_pages > 0 || report.damaged_cells > 0;
        report.integrity.observe_data(if damaged {
            IntegrityState::Corrupted
        } else {
            IntegrityState::Healthy
        });
        report.completed_at = Utc::now();
        Ok(report)
    }
}

fn run_ddl(conn: &Connection, sql: &str) -> AppResult<()> {
    match conn.execute_batch(sql) {
        Ok(()) => Ok(()),
        Err(err) if err.to_string().contains("already exists") => Ok(()),
        Err(err) => Err(AppError::from(err).with_context("operation", "repair_ddl")),
    }
}

fn push_sample(report: &mut RepairReport, limit: usize, sample: SkippedRow) {
    if report.skipped_examples.len() < limit {
        report.skipped_examples.push(sample);
    }
}

#[allow(clippy::too_many_arguments)]
fn transfer_table(
    pager: &mut Pager,
    conn: &mut Connection,
    table: &str,
    root: u32,
    shape: &RecordShape,
    cancel: &CancelToken,
    config: &EngineConfig,
    report: &mut RepairReport,
) -> AppResult<(TableRepairStats, bool)> {
    let tx = conn.transaction().map_err(|err| {
        AppError::from(err)
            .with_context("operation", "repair_begin")
            .with_context("table", table.to_string())
    })?;
    let mut stats = TableRepairStats::default();
    let mut canceled = false;
    {
        let mut insert = tx
            .prepare_cached(&build_insert_sql(table, shape.columns(), true))
            .map_err(|err| {
                AppError::from(err)
                    .with_context("operation", "prepare_insert")
                    .with_context("table", table.to_string())
            })?;
        let encoding = pager.encoding();
        let walk = walk_table(pager, root, |rowid, payload| {
            if cancel.is_canceled() {
                canceled = true;
                return ControlFlow::Break(());
            }
            let record = match decode_record(payload, encoding) {
                Ok(record) => record,
                Err(fault) => {
                    stats.damaged_cells += 1;
                    push_sample(
                        report,
                        config.skip_sample_limit,
                        SkippedRow {
                            table: table.to_string(),
                            rowid: Some(rowid),
                            error: fault.to_string(),
                        },
                    );
                    return ControlFlow::Continue(());
                }
            };
            stats.attempted += 1;
            let mut values = vec![Value::Integer(rowid)];
            values.extend(shape.project(rowid, record));
            match insert.execute(params_from_iter(values.iter())) {
                Ok(_) => stats.succeeded += 1,
                Err(err) => {
                    stats.failed += 1;
                    push_sample(
                        report,
                        config.skip_sample_limit,
                        SkippedRow {
                            table: table.to_string(),
                            rowid: Some(rowid),
                            error: err.to_string(),
                        },
                    );
                }
            }
            ControlFlow::Continue(())
        });
        stats.damaged_pages += walk.damaged_pages;
        stats.damaged_cells += walk.damaged_cells;
    }
    tx.commit().map_err(|err| {
        AppError::from(err)
            .with_context("operation", "repair_commit")
            .with_context("table", table.to_string())
    })?;
    Ok((stats, canceled))
}
