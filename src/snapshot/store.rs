use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use chrono::Utc;
use serde::Serialize;

use super::{format, EntryKind, MasterSnapshot, SchemaEntry};
use crate::config::EngineConfig;
use crate::db::introspect::master_rows;
use crate::db::{write_atomic, DatabaseHandle, OpenIntent};
use crate::{AppError, AppResult};

/// What [`MasterSnapshotStore::try_save`] wrote.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSummary {
    pub path: String,
    pub tables: usize,
    pub indexes: usize,
    pub encrypted: bool,
    pub has_salt: bool,
}

/// Builds, persists and loads [`MasterSnapshot`] values.
pub struct MasterSnapshotStore;

impl MasterSnapshotStore {
    /// A snapshot holding only a table filter.
    pub fn make<I, S>(filter: I) -> MasterSnapshot
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        MasterSnapshot::new(collect_filter(filter), Vec::new(), None, None)
    }

    /// Reads a snapshot file, keeping only entries of tables in `filter`.
    /// Without a path this is the same as [`MasterSnapshotStore::make`].
    pub fn load<I, S>(path: Option<&Path>, key: Option<&[u8]>, filter: I) -> AppResult<MasterSnapshot>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let filter = collect_filter(filter);
        let Some(path) = path else {
            return Ok(MasterSnapshot::new(filter, Vec::new(), None, None));
        };

        let bytes = fs::read(path).map_err(|err| {
            let base = if err.kind() == std::io::ErrorKind::NotFound {
                AppError::open("NOT_FOUND", "Snapshot file does not exist")
            } else {
                AppError::open("READ_FAILED", "Snapshot file could not be read")
            };
            base.with_cause(err)
                .with_context("path", path.display().to_string())
        })?;
        let decoded = format::decode(&bytes, key, &filter)
            .map_err(|err| err.with_context("path", path.display().to_string()))?;

        tracing::info!(
            target: "repairkit",
            event = "snapshot_loaded",
            path = %path.display(),
            entries = decoded.entries.len(),
            encrypted = decoded.encrypted,
            has_salt = decoded.salt.is_some()
        );

        Ok(MasterSnapshot::new(
            filter,
            decoded.entries,
            decoded.salt,
            decoded.created_at,
        ))
    }

    /// Records the schema of `source` into `path`. Returns `false` on any
    /// failure; the reason is logged.
    pub fn save(source: &dyn DatabaseHandle, path: &Path, key: Option<&[u8]>) -> bool {
        match Self::try_save(source, path, key) {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(
                    target: "repairkit",
                    event = "snapshot_save_failed",
                    error = %err,
                    path = %path.display()
                );
                false
            }
        }
    }

    pub fn try_save(
        source: &dyn DatabaseHandle,
        path: &Path,
        key: Option<&[u8]>,
    ) -> AppResult<SnapshotSummary> {
        let entries = {
            let conn = source.acquire_raw("master-snapshot", OpenIntent::ReadOnly)?;
            master_rows(&conn)?
                .into_iter()
                .filter_map(|row| {
                    let kind = EntryKind::parse(&row.kind)?;
                    Some(SchemaEntry {
                        kind,
                        name: row.name,
                        table_name: row.tbl_name,
                        root_page: u32::try_from(row.rootpage).unwrap_or(0),
                        sql: row.sql,
                    })
                })
                .collect::<Vec<_>>()
        };
        let salt = source.kdf_salt();
        let iterations = EngineConfig::load().file_kdf_iterations;
        let bytes = format::encode(&entries, salt, Utc::now(), key.map(|k| (k, iterations)))?;
        write_atomic(path, &bytes).map_err(|err| err.with_context("operation", "write_snapshot"))?;

        let summary = SnapshotSummary {
            path: path.display().to_string(),
            tables: entries.iter().filter(|e| e.kind == EntryKind::Table).count(),
            indexes: entries.iter().filter(|e| e.kind == EntryKind::Index).count(),
            encrypted: key.is_some(),
            has_salt: salt.is_some(),
        };
        tracing::info!(
            target: "repairkit",
            event = "snapshot_saved",
            path = %path.display(),
            tables = summary.tables,
            indexes = summary.indexes,
            encrypted = summary.encrypted
        );
        Ok(summary)
    }

    pub fn release(snapshot: MasterSnapshot) {
        snapshot.release();
    }
}

fn collect_filter<I, S>(filter: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    filter.into_iter().map(Into::into).collect()
}
