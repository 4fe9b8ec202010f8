use std::path::{Path, PathBuf};

use super::integrity::{IntegrityReport, IntegrityState};
use super::pager::Pager;
use super::schema::{merge_schema, read_live_schema, LiveSchema};
use super::session::{RepairReport, RepairSession};
use super::RepairFlags;
use crate::cancel::CancelToken;
use crate::cipher::{CipherParams, KdfSalt};
use crate::db::DatabaseHandle;
use crate::snapshot::{MasterSnapshot, SchemaEntry};
use crate::{AppError, AppResult};

const HANDLE_NAME: &str = "CorruptionScanner";

struct OpenState {
    pager: Pager,
    snapshot: Option<MasterSnapshot>,
    live: LiveSchema,
    effective_salt: Option<KdfSalt>,
}

/// Reads what it can out of a damaged database file.
///
/// Opening inspects the header, the cipher salt and the schema b-tree; every
/// finding lands in an [`IntegrityReport`] that only ever moves towards
/// `Corrupted`. [`CorruptionScanner::output`] copies the recoverable rows
/// into a destination database.
pub struct CorruptionScanner {
    path: PathBuf,
    state: Option<OpenState>,
    integrity: IntegrityReport,
    cancel: CancelToken,
    last_error: Option<AppError>,
}

impl std::fmt::Debug for CorruptionScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CorruptionScanner")
            .field("path", &self.path)
            .field("released", &self.state.is_none())
            .field("integrity", &self.integrity)
            .finish()
    }
}

impl CorruptionScanner {
    pub fn open(
        path: &Path,
        key: Option<&[u8]>,
        params: CipherParams,
        snapshot: Option<MasterSnapshot>,
    ) -> AppResult<Self> {
        let fallback_salt = snapshot.as_ref().and_then(MasterSnapshot::salt);
        let (mut pager, opened) = Pager::open(path, key, params, fallback_salt)?;

        let mut integrity = opened.integrity;
        let live = read_live_schema(&mut pager);
        if live.stats.saw_damage() {
            integrity.observe_data(IntegrityState::Corrupted);
        }

        tracing::info!(
            target: "repairkit",
            event = "scanner_opened",
            path = %path.display(),
            encrypted = pager.is_encrypted(),
            page_count = pager.page_count(),
            live_entries = live.entries.len(),
            snapshot_entries = snapshot.as_ref().map_or(0, |s| s.entries().len()),
            header = ?integrity.header,
            data = ?integrity.data,
            kdf_salt = ?integrity.kdf_salt
        );

        Ok(Self {
            path: path.to_path_buf(),
            state: Some(OpenState {
                pager,
                snapshot,
                live,
                effective_salt: opened.effective_salt,
            }),
            integrity,
            cancel: CancelToken::new(),
            last_error: None,
        })
    }

    fn state(&self) -> AppResult<&OpenState> {
        self.state.as_ref().ok_or_else(|| AppError::released(HANDLE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copies every recoverable row into `dest`. Returns whether at least
    /// one row made it across.
    pub fn output(&mut self, dest: &dyn DatabaseHandle, flags: RepairFlags) -> AppResult<bool> {
        self.output_with_report(dest, flags)
            .map(|report| report.rows_recovered > 0)
    }

    pub fn output_with_report(
        &mut self,
        dest: &dyn DatabaseHandle,
        flags: RepairFlags,
    ) -> AppResult<RepairReport> {
        let result = self.run_output(dest, flags);
        self.cancel.reset();
        match &result {
            Ok(report) => {
                self.integrity.merge(report.integrity);
                if let Some(sample) = report.skipped_examples.last() {
                    self.last_error = Some(
                        AppError::format("RECORD", sample.error.clone())
                            .with_context("table", sample.table.clone()),
                    );
                }
                tracing::info!(
                    target: "repairkit",
                    event = "repair_output_done",
                    path = %self.path.display(),
                    dest = %dest.path().display(),
                    rows_recovered = report.rows_recovered,
                    rows_failed = report.rows_failed,
                    damaged_pages = report.damaged_pages,
                    damaged_cells = report.damaged_cells,
                    canceled = report.canceled
                );
            }
            Err(err) => {
                tracing::warn!(
                    target: "repairkit",
                    event = "repair_output_failed",
                    path = %self.path.display(),
                    error = %err
                );
                self.last_error = Some(err.clone());
            }
        }
        result
    }

    fn run_output(&mut self, dest: &dyn DatabaseHandle, flags: RepairFlags) -> AppResult<RepairReport> {
        let cancel = self.cancel.clone();
        let state = self
            .state
            .as_mut()
            .ok_or_else(|| AppError::released(HANDLE_NAME))?;

        let entries = merge_schema(&state.live.entries, state.snapshot.as_ref());
        let scope = match &state.snapshot {
            Some(snapshot) if !flags.contains(RepairFlags::ALL_TABLES) && !snapshot.filter().is_empty() => {
                Some(snapshot.filter())
            }
            _ => None,
        };

        RepairSession {
            pager: &mut state.pager,
            entries: &entries,
            scope,
            flags,
            cancel: &cancel,
            schema_stats: state.live.stats,
        }
        .run(dest)
    }

    /// Schema the next [`CorruptionScanner::output`] will work from.
    pub fn schema(&self) -> AppResult<Vec<SchemaEntry>> {
        let state = self.state()?;
        Ok(merge_schema(&state.live.entries, state.snapshot.as_ref()))
    }

    /// Salt that decrypted the file, for encrypted sources.
    pub fn effective_salt(&self) -> AppResult<Option<KdfSalt>> {
        Ok(self.state()?.effective_salt)
    }

    pub fn integrity(&self) -> AppResult<IntegrityReport> {
        self.state()?;
        Ok(self.integrity)
    }

    pub fn is_header_corrupted(&self) -> AppResult<bool> {
        Ok(self.integrity()?.header.is_corrupted())
    }

    pub fn is_data_corrupted(&self) -> AppResult<bool> {
        Ok(self.integrity()?.data.is_corrupted())
    }

    pub fn is_salt_corrupted(&self) -> AppResult<bool> {
        Ok(self.integrity()?.kdf_salt.is_corrupted())
    }

    /// Last per-unit failure seen by this scanner. Diagnostic only; calls
    /// return their own errors.
    pub fn last_error(&self) -> Option<&AppError> {
        self.last_error.as_ref()
    }

    /// A handle that stops a running [`CorruptionScanner::output`] from
    /// another thread. The current table is committed before it returns.
    ///
    /// A cancel applies to one pass: the running one, or the next if none
    /// is running. The flag clears when that pass returns.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_released(&self) -> bool {
        self.state.is_none()
    }

    /// Closes the file and drops the attached snapshot. Safe to call twice.
    pub fn release(&mut self) {
        if let Some(state) = self.state.take() {
            tracing::debug!(
                target: "repairkit",
                event = "scanner_released",
                path = %self.path.display(),
                pages_read = state.pager.pages_read(),
                pages_faulted = state.pager.pages_faulted()
            );
        }
    }
}

impl Drop for CorruptionScanner {
    fn drop(&mut self) {
        self.release();
    }
}
