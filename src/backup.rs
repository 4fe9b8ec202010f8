//! Portable logical backups: schema and rows streamed into framed,
//! optionally compressed and encrypted files, plus the matching restore.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use bitflags::bitflags;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::{AppError, AppResult};

mod format;
mod reader;
mod session;
mod writer;

pub use format::{BackupHeader, BackupRecord, SqlValue, HEADER_LEN};
pub use reader::{restore, BackupReader, RestoreReport};
pub use session::{BackupRunStats, BackupSession};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BackupFlags: u32 {
        /// Write plain frames even when a key is given.
        const NO_CIPHER = 1;
        const NO_COMPRESS = 2;
        /// Fall back to a tolerant page walk when a source table cannot be read.
        const FIX_CORRUPTION = 4;
        /// Leave `CREATE TABLE` / `CREATE INDEX` out of the stream.
        const NO_CREATE_TABLE = 8;
        /// Append to an existing backup instead of replacing it.
        const INCREMENTAL = 16;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupOutcome {
    Ok,
    Canceled,
    Failed,
}

/// A table to back up and an optional SQL condition selecting its rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableDesc {
    pub name: String,
    pub condition: Option<String>,
}

impl TableDesc {
    pub fn new(name: impl Into<String>, condition: Option<&str>) -> Self {
        Self {
            name: name.into(),
            condition: condition.map(str::to_string),
        }
    }

    /// Parses `name` or `name=condition`.
    pub fn parse(spec: &str) -> AppResult<Self> {
        let (name, condition) = match spec.split_once('=') {
            Some((name, condition)) => (name.trim(), Some(condition.trim())),
            None => (spec.trim(), None),
        };
        if name.is_empty() {
            return Err(AppError::argument("TABLE_DESC", "Table name must not be empty")
                .with_context("value", spec.to_string()));
        }
        Ok(Self::new(name, condition.filter(|c| !c.is_empty())))
    }

    /// Builds descriptions from alternating name/condition entries.
    pub fn from_flat(flat: &[Option<String>]) -> AppResult<Vec<Self>> {
        if flat.len() % 2 != 0 {
            return Err(AppError::argument(
                "ODD_TABLE_DESC",
                "Table description must hold name/condition pairs",
            )
            .with_context("len", flat.len().to_string()));
        }
        flat.chunks_exact(2)
            .enumerate()
            .map(|(idx, pair)| match &pair[0] {
                Some(name) if !name.is_empty() => Ok(Self {
                    name: name.clone(),
                    condition: pair[1].clone(),
                }),
                _ => Err(AppError::argument("TABLE_DESC", "Table name must not be null")
                    .with_context("index", (idx * 2).to_string())),
            })
            .collect()
    }
}

/// Hex sha256 of a file, used to fingerprint finished backups.
pub fn file_sha256(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("open file for hashing: {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0_u8; 8192];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
