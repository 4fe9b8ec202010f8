//! Master snapshot: a saved copy of a database's table and index schema plus
//! the cipher salt, used when the damaged file can no longer describe itself.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cipher::KdfSalt;

mod format;
mod store;

pub use store::{MasterSnapshotStore, SnapshotSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Table,
    Index,
}

impl EntryKind {
    pub fn parse(kind: &str) -> Option<Self> {
        match kind {
            "table" => Some(EntryKind::Table),
            "index" => Some(EntryKind::Index),
            _ => None,
        }
    }

    fn tag(self) -> u8 {
        match self {
            EntryKind::Table => 1,
            EntryKind::Index => 2,
        }
    }

    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(EntryKind::Table),
            2 => Some(EntryKind::Index),
            _ => None,
        }
    }
}

/// One `sqlite_master` row worth keeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaEntry {
    pub kind: EntryKind,
    pub name: String,
    pub table_name: String,
    /// Root page of the entry's b-tree at the time it was recorded.
    pub root_page: u32,
    pub sql: String,
}

/// Immutable schema record. The table filter is fixed when the value is
/// built; an empty filter means every table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MasterSnapshot {
    filter: BTreeSet<String>,
    entries: Vec<SchemaEntry>,
    salt: Option<KdfSalt>,
    created_at: Option<DateTime<Utc>>,
}

impl MasterSnapshot {
    pub(crate) fn new(
        filter: BTreeSet<String>,
        entries: Vec<SchemaEntry>,
        salt: Option<KdfSalt>,
        created_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            filter,
            entries,
            salt,
            created_at,
        }
    }

    pub fn filter(&self) -> &BTreeSet<String> {
        &self.filter
    }

    pub fn entries(&self) -> &[SchemaEntry] {
        &self.entries
    }

    pub fn salt(&self) -> Option<KdfSalt> {
        self.salt
    }

    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.created_at
    }

    /// Whether `table` passes the filter.
    pub fn includes(&self, table: &str) -> bool {
        self.filter.is_empty() || self.filter.contains(table)
    }

    pub fn table_entries(&self) -> impl Iterator<Item = &SchemaEntry> {
        self.entries.iter().filter(|e| e.kind == EntryKind::Table)
    }

    /// Drops the snapshot. Taking `self` makes any later use a compile error.
    pub fn release(self) {}
}
