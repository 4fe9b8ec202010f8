//! Salvage of rows from damaged database files.

use bitflags::bitflags;

mod btree;
mod integrity;
pub(crate) mod pager;
mod record;
mod schema;
mod scanner;
mod session;

pub use btree::WalkStats;
pub use integrity::{IntegrityBits, IntegrityReport, IntegrityState};
pub use scanner::CorruptionScanner;
pub use session::{RepairReport, SkippedRow, SkippedTable, TableRepairStats};

pub(crate) use btree::walk_table;
pub(crate) use record::decode_record;
pub(crate) use session::RecordShape;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RepairFlags: u32 {
        /// Write into tables that already exist in the destination.
        const NO_CREATE_TABLES = 1;
        /// Ignore the snapshot's table filter.
        const ALL_TABLES = 2;
    }
}
