use std::collections::HashSet;
use std::ops::ControlFlow;

use rusqlite::types::Value;

use super::btree::{walk_table, WalkStats};
use super::pager::Pager;
use super::record::decode_record;
use crate::db::introspect::{is_internal_name, is_virtual_table_sql};
use crate::snapshot::{EntryKind, MasterSnapshot, SchemaEntry};

const MASTER_ROOT: u32 = 1;

/// Schema rows that could be read from the file's own `sqlite_master`.
#[derive(Debug, Clone, Default)]
pub struct LiveSchema {
    pub entries: Vec<SchemaEntry>,
    pub stats: WalkStats,
}

fn text(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Text(text) => Some(text.clone()),
        _ => None,
    }
}

enum MasterRecord {
    Entry(SchemaEntry),
    /// Views, triggers and auto-indexes without SQL.
    Ignored,
    Malformed,
}

fn classify(values: &[Value]) -> MasterRecord {
    let Some(kind) = text(values.first()) else {
        return MasterRecord::Malformed;
    };
    let Some(kind) = EntryKind::parse(&kind) else {
        return match kind.as_str() {
            "view" | "trigger" => MasterRecord::Ignored,
            _ => MasterRecord::Malformed,
        };
    };
    let (Some(name), Some(table_name)) = (text(values.get(1)), text(values.get(2))) else {
        return MasterRecord::Malformed;
    };
    let root_page = match values.get(3) {
        Some(Value::Integer(page)) => match u32::try_from(*page) {
            Ok(page) => page,
            Err(_) => return MasterRecord::Malformed,
        },
        _ => return MasterRecord::Malformed,
    };
    match values.get(4) {
        Some(Value::Text(sql)) => MasterRecord::Entry(SchemaEntry {
            kind,
            name,
            table_name,
            root_page,
            sql: sql.clone(),
        }),
        Some(Value::Null) | None => MasterRecord::Ignored,
        Some(_) => MasterRecord::Malformed,
    }
}

fn is_recoverable(entry: &SchemaEntry) -> bool {
    entry.root_page > 0
        && !is_internal_name(&entry.name)
        && !is_internal_name(&entry.table_name)
        && !(entry.kind == EntryKind::Table && is_virtual_table_sql(&entry.sql))
}

/// Walks `sqlite_master` from page 1, keeping every row that decodes.
pub fn read_live_schema(pager: &mut Pager) -> LiveSchema {
    let encoding = pager.encoding();
    let mut entries = Vec::new();
    let mut bad_records = 0;
    let mut stats = walk_table(pager, MASTER_ROOT, |_, payload| {
        match decode_record(payload, encoding).map(|values| classify(&values)) {
            Ok(MasterRecord::Entry(entry)) => entries.push(entry),
            Ok(MasterRecord::Ignored) => {}
            Ok(MasterRecord::Malformed) | Err(_) => bad_records += 1,
        }
        ControlFlow::Continue(())
    });
    stats.damaged_cells += bad_records;
    entries.retain(is_recoverable);

    tracing::debug!(
        target: "repairkit",
        event = "live_schema_read",
        entries = entries.len(),
        damaged_pages = stats.damaged_pages,
        damaged_cells = stats.damaged_cells
    );
    LiveSchema { entries, stats }
}

/// Live entries in file order, followed by snapshot entries the live
/// schema does not name.
pub fn merge_schema(live: &[SchemaEntry], snapshot: Option<&MasterSnapshot>) -> Vec<SchemaEntry> {
    let mut merged: Vec<SchemaEntry> = live.to_vec();
    let mut names: HashSet<String> = live.iter().map(|entry| entry.name.clone()).collect();
    if let Some(snapshot) = snapshot {
        for entry in snapshot.entries() {
            if is_recoverable(entry) && names.insert(entry.name.clone()) {
                merged.push(entry.clone());
            }
        }
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::CipherParams;
    use rusqlite::Connection;
    use tempfile::tempdir;

    fn entry(kind: EntryKind, name: &str, table: &str, root: u32) -> SchemaEntry {
        SchemaEntry {
            kind,
            name: name.into(),
            table_name: table.into(),
            root_page: root,
            sql: format!("CREATE TABLE {name}(x)"),
        }
    }

    #[test]
    fn reads_master_rows_from_page_one() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("schema.sqlite3");
        let conn = Connection::open(&path).expect("open");
        conn.execute_batch(
            "CREATE TABLE a(id INTEGER PRIMARY KEY, v TEXT);
             CREATE TABLE b(id INTEGER PRIMARY KEY AUTOINCREMENT, v TEXT);
             CREATE INDEX a_v ON a(v);
             CREATE VIEW av AS SELECT * FROM a;",
        )
        .expect("schema");
        drop(conn);

        let (mut pager, _) = Pager::open(&path, None, CipherParams::default(), None).expect("pager");
        let live = read_live_schema(&mut pager);
        let names: Vec<_> = live.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "a_v"]);
        assert!(!live.stats.saw_damage());
    }

    #[test]
    fn live_entries_win_over_snapshot() {
        let live = vec![entry(EntryKind::Table, "a", "a", 2)];
        let snapshot = MasterSnapshot::new(
            Default::default(),
            vec![
                entry(EntryKind::Table, "a", "a", 9),
                entry(EntryKind::Table, "b", "b", 3),
                entry(EntryKind::Table, "sqlite_stat1", "sqlite_stat1", 4),
            ],
            None,
            None,
        );
        let merged = merge_schema(&live, Some(&snapshot));
        let roots: Vec<_> = merged.iter().map(|e| (e.name.as_str(), e.root_page)).collect();
        assert_eq!(roots, vec![("a", 2), ("b", 3)]);
    }
}
