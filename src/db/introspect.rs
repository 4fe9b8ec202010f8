//! Schema introspection over a live connection: table listing, foreign-key
//! ordering and column discovery.

use std::collections::{BTreeMap, BTreeSet};

use rusqlite::{Connection, Error as SqliteError};

use crate::{AppError, AppResult};

pub fn quote_ident(name: &str) -> String {
    let escaped = name.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

pub fn is_virtual_table_sql(sql: &str) -> bool {
    sql.trim_start()
        .to_uppercase()
        .starts_with("CREATE VIRTUAL TABLE")
}

pub fn is_internal_name(name: &str) -> bool {
    name.get(..7)
        .map(|prefix| prefix.eq_ignore_ascii_case("sqlite_"))
        .unwrap_or(false)
}

/// A `sqlite_master` row of a user table or index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterRow {
    pub kind: String,
    pub name: String,
    pub tbl_name: String,
    pub rootpage: i64,
    pub sql: String,
}

/// User tables and indexes with SQL, tables first, in creation order.
/// Internal and virtual tables are excluded.
pub fn master_rows(conn: &Connection) -> AppResult<Vec<MasterRow>> {
    let mut stmt = conn
        .prepare(
            "SELECT type, name, tbl_name, rootpage, sql FROM sqlite_master
             WHERE type IN ('table', 'index') AND sql IS NOT NULL AND name NOT LIKE 'sqlite_%'
             ORDER BY CASE type WHEN 'table' THEN 0 ELSE 1 END, rowid",
        )
        .map_err(|err| AppError::from(err).with_context("operation", "read_master"))?;
    let rows = stmt
        .query_map([], |row| {
            Ok(MasterRow {
                kind: row.get(0)?,
                name: row.get(1)?,
                tbl_name: row.get(2)?,
                rootpage: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                sql: row.get(4)?,
            })
        })
        .map_err(|err| AppError::from(err).with_context("operation", "read_master_query"))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| AppError::from(err).with_context("operation", "collect_master"))?;
    Ok(rows
        .into_iter()
        .filter(|row| !(row.kind == "table" && is_virtual_table_sql(&row.sql)))
        .collect())
}

pub fn list_tables(conn: &Connection) -> AppResult<Vec<String>> {
    Ok(master_rows(conn)?
        .into_iter()
        .filter(|row| row.kind == "table")
        .map(|row| row.name)
        .collect())
}

/// Parent tables named by the foreign keys of each table in `tables`.
/// References to tables outside the list and self references are dropped.
pub fn foreign_key_parents(
    conn: &Connection,
    tables: &[String],
) -> AppResult<BTreeMap<String, BTreeSet<String>>> {
    let mut parents = BTreeMap::new();
    for table in tables {
        let failed = |err: SqliteError, op: &str| {
            AppError::from(err)
                .with_context("operation", op.to_string())
                .with_context("table", table.clone())
        };
        let mut stmt = conn
            .prepare(&format!("PRAGMA foreign_key_list({})", quote_ident(table)))
            .map_err(|err| failed(err, "foreign_key_list"))?;
        let targets = stmt
            .query_map([], |row| row.get::<_, String>(2))
            .map_err(|err| failed(err, "foreign_key_query"))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|err| failed(err, "foreign_key_target"))?;
        // Foreign key targets keep the spelling of the DDL, not the table's.
        let set: BTreeSet<String> = targets
            .iter()
            .filter_map(|target| tables.iter().find(|name| name.eq_ignore_ascii_case(target)))
            .filter(|name| *name != table)
            .cloned()
            .collect();
        parents.insert(table.clone(), set);
    }
    Ok(parents)
}

/// Tables arranged so every parent is written before its children.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableOrder {
    /// Tables whose parents all precede them, in waves of the input order.
    pub ordered: Vec<String>,
    /// Tables on a foreign-key cycle or depending on one, by name.
    pub cyclic: Vec<String>,
}

impl TableOrder {
    /// Every table, cyclic ones last.
    pub fn into_sequence(self) -> Vec<String> {
        let mut all = self.ordered;
        all.extend(self.cyclic);
        all
    }
}

pub fn order_by_parents(tables: Vec<String>, parents: &BTreeMap<String, BTreeSet<String>>) -> TableOrder {
    let mut placed: BTreeSet<String> = BTreeSet::new();
    let mut ordered = Vec::with_capacity(tables.len());
    let mut pending = tables;
    loop {
        let (ready, blocked): (Vec<String>, Vec<String>) = pending.into_iter().partition(|table| {
            parents
                .get(table)
                .map_or(true, |deps| deps.iter().all(|dep| placed.contains(dep)))
        });
        pending = blocked;
        if ready.is_empty() {
            break;
        }
        placed.extend(ready.iter().cloned());
        ordered.extend(ready);
    }
    pending.sort();
    pending.dedup();
    TableOrder {
        ordered,
        cyclic: pending,
    }
}

/// The foreign-key order of `tables` in `conn`. Cycles are logged.
pub fn table_order(conn: &Connection, tables: Vec<String>) -> AppResult<TableOrder> {
    let parents = foreign_key_parents(conn, &tables)?;
    let order = order_by_parents(tables, &parents);
    if !order.cyclic.is_empty() {
        tracing::warn!(
            target: "repairkit",
            event = "foreign_key_cycle",
            tables = ?order.cyclic
        );
    }
    Ok(order)
}

/// A column as reported by `PRAGMA table_xinfo`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub declared_type: String,
    pub pk: i64,
    /// 0 for ordinary columns, 2 for virtual and 3 for stored generated columns.
    pub hidden: i64,
}

impl ColumnInfo {
    /// Whether the column is present in the on-disk record.
    pub fn is_stored(&self) -> bool {
        self.hidden == 0 || self.hidden == 3
    }

    /// Whether the column can be named in an `INSERT`.
    pub fn is_insertable(&self) -> bool {
        self.hidden == 0
    }
}

/// All columns of `table` in declaration order, including generated ones.
pub fn table_columns(conn: &Connection, table: &str) -> AppResult<Vec<ColumnInfo>> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_xinfo({})", quote_ident(table)))
        .map_err(|err| {
            AppError::from(err)
                .with_context("operation", "table_info")
                .with_context("table", table.to_string())
        })?;
    let mut rows = stmt
        .query([])
        .map_err(|err| AppError::from(err).with_context("operation", "table_info_query"))?;
    let mut cols = Vec::new();
    while let Some(row) = rows.next().map_err(|err| {
        AppError::from(err)
            .with_context("operation", "table_info_iter")
            .with_context("table", table.to_string())
    })? {
        let hidden: i64 = row.get(6)?;
        let name: String = row.get(1).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "table_info_name")
                .with_context("table", table.to_string())
        })?;
        let declared_type: String = row.get::<_, Option<String>>(2)?.unwrap_or_default();
        let pk: i64 = row.get(5)?;
        cols.push(ColumnInfo {
            name,
            declared_type,
            pk,
            hidden,
        });
    }
    Ok(cols)
}

/// Names of the columns that can be written with an `INSERT`.
pub fn insertable_columns(conn: &Connection, table: &str) -> AppResult<Vec<String>> {
    Ok(table_columns(conn, table)?
        .into_iter()
        .filter(ColumnInfo::is_insertable)
        .map(|col| col.name)
        .collect())
}

/// Index of the `INTEGER PRIMARY KEY` column that aliases the rowid, if any.
/// A rowid alias is stored as NULL in the record body.
pub fn rowid_alias_index(columns: &[ColumnInfo]) -> Option<usize> {
    let pk_columns: Vec<usize> = columns
        .iter()
        .enumerate()
        .filter(|(_, col)| col.pk > 0)
        .map(|(idx, _)| idx)
        .collect();
    match pk_columns.as_slice() {
        [idx] if columns[*idx].declared_type.eq_ignore_ascii_case("INTEGER") => Some(*idx),
        _ => None,
    }
}

pub fn is_without_rowid(sql: &str) -> bool {
    let upper = sql.to_uppercase();
    let compact: String = upper.split_whitespace().collect::<Vec<_>>().join(" ");
    compact.trim_end_matches(';').trim_end().ends_with("WITHOUT ROWID")
}

pub fn build_insert_sql(table: &str, columns: &[String], with_rowid: bool) -> String {
    build_write_sql("INSERT", table, columns, with_rowid)
}

/// Like [`build_insert_sql`] but a row with the same key replaces the old one.
pub fn build_replace_sql(table: &str, columns: &[String], with_rowid: bool) -> String {
    build_write_sql("INSERT OR REPLACE", table, columns, with_rowid)
}

fn build_write_sql(verb: &str, table: &str, columns: &[String], with_rowid: bool) -> String {
    let mut names: Vec<String> = Vec::with_capacity(columns.len() + 1);
    if with_rowid {
        names.push("rowid".to_string());
    }
    names.extend(columns.iter().map(|c| quote_ident(c)));
    let placeholders: Vec<String> = (0..names.len()).map(|idx| format!("?{}", idx + 1)).collect();
    format!(
        "{verb} INTO {} ({}) VALUES ({})",
        quote_ident(table),
        names.join(", "),
        placeholders.join(", "),
    )
}

/// Rows reported by `PRAGMA foreign_key_check` as `(table, rowid, parent)`.
pub fn foreign_key_violations(conn: &Connection) -> AppResult<Vec<(String, Option<i64>, String)>> {
    let mut stmt = conn
        .prepare("PRAGMA foreign_key_check")
        .map_err(|err| AppError::from(err).with_context("operation", "foreign_key_check"))?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<i64>>(1)?,
                row.get::<_, String>(2)?,
            ))
        })
        .map_err(|err| AppError::from(err).with_context("operation", "foreign_key_check_query"))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| AppError::from(err).with_context("operation", "foreign_key_check_iter"))?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|name| name.to_string()).collect()
    }

    #[test]
    fn parents_are_written_before_children() {
        let parents = BTreeMap::from([
            ("orders".to_string(), BTreeSet::from(["customers".to_string()])),
            ("invoices".to_string(), BTreeSet::from(["orders".to_string()])),
        ]);
        let order = order_by_parents(names(&["invoices", "orders", "customers", "notes"]), &parents);
        assert_eq!(order.ordered, names(&["customers", "notes", "orders", "invoices"]));
        assert!(order.cyclic.is_empty());
    }

    #[test]
    fn cycle_members_and_their_dependents_are_reported() {
        let parents = BTreeMap::from([
            ("b".to_string(), BTreeSet::from(["a".to_string()])),
            ("a".to_string(), BTreeSet::from(["b".to_string()])),
            ("d".to_string(), BTreeSet::from(["a".to_string(), "c".to_string()])),
        ]);
        let order = order_by_parents(names(&["d", "b", "a", "c"]), &parents);
        assert_eq!(order.ordered, names(&["c"]));
        assert_eq!(order.cyclic, names(&["a", "b", "d"]));
        assert_eq!(order.into_sequence(), names(&["c", "a", "b", "d"]));
    }

    #[test]
    fn foreign_key_targets_match_tables_case_insensitively() {
        let conn = Connection::open_in_memory().expect("memory db");
        conn.execute_batch(
            "CREATE TABLE Parent(id INTEGER PRIMARY KEY);
             CREATE TABLE child(id INTEGER PRIMARY KEY, p INTEGER REFERENCES PARENT(id),
                                up INTEGER REFERENCES child(id));",
        )
        .expect("schema");
        let parents = foreign_key_parents(&conn, &names(&["child", "Parent"])).expect("parents");
        assert_eq!(parents["child"], BTreeSet::from(["Parent".to_string()]));
        assert!(parents["Parent"].is_empty());
    }

    #[test]
    fn master_rows_skip_virtual_and_internal_tables() {
        let conn = Connection::open_in_memory().expect("memory db");
        conn.execute_batch(
            "CREATE TABLE parent(id INTEGER PRIMARY KEY, name TEXT);
             CREATE TABLE child(id INTEGER PRIMARY KEY AUTOINCREMENT, parent_id INTEGER REFERENCES parent(id));
             CREATE INDEX child_parent ON child(parent_id);",
        )
        .expect("schema");
        let rows = master_rows(&conn).expect("rows");
        let names: Vec<_> = rows.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["parent", "child", "child_parent"]);
        assert!(rows.iter().all(|r| r.rootpage > 0));

        let order = table_order(&conn, list_tables(&conn).expect("tables")).expect("order");
        assert_eq!(order.ordered, vec!["parent", "child"]);
        assert!(order.cyclic.is_empty());
    }

    #[test]
    fn detects_rowid_alias_and_without_rowid() {
        let conn = Connection::open_in_memory().expect("memory db");
        conn.execute_batch(
            "CREATE TABLE a(id INTEGER PRIMARY KEY, v TEXT);
             CREATE TABLE b(id INT PRIMARY KEY, v TEXT);
             CREATE TABLE c(k TEXT PRIMARY KEY, v TEXT) WITHOUT ROWID;",
        )
        .expect("schema");
        let a = table_columns(&conn, "a").expect("a");
        let b = table_columns(&conn, "b").expect("b");
        assert_eq!(rowid_alias_index(&a), Some(0));
        assert_eq!(rowid_alias_index(&b), None);
        assert!(is_without_rowid(
            "CREATE TABLE c(k TEXT PRIMARY KEY, v TEXT) without  rowid"
        ));
        assert!(!is_without_rowid("CREATE TABLE a(id INTEGER PRIMARY KEY)"));
    }

    #[test]
    fn insert_sql_quotes_identifiers() {
        let sql = build_insert_sql("we\"ird", &["a".into(), "b c".into()], true);
        assert_eq!(
            sql,
            "INSERT INTO \"we\"\"ird\" (rowid, \"a\", \"b c\") VALUES (?1, ?2, ?3)"
        );
        let replace = build_replace_sql("t", &["a".into()], false);
        assert_eq!(replace, "INSERT OR REPLACE INTO \"t\" (\"a\") VALUES (?1)");
    }
}
