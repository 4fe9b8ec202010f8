#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use rusqlite::Connection;

pub const PAGE_SIZE: u64 = 4096;

/// Creates `path` with the given DDL and fills `table` with `rows` rows of
/// `(id, val)` where `val` is `prefix || id` padded to `width` characters.
pub fn seed_rows(path: &Path, ddl: &str, table: &str, rows: i64, width: usize) {
    let conn = Connection::open(path).expect("open seed db");
    conn.execute_batch(&format!("PRAGMA page_size = {PAGE_SIZE};"))
        .expect("page size");
    conn.execute_batch(ddl).expect("seed ddl");
    conn.execute(
        &format!(
            "WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n WHERE i < ?1)
             INSERT INTO \"{table}\"(id, val) SELECT i, printf('%-{width}s', 'v' || i) FROM n"
        ),
        [rows],
    )
    .expect("seed rows");
}

/// Two tables `t1(id, val)` and `t2(id, val)` with a handful of rows each.
pub fn seed_two_tables(path: &Path) {
    seed_rows(
        path,
        "CREATE TABLE t1(id INTEGER PRIMARY KEY, val TEXT);
         CREATE TABLE t2(id INTEGER PRIMARY KEY, val TEXT);
         CREATE INDEX t2_val ON t2(val);",
        "t1",
        20,
        8,
    );
    let conn = Connection::open(path).expect("open");
    conn.execute_batch("INSERT INTO t2(id, val) SELECT id, val FROM t1 WHERE id <= 5;")
        .expect("t2 rows");
}

pub fn page_count(path: &Path) -> u64 {
    std::fs::metadata(path).expect("metadata").len() / PAGE_SIZE
}

/// Overwrites page `page_no` (1-based) of a plain database with `fill`.
pub fn overwrite_page(path: &Path, page_no: u64, fill: u8) {
    overwrite_bytes(path, (page_no - 1) * PAGE_SIZE, &vec![fill; PAGE_SIZE as usize]);
}

pub fn overwrite_bytes(path: &Path, offset: u64, bytes: &[u8]) {
    let mut file = OpenOptions::new().write(true).open(path).expect("open for damage");
    file.seek(SeekFrom::Start(offset)).expect("seek");
    file.write_all(bytes).expect("damage");
    file.sync_all().expect("sync");
}

pub fn count_rows(path: &Path, table: &str) -> i64 {
    let conn = Connection::open(path).expect("open");
    conn.query_row(&format!("SELECT count(*) FROM \"{table}\""), [], |row| row.get(0))
        .expect("count")
}

pub fn rows(path: &Path, table: &str) -> BTreeSet<(i64, String)> {
    let conn = Connection::open(path).expect("open");
    let mut stmt = conn
        .prepare(&format!("SELECT id, val FROM \"{table}\""))
        .expect("prepare");
    stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))
        .expect("query")
        .collect::<Result<_, _>>()
        .expect("rows")
}

pub fn table_names(path: &Path) -> BTreeSet<String> {
    let conn = Connection::open(path).expect("open");
    let mut stmt = conn
        .prepare("SELECT name FROM sqlite_master WHERE type = 'table' AND name NOT LIKE 'sqlite_%'")
        .expect("prepare");
    stmt.query_map([], |row| row.get(0))
        .expect("query")
        .collect::<Result<_, _>>()
        .expect("names")
}

pub fn root_page(path: &Path, table: &str) -> u64 {
    let conn = Connection::open(path).expect("open");
    conn.query_row(
        "SELECT rootpage FROM sqlite_master WHERE type = 'table' AND name = ?1",
        [table],
        |row| row.get(0),
    )
    .expect("root page")
}

/// File offset of the lowest cell on b-tree page `page_no` (not page 1).
pub fn lowest_cell_offset(path: &Path, page_no: u64) -> u64 {
    let bytes = std::fs::read(path).expect("read db");
    let base = ((page_no - 1) * PAGE_SIZE) as usize;
    let content_start = u16::from_be_bytes([bytes[base + 5], bytes[base + 6]]);
    base as u64 + u64::from(content_start)
}
