//! Tolerant walk over table b-trees.
//!
//! A page or cell that does not parse is counted and skipped; the walk
//! carries on with whatever else is reachable.

use std::collections::HashSet;
use std::ops::ControlFlow;

use serde::Serialize;

use super::pager::{Pager, DB_HEADER_LEN};
use super::record::read_varint;

const TABLE_INTERIOR: u8 = 0x05;
const TABLE_LEAF: u8 = 0x0D;
const MAX_OVERFLOW_PAGES: u32 = 1 << 20;
/// SQLite's default `SQLITE_MAX_LENGTH`.
const MAX_PAYLOAD_LEN: u64 = 1_000_000_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WalkStats {
    pub pages_visited: u64,
    pub damaged_pages: u64,
    pub damaged_cells: u64,
    pub cells_read: u64,
}

impl WalkStats {
    pub fn saw_damage(&self) -> bool {
        self.damaged_pages > 0 || self.damaged_cells > 0
    }
}

/// Bytes of a payload of `payload_len` kept on the b-tree page itself.
pub fn local_payload_len(payload_len: u64, usable: u32, table_leaf: bool) -> usize {
    let usable = u64::from(usable);
    let max_local = if table_leaf {
        usable - 35
    } else {
        (usable - 12) * 64 / 255 - 23
    };
    if payload_len <= max_local {
        return payload_len as usize;
    }
    let min_local = (usable - 12) * 32 / 255 - 23;
    let surplus = min_local + (payload_len - min_local) % (usable - 4);
    if surplus <= max_local {
        surplus as usize
    } else {
        min_local as usize
    }
}

fn read_u16(page: &[u8], offset: usize) -> Option<usize> {
    page.get(offset..offset + 2)
        .map(|b| usize::from(u16::from_be_bytes([b[0], b[1]])))
}

fn read_u32(page: &[u8], offset: usize) -> Option<u32> {
    page.get(offset..offset + 4)
        .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
}

enum Page {
    Interior { children: Vec<u32>, bad_cells: u64 },
    Leaf { cells: Vec<usize>, bad_cells: u64 },
}

fn parse_page(page: &[u8], page_no: u32, usable: usize) -> Option<Page> {
    let header = if page_no == 1 { DB_HEADER_LEN } else { 0 };
    let kind = *page.get(header)?;
    let cell_count = read_u16(page, header + 3)?;
    let (pointer_base, interior) = match kind {
        TABLE_INTERIOR => (header + 12, true),
        TABLE_LEAF => (header + 8, false),
        _ => return None,
    };
    if pointer_base + cell_count * 2 > usable {
        return None;
    }

    let mut bad_cells = 0;
    let mut offsets = Vec::with_capacity(cell_count);
    for idx in 0..cell_count {
        match read_u16(page, pointer_base + idx * 2) {
            Some(offset) if offset >= pointer_base + cell_count * 2 && offset < usable => {
                offsets.push(offset)
            }
            _ => bad_cells += 1,
        }
    }

    if interior {
        let mut children = Vec::with_capacity(offsets.len() + 1);
        for offset in offsets {
            match read_u32(page, offset) {
                Some(child) if child != 0 => children.push(child),
                _ => bad_cells += 1,
            }
        }
        match read_u32(page, header + 8) {
            Some(right) if right != 0 => children.push(right),
            _ => bad_cells += 1,
        }
        Some(Page::Interior {
            children,
            bad_cells,
        })
    } else {
        Some(Page::Leaf {
            cells: offsets,
            bad_cells,
        })
    }
}

/// Largest payload the file could hold: what fits locally plus every other
/// page used as overflow.
fn payload_ceiling(pager: &Pager) -> u64 {
    let usable = u64::from(pager.usable_size());
    let spill = u64::from(pager.page_count()) * usable.saturating_sub(4);
    (usable + spill).min(MAX_PAYLOAD_LEN)
}

/// Reassembles the payload of the leaf cell at `offset`.
fn read_leaf_cell(pager: &mut Pager, page: &[u8], offset: usize) -> Option<(i64, Vec<u8>)> {
    let usable = pager.usable_size();
    let cell = page.get(offset..usable as usize)?;
    let (payload_len, a) = read_varint(cell)?;
    if payload_len > payload_ceiling(pager) {
        return None;
    }
    let (rowid, b) = read_varint(cell.get(a..)?)?;
    let start = a + b;
    let local = local_payload_len(payload_len, usable, true);
    let payload_len = usize::try_from(payload_len).ok()?;

    // Grows with the overflow pages actually read, never from the length alone.
    let mut payload = cell.get(start..start + local)?.to_vec();
    if local == payload_len {
        return Some((rowid as i64, payload));
    }

    let mut next = read_u32(cell, start + local)?;
    let mut seen = HashSet::new();
    while payload.len() < payload_len {
        if next == 0 || !seen.insert(next) || seen.len() as u32 > MAX_OVERFLOW_PAGES {
            return None;
        }
        let overflow = pager.read_page(next).ok()?;
        let take = (payload_len - payload.len()).min(usable as usize - 4);
        payload.extend_from_slice(overflow.get(4..4 + take)?);
        next = read_u32(&overflow, 0)?;
    }
    Some((rowid as i64, payload))
}

/// Visits every readable row of the table b-tree rooted at `root` in rowid
/// order. The visitor sees the rowid and the raw record payload.
pub fn walk_table<F>(pager: &mut Pager, root: u32, mut visit: F) -> WalkStats
where
    F: FnMut(i64, &[u8]) -> ControlFlow<()>,
{
    let mut stats = WalkStats::default();
    let mut visited = HashSet::new();
    let mut stack = vec![root];
    let usable = pager.usable_size() as usize;

    while let Some(page_no) = stack.pop() {
        if !visited.insert(page_no) {
            stats.damaged_pages += 1;
            continue;
        }
        let page = match pager.read_page(page_no) {
            Ok(page) => page,
            Err(fault) => {
                tracing::debug!(target: "repairkit", event = "page_unreadable", page = page_no, error = %fault);
                stats.damaged_pages += 1;
                continue;
            }
        };
        stats.pages_visited += 1;

        match parse_page(&page, page_no, usable) {
            None => {
                tracing::debug!(target: "repairkit", event = "page_unparsable", page = page_no);
                stats.damaged_pages += 1;
            }
            Some(Page::Interior {
                children,
                bad_cells,
            }) => {
                stats.damaged_cells += bad_cells;
                stack.extend(children.into_iter().rev());
            }
            Some(Page::Leaf { cells, bad_cells }) => {
                stats.damaged_cells += bad_cells;
                for offset in cells {
                    match read_leaf_cell(pager, &page, offset) {
                        Some((rowid, payload)) => {
                            stats.cells_read += 1;
                            if visit(rowid, &payload).is_break() {
                                return stats;
                            }
                        }
                        None => stats.damaged_cells += 1,
                    }
                }
            }
        }
    }
    stats
}
