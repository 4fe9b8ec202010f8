use std::collections::BTreeSet;
use std::io::{Cursor, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use chrono::{DateTime, TimeZone, Utc};
use thiserror::Error;

use super::{EntryKind, SchemaEntry};
use crate::cipher::{KdfSalt, PageCipher, SALT_LEN};
use crate::config::MAX_FILE_KDF_ITERATIONS;
use crate::{AppError, AppResult};

pub(crate) const MAGIC: &[u8; 4] = b"RKMS";
pub(crate) const VERSION: u16 = 1;
const FLAG_ENCRYPTED: u16 = 0x0001;
const HEADER_LEN: usize = 16;

#[derive(Debug, Error)]
pub(crate) enum SnapshotFormatError {
    #[error("not a master snapshot file")]
    BadMagic,
    #[error("unsupported snapshot version {0}")]
    UnsupportedVersion(u16),
    #[error("snapshot file is truncated")]
    Truncated,
    #[error("snapshot checksum mismatch")]
    Checksum,
    #[error("unknown schema entry kind {0}")]
    EntryKind(u8),
    #[error("schema entry text is not valid UTF-8")]
    Utf8,
    #[error("snapshot is encrypted and no key was supplied")]
    KeyRequired,
    #[error("snapshot asks for {0} key derivation passes")]
    KdfIterations(u32),
}

impl From<SnapshotFormatError> for AppError {
    fn from(error: SnapshotFormatError) -> Self {
        let message = error.to_string();
        match error {
            SnapshotFormatError::BadMagic => AppError::format("BAD_MAGIC", message),
            SnapshotFormatError::UnsupportedVersion(v) => {
                AppError::format("UNSUPPORTED_VERSION", message).with_context("version", v.to_string())
            }
            SnapshotFormatError::Truncated => AppError::format("TRUNCATED", message),
            SnapshotFormatError::Checksum => AppError::format("CHECKSUM", message),
            SnapshotFormatError::EntryKind(_) => AppError::format("ENTRY_KIND", message),
            SnapshotFormatError::Utf8 => AppError::format("UTF8", message),
            SnapshotFormatError::KeyRequired => AppError::crypto("KEY_REQUIRED", message),
            SnapshotFormatError::KdfIterations(n) => {
                AppError::format("KDF_ITERATIONS", message).with_context("kdf_iterations", n.to_string())
            }
        }
    }
}

impl From<std::io::Error> for SnapshotFormatError {
    fn from(_: std::io::Error) -> Self {
        SnapshotFormatError::Truncated
    }
}

/// Decoded contents of a snapshot file.
#[derive(Debug)]
pub(crate) struct DecodedSnapshot {
    pub entries: Vec<SchemaEntry>,
    pub salt: Option<KdfSalt>,
    pub created_at: Option<DateTime<Utc>>,
    pub encrypted: bool,
}

fn write_str(buf: &mut Vec<u8>, value: &str) -> std::io::Result<()> {
    buf.write_u32::<LittleEndian>(value.len() as u32)?;
    buf.write_all(value.as_bytes())
}

fn read_str(cursor: &mut Cursor<&[u8]>) -> Result<String, SnapshotFormatError> {
    let len = cursor.read_u32::<LittleEndian>()? as usize;
    let remaining = cursor.get_ref().len() - cursor.position() as usize;
    if len > remaining {
        return Err(SnapshotFormatError::Truncated);
    }
    let mut bytes = vec![0u8; len];
    cursor.read_exact(&mut bytes)?;
    String::from_utf8(bytes).map_err(|_| SnapshotFormatError::Utf8)
}

fn encode_body(entries: &[SchemaEntry], salt: Option<KdfSalt>) -> std::io::Result<Vec<u8>> {
    let mut body = Vec::new();
    match salt {
        Some(salt) => {
            body.write_u8(1)?;
            body.write_all(salt.as_bytes())?;
        }
        None => {
            body.write_u8(0)?;
            body.write_all(&[0u8; SALT_LEN])?;
        }
    }
    body.write_u32::<LittleEndian>(entries.len() as u32)?;
    for entry in entries {
        let mut record = Vec::new();
        record.write_u8(entry.kind.tag())?;
        write_str(&mut record, &entry.table_name)?;
        write_str(&mut record, &entry.name)?;
        record.write_u32::<LittleEndian>(entry.root_page)?;
        write_str(&mut record, &entry.sql)?;
        body.write_u32::<LittleEndian>(record.len() as u32)?;
        body.write_all(&record)?;
    }
    Ok(body)
}

/// Decodes the body, keeping only entries whose table passes `filter`.
/// Other entries are skipped by length.
fn decode_body(
    body: &[u8],
    filter: &BTreeSet<String>,
) -> Result<(Vec<SchemaEntry>, Option<KdfSalt>), SnapshotFormatError> {
    let mut cursor = Cursor::new(body);
    let has_salt = cursor.read_u8()?;
    let mut salt_bytes = [0u8; SALT_LEN];
    cursor.read_exact(&mut salt_bytes)?;
    let salt = (has_salt != 0).then_some(KdfSalt(salt_bytes));

    let count = cursor.read_u32::<LittleEndian>()?;
    let mut entries = Vec::new();
    for _ in 0..count {
        let entry_len = cursor.read_u32::<LittleEndian>()? as u64;
        let entry_end = cursor.position() + entry_len;
        if entry_end > body.len() as u64 {
            return Err(SnapshotFormatError::Truncated);
        }
        let tag = cursor.read_u8()?;
        let kind = EntryKind::from_tag(tag).ok_or(SnapshotFormatError::EntryKind(tag))?;
        let table_name = read_str(&mut cursor)?;
        if !filter.is_empty() && !filter.contains(&table_name) {
            cursor.set_position(entry_end);
            continue;
        }
        let name = read_str(&mut cursor)?;
        let root_page = cursor.read_u32::<LittleEndian>()?;
        let sql = read_str(&mut cursor)?;
        if cursor.position() != entry_end {
            return Err(SnapshotFormatError::Truncated);
        }
        entries.push(SchemaEntry {
            kind,
            name,
            table_name,
            root_page,
            sql,
        });
    }
    Ok((entries, salt))
}

fn encode_header(flags: u16, created_at: DateTime<Utc>) -> std::io::Result<Vec<u8>> {
    let mut header = Vec::with_capacity(HEADER_LEN);
    header.write_all(MAGIC)?;
    header.write_u16::<LittleEndian>(VERSION)?;
    header.write_u16::<LittleEndian>(flags)?;
    header.write_i64::<LittleEndian>(created_at.timestamp_millis())?;
    Ok(header)
}

/// Serializes a snapshot file. With a key, the body is sealed under a key
/// derived from a fresh file salt.
pub(crate) fn encode(
    entries: &[SchemaEntry],
    salt: Option<KdfSalt>,
    created_at: DateTime<Utc>,
    key: Option<(&[u8], u32)>,
) -> AppResult<Vec<u8>> {
    let io_err = |err: std::io::Error| AppError::from(err).with_context("operation", "encode_snapshot");
    let body = encode_body(entries, salt).map_err(io_err)?;
    match key {
        None => {
            let mut out = encode_header(0, created_at).map_err(io_err)?;
            out.extend_from_slice(&body);
            let crc = crc32fast::hash(&out);
            out.write_u32::<LittleEndian>(crc).map_err(io_err)?;
            Ok(out)
        }
        Some((passphrase, iterations)) => {
            let mut out = encode_header(FLAG_ENCRYPTED, created_at).map_err(io_err)?;
            let file_salt = KdfSalt::random();
            let cipher = PageCipher::from_passphrase(passphrase, &file_salt, iterations)?;
            let sealed = cipher.seal(&out, &body)?;
            out.extend_from_slice(file_salt.as_bytes());
            out.write_u32::<LittleEndian>(iterations).map_err(io_err)?;
            out.extend_from_slice(&sealed);
            Ok(out)
        }
    }
}

pub(crate) fn decode(
    bytes: &[u8],
    key: Option<&[u8]>,
    filter: &BTreeSet<String>,
) -> AppResult<DecodedSnapshot> {
    if bytes.len() < HEADER_LEN {
        return Err(SnapshotFormatError::Truncated.into());
    }
    let (header, rest) = bytes.split_at(HEADER_LEN);
    if &header[..4] != MAGIC {
        return Err(SnapshotFormatError::BadMagic.into());
    }
    let mut cursor = Cursor::new(&header[4..]);
    let version = cursor.read_u16::<LittleEndian>().map_err(SnapshotFormatError::from)?;
    if version != VERSION {
        return Err(SnapshotFormatError::UnsupportedVersion(version).into());
    }
    let flags = cursor.read_u16::<LittleEndian>().map_err(SnapshotFormatError::from)?;
    let created_ms = cursor.read_i64::<LittleEndian>().map_err(SnapshotFormatError::from)?;
    let created_at = Utc.timestamp_millis_opt(created_ms).single();
    let encrypted = flags & FLAG_ENCRYPTED != 0;

    let body: Vec<u8> = if encrypted {
        let passphrase = key.ok_or(SnapshotFormatError::KeyRequired)?;
        if rest.len() < SALT_LEN + 4 {
            return Err(SnapshotFormatError::Truncated.into());
        }
        let file_salt = KdfSalt::from_slice(rest).ok_or(SnapshotFormatError::Truncated)?;
        let mut iter_cursor = Cursor::new(&rest[SALT_LEN..SALT_LEN + 4]);
        let iterations = iter_cursor
            .read_u32::<LittleEndian>()
            .map_err(SnapshotFormatError::from)?;
        if iterations > MAX_FILE_KDF_ITERATIONS {
            return Err(SnapshotFormatError::KdfIterations(iterations).into());
        }
        let cipher = PageCipher::from_passphrase(passphrase, &file_salt, iterations)?;
        cipher
            .open(header, &rest[SALT_LEN + 4..])
            .map_err(|err| AppError::crypto("WRONG_KEY", "Snapshot could not be decrypted with the supplied key").with_cause(err))?
    } else {
        if key.is_some() {
            tracing::warn!(
                target: "repairkit",
                event = "snapshot_key_ignored",
                "snapshot is not encrypted; ignoring supplied key"
            );
        }
        if rest.len() < 4 {
            return Err(SnapshotFormatError::Truncated.into());
        }
        let (body, crc_bytes) = rest.split_at(rest.len() - 4);
        let stored = Cursor::new(crc_bytes)
            .read_u32::<LittleEndian>()
            .map_err(SnapshotFormatError::from)?;
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(header);
        hasher.update(body);
        if hasher.finalize() != stored {
            return Err(SnapshotFormatError::Checksum.into());
        }
        body.to_vec()
    };

    let (entries, salt) = decode_body(&body, filter)?;
    Ok(DecodedSnapshot {
        entries,
        salt,
        created_at,
        encrypted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entries() -> Vec<SchemaEntry> {
        vec![
            SchemaEntry {
                kind: EntryKind::Table,
                name: "accounts".into(),
                table_name: "accounts".into(),
                root_page: 2,
                sql: "CREATE TABLE accounts(id INTEGER PRIMARY KEY, owner TEXT)".into(),
            },
            SchemaEntry {
                kind: EntryKind::Table,
                name: "ledger".into(),
                table_name: "ledger".into(),
                root_page: 3,
                sql: "CREATE TABLE ledger(id INTEGER PRIMARY KEY, amount REAL)".into(),
            },
            SchemaEntry {
                kind: EntryKind::Index,
                name: "ledger_amount".into(),
                table_name: "ledger".into(),
                root_page: 4,
                sql: "CREATE INDEX ledger_amount ON ledger(amount)".into(),
            },
        ]
    }

    #[test]
    fn damaged_kdf_pass_count_is_a_format_error() {
        let mut bytes = encode(&sample_entries(), None, Utc::now(), Some((b"pw", 1))).expect("encode");
        let at = HEADER_LEN + SALT_LEN;
        bytes[at..at + 4].copy_from_slice(&u32::MAX.to_le_bytes());
        let err = decode(&bytes, Some(b"pw"), &BTreeSet::new()).expect_err("kdf");
        assert_eq!(err.code(), "FORMAT/KDF_ITERATIONS");
    }

    #[test]
    fn filter_skips_entries_of_other_tables() {
        let bytes = encode(&sample_entries(), None, Utc::now(), None).expect("encode");
        let filter = BTreeSet::from(["ledger".to_string()]);
        let decoded = decode(&bytes, None, &filter).expect("decode");
        let names: Vec<_> = decoded.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["ledger", "ledger_amount"]);
        assert!(!decoded.encrypted);
    }

    #[test]
    fn flipped_byte_fails_checksum() {
        let mut bytes = encode(&sample_entries(), None, Utc::now(), None).expect("encode");
        let idx = bytes.len() / 2;
        bytes[idx] ^= 0x40;
        let err = decode(&bytes, None, &BTreeSet::new()).expect_err("corrupt");
        assert_eq!(err.code(), "FORMAT/CHECKSUM");
    }

    #[test]
    fn encrypted_snapshot_requires_the_right_key() {
        let salt = KdfSalt([9u8; SALT_LEN]);
        let bytes = encode(&sample_entries(), Some(salt), Utc::now(), Some((b"pw", 1))).expect("encode");

        let missing = decode(&bytes, None, &BTreeSet::new()).expect_err("key required");
        assert_eq!(missing.code(), "CRYPTO/KEY_REQUIRED");

        let wrong = decode(&bytes, Some(b"nope"), &BTreeSet::new()).expect_err("wrong key");
        assert_eq!(wrong.code(), "CRYPTO/WRONG_KEY");

        let decoded = decode(&bytes, Some(b"pw"), &BTreeSet::new()).expect("decode");
        assert!(decoded.encrypted);
        assert_eq!(decoded.salt, Some(salt));
        assert_eq!(decoded.entries.len(), 3);
    }

    #[test]
    fn rejects_foreign_files() {
        let err = decode(b"SQLite format 3\0 and more", None, &BTreeSet::new()).expect_err("magic");
        assert_eq!(err.code(), "FORMAT/BAD_MAGIC");
        let err = decode(b"RKMS", None, &BTreeSet::new()).expect_err("short");
        assert_eq!(err.code(), "FORMAT/TRUNCATED");
    }
}
