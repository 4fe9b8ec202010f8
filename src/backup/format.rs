//! On-disk layout of backup files.
//!
//! ```text
//! header (32 bytes, little-endian):
//!   magic "RKBK" | version u16 | flags u16 | kdf_salt[16] | kdf_iterations u32 | reserved[4]
//! frame:
//!   payload_len u32 | crc32(payload) u32 | payload
//! payload:
//!   sealed(zstd(bincode(records)))   with the frame index as associated data
//! ```
//! Sealing and compression are each skipped when the header says so.

use std::io::{self, Read};

use byteorder::{ByteOrder, LittleEndian};
use rusqlite::types::Value;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cipher::{KdfSalt, PageCipher, SALT_LEN};
use crate::config::MAX_FILE_KDF_ITERATIONS;
use crate::{AppError, AppResult};

pub const MAGIC: &[u8; 4] = b"RKBK";
pub const VERSION: u16 = 1;
pub const HEADER_LEN: usize = 32;
pub const FRAME_HEADER_LEN: usize = 8;
const FLAG_CIPHER: u16 = 0x0001;
const FLAG_COMPRESS: u16 = 0x0002;
/// Upper bound on a frame payload. The writer refuses to produce a larger
/// frame and the reader treats one as damage.
pub const MAX_FRAME_LEN: u32 = 256 * 1024 * 1024;

#[derive(Debug, Error)]
pub(crate) enum BackupFormatError {
    #[error("not a backup file")]
    BadMagic,
    #[error("unsupported backup version {0}")]
    UnsupportedVersion(u16),
    #[error("backup header is truncated")]
    Truncated,
    #[error("backup header asks for {0} key derivation passes")]
    KdfIterations(u32),
}

impl From<BackupFormatError> for AppError {
    fn from(error: BackupFormatError) -> Self {
        let message = error.to_string();
        match error {
            BackupFormatError::BadMagic => AppError::format("BAD_MAGIC", message),
            BackupFormatError::UnsupportedVersion(v) => {
                AppError::format("UNSUPPORTED_VERSION", message).with_context("version", v.to_string())
            }
            BackupFormatError::Truncated => AppError::format("TRUNCATED", message),
            BackupFormatError::KdfIterations(n) => {
                AppError::format("KDF_ITERATIONS", message).with_context("kdf_iterations", n.to_string())
            }
        }
    }
}

/// Parsed file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackupHeader {
    pub version: u16,
    pub cipher: bool,
    pub compress: bool,
    pub salt: KdfSalt,
    pub kdf_iterations: u32,
}

impl BackupHeader {
    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[..4].copy_from_slice(MAGIC);
        LittleEndian::write_u16(&mut out[4..6], self.version);
        let mut flags = 0;
        if self.cipher {
            flags |= FLAG_CIPHER;
        }
        if self.compress {
            flags |= FLAG_COMPRESS;
        }
        LittleEndian::write_u16(&mut out[6..8], flags);
        out[8..8 + SALT_LEN].copy_from_slice(self.salt.as_bytes());
        LittleEndian::write_u32(&mut out[24..28], self.kdf_iterations);
        out
    }

    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, BackupFormatError> {
        if bytes.len() < 4 || &bytes[..4] != MAGIC {
            return Err(if bytes.len() < 4 {
                BackupFormatError::Truncated
            } else {
                BackupFormatError::BadMagic
            });
        }
        if bytes.len() < HEADER_LEN {
            return Err(BackupFormatError::Truncated);
        }
        let version = LittleEndian::read_u16(&bytes[4..6]);
        if version != VERSION {
            return Err(BackupFormatError::UnsupportedVersion(version));
        }
        let flags = LittleEndian::read_u16(&bytes[6..8]);
        let mut salt = [0u8; SALT_LEN];
        salt.copy_from_slice(&bytes[8..8 + SALT_LEN]);
        let kdf_iterations = LittleEndian::read_u32(&bytes[24..28]);
        if kdf_iterations > MAX_FILE_KDF_ITERATIONS {
            return Err(BackupFormatError::KdfIterations(kdf_iterations));
        }
        Ok(Self {
            version,
            cipher: flags & FLAG_CIPHER != 0,
            compress: flags & FLAG_COMPRESS != 0,
            salt: KdfSalt(salt),
            kdf_iterations,
        })
    }
}

/// A column value as stored in a backup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
}

impl SqlValue {
    fn approx_len(&self) -> usize {
        match self {
            SqlValue::Null => 4,
            SqlValue::Integer(_) | SqlValue::Real(_) => 12,
            SqlValue::Text(v) => v.len() + 12,
            SqlValue::Blob(v) => v.len() + 12,
        }
    }
}

impl From<Value> for SqlValue {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => SqlValue::Null,
            Value::Integer(v) => SqlValue::Integer(v),
            Value::Real(v) => SqlValue::Real(v),
            Value::Text(v) => SqlValue::Text(v),
            Value::Blob(v) => SqlValue::Blob(v),
        }
    }
}

impl From<SqlValue> for Value {
    fn from(value: SqlValue) -> Self {
        match value {
            SqlValue::Null => Value::Null,
            SqlValue::Integer(v) => Value::Integer(v),
            SqlValue::Real(v) => Value::Real(v),
            SqlValue::Text(v) => Value::Text(v),
            SqlValue::Blob(v) => Value::Blob(v),
        }
    }
}

/// One statement-equivalent in the backup stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BackupRecord {
    /// `CREATE TABLE` / `CREATE INDEX` text.
    Schema { sql: String },
    /// Sets the table and column list for the rows that follow.
    Table { name: String, columns: Vec<String> },
    Row {
        rowid: Option<i64>,
        values: Vec<SqlValue>,
    },
}

impl BackupRecord {
    /// Whether the record counts as an output statement.
    pub fn is_statement(&self) -> bool {
        !matches!(self, BackupRecord::Table { .. })
    }

    /// Rough serialized size, used to bound frames before encoding.
    pub(crate) fn approx_len(&self) -> usize {
        match self {
            BackupRecord::Schema { sql } => sql.len() + 12,
            BackupRecord::Table { name, columns } => {
                name.len() + columns.iter().map(|c| c.len() + 8).sum::<usize>() + 20
            }
            BackupRecord::Row { values, .. } => values.iter().map(SqlValue::approx_len).sum::<usize>() + 24,
        }
    }
}

/// Length field for a frame payload, refusing anything the reader would
/// reject.
fn frame_len(payload_len: usize, index: u64) -> AppResult<u32> {
    u32::try_from(payload_len)
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or_else(|| {
            AppError::format("FRAME_TOO_LARGE", "Backup frame exceeds the maximum frame size")
                .with_context("frame", index.to_string())
                .with_context("bytes", payload_len.to_string())
        })
}

/// Turns record batches into frame payloads and back.
pub(crate) struct FrameCodec {
    cipher: Option<PageCipher>,
    compression_level: Option<i32>,
}

impl FrameCodec {
    pub(crate) fn new(cipher: Option<PageCipher>, compression_level: Option<i32>) -> Self {
        Self {
            cipher,
            compression_level,
        }
    }

    pub(crate) fn encode(&self, index: u64, records: &[BackupRecord]) -> AppResult<Vec<u8>> {
        let mut payload = bincode::serialize(records)?;
        if let Some(level) = self.compression_level {
            payload = zstd::encode_all(payload.as_slice(), level).map_err(|err| {
                AppError::from(err).with_context("operation", "compress_frame")
            })?;
        }
        if let Some(cipher) = &self.cipher {
            payload = cipher.seal(&index.to_be_bytes(), &payload)?;
        }
        let len = frame_len(payload.len(), index)?;
        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
        let mut header = [0u8; FRAME_HEADER_LEN];
        LittleEndian::write_u32(&mut header[..4], len);
        LittleEndian::write_u32(&mut header[4..], crc32fast::hash(&payload));
        frame.extend_from_slice(&header);
        frame.extend_from_slice(&payload);
        Ok(frame)
    }

    pub(crate) fn decode(&self, index: u64, payload: &[u8]) -> AppResult<Vec<BackupRecord>> {
        let mut inner = match &self.cipher {
            Some(cipher) => cipher
                .open(&index.to_be_bytes(), payload)
                .map_err(|err| err.with_context("frame", index.to_string()))?,
            None => payload.to_vec(),
        };
        if self.compression_level.is_some() {
            inner = zstd::decode_all(inner.as_slice()).map_err(|err| {
                AppError::format("FRAME_COMPRESSION", "Backup frame failed to decompress")
                    .with_cause(err)
                    .with_context("frame", index.to_string())
            })?;
        }
        bincode::deserialize(&inner)
            .map_err(|err| AppError::from(err).with_context("frame", index.to_string()))
    }
}

/// Result of reading one frame from a stream.
pub(crate) enum FrameRead {
    Frame(Vec<u8>),
    /// Clean end of the stream.
    End,
    /// A partial or damaged frame; everything from here on is unusable.
    Torn,
}

fn read_fully<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(filled)
}

pub(crate) fn read_header<R: Read>(reader: &mut R) -> AppResult<BackupHeader> {
    let mut bytes = [0u8; HEADER_LEN];
    let read = read_fully(reader, &mut bytes)?;
    Ok(BackupHeader::decode(&bytes[..read])?)
}

pub(crate) fn read_frame<R: Read>(reader: &mut R) -> io::Result<FrameRead> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    match read_fully(reader, &mut header)? {
        0 => return Ok(FrameRead::End),
        FRAME_HEADER_LEN => {}
        _ => return Ok(FrameRead::Torn),
    }
    let len = LittleEndian::read_u32(&header[..4]);
    let crc = LittleEndian::read_u32(&header[4..]);
    if len > MAX_FRAME_LEN {
        return Ok(FrameRead::Torn);
    }
    let mut payload = vec![0u8; len as usize];
    if read_fully(reader, &mut payload)? != payload.len() || crc32fast::hash(&payload) != crc {
        return Ok(FrameRead::Torn);
    }
    Ok(FrameRead::Frame(payload))
}
