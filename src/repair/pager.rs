//! Page-level access to a possibly damaged database file.
//!
//! Nothing here trusts the file: the header is inspected rather than required,
//! pages are read independently and a page that cannot be read or decrypted
//! is reported as a [`PageFault`] instead of failing the whole open.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use thiserror::Error;

use super::integrity::{IntegrityReport, IntegrityState};
use super::record::TextEncoding;
use crate::cipher::{is_valid_page_size, page_aad, CipherParams, KdfSalt, PageCipher, SALT_LEN};
use crate::{AppError, AppResult};

pub const SQLITE_MAGIC: &[u8; 16] = b"SQLite format 3\0";
pub const DB_HEADER_LEN: usize = 100;
const LOOKS_LIKE_DB_SAMPLE_PAGES: u32 = 64;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PageFault {
    #[error("page {0} is outside the file")]
    OutOfRange(u32),
    #[error("page {page} could not be read: {message}")]
    Io { page: u32, message: String },
    #[error("page {0} failed authentication")]
    Decrypt(u32),
}

/// Page size from a plain database header, when the header is intact.
pub fn header_page_size(bytes: &[u8]) -> Option<u32> {
    if bytes.len() < DB_HEADER_LEN || &bytes[..16] != SQLITE_MAGIC {
        return None;
    }
    let raw = u16::from_be_bytes([bytes[16], bytes[17]]);
    let size = if raw == 1 { 65_536 } else { u32::from(raw) };
    is_valid_page_size(size).then_some(size)
}

fn header_reserved(bytes: &[u8], page_size: u32) -> u32 {
    let reserved = u32::from(bytes.get(20).copied().unwrap_or(0));
    // usable size below 480 is invalid; ignore such a reserved count
    if page_size.saturating_sub(reserved) < 480 {
        0
    } else {
        reserved
    }
}

fn header_text_encoding(bytes: &[u8]) -> TextEncoding {
    match bytes.get(56..60) {
        Some(raw) => TextEncoding::from_header(u32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]])),
        None => TextEncoding::Utf8,
    }
}

/// Whether `page` starts with a b-tree page header.
fn has_btree_flag(page: &[u8], page_no: u32) -> bool {
    let offset = if page_no == 1 { DB_HEADER_LEN } else { 0 };
    matches!(page.get(offset), Some(0x02 | 0x05 | 0x0A | 0x0D))
}

enum Mode {
    Plain,
    Encrypted(PageCipher),
}

/// Results of inspecting a file on open.
#[derive(Debug, Clone)]
pub struct OpenReport {
    pub integrity: IntegrityReport,
    /// Salt that actually decrypted the pages, when encrypted.
    pub effective_salt: Option<KdfSalt>,
}

pub struct Pager {
    path: PathBuf,
    file: File,
    mode: Mode,
    page_size: u32,
    usable_size: u32,
    page_count: u32,
    encoding: TextEncoding,
    pages_read: u64,
    pages_faulted: u64,
}

impl std::fmt::Debug for Pager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pager")
            .field("path", &self.path)
            .field("page_size", &self.page_size)
            .field("page_count", &self.page_count)
            .field("encrypted", &matches!(self.mode, Mode::Encrypted(_)))
            .finish()
    }
}

impl Pager {
    /// Opens `path` for tolerant reading.
    ///
    /// Without a key the file is read as a plain database; with one it is
    /// read as `salt | slot*` and the file salt is tried before the fallback
    /// salt. Fails only when the file is missing, not database-like, or no
    /// page decrypts under any candidate salt.
    pub fn open(
        path: &Path,
        key: Option<&[u8]>,
        params: CipherParams,
        fallback_salt: Option<KdfSalt>,
    ) -> AppResult<(Self, OpenReport)> {
        params.validate()?;
        let file = File::open(path).map_err(|err| {
            let code = if err.kind() == std::io::ErrorKind::NotFound {
                "NOT_FOUND"
            } else {
                "CANNOT_OPEN"
            };
            AppError::open(code, "Database file could not be opened")
                .with_cause(err)
                .with_context("path", path.display().to_string())
        })?;
        let len = file
            .metadata()
            .map_err(|err| AppError::from(err).with_context("path", path.display().to_string()))?
            .len();

        match key {
            None => Self::open_plain(path, file, len, params),
            Some(key) => Self::open_encrypted(path, file, len, key, params, fallback_salt),
        }
    }

    fn open_plain(
        path: &Path,
        mut file: File,
        len: u64,
        params: CipherParams,
    ) -> AppResult<(Self, OpenReport)> {
        let not_a_database = || {
            AppError::open("NOT_A_DATABASE", "File is not a database")
                .with_context("path", path.display().to_string())
        };
        if len < 512 {
            return Err(not_a_database());
        }
        let mut head = vec![0u8; DB_HEADER_LEN];
        file.read_exact(&mut head).map_err(AppError::from)?;

        let mut integrity = IntegrityReport::default();
        let (page_size, reserved, encoding) = match header_page_size(&head) {
            Some(size) => {
                integrity.observe_header(IntegrityState::Healthy);
                (size, header_reserved(&head, size), header_text_encoding(&head))
            }
            None => {
                integrity.observe_header(IntegrityState::Corrupted);
                (params.page_size, 0, TextEncoding::Utf8)
            }
        };
        let page_count = u32::try_from(len.div_ceil(u64::from(page_size))).unwrap_or(u32::MAX);

        let mut pager = Self {
            path: path.to_path_buf(),
            file,
            mode: Mode::Plain,
            page_size,
            usable_size: page_size - reserved,
            page_count,
            encoding,
            pages_read: 0,
            pages_faulted: 0,
        };

        if integrity.header == IntegrityState::Corrupted && !pager.any_btree_page() {
            return Err(not_a_database());
        }
        pager.pages_read = 0;
        pager.pages_faulted = 0;

        tracing::debug!(
            target: "repairkit",
            event = "pager_opened",
            path = %path.display(),
            encrypted = false,
            page_size,
            page_count,
            header = ?integrity.header
        );
        Ok((
            pager,
            OpenReport {
                integrity,
                effective_salt: None,
            },
        ))
    }

    fn open_encrypted(
        path: &Path,
        mut file: File,
        len: u64,
        key: &[u8],
        params: CipherParams,
        fallback_salt: Option<KdfSalt>,
    ) -> AppResult<(Self, OpenReport)> {
        let slot_len = params.slot_len() as u64;
        if len < SALT_LEN as u64 + slot_len {
            return Err(AppError::open("NOT_A_DATABASE", "File is too small to be an encrypted database")
                .with_context("path", path.display().to_string()));
        }
        let mut salt_bytes = [0u8; SALT_LEN];
        file.read_exact(&mut salt_bytes).map_err(AppError::from)?;
        let file_salt = KdfSalt(salt_bytes);
        let page_count = u32::try_from((len - SALT_LEN as u64) / slot_len).unwrap_or(u32::MAX);

        let mut pager = Self {
            path: path.to_path_buf(),
            file,
            mode: Mode::Plain,
            page_size: params.page_size,
            usable_size: params.page_size,
            page_count,
            encoding: TextEncoding::Utf8,
            pages_read: 0,
            pages_faulted: 0,
        };

        let mut integrity = IntegrityReport::default();
        let mut candidates = vec![(file_salt, IntegrityState::Healthy)];
        if let Some(salt) = fallback_salt.filter(|salt| *salt != file_salt) {
            candidates.push((salt, IntegrityState::Corrupted));
        }

        let mut effective = None;
        for (salt, salt_state) in candidates {
            pager.mode = Mode::Encrypted(PageCipher::from_passphrase(key, &salt, params.kdf_iterations)?);
            if pager.any_page_decrypts() {
                integrity.observe_kdf_salt(salt_state);
                effective = Some(salt);
                break;
            }
        }
        let Some(effective_salt) = effective else {
            return Err(AppError::crypto(
                "WRONG_KEY",
                "No page could be decrypted; the key or KDF salt is wrong",
            )
            .with_context("path", path.display().to_string()));
        };

        match pager.read_page(1) {
            Ok(page1) => match header_page_size(&page1) {
                Some(size) if size == params.page_size => {
                    integrity.observe_header(IntegrityState::Healthy);
                    pager.usable_size = size - header_reserved(&page1, size);
                    pager.encoding = header_text_encoding(&page1);
                }
                _ => integrity.observe_header(IntegrityState::Corrupted),
            },
            Err(_) => integrity.observe_header(IntegrityState::Corrupted),
        }
        pager.pages_read = 0;
        pager.pages_faulted = 0;

        tracing::debug!(
            target: "repairkit",
            event = "pager_opened",
            path = %path.display(),
            encrypted = true,
            page_size = pager.page_size,
            page_count,
            header = ?integrity.header,
            kdf_salt = ?integrity.kdf_salt
        );
        Ok((
            pager,
            OpenReport {
                integrity,
                effective_salt: Some(effective_salt),
            },
        ))
    }

    fn any_btree_page(&mut self) -> bool {
        let limit = self.page_count.min(LOOKS_LIKE_DB_SAMPLE_PAGES);
        (1..=limit).any(|no| matches!(self.read_page(no), Ok(page) if has_btree_flag(&page, no)))
    }

    fn any_page_decrypts(&mut self) -> bool {
        (1..=self.page_count).any(|no| self.read_page(no).is_ok())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Bytes per page available to b-tree content.
    pub fn usable_size(&self) -> u32 {
        self.usable_size
    }

    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    pub fn encoding(&self) -> TextEncoding {
        self.encoding
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self.mode, Mode::Encrypted(_))
    }

    /// Pages that could not be read or decrypted since open.
    pub fn pages_faulted(&self) -> u64 {
        self.pages_faulted
    }

    pub fn pages_read(&self) -> u64 {
        self.pages_read
    }

    /// Reads page `page_no` (1-based). A short final page is zero-padded.
    pub fn read_page(&mut self, page_no: u32) -> Result<Vec<u8>, PageFault> {
        let result = self.read_page_inner(page_no);
        match result {
            Ok(_) => self.pages_read += 1,
            Err(_) => self.pages_faulted += 1,
        }
        result
    }

    fn read_page_inner(&mut self, page_no: u32) -> Result<Vec<u8>, PageFault> {
        if page_no == 0 || page_no > self.page_count {
            return Err(PageFault::OutOfRange(page_no));
        }
        let page_size = self.page_size as usize;
        let io_fault = |err: std::io::Error| PageFault::Io {
            page: page_no,
            message: err.to_string(),
        };
        match &self.mode {
            Mode::Plain => {
                let offset = u64::from(page_no - 1) * page_size as u64;
                self.file.seek(SeekFrom::Start(offset)).map_err(io_fault)?;
                let mut page = vec![0u8; page_size];
                let mut filled = 0;
                while filled < page_size {
                    let read = self.file.read(&mut page[filled..]).map_err(io_fault)?;
                    if read == 0 {
                        break;
                    }
                    filled += read;
                }
                Ok(page)
            }
            Mode::Encrypted(cipher) => {
                let slot_len = NONCE_TAG_OVERHEAD + page_size;
                let offset = SALT_LEN as u64 + u64::from(page_no - 1) * slot_len as u64;
                let mut slot = vec![0u8; slot_len];
                self.file.seek(SeekFrom::Start(offset)).map_err(io_fault)?;
                self.file.read_exact(&mut slot).map_err(io_fault)?;
                cipher
                    .open(&page_aad(page_no), &slot)
                    .map_err(|_| PageFault::Decrypt(page_no))
            }
        }
    }
}

const NONCE_TAG_OVERHEAD: usize = crate::cipher::NONCE_LEN + crate::cipher::TAG_LEN;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::seal_database;
    use rusqlite::Connection;
    use tempfile::tempdir;

    fn make_db(path: &Path) {
        let conn = Connection::open(path).expect("open");
        conn.execute_batch(
            "PRAGMA page_size = 4096;
             CREATE TABLE t(id INTEGER PRIMARY KEY, v TEXT);
             INSERT INTO t(v) VALUES ('a'), ('b');",
        )
        .expect("seed");
    }

    #[test]
    fn plain_header_is_inspected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("plain.sqlite3");
        make_db(&path);
        let (pager, opened) = Pager::open(&path, None, CipherParams::default(), None).expect("open");
        assert_eq!(pager.page_size(), 4096);
        assert_eq!(opened.integrity.header, IntegrityState::Healthy);
        assert_eq!(opened.integrity.kdf_salt, IntegrityState::Unknown);
        assert!(!pager.is_encrypted());
    }

    #[test]
    fn zeroed_header_falls_back_to_params() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("plain.sqlite3");
        make_db(&path);
        let mut bytes = std::fs::read(&path).expect("read");
        bytes[..DB_HEADER_LEN].fill(0);
        std::fs::write(&path, &bytes).expect("write");

        let (pager, opened) = Pager::open(&path, None, CipherParams::default(), None).expect("open");
        assert_eq!(opened.integrity.header, IntegrityState::Corrupted);
        assert_eq!(pager.page_size(), 4096);
    }

    #[test]
    fn junk_file_is_not_a_database() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("junk.bin");
        std::fs::write(&path, vec![0x55u8; 16_384]).expect("write");
        let err = Pager::open(&path, None, CipherParams::default(), None).expect_err("junk");
        assert_eq!(err.code(), "OPEN/NOT_A_DATABASE");
    }

    #[test]
    fn encrypted_file_needs_the_right_key() {
        let dir = tempdir().expect("tempdir");
        let plain = dir.path().join("plain.sqlite3");
        let sealed = dir.path().join("sealed.db");
        make_db(&plain);
        let params = CipherParams {
            page_size: 4096,
            kdf_iterations: 1,
        };
        let salt = seal_database(&plain, &sealed, b"k1", params).expect("seal");

        let (mut pager, opened) = Pager::open(&sealed, Some(b"k1"), params, None).expect("open");
        assert_eq!(opened.effective_salt, Some(salt));
        assert_eq!(opened.integrity.kdf_salt, IntegrityState::Healthy);
        assert_eq!(opened.integrity.header, IntegrityState::Healthy);
        let page1 = pager.read_page(1).expect("page 1");
        assert_eq!(&page1[..16], SQLITE_MAGIC);

        let err = Pager::open(&sealed, Some(b"k2"), params, None).expect_err("wrong key");
        assert_eq!(err.code(), "CRYPTO/WRONG_KEY");
    }

    #[test]
    fn damaged_salt_recovers_with_fallback() {
        let dir = tempdir().expect("tempdir");
        let plain = dir.path().join("plain.sqlite3");
        let sealed = dir.path().join("sealed.db");
        make_db(&plain);
        let params = CipherParams {
            page_size: 4096,
            kdf_iterations: 1,
        };
        let salt = seal_database(&plain, &sealed, b"k1", params).expect("seal");
        let mut bytes = std::fs::read(&sealed).expect("read");
        bytes[..SALT_LEN].fill(0xEE);
        std::fs::write(&sealed, &bytes).expect("write");

        let err = Pager::open(&sealed, Some(b"k1"), params, None).expect_err("no fallback");
        assert_eq!(err.code(), "CRYPTO/WRONG_KEY");

        let (_, opened) = Pager::open(&sealed, Some(b"k1"), params, Some(salt)).expect("fallback");
        assert_eq!(opened.integrity.kdf_salt, IntegrityState::Corrupted);
        assert_eq!(opened.effective_salt, Some(salt));
    }
}
