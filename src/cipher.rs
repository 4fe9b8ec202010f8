//! At-rest page encryption shared by encrypted databases, snapshot files and
//! backup files.
//!
//! Keys are derived with Argon2id from a passphrase and a 16-byte salt. Each
//! sealed unit is `nonce[24] | ciphertext | tag[16]` under XChaCha20-Poly1305,
//! with caller-supplied associated data (the page number for database pages).
//!
//! An encrypted database file is laid out as `salt[16]` followed by one
//! fixed-size slot per page.

use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::{Aead, KeyInit, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::{AppError, AppResult};

pub const SALT_LEN: usize = 16;
pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 24;
pub const TAG_LEN: usize = 16;
pub const DEFAULT_PAGE_SIZE: u32 = 4096;
pub const DEFAULT_KDF_ITERATIONS: u32 = 2;
const KDF_MEMORY_KIB: u32 = 4096;
const MIN_PAGE_SIZE: u32 = 512;
const MAX_PAGE_SIZE: u32 = 65_536;

#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct KdfSalt(pub [u8; SALT_LEN]);

impl KdfSalt {
    pub fn random() -> Self {
        let mut bytes = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut bytes);
        KdfSalt(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; SALT_LEN] = bytes.get(..SALT_LEN)?.try_into().ok()?;
        Some(KdfSalt(array))
    }

    pub fn as_bytes(&self) -> &[u8; SALT_LEN] {
        &self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Reads the leading salt of an encrypted database file.
    pub fn read_from_file(path: &Path) -> AppResult<Self> {
        let bytes = fs::read(path).map_err(|err| {
            AppError::from(err)
                .with_context("operation", "read_kdf_salt")
                .with_context("path", path.display().to_string())
        })?;
        KdfSalt::from_slice(&bytes).ok_or_else(|| {
            AppError::format("TRUNCATED", "File is too short to carry a KDF salt")
                .with_context("path", path.display().to_string())
        })
    }
}

impl fmt::Debug for KdfSalt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KdfSalt(")?;
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        write!(f, ")")
    }
}

/// Page geometry and key schedule of an encrypted database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CipherParams {
    pub page_size: u32,
    pub kdf_iterations: u32,
}

impl Default for CipherParams {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            kdf_iterations: DEFAULT_KDF_ITERATIONS,
        }
    }
}

impl CipherParams {
    pub fn validate(&self) -> AppResult<()> {
        if !is_valid_page_size(self.page_size) {
            return Err(AppError::argument(
                "PAGE_SIZE",
                "Page size must be a power of two between 512 and 65536",
            )
            .with_context("page_size", self.page_size.to_string()));
        }
        if self.kdf_iterations == 0 {
            return Err(AppError::argument(
                "KDF_ITERATIONS",
                "KDF iteration count must be positive",
            ));
        }
        Ok(())
    }

    /// Size of one page slot in an encrypted database file.
    pub fn slot_len(&self) -> usize {
        NONCE_LEN + self.page_size as usize + TAG_LEN
    }
}

pub fn is_valid_page_size(size: u32) -> bool {
    (MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&size) && size.is_power_of_two()
}

pub fn derive_key(passphrase: &[u8], salt: &KdfSalt, iterations: u32) -> AppResult<[u8; KEY_LEN]> {
    let params = Params::new(KDF_MEMORY_KIB, iterations.max(1), 1, Some(KEY_LEN))
        .map_err(|err| AppError::init("KDF_PARAMS", err.to_string()))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut out = [0u8; KEY_LEN];
    argon
        .hash_password_into(passphrase, salt.as_bytes(), &mut out)
        .map_err(|err| AppError::crypto("KDF", err.to_string()))?;
    Ok(out)
}

/// AEAD bound to one derived key.
#[derive(Clone)]
pub struct PageCipher {
    aead: XChaCha20Poly1305,
}

impl fmt::Debug for PageCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PageCipher { .. }")
    }
}

impl PageCipher {
    pub fn new(key: &[u8; KEY_LEN]) -> Self {
        Self {
            aead: XChaCha20Poly1305::new(Key::from_slice(key)),
        }
    }

    pub fn from_passphrase(passphrase: &[u8], salt: &KdfSalt, iterations: u32) -> AppResult<Self> {
        let key = derive_key(passphrase, salt, iterations)?;
        Ok(Self::new(&key))
    }

    /// Encrypts `plaintext` and returns `nonce | ciphertext | tag`.
    pub fn seal(&self, aad: &[u8], plaintext: &[u8]) -> AppResult<Vec<u8>> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let sealed = self
            .aead
            .encrypt(
                XNonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| AppError::crypto("ENCRYPT", "Encryption failed"))?;
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&sealed);
        Ok(out)
    }

    /// Reverses [`PageCipher::seal`]. Fails on a wrong key or any tampering.
    pub fn open(&self, aad: &[u8], sealed: &[u8]) -> AppResult<Vec<u8>> {
        if sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(AppError::crypto("TRUNCATED", "Sealed payload is too short"));
        }
        let (nonce, body) = sealed.split_at(NONCE_LEN);
        self.aead
            .decrypt(XNonce::from_slice(nonce), Payload { msg: body, aad })
            .map_err(|_| AppError::crypto("DECRYPT", "Decryption failed; wrong key or damaged data"))
    }
}

pub fn page_aad(page_no: u32) -> [u8; 4] {
    page_no.to_be_bytes()
}

/// Writes an encrypted copy of a plain database file. Returns the salt that
/// was generated for the copy.
pub fn seal_database(
    plain: &Path,
    out: &Path,
    passphrase: &[u8],
    params: CipherParams,
) -> AppResult<KdfSalt> {
    params.validate()?;
    let bytes = fs::read(plain).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "read_plain_database")
            .with_context("path", plain.display().to_string())
    })?;
    let page_size = params.page_size as usize;
    if bytes.len() < page_size || bytes.len() % page_size != 0 {
        return Err(AppError::argument(
            "PAGE_SIZE_MISMATCH",
            "Database length is not a multiple of the page size",
        )
        .with_context("path", plain.display().to_string())
        .with_context("page_size", params.page_size.to_string()));
    }
    if let Some(header_size) = crate::repair::pager::header_page_size(&bytes) {
        if header_size != params.page_size {
            return Err(AppError::argument(
                "PAGE_SIZE_MISMATCH",
                "Cipher page size differs from the database page size",
            )
            .with_context("database_page_size", header_size.to_string())
            .with_context("page_size", params.page_size.to_string()));
        }
    }

    let salt = KdfSalt::random();
    let cipher = PageCipher::from_passphrase(passphrase, &salt, params.kdf_iterations)?;
    let file = File::create(out).map_err(|err| {
        AppError::from(err)
            .with_context("operation", "create_sealed_database")
            .with_context("path", out.display().to_string())
    })?;
    let mut writer = BufWriter::new(file);
    let write_err = |err: std::io::Error| {
        AppError::from(err)
            .with_context("operation", "write_sealed_database")
            .with_context("path", out.display().to_string())
    };
    writer.write_all(salt.as_bytes()).map_err(write_err)?;
    for (index, page) in bytes.chunks(page_size).enumerate() {
        let page_no = index as u32 + 1;
        let slot = cipher.seal(&page_aad(page_no), page)?;
        writer.write_all(&slot).map_err(write_err)?;
    }
    writer.flush().map_err(write_err)?;
    writer
        .get_ref()
        .sync_all()
        .map_err(write_err)?;

    tracing::info!(
        target: "repairkit",
        event = "database_sealed",
        path = %out.display(),
        pages = bytes.len() / page_size
    );
    Ok(salt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_then_open_with_matching_aad() {
        let salt = KdfSalt([7u8; SALT_LEN]);
        let cipher = PageCipher::from_passphrase(b"secret", &salt, 1).expect("cipher");
        let sealed = cipher.seal(&page_aad(3), b"page body").expect("seal");
        assert_eq!(sealed.len(), NONCE_LEN + 9 + TAG_LEN);
        let opened = cipher.open(&page_aad(3), &sealed).expect("open");
        assert_eq!(opened, b"page body");
    }

    #[test]
    fn open_rejects_wrong_page_number() {
        let salt = KdfSalt([1u8; SALT_LEN]);
        let cipher = PageCipher::from_passphrase(b"secret", &salt, 1).expect("cipher");
        let sealed = cipher.seal(&page_aad(1), b"payload").expect("seal");
        let err = cipher.open(&page_aad(2), &sealed).expect_err("aad mismatch");
        assert_eq!(err.code(), "CRYPTO/DECRYPT");
    }

    #[test]
    fn different_salts_derive_different_keys() {
        let a = derive_key(b"secret", &KdfSalt([1u8; SALT_LEN]), 1).expect("key a");
        let b = derive_key(b"secret", &KdfSalt([2u8; SALT_LEN]), 1).expect("key b");
        assert_ne!(a, b);
    }

    #[test]
    fn params_reject_odd_page_sizes() {
        let params = CipherParams {
            page_size: 1000,
            kdf_iterations: 1,
        };
        assert_eq!(
            params.validate().expect_err("invalid").code(),
            "ARGUMENT/PAGE_SIZE"
        );
        assert!(CipherParams::default().validate().is_ok());
    }

    #[test]
    fn salt_debug_is_hex() {
        let salt = KdfSalt([0xab; SALT_LEN]);
        assert!(format!("{salt:?}").starts_with("KdfSalt(abab"));
    }
}
