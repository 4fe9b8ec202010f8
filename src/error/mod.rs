use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;

use anyhow::Error as AnyhowError;
use rusqlite::Error as SqliteError;
use serde::{Deserialize, Serialize};
use serde_json::Error as SerdeJsonError;
use sqlx::Error as SqlxError;
use std::io::Error as IoError;

/// A structured error carried across every public operation.
///
/// The `code` is a `KIND/DETAIL` string; [`ErrorKind`] classifies it by the
/// part before the slash.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppError {
    /// Machine readable error code.
    pub code: String,
    /// Human friendly message.
    pub message: String,
    /// Arbitrary key/value pairs that provide additional context.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, String>,
    /// Optional nested cause that preserves the error chain.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<AppError>>,
}

pub type AppResult<T> = std::result::Result<T, AppError>;
pub type Result<T> = AppResult<T>;

/// Error taxonomy exposed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Invalid input such as an odd-length table description.
    Argument,
    /// The target could not be opened or is not a database.
    Open,
    /// Internal initialization failed (writer, pager, key schedule).
    Init,
    /// Wrong key, missing key or failed decryption.
    Crypto,
    /// A persisted file does not match the expected layout.
    Format,
    /// Resource exhaustion.
    Allocation,
    /// The handle was already released.
    Released,
    Io,
    Sqlite,
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Argument => "argument",
            ErrorKind::Open => "open",
            ErrorKind::Init => "init",
            ErrorKind::Crypto => "crypto",
            ErrorKind::Format => "format",
            ErrorKind::Allocation => "allocation",
            ErrorKind::Released => "released",
            ErrorKind::Io => "io",
            ErrorKind::Sqlite => "sqlite",
            ErrorKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AppError {
    /// Default code used when an upstream error does not expose a specific code.
    pub const UNKNOWN_CODE: &'static str = "APP/UNKNOWN";
    /// Code used for errors created from free-form messages.
    pub const GENERIC_CODE: &'static str = "APP/GENERIC";
    /// Code returned by any operation on a released handle.
    pub const RELEASED_CODE: &'static str = "HANDLE/RELEASED";

    /// Construct a new error with the provided code and message.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        AppError {
            code: code.into(),
            message: message.into(),
            context: HashMap::new(),
            cause: None,
        }
    }

    pub fn argument(detail: &str, message: impl Into<String>) -> Self {
        AppError::new(format!("ARGUMENT/{detail}"), message)
    }

    pub fn open(detail: &str, message: impl Into<String>) -> Self {
        AppError::new(format!("OPEN/{detail}"), message)
    }

    pub fn init(detail: &str, message: impl Into<String>) -> Self {
        AppError::new(format!("INIT/{detail}"), message)
    }

    pub fn crypto(detail: &str, message: impl Into<String>) -> Self {
        AppError::new(format!("CRYPTO/{detail}"), message)
    }

    pub fn format(detail: &str, message: impl Into<String>) -> Self {
        AppError::new(format!("FORMAT/{detail}"), message)
    }

    /// Error returned for any call made after `release()`.
    pub fn released(handle: &str) -> Self {
        AppError::new(Self::RELEASED_CODE, format!("{handle} has already been released"))
            .with_context("handle", handle.to_string())
    }

    /// Returns the error code.
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Returns the error message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Returns the contextual metadata associated with the error.
    pub fn context(&self) -> &HashMap<String, String> {
        &self.context
    }

    /// Returns the nested cause if one is present.
    pub fn cause(&self) -> Option<&AppError> {
        self.cause.as_deref()
    }

    /// Classifies the error by its code prefix.
    pub fn kind(&self) -> ErrorKind {
        let prefix = self.code.split('/').next().unwrap_or_default();
        match prefix {
            "ARGUMENT" => ErrorKind::Argument,
            "OPEN" => ErrorKind::Open,
            "INIT" => ErrorKind::Init,
            "CRYPTO" => ErrorKind::Crypto,
            "FORMAT" => ErrorKind::Format,
            "ALLOCATION" => ErrorKind::Allocation,
            "HANDLE" => ErrorKind::Released,
            "IO" => ErrorKind::Io,
            "SQLITE" | "SQLX" | "Sqlite" => ErrorKind::Sqlite,
            _ => ErrorKind::Unknown,
        }
    }

    /// Adds a contextual key/value pair to the error.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Extends the context map with additional key/value pairs.
    pub fn with_contexts<I, K, V>(mut self, entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.context
            .extend(entries.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Sets the nested cause for the error.
    pub fn with_cause(mut self, cause: impl Into<AppError>) -> Self {
        self.cause = Some(Box::new(cause.into()));
        self
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.context.is_empty() {
            write!(f, "[{}] {}", self.code, self.message)
        } else {
            write!(f, "[{}] {} ({:?})", self.code, self.message, self.context)
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|cause| cause as &(dyn std::error::Error + 'static))
    }
}

impl From<&str> for AppError {
    fn from(message: &str) -> Self {
        AppError::new(AppError::GENERIC_CODE, message)
    }
}

impl From<String> for AppError {
    fn from(message: String) -> Self {
        AppError::new(AppError::GENERIC_CODE, message)
    }
}

impl From<AnyhowError> for AppError {
    fn from(error: AnyhowError) -> Self {
        fn convert(err: &(dyn StdError + 'static)) -> AppError {
            if let Some(app) = err.downcast_ref::<AppError>() {
                return app.clone();
            }

            let mut root = AppError::new(AppError::UNKNOWN_CODE, err.to_string());
            if let Some(source) = err.source() {
                root.cause = Some(Box::new(convert(source)));
            }
            root
        }

        convert(error.as_ref())
    }
}

impl From<IoError> for AppError {
    fn from(error: IoError) -> Self {
        let code = format!("IO/{:?}", error.kind());
        let mut app_error = AppError::new(code, error.to_string());
        if let Some(os_code) = error.raw_os_error() {
            app_error = app_error.with_context("os_code", os_code.to_string());
        }
        app_error
    }
}

impl From<SerdeJsonError> for AppError {
    fn from(error: SerdeJsonError) -> Self {
        let code = if error.is_data() {
            "JSON/DATA"
        } else if error.is_syntax() {
            "JSON/SYNTAX"
        } else if error.is_eof() {
            "JSON/EOF"
        } else if error.is_io() {
            "JSON/IO"
        } else {
            "JSON/ERROR"
        };

        let mut app_error = AppError::new(code, error.to_string());
        let line = error.line();
        if line > 0 {
            app_error = app_error.with_context("line", line.to_string());
        }
        let column = error.column();
        if column > 0 {
            app_error = app_error.with_context("column", column.to_string());
        }
        app_error
    }
}

impl From<SqliteError> for AppError {
    fn from(error: SqliteError) -> Self {
        match &error {
            SqliteError::SqliteFailure(inner, message) => {
                let code = match inner.code {
                    rusqlite::ErrorCode::NotADatabase => "OPEN/NOT_A_DATABASE".to_string(),
                    rusqlite::ErrorCode::CannotOpen => "OPEN/CANNOT_OPEN".to_string(),
                    rusqlite::ErrorCode::OutOfMemory => "ALLOCATION/OUT_OF_MEMORY".to_string(),
                    other => format!("SQLITE/{other:?}"),
                };
                let text = message.clone().unwrap_or_else(|| error.to_string());
                AppError::new(code, text)
                    .with_context("extended_code", inner.extended_code.to_string())
            }
            SqliteError::QueryReturnedNoRows => {
                AppError::new("SQLITE/NO_ROWS", "Query returned no rows")
            }
            SqliteError::InvalidColumnName(name) => {
                AppError::new("SQLITE/COLUMN_NOT_FOUND", format!("Column not found: {name}"))
            }
            _ => AppError::new("SQLITE/ERROR", error.to_string()),
        }
    }
}

impl From<SqlxError> for AppError {
    fn from(error: SqlxError) -> Self {
        match error {
            SqlxError::RowNotFound => AppError::new("SQLX/ROW_NOT_FOUND", "Record not found"),
            SqlxError::ColumnNotFound(name) => {
                AppError::new("SQLX/COLUMN_NOT_FOUND", format!("Column not found: {name}"))
            }
            SqlxError::PoolTimedOut => AppError::new(
                "SQLX/POOL_TIMEOUT",
                "Timed out acquiring a database connection",
            ),
            SqlxError::PoolClosed => AppError::new("SQLX/POOL_CLOSED", "Database pool is closed"),
            SqlxError::Io(err) => AppError::from(err).with_context("source", "sqlx"),
            SqlxError::Database(db) => {
                let code = db
                    .code()
                    .map(|code| format!("Sqlite/{code}"))
                    .unwrap_or_else(|| "SQLX/DATABASE".to_string());
                AppError::new(code, db.message().to_string())
            }
            other => AppError::new("SQLX/ERROR", other.to_string()),
        }
    }
}

impl From<bincode::Error> for AppError {
    fn from(error: bincode::Error) -> Self {
        AppError::format("ENCODING", error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn builds_error_with_context_and_cause() {
        let error = AppError::new("FORMAT/BAD_MAGIC", "Unrecognised snapshot file")
            .with_context("path", "/tmp/master.rkms")
            .with_cause(AppError::from("inner failure"));

        assert_eq!(error.code(), "FORMAT/BAD_MAGIC");
        assert_eq!(error.kind(), ErrorKind::Format);
        assert_eq!(
            error.context().get("path"),
            Some(&"/tmp/master.rkms".to_string())
        );
        let cause = error.cause().expect("cause present");
        assert_eq!(cause.message(), "inner failure");
        assert_eq!(cause.code(), AppError::GENERIC_CODE);
    }

    #[test]
    fn kind_follows_code_prefix() {
        assert_eq!(
            AppError::argument("ODD_TABLE_DESC", "x").kind(),
            ErrorKind::Argument
        );
        assert_eq!(AppError::open("NOT_FOUND", "x").kind(), ErrorKind::Open);
        assert_eq!(AppError::init("WRITER", "x").kind(), ErrorKind::Init);
        assert_eq!(AppError::crypto("WRONG_KEY", "x").kind(), ErrorKind::Crypto);
        assert_eq!(AppError::released("BackupSession").kind(), ErrorKind::Released);
        assert_eq!(AppError::from("free text").kind(), ErrorKind::Unknown);
    }

    #[test]
    fn converts_anyhow_error_chain_into_nested_causes() {
        let err = (|| -> anyhow::Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk full"))
                .context("failed to save file")
        })()
        .unwrap_err();

        let app_error = AppError::from(err);
        assert_eq!(app_error.code(), AppError::UNKNOWN_CODE);
        assert_eq!(app_error.message(), "failed to save file");

        let cause = app_error.cause().expect("io cause present");
        assert!(cause.message().contains("disk full"));
    }

    #[test]
    fn io_error_contains_raw_code_when_available() {
        let err = IoError::from_raw_os_error(2);
        let app_error = AppError::from(err);
        assert_eq!(app_error.code(), "IO/NotFound");
        assert_eq!(app_error.kind(), ErrorKind::Io);
        assert_eq!(app_error.context().get("os_code"), Some(&"2".to_string()));
    }

    #[test]
    fn sqlite_not_a_database_maps_to_open_kind() {
        let tmp = tempfile::NamedTempFile::new().expect("tmp");
        std::fs::write(tmp.path(), vec![0x42u8; 8192]).expect("write junk");
        let conn = rusqlite::Connection::open(tmp.path()).expect("lazy open");
        let err = conn
            .query_row("SELECT count(*) FROM sqlite_master", [], |row| {
                row.get::<_, i64>(0)
            })
            .expect_err("junk file is not a database");
        let app_error = AppError::from(err);
        assert_eq!(app_error.code(), "OPEN/NOT_A_DATABASE");
        assert_eq!(app_error.kind(), ErrorKind::Open);
    }

    #[test]
    fn json_shape_is_flat_struct() {
        let error = AppError::crypto("WRONG_KEY", "nope").with_context("path", "db");
        let json = serde_json::to_string(&error).expect("serialize app error");
        let value: serde_json::Value = serde_json::from_str(&json).expect("parse serialized error");
        assert_eq!(
            value.get("code").and_then(|v| v.as_str()),
            Some("CRYPTO/WRONG_KEY")
        );
        assert_eq!(value.get("message").and_then(|v| v.as_str()), Some("nope"));
        assert!(value.get("cause").is_none());
    }
}
