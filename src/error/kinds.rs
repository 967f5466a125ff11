use std::{fmt, io};

/// Crate-wide `Result` type using [`ExportError`] as the error.
///
/// This alias is re-exported by the parent `error` module and is intended
/// to be used throughout the crate for fallible operations.
pub type Result<T> = std::result::Result<T, ExportError>;

/// Top-level error type for export jobs.
///
/// This type wraps more specific error kinds and provides a single
/// error type that the job driver surfaces as the terminating error.
#[derive(Debug)]
pub enum ExportError {
    /// Configuration errors (missing options, unknown modules, bad values).
    Config(ConfigError),

    /// Checkpoint store errors.
    Persistence(PersistenceError),

    /// Delivered output does not match what was written locally.
    InconsistentWrite(InconsistentWriteError),

    /// Remote transfer errors (write, copy, listing).
    Transfer(TransferError),

    /// Record could not be formatted.
    Format(String),

    /// I/O errors.
    Io(io::Error),

    /// MongoDB driver errors.
    MongoDb(mongodb::error::Error),

    /// SQLite errors.
    Sqlite(rusqlite::Error),

    /// JSON (de)serialization errors.
    Json(serde_json::Error),

    /// Generic error with a free-form message.
    Generic(String),
}

/// Configuration-specific errors.
#[derive(Debug)]
pub enum ConfigError {
    /// Config file not found.
    FileNotFound(String),

    /// Invalid config format.
    InvalidFormat(String),

    /// Missing required field.
    MissingField(String),

    /// Invalid field value.
    InvalidValue { field: String, value: String },

    /// No module registered under this name.
    UnknownModule { kind: String, name: String },
}

/// Checkpoint store errors.
#[derive(Debug)]
pub enum PersistenceError {
    /// No job row for this id.
    JobNotFound(String),

    /// The job already finished and cannot be resumed.
    JobFinished(String),

    /// Resume URI does not follow the positional form.
    InvalidUri(String),

    /// No backend for the URI protocol.
    UnsupportedProtocol(String),

    /// Stored position carries a tag we do not know how to decode.
    UnknownPositionType(String),

    /// Stored position value does not decode under its tag.
    CorruptPosition { tag: String, raw: String, reason: String },

    /// Schema migration failed.
    Migration(String),
}

/// Raised by the consistency check. Never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InconsistentWriteError {
    /// The unit is missing at the destination.
    Missing { unit: String },

    /// The unit exists but its size differs from the spooled size.
    SizeMismatch {
        unit: String,
        expected: u64,
        actual: u64,
    },
}

/// Remote transfer errors.
#[derive(Debug)]
pub enum TransferError {
    /// Delivering a spool file failed.
    WriteFailed(String),

    /// Direct unit copy failed.
    CopyFailed(String),

    /// Listing source units failed.
    ListFailed(String),
}

impl ExportError {
    /// Whether the retry policy may attempt this operation again.
    ///
    /// Only transport-level failures are transient. Configuration and
    /// consistency errors mean state has already diverged.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExportError::Io(_) | ExportError::MongoDb(_) | ExportError::Transfer(_)
        )
    }
}

/* ========================= Display & Error impls ========================= */

impl fmt::Display for ExportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportError::Config(e) => write!(f, "Configuration error: {e}"),
            ExportError::Persistence(e) => write!(f, "Persistence error: {e}"),
            ExportError::InconsistentWrite(e) => write!(f, "Inconsistent write: {e}"),
            ExportError::Transfer(e) => write!(f, "Transfer error: {e}"),
            ExportError::Format(msg) => write!(f, "Format error: {msg}"),
            ExportError::Io(e) => write!(f, "I/O error: {e}"),
            ExportError::MongoDb(e) => write!(f, "MongoDB error: {e}"),
            ExportError::Sqlite(e) => write!(f, "SQLite error: {e}"),
            ExportError::Json(e) => write!(f, "JSON error: {e}"),
            ExportError::Generic(msg) => write!(f, "{msg}"),
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::FileNotFound(path) => write!(f, "Config file not found: {path}"),
            ConfigError::InvalidFormat(msg) => write!(f, "Invalid config format: {msg}"),
            ConfigError::MissingField(field) => write!(f, "Missing required field: {field}"),
            ConfigError::InvalidValue { field, value } => {
                write!(f, "Invalid value '{value}' for field '{field}'")
            }
            ConfigError::UnknownModule { kind, name } => {
                write!(f, "Unknown {kind} module: {name}")
            }
        }
    }
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistenceError::JobNotFound(id) => write!(f, "Job not found: {id}"),
            PersistenceError::JobFinished(id) => write!(f, "Job {id} already finished"),
            PersistenceError::InvalidUri(uri) => write!(f, "Invalid resume URI: {uri}"),
            PersistenceError::UnsupportedProtocol(proto) => {
                write!(f, "Unsupported persistence protocol: {proto}")
            }
            PersistenceError::UnknownPositionType(tag) => {
                write!(f, "Unknown position type: {tag}")
            }
            PersistenceError::CorruptPosition { tag, raw, reason } => {
                write!(f, "Cannot decode {tag} position '{raw}': {reason}")
            }
            PersistenceError::Migration(msg) => write!(f, "Migration failed: {msg}"),
        }
    }
}

impl fmt::Display for InconsistentWriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InconsistentWriteError::Missing { unit } => {
                write!(f, "Unit {unit} is not present at destination")
            }
            InconsistentWriteError::SizeMismatch {
                unit,
                expected,
                actual,
            } => write!(
                f,
                "Wrong size for unit {unit} (expected {expected} - got {actual})"
            ),
        }
    }
}

impl fmt::Display for TransferError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferError::WriteFailed(msg) => write!(f, "Write failed: {msg}"),
            TransferError::CopyFailed(msg) => write!(f, "Copy failed: {msg}"),
            TransferError::ListFailed(msg) => write!(f, "Listing failed: {msg}"),
        }
    }
}

impl std::error::Error for ExportError {}
impl std::error::Error for ConfigError {}
impl std::error::Error for PersistenceError {}
impl std::error::Error for InconsistentWriteError {}
impl std::error::Error for TransferError {}

/* ========================= Conversions to ExportError ========================= */

impl From<io::Error> for ExportError {
    fn from(err: io::Error) -> Self {
        ExportError::Io(err)
    }
}

impl From<mongodb::error::Error> for ExportError {
    fn from(err: mongodb::error::Error) -> Self {
        ExportError::MongoDb(err)
    }
}

impl From<rusqlite::Error> for ExportError {
    fn from(err: rusqlite::Error) -> Self {
        ExportError::Sqlite(err)
    }
}

impl From<rusqlite_migration::Error> for ExportError {
    fn from(err: rusqlite_migration::Error) -> Self {
        ExportError::Persistence(PersistenceError::Migration(err.to_string()))
    }
}

impl From<serde_json::Error> for ExportError {
    fn from(err: serde_json::Error) -> Self {
        ExportError::Json(err)
    }
}

impl From<toml::de::Error> for ExportError {
    fn from(err: toml::de::Error) -> Self {
        ExportError::Config(ConfigError::InvalidFormat(err.to_string()))
    }
}

impl From<toml::ser::Error> for ExportError {
    fn from(err: toml::ser::Error) -> Self {
        ExportError::Config(ConfigError::InvalidFormat(err.to_string()))
    }
}

impl From<ConfigError> for ExportError {
    fn from(err: ConfigError) -> Self {
        ExportError::Config(err)
    }
}

impl From<PersistenceError> for ExportError {
    fn from(err: PersistenceError) -> Self {
        ExportError::Persistence(err)
    }
}

impl From<InconsistentWriteError> for ExportError {
    fn from(err: InconsistentWriteError) -> Self {
        ExportError::InconsistentWrite(err)
    }
}

impl From<TransferError> for ExportError {
    fn from(err: TransferError) -> Self {
        ExportError::Transfer(err)
    }
}

impl From<String> for ExportError {
    fn from(msg: String) -> Self {
        ExportError::Generic(msg)
    }
}

impl From<&str> for ExportError {
    fn from(msg: &str) -> Self {
        ExportError::Generic(msg.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_unit_message() {
        let err: ExportError = InconsistentWriteError::Missing {
            unit: "/out/export_0000.jl".to_string(),
        }
        .into();
        let msg = err.to_string();
        assert!(msg.contains("/out/export_0000.jl"));
        assert!(msg.contains("not present"));
    }

    #[test]
    fn test_size_mismatch_message() {
        let err = InconsistentWriteError::SizeMismatch {
            unit: "a.jl".to_string(),
            expected: 10,
            actual: 3,
        };
        assert_eq!(
            err.to_string(),
            "Wrong size for unit a.jl (expected 10 - got 3)"
        );
    }

    #[test]
    fn test_retry_classification() {
        let io = ExportError::Io(io::Error::new(io::ErrorKind::TimedOut, "slow"));
        assert!(io.is_retryable());
        assert!(ExportError::Transfer(TransferError::CopyFailed("x".into())).is_retryable());

        let inconsistent: ExportError = InconsistentWriteError::Missing { unit: "u".into() }.into();
        assert!(!inconsistent.is_retryable());
        assert!(!ExportError::Config(ConfigError::MissingField("writer.filebase".into()))
            .is_retryable());
    }
}
