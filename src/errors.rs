//! Error types for the storage façade and its backends.
//!
//! Three layers, from the inside out:
//!
//! * [`ValidationError`] -- a blob name breaks a structural constraint.
//! * [`BackendError`] -- the blob service (or its transport) failed.
//! * [`StorageError`] -- everything a façade or file handle call can return.
//!
//! Security-relevant failures ([`StorageError::SuspiciousPath`]) are a
//! separate variant so callers can audit them apart from plain bad input.

use thiserror::Error;

/// A blob name that cannot be stored.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The name is longer than the backend allows.
    #[error("File name max len is {max} (got {len})")]
    NameTooLong { len: usize, max: usize },

    /// Nothing is left once leading/trailing dots and slashes are removed.
    #[error("File name must contain one or more printable characters")]
    NameEmpty,

    /// The name has too many `/` separators.
    #[error("File name must not contain more than {max} slashes (got {count})")]
    TooManySegments { count: usize, max: usize },
}

/// Failure reported by a [`crate::storage::backend::BlobClient`].
#[derive(Debug, Error)]
pub enum BackendError {
    /// The blob (or container) does not exist.
    #[error("The specified blob does not exist: {name}")]
    NotFound { name: String },

    /// The service answered with a non-success status.
    #[error("Azure {operation}: HTTP {status} - {body}")]
    Http {
        operation: &'static str,
        status: u16,
        body: String,
    },

    /// The request never produced a response (DNS, TLS, timeout, ...).
    #[error("Azure {operation} request failed: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: reqwest::Error,
    },

    /// The service answered, but the body could not be understood.
    #[error("Azure {operation}: malformed response - {message}")]
    Malformed {
        operation: &'static str,
        message: String,
    },

    /// Credentials are missing or cannot be used for the requested call.
    #[error("credential error: {0}")]
    Credentials(String),

    /// A connection string could not be parsed.
    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),

    /// Reading the upload source or writing the download sink failed.
    #[error("stream I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl BackendError {
    /// True for the "resource not found" condition.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound { .. })
    }
}

/// Errors surfaced by [`crate::AzureStorage`] and [`crate::FileHandle`].
#[derive(Debug, Error)]
pub enum StorageError {
    /// The logical name does not map to a valid blob name.
    #[error("invalid file name '{name}': {source}")]
    Validation {
        name: String,
        #[source]
        source: ValidationError,
    },

    /// The name resolves outside the storage root.
    #[error("Attempted access to '{name}' denied.")]
    SuspiciousPath { name: String },

    /// Read or write on a handle opened in an incompatible mode.
    #[error("File was not opened in {required} mode (mode '{mode}').")]
    Mode { mode: String, required: &'static str },

    /// `open` was given a mode string outside the supported set.
    #[error("unsupported file mode '{0}'")]
    InvalidMode(String),

    /// A URL lifetime too large to express as an expiry time.
    #[error("URL expiry of {secs} seconds is out of range")]
    InvalidExpiry { secs: u64 },

    /// The handle was already closed; open the name again.
    #[error("file handle for '{name}' is closed")]
    Closed { name: String },

    /// The blob service failed; the backend classification is kept.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// The local spooled buffer failed.
    #[error("local buffer I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// True for root-escape attempts.
    pub fn is_security(&self) -> bool {
        matches!(self, StorageError::SuspiciousPath { .. })
    }

    /// True for structural name problems.
    pub fn is_validation(&self) -> bool {
        matches!(self, StorageError::Validation { .. })
    }

    /// True when the backend reported a missing blob.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::Backend(e) if e.is_not_found())
    }
}

/// Result alias used throughout the façade.
pub type Result<T> = std::result::Result<T, StorageError>;
