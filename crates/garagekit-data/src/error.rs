//! Error types for the garagekit-data subsystem

use garagekit_core::{CancelledError, Classify, ErrorClass};

/// Result type for object store calls.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Errors returned by an [`ObjectStore`](crate::object_store::ObjectStore) call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    /// The bucket or object does not exist.
    #[error("{op} {target}: not found")]
    NotFound {
        /// Store operation.
        op: &'static str,
        /// `bucket` or `bucket/key`.
        target: String,
    },
    /// The store answered with an error, or the request never got an answer.
    #[error("{op} {target} failed: {message}")]
    Remote {
        /// Store operation.
        op: &'static str,
        /// `bucket` or `bucket/key`.
        target: String,
        /// HTTP status, when there was a response.
        status: Option<u16>,
        /// Retry class.
        class: ErrorClass,
        /// Error description.
        message: String,
    },
    /// The call did not finish within the per-call timeout.
    #[error("{op} {target} timed out after {secs}s")]
    Timeout {
        /// Store operation.
        op: &'static str,
        /// `bucket` or `bucket/key`.
        target: String,
        /// Timeout that elapsed.
        secs: u64,
    },
    /// The client could not be constructed.
    #[error("invalid object store configuration: {0}")]
    Config(String),
}

impl StoreError {
    /// True for a missing bucket or object.
    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

impl Classify for StoreError {
    fn class(&self) -> ErrorClass {
        match self {
            StoreError::NotFound { .. } => ErrorClass::Fatal,
            StoreError::Remote { class, .. } => *class,
            StoreError::Timeout { .. } => ErrorClass::Transient,
            StoreError::Config(_) => ErrorClass::Fatal,
        }
    }
}

/// Errors that abort a whole export, import, verify or sync.
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    /// Archive file could not be opened, read or written.
    #[error("{path}: {source}")]
    Io {
        /// Archive path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The archive is not a readable gzip-compressed tar.
    #[error("malformed archive: {0}")]
    Archive(String),
    /// The manifest is missing or does not match the archive.
    #[error("invalid manifest: {0}")]
    Manifest(String),
    /// Listing a bucket failed after retries.
    #[error("listing bucket {bucket} failed: {source}")]
    Listing {
        /// Bucket being listed.
        bucket: String,
        /// Last error seen.
        #[source]
        source: StoreError,
    },
    /// The archive writer or reader task died.
    #[error("archive task failed: {0}")]
    Task(String),
    /// The run was cancelled before anything was written.
    #[error(transparent)]
    Cancelled(#[from] CancelledError),
}

impl BackupError {
    pub(crate) fn io(path: &std::path::Path, source: std::io::Error) -> Self {
        BackupError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

impl Classify for BackupError {
    fn class(&self) -> ErrorClass {
        match self {
            BackupError::Listing { source, .. } => source.class(),
            _ => ErrorClass::Fatal,
        }
    }
}
