//! Error types for the garagekit-reconcile subsystem

use garagekit_core::{CancelledError, Classify, ErrorClass};

/// Errors returned by an [`AdminApi`](crate::admin_client::AdminApi) call.
#[derive(Debug, thiserror::Error)]
pub enum AdminError {
    /// The request never produced an HTTP response (connect, timeout, reset).
    #[error("{method} {path}: transport error: {source}")]
    Transport {
        /// HTTP method.
        method: String,
        /// Request path.
        path: String,
        /// Underlying client error.
        #[source]
        source: reqwest::Error,
    },
    /// The server answered with a non-success status.
    #[error("{method} {path} returned {status}: {body}")]
    Status {
        /// HTTP method.
        method: String,
        /// Request path.
        path: String,
        /// HTTP status code.
        status: u16,
        /// Response body, truncated.
        body: String,
    },
    /// The response body could not be decoded.
    #[error("{method} {path}: cannot decode response: {reason}")]
    Decode {
        /// HTTP method.
        method: String,
        /// Request path.
        path: String,
        /// Decoder message.
        reason: String,
    },
    /// The client could not be constructed.
    #[error("invalid admin client configuration: {0}")]
    Config(String),
}

impl AdminError {
    /// HTTP status of the failed call, if the server answered.
    pub fn status(&self) -> Option<u16> {
        match self {
            AdminError::Status { status, .. } => Some(*status),
            _ => None,
        }
    }
}

impl Classify for AdminError {
    fn class(&self) -> ErrorClass {
        match self {
            AdminError::Transport { source, .. } => {
                if source.is_builder() {
                    ErrorClass::Fatal
                } else {
                    ErrorClass::Transient
                }
            }
            AdminError::Status { status, .. } => ErrorClass::from_status(*status),
            AdminError::Decode { .. } => ErrorClass::Fatal,
            AdminError::Config(_) => ErrorClass::Fatal,
        }
    }
}

/// Errors raised while loading or validating a desired-state document.
#[derive(Debug, thiserror::Error)]
pub enum DesiredStateError {
    /// The document could not be read.
    #[error("cannot read {path}: {source}")]
    Io {
        /// Document path.
        path: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The document is not valid YAML/JSON for the schema.
    #[error("invalid {format} document: {reason}")]
    Parse {
        /// `yaml` or `json`.
        format: &'static str,
        /// Parser message.
        reason: String,
    },
    /// The document parsed but breaks one or more invariants.
    #[error("desired state is invalid: {}", .issues.join("; "))]
    Invalid {
        /// Every violation found, in document order.
        issues: Vec<String>,
    },
}

/// Errors that stop a reconciliation run.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    /// The desired state failed to load or validate.
    #[error(transparent)]
    Desired(#[from] DesiredStateError),
    /// A remote call failed for good.
    #[error("{what} failed after {attempts} attempt(s): {source}")]
    Call {
        /// Operation name.
        what: String,
        /// Attempts made.
        attempts: u32,
        /// Last error seen.
        #[source]
        source: AdminError,
    },
    /// A bucket alias or key name has no known identifier.
    #[error("cannot resolve {kind} '{name}' to an identifier")]
    Unresolved {
        /// `bucket` or `key`.
        kind: &'static str,
        /// Alias or name.
        name: String,
    },
    /// The cluster did not answer its health check in time.
    #[error("cluster not ready after {waited_secs}s: {last_error}")]
    NotReady {
        /// Seconds spent waiting.
        waited_secs: u64,
        /// Last health check failure.
        last_error: String,
    },
    /// The run was cancelled.
    #[error(transparent)]
    Cancelled(#[from] CancelledError),
}

impl Classify for ReconcileError {
    fn class(&self) -> ErrorClass {
        match self {
            ReconcileError::Call { source, .. } => source.class(),
            ReconcileError::NotReady { .. } => ErrorClass::Transient,
            _ => ErrorClass::Fatal,
        }
    }
}
