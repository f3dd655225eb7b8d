//! Error classes shared by every remote-call error type.
//!
//! Callers never match on transport details to decide what to do next; they
//! ask the error for its class. Retry, conflict tolerance and abort decisions
//! are all made from this one value.

use serde::{Deserialize, Serialize};

/// How a failed remote call should be treated by its caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorClass {
    /// Network failure, timeout, throttling or 5xx. Safe to retry.
    Transient,
    /// The resource already exists or is already in the requested shape.
    Conflict,
    /// Authentication, authorization, malformed request or server-side
    /// validation failure. Retrying will not help.
    Fatal,
}

impl ErrorClass {
    /// Classify an HTTP status code.
    ///
    /// 409 is a conflict, 408/429 and every 5xx are transient, everything
    /// else that is not a success is fatal.
    pub fn from_status(status: u16) -> Self {
        match status {
            409 => ErrorClass::Conflict,
            408 | 429 => ErrorClass::Transient,
            500..=599 => ErrorClass::Transient,
            _ => ErrorClass::Fatal,
        }
    }
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorClass::Transient => write!(f, "transient"),
            ErrorClass::Conflict => write!(f, "conflict"),
            ErrorClass::Fatal => write!(f, "fatal"),
        }
    }
}

/// Implemented by errors that come out of a remote call.
pub trait Classify {
    /// The class of this error.
    fn class(&self) -> ErrorClass;

    /// True if the call may be retried.
    fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// True if the error means "already done".
    fn is_conflict(&self) -> bool {
        self.class() == ErrorClass::Conflict
    }
}
