#![warn(missing_docs)]

//! garagekit shared plumbing: error classes, bounded retry, cooperative cancellation

pub mod cancel;
pub mod error;
pub mod retry;

pub use cancel::{new_cancel_pair, CancelHandle, CancelReason, CancelToken, CancelledError};
pub use error::{Classify, ErrorClass};
pub use retry::{RetryConfig, RetryExecutor, RetryOutcome};
