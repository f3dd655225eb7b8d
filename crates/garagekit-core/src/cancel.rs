//! Cooperative cancellation for long runs.
//!
//! A run checks its [`CancelToken`] between operations or object transfers.
//! Work already in flight is allowed to finish; nothing new is started once
//! the token is cancelled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reasons for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    /// Interrupt signal received (Ctrl-C, SIGTERM).
    Interrupted,
    /// Explicit caller cancellation.
    #[default]
    UserRequested,
    /// A sibling task failed and the run is stopping.
    StopOnError,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CancelReason::Interrupted => write!(f, "interrupted"),
            CancelReason::UserRequested => write!(f, "user requested"),
            CancelReason::StopOnError => write!(f, "stop on error"),
        }
    }
}

/// Error returned when an operation is cancelled.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("operation cancelled: {0}")]
pub struct CancelledError(pub CancelReason);

#[derive(Default)]
struct Shared {
    cancelled: AtomicBool,
    reason: Mutex<Option<CancelReason>>,
    children: Mutex<Vec<Weak<Shared>>>,
}

impl Shared {
    fn cancel(&self, reason: CancelReason) {
        if let Ok(mut r) = self.reason.lock() {
            if r.is_none() {
                *r = Some(reason);
            }
        }
        self.cancelled.store(true, Ordering::SeqCst);
        let children: Vec<Arc<Shared>> = match self.children.lock() {
            Ok(children) => children.iter().filter_map(Weak::upgrade).collect(),
            Err(_) => Vec::new(),
        };
        for child in children {
            child.cancel(reason);
        }
    }

    /// Register a child and drop entries whose tokens are gone.
    fn adopt(&self, child: &Arc<Shared>) {
        if let Ok(mut children) = self.children.lock() {
            children.retain(|c| c.strong_count() > 0);
            children.push(Arc::downgrade(child));
        }
    }
}

/// A cloneable cancellation token.
#[derive(Clone, Default)]
pub struct CancelToken {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

impl CancelToken {
    /// A token that is never cancelled.
    pub fn never() -> Self {
        Self::default()
    }

    /// Check if this token has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }

    /// The cancellation reason, if cancelled.
    pub fn cancelled_reason(&self) -> Option<CancelReason> {
        self.shared.reason.lock().ok().and_then(|r| *r)
    }

    /// `Err` if cancelled, for use with `?` between steps.
    pub fn check(&self) -> Result<(), CancelledError> {
        if self.is_cancelled() {
            Err(CancelledError(
                self.cancelled_reason().unwrap_or_default(),
            ))
        } else {
            Ok(())
        }
    }

    /// Create a child token that is cancelled when this token is cancelled,
    /// but can also be cancelled on its own.
    ///
    /// The parent holds only a weak reference; once every clone of the
    /// child token and handle is dropped the entry is pruned.
    pub fn child(&self) -> (CancelToken, CancelHandle) {
        let child = Arc::new(Shared::default());
        self.shared.adopt(&child);
        // register before reading the reason
        if let Some(reason) = self.cancelled_reason() {
            child.cancel(reason);
        }
        (
            CancelToken {
                shared: Arc::clone(&child),
            },
            CancelHandle { shared: child },
        )
    }

    #[cfg(test)]
    fn child_slots(&self) -> usize {
        self.shared.children.lock().map(|c| c.len()).unwrap_or(0)
    }
}

/// The handle that triggers cancellation.
#[derive(Clone)]
pub struct CancelHandle {
    shared: Arc<Shared>,
}

impl CancelHandle {
    /// Trigger cancellation. The first reason given is kept.
    pub fn cancel(&self, reason: CancelReason) {
        self.shared.cancel(reason);
    }

    /// Check if cancellation has been triggered.
    pub fn is_cancelled(&self) -> bool {
        self.shared.cancelled.load(Ordering::SeqCst)
    }
}

/// Create a new cancellation token/handle pair.
pub fn new_cancel_pair() -> (CancelToken, CancelHandle) {
    let shared = Arc::new(Shared::default());
    (
        CancelToken {
            shared: Arc::clone(&shared),
        },
        CancelHandle { shared },
    )
}
