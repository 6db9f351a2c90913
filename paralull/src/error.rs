use std::alloc::{handle_alloc_error, Layout};

use thiserror::Error;

/// Errors surfaced by the fallible constructors of the queue.
///
/// Enqueue and dequeue never fail; a lost race inside the algorithm is
/// ordinary control flow. The only recoverable failure is running out of
/// memory while creating the queue or a thread handle.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// The allocator returned null for a segment or a handle bucket.
    #[error("failed to allocate {what} ({} bytes)", .layout.size())]
    AllocFailed {
        /// What was being allocated.
        what: &'static str,
        /// The layout that could not be satisfied.
        layout: Layout,
    },
}

impl QueueError {
    /// Hands the failure to the global allocation error handler.
    pub(crate) fn abort(self) -> ! {
        match self {
            QueueError::AllocFailed { layout, .. } => handle_alloc_error(layout),
        }
    }
}

/// Reports a broken internal invariant and aborts the process.
///
/// Reaching this means the handle ring or a request record is corrupted;
/// continuing would operate on undefined state.
#[cold]
pub(crate) fn protocol_violation(what: &str) -> ! {
    tracing::error!(target: "paralull", violation = what, "queue protocol invariant violated");
    std::process::abort()
}
