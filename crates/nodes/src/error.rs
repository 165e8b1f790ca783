//! Node-level error type.

use thiserror::Error;

/// Errors returned while deciding or applying a node.
///
/// The scheduler uses the variant to decide retry behaviour:
/// - `Retryable`: the enrollment is rescheduled with exponential back-off.
/// - `Fatal`: the enrollment is exited immediately.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NodeError {
    /// Transient failure; the scheduler should try the node again later.
    #[error("retryable node error: {0}")]
    Retryable(String),

    /// Permanent failure; no retry should be attempted.
    #[error("fatal node error: {0}")]
    Fatal(String),
}

impl NodeError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable(_))
    }
}
