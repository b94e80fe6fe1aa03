//! Error taxonomy for the dispatch engine.
//!
//! Platform failures are recoverable statuses carried through `Result`;
//! contract violations (misaligned kernarg appends, kernarg region overflow)
//! are programming errors and panic instead.

use std::time::Duration;

use thiserror::Error;

/// Failure of one lifecycle phase. Any variant halts the lifecycle and skips
/// every subsequent phase.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No suitable agent, queue, or memory region was found.
    #[error("discovery failed: {0}")]
    Discovery(String),

    /// Code object image missing, malformed, or failed to link.
    #[error("code object load failed: {0}")]
    Load(String),

    /// Host or device memory exhausted.
    #[error("allocation failed: {0}")]
    Allocation(String),

    /// Copy or coherence-permission step rejected by the platform.
    #[error("staging failed: {0}")]
    Staging(String),

    /// Completion signal did not reach zero within the deadline. The device
    /// may still be executing the kernel; nothing is reclaimed.
    #[error("kernel execution timed out after {elapsed:?} (deadline {deadline:?})")]
    Timeout { deadline: Duration, elapsed: Duration },

    /// Caller-supplied correctness check failed.
    #[error("verification failed: {0}")]
    Verification(String),
}

pub type Result<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_reports_both_durations() {
        let err = DispatchError::Timeout {
            deadline: Duration::from_secs(2),
            elapsed: Duration::from_millis(2100),
        };
        let msg = err.to_string();
        assert!(msg.contains("2s"));
        assert!(msg.contains("2.1s"));
    }
}
