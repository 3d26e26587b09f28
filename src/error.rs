use thiserror::Error;

/// Errors that abort a whole sync operation. Per-day query failures and
/// per-measurement upload failures are deliberately absent: those are
/// swallowed inside the loops (logged, or recorded as a failed
/// `SyncResult`) so progress already made in a batch is never lost.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Credentials missing, invalid, or expired beyond refresh. Fatal for
    /// the whole operation; never retried per item.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Caller-supplied date range rejected before any network activity.
    #[error("invalid date range: {0}")]
    Validation(String),

    /// A provider call failed during setup (outside batch iteration).
    #[error(transparent)]
    Provider(#[from] anyhow::Error),
}
