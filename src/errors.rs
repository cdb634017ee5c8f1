// Error taxonomy for the transactional runtime.

use thiserror::Error as DeriveError;

/// All fallible outcomes the public API can surface.
///
/// [`StmError::Retry`] never escapes a well-behaved call to [`crate::atomically`];
/// it is caught and turned into a loop iteration by the transaction driver. It
/// is `pub` only so that custom drivers built on top of [`crate::context::TxContext`]
/// can recognize it.
#[derive(Debug, DeriveError)]
pub enum StmError {
    /// Internal signal: the transaction's read view is stale, or a commit was
    /// refused during validation. Always caught by [`crate::atomically`].
    #[error("transaction must retry")]
    Retry,

    /// Raised by `rollback(retry = false)` or an explicit user abort. Not
    /// retried; propagates to the caller.
    #[error("transaction aborted: {0}")]
    Abort(String),

    /// A transactional operation was called outside of an active transaction.
    #[error("not in a transaction")]
    NotInTransaction,

    /// Dictionary / sorted-map indexer addressed a key that is not present.
    #[error("key not found")]
    KeyNotFound,

    /// A `conditional` test never touched a single cell (it would never be
    /// re-triggered), an observer tried to expand its footprint, or a
    /// continuation was used after it completed.
    #[error("invalid transactional state: {0}")]
    InvalidState(String),

    /// A [`crate::continuation::Continuation`] was used after `commit`,
    /// `dispose`, or its timeout already resolved it.
    #[error("continuation already completed")]
    ContinuationCompleted,

    /// One or more side effects failed. The first on-commit failure is kept
    /// verbatim; everything else (later on-commit failures, all on-rollback
    /// failures) is folded into `aggregated`.
    #[error("side effect failed: {first}")]
    SideEffect { first: String, aggregated: Vec<String> },
}

impl StmError {
    pub(crate) fn abort(msg: impl Into<String>) -> Self {
        StmError::Abort(msg.into())
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        StmError::InvalidState(msg.into())
    }
}

pub type Result<T> = core::result::Result<T, StmError>;
