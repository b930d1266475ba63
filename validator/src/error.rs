//! The error kinds of spec.md §7, shared by every module in this crate.

use shardval_block_util::{BlockIdExt, HandleError};
use shardval_storage::StorageError;
use thiserror::Error;

/// A core error, carrying one of the seven kinds spec.md §7 names.
#[derive(Debug, Error)]
pub enum CoreError {
    /// The requested datum is not locally available yet. Triggers retry or a
    /// queued wait; never escalated on its own.
    #[error("not ready: {0}")]
    NotReady(String),

    /// Deadline reached before the datum became available.
    #[error("timeout waiting for {0}")]
    Timeout(String),

    /// Structural or semantic mismatch on incoming data: bad proof, wrong
    /// shard, weight mismatch, wrong validator set. Fatal to the specific
    /// query; the peer may be punished.
    #[error("protocol violation: {0}")]
    ProtoViolation(String),

    /// An explicit cancel, or a superseding operation, aborted the work.
    #[error("cancelled: {0}")]
    Cancelled(String),

    /// The storage collaborator failed. Usually fatal to the query.
    #[error("storage error: {0}")]
    DbError(#[from] StorageError),

    /// An internal invariant is broken (e.g. re-setting an inited field).
    /// spec.md §9 notes a future revision may demote this; this revision
    /// keeps it fatal, per SPEC_FULL.md §3.
    #[error("contract violation: {0}")]
    ContractViolation(String),

    /// Catch-all for conditions outside the seven named kinds (still
    /// propagated the same way DbError/ProtoViolation are).
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<HandleError> for CoreError {
    fn from(err: HandleError) -> Self {
        CoreError::ContractViolation(err.to_string())
    }
}

impl CoreError {
    pub fn not_ready(id: impl std::fmt::Display) -> Self {
        CoreError::NotReady(id.to_string())
    }

    pub fn timeout(id: impl std::fmt::Display) -> Self {
        CoreError::Timeout(id.to_string())
    }

    pub fn proto_violation(msg: impl Into<String>) -> Self {
        CoreError::ProtoViolation(msg.into())
    }

    /// Prefixes a sub-stage's error with the stage name, per spec.md §7's
    /// "apply-block propagates the first predecessor failure with an
    /// error-prefix naming the stage".
    pub fn with_stage(self, stage: &str) -> Self {
        match self {
            CoreError::NotReady(m) => CoreError::NotReady(format!("{stage}: {m}")),
            CoreError::Timeout(m) => CoreError::Timeout(format!("{stage}: {m}")),
            CoreError::ProtoViolation(m) => CoreError::ProtoViolation(format!("{stage}: {m}")),
            CoreError::Cancelled(m) => CoreError::Cancelled(format!("{stage}: {m}")),
            other => other,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::NotReady(_) | CoreError::Timeout(_))
    }
}

/// Shorthand used throughout this crate.
pub type CoreResult<T> = Result<T, CoreError>;

/// Tags a "not found" storage lookup for a specific block as `NotReady`
/// rather than `DbError`, matching spec.md §4.2's wait-for semantics (a
/// missing datum retries; a genuine backing-store fault does not).
pub fn not_ready_for(id: BlockIdExt, err: StorageError) -> CoreError {
    match &err {
        StorageError::DataNotFound(_)
        | StorageError::ProofNotFound(_)
        | StorageError::ProofLinkNotFound(_)
        | StorageError::SignaturesNotFound(_)
        | StorageError::StateNotFound(_)
        | StorageError::HandleNotFound(_)
        | StorageError::CandidateNotFound { .. }
        | StorageError::LookupNotFound(_) => CoreError::NotReady(format!("{id}: {err}")),
        StorageError::ContractViolation(e) => CoreError::ContractViolation(e.to_string()),
        StorageError::Db(_) => CoreError::DbError(err),
    }
}
