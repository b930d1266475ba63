//! The consensus session contract of spec.md §6: the `ValidatorSession` the
//! core drives, and the callback trait the core implements so the session
//! can drive it back. The BFT algorithm itself (catchain/DAG participation,
//! round agreement) is out of scope (spec.md §1) — only the shape of this
//! boundary is built, following teacher's `tycho_consensus` engine callback
//! shape (`Effects`, round numbers) without the DAG/engine internals.

use async_trait::async_trait;
use bytes::Bytes;
use shardval_block_util::{BlockIdExt, SignatureSet};
use thiserror::Error;

pub type Round = u32;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session not ready to answer this query yet")]
    NotReady,
    #[error("session query cancelled")]
    Cancelled,
    #[error("session protocol violation: {0}")]
    ProtoViolation(String),
}

/// Identifies the validator that produced a candidate or signed a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSourceInfo {
    pub pubkey: [u8; 32],
    pub adnl_id: Option<[u8; 32]>,
}

/// A block body plus its collated (non-canonical, collator-local) data, as
/// handed to or received from the session.
#[derive(Debug, Clone)]
pub struct BlockCandidate {
    pub id: BlockIdExt,
    pub data: Bytes,
    pub collated_data: Bytes,
}

/// `validate_block_candidate`'s verdict on an incoming candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Approve,
    Reject { reason: String },
}

/// A stats record accompanying `on_block_committed`, surfaced by the group
/// to the observability bus (spec.md §9).
#[derive(Debug, Clone, Default)]
pub struct BlockCommitStats {
    pub collation_time_ms: u64,
    pub validation_time_ms: u64,
}

/// The callbacks the core implements for the session to drive (spec.md §6
/// "Consensus session"), matched one-to-one to the Validator Group's own
/// `generate_block_candidate`/`validate_block_candidate`/
/// `accept_block_candidate` methods.
#[async_trait]
pub trait ValidatorSessionCallback: Send + Sync + 'static {
    async fn on_generate_slot(&self, round: Round) -> Result<BlockCandidate, SessionError>;

    async fn on_candidate(
        &self,
        round: Round,
        src: BlockSourceInfo,
        root_hash: [u8; 32],
        data: Bytes,
        collated_data_hash: [u8; 32],
    ) -> Result<Decision, SessionError>;

    async fn on_block_committed(
        &self,
        round: Round,
        src: BlockSourceInfo,
        root_hash: [u8; 32],
        file_hash: [u8; 32],
        data: Option<Bytes>,
        signatures: SignatureSet,
        approve_signatures: SignatureSet,
        stats: BlockCommitStats,
    );

    async fn on_block_skipped(&self, round: Round);

    async fn get_approved_candidate(
        &self,
        src: BlockSourceInfo,
        root_hash: [u8; 32],
        file_hash: [u8; 32],
        collated_data_hash: [u8; 32],
    ) -> Result<BlockCandidate, SessionError>;
}

/// The external BFT session engine the Validator Group drives. Its
/// algorithm is out of scope; this is the lifecycle boundary spec.md §4.9
/// names ("Start / restart").
#[async_trait]
pub trait ValidatorSession: Send + Sync + 'static {
    /// Begins catchain participation. Prior to this call, callback
    /// invocations the engine may replay from recovery are the caller's
    /// responsibility to queue as "postponed accepts".
    fn start(&self, prev_block_ids: Vec<BlockIdExt>, min_masterchain_ref_seqno: u32);

    /// Requests catchain teardown. The engine may defer the actual
    /// teardown to let late signatures from peers still land.
    fn destroy(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_equality_distinguishes_reject_reasons() {
        assert_ne!(Decision::Reject { reason: "a".into() }, Decision::Reject { reason: "b".into() });
        assert_eq!(Decision::Approve, Decision::Approve);
    }
}
