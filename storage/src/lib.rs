//! The storage contract of spec.md §6: the set of operations the validator
//! core requires from a persistent block/state store, plus an in-memory
//! reference implementation for tests and the CLI's dev mode.
//!
//! Persistent BOC/cell encoding, merkle proof construction and cell GC are
//! out of scope here (spec.md §1) — this crate models the boundary the core
//! calls through, not the on-disk format.

mod mem;

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use shardval_block_util::{
    Block, BlockHandle, BlockIdExt, Proof, ProofLink, ShardIdent, ShardState, SignatureSet,
};
use thiserror::Error;

pub use mem::InMemoryStorage;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("block handle not found for {0}")]
    HandleNotFound(BlockIdExt),
    #[error("block data not found for {0}")]
    DataNotFound(BlockIdExt),
    #[error("block proof not found for {0}")]
    ProofNotFound(BlockIdExt),
    #[error("block proof link not found for {0}")]
    ProofLinkNotFound(BlockIdExt),
    #[error("block signatures not found for {0}")]
    SignaturesNotFound(BlockIdExt),
    #[error("block state not found for {0}")]
    StateNotFound(BlockIdExt),
    #[error("block candidate not found for {source:?}/{id}")]
    CandidateNotFound { source: [u8; 32], id: BlockIdExt },
    #[error("no block found for shard {0:?} at the requested key")]
    LookupNotFound(ShardIdent),
    #[error("handle contract violation: {0}")]
    ContractViolation(#[from] shardval_block_util::HandleError),
    #[error("backing store error: {0}")]
    Db(String),
}

/// A stored block candidate, keyed by `(source, id, collated_hash)` per
/// spec.md §6 (`store_block_candidate`/`get_block_candidate`).
#[derive(Debug, Clone)]
pub struct StoredCandidate {
    pub source: [u8; 32],
    pub id: BlockIdExt,
    pub collated_hash: [u8; 32],
    pub data: Bytes,
    pub collated_data: Bytes,
}

/// Lookup key for `get_block_by_{lt,unix_time,seqno}`.
#[derive(Debug, Clone, Copy)]
pub enum BlockLookupKey {
    LogicalTime(u64),
    UnixTime(u32),
    Seqno(u32),
}

/// The persistent store the validator core depends on (spec.md §6).
///
/// Every method that can legitimately be absent (not-yet-written data) is
/// fallible rather than `Option`-returning, matching the `not-ready` error
/// kind the core composes into its own error model (spec.md §7) — callers
/// turn `StorageError` into `CoreError::NotReady` or `CoreError::DbError`
/// depending on which this is.
#[async_trait]
pub trait Storage: Send + Sync + 'static {
    fn get_block_handle(&self, id: &BlockIdExt) -> Option<Arc<BlockHandle>>;

    /// Returns the cached handle, or creates and registers an empty one.
    fn get_or_create_block_handle(&self, id: BlockIdExt) -> Arc<BlockHandle>;

    async fn store_block_handle(&self, handle: &Arc<BlockHandle>) -> Result<(), StorageError>;

    async fn get_block_data(&self, id: &BlockIdExt) -> Result<Block, StorageError>;
    async fn store_block_data(&self, handle: &Arc<BlockHandle>, block: Block) -> Result<(), StorageError>;

    async fn get_block_proof(&self, id: &BlockIdExt) -> Result<Proof, StorageError>;
    async fn store_block_proof(&self, handle: &Arc<BlockHandle>, proof: Proof) -> Result<(), StorageError>;

    async fn get_block_proof_link(&self, id: &BlockIdExt) -> Result<ProofLink, StorageError>;
    async fn store_block_proof_link(&self, handle: &Arc<BlockHandle>, link: ProofLink) -> Result<(), StorageError>;

    async fn get_block_signatures(&self, id: &BlockIdExt) -> Result<SignatureSet, StorageError>;
    async fn store_block_signatures(&self, handle: &Arc<BlockHandle>, sigs: SignatureSet) -> Result<(), StorageError>;

    async fn get_block_state(&self, id: &BlockIdExt) -> Result<ShardState, StorageError>;

    /// Persists `state` as the post-state of `handle`'s block, returning the
    /// canonicalised value the store actually retains (spec.md §6).
    async fn store_block_state(
        &self,
        handle: &Arc<BlockHandle>,
        state: ShardState,
    ) -> Result<ShardState, StorageError>;

    async fn store_block_candidate(&self, candidate: StoredCandidate) -> Result<(), StorageError>;
    async fn get_block_candidate(
        &self,
        source: [u8; 32],
        id: &BlockIdExt,
        collated_hash: [u8; 32],
    ) -> Result<StoredCandidate, StorageError>;

    async fn get_block_by(&self, shard: ShardIdent, key: BlockLookupKey) -> Result<Arc<BlockHandle>, StorageError>;

    async fn update_init_masterchain_block(&self, id: BlockIdExt) -> Result<(), StorageError>;
    fn get_init_masterchain_block(&self) -> Option<BlockIdExt>;

    async fn update_gc_masterchain_block(&self, id: BlockIdExt) -> Result<(), StorageError>;
    fn get_gc_masterchain_block(&self) -> Option<BlockIdExt>;

    async fn update_shard_client_state(&self, id: BlockIdExt) -> Result<(), StorageError>;
    fn get_shard_client_state(&self) -> Option<BlockIdExt>;

    async fn update_destroyed_validator_sessions(&self, ids: Vec<[u8; 32]>) -> Result<(), StorageError>;
    fn get_destroyed_validator_sessions(&self) -> Vec<[u8; 32]>;
}
