use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use shardval_block_util::{Block, BlockHandle, BlockIdExt, Proof, ProofLink, ShardIdent, ShardState, SignatureSet};

use crate::{BlockLookupKey, Storage, StorageError, StoredCandidate};

/// An in-memory `Storage`, backed by `dashmap` concurrent maps. Used by the
/// CLI's dev mode and by the validator core's own tests; not a durability
/// guarantee of any kind — everything here is lost on process exit.
#[derive(Default)]
pub struct InMemoryStorage {
    handles: DashMap<BlockIdExt, Arc<BlockHandle>>,
    data: DashMap<BlockIdExt, Block>,
    proofs: DashMap<BlockIdExt, Proof>,
    proof_links: DashMap<BlockIdExt, ProofLink>,
    signatures: DashMap<BlockIdExt, SignatureSet>,
    states: DashMap<BlockIdExt, ShardState>,
    candidates: DashMap<([u8; 32], BlockIdExt, [u8; 32]), StoredCandidate>,
    by_shard: DashMap<ShardIdent, RwLock<Vec<Arc<BlockHandle>>>>,
    init_mc_block: RwLock<Option<BlockIdExt>>,
    gc_mc_block: RwLock<Option<BlockIdExt>>,
    shard_client_state: RwLock<Option<BlockIdExt>>,
    destroyed_sessions: RwLock<Vec<[u8; 32]>>,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn index_handle(&self, handle: &Arc<BlockHandle>) {
        let shard = handle.id().shard();
        let mut bucket = self.by_shard.entry(shard).or_default().write();
        if !bucket.iter().any(|h| h.id() == handle.id()) {
            let seqno = handle.id().seqno();
            let pos = bucket.partition_point(|h| h.id().seqno() < seqno);
            bucket.insert(pos, handle.clone());
        }
    }
}

#[async_trait::async_trait]
impl Storage for InMemoryStorage {
    fn get_block_handle(&self, id: &BlockIdExt) -> Option<Arc<BlockHandle>> {
        self.handles.get(id).map(|h| h.clone())
    }

    fn get_or_create_block_handle(&self, id: BlockIdExt) -> Arc<BlockHandle> {
        let handle = self
            .handles
            .entry(id)
            .or_insert_with(|| Arc::new(BlockHandle::new(id)))
            .clone();
        self.index_handle(&handle);
        handle
    }

    async fn store_block_handle(&self, handle: &Arc<BlockHandle>) -> Result<(), StorageError> {
        let version = handle.version();
        self.handles.insert(handle.id(), handle.clone());
        self.index_handle(handle);
        handle.flushed_upto(version);
        Ok(())
    }

    async fn get_block_data(&self, id: &BlockIdExt) -> Result<Block, StorageError> {
        self.data.get(id).map(|b| b.clone()).ok_or(StorageError::DataNotFound(*id))
    }

    async fn store_block_data(&self, handle: &Arc<BlockHandle>, block: Block) -> Result<(), StorageError> {
        handle.set_received();
        self.data.insert(handle.id(), block);
        Ok(())
    }

    async fn get_block_proof(&self, id: &BlockIdExt) -> Result<Proof, StorageError> {
        self.proofs.get(id).map(|p| p.clone()).ok_or(StorageError::ProofNotFound(*id))
    }

    async fn store_block_proof(&self, handle: &Arc<BlockHandle>, proof: Proof) -> Result<(), StorageError> {
        handle.set_proof();
        self.proofs.insert(handle.id(), proof);
        Ok(())
    }

    async fn get_block_proof_link(&self, id: &BlockIdExt) -> Result<ProofLink, StorageError> {
        self.proof_links
            .get(id)
            .map(|p| p.clone())
            .ok_or(StorageError::ProofLinkNotFound(*id))
    }

    async fn store_block_proof_link(&self, handle: &Arc<BlockHandle>, link: ProofLink) -> Result<(), StorageError> {
        handle.set_proof_link();
        self.proof_links.insert(handle.id(), link);
        Ok(())
    }

    async fn get_block_signatures(&self, id: &BlockIdExt) -> Result<SignatureSet, StorageError> {
        self.signatures
            .get(id)
            .map(|s| s.clone())
            .ok_or(StorageError::SignaturesNotFound(*id))
    }

    async fn store_block_signatures(&self, handle: &Arc<BlockHandle>, sigs: SignatureSet) -> Result<(), StorageError> {
        handle.set_signatures();
        self.signatures.insert(handle.id(), sigs);
        Ok(())
    }

    async fn get_block_state(&self, id: &BlockIdExt) -> Result<ShardState, StorageError> {
        self.states.get(id).map(|s| s.clone()).ok_or(StorageError::StateNotFound(*id))
    }

    async fn store_block_state(
        &self,
        handle: &Arc<BlockHandle>,
        state: ShardState,
    ) -> Result<ShardState, StorageError> {
        handle.set_state_root_hash(state.root_hash())?;
        self.states.insert(handle.id(), state.clone());
        Ok(state)
    }

    async fn store_block_candidate(&self, candidate: StoredCandidate) -> Result<(), StorageError> {
        let key = (candidate.source, candidate.id, candidate.collated_hash);
        self.candidates.insert(key, candidate);
        Ok(())
    }

    async fn get_block_candidate(
        &self,
        source: [u8; 32],
        id: &BlockIdExt,
        collated_hash: [u8; 32],
    ) -> Result<StoredCandidate, StorageError> {
        self.candidates
            .get(&(source, *id, collated_hash))
            .map(|c| c.clone())
            .ok_or(StorageError::CandidateNotFound { source, id: *id })
    }

    async fn get_block_by(&self, shard: ShardIdent, key: BlockLookupKey) -> Result<Arc<BlockHandle>, StorageError> {
        let Some(bucket) = self.by_shard.get(&shard) else {
            return Err(StorageError::LookupNotFound(shard));
        };
        let bucket = bucket.read();
        let found = match key {
            BlockLookupKey::Seqno(seqno) => bucket.iter().find(|h| h.id().seqno() == seqno).cloned(),
            BlockLookupKey::LogicalTime(lt) => bucket
                .iter()
                .find(|h| h.logical_time().map(|have| have >= lt).unwrap_or(false))
                .cloned(),
            BlockLookupKey::UnixTime(ts) => bucket
                .iter()
                .find(|h| h.unix_time().map(|have| have >= ts).unwrap_or(false))
                .cloned(),
        };
        found.ok_or(StorageError::LookupNotFound(shard))
    }

    async fn update_init_masterchain_block(&self, id: BlockIdExt) -> Result<(), StorageError> {
        *self.init_mc_block.write() = Some(id);
        Ok(())
    }

    fn get_init_masterchain_block(&self) -> Option<BlockIdExt> {
        *self.init_mc_block.read()
    }

    async fn update_gc_masterchain_block(&self, id: BlockIdExt) -> Result<(), StorageError> {
        *self.gc_mc_block.write() = Some(id);
        Ok(())
    }

    fn get_gc_masterchain_block(&self) -> Option<BlockIdExt> {
        *self.gc_mc_block.read()
    }

    async fn update_shard_client_state(&self, id: BlockIdExt) -> Result<(), StorageError> {
        *self.shard_client_state.write() = Some(id);
        Ok(())
    }

    fn get_shard_client_state(&self) -> Option<BlockIdExt> {
        *self.shard_client_state.read()
    }

    async fn update_destroyed_validator_sessions(&self, ids: Vec<[u8; 32]>) -> Result<(), StorageError> {
        *self.destroyed_sessions.write() = ids;
        Ok(())
    }

    fn get_destroyed_validator_sessions(&self) -> Vec<[u8; 32]> {
        self.destroyed_sessions.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use shardval_block_util::{BlockHeader, BlockId, MessageQueue, StateUpdate};

    use super::*;

    fn shard_id(seqno: u32) -> BlockIdExt {
        BlockIdExt {
            id: BlockId { shard: ShardIdent::new_full(0), seqno },
            root_hash: [seqno as u8; 32],
            file_hash: [seqno as u8; 32],
        }
    }

    fn header() -> BlockHeader {
        BlockHeader {
            prev: Vec::new(),
            master_ref: None,
            before_split: false,
            after_split: false,
            after_merge: false,
            want_split: false,
            want_merge: false,
            is_key_block: false,
            gen_utime: 0,
            end_lt: 0,
            state_update: StateUpdate { old_hash: [0; 32], new_hash: [1; 32] },
            catchain_seqno: 0,
            validator_set_hash: 0,
            prev_key_mc_seqno: 0,
        }
    }

    #[tokio::test]
    async fn store_and_fetch_block_data_roundtrips() {
        let storage = InMemoryStorage::new();
        let id = shard_id(1);
        let handle = storage.get_or_create_block_handle(id);
        let block = Block::new(id, bytes::Bytes::from_static(b"payload"), header());
        storage.store_block_data(&handle, block).await.unwrap();
        let fetched = storage.get_block_data(&id).await.unwrap();
        assert_eq!(fetched.data().as_ref(), b"payload");
        assert!(handle.received());
    }

    #[tokio::test]
    async fn get_block_data_before_store_is_not_found() {
        let storage = InMemoryStorage::new();
        let id = shard_id(1);
        assert!(storage.get_block_data(&id).await.is_err());
    }

    #[tokio::test]
    async fn get_block_by_seqno_finds_indexed_handle() {
        let storage = InMemoryStorage::new();
        let shard = ShardIdent::new_full(0);
        storage.get_or_create_block_handle(shard_id(1));
        storage.get_or_create_block_handle(shard_id(5));
        let found = storage.get_block_by(shard, BlockLookupKey::Seqno(5)).await.unwrap();
        assert_eq!(found.id().seqno(), 5);
        assert!(storage.get_block_by(shard, BlockLookupKey::Seqno(9)).await.is_err());
    }

    #[tokio::test]
    async fn get_block_by_lt_finds_first_not_older_block() {
        let storage = InMemoryStorage::new();
        let shard = ShardIdent::new_full(0);
        let h1 = storage.get_or_create_block_handle(shard_id(1));
        h1.set_logical_time(100).unwrap();
        let h2 = storage.get_or_create_block_handle(shard_id(2));
        h2.set_logical_time(200).unwrap();

        let found = storage.get_block_by(shard, BlockLookupKey::LogicalTime(150)).await.unwrap();
        assert_eq!(found.id().seqno(), 2);
    }

    #[tokio::test]
    async fn init_and_gc_masterchain_pointers_are_independent() {
        let storage = InMemoryStorage::new();
        let a = shard_id(1);
        let b = shard_id(2);
        storage.update_init_masterchain_block(a).await.unwrap();
        storage.update_gc_masterchain_block(b).await.unwrap();
        assert_eq!(storage.get_init_masterchain_block(), Some(a));
        assert_eq!(storage.get_gc_masterchain_block(), Some(b));
    }

    #[tokio::test]
    async fn destroyed_validator_sessions_round_trips() {
        let storage = InMemoryStorage::new();
        storage.update_destroyed_validator_sessions(vec![[1; 32], [2; 32]]).await.unwrap();
        assert_eq!(storage.get_destroyed_validator_sessions(), vec![[1; 32], [2; 32]]);
    }
}
