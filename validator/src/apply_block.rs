//! The apply-block state machine of spec.md §4.3, grounded on
//! `original_source/validator/apply-block.cpp`.
//!
//! Drives a handle from "we were told about this id" through
//! data -> proof/proof-link -> predecessor application -> state, to
//! `applied`. Proof/proof-link *verification* is Check-Proof's job
//! (§4.4); this orchestrator only waits for an already-validated proof to
//! land in storage and checks the handle fields it implies are present.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use shardval_block_util::{Block, BlockHandle, BlockIdExt};
use shardval_storage::Storage;
use tokio::sync::Mutex as AsyncMutex;

use crate::candidates_buffer::CandidatesBuffer;
use crate::check_proof::populate_handle;
use crate::error::{CoreError, CoreResult};
use crate::wait_for::{BlockDataSource, BlockWaiters};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Serialises concurrent `apply_block` calls for the same id onto one
/// another, so the persist step (`store_block_state` + `set_applied`) runs
/// at most once per id even if callers fail to coalesce upstream (spec.md
/// §4.3's idempotence property, belt-and-suspenders against the Manager's
/// own per-id dispatch).
pub struct ApplyBlockOrchestrator {
    storage: Arc<dyn Storage>,
    waiters: Arc<BlockWaiters>,
    source: Arc<dyn BlockDataSource>,
    candidates: Arc<CandidatesBuffer>,
    locks: DashMap<BlockIdExt, Arc<AsyncMutex<()>>, ahash::RandomState>,
}

impl ApplyBlockOrchestrator {
    pub fn new(
        storage: Arc<dyn Storage>,
        waiters: Arc<BlockWaiters>,
        source: Arc<dyn BlockDataSource>,
        candidates: Arc<CandidatesBuffer>,
    ) -> Self {
        Self { storage, waiters, source, candidates, locks: DashMap::default() }
    }

    /// Boxed so predecessor recursion can cross `.await` points without an
    /// infinitely-sized future.
    pub fn apply_block<'a>(
        &'a self,
        id: BlockIdExt,
        data: Option<Block>,
        masterchain_ref_id: Option<BlockIdExt>,
        deadline: Instant,
        priority: u32,
    ) -> BoxFuture<'a, CoreResult<()>> {
        Box::pin(self.apply_block_locked(id, data, masterchain_ref_id, deadline, priority))
    }

    async fn apply_block_locked(
        &self,
        id: BlockIdExt,
        data: Option<Block>,
        masterchain_ref_id: Option<BlockIdExt>,
        deadline: Instant,
        priority: u32,
    ) -> CoreResult<()> {
        let lock = self.locks.entry(id).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone();
        let _guard = lock.lock().await;
        let result = self.apply_block_inner(id, data, masterchain_ref_id, deadline, priority).await;
        self.locks.remove(&id);
        result
    }

    async fn apply_block_inner(
        &self,
        id: BlockIdExt,
        data: Option<Block>,
        masterchain_ref_id: Option<BlockIdExt>,
        deadline: Instant,
        priority: u32,
    ) -> CoreResult<()> {
        let handle = self.storage.get_or_create_block_handle(id);

        if handle.is_applied() {
            if !id.is_masterchain() || handle.processed() {
                return Ok(());
            }
            handle.set_processed();
            return self.flush(&handle).await;
        }

        if handle.is_archived() {
            return Ok(());
        }

        if id.is_zero() {
            if id.is_masterchain() {
                handle.set_applied();
                handle.set_processed();
            } else {
                if let Some(r) = masterchain_ref_id {
                    handle.set_masterchain_ref_block(r.seqno())?;
                }
                handle.set_applied();
            }
            return self.flush(&handle).await;
        }

        let block = match data {
            Some(block) => {
                if !handle.received() {
                    self.storage.store_block_data(&handle, block.clone()).await?;
                }
                block
            }
            None => match self.storage.get_block_data(&id).await {
                Ok(existing) => existing,
                Err(_) => {
                    self.waiters
                        .wait_block_data(
                            id,
                            deadline,
                            priority,
                            self.storage.clone(),
                            self.candidates.clone(),
                            self.source.clone(),
                        )
                        .await?
                }
            },
        };

        if id.is_masterchain() {
            if !handle.inited_proof() {
                let proof = self.waiters.wait_proof(id, deadline, priority, self.storage.clone()).await?;
                populate_handle(&handle, &proof.header)?;
                self.storage.store_block_proof(&handle, proof).await?;
            }
        } else if !handle.inited_proof_link() {
            let link = self.waiters.wait_proof_link(id, deadline, priority, self.storage.clone()).await?;
            populate_handle(&handle, &link.header)?;
            self.storage.store_block_proof_link(&handle, link).await?;
        }

        if !handle.inited_split_after()
            || !handle.inited_merge_before()
            || !handle.inited_prev()
            || !handle.inited_state_root_hash()
            || !handle.inited_logical_time()
            || (id.seqno() > 0 && !handle.inited_unix_time())
        {
            return Err(CoreError::ContractViolation(format!(
                "{id}: handle missing a required field after proof population"
            )));
        }

        let prev_state = self.waiters.wait_prev_state(&handle, deadline, priority, self.storage.clone()).await?;
        let new_state = prev_state.apply_block(&block).map_err(|e| CoreError::ProtoViolation(e.to_string()))?;

        for prev in handle.prev()? {
            let prev_handle = self.storage.get_or_create_block_handle(prev);
            prev_handle.set_next(id)?;
            self.apply_block(prev, None, masterchain_ref_id, deadline, priority).await?;
        }

        self.storage.store_block_state(&handle, new_state).await?;

        if id.is_masterchain() {
            handle.set_applied();
            handle.set_processed();
        } else {
            handle.set_masterchain_ref_block(masterchain_ref_id.map(|r| r.seqno()).unwrap_or(0))?;
            handle.set_applied();
        }

        self.flush(&handle).await
    }

    async fn flush(&self, handle: &Arc<BlockHandle>) -> CoreResult<()> {
        if handle.need_flush() {
            self.storage.store_block_handle(handle).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;
    use shardval_block_util::{BlockHeader, BlockId, MessageQueue, ShardIdent, ShardState, StateUpdate};
    use shardval_storage::InMemoryStorage;

    use super::*;

    fn id(seqno: u32) -> BlockIdExt {
        BlockIdExt {
            id: BlockId { shard: ShardIdent::new_full(0), seqno },
            root_hash: [seqno as u8; 32],
            file_hash: [seqno as u8; 32],
        }
    }

    fn header(prev: Vec<BlockIdExt>, old_hash: [u8; 32], new_hash: [u8; 32]) -> BlockHeader {
        BlockHeader {
            prev,
            master_ref: None,
            before_split: false,
            after_split: false,
            after_merge: false,
            want_split: false,
            want_merge: false,
            is_key_block: false,
            gen_utime: 1,
            end_lt: 1,
            state_update: StateUpdate { old_hash, new_hash },
            catchain_seqno: 0,
            validator_set_hash: 0,
            prev_key_mc_seqno: 0,
        }
    }

    struct NoSource;
    #[async_trait]
    impl BlockDataSource for NoSource {
        async fn download(&self, id: BlockIdExt) -> CoreResult<Block> {
            Err(CoreError::not_ready(id))
        }
    }

    fn orchestrator() -> (ApplyBlockOrchestrator, Arc<InMemoryStorage>) {
        let storage = Arc::new(InMemoryStorage::new());
        let waiters = Arc::new(BlockWaiters::new());
        let source = Arc::new(NoSource);
        let candidates = Arc::new(CandidatesBuffer::new(Duration::from_secs(60)));
        (ApplyBlockOrchestrator::new(storage.clone(), waiters, source, candidates), storage)
    }

    #[tokio::test]
    async fn zerostate_is_applied_directly() {
        let (orch, storage) = orchestrator();
        let zero = id(0);
        orch.apply_block(zero, None, None, Instant::now() + Duration::from_secs(1), 0).await.unwrap();
        assert!(storage.get_or_create_block_handle(zero).is_applied());
    }

    #[tokio::test]
    async fn applying_a_block_recursively_applies_its_parent_and_persists_state() {
        let (orch, storage) = orchestrator();
        let zero = id(0);
        let parent_state = ShardState::new(zero, [0; 32], false, MessageQueue::default());
        let zero_handle = storage.get_or_create_block_handle(zero);
        storage.store_block_state(&zero_handle, parent_state).await.unwrap();
        zero_handle.set_applied();
        zero_handle.set_processed();
        storage.store_block_handle(&zero_handle).await.unwrap();

        let block1 = id(1);
        let h = header(vec![zero], [0; 32], [9; 32]);
        let block = Block::new(block1, bytes::Bytes::from_static(b"x"), h.clone());

        let proof_handle = storage.get_or_create_block_handle(block1);
        populate_handle(&proof_handle, &h).unwrap();
        storage
            .store_block_proof_link(&proof_handle, shardval_block_util::ProofLink { id: block1, header: h })
            .await
            .unwrap();

        orch.apply_block(block1, Some(block), None, Instant::now() + Duration::from_secs(2), 0).await.unwrap();

        let handle = storage.get_or_create_block_handle(block1);
        assert!(handle.is_applied());
        let state = storage.get_block_state(&block1).await.unwrap();
        assert_eq!(state.root_hash(), [9; 32]);
    }

    #[tokio::test]
    async fn second_concurrent_apply_on_an_already_applied_block_is_a_no_op() {
        let (orch, storage) = orchestrator();
        let zero = id(0);
        orch.apply_block(zero, None, None, Instant::now() + Duration::from_secs(1), 0).await.unwrap();
        orch.apply_block(zero, None, None, Instant::now() + Duration::from_secs(1), 0).await.unwrap();
        assert!(storage.get_or_create_block_handle(zero).is_applied());
    }
}
