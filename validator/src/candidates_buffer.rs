//! The short-TTL candidates cache of spec.md §4.5, grounded on
//! `original_source/validator/impl/candidates-buffer.cpp`.
//!
//! During a consensus round many actors (other replicas validating the same
//! candidate, RPC queries, optimistic collation) ask for the same candidate
//! body and derived state; this dedupes the fetch and keeps the derived
//! state hot while the round is active.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use shardval_block_util::{Block, BlockIdExt, ShardState};
use shardval_storage::Storage;

use crate::error::{CoreError, CoreResult};
use crate::wait_for::WaitForRegistry;

const DEFAULT_TTL: Duration = Duration::from_secs(120);

struct CandidateEntry {
    source: [u8; 32],
    collated_hash: [u8; 32],
    expires_at: Instant,
    data: parking_lot::Mutex<Option<Block>>,
}

/// In-memory `BlockIdExt -> (source, collated_hash, ttl, data, derived
/// state)` map with a derived-state dedup layer.
pub struct CandidatesBuffer {
    entries: DashMap<BlockIdExt, Arc<CandidateEntry>, ahash::RandomState>,
    state_waiters: Arc<WaitForRegistry<BlockIdExt, ShardState>>,
    ttl: Duration,
}

impl Default for CandidatesBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl CandidatesBuffer {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::default(),
            state_waiters: Arc::new(WaitForRegistry::new()),
            ttl,
        }
    }

    /// Registers a newly announced candidate, starting its TTL clock.
    pub fn add_new_candidate(&self, id: BlockIdExt, source: [u8; 32], collated_hash: [u8; 32]) {
        self.entries.insert(
            id,
            Arc::new(CandidateEntry {
                source,
                collated_hash,
                expires_at: Instant::now() + self.ttl,
                data: parking_lot::Mutex::new(None),
            }),
        );
    }

    /// Attaches the candidate's body once received (e.g. off an inbound
    /// session broadcast), refreshing its TTL.
    pub fn set_block_data(&self, id: BlockIdExt, data: Block) {
        if let Some(entry) = self.entries.get(&id) {
            *entry.data.lock() = Some(data);
        } else {
            self.add_new_candidate(id, [0; 32], [0; 32]);
            if let Some(entry) = self.entries.get(&id) {
                *entry.data.lock() = Some(data);
            }
        }
    }

    pub fn source_and_collated_hash(&self, id: &BlockIdExt) -> Option<([u8; 32], [u8; 32])> {
        self.entries.get(id).map(|e| (e.source, e.collated_hash))
    }

    /// Cached value, or `NotReady` if the candidate hasn't arrived yet.
    pub async fn get_block_data(&self, id: BlockIdExt) -> CoreResult<Block> {
        let entry = self.entries.get(&id).ok_or_else(|| CoreError::not_ready(id))?;
        if entry.expires_at <= Instant::now() {
            drop(entry);
            self.entries.remove(&id);
            return Err(CoreError::timeout(id));
        }
        entry.data.lock().clone().ok_or_else(|| CoreError::not_ready(id))
    }

    /// Composes the candidate's post-state: fetches the parent state(s) from
    /// storage, splits/merges as needed to reach the candidate's shard, then
    /// applies the candidate block. Memoised per id so concurrent callers
    /// share one derivation.
    pub async fn get_block_state(&self, id: BlockIdExt, storage: Arc<dyn Storage>) -> CoreResult<ShardState> {
        let block = self.get_block_data(id).await?;
        let deadline = Instant::now() + Duration::from_secs(10);
        self.state_waiters
            .wait_for(id, deadline, 0, move || {
                let storage = storage.clone();
                let block = block.clone();
                Box::pin(async move { derive_candidate_state(&storage, &block).await })
                    as Pin<Box<dyn Future<Output = CoreResult<ShardState>> + Send>>
            })
            .await
    }

    /// Drops entries whose TTL has elapsed, releasing any pending waiters to
    /// a timeout error (spec.md §4.5: "default 60 s tick").
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| entry.expires_at > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

async fn derive_candidate_state(storage: &Arc<dyn Storage>, block: &Block) -> CoreResult<ShardState> {
    let header = block.header();
    let own_shard = block.id().shard();

    let base_state = match header.prev.as_slice() {
        [] => return Err(CoreError::ContractViolation("candidate block has no predecessors".into())),
        [single] => {
            let parent_state =
                storage.get_block_state(single).await.map_err(|e| crate::error::not_ready_for(*single, e))?;
            if parent_state.get_shard() == own_shard {
                parent_state
            } else if parent_state.get_shard().contains_shard(&own_shard) {
                let (left, right) = parent_state.split().map_err(|e| CoreError::ProtoViolation(e.to_string()))?;
                let want_left = own_shard == parent_state.get_shard().shard_child(true).unwrap();
                if want_left {
                    left
                } else {
                    right
                }
            } else {
                return Err(CoreError::ProtoViolation(format!("prev {single} does not cover candidate shard")));
            }
        }
        [left, right] => {
            let left_state =
                storage.get_block_state(left).await.map_err(|e| crate::error::not_ready_for(*left, e))?;
            let right_state =
                storage.get_block_state(right).await.map_err(|e| crate::error::not_ready_for(*right, e))?;
            left_state.merge_with(&right_state).map_err(|e| CoreError::ProtoViolation(e.to_string()))?
        }
        _ => return Err(CoreError::ContractViolation("a block has at most two predecessors".into())),
    };

    base_state.apply_block(block).map_err(|e| CoreError::ProtoViolation(e.to_string()))
}

#[cfg(test)]
mod tests {
    use shardval_block_util::{BlockHeader, BlockId, MessageQueue, ShardIdent, StateUpdate};
    use shardval_storage::InMemoryStorage;

    use super::*;

    fn id(seqno: u32) -> BlockIdExt {
        BlockIdExt {
            id: BlockId { shard: ShardIdent::new_full(0), seqno },
            root_hash: [seqno as u8; 32],
            file_hash: [seqno as u8; 32],
        }
    }

    #[tokio::test]
    async fn data_is_not_ready_until_the_candidate_body_arrives() {
        let buf = CandidatesBuffer::new(Duration::from_secs(60));
        buf.add_new_candidate(id(1), [1; 32], [2; 32]);
        assert!(buf.get_block_data(id(1)).await.is_err());

        let header = BlockHeader {
            prev: vec![id(0)],
            master_ref: None,
            before_split: false,
            after_split: false,
            after_merge: false,
            want_split: false,
            want_merge: false,
            is_key_block: false,
            gen_utime: 1,
            end_lt: 1,
            state_update: StateUpdate { old_hash: [0; 32], new_hash: [9; 32] },
            catchain_seqno: 0,
            validator_set_hash: 0,
            prev_key_mc_seqno: 0,
        };
        let block = Block::new(id(1), bytes::Bytes::from_static(b"x"), header);
        buf.set_block_data(id(1), block);
        assert!(buf.get_block_data(id(1)).await.is_ok());
    }

    #[tokio::test]
    async fn derived_state_applies_the_candidate_on_top_of_the_parent() {
        let storage = Arc::new(InMemoryStorage::new());
        let parent = ShardState::new(id(0), [0; 32], false, MessageQueue::default());
        let handle0 = storage.get_or_create_block_handle(id(0));
        storage.store_block_state(&handle0, parent).await.unwrap();

        let buf = CandidatesBuffer::new(Duration::from_secs(60));
        buf.add_new_candidate(id(1), [1; 32], [2; 32]);
        let header = BlockHeader {
            prev: vec![id(0)],
            master_ref: None,
            before_split: false,
            after_split: false,
            after_merge: false,
            want_split: false,
            want_merge: false,
            is_key_block: false,
            gen_utime: 1,
            end_lt: 1,
            state_update: StateUpdate { old_hash: [0; 32], new_hash: [9; 32] },
            catchain_seqno: 0,
            validator_set_hash: 0,
            prev_key_mc_seqno: 0,
        };
        let block = Block::new(id(1), bytes::Bytes::from_static(b"x"), header);
        buf.set_block_data(id(1), block);

        let derived = buf.get_block_state(id(1), storage.clone() as Arc<dyn Storage>).await.unwrap();
        assert_eq!(derived.root_hash(), [9; 32]);
    }

    #[test]
    fn sweep_expired_drops_stale_entries() {
        let buf = CandidatesBuffer::new(Duration::from_millis(0));
        buf.add_new_candidate(id(1), [1; 32], [2; 32]);
        std::thread::sleep(Duration::from_millis(5));
        buf.sweep_expired();
        assert!(buf.is_empty());
    }
}
