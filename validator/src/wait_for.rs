//! The deduplicating wait-for registry of spec.md §4.2, grounded on
//! `original_source/validator/downloaders/wait-block-data.cpp` and
//! `wait-block-state-merge.cpp`.
//!
//! One in-flight worker per key; any number of callers can `wait_for` the
//! same key and all observe the same result. A late caller with a longer
//! deadline or higher priority extends the worker's effective deadline/
//! priority rather than starting a second worker.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use shardval_block_util::{Block, BlockHandle, BlockIdExt, Proof, ProofLink, ShardState, SignatureSet};
use shardval_storage::Storage;
use tokio::sync::broadcast;

use crate::candidates_buffer::CandidatesBuffer;
use crate::error::{not_ready_for, CoreError, CoreResult};

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// An external source of block bytes for ids not yet in the local store or
/// candidate cache (spec.md §4.2 step (d), "network download"). The wire
/// transport itself is out of scope (spec.md §1); this is the boundary the
/// wait-for registry calls through.
#[async_trait::async_trait]
pub trait BlockDataSource: Send + Sync + 'static {
    async fn download(&self, id: BlockIdExt) -> CoreResult<Block>;

    /// Static-file cache lookup by file-hash, meaningful only for hardfork
    /// or other non-master blocks whose bytes are pinned by configuration.
    async fn static_file(&self, _id: BlockIdExt) -> Option<Block> {
        None
    }
}

struct Entry<V> {
    tx: broadcast::Sender<Result<V, Arc<CoreError>>>,
    deadline: std::sync::Mutex<Instant>,
    priority: AtomicU32,
}

fn extend<V>(entry: &Entry<V>, deadline: Instant, priority: u32) {
    let mut d = entry.deadline.lock().unwrap();
    if deadline > *d {
        *d = deadline;
    }
    entry.priority.fetch_max(priority, Ordering::AcqRel);
}

fn clone_core_error(err: &CoreError) -> CoreError {
    match err {
        CoreError::NotReady(m) => CoreError::NotReady(m.clone()),
        CoreError::Timeout(m) => CoreError::Timeout(m.clone()),
        CoreError::ProtoViolation(m) => CoreError::ProtoViolation(m.clone()),
        CoreError::Cancelled(m) => CoreError::Cancelled(m.clone()),
        CoreError::ContractViolation(m) => CoreError::ContractViolation(m.clone()),
        CoreError::DbError(e) => CoreError::Internal(anyhow::anyhow!(e.to_string())),
        CoreError::Internal(e) => CoreError::Internal(anyhow::anyhow!(e.to_string())),
    }
}

/// Deduplicates concurrent waits for a single key type `K` producing a
/// cloneable value `V`. Always used behind an `Arc` so the background
/// worker can outlive the `wait_for` call that spawned it.
pub struct WaitForRegistry<K, V> {
    entries: DashMap<K, Arc<Entry<V>>, ahash::RandomState>,
}

impl<K, V> Default for WaitForRegistry<K, V>
where
    K: std::hash::Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> WaitForRegistry<K, V>
where
    K: std::hash::Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self { entries: DashMap::default() }
    }

    /// Attaches to the worker for `key`, spawning one if none is in flight.
    /// `fetch` is retried by the worker on retryable errors until the
    /// combined (max over all waiters) deadline elapses.
    pub async fn wait_for<F>(self: &Arc<Self>, key: K, deadline: Instant, priority: u32, fetch: F) -> CoreResult<V>
    where
        F: Fn() -> BoxFuture<'static, CoreResult<V>> + Send + Sync + 'static,
    {
        // `DashMap::entry` holds the shard lock for the match arm, so a
        // concurrent first caller can never spawn two workers for the same
        // key.
        let mut rx = match self.entries.entry(key.clone()) {
            dashmap::mapref::entry::Entry::Occupied(occupied) => {
                extend(occupied.get(), deadline, priority);
                occupied.get().tx.subscribe()
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let (tx, rx) = broadcast::channel(1);
                let entry = Arc::new(Entry {
                    tx,
                    deadline: std::sync::Mutex::new(deadline),
                    priority: AtomicU32::new(priority),
                });
                vacant.insert(entry.clone());
                spawn_worker(self.clone(), key.clone(), entry, fetch);
                rx
            }
        };

        match rx.recv().await {
            Ok(result) => result.map_err(|e| clone_core_error(&e)),
            Err(_) => Err(CoreError::Cancelled("wait-for worker dropped without a result".into())),
        }
    }
}

fn spawn_worker<K, V, F>(registry: Arc<WaitForRegistry<K, V>>, key: K, entry: Arc<Entry<V>>, fetch: F)
where
    K: std::hash::Hash + Eq + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    F: Fn() -> BoxFuture<'static, CoreResult<V>> + Send + Sync + 'static,
{
    tokio::spawn(async move {
        const RETRY_BACKOFF: Duration = Duration::from_millis(200);
        loop {
            let deadline = *entry.deadline.lock().unwrap();
            let now = Instant::now();
            if now >= deadline {
                let _ = entry.tx.send(Err(Arc::new(CoreError::Timeout("deadline elapsed".into()))));
                break;
            }
            let remaining = deadline - now;
            match tokio::time::timeout(remaining, fetch()).await {
                Ok(Ok(value)) => {
                    let _ = entry.tx.send(Ok(value));
                    break;
                }
                Ok(Err(err)) if err.is_retryable() => {
                    tokio::time::sleep(RETRY_BACKOFF.min(remaining)).await;
                    continue;
                }
                Ok(Err(err)) => {
                    let _ = entry.tx.send(Err(Arc::new(err)));
                    break;
                }
                Err(_elapsed) => {
                    // Attempt's own timeout fired; re-read the (possibly
                    // extended) combined deadline and retry per spec.md
                    // §4.2's "worker is restarted at the remaining combined
                    // deadline and priority".
                    continue;
                }
            }
        }
        registry.entries.remove(&key);
    });
}

/// High-level wait-for operations over block data/state/proof keyed by
/// `BlockIdExt`, composing the primitive [`WaitForRegistry`] with storage and
/// the candidates buffer per spec.md §4.2's key algorithms.
pub struct BlockWaiters {
    data: Arc<WaitForRegistry<BlockIdExt, Block>>,
    proof: Arc<WaitForRegistry<BlockIdExt, Proof>>,
    proof_link: Arc<WaitForRegistry<BlockIdExt, ProofLink>>,
    signatures: Arc<WaitForRegistry<BlockIdExt, SignatureSet>>,
    state: Arc<WaitForRegistry<BlockIdExt, ShardState>>,
    merge: Arc<WaitForRegistry<(BlockIdExt, BlockIdExt), ShardState>>,
}

impl Default for BlockWaiters {
    fn default() -> Self {
        Self::new()
    }
}

impl BlockWaiters {
    pub fn new() -> Self {
        Self {
            data: Arc::new(WaitForRegistry::new()),
            proof: Arc::new(WaitForRegistry::new()),
            proof_link: Arc::new(WaitForRegistry::new()),
            signatures: Arc::new(WaitForRegistry::new()),
            state: Arc::new(WaitForRegistry::new()),
            merge: Arc::new(WaitForRegistry::new()),
        }
    }

    /// Tries, in order: the local store, the static-file cache, the
    /// candidates buffer, then network download. A non-master block
    /// arriving without a proof-link has one derived from its body and
    /// validated-and-stored before `received` surfaces to the caller.
    pub async fn wait_block_data(
        &self,
        id: BlockIdExt,
        deadline: Instant,
        priority: u32,
        storage: Arc<dyn Storage>,
        candidates: Arc<CandidatesBuffer>,
        source: Arc<dyn BlockDataSource>,
    ) -> CoreResult<Block> {
        self.data
            .wait_for(id, deadline, priority, move || {
                let storage = storage.clone();
                let candidates = candidates.clone();
                let source = source.clone();
                Box::pin(async move {
                    if let Ok(block) = storage.get_block_data(&id).await {
                        return Ok(block);
                    }
                    if let Some(block) = source.static_file(id).await {
                        return Ok(block);
                    }
                    if let Ok(block) = candidates.get_block_data(id).await {
                        return Ok(block);
                    }
                    let block = source.download(id).await?;
                    if !id.is_masterchain() {
                        ensure_proof_link(&storage, &block).await?;
                    }
                    let handle = storage.get_or_create_block_handle(id);
                    storage.store_block_data(&handle, block.clone()).await.map_err(CoreError::from)?;
                    Ok(block)
                }) as BoxFuture<'static, CoreResult<Block>>
            })
            .await
    }

    pub async fn wait_block_state(
        &self,
        id: BlockIdExt,
        deadline: Instant,
        priority: u32,
        storage: Arc<dyn Storage>,
    ) -> CoreResult<ShardState> {
        self.state
            .wait_for(id, deadline, priority, move || {
                let storage = storage.clone();
                Box::pin(async move { storage.get_block_state(&id).await.map_err(|e| not_ready_for(id, e)) })
            })
            .await
    }

    pub async fn wait_proof(
        &self,
        id: BlockIdExt,
        deadline: Instant,
        priority: u32,
        storage: Arc<dyn Storage>,
    ) -> CoreResult<Proof> {
        self.proof
            .wait_for(id, deadline, priority, move || {
                let storage = storage.clone();
                Box::pin(async move { storage.get_block_proof(&id).await.map_err(|e| not_ready_for(id, e)) })
            })
            .await
    }

    pub async fn wait_proof_link(
        &self,
        id: BlockIdExt,
        deadline: Instant,
        priority: u32,
        storage: Arc<dyn Storage>,
    ) -> CoreResult<ProofLink> {
        self.proof_link
            .wait_for(id, deadline, priority, move || {
                let storage = storage.clone();
                Box::pin(async move { storage.get_block_proof_link(&id).await.map_err(|e| not_ready_for(id, e)) })
            })
            .await
    }

    pub async fn wait_signatures(
        &self,
        id: BlockIdExt,
        deadline: Instant,
        priority: u32,
        storage: Arc<dyn Storage>,
    ) -> CoreResult<SignatureSet> {
        self.signatures
            .wait_for(id, deadline, priority, move || {
                let storage = storage.clone();
                Box::pin(async move { storage.get_block_signatures(&id).await.map_err(|e| not_ready_for(id, e)) })
            })
            .await
    }

    /// `state-merge`: launches two sub-waits on the child state ids, then
    /// returns `left.merge_with(right)` or the first error.
    pub async fn wait_state_merge(
        &self,
        left: BlockIdExt,
        right: BlockIdExt,
        deadline: Instant,
        priority: u32,
        storage: Arc<dyn Storage>,
    ) -> CoreResult<ShardState> {
        self.merge
            .wait_for((left, right), deadline, priority, move || {
                let storage = storage.clone();
                Box::pin(async move {
                    let left_state = storage.get_block_state(&left).await.map_err(|e| not_ready_for(left, e))?;
                    let right_state = storage.get_block_state(&right).await.map_err(|e| not_ready_for(right, e))?;
                    left_state
                        .merge_with(&right_state)
                        .map_err(|e| CoreError::ProtoViolation(e.to_string()))
                }) as BoxFuture<'static, CoreResult<ShardState>>
            })
            .await
    }

    /// `prev-state`: given a handle whose `prev` is one or two parent
    /// blocks, waits for the parent state(s); if the parent shard is a
    /// strict ancestor of the handle's shard, splits the parent state and
    /// returns the correct half; if two parents, merges them.
    pub async fn wait_prev_state(
        &self,
        handle: &BlockHandle,
        deadline: Instant,
        priority: u32,
        storage: Arc<dyn Storage>,
    ) -> CoreResult<ShardState> {
        let prev = handle.prev()?;
        match prev.as_slice() {
            [] => Err(CoreError::ContractViolation("wait_prev_state called on a zerostate handle".into())),
            [single] => {
                let parent_shard = single.shard();
                let own_shard = handle.id().shard();
                let parent_state = self.wait_block_state(*single, deadline, priority, storage).await?;
                if parent_shard == own_shard {
                    return Ok(parent_state);
                }
                if parent_shard.contains_shard(&own_shard) {
                    let (left, right) = parent_state.split().map_err(|e| CoreError::ProtoViolation(e.to_string()))?;
                    let want_left = own_shard == parent_shard.shard_child(true).unwrap();
                    return Ok(if want_left { left } else { right });
                }
                Err(CoreError::ProtoViolation(format!("prev block {single} does not cover {own_shard:?}")))
            }
            [left, right] => self.wait_state_merge(*left, *right, deadline, priority, storage).await,
            _ => Err(CoreError::ContractViolation("a block has at most two predecessors".into())),
        }
    }
}

/// Non-master block arrived without an accompanying proof-link: derive one
/// from the block body and ask the store to validate-and-store it (spec.md
/// §4.2).
async fn ensure_proof_link(storage: &Arc<dyn Storage>, block: &Block) -> CoreResult<()> {
    if storage.get_block_proof_link(block.id()).await.is_ok() {
        return Ok(());
    }
    let link = ProofLink::from_block(block);
    let handle = storage.get_or_create_block_handle(*block.id());
    storage.store_block_proof_link(&handle, link).await.map_err(CoreError::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32 as StdAtomicU32;

    use shardval_block_util::{BlockId, ShardIdent};

    use super::*;

    fn id(seqno: u32) -> BlockIdExt {
        BlockIdExt {
            id: BlockId { shard: ShardIdent::new_full(0), seqno },
            root_hash: [seqno as u8; 32],
            file_hash: [seqno as u8; 32],
        }
    }

    #[tokio::test]
    async fn concurrent_waits_on_the_same_key_share_one_fetch() {
        let registry: Arc<WaitForRegistry<BlockIdExt, u32>> = Arc::new(WaitForRegistry::new());
        let calls = Arc::new(StdAtomicU32::new(0));
        let key = id(1);
        let deadline = Instant::now() + Duration::from_secs(5);

        let mut handles = Vec::new();
        for _ in 0..5 {
            let registry = registry.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                registry
                    .wait_for(key, deadline, 0, move || {
                        let calls = calls.clone();
                        Box::pin(async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(42u32)
                        }) as BoxFuture<'static, CoreResult<u32>>
                    })
                    .await
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn a_later_waiter_extends_the_deadline_and_sees_the_retried_result() {
        let registry: Arc<WaitForRegistry<BlockIdExt, u32>> = Arc::new(WaitForRegistry::new());
        let key = id(1);
        let attempts = Arc::new(StdAtomicU32::new(0));

        let short_deadline = Instant::now() + Duration::from_millis(300);
        let registry2 = registry.clone();
        let attempts2 = attempts.clone();
        let first = tokio::spawn(async move {
            registry2
                .wait_for(key, short_deadline, 0, move || {
                    let attempts2 = attempts2.clone();
                    Box::pin(async move {
                        let n = attempts2.fetch_add(1, Ordering::SeqCst);
                        if n == 0 {
                            Err(CoreError::NotReady("not yet".into()))
                        } else {
                            Ok(7u32)
                        }
                    }) as BoxFuture<'static, CoreResult<u32>>
                })
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        let long_deadline = Instant::now() + Duration::from_secs(2);
        let fetch_unreachable = move || -> BoxFuture<'static, CoreResult<u32>> { unreachable!("worker already running") };
        let second = registry.wait_for(key, long_deadline, 0, fetch_unreachable).await;

        assert_eq!(first.await.unwrap().unwrap(), 7);
        assert_eq!(second.unwrap(), 7);
    }

    #[tokio::test]
    async fn entry_is_removed_after_completion_so_a_later_call_refetches() {
        let registry: Arc<WaitForRegistry<BlockIdExt, u32>> = Arc::new(WaitForRegistry::new());
        let key = id(1);
        let calls = Arc::new(StdAtomicU32::new(0));
        let deadline = Instant::now() + Duration::from_secs(1);

        let calls1 = calls.clone();
        registry
            .wait_for(key, deadline, 0, move || {
                let calls1 = calls1.clone();
                Box::pin(async move {
                    calls1.fetch_add(1, Ordering::SeqCst);
                    Ok(1u32)
                }) as BoxFuture<'static, CoreResult<u32>>
            })
            .await
            .unwrap();

        let calls2 = calls.clone();
        registry
            .wait_for(key, deadline, 0, move || {
                let calls2 = calls2.clone();
                Box::pin(async move {
                    calls2.fetch_add(1, Ordering::SeqCst);
                    Ok(2u32)
                }) as BoxFuture<'static, CoreResult<u32>>
            })
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
