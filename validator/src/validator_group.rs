//! The per-session consensus adapter of spec.md §4.9, grounded on
//! `original_source/validator/validator-group.hpp/.cpp`.
//!
//! One instance per `(shard, session_id)`. Adapts the consensus session's
//! round-keyed callbacks to this crate's collaborators: generation goes
//! through the Collation Manager, acceptance through Apply-Block. Candidate
//! *bodies* are opaque byte strings to this module (spec.md §1 puts cell/BOC
//! parsing out of scope); a caller-supplied [`BlockBodyCodec`] is the only
//! place that reaches into them, matching the boundary spec.md §6's
//! "Block/proof bit layout" section describes.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use shardval_block_util::{Block, BlockHeader, BlockId, BlockIdExt, ShardIdent, SignatureSet, ValidatorSet};
use shardval_session::{
    BlockCandidate, BlockCommitStats, BlockSourceInfo, Decision, Round, SessionError, ValidatorSessionCallback,
};
use shardval_storage::Storage;
use tokio::sync::{Mutex as AsyncMutex, OnceCell};
use tracing::{info, warn};

use crate::apply_block::ApplyBlockOrchestrator;
use crate::candidates_buffer::CandidatesBuffer;
use crate::collation_manager::CollationManager;
use crate::error::{CoreError, CoreResult};
use crate::stats::Stats;

/// Default grace period `destroy` waits before tearing the session down, so
/// late signatures from catchain peers still land (spec.md §4.9).
pub const DEFAULT_DESTROY_GRACE: Duration = Duration::from_secs(10);

/// Extracts header fields from a raw candidate body. Spec.md §6's
/// "Block/proof bit layout" describes exactly this boundary: the core
/// requires only that a body admit extraction of prev refs, split/merge
/// flags, the state-update hashes, and the rest of [`BlockHeader`] — cell/BOC
/// parsing itself is someone else's job.
pub trait BlockBodyCodec: Send + Sync + 'static {
    fn decode(&self, id: BlockIdExt, data: &Bytes) -> Result<BlockHeader, String>;
}

/// The candidate-semantics collaborator `validate_block_candidate` invokes
/// (spec.md §4.9): whatever state-transition/contract checks a full node
/// would run, which are out of scope for this workspace (spec.md §1).
#[async_trait]
pub trait ValidateBlockCandidate: Send + Sync + 'static {
    async fn validate(&self, shard: ShardIdent, prev: &[BlockIdExt], candidate: &BlockCandidate) -> Result<(), String>;
}

/// `(source, id, data-hash, collated-hash)`, the approve-memo key
/// (`ValidatorGroup::CacheKey` / `block_to_cache_key`).
type ApproveCacheKey = ([u8; 32], BlockIdExt, [u8; 32], [u8; 32]);

/// A queued `on_block_committed` received before `start` was called, replayed
/// in order once the group starts (spec.md §4.9).
struct PostponedAccept {
    round: Round,
    src: BlockSourceInfo,
    root_hash: [u8; 32],
    file_hash: [u8; 32],
    data: Option<Bytes>,
    signatures: SignatureSet,
    approve_signatures: SignatureSet,
    stats: BlockCommitStats,
}

struct Inner {
    prev_block_ids: Vec<BlockIdExt>,
    min_masterchain_block_id: Option<BlockIdExt>,
    started: bool,
    destroying: bool,
    last_known_round_id: Round,
    postponed_accept: VecDeque<PostponedAccept>,
    approved_candidates_cache: HashMap<ApproveCacheKey, u32>,
    // (source, id, collated hash), mirroring the original's comment verbatim.
    available_block_candidates: HashSet<([u8; 32], BlockIdExt, [u8; 32])>,
}

/// Fields worth surfacing to a litequery-style introspection call
/// (SPEC_FULL.md §2), built from [`ValidatorGroup::group_info`].
#[derive(Debug, Clone)]
pub struct ValidatorGroupInfo {
    pub shard: ShardIdent,
    pub session_id: [u8; 32],
    pub current_round: Round,
    pub prev_block_ids: Vec<BlockIdExt>,
    /// `(id, source pubkey, collated hash)` for every candidate this group
    /// currently has on hand, regardless of whether it has been committed.
    pub known_candidates: Vec<(BlockIdExt, [u8; 32], [u8; 32])>,
}

/// `(shard, catchain_seqno, config_hash, vertical_seqno,
/// last_key_block_seqno, members)` folded into one opaque fingerprint
/// (spec.md §4.9's `session_id`), with `unsafe_catchain_rotate`'s four bytes
/// mixed in verbatim when set — SPEC_FULL.md §3's decision for that Open
/// Question, so a node running with the override computes a different id
/// than one without it rather than silently rejoining the same session.
pub fn session_id_fingerprint(
    shard: ShardIdent,
    catchain_seqno: u32,
    config_hash: u32,
    vertical_seqno: u32,
    last_key_block_seqno: u32,
    validator_set: &ValidatorSet,
    unsafe_catchain_rotate: Option<[u8; 4]>,
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(shard.workchain().to_le_bytes());
    hasher.update(shard.prefix().to_le_bytes());
    hasher.update([shard.depth()]);
    hasher.update(catchain_seqno.to_le_bytes());
    hasher.update(config_hash.to_le_bytes());
    hasher.update(vertical_seqno.to_le_bytes());
    hasher.update(last_key_block_seqno.to_le_bytes());
    for v in validator_set.validators() {
        hasher.update(v.pubkey);
        hasher.update(v.weight.to_le_bytes());
    }
    if let Some(rotate) = unsafe_catchain_rotate {
        hasher.update(rotate);
    }
    hasher.finalize().into()
}

fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

/// Adapts one consensus session's callbacks to block generation/validation/
/// acceptance (spec.md §4.9).
pub struct ValidatorGroup {
    shard: ShardIdent,
    local_id: [u8; 32],
    session_id: [u8; 32],
    validator_set: ValidatorSet,
    last_key_block_seqno: u32,
    collation_manager: Arc<CollationManager>,
    candidates: Arc<CandidatesBuffer>,
    apply_block: Arc<ApplyBlockOrchestrator>,
    storage: Arc<dyn Storage>,
    codec: Arc<dyn BlockBodyCodec>,
    validator: Arc<dyn ValidateBlockCandidate>,
    local_collate: Arc<dyn Fn(ShardIdent, Vec<BlockIdExt>) -> CoreResult<BlockCandidate> + Send + Sync>,
    stats: Arc<Stats>,
    destroy_grace: Duration,
    /// Per-round generation cache: `on_generate_slot` shares one in-flight
    /// collation across every consumer queued for the same round
    /// (`CachedCollatedBlock`).
    generation: AsyncMutex<HashMap<Round, Arc<OnceCell<BlockCandidate>>>>,
    inner: Mutex<Inner>,
}

impl ValidatorGroup {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        shard: ShardIdent,
        local_id: [u8; 32],
        session_id: [u8; 32],
        validator_set: ValidatorSet,
        last_key_block_seqno: u32,
        collation_manager: Arc<CollationManager>,
        candidates: Arc<CandidatesBuffer>,
        apply_block: Arc<ApplyBlockOrchestrator>,
        storage: Arc<dyn Storage>,
        codec: Arc<dyn BlockBodyCodec>,
        validator: Arc<dyn ValidateBlockCandidate>,
        local_collate: Arc<dyn Fn(ShardIdent, Vec<BlockIdExt>) -> CoreResult<BlockCandidate> + Send + Sync>,
        stats: Arc<Stats>,
        destroy_grace: Duration,
    ) -> Self {
        Self {
            shard,
            local_id,
            session_id,
            validator_set,
            last_key_block_seqno,
            collation_manager,
            candidates,
            apply_block,
            storage,
            codec,
            validator,
            local_collate,
            stats,
            destroy_grace,
            generation: AsyncMutex::new(HashMap::new()),
            inner: Mutex::new(Inner {
                prev_block_ids: Vec::new(),
                min_masterchain_block_id: None,
                started: false,
                destroying: false,
                last_known_round_id: 0,
                postponed_accept: VecDeque::new(),
                approved_candidates_cache: HashMap::new(),
                available_block_candidates: HashSet::new(),
            }),
        }
    }

    pub fn shard(&self) -> ShardIdent {
        self.shard
    }

    pub fn session_id(&self) -> [u8; 32] {
        self.session_id
    }

    pub fn last_key_block_seqno(&self) -> u32 {
        self.last_key_block_seqno
    }

    /// Registers the session (init) and begins catchain participation,
    /// replaying any `on_block_committed` calls that arrived from recovery
    /// before `start` was reached (spec.md §4.9).
    pub async fn start(&self, prev_block_ids: Vec<BlockIdExt>, min_masterchain_block_id: BlockIdExt) {
        let postponed = {
            let mut inner = self.inner.lock();
            inner.prev_block_ids = prev_block_ids;
            inner.min_masterchain_block_id = Some(min_masterchain_block_id);
            inner.started = true;
            inner.postponed_accept.drain(..).collect::<Vec<_>>()
        };
        self.collation_manager.validator_group_started(self.shard);
        info!(target: "shardval", shard = ?self.shard, session_id = ?self.session_id, "validator group started");

        for accept in postponed {
            if let Err(err) = self
                .accept_block_candidate(
                    accept.src,
                    accept.data,
                    accept.root_hash,
                    accept.file_hash,
                    accept.signatures,
                    accept.approve_signatures,
                    accept.stats,
                )
                .await
            {
                warn!(target: "shardval", shard = ?self.shard, %err, "replaying a postponed accept failed");
            }
        }
    }

    /// Requests teardown; the actual catchain stop is deferred by
    /// `destroy_grace` so late signatures from peers still land.
    pub fn destroy(self: &Arc<Self>) {
        let already = {
            let mut inner = self.inner.lock();
            std::mem::replace(&mut inner.destroying, true)
        };
        if already {
            return;
        }
        let this = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(this.destroy_grace).await;
            this.collation_manager.validator_group_finished(this.shard);
            info!(target: "shardval", shard = ?this.shard, "validator group torn down");
        });
    }

    /// `get_validator_group_info_for_litequery` (SPEC_FULL.md §2).
    pub fn group_info(&self) -> ValidatorGroupInfo {
        let inner = self.inner.lock();
        ValidatorGroupInfo {
            shard: self.shard,
            session_id: self.session_id,
            current_round: inner.last_known_round_id,
            prev_block_ids: inner.prev_block_ids.clone(),
            known_candidates: inner
                .available_block_candidates
                .iter()
                .map(|(src, id, hash)| (*id, *src, *hash))
                .collect(),
        }
    }

    fn create_next_block_id(&self, root_hash: [u8; 32], file_hash: [u8; 32]) -> BlockIdExt {
        let seqno = self.inner.lock().prev_block_ids.iter().map(|p| p.seqno()).max().unwrap_or(0) + 1;
        BlockIdExt { id: BlockId { shard: self.shard, seqno }, root_hash, file_hash }
    }

    fn decode_and_cache(&self, id: BlockIdExt, data: Bytes, source: [u8; 32], collated_hash: [u8; 32]) -> CoreResult<()> {
        let header = self.codec.decode(id, &data).map_err(CoreError::proto_violation)?;
        let block = Block::new(id, data, header);
        self.candidates.add_new_candidate(id, source, collated_hash);
        self.candidates.set_block_data(id, block);
        Ok(())
    }

    async fn accept_block_candidate(
        &self,
        src: BlockSourceInfo,
        data: Option<Bytes>,
        root_hash: [u8; 32],
        file_hash: [u8; 32],
        signatures: SignatureSet,
        approve_signatures: SignatureSet,
        stats: BlockCommitStats,
    ) -> CoreResult<()> {
        let id = self.create_next_block_id(root_hash, file_hash);
        if let Some(bytes) = data {
            self.decode_and_cache(id, bytes, src.pubkey, [0; 32])?;
        }
        // The session already carried out BFT signature verification before
        // calling back here; this module's job is to persist the result, not
        // re-check it. `approve_signatures` (collator-side approvals, as
        // opposed to the commit signatures) has no separate storage slot in
        // this crate's simplified storage contract — see DESIGN.md.
        let handle = self.storage.get_or_create_block_handle(id);
        self.storage.store_block_signatures(&handle, signatures).await?;
        let _ = approve_signatures;

        let masterchain_ref = if self.shard.is_masterchain() { Some(id) } else { None };
        let deadline = Instant::now() + Duration::from_secs(30);
        let result = self.apply_block.apply_block(id, None, masterchain_ref, deadline, 0).await;
        self.stats.record_apply_block(result.is_ok());
        result?;

        {
            let mut inner = self.inner.lock();
            inner.prev_block_ids = vec![id];
            inner.last_known_round_id += 1;
        }
        self.generation.lock().await.clear();

        info!(
            target: "shardval",
            %id,
            source = ?src.pubkey,
            collation_ms = stats.collation_time_ms,
            validation_ms = stats.validation_time_ms,
            "block committed and applied",
        );
        Ok(())
    }
}

#[async_trait]
impl ValidatorSessionCallback for ValidatorGroup {
    /// `generate_block_candidate`: serves from the in-round cache, else
    /// collates via the Collation Manager. Concurrent callers for the same
    /// round share one [`OnceCell`] so only one collation is ever in flight.
    async fn on_generate_slot(&self, round: Round) -> Result<BlockCandidate, SessionError> {
        let cell = {
            let mut gens = self.generation.lock().await;
            gens.entry(round).or_insert_with(|| Arc::new(OnceCell::new())).clone()
        };

        let (shard, prev, validator_set) = {
            let inner = self.inner.lock();
            (self.shard, inner.prev_block_ids.clone(), self.validator_set.clone())
        };
        let local_collate = self.local_collate.clone();
        let collation_manager = self.collation_manager.clone();

        let result = cell
            .get_or_try_init(|| async move {
                let deadline = Instant::now() + Duration::from_secs(10);
                collation_manager.collate_block(shard, prev, &validator_set, deadline, move |s, p| local_collate(s, p)).await
            })
            .await;

        match result {
            Ok(candidate) => {
                if let Err(err) = self.decode_and_cache(candidate.id, candidate.data.clone(), self.local_id, sha256(&candidate.collated_data)) {
                    warn!(target: "shardval", %err, "failed to cache a freshly generated candidate");
                }
                Ok(candidate.clone())
            }
            Err(err) => Err(SessionError::ProtoViolation(err.to_string())),
        }
    }

    /// `validate_block_candidate`: rejects stale rounds, serves memoised
    /// approvals, else decodes and runs the semantic check collaborator.
    async fn on_candidate(
        &self,
        round: Round,
        src: BlockSourceInfo,
        root_hash: [u8; 32],
        data: Bytes,
        collated_data_hash: [u8; 32],
    ) -> Result<Decision, SessionError> {
        let known_round = self.inner.lock().last_known_round_id;
        if known_round > 0 && round + 1 < known_round {
            return Ok(Decision::Reject { reason: format!("stale round {round}, already at {known_round}") });
        }

        let file_hash = sha256(&data);
        let id = self.create_next_block_id(root_hash, file_hash);
        let key: ApproveCacheKey = (src.pubkey, id, file_hash, collated_data_hash);
        if self.inner.lock().approved_candidates_cache.contains_key(&key) {
            return Ok(Decision::Approve);
        }

        let header = match self.codec.decode(id, &data) {
            Ok(h) => h,
            Err(reason) => return Ok(Decision::Reject { reason }),
        };

        let prev = self.inner.lock().prev_block_ids.clone();
        let candidate = BlockCandidate { id, data: data.clone(), collated_data: Bytes::new() };
        if let Err(reason) = self.validator.validate(self.shard, &prev, &candidate).await {
            return Ok(Decision::Reject { reason });
        }

        let block = Block::new(id, data, header);
        self.candidates.add_new_candidate(id, src.pubkey, collated_data_hash);
        self.candidates.set_block_data(id, block);

        let now = shardval_util::time::now_sec();
        let mut inner = self.inner.lock();
        inner.available_block_candidates.insert((src.pubkey, id, collated_data_hash));
        inner.approved_candidates_cache.insert(key, now);
        Ok(Decision::Approve)
    }

    /// `accept_block_candidate`: queues as a postponed accept before `start`,
    /// otherwise persists signatures and drives Apply-Block immediately.
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
    ) {
        let queue = {
            let mut inner = self.inner.lock();
            if !inner.started {
                inner.postponed_accept.push_back(PostponedAccept {
                    round,
                    src,
                    root_hash,
                    file_hash,
                    data,
                    signatures,
                    approve_signatures,
                    stats,
                });
                true
            } else {
                false
            }
        };
        if queue {
            return;
        }
        if let Err(err) =
            self.accept_block_candidate(src, data_or_none_marker(&data), root_hash, file_hash, signatures, approve_signatures, stats).await
        {
            warn!(target: "shardval", shard = ?self.shard, %err, "accept_block_candidate failed");
        }
    }

    async fn on_block_skipped(&self, round: Round) {
        let mut inner = self.inner.lock();
        if round >= inner.last_known_round_id {
            inner.last_known_round_id = round + 1;
        }
    }

    async fn get_approved_candidate(
        &self,
        src: BlockSourceInfo,
        root_hash: [u8; 32],
        file_hash: [u8; 32],
        collated_data_hash: [u8; 32],
    ) -> Result<BlockCandidate, SessionError> {
        let id = self.create_next_block_id(root_hash, file_hash);
        match self.candidates.source_and_collated_hash(&id) {
            Some((source, hash)) if source == src.pubkey && hash == collated_data_hash => {}
            _ => return Err(SessionError::NotReady),
        }
        let block = self.candidates.get_block_data(id).await.map_err(|_| SessionError::NotReady)?;
        Ok(BlockCandidate { id, data: block.data().clone(), collated_data: Bytes::new() })
    }
}

// `on_block_committed` is given `&Option<Bytes>` conceptually but the trait
// signature consumes it by value; this just documents that a postponed
// accept's recorded `data` is forwarded unchanged into the immediate path.
fn data_or_none_marker(data: &Option<Bytes>) -> Option<Bytes> {
    data.clone()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use shardval_block_util::{MessageQueue, ShardState, StateUpdate, ValidatorDescr};
    use shardval_network::{CollateRequest, CollateResponse, Ping, Pong, QueryError, RequestBlockCallback};
    use shardval_storage::InMemoryStorage;

    use super::*;
    use crate::wait_for::{BlockDataSource, BlockWaiters};

    struct NoSource;
    #[async_trait]
    impl BlockDataSource for NoSource {
        async fn download(&self, id: BlockIdExt) -> CoreResult<Block> {
            Err(CoreError::not_ready(id))
        }
    }

    struct NoCollator;
    #[async_trait]
    impl shardval_network::QueryClient for NoCollator {
        async fn collate_block(&self, _peer: [u8; 32], _request: CollateRequest) -> Result<CollateResponse, QueryError> {
            Err(QueryError::Unreachable([0; 32]))
        }
        async fn request_block_callback(&self, _peer: [u8; 32], _request: RequestBlockCallback) -> Result<Bytes, QueryError> {
            Err(QueryError::Unreachable([0; 32]))
        }
        async fn ping(&self, _peer: [u8; 32], ping: Ping) -> Result<Pong, QueryError> {
            Ok(Pong { version: 1, flags: ping.flags })
        }
    }

    struct TrivialCodec;
    impl BlockBodyCodec for TrivialCodec {
        fn decode(&self, id: BlockIdExt, data: &Bytes) -> Result<BlockHeader, String> {
            if data.is_empty() {
                return Err("empty candidate body".into());
            }
            Ok(BlockHeader {
                prev: vec![],
                master_ref: None,
                before_split: false,
                after_split: false,
                after_merge: false,
                want_split: false,
                want_merge: false,
                is_key_block: false,
                gen_utime: 1,
                end_lt: id.seqno() as u64,
                state_update: StateUpdate { old_hash: [0; 32], new_hash: sha256(data) },
                catchain_seqno: 0,
                validator_set_hash: 0,
                prev_key_mc_seqno: 0,
            })
        }
    }

    struct AcceptAll;
    #[async_trait]
    impl ValidateBlockCandidate for AcceptAll {
        async fn validate(&self, _shard: ShardIdent, _prev: &[BlockIdExt], _candidate: &BlockCandidate) -> Result<(), String> {
            Ok(())
        }
    }

    struct RejectAll;
    #[async_trait]
    impl ValidateBlockCandidate for RejectAll {
        async fn validate(&self, _shard: ShardIdent, _prev: &[BlockIdExt], _candidate: &BlockCandidate) -> Result<(), String> {
            Err("rejected for test".into())
        }
    }

    fn validator_set() -> ValidatorSet {
        ValidatorSet::new(1, vec![ValidatorDescr { pubkey: [1; 32], adnl_id: None, weight: 1 }])
    }

    fn group(
        shard: ShardIdent,
        validator: Arc<dyn ValidateBlockCandidate>,
        local_collate_calls: Arc<AtomicU32>,
    ) -> (Arc<ValidatorGroup>, Arc<InMemoryStorage>) {
        let storage = Arc::new(InMemoryStorage::new());
        let waiters = Arc::new(BlockWaiters::new());
        let candidates = Arc::new(CandidatesBuffer::new(Duration::from_secs(60)));
        let apply_block = Arc::new(ApplyBlockOrchestrator::new(
            storage.clone(),
            waiters,
            Arc::new(NoSource) as Arc<dyn BlockDataSource>,
            candidates.clone(),
        ));
        let collation_manager = Arc::new(CollationManager::new(
            Arc::new(NoCollator),
            Arc::new(Stats::default()),
            vec![],
            Duration::from_secs(300),
            Duration::from_secs(10),
        ));
        let local_collate = {
            let calls = local_collate_calls.clone();
            Arc::new(move |shard: ShardIdent, prev: Vec<BlockIdExt>| -> CoreResult<BlockCandidate> {
                calls.fetch_add(1, Ordering::SeqCst);
                let seqno = prev.iter().map(|p| p.seqno()).max().unwrap_or(0) + 1;
                let id = BlockIdExt { id: BlockId { shard, seqno }, root_hash: [seqno as u8; 32], file_hash: [seqno as u8; 32] };
                Ok(BlockCandidate { id, data: Bytes::from_static(b"block-body"), collated_data: Bytes::new() })
            })
        };
        let group = Arc::new(ValidatorGroup::new(
            shard,
            [9; 32],
            [7; 32],
            validator_set(),
            0,
            collation_manager,
            candidates,
            apply_block,
            storage.clone() as Arc<dyn Storage>,
            Arc::new(TrivialCodec),
            validator,
            local_collate,
            Arc::new(Stats::default()),
            Duration::from_millis(5),
        ));
        (group, storage)
    }

    #[tokio::test]
    async fn concurrent_generate_calls_for_the_same_round_collate_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let (group, _storage) = group(ShardIdent::new_full(0), Arc::new(AcceptAll), calls.clone());
        let a = group.on_generate_slot(1);
        let b = group.on_generate_slot(1);
        let (ra, rb) = tokio::join!(a, b);
        assert_eq!(ra.unwrap().id, rb.unwrap().id);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn validate_rejects_a_candidate_the_checker_refuses() {
        let calls = Arc::new(AtomicU32::new(0));
        let (group, _storage) = group(ShardIdent::new_full(0), Arc::new(RejectAll), calls);
        let src = BlockSourceInfo { pubkey: [2; 32], adnl_id: None };
        let decision = group.on_candidate(1, src, [5; 32], Bytes::from_static(b"body"), [6; 32]).await.unwrap();
        assert_eq!(decision, Decision::Reject { reason: "rejected for test".into() });
    }

    #[tokio::test]
    async fn validate_approves_and_memoises_a_repeated_call() {
        let calls = Arc::new(AtomicU32::new(0));
        let (group, _storage) = group(ShardIdent::new_full(0), Arc::new(AcceptAll), calls);
        let src = BlockSourceInfo { pubkey: [2; 32], adnl_id: None };
        let first = group.on_candidate(1, src, [5; 32], Bytes::from_static(b"body"), [6; 32]).await.unwrap();
        let second = group.on_candidate(1, src, [5; 32], Bytes::from_static(b"body"), [6; 32]).await.unwrap();
        assert_eq!(first, Decision::Approve);
        assert_eq!(second, Decision::Approve);
    }

    #[tokio::test]
    async fn accepts_queued_before_start_are_replayed_in_order_once_started() {
        let shard = ShardIdent::new_full(0);
        let calls = Arc::new(AtomicU32::new(0));
        let (group, storage) = group(shard, Arc::new(AcceptAll), calls);

        let zero = BlockIdExt { id: BlockId { shard, seqno: 0 }, root_hash: [0; 32], file_hash: [0; 32] };
        let zero_handle = storage.get_or_create_block_handle(zero);
        storage.store_block_state(&zero_handle, ShardState::new(zero, [0; 32], false, MessageQueue::default())).await.unwrap();
        zero_handle.set_applied();
        zero_handle.set_processed();
        storage.store_block_handle(&zero_handle).await.unwrap();

        let src = BlockSourceInfo { pubkey: [3; 32], adnl_id: None };
        group
            .on_block_committed(
                1,
                src,
                [1; 32],
                [1; 32],
                Some(Bytes::from_static(b"candidate-body")),
                SignatureSet::default(),
                SignatureSet::default(),
                BlockCommitStats::default(),
            )
            .await;
        assert!(group.inner.lock().started == false);

        group.start(vec![zero], zero).await;
        assert!(group.inner.lock().started);
        assert_eq!(group.inner.lock().prev_block_ids.len(), 1);
        assert_ne!(group.inner.lock().prev_block_ids[0], zero);
    }

    #[test]
    fn unsafe_catchain_rotate_changes_the_fingerprint() {
        let shard = ShardIdent::new_full(0);
        let set = validator_set();
        let without = session_id_fingerprint(shard, 1, 0, 0, 0, &set, None);
        let with = session_id_fingerprint(shard, 1, 0, 0, 0, &set, Some([1, 2, 3, 4]));
        assert_ne!(without, with);
    }
}
