//! Boots a [`ValidatorManager`] over the in-memory storage backend and a
//! configured collator list, following teacher's `cli/src/node::Node`
//! construction shape (`Node::new` wiring network/storage/rpc collaborators
//! before `try_init`/`run`). The consensus session, the real collator wire
//! transport and the account-state model are out of scope here (spec.md §1)
//! so this module wires deliberately inert stand-ins for them and focuses on
//! what the core itself owns: the masterchain tip, the block-handle cache,
//! and the active Validator Groups.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use shardval_block_util::{
    Block, BlockHeader, BlockId, BlockIdExt, ExternalMessage, MessageQueue, ShardFsmState, ShardIdent, ShardState,
};
use shardval_network::{CollateRequest, CollateResponse, Ping, Pong, QueryClient, QueryError, RequestBlockCallback};
use shardval_session::BlockCandidate;
use shardval_storage::{InMemoryStorage, Storage};
use shardval_validator::{
    ApplyBlockOrchestrator, BlockBodyCodec, BlockDataSource, BlockWaiters, CandidatesBuffer, CollationManager,
    ConfigViewFactory, ExtMessageError, ExternalMessagePool, IhrMessagePool, ShardTopBlockBuffer, Stats,
    ValidateBlockCandidate, ValidatorGroupInfo, ValidatorManager, ValidatorManagerOptions,
};
use tracing::info;

use crate::config::NodeConfig;

/// Always reports its peer unreachable: the collator-node RLDP transport is
/// out of scope (spec.md §1), so a dev node has nothing to dial. Any shard
/// whose collators list names a remote peer simply never completes a
/// collation; `self_collate` shards are unaffected since they never reach
/// this client.
struct UnreachableCollatorClient;

#[async_trait]
impl QueryClient for UnreachableCollatorClient {
    async fn collate_block(&self, peer: [u8; 32], _request: CollateRequest) -> Result<CollateResponse, QueryError> {
        Err(QueryError::Unreachable(peer))
    }

    async fn request_block_callback(&self, peer: [u8; 32], _request: RequestBlockCallback) -> Result<Bytes, QueryError> {
        Err(QueryError::Unreachable(peer))
    }

    async fn ping(&self, peer: [u8; 32], _ping: Ping) -> Result<Pong, QueryError> {
        Err(QueryError::Unreachable(peer))
    }
}

/// Candidate-body decoding is cell/BOC work, out of scope here (spec.md §1).
/// A dev node that never receives real candidates never needs this to
/// succeed; it exists only to satisfy the Validator Group's contract.
struct NoBodyCodec;

impl BlockBodyCodec for NoBodyCodec {
    fn decode(&self, id: BlockIdExt, _data: &Bytes) -> Result<BlockHeader, String> {
        Err(format!("{id}: no block body codec configured for this dev node"))
    }
}

/// Accepts every candidate without running the state-transition checks the
/// real node would (spec.md §1's Non-goals exclude the account/execution
/// model this would need).
struct AcceptAllCandidates;

#[async_trait]
impl ValidateBlockCandidate for AcceptAllCandidates {
    async fn validate(&self, _shard: ShardIdent, _prev: &[BlockIdExt], _candidate: &BlockCandidate) -> Result<(), String> {
        Ok(())
    }
}

/// Never resolves a block download: this dev node has no peers to fetch
/// from. Apply-Block falls back to whatever data was supplied inline.
struct NoDownloadSource;

#[async_trait]
impl BlockDataSource for NoDownloadSource {
    async fn download(&self, id: BlockIdExt) -> Result<Block, shardval_validator::CoreError> {
        Err(shardval_validator::CoreError::not_ready(id))
    }
}

/// Treats the raw bytes of a submitted external message as its own body,
/// hashing them for identity and routing every message to the masterchain
/// (workchain 0 is out of scope without an account model to resolve a real
/// destination prefix against, spec.md §1).
struct RawBytesExternalMessageCheck;

impl shardval_validator::CheckExternalMessage for RawBytesExternalMessageCheck {
    fn check(&self, data: &[u8]) -> Result<ExternalMessage, ExtMessageError> {
        if data.is_empty() {
            return Err(ExtMessageError::Malformed("empty external message body".to_owned()));
        }
        let mut hasher = Sha256::new();
        hasher.update(data);
        let hash: [u8; 32] = hasher.finalize().into();
        let mut addr = [0u8; 32];
        addr.copy_from_slice(&hash);
        Ok(ExternalMessage::new(Bytes::copy_from_slice(data), hash, 0, addr, ShardIdent::new_full(0)))
    }

    fn peek_address(&self, data: &[u8]) -> Option<(i32, [u8; 32])> {
        if data.is_empty() {
            return None;
        }
        let mut hasher = Sha256::new();
        hasher.update(data);
        let hash: [u8; 32] = hasher.finalize().into();
        Some((0, hash))
    }
}

/// A [`shardval_block_util::MasterchainConfigView`] fixed at startup from
/// the node config: every configured collator shard is "active", guarded by
/// a single-validator set containing only this node's own id. Real topology
/// derivation needs the account/config-cell model this workspace puts out
/// of scope (spec.md §1); a dev node instead runs every configured shard
/// under a static, never-rotating committee of one.
struct StaticConfigView {
    local_id: [u8; 32],
    shards: Vec<ShardIdent>,
    config_hash: u32,
}

impl shardval_block_util::MasterchainShardView for StaticConfigView {
    fn shard_top(&self, _shard: ShardIdent) -> Option<(u32, ShardFsmState)> {
        Some((0, ShardFsmState::None))
    }

    fn validator_set_catchain_seqno(&self, _shard: ShardIdent) -> Option<u32> {
        Some(0)
    }
}

impl shardval_block_util::MasterchainConfigView for StaticConfigView {
    fn active_shards(&self) -> Vec<ShardIdent> {
        self.shards.clone()
    }

    fn get_validator_set(&self, _shard: ShardIdent) -> shardval_block_util::ValidatorSet {
        shardval_block_util::ValidatorSet::new(
            0,
            vec![shardval_block_util::ValidatorDescr { pubkey: self.local_id, adnl_id: None, weight: 1 }],
        )
    }

    fn get_next_validator_set(&self, _shard: ShardIdent) -> Option<shardval_block_util::ValidatorSet> {
        None
    }

    fn last_key_block_seqno(&self, _shard: ShardIdent) -> u32 {
        0
    }

    fn config_hash(&self) -> u32 {
        self.config_hash
    }
}

/// A running node: the [`ValidatorManager`] plus the handful of settings the
/// run loop (in `main.rs`) needs directly.
pub struct Node {
    pub manager: Arc<ValidatorManager>,
    pub stats_interval: Duration,
}

impl Node {
    /// Wires every collaborator `ValidatorManager::new` needs, following the
    /// shape of teacher's `Node::new` (network, storage, then the
    /// higher-level service built on top) without the real transport, since
    /// that sits below the query envelope this workspace models (spec.md
    /// §1).
    pub fn bootstrap(config: NodeConfig) -> anyhow::Result<Self> {
        let storage: Arc<dyn Storage> = Arc::new(InMemoryStorage::new());
        let stats = Arc::new(Stats::new());

        let collators_list = config.collators_list().context("invalid collators list")?;
        let shards: Vec<ShardIdent> = collators_list.iter().map(|entry| entry.shard).collect();

        let collation_manager = Arc::new(CollationManager::new(
            Arc::new(UnreachableCollatorClient),
            stats.clone(),
            collators_list.clone(),
            config.collator_ban_duration(),
            config.collator_ping_cooldown(),
        ));

        let waiters = Arc::new(BlockWaiters::new());
        let candidates = Arc::new(CandidatesBuffer::new(config.candidate_ttl()));
        let apply_block = Arc::new(ApplyBlockOrchestrator::new(
            storage.clone(),
            waiters.clone(),
            Arc::new(NoDownloadSource),
            candidates.clone(),
        ));
        let ext_messages = Arc::new(ExternalMessagePool::new(
            Arc::new(RawBytesExternalMessageCheck),
            config.max_mempool_num,
            stats.clone(),
        ));
        let ihr_messages = Arc::new(IhrMessagePool::default());
        let shard_top_blocks = Arc::new(ShardTopBlockBuffer::default());

        let options = ValidatorManagerOptions {
            sync_upto: config.sync_upto,
            state_ttl: config.state_ttl(),
            block_ttl: config.block_ttl(),
            archive_ttl: config.archive_ttl(),
            key_proof_ttl: config.key_proof_ttl(),
            max_mempool_num: config.max_mempool_num,
            collator_ban_duration: config.collator_ban_duration(),
            collator_ping_cooldown: config.collator_ping_cooldown(),
            candidate_ttl: config.candidate_ttl(),
            apply_block_priority: config.apply_block_priority,
            handle_lru_max_size: config.handle_lru_max_size,
            group_anticipation: config.group_anticipation(),
            group_destroy_grace: config.group_destroy_grace(),
            opts_hash: config.opts_hash,
            collators_list,
            ..ValidatorManagerOptions::default()
        };

        let local_id = config.local_id;
        let config_hash = options.opts_hash;
        let config_view_factory: ConfigViewFactory = Arc::new(move |_state| {
            Arc::new(StaticConfigView { local_id, shards: shards.clone(), config_hash })
        });

        let manager = Arc::new(ValidatorManager::new(
            local_id,
            storage,
            options,
            waiters,
            candidates,
            apply_block,
            collation_manager,
            ext_messages,
            ihr_messages,
            shard_top_blocks,
            stats,
            Arc::new(NoBodyCodec),
            Arc::new(AcceptAllCandidates),
            Arc::new(|shard, _prev| Err(shardval_validator::CoreError::not_ready(format!("local collation for {shard:?}")))),
            config_view_factory,
            Some(Arc::new(|id: BlockIdExt| info!(%id, "new masterchain block"))),
            Some(Arc::new(|id: BlockIdExt| info!(%id, "new key block"))),
        ));

        Ok(Self { manager, stats_interval: config.stats_interval() })
    }

    /// Applies the masterchain zerostate (seqno 0) so the manager has a tip
    /// to derive shard topology from. A real node gets this from the global
    /// config's zerostate file id (teacher's `ZerostateId`); a dev node
    /// synthesizes one deterministically from the local id instead.
    pub async fn apply_zerostate(&self) -> anyhow::Result<BlockIdExt> {
        let mut hasher = Sha256::new();
        hasher.update(b"shardval-dev-zerostate");
        hasher.update(self.manager.local_id());
        let root_hash: [u8; 32] = hasher.finalize().into();
        let id = BlockIdExt {
            id: BlockId { shard: ShardIdent::new_full(-1), seqno: 0 },
            root_hash,
            file_hash: root_hash,
        };
        let state = ShardState::new(id, root_hash, false, MessageQueue::default());
        let handle = self.manager.storage().get_or_create_block_handle(id);
        self.manager.new_block(handle, state).await.context("applying masterchain zerostate")?;
        Ok(id)
    }

    /// One line of diagnostics per configured interval, the dev-node analog
    /// of teacher's periodic storage/network metrics log lines.
    pub fn log_status(&self) {
        let tip = self.manager.master_tip_id();
        info!(
            ?tip,
            active_groups = self.manager.active_group_count(),
            next_groups = self.manager.next_group_count(),
            "status"
        );
        for (name, value) in self.manager.stats().snapshot() {
            tracing::debug!(counter = name, value, "stat");
        }
    }

    pub fn group_info(&self, shard: ShardIdent) -> Option<ValidatorGroupInfo> {
        self.manager.group_info(shard)
    }
}
