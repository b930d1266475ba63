//! The typed configuration boundary of spec.md §6 ("CLI / configuration
//! boundary"): `ValidatorManagerOptions`. Loading it from disk is ambient
//! CLI concern (`shardval-cli`); this crate only consumes the typed record.

use std::sync::Arc;
use std::time::Duration;

use shardval_block_util::BlockIdExt;

/// A per-shard entry of the configured collators list (spec.md §4.6).
#[derive(Debug, Clone)]
pub struct CollatorsListEntry {
    pub shard: shardval_block_util::ShardIdent,
    pub select_mode: SelectMode,
    pub collators: Vec<[u8; 32]>,
    pub self_collate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    Random,
    Ordered,
    RoundRobin,
}

/// Opaque policy hooks the core consumes without interpreting (spec.md §9's
/// "Open questions"): vertical seqno and hardfork/unsafe-rotate predicates.
#[derive(Clone)]
pub struct ValidatorManagerOptions {
    pub sync_upto: u32,
    pub state_ttl: Duration,
    pub block_ttl: Duration,
    pub archive_ttl: Duration,
    pub key_proof_ttl: Duration,
    pub max_mempool_num: usize,
    pub collators_list: Vec<CollatorsListEntry>,
    pub collator_ban_duration: Duration,
    pub collator_ping_cooldown: Duration,
    pub candidate_ttl: Duration,
    pub apply_block_priority: u32,

    /// Bound on how many recently-touched block handles the validator
    /// manager keeps strongly pinned, independent of however long storage
    /// itself retains them (spec.md §4.10).
    pub handle_lru_max_size: usize,

    /// How far ahead of an anticipated split/merge the validator manager
    /// starts the successor Validator Group, so catchain is already warm
    /// when the masterchain actually commits the topology change
    /// (spec.md §4.10).
    pub group_anticipation: Duration,

    /// Grace period a torn-down Validator Group's catchain session is kept
    /// alive for, handed straight through to [`crate::validator_group`]'s
    /// `destroy_grace`.
    pub group_destroy_grace: Duration,

    /// Fingerprint of the subset of node configuration that participates in
    /// a Validator Group's session-id (collator config, build id, ...) but
    /// isn't itself part of the masterchain's validator set — supplied by
    /// the configuration loader, opaque to this crate (spec.md §9).
    pub opts_hash: u32,

    /// Opaque per spec.md §9: the core never interprets the hardfork
    /// predicate's reasoning, only whether a given block id is one.
    pub is_hardfork: Arc<dyn Fn(&BlockIdExt) -> bool + Send + Sync>,

    /// Opaque per spec.md §9: the vertical seqno policy is consumed as a
    /// plain function of a block seqno.
    pub get_vertical_seqno: Arc<dyn Fn(u32) -> u32 + Send + Sync>,

    /// Opaque per spec.md §9: when set, its four bytes are folded verbatim
    /// into a Validator Group's session-id fingerprint for unsafe-catchain-
    /// rotate recovery compatibility, never interpreted.
    pub unsafe_catchain_rotate: Option<[u8; 4]>,

    /// Predicate deciding whether the local node actively monitors (applies
    /// blocks for) a shard it is not currently validating.
    pub shard_monitoring: Arc<dyn Fn(shardval_block_util::ShardIdent) -> bool + Send + Sync>,
}

impl std::fmt::Debug for ValidatorManagerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidatorManagerOptions")
            .field("sync_upto", &self.sync_upto)
            .field("state_ttl", &self.state_ttl)
            .field("block_ttl", &self.block_ttl)
            .field("archive_ttl", &self.archive_ttl)
            .field("key_proof_ttl", &self.key_proof_ttl)
            .field("max_mempool_num", &self.max_mempool_num)
            .field("collators_list", &self.collators_list)
            .field("collator_ban_duration", &self.collator_ban_duration)
            .field("collator_ping_cooldown", &self.collator_ping_cooldown)
            .field("candidate_ttl", &self.candidate_ttl)
            .field("apply_block_priority", &self.apply_block_priority)
            .field("unsafe_catchain_rotate", &self.unsafe_catchain_rotate)
            .finish_non_exhaustive()
    }
}

impl Default for ValidatorManagerOptions {
    fn default() -> Self {
        Self {
            sync_upto: 0,
            state_ttl: Duration::from_secs(86400 * 2),
            block_ttl: Duration::from_secs(86400),
            archive_ttl: Duration::from_secs(86400 * 365),
            key_proof_ttl: Duration::from_secs(86400 * 365),
            max_mempool_num: 4096,
            collators_list: Vec::new(),
            collator_ban_duration: Duration::from_secs(300),
            collator_ping_cooldown: Duration::from_secs(10),
            candidate_ttl: Duration::from_secs(120),
            apply_block_priority: 253,
            handle_lru_max_size: 16,
            group_anticipation: Duration::from_secs(60),
            group_destroy_grace: crate::validator_group::DEFAULT_DESTROY_GRACE,
            opts_hash: 0,
            is_hardfork: Arc::new(|_| false),
            get_vertical_seqno: Arc::new(|_| 0),
            unsafe_catchain_rotate: None,
            shard_monitoring: Arc::new(|_| false),
        }
    }
}
