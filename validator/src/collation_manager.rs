//! The collation dispatch layer of spec.md §4.6, grounded on
//! `original_source/validator/collation-manager.hpp/.cpp`.
//!
//! Routes a "produce a block for shard S" request to local collation (always
//! for the master shard) or to a remote collator node, tracking collator
//! liveness, active-group refcounts, and bans. Restructured around the
//! teacher's `collator/src/manager/collation_processor.rs` dispatcher style
//! (`Arc<Mutex<...>>` state, async methods) rather than the source's own
//! actor mailbox.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::seq::SliceRandom;
use shardval_block_util::{BlockIdExt, ShardIdent, ValidatorSet};
use shardval_network::{Candidate, CollateRequest, CollateResponse, Ping, QueryClient};
use shardval_session::BlockCandidate;
use tracing::{info, warn};

use crate::error::{CoreError, CoreResult};
use crate::options::{CollatorsListEntry, SelectMode};
use crate::stats::Stats;

/// Per-collator liveness and ban bookkeeping (`CollationManager::CollatorInfo`).
struct CollatorInfo {
    alive: bool,
    active_cnt: usize,
    last_ping_at: Option<Instant>,
    ping_cooldown_until: Instant,
    version: Option<u32>,
    banned_until: Option<Instant>,
}

impl CollatorInfo {
    fn new(now: Instant) -> Self {
        Self { alive: false, active_cnt: 0, last_ping_at: None, ping_cooldown_until: now, version: None, banned_until: None }
    }

    fn is_banned(&self, now: Instant) -> bool {
        self.banned_until.is_some_and(|until| until > now)
    }
}

/// One configured shard's collator pool plus its round-robin cursor
/// (`CollationManager::ShardInfo`).
struct ShardInfo {
    entry: CollatorsListEntry,
    cur_idx: usize,
    active_cnt: usize,
}

struct OptimisticPrevEntry {
    block_data: bytes::Bytes,
    refcnt: usize,
}

struct Inner {
    collators: HashMap<[u8; 32], CollatorInfo>,
    shards: Vec<ShardInfo>,
    optimistic_prev_cache: HashMap<BlockIdExt, OptimisticPrevEntry>,
}

/// Dispatches collation requests to local or remote collators (spec.md §4.6).
pub struct CollationManager {
    client: Arc<dyn QueryClient>,
    stats: Arc<Stats>,
    ban_duration: Duration,
    ping_cooldown: Duration,
    next_ping_version: AtomicU32,
    inner: Mutex<Inner>,
}

impl CollationManager {
    pub fn new(
        client: Arc<dyn QueryClient>,
        stats: Arc<Stats>,
        collators_list: Vec<CollatorsListEntry>,
        ban_duration: Duration,
        ping_cooldown: Duration,
    ) -> Self {
        let shards = collators_list.into_iter().map(|entry| ShardInfo { entry, cur_idx: 0, active_cnt: 0 }).collect();
        Self {
            client,
            stats,
            ban_duration,
            ping_cooldown,
            next_ping_version: AtomicU32::new(1),
            inner: Mutex::new(Inner {
                collators: HashMap::new(),
                shards,
                optimistic_prev_cache: HashMap::new(),
            }),
        }
    }

    /// `validator_group_started`: bumps the configured collators' `active_cnt`
    /// for `shard` so only actively-needed collators get pinged.
    pub fn validator_group_started(&self, shard: ShardIdent) {
        let mut inner = self.inner.lock();
        if let Some(s) = inner.shards.iter_mut().find(|s| s.entry.shard == shard) {
            s.active_cnt += 1;
        }
    }

    pub fn validator_group_finished(&self, shard: ShardIdent) {
        let mut inner = self.inner.lock();
        if let Some(s) = inner.shards.iter_mut().find(|s| s.entry.shard == shard) {
            s.active_cnt = s.active_cnt.saturating_sub(1);
        }
    }

    /// `ban_collator`: extends `banned_until` by the configured ban duration.
    /// An alarm elsewhere unbans expired entries by simply letting
    /// `is_banned` observe the deadline has passed; no separate sweep is
    /// needed since the check is always time-relative.
    pub fn ban_collator(&self, collator: [u8; 32], reason: &str) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let info = inner.collators.entry(collator).or_insert_with(|| CollatorInfo::new(now));
        info.banned_until = Some(now + self.ban_duration);
        warn!(target: "shardval", collator = ?collator, reason, "banned collator");
        self.stats.record_collator_ban();
    }

    /// `collate_block`: always local for the master shard; otherwise selects
    /// a remote collator per the shard's configured `select_mode`, with
    /// ban-aware fallback and a final fallback to self-collation when
    /// configured.
    pub async fn collate_block(
        &self,
        shard: ShardIdent,
        prev: Vec<BlockIdExt>,
        validator_set: &ValidatorSet,
        deadline: Instant,
        local_collate: impl Fn(ShardIdent, Vec<BlockIdExt>) -> CoreResult<BlockCandidate>,
    ) -> CoreResult<BlockCandidate> {
        if shard.is_masterchain() {
            return local_collate(shard, prev);
        }

        loop {
            let selection = self.select_collator(shard)?;
            let Some(peer) = selection else {
                return local_collate(shard, prev);
            };

            if Instant::now() >= deadline {
                return Err(CoreError::timeout(shard.workchain()));
            }

            let request = CollateRequest {
                shard,
                catchain_seqno: validator_set.catchain_seqno,
                prev: prev.clone(),
                creator_pubkey: peer,
                round: 0,
                first_block_round: 0,
                priority: 0,
                optimistic_prev: None,
            };
            match self.client.collate_block(peer, request).await {
                Ok(CollateResponse::Candidate(candidate)) => {
                    if let Err(e) = verify_candidate_source(&candidate, peer) {
                        self.ban_collator(peer, &e.to_string());
                        continue;
                    }
                    return Ok(BlockCandidate {
                        id: candidate.id,
                        data: candidate.data,
                        collated_data: candidate.collated_data,
                    });
                }
                Ok(CollateResponse::Error(err)) => {
                    warn!(target: "shardval", collator = ?peer, %err, "collator returned an error");
                    if err.code >= 400 {
                        self.ban_collator(peer, &err.message);
                    }
                    continue;
                }
                Err(err) => {
                    info!(target: "shardval", collator = ?peer, %err, "collate query failed, retrying");
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    tokio::time::sleep(COLLATE_RETRY_BACKOFF.min(remaining)).await;
                    continue;
                }
            }
        }
    }

    /// `collate_block_optimistic`: in addition to [`collate_block`], caches
    /// `prev_block_data` so the remote collator can fetch it back through
    /// `request_block_callback`; the entry's refcount is released when the
    /// caller signals completion via [`release_optimistic_prev`].
    pub fn cache_optimistic_prev(&self, prev_id: BlockIdExt, prev_block: bytes::Bytes) {
        let mut inner = self.inner.lock();
        let entry = inner
            .optimistic_prev_cache
            .entry(prev_id)
            .or_insert_with(|| OptimisticPrevEntry { block_data: prev_block, refcnt: 0 });
        entry.refcnt += 1;
    }

    pub fn release_optimistic_prev(&self, prev_id: BlockIdExt) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.optimistic_prev_cache.get_mut(&prev_id) {
            entry.refcnt = entry.refcnt.saturating_sub(1);
            if entry.refcnt == 0 {
                inner.optimistic_prev_cache.remove(&prev_id);
            }
        }
    }

    pub fn optimistic_prev_block(&self, prev_id: &BlockIdExt) -> Option<bytes::Bytes> {
        self.inner.lock().optimistic_prev_cache.get(prev_id).map(|e| e.block_data.clone())
    }

    /// Pings a collator if its cooldown has elapsed, updating `alive` and
    /// `version` from the response.
    pub async fn ping_collator(&self, collator: [u8; 32]) {
        let now = Instant::now();
        {
            let mut inner = self.inner.lock();
            let info = inner.collators.entry(collator).or_insert_with(|| CollatorInfo::new(now));
            if info.last_ping_at.is_some() && info.ping_cooldown_until > now {
                return;
            }
            info.last_ping_at = Some(now);
            info.ping_cooldown_until = now + self.ping_cooldown;
        }
        let ping = Ping { flags: 0 };
        match self.client.ping(collator, ping).await {
            Ok(pong) => {
                let mut inner = self.inner.lock();
                let info = inner.collators.entry(collator).or_insert_with(|| CollatorInfo::new(now));
                info.alive = true;
                info.version = Some(pong.version);
            }
            Err(_) => {
                let mut inner = self.inner.lock();
                let info = inner.collators.entry(collator).or_insert_with(|| CollatorInfo::new(now));
                info.alive = false;
            }
        }
    }

    pub fn is_alive(&self, collator: &[u8; 32]) -> bool {
        self.inner.lock().collators.get(collator).map(|c| c.alive).unwrap_or(false)
    }

    /// `Ok(Some(peer))` to query `peer`; `Ok(None)` to fall back to local
    /// collation (only when the shard has `self_collate` configured); `Err`
    /// when no collator is reachable and self-collation is not configured.
    fn select_collator(&self, shard: ShardIdent) -> CoreResult<Option<[u8; 32]>> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let idx = inner
            .shards
            .iter()
            .position(|s| s.entry.shard == shard)
            .ok_or_else(|| CoreError::not_ready(format!("shard {shard:?} has no configured collators")))?;

        let clean: Vec<[u8; 32]> = {
            let s = &inner.shards[idx];
            s.entry
                .collators
                .iter()
                .copied()
                .filter(|c| !inner.collators.get(c).is_some_and(|info| info.is_banned(now)))
                .collect()
        };
        let banned_allowed: Vec<[u8; 32]> = inner.shards[idx].entry.collators.clone();
        let self_collate = inner.shards[idx].entry.self_collate;
        let select_mode = inner.shards[idx].entry.select_mode;

        let pool = if !clean.is_empty() { clean } else { banned_allowed };
        if pool.is_empty() {
            return if self_collate {
                Ok(None)
            } else {
                Err(CoreError::not_ready(format!("shard {shard:?} has no reachable collator")))
            };
        }

        let chosen = match select_mode {
            SelectMode::Random => *pool.choose(&mut rand::thread_rng()).unwrap(),
            SelectMode::Ordered => pool[0],
            SelectMode::RoundRobin => {
                let s = &mut inner.shards[idx];
                let chosen = pool[s.cur_idx % pool.len()];
                s.cur_idx = (s.cur_idx + 1) % pool.len().max(1);
                chosen
            }
        };
        Ok(Some(chosen))
    }
}

const COLLATE_RETRY_BACKOFF: Duration = Duration::from_millis(200);

fn verify_candidate_source(candidate: &Candidate, expected: [u8; 32]) -> CoreResult<()> {
    if candidate.source_pubkey != expected {
        return Err(CoreError::proto_violation(format!(
            "candidate source {:02x?} does not match queried collator {:02x?}",
            candidate.source_pubkey, expected
        )));
    }
    Ok(())
}
