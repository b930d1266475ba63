//! The shard-top-block gossip buffer of spec.md §4.8, grounded on
//! `original_source/validator/dummy0/top-shard-description.cpp`.
//!
//! Masterchain validators collect candidate `ShardTopBlockDescription`s
//! gossiped by shardchain collators/validators, filter them against the
//! current masterchain view with [`ShardTopBlockDescription::may_be_valid`],
//! and hand the survivors to block generation. Entries outlive a single
//! round so they can be re-broadcast until superseded or swept.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use shardval_block_util::{MasterchainShardView, ShardIdent, ShardTopBlockDescription};

/// Keyed by `(shard_prefix_as_shard, catchain_seqno)` so a later description
/// for the same shard under a new catchain session supersedes the old one,
/// while keeping at most one candidate per `(shard, catchain)` pair.
type Key = (ShardIdent, u32);

struct Entry {
    descr: ShardTopBlockDescription,
    received_at: Instant,
    last_broadcast_at: Instant,
}

/// Default interval between re-broadcasts of a still-unconfirmed description
/// (`top-shard-description.cpp`'s periodic resend on its actor alarm).
const DEFAULT_REBROADCAST_INTERVAL: Duration = Duration::from_secs(10);

/// Default age at which an unconfirmed description is dropped outright,
/// rather than kept for further re-broadcast.
const DEFAULT_MAX_AGE: Duration = Duration::from_secs(60);

/// Buffers received/generated shard-top-block descriptions pending inclusion
/// in the next masterchain block (spec.md §4.8).
pub struct ShardTopBlockBuffer {
    entries: Mutex<HashMap<Key, Entry>>,
    rebroadcast_interval: Duration,
    max_age: Duration,
}

impl Default for ShardTopBlockBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_REBROADCAST_INTERVAL, DEFAULT_MAX_AGE)
    }
}

impl ShardTopBlockBuffer {
    pub fn new(rebroadcast_interval: Duration, max_age: Duration) -> Self {
        Self { entries: Mutex::new(HashMap::new()), rebroadcast_interval, max_age }
    }

    /// Adds or replaces the buffered candidate for `(shard, catchain_seqno)`.
    /// A later seqno for the same key always wins; an equal-or-lower seqno
    /// is ignored since it cannot be a better candidate.
    pub fn add(&self, descr: ShardTopBlockDescription) {
        let key = (descr.shard(), descr.catchain_seqno());
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(&key) {
            Some(existing) if existing.descr.block_id().seqno() >= descr.block_id().seqno() => {}
            _ => {
                entries.insert(key, Entry { descr, received_at: now, last_broadcast_at: now });
            }
        }
    }

    /// Filters the buffer against `view` (typically the latest masterchain
    /// state) and returns the descriptions still eligible for inclusion,
    /// one per shard, preferring the highest seqno that remains valid.
    pub fn collect_valid(&self, view: &dyn MasterchainShardView) -> Vec<ShardTopBlockDescription> {
        self.entries.lock().values().filter(|e| e.descr.may_be_valid(view)).map(|e| e.descr.clone()).collect()
    }

    /// Removes entries whose shard/seqno has already been confirmed by a
    /// masterchain block (i.e. no longer a plausible future inclusion).
    pub fn remove_confirmed(&self, view: &dyn MasterchainShardView) {
        self.entries.lock().retain(|_, e| e.descr.may_be_valid(view));
    }

    /// Entries due for re-broadcast: older than `rebroadcast_interval` since
    /// their last send and younger than `max_age` overall. Touches
    /// `last_broadcast_at` for every entry returned.
    pub fn due_for_rebroadcast(&self) -> Vec<ShardTopBlockDescription> {
        let now = Instant::now();
        let mut entries = self.entries.lock();
        entries
            .values_mut()
            .filter(|e| now.duration_since(e.received_at) < self.max_age)
            .filter(|e| now.duration_since(e.last_broadcast_at) >= self.rebroadcast_interval)
            .map(|e| {
                e.last_broadcast_at = now;
                e.descr.clone()
            })
            .collect()
    }

    /// Drops entries older than `max_age` regardless of validity.
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        let max_age = self.max_age;
        self.entries.lock().retain(|_, e| now.duration_since(e.received_at) < max_age);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use shardval_block_util::{BlockId, BlockIdExt, ShardFsmState, SignatureSet};

    use super::*;

    struct FixedView {
        top: Option<(u32, ShardFsmState)>,
        catchain_seqno: Option<u32>,
    }

    impl MasterchainShardView for FixedView {
        fn shard_top(&self, _shard: ShardIdent) -> Option<(u32, ShardFsmState)> {
            self.top
        }
        fn validator_set_catchain_seqno(&self, _shard: ShardIdent) -> Option<u32> {
            self.catchain_seqno
        }
    }

    fn descr(shard: ShardIdent, seqno: u32, catchain_seqno: u32) -> ShardTopBlockDescription {
        ShardTopBlockDescription::new(
            BlockIdExt { id: BlockId { shard, seqno }, root_hash: [1; 32], file_hash: [2; 32] },
            false,
            false,
            false,
            catchain_seqno,
            0,
            SignatureSet::default(),
        )
    }

    #[test]
    fn a_higher_seqno_replaces_the_buffered_candidate_for_the_same_key() {
        let buf = ShardTopBlockBuffer::default();
        let shard = ShardIdent::new_full(0);
        buf.add(descr(shard, 5, 7));
        buf.add(descr(shard, 4, 7));
        assert_eq!(buf.len(), 1);
        let view = FixedView { top: Some((3, ShardFsmState::None)), catchain_seqno: Some(7) };
        let valid = buf.collect_valid(&view);
        assert_eq!(valid[0].block_id().seqno(), 5);
    }

    #[test]
    fn collect_valid_drops_descriptions_the_masterchain_view_no_longer_accepts() {
        let buf = ShardTopBlockBuffer::default();
        let shard = ShardIdent::new_full(0);
        buf.add(descr(shard, 5, 7));
        let stale_view = FixedView { top: Some((5, ShardFsmState::None)), catchain_seqno: Some(7) };
        assert!(buf.collect_valid(&stale_view).is_empty());
    }

    #[test]
    fn remove_confirmed_evicts_entries_no_longer_valid() {
        let buf = ShardTopBlockBuffer::default();
        let shard = ShardIdent::new_full(0);
        buf.add(descr(shard, 5, 7));
        let confirmed_view = FixedView { top: Some((5, ShardFsmState::None)), catchain_seqno: Some(7) };
        buf.remove_confirmed(&confirmed_view);
        assert!(buf.is_empty());
    }

    #[test]
    fn due_for_rebroadcast_is_empty_immediately_after_adding() {
        let buf = ShardTopBlockBuffer::new(Duration::from_secs(10), Duration::from_secs(60));
        let shard = ShardIdent::new_full(0);
        buf.add(descr(shard, 5, 7));
        assert!(buf.due_for_rebroadcast().is_empty());
    }

    #[test]
    fn due_for_rebroadcast_fires_once_the_interval_elapses_and_resets_the_clock() {
        let buf = ShardTopBlockBuffer::new(Duration::from_millis(5), Duration::from_secs(60));
        let shard = ShardIdent::new_full(0);
        buf.add(descr(shard, 5, 7));
        std::thread::sleep(Duration::from_millis(10));
        let due = buf.due_for_rebroadcast();
        assert_eq!(due.len(), 1);
        // Just resent: not due again until another full interval passes.
        assert!(buf.due_for_rebroadcast().is_empty());
    }

    #[test]
    fn sweep_expired_drops_entries_past_max_age() {
        let buf = ShardTopBlockBuffer::new(Duration::from_secs(10), Duration::from_millis(0));
        let shard = ShardIdent::new_full(0);
        buf.add(descr(shard, 5, 7));
        std::thread::sleep(Duration::from_millis(2));
        buf.sweep_expired();
        assert!(buf.is_empty());
    }
}
