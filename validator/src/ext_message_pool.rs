//! The external-message mempool of spec.md §4.7, grounded on
//! `original_source/validator/impl/ext-message-pool.hpp/.cpp`.
//!
//! The original composes two collaborator calls per submission: a cheap
//! structural parse (gives the sender address for a pre-check) followed by
//! a heavier semantic check against the held masterchain state. This crate
//! has no masterchain-state/contract model to check against (spec.md §1),
//! so both fold into one [`CheckExternalMessage::check`] call; the cheap
//! pre-check is kept available via the optional `peek_address` hook.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use rand::seq::SliceRandom;
use shardval_block_util::{ExternalMessage, MessageId, ShardIdent, MAX_EXTERNAL_MESSAGE_SIZE};

use crate::stats::Stats;

const MAX_EXT_MSG_PER_ADDR_TIME_WINDOW: Duration = Duration::from_secs(10);
const MAX_EXT_MSG_PER_ADDR: u32 = 30;
const PER_ADDRESS_LIMIT: usize = 256;
const MESSAGE_TTL: Duration = Duration::from_secs(600);
const SOFT_MEMPOOL_LIMIT: usize = 1024;
const MAX_POSTPONE_GENERATION: u32 = 2;

#[derive(Debug, thiserror::Error)]
pub enum ExtMessageError {
    #[error("external message exceeds the {0} byte size limit")]
    TooLarge(usize),
    #[error("too many external messages to address {0}:{1:02x?}")]
    RateLimited(i32, [u8; 32]),
    #[error("external message rejected: {0}")]
    Malformed(String),
}

/// The parse-and-verify collaborator (spec.md §4.7's `CheckExternalMessage`).
pub trait CheckExternalMessage: Send + Sync {
    fn check(&self, data: &[u8]) -> Result<ExternalMessage, ExtMessageError>;

    /// Cheap best-effort address extraction for the rate pre-check, run
    /// before `check`. `None` skips the pre-check; the post-check increment
    /// still applies regardless.
    fn peek_address(&self, _data: &[u8]) -> Option<(i32, [u8; 32])> {
        None
    }
}

struct AddressWindow {
    counter_cur: u32,
    counter_prev: u32,
    rotate_at: Instant,
}

impl AddressWindow {
    fn new(now: Instant) -> Self {
        Self { counter_cur: 0, counter_prev: 0, rotate_at: now + MAX_EXT_MSG_PER_ADDR_TIME_WINDOW / 2 }
    }

    fn before_query(&mut self, now: Instant) {
        while self.rotate_at <= now {
            self.counter_prev = self.counter_cur;
            self.counter_cur = 0;
            if self.counter_prev == 0 {
                self.rotate_at = now + MAX_EXT_MSG_PER_ADDR_TIME_WINDOW / 2;
                break;
            }
            self.rotate_at += MAX_EXT_MSG_PER_ADDR_TIME_WINDOW / 2;
        }
    }

    fn count(&mut self, now: Instant) -> u32 {
        self.before_query(now);
        self.counter_cur + self.counter_prev
    }

    fn increment(&mut self, now: Instant) -> u32 {
        self.before_query(now);
        self.counter_cur += 1;
        self.counter_cur + self.counter_prev
    }
}

struct MessageEntry {
    message: ExternalMessage,
    generation: u32,
    active: bool,
    reactivate_at: Instant,
    delete_at: Instant,
}

impl MessageEntry {
    fn tick_active(&mut self, now: Instant) -> bool {
        if !self.active && self.reactivate_at <= now {
            self.active = true;
            self.generation += 1;
        }
        self.active
    }

    fn can_postpone(&self) -> bool {
        self.generation <= MAX_POSTPONE_GENERATION
    }

    fn postpone(&mut self, now: Instant) {
        if !self.active {
            return;
        }
        self.active = false;
        self.reactivate_at = now + Duration::from_secs(self.generation as u64 * 5);
    }
}

#[derive(Default)]
struct Inner {
    by_priority: BTreeMap<u8, BTreeMap<MessageId, MessageEntry>>,
    by_hash: ahash::AHashMap<[u8; 32], (u8, MessageId)>,
    address_counts: ahash::AHashMap<(i32, [u8; 32]), usize>,
    rate: ahash::AHashMap<(i32, [u8; 32]), AddressWindow>,
}

impl Inner {
    fn insert(&mut self, message: ExternalMessage, priority: u8, max_mempool_num: usize) {
        if self.by_priority.get(&priority).map(|b| b.len()).unwrap_or(0) >= max_mempool_num {
            return;
        }
        let address = (message.workchain(), message.addr());
        if *self.address_counts.get(&address).unwrap_or(&0) >= PER_ADDRESS_LIMIT {
            return;
        }
        let id = message.id();
        if let Some(&(old_priority, old_id)) = self.by_hash.get(&id.hash) {
            if old_priority >= priority {
                return;
            }
            self.remove_entry(old_priority, old_id);
        }
        let now = Instant::now();
        self.by_priority.entry(priority).or_default().insert(
            id,
            MessageEntry { message, generation: 0, active: true, reactivate_at: now, delete_at: now + MESSAGE_TTL },
        );
        *self.address_counts.entry(address).or_insert(0) += 1;
        self.by_hash.insert(id.hash, (priority, id));
    }

    fn remove_entry(&mut self, priority: u8, id: MessageId) -> Option<MessageEntry> {
        let entry = self.by_priority.get_mut(&priority)?.remove(&id)?;
        let address = (entry.message.workchain(), entry.message.addr());
        if let Some(count) = self.address_counts.get_mut(&address) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.address_counts.remove(&address);
            }
        }
        self.by_hash.remove(&id.hash);
        Some(entry)
    }
}

/// Mempool for client-submitted external messages (spec.md §4.7).
pub struct ExternalMessagePool {
    checker: Arc<dyn CheckExternalMessage>,
    max_mempool_num: usize,
    stats: Arc<Stats>,
    inner: Mutex<Inner>,
}

impl ExternalMessagePool {
    pub fn new(checker: Arc<dyn CheckExternalMessage>, max_mempool_num: usize, stats: Arc<Stats>) -> Self {
        Self { checker, max_mempool_num, stats, inner: Mutex::new(Inner::default()) }
    }

    /// Checks and, if `add_to_mempool`, admits `data`. Always returns the
    /// parsed message on success, even when admission itself was skipped by
    /// a soft cap (spec.md §4.7: check and store are separate concerns).
    pub fn check_add(&self, data: Bytes, priority: u8, add_to_mempool: bool) -> Result<ExternalMessage, ExtMessageError> {
        if data.len() > MAX_EXTERNAL_MESSAGE_SIZE {
            self.stats.record_ext_message_check(false);
            return Err(ExtMessageError::TooLarge(MAX_EXTERNAL_MESSAGE_SIZE));
        }

        if let Some(address) = self.checker.peek_address(&data) {
            let now = Instant::now();
            let mut inner = self.inner.lock();
            let count = inner.rate.entry(address).or_insert_with(|| AddressWindow::new(now)).count(now);
            if count >= MAX_EXT_MSG_PER_ADDR {
                self.stats.record_ext_message_check(false);
                return Err(ExtMessageError::RateLimited(address.0, address.1));
            }
        }

        let message = match self.checker.check(&data) {
            Ok(m) => m,
            Err(e) => {
                self.stats.record_ext_message_check(false);
                return Err(e);
            }
        };
        self.stats.record_ext_message_check(true);

        let address = (message.workchain(), message.addr());
        let now = Instant::now();
        {
            let mut inner = self.inner.lock();
            let total = inner.rate.entry(address).or_insert_with(|| AddressWindow::new(now)).increment(now);
            if total > MAX_EXT_MSG_PER_ADDR {
                return Err(ExtMessageError::RateLimited(address.0, address.1));
            }
        }

        if add_to_mempool {
            self.inner.lock().insert(message.clone(), priority, self.max_mempool_num);
        }
        Ok(message)
    }

    /// Returns `(message, priority)` pairs targeting `shard`, highest
    /// priority first and shuffled within a priority class; drops expired
    /// entries encountered along the way.
    pub fn get_for_collator(&self, shard: ShardIdent) -> Vec<(ExternalMessage, u8)> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let mut out = Vec::new();
        let priorities: Vec<u8> = inner.by_priority.keys().rev().copied().collect();
        for priority in priorities {
            let mut expired = Vec::new();
            let mut bucket_out = Vec::new();
            if let Some(bucket) = inner.by_priority.get_mut(&priority) {
                for (id, entry) in bucket.iter_mut() {
                    if !shard.contains_shard(&id.dst) {
                        continue;
                    }
                    if entry.delete_at <= now {
                        expired.push(*id);
                        continue;
                    }
                    if entry.tick_active(now) {
                        bucket_out.push((entry.message.clone(), priority));
                    }
                }
            }
            for id in expired {
                inner.remove_entry(priority, id);
            }
            bucket_out.shuffle(&mut rand::thread_rng());
            out.extend(bucket_out);
        }
        out
    }

    /// Drops `to_delete` outright; postpones `to_delay` up to
    /// [`MAX_POSTPONE_GENERATION`] times (dropping past that, or if the
    /// priority bucket is over the soft postpone limit).
    pub fn complete(&self, to_delay: &[[u8; 32]], to_delete: &[[u8; 32]]) {
        let mut inner = self.inner.lock();
        for &hash in to_delete {
            if let Some(&(priority, id)) = inner.by_hash.get(&hash) {
                inner.remove_entry(priority, id);
            }
        }
        let now = Instant::now();
        for &hash in to_delay {
            let Some(&(priority, id)) = inner.by_hash.get(&hash) else { continue };
            let bucket_len = inner.by_priority.get(&priority).map(|b| b.len()).unwrap_or(0);
            let can_postpone =
                inner.by_priority.get(&priority).and_then(|b| b.get(&id)).map(|e| e.can_postpone()).unwrap_or(false);
            if can_postpone && bucket_len < SOFT_MEMPOOL_LIMIT {
                if let Some(entry) = inner.by_priority.get_mut(&priority).and_then(|b| b.get_mut(&id)) {
                    entry.postpone(now);
                }
            } else {
                inner.remove_entry(priority, id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoChecker;
    impl CheckExternalMessage for EchoChecker {
        fn check(&self, data: &[u8]) -> Result<ExternalMessage, ExtMessageError> {
            if data.is_empty() {
                return Err(ExtMessageError::Malformed("empty payload".into()));
            }
            let addr = [data[0]; 32];
            Ok(ExternalMessage::new(
                Bytes::copy_from_slice(data),
                [data[0]; 32],
                0,
                addr,
                ShardIdent::new_full(0),
            ))
        }

        fn peek_address(&self, data: &[u8]) -> Option<(i32, [u8; 32])> {
            data.first().map(|b| (0, [*b; 32]))
        }
    }

    fn pool(max_mempool: usize) -> ExternalMessagePool {
        ExternalMessagePool::new(Arc::new(EchoChecker), max_mempool, Arc::new(Stats::default()))
    }

    #[test]
    fn oversized_payload_is_rejected_before_parsing() {
        let pool = pool(100);
        let data = Bytes::from(vec![0u8; MAX_EXTERNAL_MESSAGE_SIZE + 1]);
        assert!(matches!(pool.check_add(data, 0, true), Err(ExtMessageError::TooLarge(_))));
    }

    #[test]
    fn duplicate_hash_keeps_the_higher_priority_entry() {
        let pool = pool(100);
        pool.check_add(Bytes::from_static(b"\x01aaa"), 5, true).unwrap();
        pool.check_add(Bytes::from_static(b"\x01bbb"), 3, true).unwrap();
        assert_eq!(pool.len(), 1);
        let shard = ShardIdent::new_full(0);
        let got = pool.get_for_collator(shard);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].1, 5);
    }

    #[test]
    fn per_address_rate_limit_rejects_the_31st_message() {
        let pool = pool(1000);
        for i in 0..MAX_EXT_MSG_PER_ADDR {
            let msg = format!("\x09payload-{i}");
            pool.check_add(Bytes::from(msg.into_bytes()), 0, false).unwrap();
        }
        let err = pool.check_add(Bytes::from_static(b"\x09overflow"), 0, false).unwrap_err();
        assert!(matches!(err, ExtMessageError::RateLimited(_, _)));
    }

    #[test]
    fn get_for_collator_only_returns_messages_within_the_requested_shard() {
        let pool = pool(100);
        pool.check_add(Bytes::from_static(b"\x02hello"), 0, true).unwrap();
        let other_shard = ShardIdent::new_full(5);
        assert!(pool.get_for_collator(other_shard).is_empty());
        assert_eq!(pool.get_for_collator(ShardIdent::new_full(0)).len(), 1);
    }

    #[test]
    fn complete_with_to_delete_drops_the_message() {
        let pool = pool(100);
        let msg = pool.check_add(Bytes::from_static(b"\x03hello"), 0, true).unwrap();
        pool.complete(&[], &[msg.hash()]);
        assert!(pool.is_empty());
    }

    #[test]
    fn complete_with_to_delay_postpones_then_eventually_drops() {
        let pool = pool(100);
        let msg = pool.check_add(Bytes::from_static(b"\x04hello"), 0, true).unwrap();
        for _ in 0..=MAX_POSTPONE_GENERATION {
            pool.complete(&[msg.hash()], &[]);
        }
        // one more postpone attempt exceeds can_postpone and drops the entry
        pool.complete(&[msg.hash()], &[]);
        assert!(pool.is_empty());
    }

    #[test]
    fn malformed_payload_is_rejected_by_the_checker() {
        let pool = pool(100);
        assert!(matches!(pool.check_add(Bytes::new(), 0, true), Err(ExtMessageError::Malformed(_))));
    }
}
