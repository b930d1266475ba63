//! The IHR (instant hypercube routing) message pool of SPEC_FULL.md §2,
//! grounded on `original_source/validator/impl/ihr-message.hpp` and the
//! admission shape `ext_message_pool` establishes for client-submitted
//! messages. IHR messages are generated by the shard chains themselves
//! rather than submitted by clients, so there is no rate limiting here —
//! only dedup-by-hash and per-shard retrieval.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use shardval_block_util::{IhrMessage, MessageId, ShardIdent};

const DEFAULT_TTL: Duration = Duration::from_secs(600);

struct Entry {
    message: IhrMessage,
    delete_at: Instant,
}

/// Pool for block-originated IHR messages awaiting delivery to their
/// destination shard (spec.md §4.10: "Tracks external messages, ihr
/// messages... exposing the first two to collation").
pub struct IhrMessagePool {
    entries: DashMap<MessageId, Entry, ahash::RandomState>,
    ttl: Duration,
}

impl Default for IhrMessagePool {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl IhrMessagePool {
    pub fn new(ttl: Duration) -> Self {
        Self { entries: DashMap::default(), ttl }
    }

    /// Admits `message`, replacing any existing entry with the same id.
    pub fn add(&self, message: IhrMessage) {
        let id = message.id();
        self.entries.insert(id, Entry { message, delete_at: Instant::now() + self.ttl });
    }

    /// Messages destined within `shard`, dropping expired entries encountered
    /// along the way.
    pub fn get_for_collator(&self, shard: ShardIdent) -> Vec<IhrMessage> {
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut out = Vec::new();
        for entry in self.entries.iter() {
            if entry.delete_at <= now {
                expired.push(*entry.key());
                continue;
            }
            if shard.contains_shard(&entry.value().message.dst()) {
                out.push(entry.value().message.clone());
            }
        }
        for id in expired {
            self.entries.remove(&id);
        }
        out
    }

    /// Drops delivered messages by id, mirroring `ext_message_pool`'s
    /// `complete` but with no postpone path: an IHR message is either still
    /// pending or gone.
    pub fn complete(&self, delivered: &[MessageId]) {
        for id in delivered {
            self.entries.remove(id);
        }
    }

    pub fn sweep_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, e| e.delete_at > now);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
