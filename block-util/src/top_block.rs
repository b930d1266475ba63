use crate::shard::{BlockIdExt, ShardIdent};
use crate::validator_set::{SignatureSet, ValidatorSet};

/// The state a shard is parked in within the latest masterchain config,
/// as far as `may_be_valid` needs to know about it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardFsmState {
    None,
    Split,
    Merge,
}

/// What a shard-top-block description's validity check needs to read out of
/// the latest masterchain state: each live shard's current top seqno, fsm
/// state, and the validator set guarding it. Kept as a trait so this crate
/// never has to model the masterchain config itself.
pub trait MasterchainShardView {
    fn shard_top(&self, shard: ShardIdent) -> Option<(u32, ShardFsmState)>;
    fn validator_set_catchain_seqno(&self, shard: ShardIdent) -> Option<u32>;
}

/// What the validator manager needs to read out of a masterchain state to
/// re-derive shard topology and validator-group membership on every tip
/// advance: the live shard set, the validator sets guarding each shard
/// (current and, once a set-change is pending, next), and the bits that feed
/// a group's session-id fingerprint. A superset of [`MasterchainShardView`]
/// so both consumers can share one concrete implementation.
pub trait MasterchainConfigView: MasterchainShardView {
    /// Every shard currently live in the binary shard trie.
    fn active_shards(&self) -> Vec<ShardIdent>;

    /// The validator set presently responsible for `shard`.
    fn get_validator_set(&self, shard: ShardIdent) -> ValidatorSet;

    /// The validator set that will take over `shard` once the pending
    /// set-change commits, if one is scheduled.
    fn get_next_validator_set(&self, shard: ShardIdent) -> Option<ValidatorSet>;

    /// Seqno of the most recent key block at or before `shard`'s current top.
    fn last_key_block_seqno(&self, shard: ShardIdent) -> u32;

    /// A fingerprint of the parts of the masterchain config that affect a
    /// validator session's identity (collator config, vertical seqno policy)
    /// but aren't captured by the validator set itself.
    fn config_hash(&self) -> u32;
}

/// A collator's claim that a given shardchain block is the new tip of its
/// shard, gossiped to masterchain validators for inclusion in the next
/// masterchain block.
#[derive(Debug, Clone)]
pub struct ShardTopBlockDescription {
    block_id: BlockIdExt,
    after_split: bool,
    after_merge: bool,
    before_split: bool,
    catchain_seqno: u32,
    validator_set_hash: u32,
    signatures: SignatureSet,
}

impl ShardTopBlockDescription {
    pub fn new(
        block_id: BlockIdExt,
        after_split: bool,
        after_merge: bool,
        before_split: bool,
        catchain_seqno: u32,
        validator_set_hash: u32,
        signatures: SignatureSet,
    ) -> Self {
        Self {
            block_id,
            after_split,
            after_merge,
            before_split,
            catchain_seqno,
            validator_set_hash,
            signatures,
        }
    }

    pub fn shard(&self) -> ShardIdent {
        self.block_id.shard()
    }

    pub fn block_id(&self) -> BlockIdExt {
        self.block_id
    }

    pub fn before_split(&self) -> bool {
        self.before_split
    }

    pub fn after_split(&self) -> bool {
        self.after_split
    }

    pub fn after_merge(&self) -> bool {
        self.after_merge
    }

    pub fn catchain_seqno(&self) -> u32 {
        self.catchain_seqno
    }

    pub fn validator_set_hash(&self) -> u32 {
        self.validator_set_hash
    }

    pub fn signatures(&self) -> &SignatureSet {
        &self.signatures
    }

    /// Checks this description against the masterchain's current view of its
    /// shard, without touching signatures: a block can only extend a shard
    /// that isn't mid split/merge relative to what it claims, by exactly one
    /// seqno, against the catchain the masterchain still thinks is current.
    pub fn may_be_valid(&self, view: &dyn MasterchainShardView) -> bool {
        if self.after_split && self.after_merge {
            return false;
        }

        let ok = if !self.after_split && !self.after_merge {
            match view.shard_top(self.shard()) {
                Some((top_seqno, ShardFsmState::None)) => top_seqno < self.block_id.seqno(),
                _ => false,
            }
        } else if self.after_split {
            let Some(parent) = self.shard().shard_parent() else {
                return false;
            };
            match view.shard_top(parent) {
                Some((top_seqno, ShardFsmState::Split)) => top_seqno + 1 == self.block_id.seqno(),
                _ => false,
            }
        } else {
            let (Some(left), Some(right)) = (self.shard().shard_child(true), self.shard().shard_child(false)) else {
                return false;
            };
            match (view.shard_top(left), view.shard_top(right)) {
                (Some((l_seqno, ShardFsmState::Merge)), Some((r_seqno, ShardFsmState::Merge))) => {
                    l_seqno.max(r_seqno) + 1 == self.block_id.seqno()
                }
                _ => false,
            }
        };
        if !ok {
            return false;
        }

        view.validator_set_catchain_seqno(self.shard()) == Some(self.catchain_seqno)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shard::BlockId;

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

    fn block_id(shard: ShardIdent, seqno: u32) -> BlockIdExt {
        BlockIdExt {
            id: BlockId { shard, seqno },
            root_hash: [1; 32],
            file_hash: [2; 32],
        }
    }

    #[test]
    fn ordinary_extension_must_advance_past_current_top() {
        let shard = ShardIdent::new_full(0);
        let descr = ShardTopBlockDescription::new(
            block_id(shard, 5),
            false,
            false,
            false,
            7,
            0,
            SignatureSet::default(),
        );
        let view = FixedView {
            top: Some((4, ShardFsmState::None)),
            catchain_seqno: Some(7),
        };
        assert!(descr.may_be_valid(&view));

        let stale_view = FixedView {
            top: Some((5, ShardFsmState::None)),
            catchain_seqno: Some(7),
        };
        assert!(!descr.may_be_valid(&stale_view));
    }

    #[test]
    fn mismatched_catchain_seqno_is_rejected() {
        let shard = ShardIdent::new_full(0);
        let descr = ShardTopBlockDescription::new(
            block_id(shard, 5),
            false,
            false,
            false,
            7,
            0,
            SignatureSet::default(),
        );
        let view = FixedView {
            top: Some((4, ShardFsmState::None)),
            catchain_seqno: Some(8),
        };
        assert!(!descr.may_be_valid(&view));
    }

    #[test]
    fn split_and_merge_both_set_is_always_invalid() {
        let shard = ShardIdent::new_full(0);
        let descr = ShardTopBlockDescription::new(
            block_id(shard, 5),
            true,
            true,
            false,
            7,
            0,
            SignatureSet::default(),
        );
        let view = FixedView {
            top: Some((4, ShardFsmState::None)),
            catchain_seqno: Some(7),
        };
        assert!(!descr.may_be_valid(&view));
    }
}
