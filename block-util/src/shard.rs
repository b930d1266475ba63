use serde::{Deserialize, Serialize};

/// Workchain id of the master shard. Basechains use small non-negative ids.
pub const MASTERCHAIN_ID: i32 = -1;

const MAX_SHARD_DEPTH: u8 = 60;

/// A node of the per-workchain binary shard trie.
///
/// Represented as a prefix of `depth` significant bits packed into the high
/// bits of a `u64`, mirroring the shape of TON's `shard` field without
/// depending on its exact bit-marker encoding (the cell/wire format is out of
/// scope here, see crate docs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardIdent {
    workchain: i32,
    prefix: u64,
    depth: u8,
}

impl ShardIdent {
    pub fn new_full(workchain: i32) -> Self {
        Self {
            workchain,
            prefix: 0,
            depth: 0,
        }
    }

    pub fn workchain(&self) -> i32 {
        self.workchain
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    pub fn prefix(&self) -> u64 {
        self.prefix
    }

    pub fn is_masterchain(&self) -> bool {
        self.workchain == MASTERCHAIN_ID
    }

    pub fn is_full(&self) -> bool {
        self.depth == 0
    }

    /// The parent of this shard in the trie, or `None` at the root.
    pub fn shard_parent(&self) -> Option<ShardIdent> {
        if self.depth == 0 {
            return None;
        }
        Some(Self {
            workchain: self.workchain,
            prefix: self.prefix & !Self::bit_at(self.depth - 1),
            depth: self.depth - 1,
        })
    }

    /// The left (`left = true`) or right child of this shard in the trie.
    pub fn shard_child(&self, left: bool) -> Option<ShardIdent> {
        if self.depth >= MAX_SHARD_DEPTH {
            return None;
        }
        let bit = Self::bit_at(self.depth);
        Some(Self {
            workchain: self.workchain,
            prefix: if left { self.prefix } else { self.prefix | bit },
            depth: self.depth + 1,
        })
    }

    pub fn is_left_child(&self) -> bool {
        match self.depth {
            0 => true,
            d => self.prefix & Self::bit_at(d - 1) == 0,
        }
    }

    /// True iff `self` and `other` are the same shard, or one is an ancestor
    /// of the other in the trie (they "intersect" in TON terminology).
    pub fn shard_intersects(&self, other: &ShardIdent) -> bool {
        if self.workchain != other.workchain {
            return false;
        }
        let depth = self.depth.min(other.depth);
        Self::common_prefix(self.prefix, depth) == Self::common_prefix(other.prefix, depth)
    }

    /// True iff `other` is a strict or non-strict descendant of `self`.
    pub fn contains_shard(&self, other: &ShardIdent) -> bool {
        self.workchain == other.workchain
            && other.depth >= self.depth
            && Self::common_prefix(self.prefix, self.depth) == Self::common_prefix(other.prefix, self.depth)
    }

    /// True iff the account prefix addressed by `account_prefix` (top bits of
    /// a 256-bit address) falls within this shard.
    pub fn shard_contains(&self, account_prefix: u64) -> bool {
        Self::common_prefix(self.prefix, self.depth) == Self::common_prefix(account_prefix, self.depth)
    }

    fn bit_at(depth: u8) -> u64 {
        1u64 << (63 - depth as u32)
    }

    fn common_prefix(value: u64, depth: u8) -> u64 {
        if depth == 0 {
            0
        } else {
            value & !((1u64 << (64 - depth as u32)) - 1)
        }
    }
}

/// `(workchain, shard_prefix, seqno)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId {
    pub shard: ShardIdent,
    pub seqno: u32,
}

impl BlockId {
    pub fn zero_state(shard: ShardIdent) -> Self {
        Self { shard, seqno: 0 }
    }

    pub fn is_masterchain(&self) -> bool {
        self.shard.is_masterchain()
    }
}

/// `(BlockId, root_hash, file_hash)` — the full content-addressed identity of
/// a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockIdExt {
    pub id: BlockId,
    pub root_hash: [u8; 32],
    pub file_hash: [u8; 32],
}

impl BlockIdExt {
    pub fn shard(&self) -> ShardIdent {
        self.id.shard
    }

    pub fn seqno(&self) -> u32 {
        self.id.seqno
    }

    pub fn is_masterchain(&self) -> bool {
        self.id.is_masterchain()
    }

    pub fn is_zero(&self) -> bool {
        self.id.seqno == 0
    }
}

impl std::fmt::Display for BlockIdExt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({},{:016x},{}):{}",
            self.id.shard.workchain(),
            self.id.shard.prefix(),
            self.id.seqno,
            hex::encode_short(&self.root_hash)
        )
    }
}

mod hex {
    pub fn encode_short(bytes: &[u8]) -> String {
        bytes[..4.min(bytes.len())]
            .iter()
            .map(|b| format!("{b:02x}"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_parent_roundtrip() {
        let root = ShardIdent::new_full(0);
        let left = root.shard_child(true).unwrap();
        let right = root.shard_child(false).unwrap();
        assert_ne!(left, right);
        assert_eq!(left.shard_parent().unwrap(), root);
        assert_eq!(right.shard_parent().unwrap(), root);
        assert!(left.is_left_child());
        assert!(!right.is_left_child());
    }

    #[test]
    fn intersects_is_reflexive_and_ancestor_aware() {
        let root = ShardIdent::new_full(0);
        let left = root.shard_child(true).unwrap();
        let left_left = left.shard_child(true).unwrap();
        assert!(root.shard_intersects(&left));
        assert!(left.shard_intersects(&left_left));
        assert!(root.contains_shard(&left_left));
        assert!(!left.contains_shard(&root));
    }

    #[test]
    fn siblings_do_not_intersect() {
        let root = ShardIdent::new_full(0);
        let left = root.shard_child(true).unwrap();
        let right = root.shard_child(false).unwrap();
        assert!(!left.shard_intersects(&right));
    }

    #[test]
    fn shard_contains_checks_account_prefix() {
        let root = ShardIdent::new_full(0);
        let left = root.shard_child(true).unwrap();
        let right = root.shard_child(false).unwrap();
        assert!(left.shard_contains(0));
        assert!(!left.shard_contains(u64::MAX));
        assert!(right.shard_contains(u64::MAX));
    }
}
