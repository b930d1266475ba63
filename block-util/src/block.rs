use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::shard::BlockIdExt;
use crate::validator_set::SignatureSet;

/// Commitment to the pre- and post-state of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateUpdate {
    pub old_hash: [u8; 32],
    pub new_hash: [u8; 32],
}

/// Fields extractable from a block body without touching its full contents.
/// `prev` has one entry, or two for a block `after_merge`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    pub prev: Vec<BlockIdExt>,
    pub master_ref: Option<BlockIdExt>,
    pub before_split: bool,
    pub after_split: bool,
    pub after_merge: bool,
    pub want_split: bool,
    pub want_merge: bool,
    pub is_key_block: bool,
    pub gen_utime: u32,
    pub end_lt: u64,
    pub state_update: StateUpdate,
    pub catchain_seqno: u32,
    pub validator_set_hash: u32,
    pub prev_key_mc_seqno: u32,
}

/// An opaque, content-addressed block body plus its extracted header.
#[derive(Debug, Clone)]
pub struct Block {
    id: BlockIdExt,
    data: Bytes,
    header: BlockHeader,
}

impl Block {
    pub fn new(id: BlockIdExt, data: Bytes, header: BlockHeader) -> Self {
        Self { id, data, header }
    }

    pub fn id(&self) -> &BlockIdExt {
        &self.id
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn header(&self) -> &BlockHeader {
        &self.header
    }

    /// sha256 of the block's serialized root. Individual cells are not
    /// modeled here, so the whole body stands in for the root cell's
    /// serialization.
    pub fn root_hash(&self) -> [u8; 32] {
        Sha256::digest(&self.data).into()
    }

    pub fn file_hash(&self) -> [u8; 32] {
        Sha256::digest(&self.data).into()
    }
}

/// A merkle proof over a non-master block's header, without signatures.
#[derive(Debug, Clone)]
pub struct ProofLink {
    pub id: BlockIdExt,
    pub header: BlockHeader,
}

impl ProofLink {
    /// Derives a proof-link from a block body directly, used by the wait-for
    /// registry when a non-master block arrives without an accompanying
    /// proof-link.
    pub fn from_block(block: &Block) -> Self {
        Self {
            id: *block.id(),
            header: block.header().clone(),
        }
    }
}

/// A merkle proof over a master block's header plus its signature set.
#[derive(Debug, Clone)]
pub struct Proof {
    pub id: BlockIdExt,
    pub header: BlockHeader,
    pub signatures: SignatureSet,
    /// The proof's own declared total signature weight, checked against the
    /// weight actually accumulated by verifying `signatures` (spec.md §4.4
    /// step 5).
    pub sig_weight: u64,
}

impl Proof {
    pub fn as_link(&self) -> ProofLink {
        ProofLink {
            id: self.id,
            header: self.header.clone(),
        }
    }
}
