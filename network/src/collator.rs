//! The collator RLDP query schema of spec.md §6 ("Wire (RLDP) — collator
//! node protocol"), at the concept level the spec describes it: field shapes
//! only, no ADNL/RLDP framing or TL serialization (out of scope, spec.md §1).

use bytes::Bytes;
use shardval_block_util::{BlockIdExt, ShardIdent};

/// `generateBlock(shard, catchain_seqno, prev[], creator_pubkey, round,
/// first_block_round, priority)`. The optimistic variant is the same request
/// with `optimistic_prev` set to the prev-block id the collator may fetch
/// back via [`RequestBlockCallback`].
#[derive(Debug, Clone)]
pub struct CollateRequest {
    pub shard: ShardIdent,
    pub catchain_seqno: u32,
    pub prev: Vec<BlockIdExt>,
    pub creator_pubkey: [u8; 32],
    pub round: u32,
    pub first_block_round: u32,
    pub priority: u32,
    pub optimistic_prev: Option<BlockIdExt>,
}

/// Inbound callback a collator sends back to the requester during an
/// optimistic collation to fetch the cached previous block body.
#[derive(Debug, Clone, Copy)]
pub struct RequestBlockCallback {
    pub block_id: BlockIdExt,
}

/// `Candidate(source_pubkey, id, collated_data_hash, data, collated_data)`.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub source_pubkey: [u8; 32],
    pub id: BlockIdExt,
    pub collated_data_hash: [u8; 32],
    pub data: Bytes,
    pub collated_data: Bytes,
}

/// `Error(code, message)`, the collator's structured failure response.
#[derive(Debug, Clone, thiserror::Error)]
#[error("collator error {code}: {message}")]
pub struct CollatorError {
    pub code: i32,
    pub message: String,
}

/// A `generateBlock` response: either a candidate or a structured error.
#[derive(Debug, Clone)]
pub enum CollateResponse {
    Candidate(Candidate),
    Error(CollatorError),
}

/// `ping(flags)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Ping {
    pub flags: u32,
}

/// `pong(version, flags)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Pong {
    pub version: u32,
    pub flags: u32,
}
