use bytes::Bytes;

use crate::shard::ShardIdent;

/// Identity of a message in a per-address pool: the shard prefix it targets
/// plus its content hash. Ordered the same way as its C++ namesake so a pool
/// can be kept in a `BTreeMap` keyed by destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MessageId {
    pub dst: ShardIdent,
    pub hash: [u8; 32],
}

/// A message submitted by a client for inclusion in a future block, destined
/// for an account reachable through normal routing.
#[derive(Debug, Clone)]
pub struct ExternalMessage {
    data: Bytes,
    hash: [u8; 32],
    workchain: i32,
    addr: [u8; 32],
    dst: ShardIdent,
}

/// Upper bound on a serialized external message, matching the pool's
/// admission check.
pub const MAX_EXTERNAL_MESSAGE_SIZE: usize = 65535;

impl ExternalMessage {
    pub fn new(data: Bytes, hash: [u8; 32], workchain: i32, addr: [u8; 32], dst: ShardIdent) -> Self {
        Self {
            data,
            hash,
            workchain,
            addr,
            dst,
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn hash(&self) -> [u8; 32] {
        self.hash
    }

    pub fn workchain(&self) -> i32 {
        self.workchain
    }

    pub fn addr(&self) -> [u8; 32] {
        self.addr
    }

    pub fn dst(&self) -> ShardIdent {
        self.dst
    }

    pub fn id(&self) -> MessageId {
        MessageId {
            dst: self.dst,
            hash: self.hash,
        }
    }
}

/// A message routed to a block via IHR (instant hypercube routing) rather
/// than the ordinary outbound queue. Distinguished from `ExternalMessage`
/// only by carrying the block it was forwarded from.
#[derive(Debug, Clone)]
pub struct IhrMessage {
    data: Bytes,
    hash: [u8; 32],
    dst: ShardIdent,
    origin: crate::shard::BlockIdExt,
}

/// Upper bound on a serialized IHR message.
pub const MAX_IHR_MESSAGE_SIZE: usize = 65535;

impl IhrMessage {
    pub fn new(data: Bytes, hash: [u8; 32], dst: ShardIdent, origin: crate::shard::BlockIdExt) -> Self {
        Self {
            data,
            hash,
            dst,
            origin,
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn hash(&self) -> [u8; 32] {
        self.hash
    }

    pub fn dst(&self) -> ShardIdent {
        self.dst
    }

    pub fn origin(&self) -> crate::shard::BlockIdExt {
        self.origin
    }

    pub fn id(&self) -> MessageId {
        MessageId {
            dst: self.dst,
            hash: self.hash,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_ids_order_by_destination_then_hash() {
        let dst_a = ShardIdent::new_full(0);
        let dst_b = ShardIdent::new_full(1);
        let low = MessageId { dst: dst_a, hash: [0; 32] };
        let high = MessageId { dst: dst_a, hash: [1; 32] };
        assert!(low < high);
        let other_workchain = MessageId { dst: dst_b, hash: [0; 32] };
        assert!(low < other_workchain || other_workchain < low);
    }
}
