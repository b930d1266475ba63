use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::block::Block;
use crate::shard::{BlockIdExt, ShardIdent};

/// Outbound message queue of a shard state towards its neighbors. Modeled
/// opaquely: the core only ever moves it wholesale between states.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageQueue {
    pub entries: Vec<[u8; 32]>,
}

impl MessageQueue {
    fn merge(a: &MessageQueue, b: &MessageQueue) -> MessageQueue {
        let mut entries = a.entries.clone();
        entries.extend(b.entries.iter().copied());
        MessageQueue { entries }
    }
}

/// The shard state tree rooted at a cell. Operations are the small set the
/// validator core actually calls: `merge_with`, `split`, `apply_block`,
/// `message_queue`.
#[derive(Debug, Clone)]
pub struct ShardState {
    id: BlockIdExt,
    root_hash: [u8; 32],
    before_split: bool,
    queue: MessageQueue,
}

#[derive(Debug, Error)]
pub enum ShardStateError {
    #[error("cannot merge states of shards {0:?} and {1:?}: not siblings")]
    NotSiblings(ShardIdent, ShardIdent),
    #[error("cannot split a shard state that is not marked before_split")]
    NotBeforeSplit,
    #[error("block {applied} does not extend state {prev}")]
    WrongPrev { prev: BlockIdExt, applied: BlockIdExt },
}

impl ShardState {
    pub fn new(id: BlockIdExt, root_hash: [u8; 32], before_split: bool, queue: MessageQueue) -> Self {
        Self {
            id,
            root_hash,
            before_split,
            queue,
        }
    }

    pub fn id(&self) -> &BlockIdExt {
        &self.id
    }

    pub fn get_shard(&self) -> ShardIdent {
        self.id.shard()
    }

    pub fn get_seqno(&self) -> u32 {
        self.id.seqno()
    }

    pub fn root_hash(&self) -> [u8; 32] {
        self.root_hash
    }

    pub fn before_split(&self) -> bool {
        self.before_split
    }

    pub fn message_queue(&self) -> &MessageQueue {
        &self.queue
    }

    /// Combines two sibling shard states into their common parent's state.
    pub fn merge_with(&self, other: &ShardState) -> Result<ShardState, ShardStateError> {
        let parent = self
            .get_shard()
            .shard_parent()
            .filter(|p| Some(*p) == other.get_shard().shard_parent())
            .ok_or_else(|| ShardStateError::NotSiblings(self.get_shard(), other.get_shard()))?;

        let mut hasher = Sha256::new();
        hasher.update(b"merge");
        hasher.update(self.root_hash);
        hasher.update(other.root_hash);
        let root_hash = hasher.finalize().into();

        let id = BlockIdExt {
            id: crate::shard::BlockId {
                shard: parent,
                seqno: self.get_seqno().max(other.get_seqno()),
            },
            root_hash,
            file_hash: root_hash,
        };

        Ok(ShardState {
            id,
            root_hash,
            before_split: false,
            queue: MessageQueue::merge(&self.queue, &other.queue),
        })
    }

    /// Splits this (parent) shard state into its two children.
    pub fn split(&self) -> Result<(ShardState, ShardState), ShardStateError> {
        if !self.before_split {
            return Err(ShardStateError::NotBeforeSplit);
        }
        let left_shard = self.get_shard().shard_child(true).unwrap();
        let right_shard = self.get_shard().shard_child(false).unwrap();
        let split_child = |shard: ShardIdent, tag: &str| {
            let mut hasher = Sha256::new();
            hasher.update(b"split");
            hasher.update(tag.as_bytes());
            hasher.update(self.root_hash);
            let root_hash: [u8; 32] = hasher.finalize().into();
            ShardState {
                id: BlockIdExt {
                    id: crate::shard::BlockId {
                        shard,
                        seqno: self.get_seqno(),
                    },
                    root_hash,
                    file_hash: root_hash,
                },
                root_hash,
                before_split: false,
                queue: self.queue.clone(),
            }
        };
        Ok((split_child(left_shard, "L"), split_child(right_shard, "R")))
    }

    /// Applies `block` to this state, producing the block's post-state.
    pub fn apply_block(&self, block: &Block) -> Result<ShardState, ShardStateError> {
        let header = block.header();
        if header.state_update.old_hash != self.root_hash {
            return Err(ShardStateError::WrongPrev {
                prev: self.id,
                applied: *block.id(),
            });
        }
        Ok(ShardState {
            id: *block.id(),
            root_hash: header.state_update.new_hash,
            before_split: header.want_split,
            queue: self.queue.clone(),
        })
    }
}
