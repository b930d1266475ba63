use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::shard::BlockIdExt;

/// Bits local to this process, never part of the wire record: `processed`
/// is re-derived on restart from `is_applied`, `handle_moved_to_archive` is
/// an in-memory bookkeeping bit for the GC sweep.
const F_LOCAL_ONLY: u32 = F_PROCESSED | F_HANDLE_MOVED_TO_ARCHIVE;

const F_INITED_PREV_LEFT: u32 = 1 << 0;
const F_INITED_PREV_RIGHT: u32 = 1 << 1;
const F_INITED_NEXT_LEFT: u32 = 1 << 2;
const F_INITED_NEXT_RIGHT: u32 = 1 << 3;
const F_INITED_SPLIT_AFTER: u32 = 1 << 4;
const F_SPLIT_AFTER: u32 = 1 << 5;
const F_INITED_MERGE_BEFORE: u32 = 1 << 6;
const F_MERGE_BEFORE: u32 = 1 << 7;
const F_RECEIVED: u32 = 1 << 8;
const F_INITED_IS_KEY_BLOCK: u32 = 1 << 9;
const F_IS_KEY_BLOCK: u32 = 1 << 10;
const F_INITED_PROOF: u32 = 1 << 11;
const F_INITED_PROOF_LINK: u32 = 1 << 12;
const F_INITED_LT: u32 = 1 << 13;
const F_INITED_TS: u32 = 1 << 14;
const F_INITED_STATE: u32 = 1 << 15;
const F_INITED_SIGNATURES: u32 = 1 << 16;
const F_INITED_STATE_BOC: u32 = 1 << 17;
const F_ARCHIVED: u32 = 1 << 18;
const F_APPLIED: u32 = 1 << 19;
const F_INITED_MC_REF_BLOCK: u32 = 1 << 20;
const F_DELETED: u32 = 1 << 21;
const F_DELETED_STATE_BOC: u32 = 1 << 22;
const F_MOVED_TO_ARCHIVE: u32 = 1 << 23;
const F_PROCESSED: u32 = 1 << 24;
const F_HANDLE_MOVED_TO_ARCHIVE: u32 = 1 << 25;

/// The self-describing metadata record `BlockHandle::serialize` emits:
/// block id, flag bits (excluding the local-only ones), each prev/next
/// pointer present only if inited, logical time, unix time, state root
/// hash, and masterchain-ref-seqno.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandleRecord {
    pub id: BlockIdExt,
    pub flags: u32,
    pub prev_left: Option<BlockIdExt>,
    pub prev_right: Option<BlockIdExt>,
    pub next_left: Option<BlockIdExt>,
    pub next_right: Option<BlockIdExt>,
    pub lt: u64,
    pub ts: u32,
    pub state_root_hash: [u8; 32],
    pub masterchain_ref_seqno: u32,
}

#[derive(Debug, Error)]
pub enum HandleError {
    #[error("field already inited with a different value on block {0}")]
    Conflict(BlockIdExt),
    #[error("field read before its inited flag was observed set on block {0}")]
    NotInited(BlockIdExt),
}

#[derive(Debug, Default)]
struct Inner {
    prev: [Option<BlockIdExt>; 2],
    next: [Option<BlockIdExt>; 2],
    lt: u64,
    ts: u32,
    state_root_hash: [u8; 32],
    masterchain_ref_seqno: u32,
}

/// The mutable, atomically-flushed metadata record for one block.
///
/// Flags live in a single `AtomicU32` for lock-free boolean reads; the
/// handful of typed fields that accompany a flag live behind a short-held
/// mutex. `version`/`written_version` track flush coalescing: many setters
/// may run between two flushes, but only the latest version need ever be
/// persisted.
#[derive(Debug)]
pub struct BlockHandle {
    id: BlockIdExt,
    flags: AtomicU32,
    version: AtomicU32,
    written_version: AtomicU32,
    inner: Mutex<Inner>,
}

impl BlockHandle {
    pub fn new(id: BlockIdExt) -> Self {
        Self {
            id,
            flags: AtomicU32::new(0),
            version: AtomicU32::new(0),
            written_version: AtomicU32::new(0),
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn id(&self) -> BlockIdExt {
        self.id
    }

    /// Emits the self-describing metadata record storage persists. Reads
    /// the flag word and the field-group lock once each; brief, bounded by
    /// concurrent setters.
    pub fn serialize(&self) -> HandleRecord {
        let flags = self.flags() & !F_LOCAL_ONLY;
        let inner = self.inner.lock();
        HandleRecord {
            id: self.id,
            flags,
            prev_left: inner.prev[0],
            prev_right: inner.prev[1],
            next_left: inner.next[0],
            next_right: inner.next[1],
            lt: inner.lt,
            ts: inner.ts,
            state_root_hash: inner.state_root_hash,
            masterchain_ref_seqno: inner.masterchain_ref_seqno,
        }
    }

    /// Reconstructs a handle from a previously-serialized record. The
    /// local-only bits start clear, same as a freshly-created handle; the
    /// version counters start at zero since a just-loaded handle has
    /// nothing pending to flush.
    pub fn deserialize(record: HandleRecord) -> Self {
        Self {
            id: record.id,
            flags: AtomicU32::new(record.flags & !F_LOCAL_ONLY),
            version: AtomicU32::new(0),
            written_version: AtomicU32::new(0),
            inner: Mutex::new(Inner {
                prev: [record.prev_left, record.prev_right],
                next: [record.next_left, record.next_right],
                lt: record.lt,
                ts: record.ts,
                state_root_hash: record.state_root_hash,
                masterchain_ref_seqno: record.masterchain_ref_seqno,
            }),
        }
    }

    fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    fn has(&self, bit: u32) -> bool {
        self.flags() & bit != 0
    }

    pub fn is_zero(&self) -> bool {
        self.id.seqno() == 0
    }

    pub fn received(&self) -> bool {
        self.has(F_RECEIVED)
    }

    pub fn moved_to_archive(&self) -> bool {
        self.has(F_MOVED_TO_ARCHIVE)
    }

    pub fn handle_moved_to_archive(&self) -> bool {
        self.has(F_HANDLE_MOVED_TO_ARCHIVE)
    }

    pub fn deleted(&self) -> bool {
        self.has(F_DELETED)
    }

    pub fn inited_next_left(&self) -> bool {
        self.has(F_INITED_NEXT_LEFT)
    }

    pub fn inited_next_right(&self) -> bool {
        self.has(F_INITED_NEXT_RIGHT)
    }

    /// True once the left-next exists and either the right-next exists too,
    /// or the block is known not to split.
    pub fn inited_next(&self) -> bool {
        let f = self.flags();
        if f & F_INITED_NEXT_LEFT == 0 {
            return false;
        }
        if f & F_INITED_NEXT_RIGHT != 0 {
            return true;
        }
        f & F_INITED_SPLIT_AFTER != 0 && f & F_SPLIT_AFTER == 0
    }

    pub fn inited_prev_left(&self) -> bool {
        self.has(F_INITED_PREV_LEFT)
    }

    pub fn inited_prev_right(&self) -> bool {
        self.has(F_INITED_PREV_RIGHT)
    }

    pub fn inited_prev(&self) -> bool {
        let f = self.flags();
        if f & F_INITED_PREV_LEFT == 0 {
            return false;
        }
        if f & F_INITED_PREV_RIGHT != 0 {
            return true;
        }
        f & F_INITED_MERGE_BEFORE != 0 && f & F_MERGE_BEFORE == 0
    }

    pub fn inited_proof(&self) -> bool {
        self.has(F_INITED_PROOF)
    }

    pub fn inited_proof_link(&self) -> bool {
        self.has(F_INITED_PROOF_LINK)
    }

    pub fn inited_signatures(&self) -> bool {
        self.has(F_INITED_SIGNATURES)
    }

    pub fn inited_split_after(&self) -> bool {
        self.has(F_INITED_SPLIT_AFTER)
    }

    pub fn inited_merge_before(&self) -> bool {
        self.has(F_INITED_MERGE_BEFORE)
    }

    pub fn inited_is_key_block(&self) -> bool {
        self.has(F_INITED_IS_KEY_BLOCK)
    }

    pub fn split_after(&self) -> Result<bool, HandleError> {
        self.require(F_INITED_SPLIT_AFTER)?;
        Ok(self.has(F_SPLIT_AFTER))
    }

    pub fn merge_before(&self) -> Result<bool, HandleError> {
        self.require(F_INITED_MERGE_BEFORE)?;
        Ok(self.has(F_MERGE_BEFORE))
    }

    pub fn is_key_block(&self) -> Result<bool, HandleError> {
        self.require(F_INITED_IS_KEY_BLOCK)?;
        Ok(self.has(F_IS_KEY_BLOCK))
    }

    pub fn inited_state_root_hash(&self) -> bool {
        self.has(F_INITED_STATE)
    }

    pub fn inited_state_boc(&self) -> bool {
        self.has(F_INITED_STATE_BOC)
    }

    pub fn received_state(&self) -> bool {
        self.has(F_INITED_STATE_BOC)
    }

    pub fn deleted_state_boc(&self) -> bool {
        self.has(F_DELETED_STATE_BOC)
    }

    pub fn need_flush(&self) -> bool {
        self.written_version.load(Ordering::Acquire) < self.version()
    }

    pub fn is_archived(&self) -> bool {
        self.has(F_ARCHIVED)
    }

    pub fn is_applied(&self) -> bool {
        self.has(F_APPLIED)
    }

    pub fn inited_masterchain_ref_block(&self) -> bool {
        self.id.is_masterchain() || self.has(F_INITED_MC_REF_BLOCK)
    }

    pub fn masterchain_ref_block(&self) -> Result<u32, HandleError> {
        if self.id.is_masterchain() {
            return Ok(self.id.seqno());
        }
        self.require(F_INITED_MC_REF_BLOCK)?;
        Ok(self.inner.lock().masterchain_ref_seqno)
    }

    /// One or two predecessor ids, depending on `merge_before`. Empty for a
    /// zerostate.
    pub fn prev(&self) -> Result<Vec<BlockIdExt>, HandleError> {
        if self.is_zero() {
            return Ok(Vec::new());
        }
        self.require(F_INITED_MERGE_BEFORE)?;
        let inner = self.inner.lock();
        if !self.has(F_MERGE_BEFORE) {
            self.require(F_INITED_PREV_LEFT)?;
            Ok(vec![inner.prev[0].unwrap()])
        } else {
            self.require(F_INITED_PREV_LEFT)?;
            self.require(F_INITED_PREV_RIGHT)?;
            Ok(vec![inner.prev[0].unwrap(), inner.prev[1].unwrap()])
        }
    }

    pub fn one_prev(&self, left: bool) -> Result<BlockIdExt, HandleError> {
        self.require(if left { F_INITED_PREV_LEFT } else { F_INITED_PREV_RIGHT })?;
        Ok(self.inner.lock().prev[if left { 0 } else { 1 }].unwrap())
    }

    /// One or two successor ids, depending on `split_after`.
    pub fn next(&self) -> Result<Vec<BlockIdExt>, HandleError> {
        self.require(F_INITED_SPLIT_AFTER)?;
        let inner = self.inner.lock();
        if !self.has(F_SPLIT_AFTER) {
            self.require(F_INITED_NEXT_LEFT)?;
            Ok(vec![inner.next[0].unwrap()])
        } else {
            self.require(F_INITED_NEXT_LEFT)?;
            self.require(F_INITED_NEXT_RIGHT)?;
            Ok(vec![inner.next[0].unwrap(), inner.next[1].unwrap()])
        }
    }

    pub fn one_next(&self, left: bool) -> Result<BlockIdExt, HandleError> {
        self.require(if left { F_INITED_NEXT_LEFT } else { F_INITED_NEXT_RIGHT })?;
        Ok(self.inner.lock().next[if left { 0 } else { 1 }].unwrap())
    }

    pub fn state_root_hash(&self) -> Result<[u8; 32], HandleError> {
        self.require(F_INITED_STATE)?;
        Ok(self.inner.lock().state_root_hash)
    }

    pub fn processed(&self) -> bool {
        self.has(F_PROCESSED)
    }

    /// Does not bump `version`: purely local to this process, never flushed.
    pub fn set_processed(&self) {
        self.flags.fetch_or(F_PROCESSED, Ordering::AcqRel);
    }

    pub fn version(&self) -> u32 {
        self.version.load(Ordering::Acquire)
    }

    pub fn flushed_upto(&self, version: u32) {
        self.written_version.fetch_max(version, Ordering::AcqRel);
    }

    pub fn inited_logical_time(&self) -> bool {
        self.has(F_INITED_LT)
    }

    pub fn logical_time(&self) -> Result<u64, HandleError> {
        self.require(F_INITED_LT)?;
        Ok(self.inner.lock().lt)
    }

    pub fn set_logical_time(&self, lt: u64) -> Result<(), HandleError> {
        let mut inner = self.inner.lock();
        if self.has(F_INITED_LT) {
            return if inner.lt == lt { Ok(()) } else { Err(HandleError::Conflict(self.id)) };
        }
        inner.lt = lt;
        drop(inner);
        self.commit(F_INITED_LT);
        Ok(())
    }

    pub fn inited_unix_time(&self) -> bool {
        self.has(F_INITED_TS)
    }

    pub fn unix_time(&self) -> Result<u32, HandleError> {
        self.require(F_INITED_TS)?;
        Ok(self.inner.lock().ts)
    }

    pub fn set_unix_time(&self, ts: u32) -> Result<(), HandleError> {
        let mut inner = self.inner.lock();
        if self.has(F_INITED_TS) {
            return if inner.ts == ts { Ok(()) } else { Err(HandleError::Conflict(self.id)) };
        }
        inner.ts = ts;
        drop(inner);
        self.commit(F_INITED_TS);
        Ok(())
    }

    pub fn set_proof(&self) {
        self.commit_once(F_INITED_PROOF);
    }

    pub fn set_proof_link(&self) {
        self.commit_once(F_INITED_PROOF_LINK);
    }

    pub fn set_signatures(&self) {
        self.commit_once(F_INITED_SIGNATURES);
    }

    fn set_prev_slot(&self, left: bool, prev: BlockIdExt) -> Result<(), HandleError> {
        let bit = if left { F_INITED_PREV_LEFT } else { F_INITED_PREV_RIGHT };
        let idx = if left { 0 } else { 1 };
        let mut inner = self.inner.lock();
        if self.has(bit) {
            return if inner.prev[idx] == Some(prev) {
                Ok(())
            } else {
                Err(HandleError::Conflict(self.id))
            };
        }
        inner.prev[idx] = Some(prev);
        drop(inner);
        self.commit(bit);
        Ok(())
    }

    /// Routes to the left or right predecessor slot depending on which child
    /// of this handle's shard `prev` belongs to.
    pub fn set_prev(&self, prev: BlockIdExt) -> Result<(), HandleError> {
        let right = self.id.shard().shard_child(false) == Some(prev.shard());
        self.set_prev_slot(!right, prev)
    }

    fn set_next_slot(&self, left: bool, next: BlockIdExt) -> Result<(), HandleError> {
        let bit = if left { F_INITED_NEXT_LEFT } else { F_INITED_NEXT_RIGHT };
        let idx = if left { 0 } else { 1 };
        let mut inner = self.inner.lock();
        if self.has(bit) {
            return if inner.next[idx] == Some(next) {
                Ok(())
            } else {
                Err(HandleError::Conflict(self.id))
            };
        }
        inner.next[idx] = Some(next);
        drop(inner);
        self.commit(bit);
        Ok(())
    }

    pub fn set_next(&self, next: BlockIdExt) -> Result<(), HandleError> {
        let right = self.id.shard().shard_child(false) == Some(next.shard());
        self.set_next_slot(!right, next)
    }

    pub fn set_received(&self) {
        self.commit_once(F_RECEIVED);
    }

    pub fn set_moved_to_archive(&self) {
        self.commit_once(F_MOVED_TO_ARCHIVE);
    }

    /// Does not bump `version`: local-only, never flushed or read by peers.
    pub fn set_handle_moved_to_archive(&self) {
        self.flags.fetch_or(F_HANDLE_MOVED_TO_ARCHIVE, Ordering::AcqRel);
    }

    pub fn set_deleted(&self) {
        self.commit_once(F_DELETED);
    }

    pub fn set_split(&self, value: bool) -> Result<(), HandleError> {
        self.set_tristate(F_INITED_SPLIT_AFTER, F_SPLIT_AFTER, value)
    }

    pub fn set_merge(&self, value: bool) -> Result<(), HandleError> {
        self.set_tristate(F_INITED_MERGE_BEFORE, F_MERGE_BEFORE, value)
    }

    pub fn set_is_key_block(&self, value: bool) -> Result<(), HandleError> {
        self.set_tristate(F_INITED_IS_KEY_BLOCK, F_IS_KEY_BLOCK, value)
    }

    pub fn set_state_root_hash(&self, hash: [u8; 32]) -> Result<(), HandleError> {
        let mut inner = self.inner.lock();
        if self.has(F_INITED_STATE) {
            return if inner.state_root_hash == hash {
                Ok(())
            } else {
                Err(HandleError::Conflict(self.id))
            };
        }
        inner.state_root_hash = hash;
        drop(inner);
        self.commit(F_INITED_STATE);
        Ok(())
    }

    pub fn set_state_boc(&self) -> Result<(), HandleError> {
        if self.inited_state_boc() {
            return Ok(());
        }
        self.require(F_INITED_STATE)?;
        self.commit(F_INITED_STATE_BOC);
        Ok(())
    }

    pub fn set_deleted_state_boc(&self) {
        self.commit_once(F_DELETED_STATE_BOC);
    }

    pub fn set_archived(&self) {
        self.commit_once(F_ARCHIVED);
    }

    pub fn set_applied(&self) {
        self.commit_once(F_APPLIED);
    }

    pub fn set_masterchain_ref_block(&self, seqno: u32) -> Result<(), HandleError> {
        if self.inited_masterchain_ref_block() {
            return Ok(());
        }
        let mut inner = self.inner.lock();
        inner.masterchain_ref_seqno = seqno;
        drop(inner);
        self.commit(F_INITED_MC_REF_BLOCK);
        Ok(())
    }

    /// Admin-only: clears `applied`, breaking the otherwise-monotone
    /// invariant. Only for operator-triggered recovery.
    pub fn unsafe_clear_applied(&self) {
        if self.is_applied() {
            self.flags.fetch_and(!F_APPLIED, Ordering::AcqRel);
            self.bump_version();
        }
    }

    /// Admin-only: forgets both next pointers, e.g. to let a corrupted
    /// successor be re-derived.
    pub fn unsafe_clear_next(&self) {
        if self.inited_next_left() || self.inited_next_right() {
            self.flags.fetch_and(!(F_INITED_NEXT_LEFT | F_INITED_NEXT_RIGHT), Ordering::AcqRel);
            self.bump_version();
        }
    }

    fn require(&self, bit: u32) -> Result<(), HandleError> {
        if self.has(bit) {
            Ok(())
        } else {
            Err(HandleError::NotInited(self.id))
        }
    }

    fn set_tristate(&self, inited_bit: u32, value_bit: u32, value: bool) -> Result<(), HandleError> {
        let f = self.flags();
        if f & inited_bit != 0 {
            return if (f & value_bit != 0) == value {
                Ok(())
            } else {
                Err(HandleError::Conflict(self.id))
            };
        }
        let set_bits = inited_bit | if value { value_bit } else { 0 };
        self.flags.fetch_or(set_bits, Ordering::AcqRel);
        self.bump_version();
        Ok(())
    }

    fn commit(&self, bit: u32) {
        self.flags.fetch_or(bit, Ordering::AcqRel);
        self.bump_version();
    }

    fn commit_once(&self, bit: u32) {
        if self.flags() & bit == 0 {
            self.commit(bit);
        }
    }

    fn bump_version(&self) {
        self.version.fetch_add(1, Ordering::AcqRel);
    }
}

impl Drop for BlockHandle {
    fn drop(&mut self) {
        debug_assert!(!self.need_flush(), "block handle {} dropped with unflushed version", self.id);
    }
}
