//! The versioned tuple store.
//!
//! An in-memory arena of fixed-capacity blocks. Every slot holds one tuple
//! version: a header of atomics (`txn_id`, `begin_cid`, `end_cid`, chain
//! links) and the row data behind a per-slot lock. Versions of one logical
//! row are linked by stable `TupleSlot` identifiers rather than owning
//! references; traversal is by lookup.
//!
//! Header mutation goes through the write-lock discipline: a writer CASes
//! its transaction id into `txn_id`, installs new versions, and the
//! transaction manager stamps commit ids (or reclaims) on completion.
//! Readers tolerate concurrent header writes under the visibility rules.

pub mod visibility;

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::catalog::TableInfo;
use crate::error::TxnError;
use crate::types::{Cid, TupleSlot, TxnId, BLOCK_CAPACITY, INVALID_CID, INVALID_TXN_ID, MAX_CID};
use crate::value::Value;

pub use visibility::Visibility;

/// A row: one value per column.
pub type Tuple = Vec<Value>;

/// Per-version header. All fields are atomics so readers never block.
#[derive(Debug)]
pub struct VersionHeader {
    txn_id: AtomicU64,
    begin_cid: AtomicU64,
    end_cid: AtomicU64,
    next: AtomicU64,
    prev: AtomicU64,
}

impl VersionHeader {
    fn fresh() -> Self {
        Self {
            txn_id: AtomicU64::new(INVALID_TXN_ID),
            begin_cid: AtomicU64::new(MAX_CID),
            end_cid: AtomicU64::new(MAX_CID),
            next: AtomicU64::new(TupleSlot::INVALID.pack()),
            prev: AtomicU64::new(TupleSlot::INVALID.pack()),
        }
    }

    pub fn txn_id(&self) -> TxnId {
        self.txn_id.load(Ordering::Acquire)
    }

    pub fn begin_cid(&self) -> Cid {
        self.begin_cid.load(Ordering::Acquire)
    }

    pub fn end_cid(&self) -> Cid {
        self.end_cid.load(Ordering::Acquire)
    }

    pub fn next(&self) -> TupleSlot {
        TupleSlot::unpack(self.next.load(Ordering::Acquire))
    }

    pub fn prev(&self) -> TupleSlot {
        TupleSlot::unpack(self.prev.load(Ordering::Acquire))
    }
}

/// A block of `BLOCK_CAPACITY` version slots belonging to one table.
#[derive(Debug)]
struct Block {
    table: crate::types::Oid,
    headers: Vec<VersionHeader>,
    tuples: Vec<RwLock<Option<Tuple>>>,
    allocated: AtomicU32,
}

impl Block {
    fn new(table: crate::types::Oid) -> Self {
        let capacity = BLOCK_CAPACITY as usize;
        let mut headers = Vec::with_capacity(capacity);
        let mut tuples = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            headers.push(VersionHeader::fresh());
            tuples.push(RwLock::new(None));
        }
        Self {
            table,
            headers,
            tuples,
            allocated: AtomicU32::new(0),
        }
    }

    /// Claim the next free slot, if any.
    fn try_allocate(&self) -> Option<u32> {
        let mut current = self.allocated.load(Ordering::Acquire);
        loop {
            if current >= BLOCK_CAPACITY {
                return None;
            }
            match self.allocated.compare_exchange(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(current),
                Err(observed) => current = observed,
            }
        }
    }
}

/// The shared tuple-version arena.
#[derive(Debug, Default)]
pub struct TupleStore {
    blocks: RwLock<Vec<Arc<Block>>>,
}

impl TupleStore {
    pub fn new() -> Self {
        Self {
            blocks: RwLock::new(Vec::new()),
        }
    }

    fn block(&self, id: u32) -> Arc<Block> {
        let blocks = self.blocks.read();
        Arc::clone(
            blocks
                .get(id as usize)
                .expect("tuple slot refers to an unallocated block"),
        )
    }

    fn with_header<R>(&self, slot: TupleSlot, f: impl FnOnce(&VersionHeader) -> R) -> R {
        let block = self.block(slot.block);
        f(&block.headers[slot.offset as usize])
    }

    /// Allocate a fresh slot for `table`, growing its block list as needed.
    /// The slot starts unowned with `begin = end = MAX_CID` and no data.
    pub fn allocate(&self, table: &TableInfo) -> TupleSlot {
        // Fast path: the table's newest block may have room. The guard is
        // dropped before touching the store-wide block list so the lock
        // order stays store blocks, then table blocks.
        let last = table.blocks.read().last().copied();
        if let Some(last) = last {
            let block = self.block(last);
            if let Some(offset) = block.try_allocate() {
                return TupleSlot::new(last, offset);
            }
        }

        // Slow path: append a new block. Lock order is store blocks, then
        // table blocks; `allocate` is the only place both are held.
        let mut blocks = self.blocks.write();
        let mut table_blocks = table.blocks.write();

        // Another thread may have appended while we waited.
        if let Some(&last) = table_blocks.last() {
            let block = Arc::clone(&blocks[last as usize]);
            if let Some(offset) = block.try_allocate() {
                return TupleSlot::new(last, offset);
            }
        }

        let id = blocks.len() as u32;
        let block = Arc::new(Block::new(table.oid));
        let offset = block
            .try_allocate()
            .expect("fresh block must have a free slot");
        blocks.push(block);
        table_blocks.push(id);
        TupleSlot::new(id, offset)
    }

    /// All allocated slots of `table`, in allocation order.
    pub fn table_slots(&self, table: &TableInfo) -> Vec<TupleSlot> {
        let block_ids: Vec<u32> = table.blocks.read().clone();
        let mut slots = Vec::new();
        for id in block_ids {
            let block = self.block(id);
            let allocated = block.allocated.load(Ordering::Acquire);
            for offset in 0..allocated {
                slots.push(TupleSlot::new(id, offset));
            }
        }
        slots
    }

    pub fn read_tuple(&self, slot: TupleSlot) -> Option<Tuple> {
        let block = self.block(slot.block);
        let value = block.tuples[slot.offset as usize].read().clone();
        value
    }

    pub fn write_tuple(&self, slot: TupleSlot, row: Tuple) {
        let block = self.block(slot.block);
        *block.tuples[slot.offset as usize].write() = Some(row);
    }

    /// Table oid a block belongs to (scan sanity checks).
    pub fn block_table(&self, block_id: u32) -> crate::types::Oid {
        self.block(block_id).table
    }

    // -----------------------------------------------------------------
    // Write-lock discipline
    // -----------------------------------------------------------------

    /// Mark `txn` as the writer of `slot`. Fails if another transaction
    /// currently owns it. Re-acquisition by the same transaction succeeds.
    pub fn acquire_write_lock(&self, slot: TupleSlot, txn: TxnId) -> Result<(), TxnError> {
        self.with_header(slot, |h| {
            match h.txn_id.compare_exchange(
                INVALID_TXN_ID,
                txn,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => Ok(()),
                Err(holder) if holder == txn => Ok(()),
                Err(_) => Err(TxnError::WriteWriteConflict(slot)),
            }
        })
    }

    /// Clear the writer mark if `txn` holds it.
    pub fn release_write_lock(&self, slot: TupleSlot, txn: TxnId) {
        self.with_header(slot, |h| {
            let _ = h.txn_id.compare_exchange(
                txn,
                INVALID_TXN_ID,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        });
    }

    /// Stamp `txn` as writer of a freshly allocated version.
    pub fn set_writer(&self, slot: TupleSlot, txn: TxnId) {
        self.with_header(slot, |h| h.txn_id.store(txn, Ordering::Release));
    }

    /// Mark a freshly allocated version as a pending delete.
    pub fn mark_tombstone(&self, slot: TupleSlot) {
        self.with_header(slot, |h| h.end_cid.store(INVALID_CID, Ordering::Release));
    }

    /// Link `new` as the successor version of `old`.
    pub fn install_new_version(&self, old: TupleSlot, new: TupleSlot) {
        self.with_header(old, |h| h.next.store(new.pack(), Ordering::Release));
        self.with_header(new, |h| h.prev.store(old.pack(), Ordering::Release));
    }

    // -----------------------------------------------------------------
    // Commit / abort stamping
    // -----------------------------------------------------------------

    pub fn stamp_begin(&self, slot: TupleSlot, cid: Cid) {
        self.with_header(slot, |h| h.begin_cid.store(cid, Ordering::Release));
    }

    pub fn stamp_end(&self, slot: TupleSlot, cid: Cid) {
        self.with_header(slot, |h| h.end_cid.store(cid, Ordering::Release));
    }

    pub fn unlink_next(&self, slot: TupleSlot) {
        self.with_header(slot, |h| {
            h.next.store(TupleSlot::INVALID.pack(), Ordering::Release)
        });
    }

    /// Return an aborted or superseded-tombstone slot to the never-visible
    /// state and drop its data.
    pub fn reclaim(&self, slot: TupleSlot) {
        let block = self.block(slot.block);
        let header = &block.headers[slot.offset as usize];
        header.begin_cid.store(MAX_CID, Ordering::Release);
        header.end_cid.store(MAX_CID, Ordering::Release);
        header.next.store(TupleSlot::INVALID.pack(), Ordering::Release);
        header.prev.store(TupleSlot::INVALID.pack(), Ordering::Release);
        header.txn_id.store(INVALID_TXN_ID, Ordering::Release);
        *block.tuples[slot.offset as usize].write() = None;
    }

    // -----------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------

    pub fn writer_of(&self, slot: TupleSlot) -> TxnId {
        self.with_header(slot, |h| h.txn_id())
    }

    pub fn begin_of(&self, slot: TupleSlot) -> Cid {
        self.with_header(slot, |h| h.begin_cid())
    }

    pub fn end_of(&self, slot: TupleSlot) -> Cid {
        self.with_header(slot, |h| h.end_cid())
    }

    pub fn next_version(&self, slot: TupleSlot) -> TupleSlot {
        self.with_header(slot, |h| h.next())
    }

    /// A chain head is the oldest version of a logical row. Sequential scans
    /// visit heads only and resolve each chain once.
    pub fn is_chain_head(&self, slot: TupleSlot) -> bool {
        self.with_header(slot, |h| !h.prev().is_valid())
    }

    /// Visibility of one version for `reader` at `snapshot`.
    pub fn visibility(&self, slot: TupleSlot, reader: TxnId, snapshot: Cid) -> Visibility {
        self.with_header(slot, |h| {
            visibility::check(h.txn_id(), h.begin_cid(), h.end_cid(), reader, snapshot)
        })
    }

    /// Walk the version chain rooted at `slot` toward newer versions and
    /// return the version visible to `reader` at `snapshot`, if any.
    pub fn visible_version(
        &self,
        slot: TupleSlot,
        reader: TxnId,
        snapshot: Cid,
    ) -> Option<TupleSlot> {
        let mut current = slot;
        while current.is_valid() {
            match self.visibility(current, reader, snapshot) {
                Visibility::Visible => return Some(current),
                Visibility::Deleted => return None,
                Visibility::Invisible => current = self.next_version(current),
            }
        }
        None
    }
}
