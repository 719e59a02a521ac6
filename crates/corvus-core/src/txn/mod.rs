//! Transaction management: records, version installation, and the two
//! concurrency-control strategies.
//!
//! The manager is selected once from [`CcConfig`] at server bootstrap and
//! plumbed through the traffic cop as an explicit context object. Both
//! strategies share the version-install and commit-stamping paths over the
//! tuple store; they differ in how conflicts are detected (commit-time
//! validation vs. blocking locks).

pub mod occ;
pub mod record;
pub mod tpl;

use std::sync::Arc;

use crate::catalog::TableInfo;
use crate::error::TxnError;
use crate::storage::{Tuple, TupleStore};
use crate::types::{CcConfig, CcStrategy, Cid, TupleSlot};

pub use occ::OccManager;
pub use record::{TransactionRecord, TxnState, WriteOp};
pub use tpl::TplManager;

/// The pluggable transaction manager.
#[derive(Debug)]
pub enum TransactionManager {
    Optimistic(OccManager),
    TwoPhase(TplManager),
}

impl TransactionManager {
    pub fn new(config: &CcConfig, store: Arc<TupleStore>) -> Self {
        match config.strategy {
            CcStrategy::Occ => {
                TransactionManager::Optimistic(OccManager::new(store, config.occ_serializable))
            }
            CcStrategy::TwoPhase => {
                TransactionManager::TwoPhase(TplManager::new(store, config.lock_wait_timeout))
            }
        }
    }

    pub fn strategy(&self) -> CcStrategy {
        match self {
            TransactionManager::Optimistic(_) => CcStrategy::Occ,
            TransactionManager::TwoPhase(_) => CcStrategy::TwoPhase,
        }
    }

    pub fn begin_transaction(&self) -> TransactionRecord {
        match self {
            TransactionManager::Optimistic(m) => m.begin_transaction(),
            TransactionManager::TwoPhase(m) => m.begin_transaction(),
        }
    }

    pub fn commit_transaction(&self, txn: &mut TransactionRecord) -> Result<Cid, TxnError> {
        match self {
            TransactionManager::Optimistic(m) => m.commit(txn),
            TransactionManager::TwoPhase(m) => m.commit(txn),
        }
    }

    pub fn abort_transaction(&self, txn: &mut TransactionRecord) {
        match self {
            TransactionManager::Optimistic(m) => m.abort(txn),
            TransactionManager::TwoPhase(m) => m.abort(txn),
        }
    }

    /// Read the version of the chain rooted at `slot` that this transaction
    /// observes. Returns the resolved version slot alongside the row.
    pub fn read(
        &self,
        txn: &mut TransactionRecord,
        slot: TupleSlot,
    ) -> Result<Option<(TupleSlot, Tuple)>, TxnError> {
        match self {
            TransactionManager::Optimistic(m) => m.read(txn, slot),
            TransactionManager::TwoPhase(m) => m.read(txn, slot),
        }
    }

    pub fn write(
        &self,
        txn: &mut TransactionRecord,
        table: &TableInfo,
        slot: TupleSlot,
        row: Tuple,
    ) -> Result<(), TxnError> {
        match self {
            TransactionManager::Optimistic(m) => m.write(txn, table, slot, row),
            TransactionManager::TwoPhase(m) => m.write(txn, table, slot, row),
        }
    }

    pub fn insert(
        &self,
        txn: &mut TransactionRecord,
        table: &TableInfo,
        row: Tuple,
    ) -> Result<TupleSlot, TxnError> {
        match self {
            TransactionManager::Optimistic(m) => m.insert(txn, table, row),
            TransactionManager::TwoPhase(m) => m.insert(txn, table, row),
        }
    }

    pub fn delete(
        &self,
        txn: &mut TransactionRecord,
        table: &TableInfo,
        slot: TupleSlot,
    ) -> Result<(), TxnError> {
        match self {
            TransactionManager::Optimistic(m) => m.delete(txn, table, slot),
            TransactionManager::TwoPhase(m) => m.delete(txn, table, slot),
        }
    }
}

// ---------------------------------------------------------------------
// Version installation and completion, shared by both strategies.
// ---------------------------------------------------------------------

/// Install a fresh insert: new chain head, invisible until commit.
fn install_insert(store: &TupleStore, txn: &mut TransactionRecord, table: &TableInfo, row: Tuple) -> TupleSlot {
    let slot = store.allocate(table);
    store.write_tuple(slot, row);
    store.set_writer(slot, txn.id());
    txn.record_write(WriteOp::Insert { slot });
    slot
}

/// Lock `old` and link a new version carrying `row` behind it.
fn install_update(
    store: &TupleStore,
    txn: &mut TransactionRecord,
    table: &TableInfo,
    old: TupleSlot,
    row: Tuple,
) -> Result<TupleSlot, TxnError> {
    store.acquire_write_lock(old, txn.id())?;
    let new = store.allocate(table);
    store.write_tuple(new, row);
    store.set_writer(new, txn.id());
    store.install_new_version(old, new);
    txn.record_write(WriteOp::Update { old, new });
    Ok(new)
}

/// Lock `old` and link an empty tombstone version marking the pending delete.
fn install_delete(
    store: &TupleStore,
    txn: &mut TransactionRecord,
    table: &TableInfo,
    old: TupleSlot,
) -> Result<TupleSlot, TxnError> {
    store.acquire_write_lock(old, txn.id())?;
    let tombstone = store.allocate(table);
    store.set_writer(tombstone, txn.id());
    store.mark_tombstone(tombstone);
    store.install_new_version(old, tombstone);
    txn.record_write(WriteOp::Delete { old, tombstone });
    Ok(tombstone)
}

/// Make all of a transaction's new versions visible at `end_cid` and release
/// its tuple write locks. Old versions are invalidated before new versions
/// are activated so no snapshot ever observes two versions of one row.
fn publish_writes(store: &TupleStore, txn: &TransactionRecord, end_cid: Cid) {
    for op in txn.write_set() {
        match *op {
            WriteOp::Insert { slot } => {
                store.stamp_begin(slot, end_cid);
                store.release_write_lock(slot, txn.id());
            }
            WriteOp::Update { old, new } => {
                store.stamp_end(old, end_cid);
                store.stamp_begin(new, end_cid);
                store.release_write_lock(old, txn.id());
                store.release_write_lock(new, txn.id());
            }
            WriteOp::Delete { old, tombstone } => {
                store.stamp_end(old, end_cid);
                store.unlink_next(old);
                store.reclaim(tombstone);
                store.release_write_lock(old, txn.id());
            }
        }
    }
}

/// Undo all of a transaction's installed versions, newest first.
fn discard_writes(store: &TupleStore, txn: &TransactionRecord) {
    for op in txn.write_set().iter().rev() {
        match *op {
            WriteOp::Insert { slot } => {
                store.reclaim(slot);
            }
            WriteOp::Update { old, new } => {
                store.reclaim(new);
                store.unlink_next(old);
                store.release_write_lock(old, txn.id());
            }
            WriteOp::Delete { old, tombstone } => {
                store.reclaim(tombstone);
                store.unlink_next(old);
                store.release_write_lock(old, txn.id());
            }
        }
    }
}
