//! Optimistic (snapshot) concurrency control.
//!
//! Reads observe the snapshot taken at begin and never block. Writes take
//! the tuple write lock immediately (first writer wins); conflicts and
//! stale reads are detected at commit, linearized on the atomic draw of
//! the commit id.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::catalog::TableInfo;
use crate::error::TxnError;
use crate::storage::{Tuple, TupleStore};
use crate::types::{Cid, TupleSlot, INVALID_CID, MAX_CID};

use super::record::{TransactionRecord, TxnState, WriteOp};
use super::{discard_writes, install_delete, install_insert, install_update, publish_writes};

#[derive(Debug)]
pub struct OccManager {
    store: Arc<TupleStore>,
    next_txn_id: AtomicU64,
    /// The commit clock: last committed cid. Begins snapshot it, commits
    /// draw from it.
    commit_clock: AtomicU64,
    /// Validate the read set at commit (serializable) instead of the write
    /// set only (snapshot isolation). Fixed at construction.
    validate_reads: bool,
}

impl OccManager {
    pub fn new(store: Arc<TupleStore>, validate_reads: bool) -> Self {
        Self {
            store,
            next_txn_id: AtomicU64::new(1),
            commit_clock: AtomicU64::new(0),
            validate_reads,
        }
    }

    pub fn validates_reads(&self) -> bool {
        self.validate_reads
    }

    /// Last committed cid; the snapshot new transactions observe.
    pub fn current_cid(&self) -> Cid {
        self.commit_clock.load(Ordering::Acquire)
    }

    pub fn begin_transaction(&self) -> TransactionRecord {
        let id = self.next_txn_id.fetch_add(1, Ordering::Relaxed);
        let begin_cid = self.commit_clock.load(Ordering::Acquire);
        trace!(txn = id, begin_cid, "begin");
        TransactionRecord::new(id, begin_cid)
    }

    pub fn read(
        &self,
        txn: &mut TransactionRecord,
        slot: TupleSlot,
    ) -> Result<Option<(TupleSlot, Tuple)>, TxnError> {
        txn.ensure_active()?;
        match self
            .store
            .visible_version(slot, txn.id(), txn.begin_cid())
        {
            Some(version) => {
                txn.record_read(version);
                Ok(self.store.read_tuple(version).map(|row| (version, row)))
            }
            None => Ok(None),
        }
    }

    pub fn write(
        &self,
        txn: &mut TransactionRecord,
        table: &TableInfo,
        slot: TupleSlot,
        row: Tuple,
    ) -> Result<(), TxnError> {
        txn.ensure_active()?;
        match install_update(&self.store, txn, table, slot, row) {
            Ok(_) => Ok(()),
            Err(err) => {
                debug!(txn = txn.id(), %slot, "write conflict, aborting");
                self.abort(txn);
                Err(err)
            }
        }
    }

    pub fn insert(
        &self,
        txn: &mut TransactionRecord,
        table: &TableInfo,
        row: Tuple,
    ) -> Result<TupleSlot, TxnError> {
        txn.ensure_active()?;
        Ok(install_insert(&self.store, txn, table, row))
    }

    pub fn delete(
        &self,
        txn: &mut TransactionRecord,
        table: &TableInfo,
        slot: TupleSlot,
    ) -> Result<(), TxnError> {
        txn.ensure_active()?;
        match install_delete(&self.store, txn, table, slot) {
            Ok(_) => Ok(()),
            Err(err) => {
                debug!(txn = txn.id(), %slot, "delete conflict, aborting");
                self.abort(txn);
                Err(err)
            }
        }
    }

    pub fn commit(&self, txn: &mut TransactionRecord) -> Result<Cid, TxnError> {
        txn.ensure_active()?;
        txn.transition(TxnState::Committing)?;

        if txn.is_read_only() {
            txn.transition(TxnState::Committed)?;
            return Ok(txn.begin_cid());
        }

        let end_cid = self.commit_clock.fetch_add(1, Ordering::AcqRel) + 1;
        txn.set_end_cid(end_cid);

        if let Some(err) = self.validate(txn, end_cid) {
            debug!(txn = txn.id(), end_cid, %err, "validation failed, aborting");
            discard_writes(&self.store, txn);
            let _ = txn.transition(TxnState::Aborted);
            return Err(err);
        }

        publish_writes(&self.store, txn, end_cid);
        txn.transition(TxnState::Committed)?;
        trace!(txn = txn.id(), end_cid, "committed");
        Ok(end_cid)
    }

    /// Commit-time validation. The write set check confirms no competing
    /// commit invalidated a version we overwrote inside our
    /// `(begin_cid, end_cid)` window; with the write lock held since the
    /// write this is also an internal consistency check. The read set check
    /// (serializable mode) rejects any observed version invalidated inside
    /// the window.
    fn validate(&self, txn: &TransactionRecord, end_cid: Cid) -> Option<TxnError> {
        for op in txn.write_set() {
            let old = match *op {
                WriteOp::Update { old, .. } | WriteOp::Delete { old, .. } => old,
                WriteOp::Insert { .. } => continue,
            };
            let end = self.store.end_of(old);
            if end != MAX_CID && end > txn.begin_cid() && end < end_cid {
                return Some(TxnError::WriteValidationFailed(old));
            }
        }

        if self.validate_reads {
            for slot in txn.read_set() {
                if self.store.writer_of(slot) == txn.id() {
                    // We invalidated it ourselves.
                    continue;
                }
                let end = self.store.end_of(slot);
                if end != MAX_CID
                    && end != INVALID_CID
                    && end > txn.begin_cid()
                    && end < end_cid
                {
                    return Some(TxnError::ReadValidationFailed(slot));
                }
            }
        }
        None
    }

    pub fn abort(&self, txn: &mut TransactionRecord) {
        if !matches!(txn.state(), TxnState::Active | TxnState::Committing) {
            return;
        }
        discard_writes(&self.store, txn);
        let _ = txn.transition(TxnState::Aborted);
        trace!(txn = txn.id(), "aborted");
    }
}
