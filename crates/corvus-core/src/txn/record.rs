//! Per-transaction record: identity, snapshot, read/write sets, state.

use std::collections::HashSet;

use crate::error::TxnError;
use crate::types::{Cid, TupleSlot, TxnId, INVALID_CID};

/// Transaction lifecycle state.
///
/// Legal transitions: `Active -> Committing -> Committed`,
/// `Active -> Aborted`, and `Committing -> Aborted` (validation failure).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committing,
    Committed,
    Aborted,
}

/// One entry of a transaction's write set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Insert { slot: TupleSlot },
    Update { old: TupleSlot, new: TupleSlot },
    Delete { old: TupleSlot, tombstone: TupleSlot },
}

/// The record for one transaction. Owned and mutated only by the session
/// driving the transaction; the manager borrows it for each operation.
#[derive(Debug)]
pub struct TransactionRecord {
    id: TxnId,
    begin_cid: Cid,
    end_cid: Cid,
    state: TxnState,
    read_set: HashSet<TupleSlot>,
    write_set: Vec<WriteOp>,
    is_read_only: bool,
}

impl TransactionRecord {
    pub fn new(id: TxnId, begin_cid: Cid) -> Self {
        Self {
            id,
            begin_cid,
            end_cid: INVALID_CID,
            state: TxnState::Active,
            read_set: HashSet::new(),
            write_set: Vec::new(),
            is_read_only: true,
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn begin_cid(&self) -> Cid {
        self.begin_cid
    }

    /// Commit id; `INVALID_CID` until drawn at commit.
    pub fn end_cid(&self) -> Cid {
        self.end_cid
    }

    pub fn set_end_cid(&mut self, cid: Cid) {
        self.end_cid = cid;
    }

    pub fn state(&self) -> TxnState {
        self.state
    }

    pub fn is_read_only(&self) -> bool {
        self.is_read_only
    }

    pub fn read_set(&self) -> impl Iterator<Item = TupleSlot> + '_ {
        self.read_set.iter().copied()
    }

    pub fn write_set(&self) -> &[WriteOp] {
        &self.write_set
    }

    /// Guard for read/write operations: only Active transactions may proceed.
    pub fn ensure_active(&self) -> Result<(), TxnError> {
        if self.state == TxnState::Active {
            Ok(())
        } else {
            Err(TxnError::TerminalState)
        }
    }

    pub fn transition(&mut self, to: TxnState) -> Result<(), TxnError> {
        let legal = matches!(
            (self.state, to),
            (TxnState::Active, TxnState::Committing)
                | (TxnState::Active, TxnState::Aborted)
                | (TxnState::Committing, TxnState::Committed)
                | (TxnState::Committing, TxnState::Aborted)
        );
        if !legal {
            return Err(TxnError::TerminalState);
        }
        self.state = to;
        Ok(())
    }

    pub fn record_read(&mut self, slot: TupleSlot) {
        self.read_set.insert(slot);
    }

    pub fn record_write(&mut self, op: WriteOp) {
        self.is_read_only = false;
        self.write_set.push(op);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_path() {
        let mut txn = TransactionRecord::new(1, 0);
        assert_eq!(txn.state(), TxnState::Active);
        txn.transition(TxnState::Committing).unwrap();
        txn.transition(TxnState::Committed).unwrap();
        assert_eq!(txn.state(), TxnState::Committed);
    }

    #[test]
    fn test_abort_from_active_and_committing() {
        let mut txn = TransactionRecord::new(1, 0);
        txn.transition(TxnState::Aborted).unwrap();

        let mut txn = TransactionRecord::new(2, 0);
        txn.transition(TxnState::Committing).unwrap();
        txn.transition(TxnState::Aborted).unwrap();
    }

    #[test]
    fn test_terminal_states_reject_everything() {
        let mut txn = TransactionRecord::new(1, 0);
        txn.transition(TxnState::Aborted).unwrap();
        assert!(matches!(txn.ensure_active(), Err(TxnError::TerminalState)));
        assert!(matches!(
            txn.transition(TxnState::Committing),
            Err(TxnError::TerminalState)
        ));
        assert!(matches!(
            txn.transition(TxnState::Committed),
            Err(TxnError::TerminalState)
        ));
    }

    #[test]
    fn test_write_clears_read_only() {
        let mut txn = TransactionRecord::new(1, 0);
        assert!(txn.is_read_only());
        txn.record_read(TupleSlot::new(0, 0));
        assert!(txn.is_read_only());
        txn.record_write(WriteOp::Insert {
            slot: TupleSlot::new(0, 1),
        });
        assert!(!txn.is_read_only());
        assert_eq!(txn.write_set().len(), 1);
    }

    #[test]
    fn test_read_set_deduplicates() {
        let mut txn = TransactionRecord::new(1, 0);
        txn.record_read(TupleSlot::new(0, 0));
        txn.record_read(TupleSlot::new(0, 0));
        assert_eq!(txn.read_set().count(), 1);
    }
}
