//! Strict two-phase locking.
//!
//! Reads take shared locks, writes take exclusive locks, and every lock is
//! held until commit or abort. Lock waits are bounded by the configured
//! deadline (`LockTimeout`); while blocked, each waiter maintains its edges
//! in a wait-for graph and periodically searches it, aborting itself with
//! `Deadlock` when it is the youngest member of a cycle it belongs to.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace, warn};

use crate::catalog::TableInfo;
use crate::error::TxnError;
use crate::storage::{Tuple, TupleStore};
use crate::types::{Cid, TupleSlot, TxnId};

use super::record::{TransactionRecord, TxnState};
use super::{discard_writes, install_delete, install_insert, install_update, publish_writes};

/// How often a blocked waiter re-runs the wait-for-graph cycle search.
const DEADLOCK_CHECK_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug, Default)]
struct LockEntry {
    shared: Vec<TxnId>,
    exclusive: Option<TxnId>,
}

#[derive(Debug, Default)]
struct LockTable {
    entries: HashMap<TupleSlot, LockEntry>,
    /// Locks held per transaction, for release at commit/abort.
    held: HashMap<TxnId, HashMap<TupleSlot, LockMode>>,
    /// waiter -> holders currently blocking it.
    waits_for: HashMap<TxnId, Vec<TxnId>>,
}

/// Slot-granularity lock manager with upgrade support.
#[derive(Debug)]
pub struct LockManager {
    table: Mutex<LockTable>,
    released: Condvar,
    timeout: Duration,
}

impl LockManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            table: Mutex::new(LockTable::default()),
            released: Condvar::new(),
            timeout,
        }
    }

    /// Acquire `mode` on `slot`, blocking up to the deadline.
    pub fn lock(&self, txn: TxnId, slot: TupleSlot, mode: LockMode) -> Result<(), TxnError> {
        let deadline = Instant::now() + self.timeout;
        let mut table = self.table.lock();
        loop {
            if Self::try_grant(&mut table, txn, slot, mode) {
                table.waits_for.remove(&txn);
                return Ok(());
            }

            let blockers = Self::blockers(&table, txn, slot);
            table.waits_for.insert(txn, blockers);

            if let Some(victim) = Self::cycle_victim(&table, txn) {
                if victim == txn {
                    table.waits_for.remove(&txn);
                    warn!(txn, %slot, "deadlock victim, aborting");
                    return Err(TxnError::Deadlock(txn));
                }
                // Another member is younger; it will detect and yield.
            }

            let now = Instant::now();
            if now >= deadline {
                table.waits_for.remove(&txn);
                debug!(txn, %slot, "lock wait deadline exceeded");
                return Err(TxnError::LockTimeout(slot));
            }
            let wait = DEADLOCK_CHECK_INTERVAL.min(deadline - now);
            let _ = self.released.wait_for(&mut table, wait);
        }
    }

    /// Release everything `txn` holds and wake all waiters.
    pub fn release_all(&self, txn: TxnId) {
        let mut table = self.table.lock();
        table.waits_for.remove(&txn);
        if let Some(held) = table.held.remove(&txn) {
            for slot in held.into_keys() {
                let empty = if let Some(entry) = table.entries.get_mut(&slot) {
                    entry.shared.retain(|t| *t != txn);
                    if entry.exclusive == Some(txn) {
                        entry.exclusive = None;
                    }
                    entry.shared.is_empty() && entry.exclusive.is_none()
                } else {
                    false
                };
                if empty {
                    table.entries.remove(&slot);
                }
            }
        }
        drop(table);
        self.released.notify_all();
    }

    fn try_grant(table: &mut LockTable, txn: TxnId, slot: TupleSlot, mode: LockMode) -> bool {
        let LockTable { entries, held, .. } = table;
        let entry = entries.entry(slot).or_default();
        match mode {
            LockMode::Shared => {
                if entry.exclusive.is_some() && entry.exclusive != Some(txn) {
                    return false;
                }
                if entry.exclusive != Some(txn) && !entry.shared.contains(&txn) {
                    entry.shared.push(txn);
                }
            }
            LockMode::Exclusive => {
                if entry.exclusive != Some(txn) {
                    let sole_reader = entry.shared.iter().all(|t| *t == txn);
                    if entry.exclusive.is_some() || !sole_reader {
                        return false;
                    }
                    // Upgrade: drop our shared grant, take exclusive.
                    entry.shared.retain(|t| *t != txn);
                    entry.exclusive = Some(txn);
                }
            }
        }
        let recorded = if entry.exclusive == Some(txn) {
            LockMode::Exclusive
        } else {
            LockMode::Shared
        };
        held.entry(txn).or_default().insert(slot, recorded);
        true
    }

    fn blockers(table: &LockTable, txn: TxnId, slot: TupleSlot) -> Vec<TxnId> {
        match table.entries.get(&slot) {
            Some(entry) => entry
                .exclusive
                .into_iter()
                .chain(entry.shared.iter().copied())
                .filter(|t| *t != txn)
                .collect(),
            None => Vec::new(),
        }
    }

    /// If `start` is on a wait-for cycle, return the youngest member.
    fn cycle_victim(table: &LockTable, start: TxnId) -> Option<TxnId> {
        fn walk(
            graph: &HashMap<TxnId, Vec<TxnId>>,
            node: TxnId,
            start: TxnId,
            visited: &mut HashSet<TxnId>,
            path: &mut Vec<TxnId>,
        ) -> bool {
            if let Some(edges) = graph.get(&node) {
                for &next in edges {
                    if next == start {
                        return true;
                    }
                    if visited.insert(next) {
                        path.push(next);
                        if walk(graph, next, start, visited, path) {
                            return true;
                        }
                        path.pop();
                    }
                }
            }
            false
        }

        let mut visited = HashSet::from([start]);
        let mut path = vec![start];
        if walk(&table.waits_for, start, start, &mut visited, &mut path) {
            path.into_iter().max()
        } else {
            None
        }
    }
}

/// The strict-2PL transaction manager.
#[derive(Debug)]
pub struct TplManager {
    store: Arc<TupleStore>,
    next_txn_id: AtomicU64,
    commit_clock: AtomicU64,
    locks: LockManager,
}

impl TplManager {
    pub fn new(store: Arc<TupleStore>, lock_wait_timeout: Duration) -> Self {
        Self {
            store,
            next_txn_id: AtomicU64::new(1),
            commit_clock: AtomicU64::new(0),
            locks: LockManager::new(lock_wait_timeout),
        }
    }

    pub fn begin_transaction(&self) -> TransactionRecord {
        let id = self.next_txn_id.fetch_add(1, Ordering::Relaxed);
        let begin_cid = self.commit_clock.load(Ordering::Acquire);
        trace!(txn = id, begin_cid, "begin");
        TransactionRecord::new(id, begin_cid)
    }

    /// Shared-lock the chain and read its latest committed version
    /// (lock-point semantics; the lock prevents later invalidation).
    pub fn read(
        &self,
        txn: &mut TransactionRecord,
        slot: TupleSlot,
    ) -> Result<Option<(TupleSlot, Tuple)>, TxnError> {
        txn.ensure_active()?;
        self.acquire(txn, slot, LockMode::Shared)?;
        loop {
            let snapshot = self.commit_clock.load(Ordering::Acquire);
            let version = match self.store.visible_version(slot, txn.id(), snapshot) {
                Some(v) => v,
                None => return Ok(None),
            };
            if version != slot {
                self.acquire(txn, version, LockMode::Shared)?;
            }
            // A writer may have committed between resolving and locking;
            // settle on a version that is stable under the lock.
            let recheck = self.commit_clock.load(Ordering::Acquire);
            if self.store.visible_version(slot, txn.id(), recheck) == Some(version) {
                txn.record_read(version);
                return Ok(self.store.read_tuple(version).map(|row| (version, row)));
            }
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
        self.acquire(txn, slot, LockMode::Exclusive)?;
        match install_update(&self.store, txn, table, slot, row) {
            Ok(new) => {
                // The fresh version is ours; lock it so the discipline is
                // uniform and release covers it.
                self.acquire(txn, new, LockMode::Exclusive)
            }
            Err(err) => {
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
        let slot = install_insert(&self.store, txn, table, row);
        self.acquire(txn, slot, LockMode::Exclusive)?;
        Ok(slot)
    }

    pub fn delete(
        &self,
        txn: &mut TransactionRecord,
        table: &TableInfo,
        slot: TupleSlot,
    ) -> Result<(), TxnError> {
        txn.ensure_active()?;
        self.acquire(txn, slot, LockMode::Exclusive)?;
        match install_delete(&self.store, txn, table, slot) {
            Ok(_) => Ok(()),
            Err(err) => {
                self.abort(txn);
                Err(err)
            }
        }
    }

    pub fn commit(&self, txn: &mut TransactionRecord) -> Result<Cid, TxnError> {
        txn.ensure_active()?;
        txn.transition(TxnState::Committing)?;

        let end_cid = if txn.is_read_only() {
            txn.begin_cid()
        } else {
            let cid = self.commit_clock.fetch_add(1, Ordering::AcqRel) + 1;
            txn.set_end_cid(cid);
            publish_writes(&self.store, txn, cid);
            cid
        };

        txn.transition(TxnState::Committed)?;
        self.locks.release_all(txn.id());
        trace!(txn = txn.id(), end_cid, "committed");
        Ok(end_cid)
    }

    pub fn abort(&self, txn: &mut TransactionRecord) {
        if !matches!(txn.state(), TxnState::Active | TxnState::Committing) {
            return;
        }
        discard_writes(&self.store, txn);
        let _ = txn.transition(TxnState::Aborted);
        self.locks.release_all(txn.id());
        trace!(txn = txn.id(), "aborted");
    }

    /// Lock acquisition that aborts the transaction on failure, so lock
    /// errors carry the abort with them like every other conflict path.
    fn acquire(
        &self,
        txn: &mut TransactionRecord,
        slot: TupleSlot,
        mode: LockMode,
    ) -> Result<(), TxnError> {
        match self.locks.lock(txn.id(), slot, mode) {
            Ok(()) => Ok(()),
            Err(err) => {
                self.abort(txn);
                Err(err)
            }
        }
    }
}
