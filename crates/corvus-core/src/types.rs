//! Core types: object ids, transaction ids, commit ids, tuple slots.

use std::time::Duration;

/// Catalog object identifier (tables, columns).
pub type Oid = u32;

/// Transaction identifier (monotonically increasing, process-wide unique).
pub type TxnId = u64;

/// Commit identifier drawn from the global commit clock.
pub type Cid = u64;

/// Sentinel transaction id: no transaction owns the tuple.
pub const INVALID_TXN_ID: TxnId = 0;

/// Sentinel commit id, below every real commit id.
pub const INVALID_CID: Cid = 0;

/// Largest commit id. Marks uncommitted version begins and open version ends.
pub const MAX_CID: Cid = u64::MAX;

/// Number of tuple slots per storage block.
pub const BLOCK_CAPACITY: u32 = 256;

/// Physical address of one tuple version: (block id, slot offset).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TupleSlot {
    pub block: u32,
    pub offset: u32,
}

impl TupleSlot {
    /// Sentinel slot used for absent chain links.
    pub const INVALID: TupleSlot = TupleSlot {
        block: u32::MAX,
        offset: u32::MAX,
    };

    pub fn new(block: u32, offset: u32) -> Self {
        Self { block, offset }
    }

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }

    /// Pack into a `u64` so chain links can live in atomics.
    pub fn pack(self) -> u64 {
        (u64::from(self.block) << 32) | u64::from(self.offset)
    }

    pub fn unpack(raw: u64) -> Self {
        Self {
            block: (raw >> 32) as u32,
            offset: raw as u32,
        }
    }
}

impl std::fmt::Display for TupleSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.block, self.offset)
    }
}

/// Concurrency-control strategy, selected once at process start.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CcStrategy {
    /// Optimistic (snapshot) concurrency control with commit-time validation.
    Occ,
    /// Strict two-phase locking.
    TwoPhase,
}

/// Concurrency-control configuration, fixed for the process lifetime.
#[derive(Debug, Clone)]
pub struct CcConfig {
    pub strategy: CcStrategy,
    /// OCC only: validate the read set at commit (serializable) instead of
    /// write-set-only validation (snapshot isolation).
    pub occ_serializable: bool,
    /// 2PL only: how long a lock request may block before `LockTimeout`.
    pub lock_wait_timeout: Duration,
}

impl Default for CcConfig {
    fn default() -> Self {
        Self {
            strategy: CcStrategy::Occ,
            occ_serializable: false,
            lock_wait_timeout: Duration::from_millis(5000),
        }
    }
}
