//! Version visibility rules.
//!
//! A version carries `begin_cid`/`end_cid` stamps delimiting the snapshots
//! it is visible to, plus the id of the transaction currently writing it
//! (0 if none). A committed version is visible to a snapshot `s` when
//! `begin_cid <= s < end_cid`. Uncommitted versions (`begin_cid = MAX_CID`)
//! are visible only to their writer; a pending delete is marked by
//! `end_cid = INVALID_CID` on the writer's tombstone version. Readers never
//! block: a foreign writer id means "invisible, keep walking".

use crate::types::{Cid, TxnId, INVALID_CID, INVALID_TXN_ID, MAX_CID};

/// Outcome of a visibility check for one version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    /// The version is the one this snapshot sees.
    Visible,
    /// The version is not part of this snapshot's world.
    Invisible,
    /// The reader's own transaction has deleted this logical row.
    Deleted,
}

/// Decide visibility from a version's header fields.
pub fn check(writer: TxnId, begin: Cid, end: Cid, reader: TxnId, snapshot: Cid) -> Visibility {
    let own = reader != INVALID_TXN_ID && writer == reader;
    let activated = begin != MAX_CID && snapshot >= begin;
    let invalidated = end != MAX_CID && end != INVALID_CID && snapshot >= end;

    if own {
        if begin == MAX_CID && end != INVALID_CID {
            // Our freshly inserted or freshly written version.
            Visibility::Visible
        } else if end == INVALID_CID {
            // Our pending tombstone.
            Visibility::Deleted
        } else {
            // The old version we are overwriting.
            Visibility::Invisible
        }
    } else if writer != INVALID_TXN_ID {
        // Owned by some other transaction. Never read uncommitted data;
        // the superseded version stays visible until the writer commits.
        if begin == MAX_CID {
            Visibility::Invisible
        } else if activated && !invalidated {
            Visibility::Visible
        } else {
            Visibility::Invisible
        }
    } else if activated && !invalidated {
        Visibility::Visible
    } else {
        Visibility::Invisible
    }
}
