//! The transaction state machine.

use serde::{Deserialize, Serialize};

/// States of a transaction's lifecycle.
///
/// `Joined` and `Prepared` only occur for participants of a distributed
/// transaction. `Finalized` is terminal until the transaction is reclaimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TxnState {
    /// Allocated, no transaction id assigned yet.
    Created = 0,
    /// Active: holds a tid, may read and write.
    Started = 1,
    /// Waiting for a read dependency to commit or a conflicting writer to
    /// finalize.
    Blocked = 2,
    /// Attached to a distributed transaction id.
    Joined = 3,
    /// Durably voted commit; awaiting the coordinator's decision.
    Prepared = 4,
    /// The commit record is durable; cleanup pending.
    Committed = 5,
    /// The abort record is durable; tentative versions being rolled back.
    Aborted = 6,
    /// All mutations made visible or cleaned up; awaiting reclamation.
    Finalized = 7,
}

impl TxnState {
    /// True while the transaction may still issue reads and writes.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TxnState::Started | TxnState::Blocked | TxnState::Joined | TxnState::Prepared
        )
    }

    /// True once a commit or abort record is durable.
    pub fn is_decided(&self) -> bool {
        matches!(
            self,
            TxnState::Committed | TxnState::Aborted | TxnState::Finalized
        )
    }

    pub fn from_u8(raw: u8) -> Option<Self> {
        Some(match raw {
            0 => TxnState::Created,
            1 => TxnState::Started,
            2 => TxnState::Blocked,
            3 => TxnState::Joined,
            4 => TxnState::Prepared,
            5 => TxnState::Committed,
            6 => TxnState::Aborted,
            7 => TxnState::Finalized,
            _ => return None,
        })
    }
}
