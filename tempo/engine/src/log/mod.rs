//! The transaction log: an append-only record of state transitions and
//! operations, durable and recoverable.
//!
//! Every successfully appended record is assigned a monotonic sequence id
//! (SID). SIDs impose a total replay order that respects the program order of
//! each transaction; the SID returned from an `append_*` call is the
//! durability witness for that record.

pub mod file;
pub mod memory;

use serde::{Deserialize, Serialize};
use tempo_common::{Key, Tid, TxnState, Xid};

use crate::error::EngineResult;

pub use file::FileLog;
pub use memory::MemoryLog;

/// A durable log record. The operation enum tag doubles as the record type
/// discriminator on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord<K> {
    pub sid: u64,
    pub tid: Tid,
    pub op: LogOp<K>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogOp<K> {
    /// The transaction entered `state`.
    StateTransition { state: TxnState },
    /// A distributed participant entered `state`; carries the persistent
    /// child reference so recovery can rebuild the XID.
    XaStateTransition { pid: u64, state: TxnState },
    /// The transaction observed `version` of `key`.
    Get { key: K, version: u64 },
    /// The transaction wrote a new version of `key`.
    Put { key: K },
    /// The transaction wrote a delete marker for `key`.
    Delete { key: K },
}

/// Append-only durable transaction log.
///
/// `append_*` must make the record durable before returning. `recover`
/// yields all live records in SID order, oldest first.
pub trait TransactionLog<K: Key>: Send + Sync {
    fn append_state_transition(&self, tid: Tid, state: TxnState) -> EngineResult<u64>;

    fn append_xa_state_transition(&self, xid: Xid, state: TxnState) -> EngineResult<u64>;

    fn append_get(&self, tid: Tid, key: &K, version: u64) -> EngineResult<u64>;

    fn append_put(&self, tid: Tid, key: &K) -> EngineResult<u64>;

    fn append_delete(&self, tid: Tid, key: &K) -> EngineResult<u64>;

    /// Physically discard every record with SID <= `sid`.
    fn truncate(&self, sid: u64) -> EngineResult<()>;

    fn recover(&self) -> EngineResult<Box<dyn Iterator<Item = LogRecord<K>> + Send>>;
}
