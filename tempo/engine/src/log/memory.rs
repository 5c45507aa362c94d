//! In-memory transaction log for tests and for hosts that provide their own
//! durability underneath the log partition.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use tempo_common::{Key, Tid, TxnState, Xid};

use super::{LogOp, LogRecord, TransactionLog};
use crate::error::EngineResult;

pub struct MemoryLog<K: Key> {
    records: Mutex<Vec<LogRecord<K>>>,
    next_sid: AtomicU64,
}

impl<K: Key> MemoryLog<K> {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            next_sid: AtomicU64::new(1),
        }
    }

    /// Snapshot of the live records, in SID order.
    pub fn records(&self) -> Vec<LogRecord<K>> {
        let mut records = self.records.lock().unwrap().clone();
        records.sort_by_key(|record| record.sid);
        records
    }

    fn append_op(&self, tid: Tid, op: LogOp<K>) -> EngineResult<u64> {
        let mut records = self.records.lock().unwrap();
        let sid = self.next_sid.fetch_add(1, Ordering::SeqCst);
        records.push(LogRecord { sid, tid, op });
        Ok(sid)
    }
}

impl<K: Key> Default for MemoryLog<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key> TransactionLog<K> for MemoryLog<K> {
    fn append_state_transition(&self, tid: Tid, state: TxnState) -> EngineResult<u64> {
        self.append_op(tid, LogOp::StateTransition { state })
    }

    fn append_xa_state_transition(&self, xid: Xid, state: TxnState) -> EngineResult<u64> {
        self.append_op(xid.tid(), LogOp::XaStateTransition { pid: xid.pid(), state })
    }

    fn append_get(&self, tid: Tid, key: &K, version: u64) -> EngineResult<u64> {
        self.append_op(tid, LogOp::Get { key: key.clone(), version })
    }

    fn append_put(&self, tid: Tid, key: &K) -> EngineResult<u64> {
        self.append_op(tid, LogOp::Put { key: key.clone() })
    }

    fn append_delete(&self, tid: Tid, key: &K) -> EngineResult<u64> {
        self.append_op(tid, LogOp::Delete { key: key.clone() })
    }

    fn truncate(&self, sid: u64) -> EngineResult<()> {
        self.records
            .lock()
            .unwrap()
            .retain(|record| record.sid > sid);
        Ok(())
    }

    fn recover(&self) -> EngineResult<Box<dyn Iterator<Item = LogRecord<K>> + Send>> {
        Ok(Box::new(self.records().into_iter()))
    }
}
