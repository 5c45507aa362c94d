//! The per-transaction state machine.
//!
//! A transaction's mutable state lives behind one mutex (its monitor); the
//! paired condvar is where dependents and blocked readers sleep. The current
//! state and the commit/abort outcome are mirrored into atomics so another
//! transaction's wait predicate can be evaluated without ever holding two
//! monitors at once.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};

use tempo_common::{Key, Tid, TxnState};

use crate::error::AbortReason;

/// Whether the transaction is purely local or a participant of a
/// distributed transaction (carrying its persistent child reference).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnKind {
    Local,
    Xa { pid: u64 },
}

/// The durable decision of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Committed,
    Aborted,
}

const OUTCOME_NONE: u8 = 0;
const OUTCOME_COMMITTED: u8 = 1;
const OUTCOME_ABORTED: u8 = 2;

/// A tentative write announced through `before_put`/`before_delete`.
///
/// The version the transaction read before writing is carried along so that
/// garbage collection can discard versions the committed write superseded
/// without consulting the (possibly already expunged) read set.
#[derive(Debug, Clone)]
pub(crate) struct Mutation<K> {
    pub key: K,
    pub is_delete: bool,
    pub read_version: u64,
}

pub(crate) struct TxnCore<K> {
    pub state: TxnState,
    /// SID of the transaction's first durable record.
    pub first_sid: u64,
    /// SID of the transaction's most recent durable record.
    pub last_sid: u64,
    /// Key -> version observed.
    pub reads: HashMap<K, u64>,
    /// Ordered tentative writes; at most one mutation per key.
    pub mutations: Vec<Mutation<K>>,
    /// Transactions whose written versions this one observed.
    pub read_from: BTreeSet<Tid>,
    /// Inverse of `read_from`.
    pub read_by: BTreeSet<Tid>,
    /// Set by an aborting dependency: this transaction must cascade even if
    /// the dependency is reclaimed before commit is attempted.
    pub doomed_by: Option<Tid>,
    pub abort_reason: Option<AbortReason>,
}

pub struct MvtoTransaction<K: Key> {
    tid: Tid,
    kind: TxnKind,
    state_tag: AtomicU8,
    outcome_tag: AtomicU8,
    pub(crate) core: Mutex<TxnCore<K>>,
    pub(crate) monitor: Condvar,
}

impl<K: Key> MvtoTransaction<K> {
    pub fn new(tid: Tid, kind: TxnKind) -> Self {
        Self {
            tid,
            kind,
            state_tag: AtomicU8::new(TxnState::Created as u8),
            outcome_tag: AtomicU8::new(OUTCOME_NONE),
            core: Mutex::new(TxnCore {
                state: TxnState::Created,
                first_sid: 0,
                last_sid: 0,
                reads: HashMap::new(),
                mutations: Vec::new(),
                read_from: BTreeSet::new(),
                read_by: BTreeSet::new(),
                doomed_by: None,
                abort_reason: None,
            }),
            monitor: Condvar::new(),
        }
    }

    pub fn tid(&self) -> Tid {
        self.tid
    }

    pub fn kind(&self) -> TxnKind {
        self.kind
    }

    /// Current state, readable without the monitor.
    pub fn state(&self) -> TxnState {
        TxnState::from_u8(self.state_tag.load(Ordering::Acquire))
            .expect("state tag is always written from a valid state")
    }

    /// The commit/abort decision, readable without the monitor. `None` while
    /// undecided; survives the transition to `Finalized`.
    pub fn outcome(&self) -> Option<Outcome> {
        match self.outcome_tag.load(Ordering::Acquire) {
            OUTCOME_COMMITTED => Some(Outcome::Committed),
            OUTCOME_ABORTED => Some(Outcome::Aborted),
            _ => None,
        }
    }

    pub(crate) fn lock_core(&self) -> MutexGuard<'_, TxnCore<K>> {
        self.core.lock().unwrap()
    }

    /// Transition to `state` with the monitor held, keep the lock-free
    /// mirrors in sync, and wake every waiter on this transaction.
    pub(crate) fn set_state(&self, core: &mut TxnCore<K>, state: TxnState) {
        core.state = state;
        self.state_tag.store(state as u8, Ordering::Release);
        match state {
            TxnState::Committed => self.outcome_tag.store(OUTCOME_COMMITTED, Ordering::Release),
            TxnState::Aborted => self.outcome_tag.store(OUTCOME_ABORTED, Ordering::Release),
            _ => {}
        }
        self.monitor.notify_all();
    }

    /// Record a durable SID against the transaction.
    pub(crate) fn record_sid(core: &mut TxnCore<K>, sid: u64) {
        if core.first_sid == 0 {
            core.first_sid = sid;
        }
        core.last_sid = core.last_sid.max(sid);
    }

    /// Wake every waiter without changing state (shutdown path).
    pub fn unblock(&self) {
        let _core = self.core.lock().unwrap();
        self.monitor.notify_all();
    }
}
