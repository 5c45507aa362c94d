//! In-process timestamp manager implementations.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;

use tempo_common::Tid;
use tracing::debug;

use crate::error::{TsmError, TsmResult};
use crate::{ReclamationListener, SharedTimestampManager, TimestampListener, TimestampManager};

struct OracleState {
    next: u64,
    held: BTreeSet<u64>,
    /// Largest timestamp already announced as reclaimable.
    reclaimed: u64,
}

struct NotifyState {
    queue: VecDeque<u64>,
    active: bool,
}

/// Monotonic in-process timestamp oracle.
///
/// Timestamps start at 1; 0 is reserved for data that predates the engine.
/// Releasing the oldest live timestamp advances the reclamation bound and
/// fires the registered reclamation listeners.
pub struct LocalTimestampManager {
    state: Mutex<OracleState>,
    listeners: Mutex<Vec<ReclamationListener>>,
    // Reclamation listeners may call back into `release` (e.g. when the
    // engine aborts a stale transaction), so notifications are drained
    // through a queue instead of being fired recursively.
    notify: Mutex<NotifyState>,
}

impl LocalTimestampManager {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(OracleState {
                next: 1,
                held: BTreeSet::new(),
                reclaimed: 0,
            }),
            listeners: Mutex::new(Vec::new()),
            notify: Mutex::new(NotifyState {
                queue: VecDeque::new(),
                active: false,
            }),
        }
    }

    /// The largest timestamp such that no live timestamp is <= it.
    fn reclamation_bound(state: &OracleState) -> u64 {
        match state.held.first() {
            Some(oldest) => oldest - 1,
            None => state.next - 1,
        }
    }

    fn advance_reclamation(&self) {
        let bound = {
            let mut state = self.state.lock().unwrap();
            let bound = Self::reclamation_bound(&state);
            if bound <= state.reclaimed {
                return;
            }
            state.reclaimed = bound;
            bound
        };
        debug!(bound, "reclamation bound advanced");
        self.notify.lock().unwrap().queue.push_back(bound);
        self.drain_notifications();
    }

    fn drain_notifications(&self) {
        let mut notify = self.notify.lock().unwrap();
        if notify.active {
            // Re-entrant call from inside a listener; the outer drain loop
            // will pick the new bound up.
            return;
        }
        notify.active = true;
        loop {
            let Some(bound) = notify.queue.pop_front() else {
                notify.active = false;
                return;
            };
            drop(notify);
            let listeners = self.listeners.lock().unwrap();
            for listener in listeners.iter() {
                listener(Tid::new(bound));
            }
            drop(listeners);
            notify = self.notify.lock().unwrap();
        }
    }
}

impl Default for LocalTimestampManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TimestampManager for LocalTimestampManager {
    fn acquire(&self) -> TsmResult<Tid> {
        let mut state = self.state.lock().unwrap();
        if state.next == u64::MAX {
            return Err(TsmError::Exhausted(state.next));
        }
        let ts = state.next;
        state.next += 1;
        state.held.insert(ts);
        Ok(Tid::new(ts))
    }

    fn release(&self, ts: Tid) -> TsmResult<()> {
        {
            let mut state = self.state.lock().unwrap();
            if !state.held.remove(&ts.raw()) {
                return Err(TsmError::NoSuchTimestamp(ts));
            }
        }
        self.advance_reclamation();
        Ok(())
    }

    fn is_held_by_caller(&self, ts: Tid) -> bool {
        self.state.lock().unwrap().held.contains(&ts.raw())
    }

    fn add_reclamation_listener(&self, listener: ReclamationListener) {
        self.listeners.lock().unwrap().push(listener);
    }
}

struct SharedEntry {
    refs: BTreeSet<u64>,
    next_pid: u64,
    persisted: Option<Vec<u64>>,
    listeners: Vec<TimestampListener>,
    released: bool,
}

impl SharedEntry {
    fn new() -> Self {
        Self {
            refs: BTreeSet::new(),
            next_pid: 1,
            persisted: None,
            listeners: Vec::new(),
            released: false,
        }
    }
}

/// Timestamp manager with shared timestamps for distributed transactions.
///
/// A shared timestamp stays live until it has been released *and* all child
/// references are gone, so the reclamation bound never overtakes a
/// distributed transaction whose participants are still finishing.
pub struct SharedLocalTimestampManager {
    oracle: LocalTimestampManager,
    shared: Mutex<HashMap<u64, SharedEntry>>,
}

impl SharedLocalTimestampManager {
    pub fn new() -> Self {
        Self {
            oracle: LocalTimestampManager::new(),
            shared: Mutex::new(HashMap::new()),
        }
    }

    /// Drops the shared timestamp from the oracle once it is both released
    /// and unreferenced.
    fn maybe_drop(&self, ts: Tid) -> TsmResult<()> {
        let drop_now = {
            let mut shared = self.shared.lock().unwrap();
            match shared.get(&ts.raw()) {
                Some(entry) if entry.released && entry.refs.is_empty() => {
                    shared.remove(&ts.raw());
                    true
                }
                _ => false,
            }
        };
        if drop_now {
            self.oracle.release(ts)?;
        }
        Ok(())
    }
}

impl Default for SharedLocalTimestampManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TimestampManager for SharedLocalTimestampManager {
    fn acquire(&self) -> TsmResult<Tid> {
        self.oracle.acquire()
    }

    fn release(&self, ts: Tid) -> TsmResult<()> {
        self.oracle.release(ts)
    }

    fn is_held_by_caller(&self, ts: Tid) -> bool {
        self.oracle.is_held_by_caller(ts)
    }

    fn add_reclamation_listener(&self, listener: ReclamationListener) {
        self.oracle.add_reclamation_listener(listener);
    }
}

impl SharedTimestampManager for SharedLocalTimestampManager {
    fn acquire_shared(&self) -> TsmResult<Tid> {
        let ts = self.oracle.acquire()?;
        self.shared.lock().unwrap().insert(ts.raw(), SharedEntry::new());
        Ok(ts)
    }

    fn release_shared(&self, ts: Tid) -> TsmResult<()> {
        let listeners = {
            let mut shared = self.shared.lock().unwrap();
            let entry = shared
                .get_mut(&ts.raw())
                .ok_or(TsmError::NoSuchTimestamp(ts))?;
            entry.released = true;
            std::mem::take(&mut entry.listeners)
        };
        // Listeners may release their own child references, which needs the
        // shared map unlocked.
        for listener in &listeners {
            listener(ts);
        }
        self.maybe_drop(ts)
    }

    fn acquire_reference(&self, ts: Tid) -> TsmResult<u64> {
        let mut shared = self.shared.lock().unwrap();
        let entry = shared
            .get_mut(&ts.raw())
            .ok_or(TsmError::NoSuchTimestamp(ts))?;
        let pid = entry.next_pid;
        entry.next_pid += 1;
        entry.refs.insert(pid);
        Ok(pid)
    }

    fn release_reference(&self, ts: Tid, pid: u64) -> TsmResult<()> {
        {
            let mut shared = self.shared.lock().unwrap();
            let entry = shared
                .get_mut(&ts.raw())
                .ok_or(TsmError::NoSuchTimestamp(ts))?;
            if !entry.refs.remove(&pid) {
                return Err(TsmError::NoSuchReference { ts, pid });
            }
        }
        self.maybe_drop(ts)
    }

    fn persist_references(&self, ts: Tid, pids: Vec<u64>) -> TsmResult<()> {
        let mut shared = self.shared.lock().unwrap();
        let entry = shared
            .get_mut(&ts.raw())
            .ok_or(TsmError::NoSuchTimestamp(ts))?;
        entry.persisted = Some(pids);
        Ok(())
    }

    fn persisted_references(&self, ts: Tid) -> Option<Vec<u64>> {
        self.shared
            .lock()
            .unwrap()
            .get(&ts.raw())
            .and_then(|entry| entry.persisted.clone())
    }

    fn add_timestamp_listener(&self, ts: Tid, listener: TimestampListener) -> TsmResult<()> {
        let mut shared = self.shared.lock().unwrap();
        let entry = shared
            .get_mut(&ts.raw())
            .ok_or(TsmError::NoSuchTimestamp(ts))?;
        entry.listeners.push(listener);
        Ok(())
    }
}
