//! The MVTO transaction manager.
//!
//! Implements the Multiversion Timestamp Ordering protocol of Weikum &
//! Vossen (Transactional Information Systems, §5.5):
//!
//! 1. A read r_i(x) is served as r_i(x_k), where x_k is the version of x
//!    with the largest timestamp <= ts(t_i).
//! 2. A write w_i(x) is rejected (and t_i aborted) if some transaction t_j
//!    already read a version x_k with ts(t_k) < ts(t_i) < ts(t_j); otherwise
//!    it becomes version x_i.
//! 3. The commit of t_i is delayed until every transaction that wrote a
//!    version t_i read has committed.
//!
//! The manager assumes read-before-write: a transaction reads a key before
//! writing or deleting it, at most once per key, and writes or deletes a
//! key at most once. The read-before-write assumption is enforced; the
//! others are the caller's contract.
//!
//! Locking discipline: the run gate (a read/write lock over the running
//! flag) is taken first, then at most one per-key lock, then at most one
//! transaction monitor. Blocking waits tick with a bounded timeout and
//! re-check the stop flag, so shutdown can never deadlock against a blocked
//! transaction.

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};
use std::io;
use std::ops::Bound;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, TryLockError, Weak};
use std::time::Duration;

use crossbeam_skiplist::SkipMap;
use dashmap::DashMap;
use tempo_common::{Key, KeyVersions, Tid, TxnState};
use tempo_tsm::{SharedTimestampManager, TimestampManager, TsmError};
use tracing::{debug, info, warn};

use crate::error::{AbortReason, EngineError, EngineResult};
use crate::kvs::{KeyValueStore, LifecycleListener, TransactionObserver};
use crate::log::{LogOp, LogRecord, TransactionLog};
use crate::transaction::{Mutation, MvtoTransaction, Outcome, TxnKind};

/// Polling tick for blocked transactions; bounds the shutdown latency of any
/// suspension point.
const WAIT_TICK: Duration = Duration::from_millis(20);
const STOP_RETRY: Duration = Duration::from_millis(10);

/// Per-key conflict-detection state; the surrounding mutex is the key lock.
#[derive(Default)]
pub(crate) struct KeyState {
    /// version -> transactions that observed that version.
    readers: BTreeMap<u64, BTreeSet<Tid>>,
    /// Transactions currently between `before_put`/`before_delete` and
    /// finalization.
    writers: BTreeSet<Tid>,
}

impl KeyState {
    fn is_empty(&self) -> bool {
        self.readers.is_empty() && self.writers.is_empty()
    }
}

pub struct MvtoTxnManager<K: Key> {
    kvs: Arc<dyn KeyValueStore<K>>,
    pub(crate) log: Arc<dyn TransactionLog<K>>,
    tsm: Arc<dyn TimestampManager>,
    /// Present when this manager participates in distributed transactions;
    /// XA participants release child references instead of plain timestamps.
    shared_tsm: Option<Arc<dyn SharedTimestampManager>>,
    /// Directory of live transactions, ordered by tid.
    pub(crate) transactions: SkipMap<Tid, Arc<MvtoTransaction<K>>>,
    /// Lazily created per-key locks and conflict indices.
    keys: DashMap<K, Arc<Mutex<KeyState>>>,
    /// Transactions in begin order; gates read-set cleanup so no older
    /// transaction can still need a read for conflict detection.
    active_readers: Mutex<VecDeque<Tid>>,
    /// Finalized transactions that have drained out of `active_readers`.
    reclaimables: Mutex<HashSet<Tid>>,
    running: RwLock<bool>,
    /// Lock-free mirror of `running`; read from the reclamation callback,
    /// which may fire re-entrantly while an entry point holds the run gate.
    accepting: AtomicBool,
    stop_requested: AtomicBool,
    reclamation_subscribed: AtomicBool,
    weak_self: Weak<MvtoTxnManager<K>>,
}

impl<K: Key> MvtoTxnManager<K> {
    pub fn new(
        kvs: Arc<dyn KeyValueStore<K>>,
        log: Arc<dyn TransactionLog<K>>,
        tsm: Arc<dyn TimestampManager>,
    ) -> Arc<Self> {
        Self::with_shared(kvs, log, tsm, None)
    }

    pub(crate) fn with_shared(
        kvs: Arc<dyn KeyValueStore<K>>,
        log: Arc<dyn TransactionLog<K>>,
        tsm: Arc<dyn TimestampManager>,
        shared_tsm: Option<Arc<dyn SharedTimestampManager>>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            kvs,
            log,
            tsm,
            shared_tsm,
            transactions: SkipMap::new(),
            keys: DashMap::new(),
            active_readers: Mutex::new(VecDeque::new()),
            reclaimables: Mutex::new(HashSet::new()),
            running: RwLock::new(false),
            accepting: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            reclamation_subscribed: AtomicBool::new(false),
            weak_self: weak.clone(),
        })
    }

    /// Recover durable state and open the manager for business. Idempotent.
    pub fn start(&self) -> EngineResult<()> {
        let mut running = self.running.write().unwrap();
        if *running {
            return Ok(());
        }
        self.stop_requested.store(false, Ordering::SeqCst);

        let mut replayed = 0usize;
        for record in self.log.recover()? {
            self.replay(record)?;
            replayed += 1;
        }
        let survivors: Vec<_> = self
            .transactions
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        for txn in &survivors {
            self.recover_transaction(txn)?;
        }
        // Finished transactions with no older peer left can shed their read
        // sets right away.
        self.drain_reclaimables();
        for tid in self.reclaimables.lock().unwrap().iter() {
            if let Some(entry) = self.transactions.get(tid) {
                self.remove_reads(entry.value());
            }
        }

        if !self.reclamation_subscribed.swap(true, Ordering::SeqCst) {
            let weak = self.weak_self.clone();
            self.tsm.add_reclamation_listener(Box::new(move |ts| {
                if let Some(manager) = weak.upgrade() {
                    manager.reclaimed(ts);
                }
            }));
        }

        *running = true;
        self.accepting.store(true, Ordering::SeqCst);
        info!(replayed, live = self.transactions.len(), "transaction manager started");
        Ok(())
    }

    /// Stop accepting work. Blocked transactions are woken repeatedly until
    /// every in-flight entry point has drained out of the run gate.
    pub fn stop(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        self.stop_requested.store(true, Ordering::SeqCst);
        let mut running = loop {
            for entry in self.transactions.iter() {
                entry.value().unblock();
            }
            match self.running.try_write() {
                Ok(guard) => break guard,
                Err(TryLockError::Poisoned(poisoned)) => break poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => std::thread::sleep(STOP_RETRY),
            }
        };
        *running = false;
        info!("transaction manager stopped");
    }

    pub(crate) fn run_guard(&self) -> EngineResult<RwLockReadGuard<'_, bool>> {
        let guard = self.running.read().unwrap();
        if !*guard {
            return Err(EngineError::IllegalState(
                "transaction manager is not running".to_string(),
            ));
        }
        Ok(guard)
    }

    // ---- transaction lifecycle ----

    pub fn begin(&self) -> EngineResult<Tid> {
        let _run = self.run_guard()?;
        let tid = self.tsm.acquire()?;
        let txn = Arc::new(MvtoTransaction::new(tid, TxnKind::Local));
        let sid = match self.log.append_state_transition(tid, TxnState::Started) {
            Ok(sid) => sid,
            Err(e) => {
                let _ = self.tsm.release(tid);
                return Err(e);
            }
        };
        {
            let mut core = txn.lock_core();
            MvtoTransaction::record_sid(&mut core, sid);
            txn.set_state(&mut core, TxnState::Started);
        }
        self.register(txn);
        debug!(%tid, "transaction started");
        Ok(tid)
    }

    pub fn commit(&self, tid: Tid) -> EngineResult<()> {
        let _run = self.run_guard()?;
        let txn = self.transaction(tid)?;
        match txn.state() {
            TxnState::Started => {}
            state => {
                return Err(EngineError::IllegalState(format!(
                    "cannot commit transaction {tid} in state {state:?}"
                )));
            }
        }
        self.wait_for_read_from(&txn)?;
        self.finish_commit(&txn)?;
        debug!(%tid, "transaction committed");
        Ok(())
    }

    pub fn abort(&self, tid: Tid) -> EngineResult<()> {
        let _run = self.run_guard()?;
        let txn = self.transaction(tid)?;
        self.abort_transaction(&txn, None)
    }

    /// Current state of a transaction, if it is still in the directory.
    pub fn state_of(&self, tid: Tid) -> Option<TxnState> {
        self.transactions.get(&tid).map(|entry| entry.value().state())
    }

    /// Total registered (key, version) read entries; drops to zero once
    /// finished transactions have been reclaimed.
    pub fn reader_count(&self) -> usize {
        self.keys
            .iter()
            .map(|entry| {
                let state = entry.value().lock().unwrap();
                state.readers.values().map(BTreeSet::len).sum::<usize>()
            })
            .sum()
    }

    /// Keys with a write currently in flight.
    pub fn active_writer_count(&self) -> usize {
        self.keys
            .iter()
            .filter(|entry| !entry.value().lock().unwrap().writers.is_empty())
            .count()
    }

    pub(crate) fn register(&self, txn: Arc<MvtoTransaction<K>>) {
        let tid = txn.tid();
        self.transactions.insert(tid, txn);
        self.active_readers.lock().unwrap().push_back(tid);
    }

    pub(crate) fn transaction(&self, tid: Tid) -> EngineResult<Arc<MvtoTransaction<K>>> {
        self.transactions
            .get(&tid)
            .map(|entry| entry.value().clone())
            .ok_or(EngineError::NoSuchTransaction(tid))
    }

    fn key_state(&self, key: &K) -> Arc<Mutex<KeyState>> {
        self.keys.entry(key.clone()).or_default().clone()
    }

    // ---- commit machinery ----

    /// Block until every `read_from` dependency has committed; cascade the
    /// abort of any dependency that aborted instead.
    pub(crate) fn wait_for_read_from(&self, txn: &Arc<MvtoTransaction<K>>) -> EngineResult<()> {
        let tid = txn.tid();
        let mut core = txn.lock_core();
        let resume_state = core.state;
        loop {
            match core.state {
                TxnState::Started | TxnState::Joined | TxnState::Blocked => {}
                TxnState::Committed | TxnState::Prepared | TxnState::Finalized
                    if txn.outcome() != Some(Outcome::Aborted) =>
                {
                    return Ok(());
                }
                _ => return Err(surfaced_abort(tid, &core.abort_reason)),
            }

            let doomed = core.doomed_by.or_else(|| {
                core.read_from.iter().copied().find(|dep| {
                    self.transactions
                        .get(dep)
                        .map(|entry| entry.value().outcome() == Some(Outcome::Aborted))
                        .unwrap_or(false)
                })
            });
            if let Some(dep) = doomed {
                if core.state == TxnState::Blocked {
                    txn.set_state(&mut core, resume_state);
                }
                drop(core);
                let reason = AbortReason::CascadedAbort(dep);
                self.abort_transaction(txn, Some(reason.clone()))?;
                return Err(EngineError::TransactionAborted { tid, reason });
            }

            let pending = core.read_from.iter().copied().any(|dep| {
                self.transactions
                    .get(&dep)
                    .map(|entry| entry.value().outcome().is_none())
                    .unwrap_or(false)
            });
            if !pending {
                if core.state == TxnState::Blocked {
                    txn.set_state(&mut core, resume_state);
                }
                return Ok(());
            }

            if self.stop_requested.load(Ordering::SeqCst) {
                if core.state == TxnState::Blocked {
                    txn.set_state(&mut core, resume_state);
                }
                return Err(EngineError::TransactionAborted {
                    tid,
                    reason: AbortReason::EngineStopped,
                });
            }

            if core.state != TxnState::Blocked {
                txn.set_state(&mut core, TxnState::Blocked);
            }
            let (guard, _) = txn.monitor.wait_timeout(core, WAIT_TICK).unwrap();
            core = guard;
        }
    }

    /// Make the commit durable and drive the transaction to `Finalized`.
    /// Idempotent once the transaction has committed, so a 2PC coordinator
    /// can retry the commit fan-out.
    pub(crate) fn finish_commit(&self, txn: &Arc<MvtoTransaction<K>>) -> EngineResult<()> {
        let tid = txn.tid();
        let read_by = {
            let mut core = txn.lock_core();
            match core.state {
                TxnState::Started | TxnState::Joined | TxnState::Prepared => {}
                TxnState::Committed | TxnState::Finalized
                    if txn.outcome() == Some(Outcome::Committed) =>
                {
                    return Ok(());
                }
                TxnState::Aborted | TxnState::Finalized => {
                    return Err(surfaced_abort(tid, &core.abort_reason));
                }
                state => {
                    return Err(EngineError::IllegalState(format!(
                        "cannot commit transaction {tid} in state {state:?}"
                    )));
                }
            }
            // The decision becomes durable and visible in one step.
            let sid = self.log.append_state_transition(tid, TxnState::Committed)?;
            MvtoTransaction::record_sid(&mut core, sid);
            txn.set_state(&mut core, TxnState::Committed);
            core.read_by.iter().copied().collect::<Vec<_>>()
        };
        self.notify_transactions(&read_by);
        self.finalize(txn)?;
        self.release_timestamp(txn);
        Ok(())
    }

    pub(crate) fn abort_transaction(
        &self,
        txn: &Arc<MvtoTransaction<K>>,
        reason: Option<AbortReason>,
    ) -> EngineResult<()> {
        let tid = txn.tid();
        let read_by = {
            let mut core = txn.lock_core();
            match core.state {
                TxnState::Aborted | TxnState::Finalized => return Ok(()),
                TxnState::Committed => {
                    return Err(EngineError::IllegalState(format!(
                        "cannot abort committed transaction {tid}"
                    )));
                }
                _ => {}
            }
            let sid = self.log.append_state_transition(tid, TxnState::Aborted)?;
            MvtoTransaction::record_sid(&mut core, sid);
            core.abort_reason = reason.clone();
            txn.set_state(&mut core, TxnState::Aborted);
            core.read_by.iter().copied().collect::<Vec<_>>()
        };
        debug!(%tid, ?reason, "transaction aborted");
        // Mark dependents so the cascade survives this transaction being
        // reclaimed before they attempt to commit.
        for dep in &read_by {
            if let Some(entry) = self.transactions.get(dep) {
                let dependent = entry.value();
                {
                    let mut core = dependent.lock_core();
                    if core.doomed_by.is_none() {
                        core.doomed_by = Some(tid);
                    }
                }
                dependent.unblock();
            }
        }
        self.finalize(txn)?;
        self.release_timestamp(txn);
        Ok(())
    }

    /// Reflect the decision in the store (roll back tentative versions on
    /// abort), clear active-writer registrations, and log the terminal
    /// transition. Idempotent; recovery re-drives it.
    pub(crate) fn finalize(&self, txn: &Arc<MvtoTransaction<K>>) -> EngineResult<()> {
        let tid = txn.tid();
        let (outcome, mutations) = {
            let core = txn.lock_core();
            match core.state {
                TxnState::Committed => (Outcome::Committed, core.mutations.clone()),
                TxnState::Aborted => (Outcome::Aborted, core.mutations.clone()),
                TxnState::Finalized => return Ok(()),
                state => {
                    return Err(EngineError::IllegalState(format!(
                        "cannot finalize transaction {tid} in state {state:?}"
                    )));
                }
            }
        };

        if outcome == Outcome::Aborted {
            for mutation in &mutations {
                self.kvs.delete_version(&mutation.key, tid.raw())?;
            }
        }
        for mutation in &mutations {
            if let Some(state) = self.keys.get(&mutation.key).map(|e| e.value().clone()) {
                state.lock().unwrap().writers.remove(&tid);
            }
        }

        let sid = self.log.append_state_transition(tid, TxnState::Finalized)?;
        {
            let mut core = txn.lock_core();
            MvtoTransaction::record_sid(&mut core, sid);
            if core.state != TxnState::Finalized {
                txn.set_state(&mut core, TxnState::Finalized);
            }
        }
        Ok(())
    }

    pub(crate) fn release_timestamp(&self, txn: &MvtoTransaction<K>) {
        let tid = txn.tid();
        let result = match txn.kind() {
            TxnKind::Local => self.tsm.release(tid),
            TxnKind::Xa { pid } => match &self.shared_tsm {
                Some(stsm) => stsm.release_reference(tid, pid),
                None => Ok(()),
            },
        };
        match result {
            Ok(())
            | Err(TsmError::NoSuchTimestamp(_))
            | Err(TsmError::NoSuchReference { .. }) => {}
            Err(e) => warn!(%tid, error = %e, "failed to release timestamp"),
        }
    }

    fn notify_transactions(&self, tids: &[Tid]) {
        for tid in tids {
            if let Some(entry) = self.transactions.get(tid) {
                entry.value().unblock();
            }
        }
    }

    // ---- read path ----

    /// Register one observed read, blocking on any concurrent writer in the
    /// forbidden band (chosen version, reader tid).
    fn observe_read(
        &self,
        txn: &Arc<MvtoTransaction<K>>,
        kv: &mut KeyVersions<K>,
    ) -> EngineResult<()> {
        let tid = txn.tid();
        let key_state = self.key_state(&kv.key);
        loop {
            // An empty candidate list is a read of the genesis version: it
            // still constrains later writers and satisfies read-before-write
            // for the first write of a fresh key.
            let chosen = kv.versions.first().copied().unwrap_or(0);

            let guard = key_state.lock().unwrap();
            let banded_writer = guard
                .writers
                .range((Bound::Excluded(Tid::new(chosen)), Bound::Excluded(tid)))
                .next()
                .copied();
            if let Some(writer_tid) = banded_writer {
                drop(guard);
                match self.wait_for_writer(txn, writer_tid)? {
                    // The writer's version now sits between the version we
                    // read and us: the read is unrepairable.
                    Outcome::Committed => {
                        let reason = AbortReason::WriteConflict;
                        self.abort_transaction(txn, Some(reason.clone()))?;
                        return Err(EngineError::TransactionAborted { tid, reason });
                    }
                    Outcome::Aborted => continue,
                }
            }
            let mut guard = guard;
            guard.readers.entry(chosen).or_default().insert(tid);
            let previous = {
                let mut core = txn.lock_core();
                core.reads.insert(kv.key.clone(), chosen)
            };
            // A re-read (e.g. of the transaction's own write) supersedes the
            // earlier registration.
            if let Some(previous) = previous.filter(|p| *p != chosen) {
                if let Some(readers) = guard.readers.get_mut(&previous) {
                    readers.remove(&tid);
                    if readers.is_empty() {
                        guard.readers.remove(&previous);
                    }
                }
            }
            drop(guard);

            // Serialization edge to the writer of the chosen version, unless
            // it already committed (or is ourselves).
            if chosen != 0 && chosen != tid.raw() {
                if let Some(entry) = self.transactions.get(&Tid::new(chosen)) {
                    let writer = entry.value();
                    let outcome = writer.outcome();
                    if outcome != Some(Outcome::Committed) {
                        {
                            let mut wcore = writer.lock_core();
                            wcore.read_by.insert(tid);
                        }
                        let mut core = txn.lock_core();
                        core.read_from.insert(writer.tid());
                        if outcome == Some(Outcome::Aborted) && core.doomed_by.is_none() {
                            core.doomed_by = Some(writer.tid());
                        }
                    }
                }
            }

            let sid = self.log.append_get(tid, &kv.key, chosen)?;
            {
                let mut core = txn.lock_core();
                MvtoTransaction::record_sid(&mut core, sid);
            }

            // Narrow the result set to the single admissible version.
            if kv.versions.first() == Some(&chosen) {
                kv.versions.truncate(1);
            } else {
                kv.versions.clear();
            }
            return Ok(());
        }
    }

    /// Block until the conflicting writer finalizes; returns its outcome.
    fn wait_for_writer(
        &self,
        txn: &Arc<MvtoTransaction<K>>,
        writer_tid: Tid,
    ) -> EngineResult<Outcome> {
        let tid = txn.tid();
        let writer = match self.transactions.get(&writer_tid) {
            Some(entry) => entry.value().clone(),
            // Already finalized and reclaimed; re-evaluate the key state.
            None => return Ok(Outcome::Aborted),
        };

        let resume_state = {
            let mut core = txn.lock_core();
            let resume = core.state;
            if matches!(core.state, TxnState::Started | TxnState::Joined) {
                txn.set_state(&mut core, TxnState::Blocked);
            }
            resume
        };
        debug!(%tid, writer = %writer_tid, "read blocked on concurrent writer");

        let result = loop {
            match writer.outcome() {
                // Commit is irreversible; no need to wait out finalization.
                Some(Outcome::Committed) => break Ok(Outcome::Committed),
                // An aborted writer's version is gone only once finalized.
                Some(Outcome::Aborted) if writer.state() == TxnState::Finalized => {
                    break Ok(Outcome::Aborted);
                }
                _ => {}
            }
            if self.stop_requested.load(Ordering::SeqCst) {
                break Err(EngineError::TransactionAborted {
                    tid,
                    reason: AbortReason::EngineStopped,
                });
            }
            if txn.outcome() == Some(Outcome::Aborted) {
                let core = txn.lock_core();
                break Err(surfaced_abort(tid, &core.abort_reason));
            }
            let wcore = writer.lock_core();
            let _ = writer.monitor.wait_timeout(wcore, WAIT_TICK).unwrap();
        };

        {
            let mut core = txn.lock_core();
            if core.state == TxnState::Blocked {
                txn.set_state(&mut core, resume_state);
            }
        }
        result
    }

    // ---- write path ----

    fn observe_write(&self, tid: Tid, keys: &[K], is_delete: bool) -> EngineResult<()> {
        let txn = self.transaction(tid)?;
        {
            let core = txn.lock_core();
            match core.state {
                TxnState::Started | TxnState::Joined => {}
                TxnState::Aborted | TxnState::Finalized => {
                    return Err(surfaced_abort(tid, &core.abort_reason));
                }
                state => {
                    return Err(EngineError::IllegalState(format!(
                        "cannot write in transaction {tid} in state {state:?}"
                    )));
                }
            }
            for key in keys {
                if !core.reads.contains_key(key) {
                    return Err(EngineError::IllegalState(format!(
                        "transaction {tid} writes key {key:?} it never read"
                    )));
                }
            }
        }

        let mut sorted: Vec<&K> = keys.iter().collect();
        sorted.sort();
        for key in sorted {
            // Record the tentative mutation before the conflict scan, so an
            // abort rolls back a version the store may already hold.
            let pushed = {
                let mut core = txn.lock_core();
                let read_version = core.reads.get(key).copied().unwrap_or(0);
                if core.mutations.iter().any(|m| &m.key == key) {
                    false
                } else {
                    core.mutations.push(Mutation {
                        key: key.clone(),
                        is_delete,
                        read_version,
                    });
                    true
                }
            };

            let key_state = self.key_state(key);
            let mut guard = key_state.lock().unwrap();
            // MVTO rule 2a: a younger transaction already read a version
            // older than this write.
            let mut conflict = None;
            for (&version, readers) in guard.readers.range(..tid.raw()) {
                for &reader in readers.iter().rev() {
                    if reader.raw() <= tid.raw() {
                        break;
                    }
                    if !self.reader_is_aborted(reader) {
                        conflict = Some((version, reader));
                        break;
                    }
                }
                if conflict.is_some() {
                    break;
                }
            }
            if let Some((version, reader)) = conflict {
                drop(guard);
                debug!(%tid, key = ?key, version, %reader, "write conflict");
                let reason = AbortReason::WriteConflict;
                self.abort_transaction(&txn, Some(reason.clone()))?;
                return Err(EngineError::TransactionAborted { tid, reason });
            }
            guard.writers.insert(tid);
            drop(guard);

            let append = if is_delete {
                self.log.append_delete(tid, key)
            } else {
                self.log.append_put(tid, key)
            };
            match append {
                Ok(sid) => {
                    let mut core = txn.lock_core();
                    MvtoTransaction::record_sid(&mut core, sid);
                }
                Err(e) => {
                    // The write is rejected but the transaction stays
                    // started and may retry or abort.
                    key_state.lock().unwrap().writers.remove(&tid);
                    if pushed {
                        let mut core = txn.lock_core();
                        core.mutations.retain(|m| &m.key != key);
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    fn reader_is_aborted(&self, tid: Tid) -> bool {
        self.transactions
            .get(&tid)
            .map(|entry| entry.value().outcome() == Some(Outcome::Aborted))
            .unwrap_or(false)
    }

    fn unwind_failed_operation(
        &self,
        tid: Tid,
        error: &io::Error,
    ) -> EngineResult<()> {
        let txn = self.transaction(tid)?;
        if txn.state().is_decided() {
            return Ok(());
        }
        // The store failed after announcing the operation; the engine cannot
        // know what state the cells are in, so the transaction cannot
        // continue.
        self.abort_transaction(&txn, Some(AbortReason::Io(error.to_string())))
    }

    // ---- garbage collection ----

    /// Reclamation event from the timestamp manager: no live transaction has
    /// a timestamp <= `ts`.
    pub fn reclaimed(&self, ts: Tid) {
        if !self.accepting.load(Ordering::SeqCst) {
            return;
        }
        debug!(bound = %ts, "reclamation event");
        self.drain_reclaimables();

        let candidates: Vec<_> = self
            .transactions
            .range(..=ts)
            .map(|entry| entry.value().clone())
            .collect();
        let mut removed_any = false;
        let mut max_removed_sid = 0u64;
        let mut version_gc: Vec<(K, u64)> = Vec::new();

        for txn in candidates {
            let tid = txn.tid();
            match txn.state() {
                TxnState::Created => {
                    self.transactions.remove(&tid);
                }
                TxnState::Started | TxnState::Blocked | TxnState::Joined => {
                    warn!(%tid, bound = %ts, "live transaction behind reclamation bound, aborting");
                    if let Err(e) = self.abort_transaction(&txn, Some(AbortReason::Deadline)) {
                        warn!(%tid, error = %e, "failed to abort stale transaction");
                    }
                }
                // A prepared participant belongs to its coordinator.
                TxnState::Prepared => {}
                TxnState::Committed | TxnState::Aborted => {
                    if let Err(e) = self.finalize(&txn) {
                        warn!(%tid, error = %e, "failed to finalize transaction");
                    }
                }
                TxnState::Finalized => {
                    if self.reclaimables.lock().unwrap().remove(&tid) {
                        {
                            let core = txn.lock_core();
                            max_removed_sid = max_removed_sid.max(core.last_sid);
                            if txn.outcome() == Some(Outcome::Committed) {
                                for mutation in &core.mutations {
                                    if mutation.read_version > 0 {
                                        version_gc.push((
                                            mutation.key.clone(),
                                            mutation.read_version - 1,
                                        ));
                                    }
                                }
                            }
                        }
                        self.remove_reads(&txn);
                        self.transactions.remove(&tid);
                        removed_any = true;
                    } else {
                        self.remove_reads(&txn);
                    }
                }
            }
        }

        // Versions strictly below the one a reclaimed committed write
        // superseded can no longer be read by anyone.
        for (key, bound) in version_gc {
            if let Err(e) = self.kvs.delete_versions(&key, bound) {
                warn!(key = ?key, bound, error = %e, "failed to delete obsolete versions");
            }
        }

        if removed_any {
            let live_floor = self
                .transactions
                .iter()
                .filter_map(|entry| {
                    let first = entry.value().lock_core().first_sid;
                    (first > 0).then_some(first)
                })
                .min();
            let bound = match live_floor {
                Some(first) => max_removed_sid.min(first.saturating_sub(1)),
                None => max_removed_sid,
            };
            if bound > 0 {
                if let Err(e) = self.log.truncate(bound) {
                    warn!(bound, error = %e, "failed to truncate transaction log");
                }
            }
        }
    }

    /// Move finalized transactions from the head of the begin-order queue
    /// into the reclaimable set: nothing older than them is live any more.
    fn drain_reclaimables(&self) {
        let mut fifo = self.active_readers.lock().unwrap();
        let mut reclaimables = self.reclaimables.lock().unwrap();
        while let Some(&tid) = fifo.front() {
            match self.transactions.get(&tid) {
                Some(entry) if entry.value().state() == TxnState::Finalized => {
                    reclaimables.insert(tid);
                    fifo.pop_front();
                }
                None => {
                    fifo.pop_front();
                }
                Some(_) => break,
            }
        }
    }

    fn remove_reads(&self, txn: &Arc<MvtoTransaction<K>>) {
        let tid = txn.tid();
        let reads: Vec<(K, u64)> = {
            let mut core = txn.lock_core();
            core.reads.drain().collect()
        };
        for (key, version) in reads {
            let Some(state) = self.keys.get(&key).map(|e| e.value().clone()) else {
                continue;
            };
            {
                let mut guard = state.lock().unwrap();
                if let Some(readers) = guard.readers.get_mut(&version) {
                    readers.remove(&tid);
                    if readers.is_empty() {
                        guard.readers.remove(&version);
                    }
                }
            }
            self.keys
                .remove_if(&key, |_, state| state.lock().unwrap().is_empty());
        }
    }

    // ---- recovery ----

    fn replay(&self, record: LogRecord<K>) -> EngineResult<()> {
        let LogRecord { sid, tid, op } = record;
        match op {
            LogOp::StateTransition { state } => self.replay_transition(sid, tid, state, None),
            LogOp::XaStateTransition { pid, state } => {
                self.replay_transition(sid, tid, state, Some(pid))
            }
            LogOp::Get { key, version } => {
                let Ok(txn) = self.transaction(tid) else {
                    return Ok(());
                };
                {
                    let mut core = txn.lock_core();
                    core.reads.insert(key.clone(), version);
                    MvtoTransaction::record_sid(&mut core, sid);
                }
                self.key_state(&key)
                    .lock()
                    .unwrap()
                    .readers
                    .entry(version)
                    .or_default()
                    .insert(tid);
                if version != 0 && version != tid.raw() {
                    if let Some(entry) = self.transactions.get(&Tid::new(version)) {
                        let writer = entry.value();
                        let outcome = writer.outcome();
                        if outcome != Some(Outcome::Committed) {
                            {
                                let mut wcore = writer.lock_core();
                                wcore.read_by.insert(tid);
                            }
                            let mut core = txn.lock_core();
                            core.read_from.insert(writer.tid());
                            if outcome == Some(Outcome::Aborted) && core.doomed_by.is_none() {
                                core.doomed_by = Some(writer.tid());
                            }
                        }
                    }
                }
                Ok(())
            }
            LogOp::Put { key } => {
                let is_delete = false;
                let Ok(txn) = self.transaction(tid) else {
                    return Ok(());
                };
                {
                    let mut core = txn.lock_core();
                    let read_version = core.reads.get(&key).copied().unwrap_or(0);
                    core.mutations.push(Mutation {
                        key: key.clone(),
                        is_delete,
                        read_version,
                    });
                    MvtoTransaction::record_sid(&mut core, sid);
                }
                self.key_state(&key).lock().unwrap().writers.insert(tid);
                Ok(())
            }
            LogOp::Delete { key } => {
                let is_delete = true;
                let Ok(txn) = self.transaction(tid) else {
                    return Ok(());
                };
                {
                    let mut core = txn.lock_core();
                    let read_version = core.reads.get(&key).copied().unwrap_or(0);
                    core.mutations.push(Mutation {
                        key: key.clone(),
                        is_delete,
                        read_version,
                    });
                    MvtoTransaction::record_sid(&mut core, sid);
                }
                self.key_state(&key).lock().unwrap().writers.insert(tid);
                Ok(())
            }
        }
    }

    fn replay_transition(
        &self,
        sid: u64,
        tid: Tid,
        state: TxnState,
        pid: Option<u64>,
    ) -> EngineResult<()> {
        match state {
            TxnState::Started | TxnState::Joined => {
                if self.transactions.contains_key(&tid) {
                    return Err(EngineError::IllegalState(format!(
                        "begin record for existing transaction {tid}"
                    )));
                }
                let kind = match pid {
                    Some(pid) => TxnKind::Xa { pid },
                    None => TxnKind::Local,
                };
                let txn = Arc::new(MvtoTransaction::new(tid, kind));
                {
                    let mut core = txn.lock_core();
                    MvtoTransaction::record_sid(&mut core, sid);
                    txn.set_state(&mut core, state);
                }
                self.register(txn);
                Ok(())
            }
            TxnState::Prepared | TxnState::Committed | TxnState::Aborted | TxnState::Finalized => {
                if let Some(entry) = self.transactions.get(&tid) {
                    let txn = entry.value();
                    let mut core = txn.lock_core();
                    MvtoTransaction::record_sid(&mut core, sid);
                    txn.set_state(&mut core, state);
                }
                Ok(())
            }
            TxnState::Created | TxnState::Blocked => Err(EngineError::IllegalState(format!(
                "invalid state transition record {state:?} for transaction {tid}"
            ))),
        }
    }

    fn recover_transaction(&self, txn: &Arc<MvtoTransaction<K>>) -> EngineResult<()> {
        let tid = txn.tid();
        match txn.state() {
            TxnState::Created => Err(EngineError::IllegalState(format!(
                "created transaction {tid} in log during recovery"
            ))),
            TxnState::Started | TxnState::Blocked | TxnState::Joined => {
                if !self.tsm.is_held_by_caller(tid) {
                    warn!(%tid, "transaction lost its timestamp across restart, aborting");
                    self.abort_transaction(txn, Some(AbortReason::Deadline))?;
                }
                Ok(())
            }
            // The coordinator's decision record governs prepared
            // participants; leave them for the commit/abort fan-out.
            TxnState::Prepared => Ok(()),
            TxnState::Committed | TxnState::Aborted => self.finalize(txn),
            TxnState::Finalized => Ok(()),
        }
    }
}

fn surfaced_abort(tid: Tid, reason: &Option<AbortReason>) -> EngineError {
    match reason {
        Some(reason) => EngineError::TransactionAborted {
            tid,
            reason: reason.clone(),
        },
        None => EngineError::IllegalState(format!("transaction {tid} was explicitly aborted")),
    }
}

impl<K: Key> TransactionObserver<K> for MvtoTxnManager<K> {
    fn before_get(&self, tid: Tid, _keys: &[K]) -> EngineResult<()> {
        let _run = self.run_guard()?;
        let txn = self.transaction(tid)?;
        // The version chosen is not known until after_get; MVTO acts there.
        if !txn.state().is_active() {
            return Err(EngineError::IllegalState(format!(
                "cannot read in transaction {tid} in state {:?}",
                txn.state()
            )));
        }
        Ok(())
    }

    fn after_get(&self, tid: Tid, results: &mut [KeyVersions<K>]) -> EngineResult<()> {
        let _run = self.run_guard()?;
        let txn = self.transaction(tid)?;
        // Keys in ascending order, for deterministic lock acquisition.
        let mut order: Vec<usize> = (0..results.len()).collect();
        order.sort_by(|&a, &b| results[a].key.cmp(&results[b].key));
        for idx in order {
            self.observe_read(&txn, &mut results[idx])?;
        }
        Ok(())
    }

    fn failed_get(&self, tid: Tid, _keys: &[K], error: &io::Error) -> EngineResult<()> {
        let _run = self.run_guard()?;
        self.unwind_failed_operation(tid, error)
    }

    fn before_put(&self, tid: Tid, keys: &[K]) -> EngineResult<()> {
        let _run = self.run_guard()?;
        self.observe_write(tid, keys, false)
    }

    fn after_put(&self, tid: Tid, _keys: &[K]) -> EngineResult<()> {
        // The version is visible now; its log record was durable before the
        // store acted.
        let _run = self.run_guard()?;
        self.transaction(tid).map(|_| ())
    }

    fn failed_put(&self, tid: Tid, _keys: &[K], error: &io::Error) -> EngineResult<()> {
        let _run = self.run_guard()?;
        self.unwind_failed_operation(tid, error)
    }

    fn before_delete(&self, tid: Tid, keys: &[K]) -> EngineResult<()> {
        let _run = self.run_guard()?;
        self.observe_write(tid, keys, true)
    }

    fn after_delete(&self, tid: Tid, _keys: &[K]) -> EngineResult<()> {
        let _run = self.run_guard()?;
        self.transaction(tid).map(|_| ())
    }

    fn failed_delete(&self, tid: Tid, _keys: &[K], error: &io::Error) -> EngineResult<()> {
        let _run = self.run_guard()?;
        self.unwind_failed_operation(tid, error)
    }
}

impl<K: Key> LifecycleListener for MvtoTxnManager<K> {
    fn starting(&self) -> EngineResult<()> {
        self.start()
    }

    fn stopping(&self) {
        self.stop()
    }

    fn aborting(&self) {
        for entry in self.transactions.iter() {
            self.release_timestamp(entry.value());
        }
    }
}
