//! Cross-group (XA) transactions.
//!
//! A distributed transaction spans several engine instances (groups) that
//! share a timestamp manager. Each participant `join`s the coordinator's
//! shared timestamp, acquiring a persistent child reference that, together
//! with the timestamp, forms its XID. Two-phase commit is driven by a
//! coordinator: prepare fan-out, then `persist_references` on the shared
//! timestamp manager (the point of no return), then a commit fan-out that
//! is retried until every participant acknowledges.
//!
//! A participant that has not yet prepared aborts unilaterally when the
//! shared timestamp is released out from under it. Once prepared it belongs
//! to the coordinator: only the commit/abort fan-out (or a replacement
//! coordinator resuming from the persisted decision) finishes it.

use std::sync::{Arc, Weak};

use tempo_common::{Key, Tid, TxnState, Xid};
use tempo_tsm::{SharedTimestampManager, TimestampManager};
use tracing::{debug, warn};

use crate::error::{AbortReason, EngineError, EngineResult};
use crate::kvs::KeyValueStore;
use crate::log::TransactionLog;
use crate::manager::MvtoTxnManager;
use crate::transaction::{MvtoTransaction, Outcome, TxnKind};

/// Bounded retry budget for one `complete` pass; the caller may keep
/// re-driving `complete` until every participant acknowledges.
const COMMIT_FANOUT_RETRIES: usize = 10;

/// An MVTO transaction manager that can host participants of distributed
/// transactions, in addition to plain local ones.
pub struct XaTxnManager<K: Key> {
    inner: Arc<MvtoTxnManager<K>>,
    stsm: Arc<dyn SharedTimestampManager>,
    weak_self: Weak<XaTxnManager<K>>,
}

impl<K: Key> XaTxnManager<K> {
    pub fn new<S>(
        kvs: Arc<dyn KeyValueStore<K>>,
        log: Arc<dyn TransactionLog<K>>,
        stsm: Arc<S>,
    ) -> Arc<Self>
    where
        S: SharedTimestampManager + 'static,
    {
        let tsm: Arc<dyn TimestampManager> = stsm.clone();
        let shared: Arc<dyn SharedTimestampManager> = stsm;
        let inner = MvtoTxnManager::with_shared(kvs, log, tsm, Some(shared.clone()));
        Arc::new_cyclic(|weak| Self {
            inner,
            stsm: shared,
            weak_self: weak.clone(),
        })
    }

    /// The underlying manager: local transactions, observer hooks, and
    /// lifecycle run through it unchanged.
    pub fn manager(&self) -> &Arc<MvtoTxnManager<K>> {
        &self.inner
    }

    pub fn start(&self) -> EngineResult<()> {
        self.inner.start()
    }

    pub fn stop(&self) {
        self.inner.stop()
    }

    /// Attach a participant of the distributed transaction `tid` to this
    /// group. Yields the participant's XID.
    pub fn join(self: &Arc<Self>, tid: Tid) -> EngineResult<Xid> {
        let _run = self.inner.run_guard()?;
        if self.inner.transactions.contains_key(&tid) {
            return Err(EngineError::IllegalState(format!(
                "transaction {tid} already joined this group"
            )));
        }

        let pid = self.stsm.acquire_reference(tid)?;
        let xid = Xid::new(tid, pid);

        // Abort unilaterally if the coordinator's timestamp goes away before
        // this participant prepares.
        let weak = self.weak_self.clone();
        self.stsm.add_timestamp_listener(
            tid,
            Box::new(move |ts| {
                if let Some(manager) = weak.upgrade() {
                    manager.released(ts);
                }
            }),
        )?;

        let txn = Arc::new(MvtoTransaction::new(tid, TxnKind::Xa { pid }));
        let sid = match self.inner.log.append_xa_state_transition(xid, TxnState::Joined) {
            Ok(sid) => sid,
            Err(e) => {
                let _ = self.stsm.release_reference(tid, pid);
                return Err(e);
            }
        };
        {
            let mut core = txn.lock_core();
            MvtoTransaction::record_sid(&mut core, sid);
            txn.set_state(&mut core, TxnState::Joined);
        }
        self.inner.register(txn);
        debug!(%xid, "participant joined");
        Ok(xid)
    }

    /// Vote commit: wait out the read dependencies exactly like a commit
    /// would, then make the vote durable. A participant that cannot rule
    /// out a cascaded abort must not vote commit.
    pub fn prepare(&self, xid: Xid) -> EngineResult<()> {
        let _run = self.inner.run_guard()?;
        let txn = self.participant(xid)?;
        match txn.state() {
            TxnState::Joined => {}
            TxnState::Prepared => return Ok(()),
            _ => return self.settled_error(&txn, "prepare"),
        }

        self.inner.wait_for_read_from(&txn)?;

        let mut core = txn.lock_core();
        match core.state {
            TxnState::Joined => {}
            TxnState::Prepared => return Ok(()),
            _ => {
                drop(core);
                return self.settled_error(&txn, "prepare");
            }
        }
        let sid = self.inner.log.append_xa_state_transition(xid, TxnState::Prepared)?;
        MvtoTransaction::record_sid(&mut core, sid);
        txn.set_state(&mut core, TxnState::Prepared);
        debug!(%xid, "participant prepared");
        Ok(())
    }

    /// Commit the participant. With `one_phase` a single-group distributed
    /// transaction degenerates to the local commit path; otherwise the
    /// participant must have prepared. Idempotent once committed, so the
    /// coordinator can retry the fan-out.
    pub fn commit(&self, xid: Xid, one_phase: bool) -> EngineResult<()> {
        let _run = self.inner.run_guard()?;
        let txn = self.participant(xid)?;
        match txn.state() {
            TxnState::Committed | TxnState::Finalized
                if txn.outcome() == Some(Outcome::Committed) =>
            {
                return Ok(());
            }
            TxnState::Joined if one_phase => {
                self.inner.wait_for_read_from(&txn)?;
                return self.inner.finish_commit(&txn);
            }
            TxnState::Prepared if !one_phase => {
                return self.inner.finish_commit(&txn);
            }
            TxnState::Joined => {
                return Err(EngineError::IllegalState(format!(
                    "participant {xid} has not prepared"
                )));
            }
            _ => {}
        }
        self.settled_error(&txn, "commit")
    }

    /// Abort the participant and release its persistent reference.
    /// Idempotent once aborted.
    pub fn abort(&self, xid: Xid) -> EngineResult<()> {
        let _run = self.inner.run_guard()?;
        let txn = self.participant(xid)?;
        match txn.state() {
            TxnState::Created
            | TxnState::Started
            | TxnState::Blocked
            | TxnState::Joined
            | TxnState::Prepared => self.inner.abort_transaction(&txn, None),
            TxnState::Aborted | TxnState::Finalized
                if txn.outcome() != Some(Outcome::Committed) =>
            {
                Ok(())
            }
            _ => Err(EngineError::IllegalState(format!(
                "cannot abort committed participant {xid}"
            ))),
        }
    }

    fn participant(&self, xid: Xid) -> EngineResult<Arc<MvtoTransaction<K>>> {
        let txn = self.inner.transaction(xid.tid())?;
        match txn.kind() {
            TxnKind::Xa { pid } if pid == xid.pid() => Ok(txn),
            _ => Err(EngineError::IllegalState(format!(
                "transaction {} is not participant {xid}",
                xid.tid()
            ))),
        }
    }

    /// Error for operations against a participant that already aborted (or
    /// is otherwise out of protocol).
    fn settled_error(&self, txn: &Arc<MvtoTransaction<K>>, op: &str) -> EngineResult<()> {
        let core = txn.lock_core();
        if txn.outcome() == Some(Outcome::Aborted) {
            if let Some(reason) = &core.abort_reason {
                return Err(EngineError::TransactionAborted {
                    tid: txn.tid(),
                    reason: reason.clone(),
                });
            }
        }
        Err(EngineError::IllegalState(format!(
            "cannot {op} participant {} in state {:?}",
            txn.tid(),
            core.state
        )))
    }

    /// The shared timestamp was released. Participants that have not
    /// prepared abort unilaterally; everyone else is bound to the
    /// coordinator's persisted decision.
    fn released(&self, ts: Tid) {
        let Some(entry) = self.inner.transactions.get(&ts) else {
            return;
        };
        let txn = entry.value().clone();
        match txn.state() {
            TxnState::Joined | TxnState::Started | TxnState::Blocked => {
                debug!(%ts, "shared timestamp released before prepare, aborting participant");
                if let Err(e) = self.inner.abort_transaction(&txn, Some(AbortReason::Deadline)) {
                    warn!(%ts, error = %e, "failed to abort released participant");
                }
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CoordinatorState {
    Created,
    Active,
    Committing,
    Committed,
    Aborted,
}

/// Client-side driver of a cross-group transaction.
///
/// Enlists groups as they are touched, then commits with one-phase commit
/// for a single group or full two-phase commit otherwise. After
/// `persist_references` succeeds the outcome is fixed; a replacement
/// coordinator built with [`CrossGroupCoordinator::resume`] can re-drive the
/// commit fan-out after a crash.
pub struct CrossGroupCoordinator<K: Key> {
    stsm: Arc<dyn SharedTimestampManager>,
    tid: Option<Tid>,
    groups: Vec<(Arc<XaTxnManager<K>>, Xid)>,
    state: CoordinatorState,
}

impl<K: Key> CrossGroupCoordinator<K> {
    pub fn new<S>(stsm: Arc<S>) -> Self
    where
        S: SharedTimestampManager + 'static,
    {
        Self {
            stsm,
            tid: None,
            groups: Vec::new(),
            state: CoordinatorState::Created,
        }
    }

    /// Rebuild a coordinator over a commit decision that is already
    /// persisted, to finish the fan-out on behalf of a dead predecessor.
    pub fn resume<S>(
        stsm: Arc<S>,
        tid: Tid,
        groups: Vec<(Arc<XaTxnManager<K>>, Xid)>,
    ) -> EngineResult<Self>
    where
        S: SharedTimestampManager + 'static,
    {
        if stsm.persisted_references(tid).is_none() {
            return Err(EngineError::IllegalState(format!(
                "no persisted commit decision for transaction {tid}"
            )));
        }
        Ok(Self {
            stsm,
            tid: Some(tid),
            groups,
            state: CoordinatorState::Committing,
        })
    }

    pub fn begin(&mut self) -> EngineResult<Tid> {
        if self.state != CoordinatorState::Created {
            return Err(EngineError::IllegalState(
                "cross-group transaction already begun".to_string(),
            ));
        }
        let tid = self.stsm.acquire_shared()?;
        self.tid = Some(tid);
        self.state = CoordinatorState::Active;
        Ok(tid)
    }

    pub fn tid(&self) -> Option<Tid> {
        self.tid
    }

    /// Enlist a group, joining it to the shared timestamp on first contact.
    pub fn enlist(&mut self, group: &Arc<XaTxnManager<K>>) -> EngineResult<Xid> {
        if self.state != CoordinatorState::Active {
            return Err(EngineError::IllegalState(
                "cross-group transaction is not active".to_string(),
            ));
        }
        if let Some((_, xid)) = self.groups.iter().find(|(g, _)| Arc::ptr_eq(g, group)) {
            return Ok(*xid);
        }
        let tid = self.expect_tid()?;
        let xid = group.join(tid)?;
        self.groups.push((group.clone(), xid));
        Ok(xid)
    }

    pub fn commit(&mut self) -> EngineResult<()> {
        match self.state {
            CoordinatorState::Active => {}
            CoordinatorState::Committing => return self.complete(),
            CoordinatorState::Committed => return Ok(()),
            _ => {
                return Err(EngineError::IllegalState(
                    "cross-group transaction cannot commit".to_string(),
                ));
            }
        }
        let tid = self.expect_tid()?;

        if self.groups.is_empty() {
            self.state = CoordinatorState::Committed;
            self.release_shared_quietly();
            return Ok(());
        }

        // A single group needs no coordination.
        if self.groups.len() == 1 {
            let (group, xid) = self.groups[0].clone();
            match group.commit(xid, true) {
                Ok(()) => {
                    self.state = CoordinatorState::Committed;
                    self.release_shared_quietly();
                    Ok(())
                }
                Err(e) => {
                    self.rollback_internal();
                    Err(e)
                }
            }
        } else {
            // Phase 1: any failed vote aborts everyone.
            for (group, xid) in &self.groups {
                if let Err(e) = group.prepare(*xid) {
                    warn!(%xid, error = %e, "prepare failed, rolling back");
                    self.rollback_internal();
                    return Err(e);
                }
            }

            // Point of no return: the decision is durable with the shared
            // timestamp manager.
            let pids = self.groups.iter().map(|(_, xid)| xid.pid()).collect();
            if let Err(e) = self.stsm.persist_references(tid, pids) {
                self.rollback_internal();
                return Err(e.into());
            }
            self.state = CoordinatorState::Committing;

            self.complete()
        }
    }

    /// Phase 2: drive (or re-drive) the commit fan-out. Leaves the
    /// coordinator in `Committing` on partial failure so it can be called
    /// again.
    pub fn complete(&mut self) -> EngineResult<()> {
        match self.state {
            CoordinatorState::Committing => {}
            CoordinatorState::Committed => return Ok(()),
            _ => {
                return Err(EngineError::IllegalState(
                    "commit decision is not persisted".to_string(),
                ));
            }
        }

        let mut remaining = self.groups.clone();
        let mut last_error = None;
        for _ in 0..COMMIT_FANOUT_RETRIES {
            remaining.retain(|(group, xid)| match group.commit(*xid, false) {
                Ok(()) => false,
                Err(e) => {
                    warn!(%xid, error = %e, "commit fan-out attempt failed");
                    last_error = Some(e);
                    true
                }
            });
            if remaining.is_empty() {
                break;
            }
        }
        if let Some(e) = last_error.filter(|_| !remaining.is_empty()) {
            return Err(e);
        }

        self.state = CoordinatorState::Committed;
        self.release_shared_quietly();
        Ok(())
    }

    pub fn rollback(&mut self) -> EngineResult<()> {
        match self.state {
            CoordinatorState::Active => {
                self.rollback_internal();
                Ok(())
            }
            CoordinatorState::Aborted => Ok(()),
            _ => Err(EngineError::IllegalState(
                "cross-group transaction cannot roll back".to_string(),
            )),
        }
    }

    fn rollback_internal(&mut self) {
        for (group, xid) in &self.groups {
            if let Err(e) = group.abort(*xid) {
                warn!(%xid, error = %e, "abort fan-out failed");
            }
        }
        self.release_shared_quietly();
        self.state = CoordinatorState::Aborted;
    }

    fn release_shared_quietly(&self) {
        if let Some(tid) = self.tid {
            if let Err(e) = self.stsm.release_shared(tid) {
                debug!(%tid, error = %e, "shared timestamp already released");
            }
        }
    }

    fn expect_tid(&self) -> EngineResult<Tid> {
        self.tid.ok_or_else(|| {
            EngineError::IllegalState("cross-group transaction has no timestamp".to_string())
        })
    }
}
