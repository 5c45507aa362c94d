mod common;

use std::sync::Arc;

use common::*;
use tempo_engine::{AbortReason, CrossGroupCoordinator, EngineError, TxnState};
use tempo_tsm::{SharedLocalTimestampManager, SharedTimestampManager, TimestampManager};

// ========== TWO-PHASE COMMIT ==========

/// Two groups prepare and commit under one shared timestamp; all versions
/// are durable and the shared timestamp is released.
#[test]
fn test_two_phase_commit_success() {
    let stsm = Arc::new(SharedLocalTimestampManager::new());
    let g1 = group(&stsm);
    let g2 = group(&stsm);
    let a = "a".to_string();
    let b = "b".to_string();

    let mut coordinator = CrossGroupCoordinator::new(stsm.clone());
    let tid = coordinator.begin().unwrap();
    coordinator.enlist(&g1.manager).unwrap();
    coordinator.enlist(&g2.manager).unwrap();

    g1.kvs.get(tid, &a).unwrap();
    g1.kvs.put(tid, &a, b"1".to_vec()).unwrap();
    g2.kvs.get(tid, &b).unwrap();
    g2.kvs.put(tid, &b, b"2".to_vec()).unwrap();

    coordinator.commit().unwrap();

    assert_eq!(g1.kvs.versions(&a), vec![tid.raw()]);
    assert_eq!(g2.kvs.versions(&b), vec![tid.raw()]);
    assert!(!stsm.is_held_by_caller(tid));
}

/// A single-group distributed transaction degenerates to one-phase commit.
#[test]
fn test_single_group_commits_one_phase() {
    let stsm = Arc::new(SharedLocalTimestampManager::new());
    let g1 = group(&stsm);
    let a = "a".to_string();

    let mut coordinator = CrossGroupCoordinator::new(stsm.clone());
    let tid = coordinator.begin().unwrap();
    coordinator.enlist(&g1.manager).unwrap();

    g1.kvs.get(tid, &a).unwrap();
    g1.kvs.put(tid, &a, b"1".to_vec()).unwrap();

    coordinator.commit().unwrap();

    assert_eq!(g1.kvs.versions(&a), vec![tid.raw()]);
    assert!(!stsm.is_held_by_caller(tid));
}

/// Once the commit decision is persisted, a replacement coordinator can
/// re-drive the commit fan-out on behalf of a dead predecessor and every
/// participant still commits.
#[test]
fn test_commit_fanout_survives_coordinator_replacement() {
    let stsm = Arc::new(SharedLocalTimestampManager::new());
    let g1 = group(&stsm);
    let g2 = group(&stsm);
    let a = "a".to_string();
    let b = "b".to_string();

    let (tid, x1, x2) = {
        let mut coordinator = CrossGroupCoordinator::new(stsm.clone());
        let tid = coordinator.begin().unwrap();
        let x1 = coordinator.enlist(&g1.manager).unwrap();
        let x2 = coordinator.enlist(&g2.manager).unwrap();

        g1.kvs.get(tid, &a).unwrap();
        g1.kvs.put(tid, &a, b"1".to_vec()).unwrap();
        g2.kvs.get(tid, &b).unwrap();
        g2.kvs.put(tid, &b, b"2".to_vec()).unwrap();

        // The coordinator gets through prepare and the point of no return,
        // then dies before the commit fan-out.
        g1.manager.prepare(x1).unwrap();
        g2.manager.prepare(x2).unwrap();
        stsm.persist_references(tid, vec![x1.pid(), x2.pid()]).unwrap();
        (tid, x1, x2)
    };

    assert_eq!(g1.manager.manager().state_of(tid), Some(TxnState::Prepared));

    let mut replacement = CrossGroupCoordinator::resume(
        stsm.clone(),
        tid,
        vec![(g1.manager.clone(), x1), (g2.manager.clone(), x2)],
    )
    .unwrap();
    replacement.complete().unwrap();

    assert_eq!(g1.kvs.versions(&a), vec![tid.raw()]);
    assert_eq!(g2.kvs.versions(&b), vec![tid.raw()]);
    assert!(!stsm.is_held_by_caller(tid));

    // Re-driving the fan-out after completion is a no-op.
    replacement.complete().unwrap();
    let _ = x2;
}

/// A replacement coordinator cannot exist without a persisted decision.
#[test]
fn test_resume_requires_persisted_decision() {
    let stsm = Arc::new(SharedLocalTimestampManager::new());
    let g1 = group(&stsm);
    let ts = stsm.acquire_shared().unwrap();
    let xid = g1.manager.join(ts).unwrap();

    let result = CrossGroupCoordinator::resume(stsm.clone(), ts, vec![(g1.manager.clone(), xid)]);
    assert!(matches!(result, Err(EngineError::IllegalState(_))));
}

// ========== TWO-PHASE ABORT ==========

/// One participant's vote fails with a write conflict; the coordinator
/// aborts everyone and all tentative versions disappear.
#[test]
fn test_failed_vote_aborts_all_participants() {
    let stsm = Arc::new(SharedLocalTimestampManager::new());
    let g1 = group(&stsm);
    let g2 = group(&stsm);
    let a = "a".to_string();
    let b = "b".to_string();

    let mut coordinator = CrossGroupCoordinator::new(stsm.clone());
    let tid = coordinator.begin().unwrap();
    coordinator.enlist(&g1.manager).unwrap();
    coordinator.enlist(&g2.manager).unwrap();

    g1.kvs.get(tid, &a).unwrap();
    g1.kvs.put(tid, &a, b"1".to_vec()).unwrap();

    // A younger local transaction in group 2 reads "b" before the
    // participant writes it: MVTO rule 2a dooms the participant's write.
    let local = g2.manager.manager().begin().unwrap();
    g2.kvs.get(local, &b).unwrap();

    g2.kvs.get(tid, &b).unwrap();
    let err = g2.kvs.put(tid, &b, b"2".to_vec()).unwrap_err();
    assert!(matches!(
        err,
        EngineError::TransactionAborted {
            reason: AbortReason::WriteConflict,
            ..
        }
    ));

    // The coordinator's prepare fan-out surfaces the conflict and rolls
    // everyone back.
    let err = coordinator.commit().unwrap_err();
    assert!(matches!(
        err,
        EngineError::TransactionAborted {
            reason: AbortReason::WriteConflict,
            ..
        }
    ));

    assert!(g1.kvs.versions(&a).is_empty());
    assert!(g2.kvs.versions(&b).is_empty());
    assert!(!stsm.is_held_by_caller(tid));

    g2.manager.manager().abort(local).unwrap();
}

/// A participant whose read dependency aborts cannot vote commit.
#[test]
fn test_prepare_cascades_on_aborted_dependency() {
    let stsm = Arc::new(SharedLocalTimestampManager::new());
    let g1 = group(&stsm);
    let b = "b".to_string();

    // A local transaction writes "b" and never commits.
    let local = g1.manager.manager().begin().unwrap();
    g1.kvs.get(local, &b).unwrap();
    g1.kvs.put(local, &b, b"tentative".to_vec()).unwrap();

    let mut coordinator = CrossGroupCoordinator::new(stsm.clone());
    let tid = coordinator.begin().unwrap();
    let xid = coordinator.enlist(&g1.manager).unwrap();

    // The participant observes the uncommitted version.
    let (version, _) = g1.kvs.get(tid, &b).unwrap().unwrap();
    assert_eq!(version, local.raw());

    g1.manager.manager().abort(local).unwrap();

    let err = g1.manager.prepare(xid).unwrap_err();
    assert!(matches!(
        err,
        EngineError::TransactionAborted {
            reason: AbortReason::CascadedAbort(dep),
            ..
        } if dep == local
    ));

    coordinator.rollback().unwrap();
    assert!(g1.kvs.versions(&b).is_empty());
}

// ========== RELEASED TIMESTAMPS ==========

/// A participant that has not prepared aborts unilaterally when the shared
/// timestamp is released out from under it.
#[test]
fn test_unprepared_participant_aborts_on_release() {
    let stsm = Arc::new(SharedLocalTimestampManager::new());
    let g1 = group(&stsm);
    let a = "a".to_string();

    // An older live timestamp pins the reclamation bound so the aborted
    // participant stays inspectable.
    let pin = stsm.acquire().unwrap();
    let ts = stsm.acquire_shared().unwrap();
    let xid = g1.manager.join(ts).unwrap();
    g1.kvs.get(ts, &a).unwrap();
    g1.kvs.put(ts, &a, b"1".to_vec()).unwrap();

    // The coordinator vanishes; its timestamp is released.
    stsm.release_shared(ts).unwrap();

    assert_eq!(g1.manager.manager().state_of(ts), Some(TxnState::Finalized));
    assert!(g1.kvs.versions(&a).is_empty());

    let err = g1.manager.prepare(xid).unwrap_err();
    assert!(matches!(
        err,
        EngineError::TransactionAborted {
            reason: AbortReason::Deadline,
            ..
        }
    ));

    stsm.release(pin).unwrap();
}

/// Prepared participants are bound to the coordinator's decision and ignore
/// a released signal.
#[test]
fn test_prepared_participant_ignores_release() {
    let stsm = Arc::new(SharedLocalTimestampManager::new());
    let g1 = group(&stsm);
    let g2 = group(&stsm);
    let a = "a".to_string();

    let mut coordinator = CrossGroupCoordinator::new(stsm.clone());
    let tid = coordinator.begin().unwrap();
    let x1 = coordinator.enlist(&g1.manager).unwrap();
    coordinator.enlist(&g2.manager).unwrap();

    g1.kvs.get(tid, &a).unwrap();
    g1.kvs.put(tid, &a, b"1".to_vec()).unwrap();

    g1.manager.prepare(x1).unwrap();
    stsm.release_shared(tid).unwrap();

    // Still prepared, still holding its tentative write.
    assert_eq!(g1.manager.manager().state_of(tid), Some(TxnState::Prepared));
    assert_eq!(g1.kvs.versions(&a), vec![tid.raw()]);
}
