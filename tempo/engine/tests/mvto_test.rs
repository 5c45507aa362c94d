mod common;

use std::sync::Arc;
use std::thread;

use common::*;
use serial_test::serial;
use tempo_engine::{
    AbortReason, EngineError, FileLog, KeyVersions, LogOp, MemoryKeyValueStore, MvtoTxnManager,
    Tid, TransactionLog, TransactionObserver, TxnState,
};
use tempo_tsm::LocalTimestampManager;

// ========== WRITE CONFLICTS ==========

/// Key "x" starts at version 0; two transactions read it, then both try to
/// overwrite it. The older writer must fail MVTO rule 2a because the younger
/// transaction read the old version; the younger writer succeeds.
#[test]
fn test_write_conflict() {
    let f = fixture();
    let key = "x".to_string();
    f.kvs.write_version(&key, 0, b"v0".to_vec());

    let t1 = f.manager.begin().unwrap();
    let t2 = f.manager.begin().unwrap();
    assert_eq!((t1.raw(), t2.raw()), (1, 2));

    let (version, _) = f.kvs.get(t1, &key).unwrap().unwrap();
    assert_eq!(version, 0);
    let (version, _) = f.kvs.get(t2, &key).unwrap().unwrap();
    assert_eq!(version, 0);

    // The store races t1's version in before the engine's check; the write
    // is rejected and the tentative version rolled back.
    f.kvs.write_version(&key, 1, b"v1".to_vec());
    let err = f.manager.before_put(t1, &[key.clone()]).unwrap_err();
    assert!(matches!(
        err,
        EngineError::TransactionAborted {
            reason: AbortReason::WriteConflict,
            ..
        }
    ));

    f.kvs.write_version(&key, 2, b"v2".to_vec());
    f.manager.before_put(t2, &[key.clone()]).unwrap();
    f.manager.after_put(t2, &[key.clone()]).unwrap();
    f.manager.commit(t2).unwrap();

    assert_eq!(f.kvs.versions(&key), vec![0, 2]);
}

#[test]
fn test_concurrent_writers_of_different_keys_commit() {
    let f = fixture();
    let a = "a".to_string();
    let b = "b".to_string();

    let t1 = f.manager.begin().unwrap();
    let t2 = f.manager.begin().unwrap();

    f.kvs.get(t1, &a).unwrap();
    f.kvs.put(t1, &a, b"1".to_vec()).unwrap();
    f.kvs.get(t2, &b).unwrap();
    f.kvs.put(t2, &b, b"2".to_vec()).unwrap();

    f.manager.commit(t1).unwrap();
    f.manager.commit(t2).unwrap();

    assert_eq!(f.kvs.versions(&a), vec![t1.raw()]);
    assert_eq!(f.kvs.versions(&b), vec![t2.raw()]);
}

// ========== READ DEPENDENCIES ==========

/// A transaction that read an uncommitted version cannot commit before the
/// writer; its commit record must follow the writer's in the log.
#[test]
fn test_commit_waits_for_read_dependency() {
    let f = fixture();
    let key = "k".to_string();
    // Pin the reclamation bound so the log survives for inspection.
    let pin = f.manager.begin().unwrap();

    let t1 = f.manager.begin().unwrap();
    f.kvs.get(t1, &key).unwrap();
    f.kvs.put(t1, &key, b"a".to_vec()).unwrap();

    let t2 = f.manager.begin().unwrap();
    let (version, _) = f.kvs.get(t2, &key).unwrap().unwrap();
    assert_eq!(version, t1.raw());

    let manager = f.manager.clone();
    let committer = thread::spawn(move || manager.commit(t2));
    assert!(eventually(|| f.manager.state_of(t2) == Some(TxnState::Blocked)));

    f.manager.commit(t1).unwrap();
    committer.join().unwrap().unwrap();

    let records = f.log.records();
    let commit_sid = |tid: Tid| {
        records
            .iter()
            .find(|r| {
                r.tid == tid
                    && matches!(r.op, LogOp::StateTransition { state: TxnState::Committed })
            })
            .map(|r| r.sid)
            .unwrap()
    };
    assert!(commit_sid(t1) < commit_sid(t2));

    f.manager.abort(pin).unwrap();
}

/// Aborting the writer cascades into every transaction that read from it.
#[test]
fn test_cascaded_abort_rolls_back_dependents() {
    let f = fixture();
    let k = "k".to_string();
    let other = "other".to_string();

    let t1 = f.manager.begin().unwrap();
    f.kvs.get(t1, &k).unwrap();
    f.kvs.put(t1, &k, b"a".to_vec()).unwrap();

    let t2 = f.manager.begin().unwrap();
    let (version, _) = f.kvs.get(t2, &k).unwrap().unwrap();
    assert_eq!(version, t1.raw());
    f.kvs.get(t2, &other).unwrap();
    f.kvs.put(t2, &other, b"b".to_vec()).unwrap();
    assert_eq!(f.kvs.versions(&other), vec![t2.raw()]);

    f.manager.abort(t1).unwrap();

    let err = f.manager.commit(t2).unwrap_err();
    assert!(matches!(
        err,
        EngineError::TransactionAborted {
            reason: AbortReason::CascadedAbort(dep),
            ..
        } if dep == t1
    ));

    // Both transactions' tentative versions are gone.
    assert!(f.kvs.versions(&k).is_empty());
    assert!(f.kvs.versions(&other).is_empty());
}

// ========== BLOCKED READS ==========

/// A read that observed a version older than a concurrent writer in the
/// forbidden band blocks until the writer finalizes; if the writer commits,
/// the read is unrepairable and the reader aborts.
#[test]
fn test_banded_read_aborts_when_writer_commits() {
    let f = fixture();
    let key = "x".to_string();
    f.kvs.write_version(&key, 0, b"v0".to_vec());

    let t1 = f.manager.begin().unwrap();
    f.kvs.get(t1, &key).unwrap();
    f.kvs.put(t1, &key, b"v1".to_vec()).unwrap();

    let t2 = f.manager.begin().unwrap();
    // The store served t2 the old version while t1's write is in flight.
    let manager = f.manager.clone();
    let key_clone = key.clone();
    let reader = thread::spawn(move || {
        let mut results = vec![KeyVersions::new(key_clone, vec![0])];
        manager.after_get(t2, &mut results)
    });
    assert!(eventually(|| f.manager.state_of(t2) == Some(TxnState::Blocked)));

    f.manager.commit(t1).unwrap();

    let err = reader.join().unwrap().unwrap_err();
    assert!(matches!(
        err,
        EngineError::TransactionAborted {
            reason: AbortReason::WriteConflict,
            ..
        }
    ));
}

/// Same band, but the writer aborts: its version is rolled back and the
/// blocked read resumes against the old version.
#[test]
fn test_banded_read_resumes_when_writer_aborts() {
    let f = fixture();
    let key = "x".to_string();
    f.kvs.write_version(&key, 0, b"v0".to_vec());

    let t1 = f.manager.begin().unwrap();
    f.kvs.get(t1, &key).unwrap();
    f.kvs.put(t1, &key, b"v1".to_vec()).unwrap();

    let t2 = f.manager.begin().unwrap();
    let manager = f.manager.clone();
    let key_clone = key.clone();
    let reader = thread::spawn(move || {
        let mut results = vec![KeyVersions::new(key_clone.clone(), vec![0])];
        manager.after_get(t2, &mut results).map(|_| results)
    });
    assert!(eventually(|| f.manager.state_of(t2) == Some(TxnState::Blocked)));

    f.manager.abort(t1).unwrap();

    let results = reader.join().unwrap().unwrap();
    assert_eq!(results[0].versions, vec![0]);
    f.manager.commit(t2).unwrap();
}

// ========== SHUTDOWN ==========

/// Shutdown must not deadlock against a blocked transaction; the waiter
/// fails with EngineStopped instead.
#[test]
fn test_stop_unblocks_waiting_commit() {
    let f = fixture();
    let key = "k".to_string();

    let t1 = f.manager.begin().unwrap();
    f.kvs.get(t1, &key).unwrap();
    f.kvs.put(t1, &key, b"a".to_vec()).unwrap();

    let t2 = f.manager.begin().unwrap();
    f.kvs.get(t2, &key).unwrap();

    let manager = f.manager.clone();
    let committer = thread::spawn(move || manager.commit(t2));
    assert!(eventually(|| f.manager.state_of(t2) == Some(TxnState::Blocked)));

    f.manager.stop();

    let err = committer.join().unwrap().unwrap_err();
    assert!(matches!(
        err,
        EngineError::TransactionAborted {
            reason: AbortReason::EngineStopped,
            ..
        }
    ));
}

// ========== GARBAGE COLLECTION ==========

/// Once no live transaction can reach them, finished transactions are
/// deleted, obsolete versions are dropped from the store, and the log is
/// truncated.
#[test]
fn test_reclamation_collects_versions_and_truncates_log() {
    let f = fixture();
    let key = "k".to_string();
    f.kvs.write_version(&key, 0, b"v0".to_vec());

    let pin = f.manager.begin().unwrap();

    let t1 = f.manager.begin().unwrap();
    let (version, _) = f.kvs.get(t1, &key).unwrap().unwrap();
    assert_eq!(version, 0);
    f.kvs.put(t1, &key, b"v1".to_vec()).unwrap();
    f.manager.commit(t1).unwrap();

    let t2 = f.manager.begin().unwrap();
    let (version, _) = f.kvs.get(t2, &key).unwrap().unwrap();
    assert_eq!(version, t1.raw());
    f.kvs.put(t2, &key, b"v2".to_vec()).unwrap();
    f.manager.commit(t2).unwrap();

    assert_eq!(f.kvs.versions(&key), vec![0, t1.raw(), t2.raw()]);
    assert!(!f.log.records().is_empty());

    // Dropping the pin advances the reclamation bound past everything.
    f.manager.abort(pin).unwrap();

    // t2's committed write superseded t1's version; everything below the
    // version t2 read is gone, the version itself stays as the floor.
    assert_eq!(f.kvs.versions(&key), vec![t1.raw(), t2.raw()]);
    assert!(f.log.records().is_empty());
    assert_eq!(f.manager.reader_count(), 0);
    assert_eq!(f.manager.active_writer_count(), 0);
    assert!(f.manager.state_of(t1).is_none());
    assert!(f.manager.state_of(t2).is_none());
}

// ========== RECOVERY ==========

fn scenario_log(path: &std::path::Path) -> Arc<FileLog<String>> {
    let log: FileLog<String> = FileLog::open(path).unwrap();
    let x = "x".to_string();
    // t1 aborted after writing; the crash hit before its rollback ran.
    log.append_state_transition(Tid::new(1), TxnState::Started).unwrap();
    log.append_get(Tid::new(1), &x, 0).unwrap();
    log.append_put(Tid::new(1), &x).unwrap();
    log.append_state_transition(Tid::new(1), TxnState::Aborted).unwrap();
    // t2 committed; the crash hit before finalization.
    log.append_state_transition(Tid::new(2), TxnState::Started).unwrap();
    log.append_get(Tid::new(2), &x, 0).unwrap();
    log.append_put(Tid::new(2), &x).unwrap();
    log.append_state_transition(Tid::new(2), TxnState::Committed).unwrap();
    Arc::new(log)
}

/// Restarting over a log with a half-finished abort and a non-finalized
/// commit re-drives both finalizations and leaves clean conflict indices.
#[test]
#[serial]
fn test_recovery_finalizes_decided_transactions() {
    let path =
        std::env::temp_dir().join(format!("tempo_recovery_{}.log", std::process::id()));
    let _ = std::fs::remove_file(&path);

    let x = "x".to_string();
    let kvs: Arc<MemoryKeyValueStore<String>> = Arc::new(MemoryKeyValueStore::new());
    kvs.write_version(&x, 0, b"v0".to_vec());
    kvs.write_version(&x, 1, b"v1".to_vec());
    kvs.write_version(&x, 2, b"v2".to_vec());

    let log = scenario_log(&path);
    let tsm = Arc::new(LocalTimestampManager::new());
    let manager = MvtoTxnManager::new(kvs.clone(), log, tsm);
    manager.start().unwrap();

    assert_eq!(manager.state_of(Tid::new(1)), Some(TxnState::Finalized));
    assert_eq!(manager.state_of(Tid::new(2)), Some(TxnState::Finalized));
    assert_eq!(manager.reader_count(), 0);
    assert_eq!(manager.active_writer_count(), 0);
    // t1's tentative version was rolled back, t2's survives.
    assert_eq!(kvs.versions(&x), vec![0, 2]);

    let _ = std::fs::remove_file(&path);
}

/// Recovery is idempotent: replaying the post-recovery log reproduces the
/// same state.
#[test]
#[serial]
fn test_recovery_is_idempotent() {
    let path =
        std::env::temp_dir().join(format!("tempo_recovery_twice_{}.log", std::process::id()));
    let _ = std::fs::remove_file(&path);

    let x = "x".to_string();
    let kvs: Arc<MemoryKeyValueStore<String>> = Arc::new(MemoryKeyValueStore::new());
    kvs.write_version(&x, 0, b"v0".to_vec());
    kvs.write_version(&x, 1, b"v1".to_vec());
    kvs.write_version(&x, 2, b"v2".to_vec());

    {
        let log = scenario_log(&path);
        let tsm = Arc::new(LocalTimestampManager::new());
        let manager = MvtoTxnManager::new(kvs.clone(), log, tsm);
        manager.start().unwrap();
        manager.stop();
    }
    {
        let log: Arc<FileLog<String>> = Arc::new(FileLog::open(&path).unwrap());
        let tsm = Arc::new(LocalTimestampManager::new());
        let manager = MvtoTxnManager::new(kvs.clone(), log, tsm);
        manager.start().unwrap();

        assert_eq!(manager.state_of(Tid::new(1)), Some(TxnState::Finalized));
        assert_eq!(manager.state_of(Tid::new(2)), Some(TxnState::Finalized));
        assert_eq!(kvs.versions(&x), vec![0, 2]);
    }

    let _ = std::fs::remove_file(&path);
}

/// A started transaction whose timestamp is no longer held is aborted on
/// recovery; one whose timestamp survives stays live.
#[test]
#[serial]
fn test_recovery_aborts_orphaned_transactions() {
    let path =
        std::env::temp_dir().join(format!("tempo_recovery_orphan_{}.log", std::process::id()));
    let _ = std::fs::remove_file(&path);

    let k = "k".to_string();
    let kvs: Arc<MemoryKeyValueStore<String>> = Arc::new(MemoryKeyValueStore::new());

    let log: Arc<FileLog<String>> = Arc::new(FileLog::open(&path).unwrap());
    let tsm = Arc::new(LocalTimestampManager::new());

    // The survivor's timestamp is still held; the orphan's is not.
    let survivor = {
        use tempo_tsm::TimestampManager;
        tsm.acquire().unwrap()
    };
    log.append_state_transition(survivor, TxnState::Started).unwrap();
    log.append_get(survivor, &k, 0).unwrap();
    let orphan = Tid::new(100);
    log.append_state_transition(orphan, TxnState::Started).unwrap();
    log.append_get(orphan, &k, 0).unwrap();
    log.append_put(orphan, &k).unwrap();
    kvs.write_version(&k, orphan.raw(), b"zombie".to_vec());

    let manager = MvtoTxnManager::new(kvs.clone(), log, tsm);
    manager.start().unwrap();

    assert_eq!(manager.state_of(survivor), Some(TxnState::Started));
    assert_eq!(manager.state_of(orphan), Some(TxnState::Finalized));
    assert!(kvs.versions(&k).is_empty());

    let _ = std::fs::remove_file(&path);
}
