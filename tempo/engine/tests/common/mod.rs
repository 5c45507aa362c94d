use std::sync::{Arc, Weak};
use std::time::Duration;

use tempo_engine::{
    MemoryKeyValueStore, MemoryLog, MvtoTxnManager, TransactionObserver, XaTxnManager,
};
use tempo_tsm::{LocalTimestampManager, SharedLocalTimestampManager};

#[allow(dead_code)]
pub struct Fixture {
    pub manager: Arc<MvtoTxnManager<String>>,
    pub kvs: Arc<MemoryKeyValueStore<String>>,
    pub log: Arc<MemoryLog<String>>,
    pub tsm: Arc<LocalTimestampManager>,
}

#[allow(dead_code)]
pub fn fixture() -> Fixture {
    let kvs = Arc::new(MemoryKeyValueStore::new());
    let log = Arc::new(MemoryLog::new());
    let tsm = Arc::new(LocalTimestampManager::new());
    let manager = MvtoTxnManager::new(kvs.clone(), log.clone(), tsm.clone());
    manager.start().unwrap();
    let observer_arc: Arc<dyn TransactionObserver<String>> = manager.clone();
    let observer: Weak<dyn TransactionObserver<String>> = Arc::downgrade(&observer_arc);
    kvs.set_observer(observer);
    Fixture {
        manager,
        kvs,
        log,
        tsm,
    }
}

#[allow(dead_code)]
pub struct Group {
    pub manager: Arc<XaTxnManager<String>>,
    pub kvs: Arc<MemoryKeyValueStore<String>>,
    pub log: Arc<MemoryLog<String>>,
}

/// One engine instance (locality group) wired to the shared timestamp
/// manager.
#[allow(dead_code)]
pub fn group(stsm: &Arc<SharedLocalTimestampManager>) -> Group {
    let kvs = Arc::new(MemoryKeyValueStore::new());
    let log = Arc::new(MemoryLog::new());
    let manager = XaTxnManager::new(kvs.clone(), log.clone(), stsm.clone());
    manager.start().unwrap();
    let observer_arc: Arc<dyn TransactionObserver<String>> = manager.manager().clone();
    let observer: Weak<dyn TransactionObserver<String>> = Arc::downgrade(&observer_arc);
    kvs.set_observer(observer);
    Group { manager, kvs, log }
}

/// Poll `predicate` for up to two seconds.
#[allow(dead_code)]
pub fn eventually(predicate: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}
