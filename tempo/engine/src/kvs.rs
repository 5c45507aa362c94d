//! The contract between the engine and the multi-version store hosting it.
//!
//! The engine never performs physical I/O itself. It receives a
//! [`KeyValueStore`] capability for version deletion, and the store invites
//! the engine into every transactional get/put/delete through the
//! [`TransactionObserver`] channel, both before and after the store acts.
//! Errors returned from a `before_*` hook must prevent the store action;
//! failures after a successful `before_*` must be reported via `failed_*` so
//! the engine can unwind its bookkeeping.

use std::collections::BTreeMap;
use std::io;
use std::sync::{Mutex, Weak};

use tempo_common::{Key, KeyVersions, Tid};

use crate::error::EngineResult;

/// Version-deletion capability of the underlying multi-version cell store.
///
/// Both operations must be idempotent. `delete_versions` must remove
/// versions oldest-first when it is not atomic, so a crash between
/// individual deletions never removes a version that a still-live older
/// transaction needs to answer a read.
pub trait KeyValueStore<K: Key>: Send + Sync {
    /// Delete the exact version `(key, version)` if present.
    fn delete_version(&self, key: &K, version: u64) -> io::Result<()>;

    /// Delete every version of `key` with a timestamp <= `up_to`.
    fn delete_versions(&self, key: &K, up_to: u64) -> io::Result<()>;
}

/// Host lifecycle channel. The store drives the engine through startup
/// (recovery) and shutdown.
pub trait LifecycleListener: Send + Sync {
    /// The host is starting; recover durable state. Failing here fails
    /// startup.
    fn starting(&self) -> EngineResult<()>;

    fn started(&self) {}

    /// The host is shutting down; wake blocked transactions and stop
    /// accepting work.
    fn stopping(&self);

    fn stopped(&self) {}

    /// The host is aborting hard; release every transaction's timestamp so
    /// peers are not blocked on a dead instance.
    fn aborting(&self);
}

/// Transaction-operation channel: the store invites the engine into every
/// get/put/delete it executes on behalf of a transaction.
pub trait TransactionObserver<K: Key>: Send + Sync {
    fn before_get(&self, tid: Tid, keys: &[K]) -> EngineResult<()>;

    /// Called with the candidate versions the store found for each key,
    /// newest first. The engine narrows each entry down to the single
    /// version the transaction is allowed to observe.
    fn after_get(&self, tid: Tid, results: &mut [KeyVersions<K>]) -> EngineResult<()>;

    fn failed_get(&self, tid: Tid, keys: &[K], error: &io::Error) -> EngineResult<()>;

    fn before_put(&self, tid: Tid, keys: &[K]) -> EngineResult<()>;

    fn after_put(&self, tid: Tid, keys: &[K]) -> EngineResult<()>;

    fn failed_put(&self, tid: Tid, keys: &[K], error: &io::Error) -> EngineResult<()>;

    fn before_delete(&self, tid: Tid, keys: &[K]) -> EngineResult<()>;

    fn after_delete(&self, tid: Tid, keys: &[K]) -> EngineResult<()>;

    fn failed_delete(&self, tid: Tid, keys: &[K], error: &io::Error) -> EngineResult<()>;
}

/// A cell value; `None` is a delete marker.
type Cell = Option<Vec<u8>>;

/// In-memory multi-version store.
///
/// Serves as the reference implementation of the store side of the observer
/// protocol and as the fixture for engine tests: transactional entry points
/// drive the `before_*`/`after_*` hooks exactly the way a hosting store
/// would, and `write_version` bypasses them to simulate external writers.
pub struct MemoryKeyValueStore<K: Key> {
    cells: Mutex<BTreeMap<K, BTreeMap<u64, Cell>>>,
    observer: Mutex<Option<Weak<dyn TransactionObserver<K>>>>,
    lifecycle: Mutex<Vec<Weak<dyn LifecycleListener>>>,
}

impl<K: Key> MemoryKeyValueStore<K> {
    pub fn new() -> Self {
        Self {
            cells: Mutex::new(BTreeMap::new()),
            observer: Mutex::new(None),
            lifecycle: Mutex::new(Vec::new()),
        }
    }

    pub fn set_observer(&self, observer: Weak<dyn TransactionObserver<K>>) {
        *self.observer.lock().unwrap() = Some(observer);
    }

    pub fn add_lifecycle_listener(&self, listener: Weak<dyn LifecycleListener>) {
        self.lifecycle.lock().unwrap().push(listener);
    }

    /// Drive registered lifecycle listeners through startup.
    pub fn start(&self) -> EngineResult<()> {
        let listeners = self.lifecycle.lock().unwrap().clone();
        for listener in listeners.iter().filter_map(Weak::upgrade) {
            listener.starting()?;
        }
        for listener in listeners.iter().filter_map(Weak::upgrade) {
            listener.started();
        }
        Ok(())
    }

    /// Drive registered lifecycle listeners through shutdown.
    pub fn stop(&self) {
        let listeners = self.lifecycle.lock().unwrap().clone();
        for listener in listeners.iter().filter_map(Weak::upgrade) {
            listener.stopping();
        }
        for listener in listeners.iter().filter_map(Weak::upgrade) {
            listener.stopped();
        }
    }

    fn with_observer<R>(
        &self,
        f: impl FnOnce(&dyn TransactionObserver<K>) -> EngineResult<R>,
        fallback: R,
    ) -> EngineResult<R> {
        let observer = self.observer.lock().unwrap().clone();
        match observer.and_then(|weak| weak.upgrade()) {
            Some(observer) => f(observer.as_ref()),
            None => Ok(fallback),
        }
    }

    /// Write a version directly, without consulting the engine. Models data
    /// that predates the engine or writes racing past it.
    pub fn write_version(&self, key: &K, version: u64, value: Vec<u8>) {
        self.cells
            .lock()
            .unwrap()
            .entry(key.clone())
            .or_default()
            .insert(version, Some(value));
    }

    /// All versions of `key`, oldest first.
    pub fn versions(&self, key: &K) -> Vec<u64> {
        self.cells
            .lock()
            .unwrap()
            .get(key)
            .map(|versions| versions.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Transactional read: returns the version the engine chose, along with
    /// its value (`None` when the chosen version is a delete marker or no
    /// version is visible).
    pub fn get(&self, tid: Tid, key: &K) -> EngineResult<Option<(u64, Cell)>> {
        self.with_observer(|obs| obs.before_get(tid, std::slice::from_ref(key)), ())?;

        let candidates: Vec<u64> = {
            let cells = self.cells.lock().unwrap();
            cells
                .get(key)
                .map(|versions| versions.range(..=tid.raw()).rev().map(|(v, _)| *v).collect())
                .unwrap_or_default()
        };

        let mut results = [KeyVersions::new(key.clone(), candidates)];
        self.with_observer(|obs| obs.after_get(tid, &mut results), ())?;

        let chosen = match results[0].versions.first() {
            Some(version) => *version,
            None => return Ok(None),
        };
        let value = self
            .cells
            .lock()
            .unwrap()
            .get(key)
            .and_then(|versions| versions.get(&chosen))
            .cloned()
            .flatten();
        Ok(Some((chosen, value)))
    }

    /// Transactional write: the new version is tagged with the transaction's
    /// timestamp. A `before_put` error prevents the write.
    pub fn put(&self, tid: Tid, key: &K, value: Vec<u8>) -> EngineResult<()> {
        self.with_observer(|obs| obs.before_put(tid, std::slice::from_ref(key)), ())?;
        self.cells
            .lock()
            .unwrap()
            .entry(key.clone())
            .or_default()
            .insert(tid.raw(), Some(value));
        self.with_observer(|obs| obs.after_put(tid, std::slice::from_ref(key)), ())
    }

    /// Transactional delete: writes a delete marker version tagged with the
    /// transaction's timestamp.
    pub fn delete(&self, tid: Tid, key: &K) -> EngineResult<()> {
        self.with_observer(|obs| obs.before_delete(tid, std::slice::from_ref(key)), ())?;
        self.cells
            .lock()
            .unwrap()
            .entry(key.clone())
            .or_default()
            .insert(tid.raw(), None);
        self.with_observer(|obs| obs.after_delete(tid, std::slice::from_ref(key)), ())
    }
}

impl<K: Key> Default for MemoryKeyValueStore<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Key> KeyValueStore<K> for MemoryKeyValueStore<K> {
    fn delete_version(&self, key: &K, version: u64) -> io::Result<()> {
        let mut cells = self.cells.lock().unwrap();
        if let Some(versions) = cells.get_mut(key) {
            versions.remove(&version);
            if versions.is_empty() {
                cells.remove(key);
            }
        }
        Ok(())
    }

    fn delete_versions(&self, key: &K, up_to: u64) -> io::Result<()> {
        let mut cells = self.cells.lock().unwrap();
        if let Some(versions) = cells.get_mut(key) {
            // Oldest first, per the non-atomic deletion contract.
            let doomed: Vec<u64> = versions.range(..=up_to).map(|(v, _)| *v).collect();
            for version in doomed {
                versions.remove(&version);
            }
            if versions.is_empty() {
                cells.remove(key);
            }
        }
        Ok(())
    }
}
