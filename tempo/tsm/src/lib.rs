//! Timestamp management for the tempo transaction engine.
//!
//! A timestamp manager is the engine's id oracle: it issues monotonically
//! increasing timestamps (which become transaction ids), tracks which
//! timestamps are still live, and announces when the oldest live timestamp
//! advances so the engine can garbage-collect everything below the bound.
//!
//! The shared variant additionally issues child references under a
//! timestamp, which distributed transactions use both as participant ids and
//! as the durable commit decision record of two-phase commit.

pub mod error;
pub mod local;

use tempo_common::Tid;

pub use crate::error::{TsmError, TsmResult};
pub use crate::local::{LocalTimestampManager, SharedLocalTimestampManager};

/// Callback fired with the largest timestamp `ts` such that no live
/// timestamp is less than or equal to `ts`, whenever that bound advances.
pub type ReclamationListener = Box<dyn Fn(Tid) + Send + Sync>;

/// Callback fired when a specific shared timestamp is released.
pub type TimestampListener = Box<dyn Fn(Tid) + Send + Sync>;

/// Monotonic timestamp oracle with liveness tracking.
pub trait TimestampManager: Send + Sync {
    /// Issue the next timestamp and mark it live.
    fn acquire(&self) -> TsmResult<Tid>;

    /// Release a live timestamp. Unknown timestamps yield
    /// [`TsmError::NoSuchTimestamp`].
    fn release(&self, ts: Tid) -> TsmResult<()>;

    /// True while the timestamp is still held.
    fn is_held_by_caller(&self, ts: Tid) -> bool;

    /// Register a listener for reclamation events.
    fn add_reclamation_listener(&self, listener: ReclamationListener);
}

/// Timestamp manager for distributed transactions: a shared timestamp is
/// issued once per distributed transaction and child references are handed to
/// its participants.
pub trait SharedTimestampManager: TimestampManager {
    /// Issue a shared timestamp. It stays live until [`release_shared`] has
    /// been called *and* every child reference has been released.
    ///
    /// [`release_shared`]: SharedTimestampManager::release_shared
    fn acquire_shared(&self) -> TsmResult<Tid>;

    /// Release a shared timestamp and fire its timestamp listeners.
    fn release_shared(&self, ts: Tid) -> TsmResult<()>;

    /// Create a persistent child reference under a shared timestamp.
    fn acquire_reference(&self, ts: Tid) -> TsmResult<u64>;

    /// Release a child reference.
    fn release_reference(&self, ts: Tid, pid: u64) -> TsmResult<()>;

    /// Atomically persist the set of child references as the durable commit
    /// decision of the distributed transaction. This is the point of no
    /// return of two-phase commit.
    fn persist_references(&self, ts: Tid, pids: Vec<u64>) -> TsmResult<()>;

    /// The persisted commit decision for a shared timestamp, if any.
    fn persisted_references(&self, ts: Tid) -> Option<Vec<u64>>;

    /// Register a listener fired when the shared timestamp is released.
    fn add_timestamp_listener(&self, ts: Tid, listener: TimestampListener) -> TsmResult<()>;
}
