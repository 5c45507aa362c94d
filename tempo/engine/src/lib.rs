//! MVTO concurrency-control engine over a multi-version key/value store.
//!
//! The engine governs per-key read/write conflict detection,
//! timestamp-ordered serializability, commit-dependency tracking, durable
//! logging with crash recovery, garbage collection of obsolete versions, and
//! distributed prepare/commit across independent engine instances
//! coordinated via a shared timestamp oracle.

pub mod error;
pub mod kvs;
pub mod log;
pub mod manager;
pub mod transaction;
pub mod xa;

pub use error::{AbortReason, EngineError, EngineResult, LogError};
pub use kvs::{KeyValueStore, LifecycleListener, MemoryKeyValueStore, TransactionObserver};
pub use log::{FileLog, LogOp, LogRecord, MemoryLog, TransactionLog};
pub use manager::MvtoTxnManager;
pub use transaction::{MvtoTransaction, Outcome, TxnKind};
pub use xa::{CrossGroupCoordinator, XaTxnManager};

pub use tempo_common::{Key, KeyVersions, Tid, TxnState, Xid};
