use std::io;

use tempo_common::Tid;
use tempo_tsm::TsmError;
use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("transaction {tid} aborted: {reason}")]
    TransactionAborted { tid: Tid, reason: AbortReason },

    #[error("no such transaction: {0}")]
    NoSuchTransaction(Tid),

    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("transaction log error: {0}")]
    Log(#[from] LogError),

    #[error("timestamp manager error: {0}")]
    Timestamp(#[from] TsmError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Why a transaction was aborted.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// A write would have invalidated a committed or pending read of a
    /// younger transaction (MVTO rule 2a).
    #[error("write conflict")]
    WriteConflict,

    /// A transaction this one read from aborted.
    #[error("cascaded abort of dependency {0}")]
    CascadedAbort(Tid),

    /// The engine entered shutdown while the transaction was blocked.
    #[error("engine stopped")]
    EngineStopped,

    /// The transaction outlived its timestamp lease.
    #[error("timestamp lease expired")]
    Deadline,

    /// The underlying store failed an operation the transaction had already
    /// announced.
    #[error("I/O failure: {0}")]
    Io(String),
}

#[derive(Error, Debug)]
pub enum LogError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("data corruption: checksum mismatch")]
    ChecksumMismatch,

    #[error("record serialization failed: {0}")]
    SerializationFailed(String),

    #[error("record deserialization failed: {0}")]
    DeserializationFailed(String),
}
