use tempo_common::Tid;
use thiserror::Error;

pub type TsmResult<T> = Result<T, TsmError>;

#[derive(Error, Debug)]
pub enum TsmError {
    #[error("no such timestamp: {0}")]
    NoSuchTimestamp(Tid),

    #[error("no such reference {pid} under timestamp {ts}")]
    NoSuchReference { ts: Tid, pid: u64 },

    #[error("timestamp space exhausted at {0}")]
    Exhausted(u64),
}
