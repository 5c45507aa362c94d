//! Transaction identifiers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A transaction identifier: the timestamp issued at `begin`.
///
/// The timestamp orders transactions in the serialization relation, and
/// doubles as the version tag of every cell the transaction writes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Tid(u64);

impl Tid {
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw timestamp value.
    pub const fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for Tid {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

/// Identifier of a participant's local slice of a distributed transaction:
/// the shared timestamp paired with a persistent child reference id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Xid {
    tid: Tid,
    pid: u64,
}

impl Xid {
    pub const fn new(tid: Tid, pid: u64) -> Self {
        Self { tid, pid }
    }

    pub const fn tid(&self) -> Tid {
        self.tid
    }

    /// The persistent child reference id held on the shared timestamp.
    pub const fn pid(&self) -> u64 {
        self.pid
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tid, self.pid)
    }
}
