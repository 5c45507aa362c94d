//! The key abstraction the engine is generic over.

use std::fmt::Debug;
use std::hash::Hash;

use serde::Serialize;
use serde::de::DeserializeOwned;

/// An opaque, comparable, hashable cell identifier.
///
/// The engine never inspects keys; it only orders them (for deterministic
/// multi-key lock acquisition), hashes them (conflict indices), and embeds
/// them in durable log records (serde bounds).
pub trait Key:
    Clone + Eq + Ord + Hash + Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

impl<T> Key for T where
    T: Clone + Eq + Ord + Hash + Debug + Send + Sync + Serialize + DeserializeOwned + 'static
{
}

/// A key together with the candidate versions a read returned, newest first.
///
/// The store hands this to the engine's `after_get` hook; the engine narrows
/// `versions` down to the single version the transaction is allowed to
/// observe under MVTO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyVersions<K> {
    pub key: K,
    pub versions: Vec<u64>,
}

impl<K> KeyVersions<K> {
    pub fn new(key: K, versions: Vec<u64>) -> Self {
        Self { key, versions }
    }
}
