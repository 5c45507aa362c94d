//! Shared vocabulary types for the tempo transaction engine.
//!
//! These types are exchanged between the timestamp manager, the transaction
//! log, and the engine proper, so they live in a leaf crate with no
//! dependencies beyond serde.

pub mod ids;
pub mod key;
pub mod state;

pub use ids::{Tid, Xid};
pub use key::{Key, KeyVersions};
pub use state::TxnState;
