//! The moving parts of the Recall recovery queue: the SLA scheduler, the
//! outreach attempt handler, the circuit-breaker registry, the dead-letter
//! worker, and the cleanup sweeper.
//!
//! Everything here is generic over [`recall_core::store::RecoveryStore`];
//! the binary wires in the SQLite backend.

pub mod breaker;
pub mod channels;
pub mod deadletter;
pub mod error;
pub mod outreach;
pub mod providers;
pub mod scheduler;
pub mod sweeper;

pub use error::{Error, Result};
