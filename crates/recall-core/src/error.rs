//! Error types for `recall-core`.

use thiserror::Error;

use crate::entry::EntryStatus;

#[derive(Debug, Error)]
pub enum Error {
  /// The state machine forbids this edge (terminal states permit nothing).
  #[error("transition from {from} to {to} is not permitted")]
  InvalidTransition { from: EntryStatus, to: EntryStatus },

  #[error("invalid tenant policy: {0}")]
  InvalidPolicy(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
