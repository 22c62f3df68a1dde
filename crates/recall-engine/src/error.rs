//! Error type for `recall-engine`.

use recall_core::entry::OutreachMethod;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum Error {
  #[error("store error: {0}")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),

  #[error("no channel configured for method {0}")]
  ChannelMissing(OutreachMethod),

  #[error("entry not found: {0}")]
  EntryNotFound(Uuid),

  /// A manual processing request raced with the scheduler or hit a
  /// non-queued entry.
  #[error("entry {0} cannot be claimed for processing")]
  NotClaimable(Uuid),
}

impl Error {
  pub fn store<E: std::error::Error + Send + Sync + 'static>(e: E) -> Self {
    Self::Store(Box::new(e))
  }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
