//! Error type for `recall-store-sqlite`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
  #[error("core error: {0}")]
  Core(#[from] recall_core::Error),

  #[error("database error: {0}")]
  Database(#[from] tokio_rusqlite::Error),

  #[error("json error: {0}")]
  Json(#[from] serde_json::Error),

  #[error("uuid parse error: {0}")]
  Uuid(#[from] uuid::Error),

  /// A stored column held a value the domain types cannot represent.
  #[error("cannot decode {field}: {value:?}")]
  Decode { field: &'static str, value: String },

  #[error("entry not found: {0}")]
  EntryNotFound(uuid::Uuid),

  #[error("dead letter not found: {0}")]
  DeadLetterNotFound(uuid::Uuid),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
