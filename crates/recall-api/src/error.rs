//! API error type and [`axum::response::IntoResponse`] implementation.

use axum::{
  Json,
  http::StatusCode,
  response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde_json::json;
use thiserror::Error;

/// An error returned by an API handler.
#[derive(Debug, Error)]
pub enum ApiError {
  #[error("not found: {0}")]
  NotFound(String),

  #[error("bad request: {0}")]
  BadRequest(String),

  #[error("conflict: {0}")]
  Conflict(String),

  /// Soft rate limit: the caller should back off.
  #[error("rate limited")]
  RateLimited,

  /// Hard rate limit: the client is blocked until the given time.
  #[error("blocked until {0}")]
  Blocked(DateTime<Utc>),

  #[error("store error: {0}")]
  Store(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl ApiError {
  pub fn store<E: std::error::Error + Send + Sync + 'static>(e: E) -> Self {
    Self::Store(Box::new(e))
  }
}

impl From<recall_engine::Error> for ApiError {
  fn from(e: recall_engine::Error) -> Self {
    match e {
      recall_engine::Error::EntryNotFound(id) => {
        ApiError::NotFound(format!("entry {id} not found"))
      }
      recall_engine::Error::NotClaimable(id) => {
        ApiError::Conflict(format!("entry {id} cannot be processed right now"))
      }
      other => ApiError::Store(Box::new(other)),
    }
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let (status, body) = match &self {
      ApiError::NotFound(m) => (StatusCode::NOT_FOUND, json!({ "error": m })),
      ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, json!({ "error": m })),
      ApiError::Conflict(m) => (StatusCode::CONFLICT, json!({ "error": m })),
      ApiError::RateLimited => (
        StatusCode::TOO_MANY_REQUESTS,
        json!({ "error": "rate limited, back off" }),
      ),
      ApiError::Blocked(until) => (
        StatusCode::TOO_MANY_REQUESTS,
        json!({ "error": "blocked", "blocked_until": until }),
      ),
      ApiError::Store(e) => {
        (StatusCode::INTERNAL_SERVER_ERROR, json!({ "error": e.to_string() }))
      }
    };
    (status, Json(body)).into_response()
  }
}
