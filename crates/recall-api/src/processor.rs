//! Scheduler control — operational toggles for safe deployment.

use axum::{Json, extract::State};
use recall_core::store::RecoveryStore;
use recall_engine::scheduler::ProcessorStatus;

use crate::{AppState, error::ApiError};

/// `POST /processor/start`
pub async fn start<S>(
  State(state): State<AppState<S>>,
) -> Result<Json<ProcessorStatus>, ApiError>
where
  S: RecoveryStore + 'static,
{
  state.processor.start();
  tracing::info!("processor started by operator");
  Ok(Json(state.processor.status()))
}

/// `POST /processor/stop`
pub async fn stop<S>(
  State(state): State<AppState<S>>,
) -> Result<Json<ProcessorStatus>, ApiError>
where
  S: RecoveryStore + 'static,
{
  state.processor.stop();
  tracing::info!("processor stopped by operator");
  Ok(Json(state.processor.status()))
}

/// `GET /processor/status`
pub async fn status<S>(
  State(state): State<AppState<S>>,
) -> Result<Json<ProcessorStatus>, ApiError>
where
  S: RecoveryStore + 'static,
{
  Ok(Json(state.processor.status()))
}
