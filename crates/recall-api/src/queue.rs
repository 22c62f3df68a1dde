//! Queue inspection and manual operator actions.
//!
//! | Method | Path | Notes |
//! |--------|------|-------|
//! | `GET`  | `/queue/entries` | Optional `status`, `tenant_id`, `limit`, `offset` |
//! | `GET`  | `/queue/entries/{id}` | Entry with its attempt log |
//! | `POST` | `/queue/entries/{id}/process` | Immediate attempt outside the cadence |
//! | `POST` | `/queue/entries/{id}/escalate` | Force human handoff |
//! | `POST` | `/queue/entries/{id}/recover` | Idempotent external recovered-signal |
//! | `GET`  | `/queue/dead-letters` | Optional `status` |

use axum::{
  Json,
  extract::{Path, Query, State},
};
use chrono::Utc;
use recall_core::{
  attempt::AttemptRecord,
  deadletter::{DeadLetterEntry, DeadLetterStatus},
  entry::{EntryChange, EntryQuery, EntryStatus, OutreachMethod, QueueEntry},
  store::RecoveryStore,
};
use recall_engine::outreach::Disposition;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{AppState, error::ApiError};

/// Audit actor for operator-driven mutations.
const ACTOR: &str = "operator";

// ─── List ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ListParams {
  pub status:    Option<String>,
  pub tenant_id: Option<String>,
  pub limit:     Option<usize>,
  pub offset:    Option<usize>,
}

/// `GET /queue/entries?status=&tenant_id=`
pub async fn list<S>(
  State(state): State<AppState<S>>,
  Query(params): Query<ListParams>,
) -> Result<Json<Vec<QueueEntry>>, ApiError>
where
  S: RecoveryStore + 'static,
{
  let status = params
    .status
    .as_deref()
    .map(|s| {
      s.parse::<EntryStatus>()
        .map_err(|_| ApiError::BadRequest(format!("unknown status {s:?}")))
    })
    .transpose()?;

  let query = EntryQuery {
    tenant_id: params.tenant_id,
    status,
    limit: params.limit,
    offset: params.offset,
  };
  let entries = state.store.list_entries(&query).await.map_err(ApiError::store)?;
  Ok(Json(entries))
}

// ─── Get one ──────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct EntryDetail {
  pub entry:    QueueEntry,
  pub attempts: Vec<AttemptRecord>,
}

/// `GET /queue/entries/{id}`
pub async fn get_one<S>(
  State(state): State<AppState<S>>,
  Path(id): Path<Uuid>,
) -> Result<Json<EntryDetail>, ApiError>
where
  S: RecoveryStore + 'static,
{
  let entry = state
    .store
    .get_entry(id)
    .await
    .map_err(ApiError::store)?
    .ok_or_else(|| ApiError::NotFound(format!("entry {id} not found")))?;
  let attempts = state.store.attempts_for(id).await.map_err(ApiError::store)?;
  Ok(Json(EntryDetail { entry, attempts }))
}

// ─── Manual processing ────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ProcessResponse {
  pub disposition: Disposition,
}

/// `POST /queue/entries/{id}/process` — force an immediate attempt.
pub async fn process_now<S>(
  State(state): State<AppState<S>>,
  Path(id): Path<Uuid>,
) -> Result<Json<ProcessResponse>, ApiError>
where
  S: RecoveryStore + 'static,
{
  let disposition = state.scheduler.process_entry_now(id, Utc::now()).await?;
  Ok(Json(ProcessResponse { disposition }))
}

// ─── Force escalation ─────────────────────────────────────────────────────────

/// `POST /queue/entries/{id}/escalate` — hand off to a human now.
pub async fn escalate<S>(
  State(state): State<AppState<S>>,
  Path(id): Path<Uuid>,
) -> Result<Json<QueueEntry>, ApiError>
where
  S: RecoveryStore + 'static,
{
  let entry = state
    .store
    .get_entry(id)
    .await
    .map_err(ApiError::store)?
    .ok_or_else(|| ApiError::NotFound(format!("entry {id} not found")))?;
  if entry.status.is_terminal() {
    return Err(ApiError::Conflict(format!(
      "entry {id} is already terminal ({})",
      entry.status
    )));
  }

  let mut change = EntryChange::to(EntryStatus::Escalated);
  change.escalated_at = Some(Utc::now());
  let escalated = state
    .store
    .transition(id, entry.status, change, ACTOR)
    .await
    .map_err(ApiError::store)?
    .ok_or_else(|| ApiError::Conflict(format!("entry {id} changed concurrently")))?;
  Ok(Json(escalated))
}

// ─── External recovered-signal ────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct RecoverBody {
  /// The channel through which the customer actually came back, if known.
  pub method: Option<OutreachMethod>,
}

/// `POST /queue/entries/{id}/recover`
///
/// Idempotent: replays against an already-recovered entry return the entry
/// unchanged. An in-flight attempt keeps its claim; its result is still
/// recorded and the next cycle sees the terminal status.
pub async fn recover<S>(
  State(state): State<AppState<S>>,
  Path(id): Path<Uuid>,
  body: Option<Json<RecoverBody>>,
) -> Result<Json<QueueEntry>, ApiError>
where
  S: RecoveryStore + 'static,
{
  let body = body.map(|Json(b)| b).unwrap_or_default();
  let entry = state
    .store
    .get_entry(id)
    .await
    .map_err(ApiError::store)?
    .ok_or_else(|| ApiError::NotFound(format!("entry {id} not found")))?;

  if entry.status == EntryStatus::Recovered {
    return Ok(Json(entry));
  }
  if entry.status.is_terminal() {
    return Err(ApiError::Conflict(format!(
      "entry {id} is already terminal ({})",
      entry.status
    )));
  }

  let now = Utc::now();
  let mut change = EntryChange::to(EntryStatus::Recovered);
  change.customer_responded = Some(true);
  change.recovery_method = body.method;
  change.processed_at = Some(now);

  match state
    .store
    .transition(id, entry.status, change, ACTOR)
    .await
    .map_err(ApiError::store)?
  {
    Some(recovered) => Ok(Json(recovered)),
    // Lost the swap — most likely a concurrent recovery; re-read and treat
    // a recovered result as success.
    None => {
      let current = state
        .store
        .get_entry(id)
        .await
        .map_err(ApiError::store)?
        .ok_or_else(|| ApiError::NotFound(format!("entry {id} not found")))?;
      if current.status == EntryStatus::Recovered {
        Ok(Json(current))
      } else {
        Err(ApiError::Conflict(format!("entry {id} changed concurrently")))
      }
    }
  }
}

// ─── Dead letters ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct DeadLetterParams {
  pub status: Option<String>,
  pub limit:  Option<usize>,
}

/// `GET /queue/dead-letters?status=`
pub async fn dead_letters<S>(
  State(state): State<AppState<S>>,
  Query(params): Query<DeadLetterParams>,
) -> Result<Json<Vec<DeadLetterEntry>>, ApiError>
where
  S: RecoveryStore + 'static,
{
  let status = params
    .status
    .as_deref()
    .map(|s| {
      s.parse::<DeadLetterStatus>()
        .map_err(|_| ApiError::BadRequest(format!("unknown status {s:?}")))
    })
    .transpose()?;
  let letters = state
    .store
    .list_dead_letters(status, params.limit.unwrap_or(100))
    .await
    .map_err(ApiError::store)?;
  Ok(Json(letters))
}
