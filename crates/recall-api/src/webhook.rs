//! Ingestion webhook — `POST /missed-call-events`.
//!
//! Order of gates: rate limit, idempotency, consent. Admission to the
//! idempotency ledger is provisional until the enqueue commits, so a failed
//! enqueue leaves the door open for the provider's redelivery.

use axum::{Json, extract::State, http::HeaderMap, http::StatusCode, response::IntoResponse};
use chrono::Utc;
use recall_core::{
  consent::{self, ConsentDecision, ConsentStatus},
  entry::NewQueueEntry,
  event::{Admission, MissedCallEvent},
  store::{RateDecision, RecoveryStore},
};
use serde::Serialize;
use uuid::Uuid;

use crate::{AppState, error::ApiError};

/// Audit actor for webhook-driven mutations.
const ACTOR: &str = "webhook";

#[derive(Debug, Serialize)]
pub struct IngestResponse {
  pub status:   &'static str,
  pub entry_id: Option<Uuid>,
}

/// `POST /missed-call-events`
///
/// Returns `202 Accepted` for a new event, `200 OK` for a duplicate
/// delivery, `429` when the client is throttled.
pub async fn ingest<S>(
  State(state): State<AppState<S>>,
  headers: HeaderMap,
  Json(event): Json<MissedCallEvent>,
) -> Result<impl IntoResponse, ApiError>
where
  S: RecoveryStore + 'static,
{
  let now = Utc::now();

  // Rate / abuse gate, keyed by tenant and calling client.
  let client_key = headers
    .get("x-api-client")
    .and_then(|v| v.to_str().ok())
    .unwrap_or("default")
    .to_string();
  match state
    .store
    .rate_check(&event.tenant_id, &client_key, &state.rate_limit, now)
    .await
    .map_err(ApiError::store)?
  {
    RateDecision::Allowed => {}
    RateDecision::RateLimited => return Err(ApiError::RateLimited),
    RateDecision::Blocked { until } => {
      tracing::warn!(
        tenant_id = %event.tenant_id,
        client_key = %client_key,
        blocked_until = %until,
        "ingestion client blocked for anomalous burst"
      );
      return Err(ApiError::Blocked(until));
    }
  }

  if !plausible_e164(&event.customer_phone) {
    return Err(ApiError::BadRequest(format!(
      "customer_phone {:?} is not E.164",
      event.customer_phone
    )));
  }

  // Idempotency gate.
  match state
    .store
    .admit_event(&event.provider, &event.external_event_id, state.idempotency_ttl_days, now)
    .await
    .map_err(ApiError::store)?
  {
    Admission::Duplicate { entry_id } => {
      tracing::debug!(
        external_event_id = %event.external_event_id,
        "duplicate webhook delivery ignored"
      );
      return Ok((
        StatusCode::OK,
        Json(IngestResponse { status: "duplicate", entry_id }),
      ));
    }
    Admission::Accepted => {}
  }

  // Consent gate. Denied short-circuits enqueue entirely; the admission
  // stays committed so redeliveries remain no-ops.
  let record = state
    .store
    .get_consent(&event.tenant_id, &event.customer_phone)
    .await
    .map_err(ApiError::store)?;
  let consent_status = match consent::evaluate(record.as_ref()) {
    ConsentDecision::Denied => {
      tracing::info!(
        tenant_id = %event.tenant_id,
        call_reference = %event.call_reference,
        "missed call logged without enqueue: consent denied"
      );
      return Ok((
        StatusCode::ACCEPTED,
        Json(IngestResponse { status: "consent_denied", entry_id: None }),
      ));
    }
    ConsentDecision::Pending => ConsentStatus::Pending,
    ConsentDecision::Granted => ConsentStatus::Granted,
  };

  let policy = state
    .store
    .get_policy(&event.tenant_id)
    .await
    .map_err(ApiError::store)?;
  let input = NewQueueEntry::plan(&event, &policy, consent_status, now);

  // Enqueue; a failure here releases the provisional admission so the
  // provider's retry delivery can succeed.
  let entry = match state.store.create_entry(input, ACTOR).await {
    Ok(entry) => entry,
    Err(err) => {
      let _ = state
        .store
        .release_event(&event.provider, &event.external_event_id)
        .await;
      return Err(ApiError::store(err));
    }
  };
  state
    .store
    .commit_event(&event.provider, &event.external_event_id, entry.id)
    .await
    .map_err(ApiError::store)?;

  tracing::info!(
    entry_id = %entry.id,
    tenant_id = %entry.tenant_id,
    call_reference = %entry.call_reference,
    "missed call enqueued"
  );
  Ok((
    StatusCode::ACCEPTED,
    Json(IngestResponse { status: "accepted", entry_id: Some(entry.id) }),
  ))
}

/// Cheap plausibility check; real number validation belongs to the telephony
/// provider.
fn plausible_e164(phone: &str) -> bool {
  let Some(rest) = phone.strip_prefix('+') else {
    return false;
  };
  (7..=15).contains(&rest.len()) && rest.chars().all(|c| c.is_ascii_digit())
}

#[cfg(test)]
mod tests {
  use super::plausible_e164;

  #[test]
  fn accepts_plain_e164() {
    assert!(plausible_e164("+15550001111"));
    assert!(plausible_e164("+442071838750"));
  }

  #[test]
  fn rejects_garbage() {
    assert!(!plausible_e164("15550001111"));
    assert!(!plausible_e164("+1-555-000"));
    assert!(!plausible_e164("+12"));
    assert!(!plausible_e164(""));
  }
}
