//! Tenant policy and consent management.

use axum::{
  Json,
  extract::{Path, State},
};
use recall_core::{
  consent::{ConsentRecord, ConsentStatus},
  policy::TenantPolicy,
  store::RecoveryStore,
};
use serde::Deserialize;

use crate::{AppState, error::ApiError};

// ─── Policy ──────────────────────────────────────────────────────────────────

/// `GET /tenants/{tenant_id}/policy` — stored policy or the defaults.
pub async fn get_policy<S>(
  State(state): State<AppState<S>>,
  Path(tenant_id): Path<String>,
) -> Result<Json<TenantPolicy>, ApiError>
where
  S: RecoveryStore + 'static,
{
  let policy = state.store.get_policy(&tenant_id).await.map_err(ApiError::store)?;
  Ok(Json(policy))
}

/// `PUT /tenants/{tenant_id}/policy`
///
/// The body may be partial; omitted knobs take their defaults.
pub async fn put_policy<S>(
  State(state): State<AppState<S>>,
  Path(tenant_id): Path<String>,
  Json(policy): Json<TenantPolicy>,
) -> Result<Json<TenantPolicy>, ApiError>
where
  S: RecoveryStore + 'static,
{
  policy
    .validate()
    .map_err(|e| ApiError::BadRequest(e.to_string()))?;
  state
    .store
    .put_policy(&tenant_id, &policy)
    .await
    .map_err(ApiError::store)?;
  tracing::info!(%tenant_id, "tenant policy updated");
  Ok(Json(policy))
}

// ─── Consent ─────────────────────────────────────────────────────────────────

/// `GET /tenants/{tenant_id}/consent/{phone}`
pub async fn get_consent<S>(
  State(state): State<AppState<S>>,
  Path((tenant_id, phone)): Path<(String, String)>,
) -> Result<Json<ConsentRecord>, ApiError>
where
  S: RecoveryStore + 'static,
{
  let record = state
    .store
    .get_consent(&tenant_id, &phone)
    .await
    .map_err(ApiError::store)?
    .ok_or_else(|| {
      ApiError::NotFound(format!("no consent record for {phone} under {tenant_id}"))
    })?;
  Ok(Json(record))
}

#[derive(Debug, Deserialize)]
pub struct ConsentBody {
  pub status:         ConsentStatus,
  pub opt_out_reason: Option<String>,
}

/// `PUT /tenants/{tenant_id}/consent/{phone}`
pub async fn put_consent<S>(
  State(state): State<AppState<S>>,
  Path((tenant_id, phone)): Path<(String, String)>,
  Json(body): Json<ConsentBody>,
) -> Result<Json<ConsentRecord>, ApiError>
where
  S: RecoveryStore + 'static,
{
  let record = state
    .store
    .set_consent(&tenant_id, &phone, body.status, body.opt_out_reason)
    .await
    .map_err(ApiError::store)?;
  tracing::info!(%tenant_id, status = %record.status, "consent updated");
  Ok(Json(record))
}
