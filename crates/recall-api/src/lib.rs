//! JSON REST API for the Recall recovery queue.
//!
//! Exposes an axum [`Router`] backed by any [`recall_core::store::RecoveryStore`].
//! Auth, TLS, and transport concerns are the caller's responsibility.

pub mod error;
pub mod processor;
pub mod queue;
pub mod tenants;
pub mod webhook;

use std::sync::Arc;

use axum::{
  Router,
  routing::{get, post},
};
use recall_core::{policy::RateLimitPolicy, store::RecoveryStore};
use recall_engine::scheduler::{ProcessorHandle, SlaScheduler};

pub use error::ApiError;

// ─── Application state ────────────────────────────────────────────────────────

/// Shared state threaded through all axum handlers.
pub struct AppState<S> {
  pub store:                Arc<S>,
  pub scheduler:            Arc<SlaScheduler<S>>,
  pub processor:            Arc<ProcessorHandle>,
  pub rate_limit:           RateLimitPolicy,
  pub idempotency_ttl_days: u32,
}

// Manual impl: `S` itself need not be `Clone` behind the `Arc`s.
impl<S> Clone for AppState<S> {
  fn clone(&self) -> Self {
    Self {
      store:                Arc::clone(&self.store),
      scheduler:            Arc::clone(&self.scheduler),
      processor:            Arc::clone(&self.processor),
      rate_limit:           self.rate_limit,
      idempotency_ttl_days: self.idempotency_ttl_days,
    }
  }
}

// ─── Router ───────────────────────────────────────────────────────────────────

/// Build a fully-materialised API router for `state`.
pub fn router<S>(state: AppState<S>) -> Router
where
  S: RecoveryStore + 'static,
{
  Router::new()
    // Ingestion
    .route("/missed-call-events", post(webhook::ingest::<S>))
    // Inspection
    .route("/queue/entries", get(queue::list::<S>))
    .route("/queue/entries/{id}", get(queue::get_one::<S>))
    .route("/queue/dead-letters", get(queue::dead_letters::<S>))
    // Operator actions
    .route("/queue/entries/{id}/process", post(queue::process_now::<S>))
    .route("/queue/entries/{id}/escalate", post(queue::escalate::<S>))
    .route("/queue/entries/{id}/recover", post(queue::recover::<S>))
    // Scheduler control
    .route("/processor/start", post(processor::start::<S>))
    .route("/processor/stop", post(processor::stop::<S>))
    .route("/processor/status", get(processor::status::<S>))
    // Tenant configuration
    .route(
      "/tenants/{tenant_id}/policy",
      get(tenants::get_policy::<S>).put(tenants::put_policy::<S>),
    )
    .route(
      "/tenants/{tenant_id}/consent/{phone}",
      get(tenants::get_consent::<S>).put(tenants::put_consent::<S>),
    )
    .with_state(state)
}

// ─── Integration tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  use async_trait::async_trait;
  use axum::{
    body::Body,
    http::{Request, StatusCode, header},
  };
  use recall_core::{breaker::BreakerPolicy, entry::OutreachMethod};
  use recall_engine::{
    breaker::BreakerRegistry,
    channels::{
      AiReply, AiResponder, ChannelError, ChannelReceipt, ChannelSet, ConversationContext,
      OutboundMessage, OutreachChannel,
    },
    outreach::Outreacher,
    scheduler::SchedulerConfig,
  };
  use recall_store_sqlite::SqliteStore;
  use tower::ServiceExt as _;

  /// Delivers everything and reports the customer as engaged.
  struct EngagedChannel(OutreachMethod);

  #[async_trait]
  impl OutreachChannel for EngagedChannel {
    fn method(&self) -> OutreachMethod {
      self.0
    }

    async fn send(&self, _m: &OutboundMessage) -> Result<ChannelReceipt, ChannelError> {
      Ok(ChannelReceipt { engaged: true, response: Some("on my way".into()) })
    }
  }

  struct CannedResponder;

  #[async_trait]
  impl AiResponder for CannedResponder {
    async fn respond(&self, _c: &ConversationContext) -> Result<AiReply, ChannelError> {
      Ok(AiReply { intent: "callback".into(), confidence: 0.95, suggested_reply: None })
    }
  }

  async fn make_state(rate_limit: RateLimitPolicy) -> AppState<SqliteStore> {
    let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
    let channels = ChannelSet::new()
      .with(Arc::new(EngagedChannel(OutreachMethod::Sms)))
      .with(Arc::new(EngagedChannel(OutreachMethod::Call)))
      .with(Arc::new(EngagedChannel(OutreachMethod::Email)));
    let breakers = BreakerRegistry::new(Arc::clone(&store), BreakerPolicy::default());
    let outreach = Arc::new(Outreacher::new(
      Arc::clone(&store),
      channels,
      Arc::new(CannedResponder),
      breakers,
      Duration::from_secs(5),
    ));
    let processor = Arc::new(ProcessorHandle::new(true));
    let scheduler = Arc::new(SlaScheduler::new(
      Arc::clone(&store),
      outreach,
      Arc::clone(&processor),
      SchedulerConfig::default(),
    ));

    AppState {
      store,
      scheduler,
      processor,
      rate_limit,
      idempotency_ttl_days: 90,
    }
  }

  async fn request(
    state: AppState<SqliteStore>,
    method: &str,
    uri: &str,
    body: Option<serde_json::Value>,
  ) -> (StatusCode, serde_json::Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
      Some(json) => {
        builder = builder.header(header::CONTENT_TYPE, "application/json");
        Body::from(json.to_string())
      }
      None => Body::empty(),
    };
    let response = router(state)
      .oneshot(builder.body(body).unwrap())
      .await
      .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = if bytes.is_empty() {
      serde_json::Value::Null
    } else {
      serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
  }

  fn event(id: &str) -> serde_json::Value {
    serde_json::json!({
      "external_event_id": id,
      "call_reference": "call-77",
      "customer_phone": "+15550001111",
      "tenant_id": "t1",
      "timestamp": "2026-03-02T12:00:00Z",
    })
  }

  // ── Ingestion ───────────────────────────────────────────────────────────

  #[tokio::test]
  async fn webhook_accepts_then_deduplicates() {
    let state = make_state(RateLimitPolicy::default()).await;

    let (status, body) =
      request(state.clone(), "POST", "/missed-call-events", Some(event("evt-1"))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "accepted");
    let entry_id = body["entry_id"].as_str().unwrap().to_string();

    // Redelivery 10 seconds later: 200, no second entry.
    let (status, body) =
      request(state.clone(), "POST", "/missed-call-events", Some(event("evt-1"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "duplicate");
    assert_eq!(body["entry_id"].as_str().unwrap(), entry_id);

    let (_, entries) = request(state, "GET", "/queue/entries", None).await;
    assert_eq!(entries.as_array().unwrap().len(), 1);
  }

  #[tokio::test]
  async fn webhook_rejects_implausible_phone() {
    let state = make_state(RateLimitPolicy::default()).await;
    let mut bad = event("evt-2");
    bad["customer_phone"] = serde_json::json!("not-a-number");
    let (status, _) = request(state, "POST", "/missed-call-events", Some(bad)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
  }

  #[tokio::test]
  async fn webhook_throttles_bursts() {
    let tight = RateLimitPolicy {
      window_seconds: 60,
      soft_limit:     2,
      hard_limit:     100,
      block_minutes:  15,
    };
    let state = make_state(tight).await;

    for n in 0..2 {
      let (status, _) = request(
        state.clone(),
        "POST",
        "/missed-call-events",
        Some(event(&format!("evt-{n}"))),
      )
      .await;
      assert_eq!(status, StatusCode::ACCEPTED);
    }

    let (status, _) =
      request(state, "POST", "/missed-call-events", Some(event("evt-over"))).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
  }

  #[tokio::test]
  async fn webhook_suppresses_enqueue_for_denied_consent() {
    let state = make_state(RateLimitPolicy::default()).await;
    request(
      state.clone(),
      "PUT",
      "/tenants/t1/consent/+15550001111",
      Some(serde_json::json!({ "status": "denied", "opt_out_reason": "opted out" })),
    )
    .await;

    let (status, body) =
      request(state.clone(), "POST", "/missed-call-events", Some(event("evt-3"))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "consent_denied");
    assert!(body["entry_id"].is_null());

    let (_, entries) = request(state, "GET", "/queue/entries", None).await;
    assert!(entries.as_array().unwrap().is_empty());
  }

  // ── Inspection ──────────────────────────────────────────────────────────

  #[tokio::test]
  async fn entry_detail_includes_attempt_log() {
    let state = make_state(RateLimitPolicy::default()).await;
    let (_, body) =
      request(state.clone(), "POST", "/missed-call-events", Some(event("evt-4"))).await;
    let id = body["entry_id"].as_str().unwrap().to_string();

    // Force an attempt so the log is non-empty.
    request(state.clone(), "POST", &format!("/queue/entries/{id}/process"), None).await;

    let (status, detail) =
      request(state, "GET", &format!("/queue/entries/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(detail["entry"]["status"], "recovered");
    assert_eq!(detail["attempts"].as_array().unwrap().len(), 1);
    assert_eq!(detail["attempts"][0]["attempt_number"], 1);
  }

  #[tokio::test]
  async fn unknown_entry_is_404() {
    let state = make_state(RateLimitPolicy::default()).await;
    let id = uuid::Uuid::new_v4();
    let (status, _) = request(state, "GET", &format!("/queue/entries/{id}"), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
  }

  #[tokio::test]
  async fn status_filter_rejects_unknown_values() {
    let state = make_state(RateLimitPolicy::default()).await;
    let (status, _) = request(state, "GET", "/queue/entries?status=bogus", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
  }

  // ── Operator actions ────────────────────────────────────────────────────

  #[tokio::test]
  async fn manual_process_recovers_through_engaged_channel() {
    let state = make_state(RateLimitPolicy::default()).await;
    let (_, body) =
      request(state.clone(), "POST", "/missed-call-events", Some(event("evt-5"))).await;
    let id = body["entry_id"].as_str().unwrap().to_string();

    let (status, body) =
      request(state.clone(), "POST", &format!("/queue/entries/{id}/process"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["disposition"], "recovered");

    // A second forced attempt conflicts with the terminal state.
    let (status, _) =
      request(state, "POST", &format!("/queue/entries/{id}/process"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
  }

  #[tokio::test]
  async fn force_escalation_and_terminal_conflict() {
    let state = make_state(RateLimitPolicy::default()).await;
    let (_, body) =
      request(state.clone(), "POST", "/missed-call-events", Some(event("evt-6"))).await;
    let id = body["entry_id"].as_str().unwrap().to_string();

    let (status, body) =
      request(state.clone(), "POST", &format!("/queue/entries/{id}/escalate"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "escalated");
    assert!(!body["escalated_at"].is_null());

    let (status, _) =
      request(state, "POST", &format!("/queue/entries/{id}/escalate"), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
  }

  #[tokio::test]
  async fn recover_signal_is_idempotent() {
    let state = make_state(RateLimitPolicy::default()).await;
    let (_, body) =
      request(state.clone(), "POST", "/missed-call-events", Some(event("evt-7"))).await;
    let id = body["entry_id"].as_str().unwrap().to_string();

    let recover_body = serde_json::json!({ "method": "call" });
    let (status, body) = request(
      state.clone(),
      "POST",
      &format!("/queue/entries/{id}/recover"),
      Some(recover_body.clone()),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "recovered");
    assert_eq!(body["recovery_method"], "call");

    // Replay: same answer, no error.
    let (status, body) = request(
      state,
      "POST",
      &format!("/queue/entries/{id}/recover"),
      Some(recover_body),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "recovered");
  }

  // ── Scheduler control ───────────────────────────────────────────────────

  #[tokio::test]
  async fn processor_toggles_and_reports() {
    let state = make_state(RateLimitPolicy::default()).await;

    let (status, body) = request(state.clone(), "GET", "/processor/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["running"], true);

    let (_, body) = request(state.clone(), "POST", "/processor/stop", None).await;
    assert_eq!(body["running"], false);

    let (_, body) = request(state, "POST", "/processor/start", None).await;
    assert_eq!(body["running"], true);
  }

  // ── Tenant configuration ────────────────────────────────────────────────

  #[tokio::test]
  async fn policy_put_get_round_trip() {
    let state = make_state(RateLimitPolicy::default()).await;

    let (status, body) = request(
      state.clone(),
      "PUT",
      "/tenants/t1/policy",
      Some(serde_json::json!({ "max_attempts": 5, "escalation_on_ai_failure": true })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["max_attempts"], 5);
    // Omitted knobs fall back to defaults.
    assert_eq!(body["response_time_hours"], 2);

    let (_, body) = request(state, "GET", "/tenants/t1/policy", None).await;
    assert_eq!(body["max_attempts"], 5);
    assert_eq!(body["escalation_on_ai_failure"], true);
  }

  #[tokio::test]
  async fn invalid_policy_is_rejected() {
    let state = make_state(RateLimitPolicy::default()).await;
    let (status, _) = request(
      state,
      "PUT",
      "/tenants/t1/policy",
      Some(serde_json::json!({ "ai_confidence_threshold": 3.5 })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
  }

  #[tokio::test]
  async fn consent_put_get_round_trip() {
    let state = make_state(RateLimitPolicy::default()).await;

    let (status, _) = request(state.clone(), "GET", "/tenants/t1/consent/+15550001111", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = request(
      state.clone(),
      "PUT",
      "/tenants/t1/consent/+15550001111",
      Some(serde_json::json!({ "status": "withdrawn", "opt_out_reason": "texted STOP" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "withdrawn");

    let (status, body) =
      request(state, "GET", "/tenants/t1/consent/+15550001111", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["opt_out_reason"], "texted STOP");
  }

  #[tokio::test]
  async fn dead_letter_listing_is_empty_on_a_fresh_store() {
    let state = make_state(RateLimitPolicy::default()).await;
    let (status, body) = request(state, "GET", "/queue/dead-letters", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_array().unwrap().is_empty());
  }
}
