//! The outreach attempt handler: given a claimed entry, choose a channel,
//! compose a message (template or AI-drafted), send it, and commit the
//! resulting state transition.
//!
//! Every error inside the handler becomes an attempt record plus a
//! disposition — nothing propagates far enough to stall the scheduler loop,
//! and one failing entry never blocks the others.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use recall_core::{
  attempt::NewAttempt,
  consent::{self, ConsentDecision},
  deadletter::NewDeadLetter,
  entry::{EntryChange, EntryStatus, QueueEntry},
  lifecycle::{self, DeadlineBreach},
  policy::TenantPolicy,
  store::RecoveryStore,
};

use crate::{
  Error, Result,
  breaker::BreakerRegistry,
  channels::{AiResponder, ChannelError, ChannelSet, ConversationContext, OutboundMessage},
};

/// Audit actor for handler-driven mutations.
const ACTOR: &str = "outreach";

// ─── Disposition ─────────────────────────────────────────────────────────────

/// Where an entry ended up after one pass through the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
  /// Customer engaged; case closed.
  Recovered,
  /// Attempt made without engagement; requeued with backoff.
  Requeued,
  /// AI confidence fell short; parked awaiting an asynchronous reply.
  RescuePending,
  /// Handed to a human (deadline, AI policy, or exhausted rescue).
  Escalated,
  /// Zero-attempt SLA expiry.
  Expired,
  /// Permanent provider error or spent retry budget.
  Failed,
  /// Consent denied or withdrawn; all future attempts halted.
  ComplianceHalt,
  /// Consent still pending; deferred without consuming budget.
  ConsentDeferred,
  /// Circuit open; deferred without consuming budget.
  CircuitDeferred,
  /// Transient provider failure; payload parked in the dead-letter queue,
  /// entry deferred without consuming budget.
  DeadLettered,
  /// AI responder unavailable; deferred without consuming budget.
  AiDeferred,
  /// A concurrent transition (e.g. an external recovered-signal) won; the
  /// attempt result is recorded but the entry moved on without us.
  Superseded,
}

// ─── Handler ─────────────────────────────────────────────────────────────────

pub struct Outreacher<S> {
  store:        Arc<S>,
  channels:     ChannelSet,
  responder:    Arc<dyn AiResponder>,
  breakers:     BreakerRegistry<S>,
  send_timeout: Duration,
}

impl<S: RecoveryStore> Outreacher<S> {
  pub fn new(
    store: Arc<S>,
    channels: ChannelSet,
    responder: Arc<dyn AiResponder>,
    breakers: BreakerRegistry<S>,
    send_timeout: Duration,
  ) -> Self {
    Self { store, channels, responder, breakers, send_timeout }
  }

  /// Drive one claimed (`processing`) entry to its next state.
  pub async fn process_claimed(
    &self,
    entry: &QueueEntry,
    policy: &TenantPolicy,
    now: DateTime<Utc>,
  ) -> Result<Disposition> {
    // Deadlines pre-empt everything, even on a fresh claim.
    if let Some(breach) = lifecycle::deadline_breach(entry, now) {
      return self.apply_breach(entry, breach, now).await;
    }

    // Consent gate.
    let record = self
      .store
      .get_consent(&entry.tenant_id, &entry.customer_phone)
      .await
      .map_err(Error::store)?;
    match consent::evaluate(record.as_ref()) {
      ConsentDecision::Granted => {}
      ConsentDecision::Denied => {
        let reason = record
          .as_ref()
          .and_then(|r| r.opt_out_reason.clone())
          .unwrap_or_else(|| "consent denied".to_string());
        return self.compliance_halt(entry, record.map(|r| r.status), reason, now).await;
      }
      ConsentDecision::Pending => {
        let grace =
          chrono::Duration::hours(i64::from(policy.pending_consent_grace_hours));
        if entry.created_at + grace <= now {
          return self
            .compliance_halt(
              entry,
              record.map(|r| r.status),
              "consent unresolved past grace period".to_string(),
              now,
            )
            .await;
        }
        return self.defer(entry, policy, now, Disposition::ConsentDeferred).await;
      }
    }

    // Spent budget that slipped past earlier checks fails here, before any
    // further send.
    if entry.attempt_count >= entry.max_attempts {
      return self.fail(entry, "retry budget exhausted".to_string(), now).await;
    }

    // Circuit-breaker gate. A rejection must not mark the entry attempted.
    let method = policy.method_for_attempt(entry.attempt_count);
    if !self
      .breakers
      .allow(method.provider(), &entry.tenant_id, now)
      .await?
    {
      tracing::info!(
        entry_id = %entry.id,
        provider = method.provider(),
        "circuit open, deferring without consuming budget"
      );
      return self.defer(entry, policy, now, Disposition::CircuitDeferred).await;
    }

    // Compose the outbound message.
    let (body, ai_confidence) = if entry.attempt_count >= policy.ai_compose_after_attempts {
      match self.compose_with_ai(entry, policy, now).await? {
        ComposeOutcome::Message { body, confidence } => (body, Some(confidence)),
        ComposeOutcome::LowConfidence { confidence } => {
          return self.park_or_escalate(entry, policy, confidence, now).await;
        }
        ComposeOutcome::Unavailable => {
          return self.defer(entry, policy, now, Disposition::AiDeferred).await;
        }
      }
    } else {
      (template_message(), None)
    };

    // Send, bounded.
    let message = OutboundMessage {
      tenant_id: entry.tenant_id.clone(),
      entry_id:  entry.id,
      to:        entry.customer_phone.clone(),
      body:      body.clone(),
    };
    let channel = self.channels.get(method)?;
    let sent = match tokio::time::timeout(self.send_timeout, channel.send(&message)).await {
      Ok(result) => result,
      Err(_) => Err(ChannelError::Transient("send timed out".to_string())),
    };

    match sent {
      Ok(receipt) => {
        self
          .breakers
          .record_outcome(method.provider(), &entry.tenant_id, true, now)
          .await?;

        let mut attempt = NewAttempt::new(entry.id, method);
        attempt.message_sent = Some(body);
        attempt.response_received = receipt.response.clone();
        attempt.ai_confidence_score = ai_confidence;
        attempt.success = true;
        attempt.customer_engaged = receipt.engaged;
        attempt.responded_at = receipt.engaged.then_some(now);
        self.store.record_attempt(attempt).await.map_err(Error::store)?;

        let new_count = entry.attempt_count + 1;
        if receipt.engaged {
          let mut change = EntryChange::to(EntryStatus::Recovered);
          change.attempt_count = Some(new_count);
          change.last_attempt_at = Some(now);
          change.customer_responded = Some(true);
          change.recovery_method = Some(method);
          change.processed_at = Some(now);
          change.ai_rescue_attempted = ai_confidence.is_some().then_some(true);
          return self.commit(entry, change, Disposition::Recovered).await;
        }

        if new_count >= entry.max_attempts {
          let mut change = EntryChange::to(EntryStatus::Failed);
          change.attempt_count = Some(new_count);
          change.last_attempt_at = Some(now);
          change.processed_at = Some(now);
          change.ai_rescue_attempted = ai_confidence.is_some().then_some(true);
          return self.commit(entry, change, Disposition::Failed).await;
        }

        let mut change = EntryChange::to(EntryStatus::Queued);
        change.attempt_count = Some(new_count);
        change.last_attempt_at = Some(now);
        change.next_attempt_at =
          Some(policy.schedule_retry(now, new_count, entry.business_hours_override));
        change.ai_rescue_attempted = ai_confidence.is_some().then_some(true);
        self.commit(entry, change, Disposition::Requeued).await
      }

      Err(ChannelError::Transient(reason)) => {
        self
          .breakers
          .record_outcome(method.provider(), &entry.tenant_id, false, now)
          .await?;

        let mut attempt = NewAttempt::new(entry.id, method);
        attempt.message_sent = Some(message.body.clone());
        attempt.failure_reason = Some(format!("transient: {reason}"));
        self.store.record_attempt(attempt).await.map_err(Error::store)?;

        // The payload retries on its own schedule; the customer-facing
        // budget is untouched.
        self
          .store
          .push_dead_letter(NewDeadLetter {
            tenant_id:      entry.tenant_id.clone(),
            entry_id:       entry.id,
            method,
            customer_phone: entry.customer_phone.clone(),
            payload:        message.body,
            failure_reason: reason.clone(),
            max_retries:    policy.dead_letter_max_retries,
            next_retry_at:  now
              + chrono::Duration::minutes(i64::from(policy.dead_letter_base_minutes)),
          })
          .await
          .map_err(Error::store)?;

        tracing::warn!(entry_id = %entry.id, %reason, "send failed, dead-lettered");
        self.defer(entry, policy, now, Disposition::DeadLettered).await
      }

      Err(ChannelError::Permanent(reason)) => {
        let mut attempt = NewAttempt::new(entry.id, method);
        attempt.message_sent = Some(message.body);
        attempt.failure_reason = Some(format!("permanent: {reason}"));
        self.store.record_attempt(attempt).await.map_err(Error::store)?;

        tracing::warn!(entry_id = %entry.id, %reason, "permanent channel error");
        self.fail(entry, reason, now).await
      }
    }
  }

  // ── AI composition ────────────────────────────────────────────────────

  async fn compose_with_ai(
    &self,
    entry: &QueueEntry,
    policy: &TenantPolicy,
    now: DateTime<Utc>,
  ) -> Result<ComposeOutcome> {
    let attempts = self.store.attempts_for(entry.id).await.map_err(Error::store)?;
    let context = ConversationContext {
      tenant_id:      entry.tenant_id.clone(),
      customer_phone: entry.customer_phone.clone(),
      call_reference: entry.call_reference.clone(),
      attempt_count:  entry.attempt_count,
      prior_messages: attempts.into_iter().filter_map(|a| a.message_sent).collect(),
    };

    match self.responder.respond(&context).await {
      Ok(reply) => {
        if reply.confidence < policy.ai_confidence_threshold {
          return Ok(ComposeOutcome::LowConfidence { confidence: reply.confidence });
        }
        let body = reply.suggested_reply.unwrap_or_else(template_message);
        Ok(ComposeOutcome::Message { body, confidence: reply.confidence })
      }
      Err(err) => {
        tracing::warn!(entry_id = %entry.id, error = %err, "AI responder unavailable");
        self
          .breakers
          .record_outcome("ai", &entry.tenant_id, false, now)
          .await?;
        Ok(ComposeOutcome::Unavailable)
      }
    }
  }

  /// Low AI confidence: park for an asynchronous reply, or escalate
  /// directly, per tenant policy.
  async fn park_or_escalate(
    &self,
    entry: &QueueEntry,
    policy: &TenantPolicy,
    confidence: f64,
    now: DateTime<Utc>,
  ) -> Result<Disposition> {
    let escalate = policy.escalation_on_ai_failure;

    let mut attempt = NewAttempt::new(entry.id, policy.method_for_attempt(entry.attempt_count));
    attempt.ai_confidence_score = Some(confidence);
    attempt.escalation_triggered = escalate;
    attempt.failure_reason = Some(format!(
      "ai confidence {confidence:.2} below threshold {:.2}",
      policy.ai_confidence_threshold
    ));
    self.store.record_attempt(attempt).await.map_err(Error::store)?;

    if escalate {
      let mut change = EntryChange::to(EntryStatus::Escalated);
      change.escalated_at = Some(now);
      return self.commit(entry, change, Disposition::Escalated).await;
    }

    let mut change = EntryChange::to(EntryStatus::AiRescuePending);
    // The reply window is a wall-clock wait, not a business-hours slot.
    change.next_attempt_at =
      Some(now + chrono::Duration::minutes(i64::from(policy.ai_rescue_window_minutes)));
    self.commit(entry, change, Disposition::RescuePending).await
  }

  // ── Terminal and deferral transitions ─────────────────────────────────

  async fn apply_breach(
    &self,
    entry: &QueueEntry,
    breach: DeadlineBreach,
    now: DateTime<Utc>,
  ) -> Result<Disposition> {
    let (change, disposition) = match breach {
      DeadlineBreach::Escalate => {
        let mut change = EntryChange::to(EntryStatus::Escalated);
        change.escalated_at = Some(now);
        (change, Disposition::Escalated)
      }
      DeadlineBreach::Expire => {
        (EntryChange::to(EntryStatus::Expired), Disposition::Expired)
      }
    };
    self.commit(entry, change, disposition).await
  }

  async fn compliance_halt(
    &self,
    entry: &QueueEntry,
    status: Option<recall_core::consent::ConsentStatus>,
    reason: String,
    now: DateTime<Utc>,
  ) -> Result<Disposition> {
    tracing::info!(entry_id = %entry.id, %reason, "compliance halt");
    let mut change = EntryChange::to(EntryStatus::Failed);
    change.consent_status = status;
    change.opt_out_reason = Some(reason);
    change.processed_at = Some(now);
    self.commit(entry, change, Disposition::ComplianceHalt).await
  }

  async fn fail(
    &self,
    entry: &QueueEntry,
    reason: String,
    now: DateTime<Utc>,
  ) -> Result<Disposition> {
    tracing::info!(entry_id = %entry.id, %reason, "entry failed");
    let mut change = EntryChange::to(EntryStatus::Failed);
    change.processed_at = Some(now);
    self.commit(entry, change, Disposition::Failed).await
  }

  /// Release the claim without consuming budget.
  async fn defer(
    &self,
    entry: &QueueEntry,
    policy: &TenantPolicy,
    now: DateTime<Utc>,
    disposition: Disposition,
  ) -> Result<Disposition> {
    let mut change = EntryChange::to(EntryStatus::Queued);
    change.next_attempt_at =
      Some(policy.schedule_deferral(now, entry.business_hours_override));
    self.commit(entry, change, disposition).await
  }

  /// Commit a transition from the claimed (`processing`) state. A lost swap
  /// means an external signal moved the entry first.
  async fn commit(
    &self,
    entry: &QueueEntry,
    change: EntryChange,
    disposition: Disposition,
  ) -> Result<Disposition> {
    let applied = self
      .store
      .transition(entry.id, entry.status, change, ACTOR)
      .await
      .map_err(Error::store)?;
    if applied.is_none() {
      tracing::info!(entry_id = %entry.id, "transition superseded by a concurrent signal");
      return Ok(Disposition::Superseded);
    }
    Ok(disposition)
  }
}

enum ComposeOutcome {
  Message { body: String, confidence: f64 },
  LowConfidence { confidence: f64 },
  Unavailable,
}

/// The static outreach template used before AI composition kicks in.
fn template_message() -> String {
  "Sorry we missed your call! Reply here or call us back and we'll get you \
   taken care of right away."
    .to_string()
}
