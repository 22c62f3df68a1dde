//! Queue entries — one per missed-call case under recovery tracking.
//!
//! A `QueueEntry` is created exactly once per idempotency-accepted webhook
//! event and is mutated only through conditional-update transitions (see
//! [`crate::store::RecoveryStore::transition`]). Once it reaches a terminal
//! status it is immutable until the retention sweeper deletes it.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::{consent::ConsentStatus, event::MissedCallEvent, policy::TenantPolicy};

// ─── Lifecycle status ────────────────────────────────────────────────────────

/// Where a case currently sits in its recovery lifecycle.
///
/// `Recovered`, `Escalated`, `Failed`, and `Expired` are terminal: no further
/// attempt is made and no further mutation is written.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EntryStatus {
  Queued,
  Processing,
  AiRescuePending,
  Recovered,
  Escalated,
  Failed,
  Expired,
}

impl EntryStatus {
  pub fn is_terminal(self) -> bool {
    matches!(
      self,
      Self::Recovered | Self::Escalated | Self::Failed | Self::Expired
    )
  }
}

// ─── Priority ────────────────────────────────────────────────────────────────

/// Scheduler ordering hint. Affects which due entry is claimed first, never
/// correctness.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Priority {
  High,
  #[default]
  Medium,
  Low,
}

impl Priority {
  /// Rank used for `ORDER BY`; lower sorts first.
  pub fn rank(self) -> u8 {
    match self {
      Self::High => 0,
      Self::Medium => 1,
      Self::Low => 2,
    }
  }
}

// ─── Outreach method ─────────────────────────────────────────────────────────

/// The channel an outreach attempt goes through.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OutreachMethod {
  Sms,
  Call,
  Email,
}

impl OutreachMethod {
  /// Provider key used for circuit-breaker bookkeeping.
  pub fn provider(self) -> &'static str {
    match self {
      Self::Sms => "sms",
      Self::Call => "voice",
      Self::Email => "email",
    }
  }
}

// ─── QueueEntry ──────────────────────────────────────────────────────────────

/// A single missed-call case with its SLA deadlines and retry accounting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueEntry {
  pub id:                       Uuid,
  pub tenant_id:                String,
  /// Opaque external call identifier from the telephony provider.
  pub call_reference:           String,
  /// E.164 number of the customer whose call went unanswered.
  pub customer_phone:           String,
  pub status:                   EntryStatus,
  pub priority:                 Priority,
  /// Latest time an automated recovery attempt may still be made.
  pub sla_deadline:             DateTime<Utc>,
  /// Latest time before the case must be handed to a human. Overrides all
  /// other policy.
  pub escalation_deadline:      DateTime<Utc>,
  pub next_attempt_at:          DateTime<Utc>,
  pub last_attempt_at:          Option<DateTime<Utc>>,
  pub attempt_count:            u32,
  pub max_attempts:             u32,
  pub ai_rescue_attempted:      bool,
  pub customer_responded:       bool,
  pub recovery_method:          Option<OutreachMethod>,
  pub consent_status:           ConsentStatus,
  pub opt_out_reason:           Option<String>,
  /// When set, attempts are scheduled on the wall clock instead of the
  /// tenant's business-hours calendar.
  pub business_hours_override:  bool,
  pub data_retention_expires_at: DateTime<Utc>,
  pub created_at:               DateTime<Utc>,
  pub updated_at:               DateTime<Utc>,
  pub processed_at:             Option<DateTime<Utc>>,
  pub escalated_at:             Option<DateTime<Utc>>,
}

// ─── NewQueueEntry ───────────────────────────────────────────────────────────

/// Input to [`crate::store::RecoveryStore::create_entry`].
/// `id`, `created_at`, and `updated_at` are always set by the store.
#[derive(Debug, Clone)]
pub struct NewQueueEntry {
  pub tenant_id:                String,
  pub call_reference:           String,
  pub customer_phone:           String,
  pub priority:                 Priority,
  pub sla_deadline:             DateTime<Utc>,
  pub escalation_deadline:      DateTime<Utc>,
  pub next_attempt_at:          DateTime<Utc>,
  pub max_attempts:             u32,
  pub consent_status:           ConsentStatus,
  pub business_hours_override:  bool,
  pub data_retention_expires_at: DateTime<Utc>,
}

impl NewQueueEntry {
  /// Plan a new case from an accepted webhook event under `policy`.
  ///
  /// Deadlines are wall-clock offsets from `now`; the first attempt slot is
  /// shifted into the tenant's business hours.
  pub fn plan(
    event: &MissedCallEvent,
    policy: &TenantPolicy,
    consent: ConsentStatus,
    now: DateTime<Utc>,
  ) -> Self {
    Self {
      tenant_id:                event.tenant_id.clone(),
      call_reference:           event.call_reference.clone(),
      customer_phone:           event.customer_phone.clone(),
      priority:                 Priority::default(),
      sla_deadline:             now + chrono::Duration::hours(i64::from(policy.response_time_hours)),
      escalation_deadline:      now + chrono::Duration::hours(i64::from(policy.escalation_time_hours)),
      next_attempt_at:          policy.next_open(now),
      max_attempts:             policy.max_attempts,
      consent_status:           consent,
      business_hours_override:  false,
      data_retention_expires_at: now + chrono::Duration::days(i64::from(policy.data_retention_days)),
    }
  }
}

// ─── EntryChange ─────────────────────────────────────────────────────────────

/// Field updates applied together with a status transition.
///
/// `None` leaves the column untouched. Fields that are only ever set (never
/// cleared) use a plain `Option`.
#[derive(Debug, Clone)]
pub struct EntryChange {
  pub status:              EntryStatus,
  pub next_attempt_at:     Option<DateTime<Utc>>,
  pub last_attempt_at:     Option<DateTime<Utc>>,
  pub attempt_count:       Option<u32>,
  pub ai_rescue_attempted: Option<bool>,
  pub customer_responded:  Option<bool>,
  pub recovery_method:     Option<OutreachMethod>,
  pub consent_status:      Option<ConsentStatus>,
  pub opt_out_reason:      Option<String>,
  pub processed_at:        Option<DateTime<Utc>>,
  pub escalated_at:        Option<DateTime<Utc>>,
}

impl EntryChange {
  /// A transition to `status` that touches nothing else.
  pub fn to(status: EntryStatus) -> Self {
    Self {
      status,
      next_attempt_at:     None,
      last_attempt_at:     None,
      attempt_count:       None,
      ai_rescue_attempted: None,
      customer_responded:  None,
      recovery_method:     None,
      consent_status:      None,
      opt_out_reason:      None,
      processed_at:        None,
      escalated_at:        None,
    }
  }
}

// ─── Query type ──────────────────────────────────────────────────────────────

/// Parameters for [`crate::store::RecoveryStore::list_entries`].
#[derive(Debug, Clone, Default)]
pub struct EntryQuery {
  pub tenant_id: Option<String>,
  pub status:    Option<EntryStatus>,
  pub limit:     Option<usize>,
  pub offset:    Option<usize>,
}
