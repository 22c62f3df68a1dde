//! Attempt records — the append-only log of every outreach try.
//!
//! An `AttemptRecord` is owned by exactly one queue entry and is never
//! mutated after creation. It explains *why* an entry's state changed; the
//! audit trail (see [`crate::audit`]) proves *that* it changed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entry::OutreachMethod;

/// One outreach try, in the order it happened.
///
/// `attempt_number` is 1-based and strictly sequential within the entry. It
/// counts every recorded try including provider-level failures;
/// `QueueEntry::attempt_count` tracks only the customer-facing retry budget.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
  pub id:                  Uuid,
  pub entry_id:            Uuid,
  pub attempt_number:      u32,
  pub method:              OutreachMethod,
  pub message_sent:        Option<String>,
  pub response_received:   Option<String>,
  pub ai_confidence_score: Option<f64>,
  pub success:             bool,
  pub customer_engaged:    bool,
  pub escalation_triggered: bool,
  /// Structured reason when `success` is false (provider error class, AI
  /// confidence shortfall, compliance stop, ...).
  pub failure_reason:      Option<String>,
  pub attempted_at:        DateTime<Utc>,
  pub responded_at:        Option<DateTime<Utc>>,
}

/// Input to [`crate::store::RecoveryStore::record_attempt`].
/// `attempt_number` and `attempted_at` are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewAttempt {
  pub entry_id:            Uuid,
  pub method:              OutreachMethod,
  pub message_sent:        Option<String>,
  pub response_received:   Option<String>,
  pub ai_confidence_score: Option<f64>,
  pub success:             bool,
  pub customer_engaged:    bool,
  pub escalation_triggered: bool,
  pub failure_reason:      Option<String>,
  pub responded_at:        Option<DateTime<Utc>>,
}

impl NewAttempt {
  /// Convenience constructor for a plain attempt on `method`; flags default
  /// to false and are set by the outcome handling.
  pub fn new(entry_id: Uuid, method: OutreachMethod) -> Self {
    Self {
      entry_id,
      method,
      message_sent: None,
      response_received: None,
      ai_confidence_score: None,
      success: false,
      customer_engaged: false,
      escalation_triggered: false,
      failure_reason: None,
      responded_at: None,
    }
  }
}
