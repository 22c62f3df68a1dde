//! Communication-consent state, evaluated before any outbound attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

// ─── Status ──────────────────────────────────────────────────────────────────

/// A customer's recorded consent to being contacted by a tenant.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConsentStatus {
  Pending,
  Granted,
  Denied,
  Withdrawn,
}

// ─── Record ──────────────────────────────────────────────────────────────────

/// Durable consent state for one `(tenant, phone)` pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsentRecord {
  pub tenant_id:      String,
  pub customer_phone: String,
  pub status:         ConsentStatus,
  pub opt_out_reason: Option<String>,
  pub updated_at:     DateTime<Utc>,
}

// ─── Gate decision ───────────────────────────────────────────────────────────

/// Outcome of the consent gate for a prospective outbound attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsentDecision {
  /// Outreach may proceed.
  Granted,
  /// Enqueue is allowed but attempts are blocked until resolved or the
  /// tenant's grace period elapses.
  Pending,
  /// No entry is created (at ingestion) or the entry fails (mid-flight).
  Denied,
}

/// Evaluate a recorded consent state.
///
/// An absent record evaluates to `Granted`: the customer called the tenant's
/// own number, which is an existing business relationship. Explicit records
/// always override; `Withdrawn` is treated as `Denied`.
pub fn evaluate(record: Option<&ConsentRecord>) -> ConsentDecision {
  match record.map(|r| r.status) {
    None | Some(ConsentStatus::Granted) => ConsentDecision::Granted,
    Some(ConsentStatus::Pending) => ConsentDecision::Pending,
    Some(ConsentStatus::Denied) | Some(ConsentStatus::Withdrawn) => ConsentDecision::Denied,
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn record(status: ConsentStatus) -> ConsentRecord {
    ConsentRecord {
      tenant_id:      "t1".into(),
      customer_phone: "+15550001111".into(),
      status,
      opt_out_reason: None,
      updated_at:     chrono::Utc::now(),
    }
  }

  #[test]
  fn absent_record_is_granted() {
    assert_eq!(evaluate(None), ConsentDecision::Granted);
  }

  #[test]
  fn withdrawn_is_denied() {
    assert_eq!(
      evaluate(Some(&record(ConsentStatus::Withdrawn))),
      ConsentDecision::Denied
    );
  }

  #[test]
  fn pending_blocks_without_denying() {
    assert_eq!(
      evaluate(Some(&record(ConsentStatus::Pending))),
      ConsentDecision::Pending
    );
  }
}
