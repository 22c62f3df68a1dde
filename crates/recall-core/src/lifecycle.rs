//! The recovery state machine — transition permissions and time-driven
//! dispositions, computed as pure functions over an entry and a clock.
//!
//! Status transitions are monotonic except for the bounded retry loop
//! (`queued → processing → queued`). Deadline breaches pre-empt every other
//! transition: a case must never silently retry past its human-handoff
//! deadline.

use chrono::{DateTime, Utc};

use crate::{
  entry::{EntryStatus, QueueEntry},
  policy::TenantPolicy,
};

// ─── Transition permissions ──────────────────────────────────────────────────

/// Whether the state machine allows moving `from` → `to`.
///
/// Terminal states permit nothing; the store enforces this on every
/// conditional update.
pub fn permitted(from: EntryStatus, to: EntryStatus) -> bool {
  use EntryStatus::*;
  match from {
    Queued => matches!(to, Processing | Recovered | Escalated | Failed | Expired),
    Processing => {
      matches!(to, Queued | AiRescuePending | Recovered | Escalated | Failed | Expired)
    }
    AiRescuePending => matches!(to, Queued | Recovered | Escalated | Failed | Expired),
    Recovered | Escalated | Failed | Expired => false,
  }
}

// ─── Deadline dispositions ───────────────────────────────────────────────────

/// A time-based transition that must happen before anything else does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadlineBreach {
  /// `escalation_deadline` passed: hand off to a human, whatever else is
  /// going on.
  Escalate,
  /// `sla_deadline` passed with zero attempts made (e.g. consent never
  /// resolved): the case can no longer be recovered automatically.
  Expire,
}

/// The first deadline check of every scheduler cycle. Escalation wins over
/// expiry when both deadlines have passed.
pub fn deadline_breach(entry: &QueueEntry, now: DateTime<Utc>) -> Option<DeadlineBreach> {
  if entry.status.is_terminal() {
    return None;
  }
  if entry.escalation_deadline <= now {
    return Some(DeadlineBreach::Escalate);
  }
  if entry.sla_deadline <= now && entry.attempt_count == 0 {
    return Some(DeadlineBreach::Expire);
  }
  None
}

// ─── Rescue-window expiry ────────────────────────────────────────────────────

/// What to do with an `ai_rescue_pending` entry whose reply window closed
/// without a customer response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RescueExpiry {
  /// Back to the queue for another attempt. `attempt_count` becomes
  /// `counted_attempts`.
  Requeue { counted_attempts: u32 },
  /// The retry budget is spent; hand off to a human.
  Escalate,
}

/// Decide the disposition of an expired rescue window under `policy`.
///
/// Whether the silent window consumes retry budget is a tenant policy choice
/// (`rescue_expiry_counts_attempt`).
pub fn rescue_expiry(entry: &QueueEntry, policy: &TenantPolicy) -> RescueExpiry {
  let counted = if policy.rescue_expiry_counts_attempt {
    entry.attempt_count.saturating_add(1)
  } else {
    entry.attempt_count
  };
  if counted >= entry.max_attempts {
    RescueExpiry::Escalate
  } else {
    RescueExpiry::Requeue { counted_attempts: counted }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::consent::ConsentStatus;

  fn ts(s: &str) -> DateTime<Utc> {
    s.parse().unwrap()
  }

  fn entry(status: EntryStatus) -> QueueEntry {
    QueueEntry {
      id:                        uuid::Uuid::new_v4(),
      tenant_id:                 "t1".into(),
      call_reference:            "call-1".into(),
      customer_phone:            "+15550001111".into(),
      status,
      priority:                  Default::default(),
      sla_deadline:              ts("2026-03-02T14:00:00Z"),
      escalation_deadline:       ts("2026-03-04T12:00:00Z"),
      next_attempt_at:           ts("2026-03-02T12:00:00Z"),
      last_attempt_at:           None,
      attempt_count:             0,
      max_attempts:              3,
      ai_rescue_attempted:       false,
      customer_responded:        false,
      recovery_method:           None,
      consent_status:            ConsentStatus::Granted,
      opt_out_reason:            None,
      business_hours_override:   false,
      data_retention_expires_at: ts("2027-03-02T12:00:00Z"),
      created_at:                ts("2026-03-02T12:00:00Z"),
      updated_at:                ts("2026-03-02T12:00:00Z"),
      processed_at:              None,
      escalated_at:              None,
    }
  }

  #[test]
  fn terminal_states_permit_nothing() {
    for terminal in [
      EntryStatus::Recovered,
      EntryStatus::Escalated,
      EntryStatus::Failed,
      EntryStatus::Expired,
    ] {
      assert!(!permitted(terminal, EntryStatus::Queued));
      assert!(!permitted(terminal, EntryStatus::Processing));
    }
  }

  #[test]
  fn retry_loop_is_permitted() {
    assert!(permitted(EntryStatus::Queued, EntryStatus::Processing));
    assert!(permitted(EntryStatus::Processing, EntryStatus::Queued));
  }

  #[test]
  fn queued_cannot_skip_to_rescue_pending() {
    assert!(!permitted(EntryStatus::Queued, EntryStatus::AiRescuePending));
  }

  #[test]
  fn escalation_wins_when_both_deadlines_passed() {
    let mut e = entry(EntryStatus::Queued);
    e.escalation_deadline = ts("2026-03-02T11:00:00Z");
    // The zero-attempt SLA breach would expire; escalation pre-empts it.
    e.sla_deadline = ts("2026-03-02T10:00:00Z");
    assert_eq!(
      deadline_breach(&e, ts("2026-03-02T12:00:00Z")),
      Some(DeadlineBreach::Escalate)
    );
  }

  #[test]
  fn sla_breach_with_zero_attempts_expires() {
    let mut e = entry(EntryStatus::Queued);
    e.sla_deadline = ts("2026-03-02T11:00:00Z");
    assert_eq!(
      deadline_breach(&e, ts("2026-03-02T12:00:00Z")),
      Some(DeadlineBreach::Expire)
    );
  }

  #[test]
  fn sla_breach_after_attempts_is_not_expiry() {
    let mut e = entry(EntryStatus::Queued);
    e.sla_deadline = ts("2026-03-02T11:00:00Z");
    e.attempt_count = 1;
    assert_eq!(deadline_breach(&e, ts("2026-03-02T12:00:00Z")), None);
  }

  #[test]
  fn terminal_entries_never_breach() {
    let mut e = entry(EntryStatus::Recovered);
    e.escalation_deadline = ts("2026-03-01T00:00:00Z");
    assert_eq!(deadline_breach(&e, ts("2026-03-02T12:00:00Z")), None);
  }

  #[test]
  fn rescue_expiry_requeues_with_budget_left() {
    let mut e = entry(EntryStatus::AiRescuePending);
    e.attempt_count = 1;
    let policy = TenantPolicy::default();
    assert_eq!(
      rescue_expiry(&e, &policy),
      RescueExpiry::Requeue { counted_attempts: 1 }
    );
  }

  #[test]
  fn rescue_expiry_can_consume_budget_when_configured() {
    let mut e = entry(EntryStatus::AiRescuePending);
    e.attempt_count = 2;
    let mut policy = TenantPolicy::default();
    policy.rescue_expiry_counts_attempt = true;
    // 2 + 1 == max_attempts: the budget is spent.
    assert_eq!(rescue_expiry(&e, &policy), RescueExpiry::Escalate);
  }

  #[test]
  fn rescue_expiry_escalates_when_exhausted() {
    let mut e = entry(EntryStatus::AiRescuePending);
    e.attempt_count = 3;
    let policy = TenantPolicy::default();
    assert_eq!(rescue_expiry(&e, &policy), RescueExpiry::Escalate);
  }
}
