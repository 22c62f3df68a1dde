//! Integration tests for `SqliteStore` against an in-memory database.

use chrono::{DateTime, Duration, Utc};
use recall_core::{
  attempt::NewAttempt,
  audit::AuditAction,
  breaker::{BreakerState, CircuitBreakerState},
  consent::ConsentStatus,
  deadletter::{DeadLetterChange, DeadLetterStatus, NewDeadLetter},
  entry::{EntryChange, EntryQuery, EntryStatus, NewQueueEntry, OutreachMethod, Priority},
  event::Admission,
  policy::{RateLimitPolicy, TenantPolicy},
  store::{RateDecision, RecoveryStore},
};
use uuid::Uuid;

use crate::SqliteStore;

async fn store() -> SqliteStore {
  SqliteStore::open_in_memory()
    .await
    .expect("in-memory store")
}

fn new_entry(tenant: &str) -> NewQueueEntry {
  let now = Utc::now();
  NewQueueEntry {
    tenant_id:                 tenant.into(),
    call_reference:            "call-1".into(),
    customer_phone:            "+15550001111".into(),
    priority:                  Priority::Medium,
    sla_deadline:              now + Duration::hours(2),
    escalation_deadline:       now + Duration::hours(48),
    next_attempt_at:           now - Duration::minutes(1),
    max_attempts:              3,
    consent_status:            ConsentStatus::Granted,
    business_hours_override:   true,
    data_retention_expires_at: now + Duration::days(365),
  }
}

// ─── Idempotency ledger ──────────────────────────────────────────────────────

#[tokio::test]
async fn first_admission_accepted_then_duplicate() {
  let s = store().await;
  let now = Utc::now();

  let first = s.admit_event("telephony", "evt-1", 90, now).await.unwrap();
  assert_eq!(first, Admission::Accepted);

  let second = s.admit_event("telephony", "evt-1", 90, now).await.unwrap();
  assert!(matches!(second, Admission::Duplicate { entry_id: None }));
}

#[tokio::test]
async fn duplicate_carries_committed_entry_id() {
  let s = store().await;
  let now = Utc::now();
  let entry_id = Uuid::new_v4();

  s.admit_event("telephony", "evt-2", 90, now).await.unwrap();
  s.commit_event("telephony", "evt-2", entry_id).await.unwrap();

  let dup = s.admit_event("telephony", "evt-2", 90, now).await.unwrap();
  assert_eq!(dup, Admission::Duplicate { entry_id: Some(entry_id) });
}

#[tokio::test]
async fn duplicates_only_move_the_observation_counters() {
  let s = store().await;
  let now = Utc::now();

  s.admit_event("telephony", "evt-dup", 90, now).await.unwrap();
  for n in 1..=3 {
    s.admit_event("telephony", "evt-dup", 90, now + Duration::seconds(n))
      .await
      .unwrap();
  }

  let record = s.get_event("telephony", "evt-dup").await.unwrap().unwrap();
  assert_eq!(record.attempts, 4);
  assert_eq!(record.last_seen_at, now + Duration::seconds(3));
  assert_eq!(record.first_seen_at, now);
  assert!(record.entry_id.is_none());
}

#[tokio::test]
async fn released_admission_can_be_admitted_again() {
  let s = store().await;
  let now = Utc::now();

  s.admit_event("telephony", "evt-3", 90, now).await.unwrap();
  s.release_event("telephony", "evt-3").await.unwrap();

  let again = s.admit_event("telephony", "evt-3", 90, now).await.unwrap();
  assert_eq!(again, Admission::Accepted);
}

#[tokio::test]
async fn expired_key_admits_afresh() {
  let s = store().await;
  let now = Utc::now();

  s.admit_event("telephony", "evt-4", 90, now).await.unwrap();

  let after_ttl = now + Duration::days(91);
  let again = s
    .admit_event("telephony", "evt-4", 90, after_ttl)
    .await
    .unwrap();
  assert_eq!(again, Admission::Accepted);
}

#[tokio::test]
async fn distinct_providers_do_not_collide() {
  let s = store().await;
  let now = Utc::now();

  s.admit_event("telephony", "evt-5", 90, now).await.unwrap();
  let other = s.admit_event("backup-trunk", "evt-5", 90, now).await.unwrap();
  assert_eq!(other, Admission::Accepted);
}

// ─── Entries and transitions ─────────────────────────────────────────────────

#[tokio::test]
async fn create_and_get_entry() {
  let s = store().await;
  let entry = s.create_entry(new_entry("t1"), "webhook").await.unwrap();

  assert_eq!(entry.status, EntryStatus::Queued);
  assert_eq!(entry.attempt_count, 0);

  let fetched = s.get_entry(entry.id).await.unwrap().unwrap();
  assert_eq!(fetched.id, entry.id);
  assert_eq!(fetched.customer_phone, entry.customer_phone);
  assert_eq!(fetched.status, EntryStatus::Queued);
}

#[tokio::test]
async fn create_writes_an_insert_audit_row() {
  let s = store().await;
  let entry = s.create_entry(new_entry("t1"), "webhook").await.unwrap();

  let audit = s.audit_for_entry(entry.id).await.unwrap();
  assert_eq!(audit.len(), 1);
  assert_eq!(audit[0].action, AuditAction::Insert);
  assert!(audit[0].old_values.is_none());
  assert_eq!(
    audit[0].new_values.as_ref().unwrap()["status"],
    serde_json::json!("queued")
  );
  assert_eq!(audit[0].changed_by, "webhook");
}

#[tokio::test]
async fn transition_claims_exactly_once() {
  let s = store().await;
  let entry = s.create_entry(new_entry("t1"), "webhook").await.unwrap();

  // First claimant wins.
  let claimed = s
    .transition(
      entry.id,
      EntryStatus::Queued,
      EntryChange::to(EntryStatus::Processing),
      "scheduler-a",
    )
    .await
    .unwrap();
  assert_eq!(claimed.unwrap().status, EntryStatus::Processing);

  // Second claimant expected 'queued' and loses the race.
  let lost = s
    .transition(
      entry.id,
      EntryStatus::Queued,
      EntryChange::to(EntryStatus::Processing),
      "scheduler-b",
    )
    .await
    .unwrap();
  assert!(lost.is_none());
}

#[tokio::test]
async fn transition_mirrors_update_audit_with_snapshots() {
  let s = store().await;
  let entry = s.create_entry(new_entry("t1"), "webhook").await.unwrap();

  s.transition(
    entry.id,
    EntryStatus::Queued,
    EntryChange::to(EntryStatus::Processing),
    "scheduler",
  )
  .await
  .unwrap();

  let audit = s.audit_for_entry(entry.id).await.unwrap();
  assert_eq!(audit.len(), 2);
  let update = &audit[1];
  assert_eq!(update.action, AuditAction::Update);
  assert_eq!(
    update.old_values.as_ref().unwrap()["status"],
    serde_json::json!("queued")
  );
  assert_eq!(
    update.new_values.as_ref().unwrap()["status"],
    serde_json::json!("processing")
  );
}

#[tokio::test]
async fn terminal_entries_reject_further_transitions() {
  let s = store().await;
  let entry = s.create_entry(new_entry("t1"), "webhook").await.unwrap();

  let mut change = EntryChange::to(EntryStatus::Recovered);
  change.customer_responded = Some(true);
  s.transition(entry.id, EntryStatus::Queued, change, "operator")
    .await
    .unwrap();

  let err = s
    .transition(
      entry.id,
      EntryStatus::Recovered,
      EntryChange::to(EntryStatus::Queued),
      "scheduler",
    )
    .await
    .unwrap_err();
  assert!(matches!(
    err,
    crate::Error::Core(recall_core::Error::InvalidTransition { .. })
  ));

  // And no audit row was written for the rejected mutation.
  let audit = s.audit_for_entry(entry.id).await.unwrap();
  assert_eq!(audit.len(), 2);
}

#[tokio::test]
async fn transition_unknown_entry_errors() {
  let s = store().await;
  let err = s
    .transition(
      Uuid::new_v4(),
      EntryStatus::Queued,
      EntryChange::to(EntryStatus::Processing),
      "scheduler",
    )
    .await
    .unwrap_err();
  assert!(matches!(err, crate::Error::EntryNotFound(_)));
}

#[tokio::test]
async fn transition_applies_field_changes() {
  let s = store().await;
  let entry = s.create_entry(new_entry("t1"), "webhook").await.unwrap();
  let next = Utc::now() + Duration::minutes(30);

  s.transition(
    entry.id,
    EntryStatus::Queued,
    EntryChange::to(EntryStatus::Processing),
    "scheduler",
  )
  .await
  .unwrap();

  let mut change = EntryChange::to(EntryStatus::Queued);
  change.attempt_count = Some(1);
  change.next_attempt_at = Some(next);
  change.last_attempt_at = Some(Utc::now());
  let updated = s
    .transition(entry.id, EntryStatus::Processing, change, "scheduler")
    .await
    .unwrap()
    .unwrap();

  assert_eq!(updated.attempt_count, 1);
  assert!(updated.last_attempt_at.is_some());
  assert!((updated.next_attempt_at - next).num_seconds().abs() < 1);
}

// ─── Attempt log ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn attempts_number_sequentially() {
  let s = store().await;
  let entry = s.create_entry(new_entry("t1"), "webhook").await.unwrap();

  for _ in 0..3 {
    s.record_attempt(NewAttempt::new(entry.id, OutreachMethod::Sms))
      .await
      .unwrap();
  }

  let attempts = s.attempts_for(entry.id).await.unwrap();
  let numbers: Vec<u32> = attempts.iter().map(|a| a.attempt_number).collect();
  assert_eq!(numbers, vec![1, 2, 3]);
}

#[tokio::test]
async fn attempt_round_trips_outcome_fields() {
  let s = store().await;
  let entry = s.create_entry(new_entry("t1"), "webhook").await.unwrap();

  let mut input = NewAttempt::new(entry.id, OutreachMethod::Call);
  input.message_sent = Some("We missed you — call us back?".into());
  input.ai_confidence_score = Some(0.92);
  input.success = true;
  input.customer_engaged = true;
  let recorded = s.record_attempt(input).await.unwrap();

  let attempts = s.attempts_for(entry.id).await.unwrap();
  assert_eq!(attempts.len(), 1);
  assert_eq!(attempts[0].id, recorded.id);
  assert_eq!(attempts[0].method, OutreachMethod::Call);
  assert!(attempts[0].success);
  assert!(attempts[0].customer_engaged);
  assert_eq!(attempts[0].ai_confidence_score, Some(0.92));
}

// ─── Scheduler selections ────────────────────────────────────────────────────

#[tokio::test]
async fn due_entries_ordered_by_priority() {
  let s = store().await;
  let now = Utc::now();

  let mut low = new_entry("t1");
  low.priority = Priority::Low;
  let mut high = new_entry("t1");
  high.priority = Priority::High;
  let low = s.create_entry(low, "webhook").await.unwrap();
  let high = s.create_entry(high, "webhook").await.unwrap();

  let due = s.due_entries(now, 10).await.unwrap();
  assert_eq!(due.len(), 2);
  assert_eq!(due[0].id, high.id);
  assert_eq!(due[1].id, low.id);
}

#[tokio::test]
async fn future_entries_are_not_due() {
  let s = store().await;
  let now = Utc::now();

  let mut later = new_entry("t1");
  later.next_attempt_at = now + Duration::hours(1);
  s.create_entry(later, "webhook").await.unwrap();

  assert!(s.due_entries(now, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn breached_deadlines_selects_across_statuses() {
  let s = store().await;
  let now = Utc::now();

  // Escalation deadline already passed.
  let mut breached = new_entry("t1");
  breached.escalation_deadline = now - Duration::minutes(5);
  let breached = s.create_entry(breached, "webhook").await.unwrap();
  s.transition(
    breached.id,
    EntryStatus::Queued,
    EntryChange::to(EntryStatus::Processing),
    "scheduler",
  )
  .await
  .unwrap();

  // SLA passed with zero attempts.
  let mut stale = new_entry("t1");
  stale.sla_deadline = now - Duration::minutes(5);
  let stale = s.create_entry(stale, "webhook").await.unwrap();

  // Healthy entry.
  s.create_entry(new_entry("t1"), "webhook").await.unwrap();

  let hits = s.breached_deadlines(now, 10).await.unwrap();
  let ids: Vec<Uuid> = hits.iter().map(|e| e.id).collect();
  assert!(ids.contains(&breached.id));
  assert!(ids.contains(&stale.id));
  assert_eq!(ids.len(), 2);
}

#[tokio::test]
async fn expired_rescues_selects_only_closed_windows() {
  let s = store().await;
  let now = Utc::now();

  let entry = s.create_entry(new_entry("t1"), "webhook").await.unwrap();
  s.transition(
    entry.id,
    EntryStatus::Queued,
    EntryChange::to(EntryStatus::Processing),
    "scheduler",
  )
  .await
  .unwrap();
  let mut park = EntryChange::to(EntryStatus::AiRescuePending);
  park.next_attempt_at = Some(now - Duration::minutes(1));
  s.transition(entry.id, EntryStatus::Processing, park, "scheduler")
    .await
    .unwrap();

  let expired = s.expired_rescues(now, 10).await.unwrap();
  assert_eq!(expired.len(), 1);
  assert_eq!(expired[0].id, entry.id);

  // A window still open is not selected.
  let open = s
    .expired_rescues(now - Duration::minutes(5), 10)
    .await
    .unwrap();
  assert!(open.is_empty());
}

// ─── Consent ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn consent_set_and_overwrite() {
  let s = store().await;

  assert!(s.get_consent("t1", "+15550001111").await.unwrap().is_none());

  s.set_consent("t1", "+15550001111", ConsentStatus::Pending, None)
    .await
    .unwrap();
  let record = s.get_consent("t1", "+15550001111").await.unwrap().unwrap();
  assert_eq!(record.status, ConsentStatus::Pending);

  s.set_consent(
    "t1",
    "+15550001111",
    ConsentStatus::Withdrawn,
    Some("texted STOP".into()),
  )
  .await
  .unwrap();
  let record = s.get_consent("t1", "+15550001111").await.unwrap().unwrap();
  assert_eq!(record.status, ConsentStatus::Withdrawn);
  assert_eq!(record.opt_out_reason.as_deref(), Some("texted STOP"));
}

// ─── Tenant policy ───────────────────────────────────────────────────────────

#[tokio::test]
async fn missing_policy_returns_defaults() {
  let s = store().await;
  let policy = s.get_policy("t1").await.unwrap();
  assert_eq!(policy.max_attempts, 3);
  assert_eq!(policy.response_time_hours, 2);
}

#[tokio::test]
async fn put_policy_round_trips() {
  let s = store().await;
  let mut policy = TenantPolicy::default();
  policy.max_attempts = 5;
  policy.escalation_on_ai_failure = true;

  s.put_policy("t1", &policy).await.unwrap();
  let stored = s.get_policy("t1").await.unwrap();
  assert_eq!(stored.max_attempts, 5);
  assert!(stored.escalation_on_ai_failure);

  // Other tenants still see defaults.
  assert_eq!(s.get_policy("t2").await.unwrap().max_attempts, 3);
}

// ─── Circuit breakers ────────────────────────────────────────────────────────

#[tokio::test]
async fn breaker_defaults_to_closed() {
  let s = store().await;
  let breaker = s.load_breaker("sms", "t1").await.unwrap();
  assert_eq!(breaker.state, BreakerState::Closed);
  assert_eq!(breaker.failure_count, 0);
}

#[tokio::test]
async fn cas_breaker_wins_once_per_observation() {
  let s = store().await;
  let current = s.load_breaker("sms", "t1").await.unwrap();

  let mut next = current.clone();
  next.failure_count = 1;
  assert!(s.cas_breaker(&current, &next).await.unwrap());

  // A second swap from the same stale observation loses.
  let mut other = current.clone();
  other.failure_count = 1;
  assert!(!s.cas_breaker(&current, &other).await.unwrap());

  let reloaded = s.load_breaker("sms", "t1").await.unwrap();
  assert_eq!(reloaded.failure_count, 1);
}

#[tokio::test]
async fn cas_breaker_swaps_full_state() {
  let s = store().await;
  let now = Utc::now();
  let current = s.load_breaker("voice", "t1").await.unwrap();

  let next = CircuitBreakerState {
    state: BreakerState::Open,
    failure_count: 3,
    opened_at: Some(now),
    updated_at: now,
    ..current.clone()
  };
  assert!(s.cas_breaker(&current, &next).await.unwrap());

  let reloaded = s.load_breaker("voice", "t1").await.unwrap();
  assert_eq!(reloaded.state, BreakerState::Open);
  assert!(reloaded.opened_at.is_some());
}

// ─── Dead letters ────────────────────────────────────────────────────────────

fn dead_letter(entry_id: Uuid, due: DateTime<Utc>) -> NewDeadLetter {
  NewDeadLetter {
    tenant_id:      "t1".into(),
    entry_id,
    method:         OutreachMethod::Sms,
    customer_phone: "+15550001111".into(),
    payload:        "We missed your call".into(),
    failure_reason: "gateway timeout".into(),
    max_retries:    3,
    next_retry_at:  due,
  }
}

#[tokio::test]
async fn dead_letter_lifecycle() {
  let s = store().await;
  let now = Utc::now();
  let pushed = s
    .push_dead_letter(dead_letter(Uuid::new_v4(), now - Duration::minutes(1)))
    .await
    .unwrap();
  assert_eq!(pushed.status, DeadLetterStatus::Pending);

  let due = s.due_dead_letters(now, 10).await.unwrap();
  assert_eq!(due.len(), 1);

  // Claim it; a racing claim loses.
  let claimed = s
    .update_dead_letter(
      pushed.id,
      DeadLetterStatus::Pending,
      DeadLetterChange::to(DeadLetterStatus::Processing),
    )
    .await
    .unwrap();
  assert!(claimed.is_some());
  let lost = s
    .update_dead_letter(
      pushed.id,
      DeadLetterStatus::Pending,
      DeadLetterChange::to(DeadLetterStatus::Processing),
    )
    .await
    .unwrap();
  assert!(lost.is_none());

  // Resolve it.
  let resolved = s
    .update_dead_letter(
      pushed.id,
      DeadLetterStatus::Processing,
      DeadLetterChange::to(DeadLetterStatus::Resolved),
    )
    .await
    .unwrap()
    .unwrap();
  assert_eq!(resolved.status, DeadLetterStatus::Resolved);

  assert!(s.due_dead_letters(now, 10).await.unwrap().is_empty());
  let failed = s
    .list_dead_letters(Some(DeadLetterStatus::Resolved), 10)
    .await
    .unwrap();
  assert_eq!(failed.len(), 1);
}

// ─── Rate limiting ───────────────────────────────────────────────────────────

#[tokio::test]
async fn rate_gate_escalates_soft_then_hard() {
  let s = store().await;
  let now = Utc::now();
  let policy = RateLimitPolicy {
    window_seconds: 60,
    soft_limit:     3,
    hard_limit:     5,
    block_minutes:  15,
  };

  for _ in 0..3 {
    let d = s.rate_check("t1", "client-a", &policy, now).await.unwrap();
    assert_eq!(d, RateDecision::Allowed);
  }

  // 4th and 5th exceed the soft threshold.
  for _ in 0..2 {
    let d = s.rate_check("t1", "client-a", &policy, now).await.unwrap();
    assert_eq!(d, RateDecision::RateLimited);
  }

  // 6th crosses the hard threshold and sets a block.
  let d = s.rate_check("t1", "client-a", &policy, now).await.unwrap();
  assert!(matches!(d, RateDecision::Blocked { .. }));

  // The block holds even after the window itself would have slid past.
  let later = now + Duration::minutes(5);
  let d = s.rate_check("t1", "client-a", &policy, later).await.unwrap();
  assert!(matches!(d, RateDecision::Blocked { .. }));

  // After the block expires the client starts fresh.
  let after = now + Duration::minutes(16);
  let d = s.rate_check("t1", "client-a", &policy, after).await.unwrap();
  assert_eq!(d, RateDecision::Allowed);
}

#[tokio::test]
async fn rate_windows_are_per_client() {
  let s = store().await;
  let now = Utc::now();
  let policy = RateLimitPolicy {
    window_seconds: 60,
    soft_limit:     1,
    hard_limit:     10,
    block_minutes:  15,
  };

  s.rate_check("t1", "client-a", &policy, now).await.unwrap();
  s.rate_check("t1", "client-a", &policy, now).await.unwrap();

  let d = s.rate_check("t1", "client-b", &policy, now).await.unwrap();
  assert_eq!(d, RateDecision::Allowed);
}

// ─── Retention sweeps ────────────────────────────────────────────────────────

#[tokio::test]
async fn purge_expired_idempotency_keys() {
  let s = store().await;
  let now = Utc::now();

  s.admit_event("telephony", "old", 90, now - Duration::days(91))
    .await
    .unwrap();
  s.admit_event("telephony", "live", 90, now).await.unwrap();

  let removed = s.purge_expired_idempotency(now).await.unwrap();
  assert_eq!(removed, 1);

  // The live key still deduplicates.
  let dup = s.admit_event("telephony", "live", 90, now).await.unwrap();
  assert!(matches!(dup, Admission::Duplicate { .. }));
}

#[tokio::test]
async fn purge_expired_entries_cascades_and_audits() {
  let s = store().await;
  let now = Utc::now();

  let mut input = new_entry("t1");
  input.data_retention_expires_at = now - Duration::days(1);
  let entry = s.create_entry(input, "webhook").await.unwrap();
  s.record_attempt(NewAttempt::new(entry.id, OutreachMethod::Sms))
    .await
    .unwrap();

  let kept = s.create_entry(new_entry("t1"), "webhook").await.unwrap();

  let removed = s.purge_expired_entries(now).await.unwrap();
  assert_eq!(removed, 1);

  assert!(s.get_entry(entry.id).await.unwrap().is_none());
  assert!(s.attempts_for(entry.id).await.unwrap().is_empty());
  assert!(s.get_entry(kept.id).await.unwrap().is_some());

  // The deletion itself is audited with a final snapshot.
  let audit = s.audit_for_entry(entry.id).await.unwrap();
  let delete = audit.last().unwrap();
  assert_eq!(delete.action, AuditAction::Delete);
  assert!(delete.old_values.is_some());
  assert!(delete.new_values.is_none());
  assert_eq!(delete.changed_by, "retention-sweeper");
}

#[tokio::test]
async fn purge_audit_before_cutoff() {
  let s = store().await;
  let entry = s.create_entry(new_entry("t1"), "webhook").await.unwrap();

  let removed = s
    .purge_audit_before(Utc::now() + Duration::seconds(5))
    .await
    .unwrap();
  assert_eq!(removed, 1);
  assert!(s.audit_for_entry(entry.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn list_entries_filters_by_tenant_and_status() {
  let s = store().await;

  let a = s.create_entry(new_entry("t1"), "webhook").await.unwrap();
  s.create_entry(new_entry("t2"), "webhook").await.unwrap();
  s.transition(
    a.id,
    EntryStatus::Queued,
    EntryChange::to(EntryStatus::Processing),
    "scheduler",
  )
  .await
  .unwrap();

  let q = EntryQuery {
    tenant_id: Some("t1".into()),
    status: Some(EntryStatus::Processing),
    ..Default::default()
  };
  let hits = s.list_entries(&q).await.unwrap();
  assert_eq!(hits.len(), 1);
  assert_eq!(hits[0].id, a.id);

  let all_t2 = s
    .list_entries(&EntryQuery { tenant_id: Some("t2".into()), ..Default::default() })
    .await
    .unwrap();
  assert_eq!(all_t2.len(), 1);
}
