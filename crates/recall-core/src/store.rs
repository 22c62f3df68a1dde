//! The `RecoveryStore` trait — the storage abstraction every other crate
//! depends on.
//!
//! Implemented by storage backends (e.g. `recall-store-sqlite`). Higher
//! layers (`recall-engine`, `recall-api`) depend on this abstraction, not on
//! any concrete backend.
//!
//! All shared mutable state (entry status, breaker state, dead-letter
//! status) is advanced through conditional updates: the mutation succeeds
//! only if the row still holds the expected prior value, so concurrent
//! scheduler instances race safely without locks. All methods return `Send`
//! futures so the trait can be used from multi-threaded async runtimes.

use std::future::Future;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
  attempt::{AttemptRecord, NewAttempt},
  audit::AuditRecord,
  breaker::CircuitBreakerState,
  consent::{ConsentRecord, ConsentStatus},
  deadletter::{DeadLetterChange, DeadLetterEntry, DeadLetterStatus, NewDeadLetter},
  entry::{EntryChange, EntryQuery, EntryStatus, NewQueueEntry, QueueEntry},
  event::{Admission, IdempotencyRecord},
  policy::{RateLimitPolicy, TenantPolicy},
};

// ─── Rate-limit decision ─────────────────────────────────────────────────────

/// Outcome of the ingestion rate gate for one `(tenant, client)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
  Allowed,
  /// Soft threshold exceeded; the caller should back off.
  RateLimited,
  /// Hard threshold exceeded; rejected until `until`.
  Blocked { until: DateTime<Utc> },
}

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Abstraction over the recovery queue's durable state.
pub trait RecoveryStore: Send + Sync {
  type Error: std::error::Error + Send + Sync + 'static;

  // ── Idempotency ledger ────────────────────────────────────────────────

  /// Record first sight of `(provider, external_event_id)` and return
  /// [`Admission::Accepted`], or bump the duplicate counter and return
  /// [`Admission::Duplicate`]. A key past its TTL admits again.
  ///
  /// Admission is provisional: the caller must either
  /// [`commit_event`](Self::commit_event) or
  /// [`release_event`](Self::release_event) afterwards.
  fn admit_event<'a>(
    &'a self,
    provider: &'a str,
    external_event_id: &'a str,
    ttl_days: u32,
    now: DateTime<Utc>,
  ) -> impl Future<Output = Result<Admission, Self::Error>> + Send + 'a;

  /// Stamp the admitted key with the entry the enqueue committed to.
  fn commit_event<'a>(
    &'a self,
    provider: &'a str,
    external_event_id: &'a str,
    entry_id: Uuid,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  /// Remove a provisional admission so a legitimate retry delivery can
  /// succeed after the caller's processing failed.
  fn release_event<'a>(
    &'a self,
    provider: &'a str,
    external_event_id: &'a str,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  /// The ledger row for a key, if present. Duplicate deliveries bump its
  /// `last_seen_at`/`attempts` counters.
  fn get_event<'a>(
    &'a self,
    provider: &'a str,
    external_event_id: &'a str,
  ) -> impl Future<Output = Result<Option<IdempotencyRecord>, Self::Error>> + Send + 'a;

  // ── Queue entries ─────────────────────────────────────────────────────

  /// Persist a new case and its `insert` audit row in one transaction.
  fn create_entry<'a>(
    &'a self,
    input: NewQueueEntry,
    changed_by: &'a str,
  ) -> impl Future<Output = Result<QueueEntry, Self::Error>> + Send + 'a;

  fn get_entry(
    &self,
    id: Uuid,
  ) -> impl Future<Output = Result<Option<QueueEntry>, Self::Error>> + Send + '_;

  fn list_entries<'a>(
    &'a self,
    query: &'a EntryQuery,
  ) -> impl Future<Output = Result<Vec<QueueEntry>, Self::Error>> + Send + 'a;

  /// Conditionally transition an entry: the update commits only if `status`
  /// still equals `expected`, and mirrors an `update` audit row in the same
  /// transaction. Returns `None` when the condition failed (lost race or
  /// stale read) — at-most-one concurrent caller wins.
  ///
  /// Returns an error if the requested target is not a permitted transition
  /// from `expected` (terminal states permit nothing).
  fn transition<'a>(
    &'a self,
    id: Uuid,
    expected: EntryStatus,
    change: EntryChange,
    changed_by: &'a str,
  ) -> impl Future<Output = Result<Option<QueueEntry>, Self::Error>> + Send + 'a;

  /// Append an attempt record; `attempt_number` is assigned sequentially
  /// within the entry.
  fn record_attempt(
    &self,
    input: NewAttempt,
  ) -> impl Future<Output = Result<AttemptRecord, Self::Error>> + Send + '_;

  fn attempts_for(
    &self,
    entry_id: Uuid,
  ) -> impl Future<Output = Result<Vec<AttemptRecord>, Self::Error>> + Send + '_;

  // ── Scheduler selections ──────────────────────────────────────────────

  /// Queued entries whose `next_attempt_at` has arrived, highest priority
  /// first, oldest first within a priority.
  fn due_entries(
    &self,
    now: DateTime<Utc>,
    limit: usize,
  ) -> impl Future<Output = Result<Vec<QueueEntry>, Self::Error>> + Send + '_;

  /// Non-terminal entries past a deadline, regardless of status.
  fn breached_deadlines(
    &self,
    now: DateTime<Utc>,
    limit: usize,
  ) -> impl Future<Output = Result<Vec<QueueEntry>, Self::Error>> + Send + '_;

  /// `ai_rescue_pending` entries whose reply window has closed.
  fn expired_rescues(
    &self,
    now: DateTime<Utc>,
    limit: usize,
  ) -> impl Future<Output = Result<Vec<QueueEntry>, Self::Error>> + Send + '_;

  // ── Consent ───────────────────────────────────────────────────────────

  fn get_consent<'a>(
    &'a self,
    tenant_id: &'a str,
    customer_phone: &'a str,
  ) -> impl Future<Output = Result<Option<ConsentRecord>, Self::Error>> + Send + 'a;

  fn set_consent<'a>(
    &'a self,
    tenant_id: &'a str,
    customer_phone: &'a str,
    status: ConsentStatus,
    opt_out_reason: Option<String>,
  ) -> impl Future<Output = Result<ConsentRecord, Self::Error>> + Send + 'a;

  // ── Tenant policy ─────────────────────────────────────────────────────

  /// The tenant's policy, or the defaults when none is stored.
  fn get_policy<'a>(
    &'a self,
    tenant_id: &'a str,
  ) -> impl Future<Output = Result<TenantPolicy, Self::Error>> + Send + 'a;

  fn put_policy<'a>(
    &'a self,
    tenant_id: &'a str,
    policy: &'a TenantPolicy,
  ) -> impl Future<Output = Result<(), Self::Error>> + Send + 'a;

  // ── Circuit breakers ──────────────────────────────────────────────────

  /// The breaker row for `(provider, tenant)`, or the closed default.
  fn load_breaker<'a>(
    &'a self,
    provider: &'a str,
    tenant_id: &'a str,
  ) -> impl Future<Output = Result<CircuitBreakerState, Self::Error>> + Send + 'a;

  /// Swap the breaker row to `next` only if it still equals `current`.
  /// Returns whether the swap won.
  fn cas_breaker<'a>(
    &'a self,
    current: &'a CircuitBreakerState,
    next: &'a CircuitBreakerState,
  ) -> impl Future<Output = Result<bool, Self::Error>> + Send + 'a;

  // ── Dead letters ──────────────────────────────────────────────────────

  fn push_dead_letter(
    &self,
    input: NewDeadLetter,
  ) -> impl Future<Output = Result<DeadLetterEntry, Self::Error>> + Send + '_;

  /// Pending dead letters whose `next_retry_at` has arrived.
  fn due_dead_letters(
    &self,
    now: DateTime<Utc>,
    limit: usize,
  ) -> impl Future<Output = Result<Vec<DeadLetterEntry>, Self::Error>> + Send + '_;

  /// Conditional update mirroring [`transition`](Self::transition):
  /// commits only if `status` still equals `expected`.
  fn update_dead_letter(
    &self,
    id: Uuid,
    expected: DeadLetterStatus,
    change: DeadLetterChange,
  ) -> impl Future<Output = Result<Option<DeadLetterEntry>, Self::Error>> + Send + '_;

  fn list_dead_letters(
    &self,
    status: Option<DeadLetterStatus>,
    limit: usize,
  ) -> impl Future<Output = Result<Vec<DeadLetterEntry>, Self::Error>> + Send + '_;

  // ── Rate limiting ─────────────────────────────────────────────────────

  /// Count this request against `(tenant, client)`'s sliding window and
  /// decide. Blocked requests are not counted. The increment and the
  /// decision are one atomic operation.
  fn rate_check<'a>(
    &'a self,
    tenant_id: &'a str,
    client_key: &'a str,
    policy: &'a RateLimitPolicy,
    now: DateTime<Utc>,
  ) -> impl Future<Output = Result<RateDecision, Self::Error>> + Send + 'a;

  // ── Audit ─────────────────────────────────────────────────────────────

  fn audit_for_entry(
    &self,
    entry_id: Uuid,
  ) -> impl Future<Output = Result<Vec<AuditRecord>, Self::Error>> + Send + '_;

  // ── Retention sweeps ──────────────────────────────────────────────────

  /// Delete idempotency records past `expires_at`. Returns rows removed.
  fn purge_expired_idempotency(
    &self,
    now: DateTime<Utc>,
  ) -> impl Future<Output = Result<u64, Self::Error>> + Send + '_;

  /// Delete rate-limit buckets older than 24h and expired blocks.
  fn purge_rate_windows(
    &self,
    now: DateTime<Utc>,
  ) -> impl Future<Output = Result<u64, Self::Error>> + Send + '_;

  /// Delete audit rows recorded before `cutoff`.
  fn purge_audit_before(
    &self,
    cutoff: DateTime<Utc>,
  ) -> impl Future<Output = Result<u64, Self::Error>> + Send + '_;

  /// Delete entries past `data_retention_expires_at`, cascading to their
  /// attempts, each with a final `delete` audit row. Returns entries
  /// removed.
  fn purge_expired_entries(
    &self,
    now: DateTime<Utc>,
  ) -> impl Future<Output = Result<u64, Self::Error>> + Send + '_;
}
