//! Circuit-breaker state and step logic, keyed by `(provider, tenant)`.
//!
//! The state lives in the store and is advanced with compare-and-swap
//! updates so multiple scheduler instances share a consistent view. This
//! module holds only the pure step functions; the registry that loads and
//! swaps rows lives in the engine crate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

// ─── Policy ──────────────────────────────────────────────────────────────────

/// Thresholds governing when a provider circuit opens and recovers.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BreakerPolicy {
  /// Consecutive failures before the circuit opens.
  #[serde(default = "default_failure_threshold")]
  pub failure_threshold: u32,
  /// How long an open circuit rejects calls before allowing a probe.
  #[serde(default = "default_open_seconds")]
  pub open_seconds:      u32,
}

fn default_failure_threshold() -> u32 { 3 }
fn default_open_seconds() -> u32 { 300 }

impl Default for BreakerPolicy {
  fn default() -> Self {
    Self {
      failure_threshold: default_failure_threshold(),
      open_seconds:      default_open_seconds(),
    }
  }
}

// ─── State ───────────────────────────────────────────────────────────────────

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BreakerState {
  Closed,
  Open,
  HalfOpen,
}

/// One circuit's counters, as stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
  pub provider:      String,
  pub tenant_id:     String,
  pub state:         BreakerState,
  pub failure_count: u32,
  pub success_count: u32,
  pub opened_at:     Option<DateTime<Utc>>,
  pub updated_at:    DateTime<Utc>,
}

impl CircuitBreakerState {
  /// The default row for a circuit that has never recorded an outcome.
  pub fn closed(provider: &str, tenant_id: &str, now: DateTime<Utc>) -> Self {
    Self {
      provider:      provider.to_string(),
      tenant_id:     tenant_id.to_string(),
      state:         BreakerState::Closed,
      failure_count: 0,
      success_count: 0,
      opened_at:     None,
      updated_at:    now,
    }
  }
}

// ─── Step functions ──────────────────────────────────────────────────────────

/// What a caller asking "may I call this provider?" should do.
#[derive(Debug, Clone, PartialEq)]
pub enum AllowStep {
  /// Call freely; no state change needed.
  Allow,
  /// Do not call; the circuit is open or a probe is already in flight.
  Reject,
  /// The cooldown elapsed: CAS the state to half-open and, if the swap wins,
  /// make exactly one probing call. A lost swap means another worker owns
  /// the probe — treat as rejected.
  Probe(CircuitBreakerState),
}

/// Evaluate whether a call is allowed under `policy` at `now`.
pub fn step_allow(
  current: &CircuitBreakerState,
  policy: &BreakerPolicy,
  now: DateTime<Utc>,
) -> AllowStep {
  match current.state {
    BreakerState::Closed => AllowStep::Allow,
    BreakerState::HalfOpen => AllowStep::Reject,
    BreakerState::Open => {
      let elapsed = current
        .opened_at
        .map(|t| now - t >= chrono::Duration::seconds(i64::from(policy.open_seconds)))
        .unwrap_or(true);
      if !elapsed {
        return AllowStep::Reject;
      }
      let mut next = current.clone();
      next.state = BreakerState::HalfOpen;
      next.updated_at = now;
      AllowStep::Probe(next)
    }
  }
}

/// Advance the state after an attempt's outcome.
pub fn step_outcome(
  current: &CircuitBreakerState,
  policy: &BreakerPolicy,
  success: bool,
  now: DateTime<Utc>,
) -> CircuitBreakerState {
  let mut next = current.clone();
  next.updated_at = now;

  if success {
    // Any success closes the circuit and clears the failure streak.
    next.state = BreakerState::Closed;
    next.failure_count = 0;
    next.success_count = current.success_count.saturating_add(1);
    next.opened_at = None;
    return next;
  }

  match current.state {
    BreakerState::Closed => {
      next.failure_count = current.failure_count.saturating_add(1);
      if next.failure_count >= policy.failure_threshold {
        next.state = BreakerState::Open;
        next.opened_at = Some(now);
      }
    }
    // A failed probe re-opens the circuit and resets the cooldown timer.
    BreakerState::HalfOpen => {
      next.state = BreakerState::Open;
      next.failure_count = current.failure_count.saturating_add(1);
      next.opened_at = Some(now);
    }
    BreakerState::Open => {
      next.failure_count = current.failure_count.saturating_add(1);
    }
  }
  next
}

#[cfg(test)]
mod tests {
  use super::*;

  fn now() -> DateTime<Utc> {
    "2026-03-02T12:00:00Z".parse().unwrap()
  }

  #[test]
  fn opens_after_threshold_consecutive_failures() {
    let policy = BreakerPolicy::default();
    let mut state = CircuitBreakerState::closed("sms", "t1", now());
    for _ in 0..2 {
      state = step_outcome(&state, &policy, false, now());
      assert_eq!(state.state, BreakerState::Closed);
    }
    state = step_outcome(&state, &policy, false, now());
    assert_eq!(state.state, BreakerState::Open);
    assert_eq!(state.opened_at, Some(now()));
  }

  #[test]
  fn success_resets_the_failure_streak() {
    let policy = BreakerPolicy::default();
    let mut state = CircuitBreakerState::closed("sms", "t1", now());
    state = step_outcome(&state, &policy, false, now());
    state = step_outcome(&state, &policy, false, now());
    state = step_outcome(&state, &policy, true, now());
    assert_eq!(state.failure_count, 0);
    // Two more failures are not enough to open again.
    state = step_outcome(&state, &policy, false, now());
    state = step_outcome(&state, &policy, false, now());
    assert_eq!(state.state, BreakerState::Closed);
  }

  #[test]
  fn open_rejects_until_cooldown_then_offers_probe() {
    let policy = BreakerPolicy::default();
    let mut state = CircuitBreakerState::closed("sms", "t1", now());
    for _ in 0..3 {
      state = step_outcome(&state, &policy, false, now());
    }

    assert_eq!(step_allow(&state, &policy, now()), AllowStep::Reject);

    let later = now() + chrono::Duration::seconds(301);
    match step_allow(&state, &policy, later) {
      AllowStep::Probe(next) => assert_eq!(next.state, BreakerState::HalfOpen),
      other => panic!("expected probe, got {other:?}"),
    }
  }

  #[test]
  fn half_open_rejects_concurrent_callers() {
    let policy = BreakerPolicy::default();
    let mut state = CircuitBreakerState::closed("sms", "t1", now());
    state.state = BreakerState::HalfOpen;
    assert_eq!(step_allow(&state, &policy, now()), AllowStep::Reject);
  }

  #[test]
  fn probe_failure_reopens_and_resets_timer() {
    let policy = BreakerPolicy::default();
    let mut state = CircuitBreakerState::closed("sms", "t1", now());
    state.state = BreakerState::HalfOpen;
    state.opened_at = Some(now() - chrono::Duration::seconds(400));

    let later = now() + chrono::Duration::seconds(10);
    let next = step_outcome(&state, &policy, false, later);
    assert_eq!(next.state, BreakerState::Open);
    assert_eq!(next.opened_at, Some(later));
  }

  #[test]
  fn probe_success_closes() {
    let policy = BreakerPolicy::default();
    let mut state = CircuitBreakerState::closed("sms", "t1", now());
    state.state = BreakerState::HalfOpen;
    state.failure_count = 5;

    let next = step_outcome(&state, &policy, true, now());
    assert_eq!(next.state, BreakerState::Closed);
    assert_eq!(next.failure_count, 0);
    assert_eq!(next.opened_at, None);
  }
}
