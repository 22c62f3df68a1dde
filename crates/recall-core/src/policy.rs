//! Per-tenant recovery policy: SLA offsets, retry budget, backoff,
//! business-hours calendar, AI thresholds, and channel plan.
//!
//! Attempt *scheduling* honors the business-hours calendar; *deadlines* are
//! wall-clock and are never shifted.

use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::{Error, Result, entry::OutreachMethod};

// ─── Rate limiting ───────────────────────────────────────────────────────────

/// Sliding-window thresholds for the ingestion path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RateLimitPolicy {
  /// Width of the sliding window.
  #[serde(default = "default_window_seconds")]
  pub window_seconds: u32,
  /// Above this many events per window the caller is told to back off.
  #[serde(default = "default_soft_limit")]
  pub soft_limit:     u32,
  /// Above this many events per window the client is blocked outright.
  #[serde(default = "default_hard_limit")]
  pub hard_limit:     u32,
  /// How long a hard-limit block lasts.
  #[serde(default = "default_block_minutes")]
  pub block_minutes:  u32,
}

fn default_window_seconds() -> u32 { 60 }
fn default_soft_limit() -> u32 { 60 }
fn default_hard_limit() -> u32 { 120 }
fn default_block_minutes() -> u32 { 15 }

impl Default for RateLimitPolicy {
  fn default() -> Self {
    Self {
      window_seconds: default_window_seconds(),
      soft_limit:     default_soft_limit(),
      hard_limit:     default_hard_limit(),
      block_minutes:  default_block_minutes(),
    }
  }
}

// ─── Tenant policy ───────────────────────────────────────────────────────────

/// Everything a tenant can configure about how their cases are driven.
///
/// Every field has a serde default so a PUT body may be partial.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantPolicy {
  /// Hours from ingestion to `sla_deadline`.
  #[serde(default = "default_response_time_hours")]
  pub response_time_hours:          u32,
  /// Hours from ingestion to `escalation_deadline`.
  #[serde(default = "default_escalation_time_hours")]
  pub escalation_time_hours:        u32,
  /// Customer-facing retry budget. Accepts the legacy `max_retries` name.
  #[serde(default = "default_max_attempts", alias = "max_retries")]
  pub max_attempts:                 u32,
  /// Base retry interval; attempt n waits `base * 2^n`, capped.
  #[serde(default = "default_base_retry_minutes")]
  pub base_retry_minutes:           u32,
  #[serde(default = "default_backoff_cap_minutes")]
  pub backoff_cap_minutes:          u32,
  #[serde(default = "default_business_hours_start")]
  pub business_hours_start:         NaiveTime,
  #[serde(default = "default_business_hours_end")]
  pub business_hours_end:           NaiveTime,
  /// ISO weekday numbers, 1 = Monday .. 7 = Sunday.
  #[serde(default = "default_business_days")]
  pub business_days:                Vec<u8>,
  #[serde(default = "default_ai_confidence_threshold")]
  pub ai_confidence_threshold:      f64,
  /// On a low-confidence AI result: `true` escalates immediately, `false`
  /// parks the entry in `ai_rescue_pending`.
  #[serde(default)]
  pub escalation_on_ai_failure:     bool,
  /// Attempts at or beyond this count are AI-composed; earlier ones use the
  /// static template.
  #[serde(default = "default_ai_compose_after_attempts")]
  pub ai_compose_after_attempts:    u32,
  /// How long an `ai_rescue_pending` entry waits for a customer reply.
  #[serde(default = "default_ai_rescue_window_minutes")]
  pub ai_rescue_window_minutes:     u32,
  /// How long a `pending` consent may stay unresolved before it is treated
  /// as denied.
  #[serde(default = "default_pending_consent_grace_hours")]
  pub pending_consent_grace_hours:  u32,
  /// Whether an expired rescue window consumes one unit of retry budget.
  #[serde(default)]
  pub rescue_expiry_counts_attempt: bool,
  /// Channels tried round-robin by attempt number.
  #[serde(default = "default_channel_plan")]
  pub channel_plan:                 Vec<OutreachMethod>,
  #[serde(default = "default_dead_letter_max_retries")]
  pub dead_letter_max_retries:      u32,
  #[serde(default = "default_dead_letter_base_minutes")]
  pub dead_letter_base_minutes:     u32,
  #[serde(default = "default_data_retention_days")]
  pub data_retention_days:          u32,
}

fn default_response_time_hours() -> u32 { 2 }
fn default_escalation_time_hours() -> u32 { 48 }
fn default_max_attempts() -> u32 { 3 }
fn default_base_retry_minutes() -> u32 { 15 }
fn default_backoff_cap_minutes() -> u32 { 240 }
fn default_business_hours_start() -> NaiveTime {
  NaiveTime::from_hms_opt(9, 0, 0).unwrap()
}
fn default_business_hours_end() -> NaiveTime {
  NaiveTime::from_hms_opt(17, 0, 0).unwrap()
}
fn default_business_days() -> Vec<u8> { vec![1, 2, 3, 4, 5] }
fn default_ai_confidence_threshold() -> f64 { 0.7 }
fn default_ai_compose_after_attempts() -> u32 { 1 }
fn default_ai_rescue_window_minutes() -> u32 { 30 }
fn default_pending_consent_grace_hours() -> u32 { 24 }
fn default_channel_plan() -> Vec<OutreachMethod> {
  vec![OutreachMethod::Sms, OutreachMethod::Call, OutreachMethod::Email]
}
fn default_dead_letter_max_retries() -> u32 { 3 }
fn default_dead_letter_base_minutes() -> u32 { 5 }
fn default_data_retention_days() -> u32 { 365 }

impl Default for TenantPolicy {
  fn default() -> Self {
    Self {
      response_time_hours:          default_response_time_hours(),
      escalation_time_hours:        default_escalation_time_hours(),
      max_attempts:                 default_max_attempts(),
      base_retry_minutes:           default_base_retry_minutes(),
      backoff_cap_minutes:          default_backoff_cap_minutes(),
      business_hours_start:         default_business_hours_start(),
      business_hours_end:           default_business_hours_end(),
      business_days:                default_business_days(),
      ai_confidence_threshold:      default_ai_confidence_threshold(),
      escalation_on_ai_failure:     false,
      ai_compose_after_attempts:    default_ai_compose_after_attempts(),
      ai_rescue_window_minutes:     default_ai_rescue_window_minutes(),
      pending_consent_grace_hours:  default_pending_consent_grace_hours(),
      rescue_expiry_counts_attempt: false,
      channel_plan:                 default_channel_plan(),
      dead_letter_max_retries:      default_dead_letter_max_retries(),
      dead_letter_base_minutes:     default_dead_letter_base_minutes(),
      data_retention_days:          default_data_retention_days(),
    }
  }
}

impl TenantPolicy {
  /// Reject configurations that would wedge the scheduler.
  pub fn validate(&self) -> Result<()> {
    if self.max_attempts == 0 {
      return Err(Error::InvalidPolicy("max_attempts must be at least 1".into()));
    }
    if !(0.0..=1.0).contains(&self.ai_confidence_threshold) {
      return Err(Error::InvalidPolicy(
        "ai_confidence_threshold must be within [0, 1]".into(),
      ));
    }
    if self.business_days.iter().any(|d| !(1..=7).contains(d)) {
      return Err(Error::InvalidPolicy(
        "business_days must be ISO weekday numbers 1..=7".into(),
      ));
    }
    if self.business_days.is_empty() {
      return Err(Error::InvalidPolicy("business_days must not be empty".into()));
    }
    if self.channel_plan.is_empty() {
      return Err(Error::InvalidPolicy("channel_plan must not be empty".into()));
    }
    if self.business_hours_start >= self.business_hours_end {
      return Err(Error::InvalidPolicy(
        "business_hours_start must be before business_hours_end".into(),
      ));
    }
    Ok(())
  }

  /// The channel for the next attempt, rotating through the plan.
  pub fn method_for_attempt(&self, attempt_count: u32) -> OutreachMethod {
    if self.channel_plan.is_empty() {
      return OutreachMethod::Sms;
    }
    self.channel_plan[attempt_count as usize % self.channel_plan.len()]
  }

  /// Exponential backoff for the given attempt count, capped.
  pub fn backoff_interval(&self, attempt_count: u32) -> Duration {
    let base = u64::from(self.base_retry_minutes.max(1));
    let factor = 2u64.saturating_pow(attempt_count.min(16));
    let minutes = base
      .saturating_mul(factor)
      .min(u64::from(self.backoff_cap_minutes.max(1)));
    Duration::minutes(minutes as i64)
  }

  fn is_business_day(&self, day: Weekday) -> bool {
    let iso = day.number_from_monday() as u8;
    self.business_days.contains(&iso)
  }

  /// Whether `at` falls inside the tenant's open window.
  pub fn is_open(&self, at: DateTime<Utc>) -> bool {
    self.is_business_day(at.weekday())
      && at.time() >= self.business_hours_start
      && at.time() < self.business_hours_end
  }

  /// The earliest instant at or after `from` inside business hours.
  ///
  /// Falls back to `from` unchanged if no business day exists in the next
  /// two weeks (a misconfiguration `validate` rejects).
  pub fn next_open(&self, from: DateTime<Utc>) -> DateTime<Utc> {
    if self.is_open(from) {
      return from;
    }
    for offset in 0..=14 {
      let date = (from + Duration::days(offset)).date_naive();
      if !self.is_business_day(date.weekday()) {
        continue;
      }
      let start = date.and_time(self.business_hours_start).and_utc();
      if start >= from {
        return start;
      }
    }
    from
  }

  /// When the next attempt after a failed one should run: backoff from
  /// `from`, shifted into business hours unless the entry overrides them.
  pub fn schedule_retry(
    &self,
    from: DateTime<Utc>,
    attempt_count: u32,
    business_hours_override: bool,
  ) -> DateTime<Utc> {
    let at = from + self.backoff_interval(attempt_count);
    if business_hours_override { at } else { self.next_open(at) }
  }

  /// A short deferral that does not consume retry budget (circuit open,
  /// consent still pending).
  pub fn schedule_deferral(
    &self,
    from: DateTime<Utc>,
    business_hours_override: bool,
  ) -> DateTime<Utc> {
    let at = from + Duration::minutes(i64::from(self.base_retry_minutes.max(1)));
    if business_hours_override { at } else { self.next_open(at) }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn policy() -> TenantPolicy {
    TenantPolicy::default()
  }

  #[test]
  fn defaults_match_reference_values() {
    let p = policy();
    assert_eq!(p.response_time_hours, 2);
    assert_eq!(p.escalation_time_hours, 48);
    assert_eq!(p.max_attempts, 3);
    assert!((p.ai_confidence_threshold - 0.7).abs() < f64::EPSILON);
    assert!(p.validate().is_ok());
  }

  #[test]
  fn partial_policy_body_fills_in_defaults() {
    let p: TenantPolicy = serde_json::from_str(r#"{"max_attempts": 5}"#).unwrap();
    assert_eq!(p.max_attempts, 5);
    assert_eq!(p.response_time_hours, 2);
  }

  #[test]
  fn backoff_doubles_and_caps() {
    let p = policy();
    assert_eq!(p.backoff_interval(0), Duration::minutes(15));
    assert_eq!(p.backoff_interval(1), Duration::minutes(30));
    assert_eq!(p.backoff_interval(2), Duration::minutes(60));
    assert_eq!(p.backoff_interval(10), Duration::minutes(240));
  }

  #[test]
  fn channel_plan_rotates() {
    let p = policy();
    assert_eq!(p.method_for_attempt(0), OutreachMethod::Sms);
    assert_eq!(p.method_for_attempt(1), OutreachMethod::Call);
    assert_eq!(p.method_for_attempt(2), OutreachMethod::Email);
    assert_eq!(p.method_for_attempt(3), OutreachMethod::Sms);
  }

  // 2026-03-06 is a Friday.
  fn friday_at(h: u32, m: u32) -> DateTime<Utc> {
    format!("2026-03-06T{h:02}:{m:02}:00Z").parse().unwrap()
  }

  #[test]
  fn inside_business_hours_is_unchanged() {
    let p = policy();
    let at = friday_at(10, 30);
    assert_eq!(p.next_open(at), at);
  }

  #[test]
  fn before_opening_snaps_to_same_day_start() {
    let p = policy();
    assert_eq!(p.next_open(friday_at(6, 0)), friday_at(9, 0));
  }

  #[test]
  fn after_close_on_friday_rolls_to_monday() {
    let p = policy();
    let monday_open: DateTime<Utc> = "2026-03-09T09:00:00Z".parse().unwrap();
    assert_eq!(p.next_open(friday_at(18, 0)), monday_open);
  }

  #[test]
  fn override_skips_calendar_shift() {
    let p = policy();
    let from = friday_at(16, 55);
    let at = p.schedule_retry(from, 0, true);
    assert_eq!(at, from + Duration::minutes(15));

    // Without the override the same retry lands on Monday morning.
    let shifted = p.schedule_retry(from, 0, false);
    assert_eq!(shifted, "2026-03-09T09:00:00Z".parse::<DateTime<Utc>>().unwrap());
  }

  #[test]
  fn validate_rejects_bad_days_and_thresholds() {
    let mut p = policy();
    p.business_days = vec![0];
    assert!(p.validate().is_err());

    let mut p = policy();
    p.ai_confidence_threshold = 1.5;
    assert!(p.validate().is_err());

    let mut p = policy();
    p.channel_plan.clear();
    assert!(p.validate().is_err());
  }
}
