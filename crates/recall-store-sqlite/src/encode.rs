//! Encoding and decoding helpers between Rust domain types and the plain-text
//! representations stored in SQLite columns.
//!
//! All timestamps are stored as RFC 3339 strings, UUIDs as hyphenated
//! lowercase strings, enums as their snake_case discriminants (the same
//! strings serde puts on the wire), and booleans as 0/1 integers.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use recall_core::{
  attempt::AttemptRecord,
  audit::{AuditAction, AuditRecord},
  breaker::{BreakerState, CircuitBreakerState},
  consent::{ConsentRecord, ConsentStatus},
  deadletter::{DeadLetterChange, DeadLetterEntry, DeadLetterStatus},
  entry::{EntryChange, EntryStatus, OutreachMethod, Priority, QueueEntry},
  event::IdempotencyRecord,
};
use uuid::Uuid;

use crate::{Error, Result};

// ─── Scalars ─────────────────────────────────────────────────────────────────

pub fn encode_uuid(id: Uuid) -> String { id.hyphenated().to_string() }

pub fn decode_uuid(s: &str) -> Result<Uuid> { Ok(Uuid::parse_str(s)?) }

pub fn encode_dt(dt: DateTime<Utc>) -> String { dt.to_rfc3339() }

pub fn decode_dt(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|_| Error::Decode { field: "timestamp", value: s.to_string() })
}

pub fn decode_opt_dt(s: Option<&str>) -> Result<Option<DateTime<Utc>>> {
  s.map(decode_dt).transpose()
}

/// Decode a snake_case discriminant through its strum `FromStr` impl.
pub fn decode_enum<T: FromStr>(field: &'static str, s: &str) -> Result<T> {
  s.parse()
    .map_err(|_| Error::Decode { field, value: s.to_string() })
}

// ─── queue_entries rows ──────────────────────────────────────────────────────

/// Raw strings read from (or written to) a `queue_entries` row.
pub struct RawEntry {
  pub id:                        String,
  pub tenant_id:                 String,
  pub call_reference:            String,
  pub customer_phone:            String,
  pub status:                    String,
  pub priority:                  String,
  pub sla_deadline:              String,
  pub escalation_deadline:       String,
  pub next_attempt_at:           String,
  pub last_attempt_at:           Option<String>,
  pub attempt_count:             i64,
  pub max_attempts:              i64,
  pub ai_rescue_attempted:       bool,
  pub customer_responded:        bool,
  pub recovery_method:           Option<String>,
  pub consent_status:            String,
  pub opt_out_reason:            Option<String>,
  pub business_hours_override:   bool,
  pub data_retention_expires_at: String,
  pub created_at:                String,
  pub updated_at:                String,
  pub processed_at:              Option<String>,
  pub escalated_at:              Option<String>,
}

/// Column list matching [`RawEntry`]'s field order; shared by every entry
/// SELECT so `read_entry_row` stays in sync.
pub const ENTRY_COLUMNS: &str = "id, tenant_id, call_reference, customer_phone, status, priority, \
   sla_deadline, escalation_deadline, next_attempt_at, last_attempt_at, \
   attempt_count, max_attempts, ai_rescue_attempted, customer_responded, \
   recovery_method, consent_status, opt_out_reason, business_hours_override, \
   data_retention_expires_at, created_at, updated_at, processed_at, escalated_at";

pub fn read_entry_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawEntry> {
  Ok(RawEntry {
    id:                        row.get(0)?,
    tenant_id:                 row.get(1)?,
    call_reference:            row.get(2)?,
    customer_phone:            row.get(3)?,
    status:                    row.get(4)?,
    priority:                  row.get(5)?,
    sla_deadline:              row.get(6)?,
    escalation_deadline:       row.get(7)?,
    next_attempt_at:           row.get(8)?,
    last_attempt_at:           row.get(9)?,
    attempt_count:             row.get(10)?,
    max_attempts:              row.get(11)?,
    ai_rescue_attempted:       row.get(12)?,
    customer_responded:        row.get(13)?,
    recovery_method:           row.get(14)?,
    consent_status:            row.get(15)?,
    opt_out_reason:            row.get(16)?,
    business_hours_override:   row.get(17)?,
    data_retention_expires_at: row.get(18)?,
    created_at:                row.get(19)?,
    updated_at:                row.get(20)?,
    processed_at:              row.get(21)?,
    escalated_at:              row.get(22)?,
  })
}

impl RawEntry {
  pub fn from_entry(e: &QueueEntry) -> Self {
    Self {
      id:                        encode_uuid(e.id),
      tenant_id:                 e.tenant_id.clone(),
      call_reference:            e.call_reference.clone(),
      customer_phone:            e.customer_phone.clone(),
      status:                    e.status.to_string(),
      priority:                  e.priority.to_string(),
      sla_deadline:              encode_dt(e.sla_deadline),
      escalation_deadline:       encode_dt(e.escalation_deadline),
      next_attempt_at:           encode_dt(e.next_attempt_at),
      last_attempt_at:           e.last_attempt_at.map(encode_dt),
      attempt_count:             i64::from(e.attempt_count),
      max_attempts:              i64::from(e.max_attempts),
      ai_rescue_attempted:       e.ai_rescue_attempted,
      customer_responded:        e.customer_responded,
      recovery_method:           e.recovery_method.map(|m| m.to_string()),
      consent_status:            e.consent_status.to_string(),
      opt_out_reason:            e.opt_out_reason.clone(),
      business_hours_override:   e.business_hours_override,
      data_retention_expires_at: encode_dt(e.data_retention_expires_at),
      created_at:                encode_dt(e.created_at),
      updated_at:                encode_dt(e.updated_at),
      processed_at:              e.processed_at.map(encode_dt),
      escalated_at:              e.escalated_at.map(encode_dt),
    }
  }

  pub fn into_entry(self) -> Result<QueueEntry> {
    Ok(QueueEntry {
      id:                        decode_uuid(&self.id)?,
      tenant_id:                 self.tenant_id,
      call_reference:            self.call_reference,
      customer_phone:            self.customer_phone,
      status:                    decode_enum::<EntryStatus>("status", &self.status)?,
      priority:                  decode_enum::<Priority>("priority", &self.priority)?,
      sla_deadline:              decode_dt(&self.sla_deadline)?,
      escalation_deadline:       decode_dt(&self.escalation_deadline)?,
      next_attempt_at:           decode_dt(&self.next_attempt_at)?,
      last_attempt_at:           decode_opt_dt(self.last_attempt_at.as_deref())?,
      attempt_count:             self.attempt_count as u32,
      max_attempts:              self.max_attempts as u32,
      ai_rescue_attempted:       self.ai_rescue_attempted,
      customer_responded:        self.customer_responded,
      recovery_method:           self
        .recovery_method
        .as_deref()
        .map(|m| decode_enum::<OutreachMethod>("recovery_method", m))
        .transpose()?,
      consent_status:            decode_enum::<ConsentStatus>(
        "consent_status",
        &self.consent_status,
      )?,
      opt_out_reason:            self.opt_out_reason,
      business_hours_override:   self.business_hours_override,
      data_retention_expires_at: decode_dt(&self.data_retention_expires_at)?,
      created_at:                decode_dt(&self.created_at)?,
      updated_at:                decode_dt(&self.updated_at)?,
      processed_at:              decode_opt_dt(self.processed_at.as_deref())?,
      escalated_at:              decode_opt_dt(self.escalated_at.as_deref())?,
    })
  }

  /// Column-level JSON snapshot for the audit trail. Infallible so it can
  /// run inside a write transaction.
  pub fn snapshot(&self) -> serde_json::Value {
    serde_json::json!({
      "id": self.id,
      "tenant_id": self.tenant_id,
      "call_reference": self.call_reference,
      "customer_phone": self.customer_phone,
      "status": self.status,
      "priority": self.priority,
      "sla_deadline": self.sla_deadline,
      "escalation_deadline": self.escalation_deadline,
      "next_attempt_at": self.next_attempt_at,
      "last_attempt_at": self.last_attempt_at,
      "attempt_count": self.attempt_count,
      "max_attempts": self.max_attempts,
      "ai_rescue_attempted": self.ai_rescue_attempted,
      "customer_responded": self.customer_responded,
      "recovery_method": self.recovery_method,
      "consent_status": self.consent_status,
      "opt_out_reason": self.opt_out_reason,
      "business_hours_override": self.business_hours_override,
      "data_retention_expires_at": self.data_retention_expires_at,
      "created_at": self.created_at,
      "updated_at": self.updated_at,
      "processed_at": self.processed_at,
      "escalated_at": self.escalated_at,
    })
  }

  /// Apply a transition's field updates, producing the row to write.
  pub fn apply_change(&self, change: &EntryChange, now: DateTime<Utc>) -> Self {
    Self {
      id:                        self.id.clone(),
      tenant_id:                 self.tenant_id.clone(),
      call_reference:            self.call_reference.clone(),
      customer_phone:            self.customer_phone.clone(),
      status:                    change.status.to_string(),
      priority:                  self.priority.clone(),
      sla_deadline:              self.sla_deadline.clone(),
      escalation_deadline:       self.escalation_deadline.clone(),
      next_attempt_at:           change
        .next_attempt_at
        .map(encode_dt)
        .unwrap_or_else(|| self.next_attempt_at.clone()),
      last_attempt_at:           change
        .last_attempt_at
        .map(encode_dt)
        .or_else(|| self.last_attempt_at.clone()),
      attempt_count:             change
        .attempt_count
        .map(i64::from)
        .unwrap_or(self.attempt_count),
      max_attempts:              self.max_attempts,
      ai_rescue_attempted:       change
        .ai_rescue_attempted
        .unwrap_or(self.ai_rescue_attempted),
      customer_responded:        change
        .customer_responded
        .unwrap_or(self.customer_responded),
      recovery_method:           change
        .recovery_method
        .map(|m| m.to_string())
        .or_else(|| self.recovery_method.clone()),
      consent_status:            change
        .consent_status
        .map(|c| c.to_string())
        .unwrap_or_else(|| self.consent_status.clone()),
      opt_out_reason:            change
        .opt_out_reason
        .clone()
        .or_else(|| self.opt_out_reason.clone()),
      business_hours_override:   self.business_hours_override,
      data_retention_expires_at: self.data_retention_expires_at.clone(),
      created_at:                self.created_at.clone(),
      updated_at:                encode_dt(now),
      processed_at:              change
        .processed_at
        .map(encode_dt)
        .or_else(|| self.processed_at.clone()),
      escalated_at:              change
        .escalated_at
        .map(encode_dt)
        .or_else(|| self.escalated_at.clone()),
    }
  }
}

// ─── attempts rows ───────────────────────────────────────────────────────────

pub struct RawAttempt {
  pub id:                   String,
  pub entry_id:             String,
  pub attempt_number:       i64,
  pub method:               String,
  pub message_sent:         Option<String>,
  pub response_received:    Option<String>,
  pub ai_confidence_score:  Option<f64>,
  pub success:              bool,
  pub customer_engaged:     bool,
  pub escalation_triggered: bool,
  pub failure_reason:       Option<String>,
  pub attempted_at:         String,
  pub responded_at:         Option<String>,
}

pub fn read_attempt_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawAttempt> {
  Ok(RawAttempt {
    id:                   row.get(0)?,
    entry_id:             row.get(1)?,
    attempt_number:       row.get(2)?,
    method:               row.get(3)?,
    message_sent:         row.get(4)?,
    response_received:    row.get(5)?,
    ai_confidence_score:  row.get(6)?,
    success:              row.get(7)?,
    customer_engaged:     row.get(8)?,
    escalation_triggered: row.get(9)?,
    failure_reason:       row.get(10)?,
    attempted_at:         row.get(11)?,
    responded_at:         row.get(12)?,
  })
}

impl RawAttempt {
  pub fn into_attempt(self) -> Result<AttemptRecord> {
    Ok(AttemptRecord {
      id:                   decode_uuid(&self.id)?,
      entry_id:             decode_uuid(&self.entry_id)?,
      attempt_number:       self.attempt_number as u32,
      method:               decode_enum::<OutreachMethod>("method", &self.method)?,
      message_sent:         self.message_sent,
      response_received:    self.response_received,
      ai_confidence_score:  self.ai_confidence_score,
      success:              self.success,
      customer_engaged:     self.customer_engaged,
      escalation_triggered: self.escalation_triggered,
      failure_reason:       self.failure_reason,
      attempted_at:         decode_dt(&self.attempted_at)?,
      responded_at:         decode_opt_dt(self.responded_at.as_deref())?,
    })
  }
}

// ─── dead_letters rows ───────────────────────────────────────────────────────

pub struct RawDeadLetter {
  pub id:             String,
  pub tenant_id:      String,
  pub entry_id:       String,
  pub method:         String,
  pub customer_phone: String,
  pub payload:        String,
  pub failure_reason: String,
  pub retry_count:    i64,
  pub max_retries:    i64,
  pub next_retry_at:  String,
  pub status:         String,
  pub created_at:     String,
  pub updated_at:     String,
}

pub fn read_dead_letter_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawDeadLetter> {
  Ok(RawDeadLetter {
    id:             row.get(0)?,
    tenant_id:      row.get(1)?,
    entry_id:       row.get(2)?,
    method:         row.get(3)?,
    customer_phone: row.get(4)?,
    payload:        row.get(5)?,
    failure_reason: row.get(6)?,
    retry_count:    row.get(7)?,
    max_retries:    row.get(8)?,
    next_retry_at:  row.get(9)?,
    status:         row.get(10)?,
    created_at:     row.get(11)?,
    updated_at:     row.get(12)?,
  })
}

impl RawDeadLetter {
  pub fn into_dead_letter(self) -> Result<DeadLetterEntry> {
    Ok(DeadLetterEntry {
      id:             decode_uuid(&self.id)?,
      tenant_id:      self.tenant_id,
      entry_id:       decode_uuid(&self.entry_id)?,
      method:         decode_enum::<OutreachMethod>("method", &self.method)?,
      customer_phone: self.customer_phone,
      payload:        self.payload,
      failure_reason: self.failure_reason,
      retry_count:    self.retry_count as u32,
      max_retries:    self.max_retries as u32,
      next_retry_at:  decode_dt(&self.next_retry_at)?,
      status:         decode_enum::<DeadLetterStatus>("status", &self.status)?,
      created_at:     decode_dt(&self.created_at)?,
      updated_at:     decode_dt(&self.updated_at)?,
    })
  }

  pub fn apply_change(&self, change: &DeadLetterChange, now: DateTime<Utc>) -> Self {
    Self {
      id:             self.id.clone(),
      tenant_id:      self.tenant_id.clone(),
      entry_id:       self.entry_id.clone(),
      method:         self.method.clone(),
      customer_phone: self.customer_phone.clone(),
      payload:        self.payload.clone(),
      failure_reason: change
        .failure_reason
        .clone()
        .unwrap_or_else(|| self.failure_reason.clone()),
      retry_count:    change.retry_count.map(i64::from).unwrap_or(self.retry_count),
      max_retries:    self.max_retries,
      next_retry_at:  change
        .next_retry_at
        .map(encode_dt)
        .unwrap_or_else(|| self.next_retry_at.clone()),
      status:         change.status.to_string(),
      created_at:     self.created_at.clone(),
      updated_at:     encode_dt(now),
    }
  }
}

// ─── idempotency_keys rows ───────────────────────────────────────────────────

pub struct RawIdempotency {
  pub provider:          String,
  pub external_event_id: String,
  pub entry_id:          Option<String>,
  pub first_seen_at:     String,
  pub last_seen_at:      String,
  pub attempts:          i64,
  pub expires_at:        String,
}

impl RawIdempotency {
  pub fn into_record(self) -> Result<IdempotencyRecord> {
    Ok(IdempotencyRecord {
      provider:          self.provider,
      external_event_id: self.external_event_id,
      entry_id:          self.entry_id.as_deref().map(decode_uuid).transpose()?,
      first_seen_at:     decode_dt(&self.first_seen_at)?,
      last_seen_at:      decode_dt(&self.last_seen_at)?,
      attempts:          self.attempts as u32,
      expires_at:        decode_dt(&self.expires_at)?,
    })
  }
}

// ─── consent_records rows ────────────────────────────────────────────────────

pub struct RawConsent {
  pub tenant_id:      String,
  pub customer_phone: String,
  pub status:         String,
  pub opt_out_reason: Option<String>,
  pub updated_at:     String,
}

impl RawConsent {
  pub fn into_consent(self) -> Result<ConsentRecord> {
    Ok(ConsentRecord {
      tenant_id:      self.tenant_id,
      customer_phone: self.customer_phone,
      status:         decode_enum::<ConsentStatus>("status", &self.status)?,
      opt_out_reason: self.opt_out_reason,
      updated_at:     decode_dt(&self.updated_at)?,
    })
  }
}

// ─── circuit_breakers rows ───────────────────────────────────────────────────

pub struct RawBreaker {
  pub provider:      String,
  pub tenant_id:     String,
  pub state:         String,
  pub failure_count: i64,
  pub success_count: i64,
  pub opened_at:     Option<String>,
  pub updated_at:    String,
}

impl RawBreaker {
  pub fn into_breaker(self) -> Result<CircuitBreakerState> {
    Ok(CircuitBreakerState {
      provider:      self.provider,
      tenant_id:     self.tenant_id,
      state:         decode_enum::<BreakerState>("state", &self.state)?,
      failure_count: self.failure_count as u32,
      success_count: self.success_count as u32,
      opened_at:     decode_opt_dt(self.opened_at.as_deref())?,
      updated_at:    decode_dt(&self.updated_at)?,
    })
  }
}

// ─── audit_log rows ──────────────────────────────────────────────────────────

pub struct RawAudit {
  pub id:         String,
  pub tenant_id:  String,
  pub entry_id:   String,
  pub action:     String,
  pub old_values: Option<String>,
  pub new_values: Option<String>,
  pub changed_by: String,
  pub changed_at: String,
}

impl RawAudit {
  pub fn into_audit(self) -> Result<AuditRecord> {
    Ok(AuditRecord {
      id:         decode_uuid(&self.id)?,
      tenant_id:  self.tenant_id,
      entry_id:   decode_uuid(&self.entry_id)?,
      action:     decode_enum::<AuditAction>("action", &self.action)?,
      old_values: self
        .old_values
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?,
      new_values: self
        .new_values
        .as_deref()
        .map(serde_json::from_str)
        .transpose()?,
      changed_by: self.changed_by,
      changed_at: decode_dt(&self.changed_at)?,
    })
  }
}
