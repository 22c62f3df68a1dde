//! [`SqliteStore`] — the SQLite implementation of [`RecoveryStore`].

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension as _;
use uuid::Uuid;

use recall_core::{
  attempt::{AttemptRecord, NewAttempt},
  audit::AuditRecord,
  breaker::CircuitBreakerState,
  consent::{ConsentRecord, ConsentStatus},
  deadletter::{DeadLetterChange, DeadLetterEntry, DeadLetterStatus, NewDeadLetter},
  entry::{EntryChange, EntryQuery, EntryStatus, NewQueueEntry, QueueEntry},
  event::{Admission, IdempotencyRecord},
  lifecycle,
  policy::{RateLimitPolicy, TenantPolicy},
  store::{RateDecision, RecoveryStore},
};

use crate::{
  Error, Result,
  encode::{
    ENTRY_COLUMNS, RawAttempt, RawAudit, RawBreaker, RawConsent, RawDeadLetter, RawEntry,
    RawIdempotency, decode_dt, encode_dt, encode_uuid, read_attempt_row, read_dead_letter_row,
    read_entry_row,
  },
  schema::SCHEMA,
};

/// Resolution of the sliding-window rate buckets.
const RATE_BUCKET_SECONDS: i64 = 10;

// ─── Store ───────────────────────────────────────────────────────────────────

/// A Recall queue store backed by a single SQLite file.
///
/// Cloning is cheap — the inner connection is reference-counted.
#[derive(Clone)]
pub struct SqliteStore {
  conn: tokio_rusqlite::Connection,
}

impl SqliteStore {
  /// Open (or create) a store at `path` and run schema initialisation.
  pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open(path).await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  /// Open an in-memory store — useful for testing.
  pub async fn open_in_memory() -> Result<Self> {
    let conn = tokio_rusqlite::Connection::open_in_memory().await?;
    let store = Self { conn };
    store.init_schema().await?;
    Ok(store)
  }

  async fn init_schema(&self) -> Result<()> {
    self
      .conn
      .call(|conn| {
        conn.execute_batch(SCHEMA)?;
        Ok(())
      })
      .await?;
    Ok(())
  }
}

// ─── Row helpers (run inside the connection thread) ──────────────────────────

fn insert_entry_row(
  conn: &rusqlite::Connection,
  raw: &RawEntry,
  priority_rank: u8,
) -> rusqlite::Result<()> {
  conn.execute(
    "INSERT INTO queue_entries (
       id, tenant_id, call_reference, customer_phone, status, priority,
       priority_rank, sla_deadline, escalation_deadline, next_attempt_at,
       last_attempt_at, attempt_count, max_attempts, ai_rescue_attempted,
       customer_responded, recovery_method, consent_status, opt_out_reason,
       business_hours_override, data_retention_expires_at, created_at,
       updated_at, processed_at, escalated_at
     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
               ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24)",
    rusqlite::params![
      raw.id,
      raw.tenant_id,
      raw.call_reference,
      raw.customer_phone,
      raw.status,
      raw.priority,
      priority_rank,
      raw.sla_deadline,
      raw.escalation_deadline,
      raw.next_attempt_at,
      raw.last_attempt_at,
      raw.attempt_count,
      raw.max_attempts,
      raw.ai_rescue_attempted,
      raw.customer_responded,
      raw.recovery_method,
      raw.consent_status,
      raw.opt_out_reason,
      raw.business_hours_override,
      raw.data_retention_expires_at,
      raw.created_at,
      raw.updated_at,
      raw.processed_at,
      raw.escalated_at,
    ],
  )?;
  Ok(())
}

/// Conditional update: commits only when `status` still equals
/// `expected_status`. Returns affected row count (0 = lost race).
fn update_entry_row(
  conn: &rusqlite::Connection,
  raw: &RawEntry,
  expected_status: &str,
) -> rusqlite::Result<usize> {
  conn.execute(
    "UPDATE queue_entries SET
       status = ?3, next_attempt_at = ?4, last_attempt_at = ?5,
       attempt_count = ?6, ai_rescue_attempted = ?7, customer_responded = ?8,
       recovery_method = ?9, consent_status = ?10, opt_out_reason = ?11,
       processed_at = ?12, escalated_at = ?13, updated_at = ?14
     WHERE id = ?1 AND status = ?2",
    rusqlite::params![
      raw.id,
      expected_status,
      raw.status,
      raw.next_attempt_at,
      raw.last_attempt_at,
      raw.attempt_count,
      raw.ai_rescue_attempted,
      raw.customer_responded,
      raw.recovery_method,
      raw.consent_status,
      raw.opt_out_reason,
      raw.processed_at,
      raw.escalated_at,
      raw.updated_at,
    ],
  )
}

#[allow(clippy::too_many_arguments)]
fn insert_audit_row(
  conn: &rusqlite::Connection,
  tenant_id: &str,
  entry_id: &str,
  action: &str,
  old_values: Option<serde_json::Value>,
  new_values: Option<serde_json::Value>,
  changed_by: &str,
  changed_at: &str,
) -> rusqlite::Result<()> {
  conn.execute(
    "INSERT INTO audit_log (id, tenant_id, entry_id, action, old_values,
                            new_values, changed_by, changed_at)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    rusqlite::params![
      encode_uuid(Uuid::new_v4()),
      tenant_id,
      entry_id,
      action,
      old_values.map(|v| v.to_string()),
      new_values.map(|v| v.to_string()),
      changed_by,
      changed_at,
    ],
  )?;
  Ok(())
}

fn select_entry_raw(
  conn: &rusqlite::Connection,
  id: &str,
) -> rusqlite::Result<Option<RawEntry>> {
  conn
    .query_row(
      &format!("SELECT {ENTRY_COLUMNS} FROM queue_entries WHERE id = ?1"),
      rusqlite::params![id],
      read_entry_row,
    )
    .optional()
}

/// Outcome of a conditional-update transaction, carried out of the closure.
enum TxOutcome<T> {
  NotFound,
  Stale,
  Applied(T),
}

// ─── RecoveryStore impl ──────────────────────────────────────────────────────

impl RecoveryStore for SqliteStore {
  type Error = Error;

  // ── Idempotency ledger ────────────────────────────────────────────────

  async fn admit_event(
    &self,
    provider: &str,
    external_event_id: &str,
    ttl_days: u32,
    now: DateTime<Utc>,
  ) -> Result<Admission> {
    let provider = provider.to_owned();
    let event_id = external_event_id.to_owned();
    let now_str = encode_dt(now);
    let expires_str = encode_dt(now + chrono::Duration::days(i64::from(ttl_days)));

    let duplicate: Option<Option<String>> = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;

        let existing: Option<(String, Option<String>)> = tx
          .query_row(
            "SELECT expires_at, entry_id FROM idempotency_keys
             WHERE provider = ?1 AND external_event_id = ?2",
            rusqlite::params![provider, event_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
          )
          .optional()?;

        let outcome = match existing {
          // Live key: duplicate delivery. Only the observation counters move.
          Some((expires_at, entry_id)) if expires_at > now_str => {
            tx.execute(
              "UPDATE idempotency_keys
               SET attempts = attempts + 1, last_seen_at = ?3
               WHERE provider = ?1 AND external_event_id = ?2",
              rusqlite::params![provider, event_id, now_str],
            )?;
            Some(entry_id)
          }
          // Absent or past TTL: admit afresh.
          _ => {
            tx.execute(
              "INSERT OR REPLACE INTO idempotency_keys
                 (provider, external_event_id, entry_id, first_seen_at,
                  last_seen_at, attempts, expires_at)
               VALUES (?1, ?2, NULL, ?3, ?3, 1, ?4)",
              rusqlite::params![provider, event_id, now_str, expires_str],
            )?;
            None
          }
        };

        tx.commit()?;
        Ok(outcome)
      })
      .await?;

    match duplicate {
      None => Ok(Admission::Accepted),
      Some(entry_id) => {
        let entry_id = entry_id
          .as_deref()
          .map(Uuid::parse_str)
          .transpose()
          .map_err(Error::Uuid)?;
        Ok(Admission::Duplicate { entry_id })
      }
    }
  }

  async fn commit_event(
    &self,
    provider: &str,
    external_event_id: &str,
    entry_id: Uuid,
  ) -> Result<()> {
    let provider = provider.to_owned();
    let event_id = external_event_id.to_owned();
    let entry_str = encode_uuid(entry_id);
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "UPDATE idempotency_keys SET entry_id = ?3
           WHERE provider = ?1 AND external_event_id = ?2",
          rusqlite::params![provider, event_id, entry_str],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn release_event(&self, provider: &str, external_event_id: &str) -> Result<()> {
    let provider = provider.to_owned();
    let event_id = external_event_id.to_owned();
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "DELETE FROM idempotency_keys
           WHERE provider = ?1 AND external_event_id = ?2",
          rusqlite::params![provider, event_id],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  async fn get_event(
    &self,
    provider: &str,
    external_event_id: &str,
  ) -> Result<Option<IdempotencyRecord>> {
    let provider = provider.to_owned();
    let event_id = external_event_id.to_owned();
    let raw: Option<RawIdempotency> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT provider, external_event_id, entry_id, first_seen_at,
                      last_seen_at, attempts, expires_at
               FROM idempotency_keys
               WHERE provider = ?1 AND external_event_id = ?2",
              rusqlite::params![provider, event_id],
              |row| {
                Ok(RawIdempotency {
                  provider:          row.get(0)?,
                  external_event_id: row.get(1)?,
                  entry_id:          row.get(2)?,
                  first_seen_at:     row.get(3)?,
                  last_seen_at:      row.get(4)?,
                  attempts:          row.get(5)?,
                  expires_at:        row.get(6)?,
                })
              },
            )
            .optional()?,
        )
      })
      .await?;
    raw.map(RawIdempotency::into_record).transpose()
  }

  // ── Queue entries ─────────────────────────────────────────────────────

  async fn create_entry(&self, input: NewQueueEntry, changed_by: &str) -> Result<QueueEntry> {
    let now = Utc::now();
    let entry = QueueEntry {
      id:                        Uuid::new_v4(),
      tenant_id:                 input.tenant_id,
      call_reference:            input.call_reference,
      customer_phone:            input.customer_phone,
      status:                    EntryStatus::Queued,
      priority:                  input.priority,
      sla_deadline:              input.sla_deadline,
      escalation_deadline:       input.escalation_deadline,
      next_attempt_at:           input.next_attempt_at,
      last_attempt_at:           None,
      attempt_count:             0,
      max_attempts:              input.max_attempts,
      ai_rescue_attempted:       false,
      customer_responded:        false,
      recovery_method:           None,
      consent_status:            input.consent_status,
      opt_out_reason:            None,
      business_hours_override:   input.business_hours_override,
      data_retention_expires_at: input.data_retention_expires_at,
      created_at:                now,
      updated_at:                now,
      processed_at:              None,
      escalated_at:              None,
    };

    let raw = RawEntry::from_entry(&entry);
    let rank = entry.priority.rank();
    let changed_by = changed_by.to_owned();
    let now_str = encode_dt(now);

    self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        insert_entry_row(&tx, &raw, rank)?;
        insert_audit_row(
          &tx,
          &raw.tenant_id,
          &raw.id,
          "insert",
          None,
          Some(raw.snapshot()),
          &changed_by,
          &now_str,
        )?;
        tx.commit()?;
        Ok(())
      })
      .await?;

    Ok(entry)
  }

  async fn get_entry(&self, id: Uuid) -> Result<Option<QueueEntry>> {
    let id_str = encode_uuid(id);
    let raw: Option<RawEntry> = self
      .conn
      .call(move |conn| Ok(select_entry_raw(conn, &id_str)?))
      .await?;
    raw.map(RawEntry::into_entry).transpose()
  }

  async fn list_entries(&self, query: &EntryQuery) -> Result<Vec<QueueEntry>> {
    let tenant = query.tenant_id.clone();
    let status = query.status.map(|s| s.to_string());
    let limit = query.limit.unwrap_or(100) as i64;
    let offset = query.offset.unwrap_or(0) as i64;

    let raws: Vec<RawEntry> = self
      .conn
      .call(move |conn| {
        let mut conds: Vec<&'static str> = vec![];
        if tenant.is_some() {
          conds.push("tenant_id = ?1");
        }
        if status.is_some() {
          conds.push("status = ?2");
        }
        let where_clause = if conds.is_empty() {
          String::new()
        } else {
          format!("WHERE {}", conds.join(" AND "))
        };

        let sql = format!(
          "SELECT {ENTRY_COLUMNS} FROM queue_entries
           {where_clause}
           ORDER BY created_at DESC
           LIMIT ?3 OFFSET ?4"
        );

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
          .query_map(
            rusqlite::params![tenant.as_deref(), status.as_deref(), limit, offset],
            read_entry_row,
          )?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;

    raws.into_iter().map(RawEntry::into_entry).collect()
  }

  async fn transition(
    &self,
    id: Uuid,
    expected: EntryStatus,
    change: EntryChange,
    changed_by: &str,
  ) -> Result<Option<QueueEntry>> {
    if !lifecycle::permitted(expected, change.status) {
      return Err(Error::Core(recall_core::Error::InvalidTransition {
        from: expected,
        to:   change.status,
      }));
    }

    let id_str = encode_uuid(id);
    let expected_str = expected.to_string();
    let changed_by = changed_by.to_owned();
    let now = Utc::now();

    let outcome: TxOutcome<RawEntry> = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;

        let Some(old) = select_entry_raw(&tx, &id_str)? else {
          return Ok(TxOutcome::NotFound);
        };
        if old.status != expected_str {
          return Ok(TxOutcome::Stale);
        }

        let new = old.apply_change(&change, now);
        if update_entry_row(&tx, &new, &expected_str)? == 0 {
          return Ok(TxOutcome::Stale);
        }
        insert_audit_row(
          &tx,
          &new.tenant_id,
          &new.id,
          "update",
          Some(old.snapshot()),
          Some(new.snapshot()),
          &changed_by,
          &new.updated_at,
        )?;

        tx.commit()?;
        Ok(TxOutcome::Applied(new))
      })
      .await?;

    match outcome {
      TxOutcome::NotFound => Err(Error::EntryNotFound(id)),
      TxOutcome::Stale => Ok(None),
      TxOutcome::Applied(raw) => raw.into_entry().map(Some),
    }
  }

  async fn record_attempt(&self, input: NewAttempt) -> Result<AttemptRecord> {
    let now = Utc::now();
    let id = Uuid::new_v4();
    let entry_str = encode_uuid(input.entry_id);
    let id_str = encode_uuid(id);
    let method_str = input.method.to_string();
    let at_str = encode_dt(now);
    let responded_str = input.responded_at.map(encode_dt);
    let message = input.message_sent.clone();
    let response = input.response_received.clone();
    let reason = input.failure_reason.clone();
    let confidence = input.ai_confidence_score;
    let success = input.success;
    let engaged = input.customer_engaged;
    let escalated = input.escalation_triggered;

    let number: i64 = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;
        let number: i64 = tx.query_row(
          "SELECT COALESCE(MAX(attempt_number), 0) + 1 FROM attempts WHERE entry_id = ?1",
          rusqlite::params![entry_str],
          |row| row.get(0),
        )?;
        tx.execute(
          "INSERT INTO attempts (
             id, entry_id, attempt_number, method, message_sent,
             response_received, ai_confidence_score, success, customer_engaged,
             escalation_triggered, failure_reason, attempted_at, responded_at
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
          rusqlite::params![
            id_str,
            entry_str,
            number,
            method_str,
            message,
            response,
            confidence,
            success,
            engaged,
            escalated,
            reason,
            at_str,
            responded_str,
          ],
        )?;
        tx.commit()?;
        Ok(number)
      })
      .await?;

    Ok(AttemptRecord {
      id,
      entry_id: input.entry_id,
      attempt_number: number as u32,
      method: input.method,
      message_sent: input.message_sent,
      response_received: input.response_received,
      ai_confidence_score: input.ai_confidence_score,
      success: input.success,
      customer_engaged: input.customer_engaged,
      escalation_triggered: input.escalation_triggered,
      failure_reason: input.failure_reason,
      attempted_at: now,
      responded_at: input.responded_at,
    })
  }

  async fn attempts_for(&self, entry_id: Uuid) -> Result<Vec<AttemptRecord>> {
    let entry_str = encode_uuid(entry_id);
    let raws: Vec<RawAttempt> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT id, entry_id, attempt_number, method, message_sent,
                  response_received, ai_confidence_score, success,
                  customer_engaged, escalation_triggered, failure_reason,
                  attempted_at, responded_at
           FROM attempts WHERE entry_id = ?1
           ORDER BY attempt_number ASC",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![entry_str], read_attempt_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawAttempt::into_attempt).collect()
  }

  // ── Scheduler selections ──────────────────────────────────────────────

  async fn due_entries(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<QueueEntry>> {
    let now_str = encode_dt(now);
    let limit = limit as i64;
    let raws: Vec<RawEntry> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {ENTRY_COLUMNS} FROM queue_entries
           WHERE status = 'queued' AND next_attempt_at <= ?1
           ORDER BY priority_rank ASC, next_attempt_at ASC
           LIMIT ?2"
        ))?;
        let rows = stmt
          .query_map(rusqlite::params![now_str, limit], read_entry_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawEntry::into_entry).collect()
  }

  async fn breached_deadlines(
    &self,
    now: DateTime<Utc>,
    limit: usize,
  ) -> Result<Vec<QueueEntry>> {
    let now_str = encode_dt(now);
    let limit = limit as i64;
    let raws: Vec<RawEntry> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {ENTRY_COLUMNS} FROM queue_entries
           WHERE status IN ('queued', 'processing', 'ai_rescue_pending')
             AND (escalation_deadline <= ?1
                  OR (sla_deadline <= ?1 AND attempt_count = 0))
           ORDER BY escalation_deadline ASC
           LIMIT ?2"
        ))?;
        let rows = stmt
          .query_map(rusqlite::params![now_str, limit], read_entry_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawEntry::into_entry).collect()
  }

  async fn expired_rescues(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<QueueEntry>> {
    let now_str = encode_dt(now);
    let limit = limit as i64;
    let raws: Vec<RawEntry> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(&format!(
          "SELECT {ENTRY_COLUMNS} FROM queue_entries
           WHERE status = 'ai_rescue_pending' AND next_attempt_at <= ?1
           ORDER BY next_attempt_at ASC
           LIMIT ?2"
        ))?;
        let rows = stmt
          .query_map(rusqlite::params![now_str, limit], read_entry_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawEntry::into_entry).collect()
  }

  // ── Consent ───────────────────────────────────────────────────────────

  async fn get_consent(
    &self,
    tenant_id: &str,
    customer_phone: &str,
  ) -> Result<Option<ConsentRecord>> {
    let tenant = tenant_id.to_owned();
    let phone = customer_phone.to_owned();
    let raw: Option<RawConsent> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT tenant_id, customer_phone, status, opt_out_reason, updated_at
               FROM consent_records
               WHERE tenant_id = ?1 AND customer_phone = ?2",
              rusqlite::params![tenant, phone],
              |row| {
                Ok(RawConsent {
                  tenant_id:      row.get(0)?,
                  customer_phone: row.get(1)?,
                  status:         row.get(2)?,
                  opt_out_reason: row.get(3)?,
                  updated_at:     row.get(4)?,
                })
              },
            )
            .optional()?,
        )
      })
      .await?;
    raw.map(RawConsent::into_consent).transpose()
  }

  async fn set_consent(
    &self,
    tenant_id: &str,
    customer_phone: &str,
    status: ConsentStatus,
    opt_out_reason: Option<String>,
  ) -> Result<ConsentRecord> {
    let now = Utc::now();
    let record = ConsentRecord {
      tenant_id:      tenant_id.to_owned(),
      customer_phone: customer_phone.to_owned(),
      status,
      opt_out_reason,
      updated_at:     now,
    };

    let tenant = record.tenant_id.clone();
    let phone = record.customer_phone.clone();
    let status_str = status.to_string();
    let reason = record.opt_out_reason.clone();
    let now_str = encode_dt(now);

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO consent_records (tenant_id, customer_phone, status,
                                        opt_out_reason, updated_at)
           VALUES (?1, ?2, ?3, ?4, ?5)
           ON CONFLICT (tenant_id, customer_phone) DO UPDATE SET
             status = excluded.status,
             opt_out_reason = excluded.opt_out_reason,
             updated_at = excluded.updated_at",
          rusqlite::params![tenant, phone, status_str, reason, now_str],
        )?;
        Ok(())
      })
      .await?;

    Ok(record)
  }

  // ── Tenant policy ─────────────────────────────────────────────────────

  async fn get_policy(&self, tenant_id: &str) -> Result<TenantPolicy> {
    let tenant = tenant_id.to_owned();
    let json: Option<String> = self
      .conn
      .call(move |conn| {
        Ok(
          conn
            .query_row(
              "SELECT policy_json FROM tenant_policies WHERE tenant_id = ?1",
              rusqlite::params![tenant],
              |row| row.get(0),
            )
            .optional()?,
        )
      })
      .await?;

    match json {
      Some(json) => Ok(serde_json::from_str(&json)?),
      None => Ok(TenantPolicy::default()),
    }
  }

  async fn put_policy(&self, tenant_id: &str, policy: &TenantPolicy) -> Result<()> {
    let tenant = tenant_id.to_owned();
    let json = serde_json::to_string(policy)?;
    let now_str = encode_dt(Utc::now());
    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO tenant_policies (tenant_id, policy_json, updated_at)
           VALUES (?1, ?2, ?3)
           ON CONFLICT (tenant_id) DO UPDATE SET
             policy_json = excluded.policy_json,
             updated_at = excluded.updated_at",
          rusqlite::params![tenant, json, now_str],
        )?;
        Ok(())
      })
      .await?;
    Ok(())
  }

  // ── Circuit breakers ──────────────────────────────────────────────────

  async fn load_breaker(&self, provider: &str, tenant_id: &str) -> Result<CircuitBreakerState> {
    let provider = provider.to_owned();
    let tenant = tenant_id.to_owned();
    let now_str = encode_dt(Utc::now());

    let raw: RawBreaker = self
      .conn
      .call(move |conn| {
        // Materialise the closed default so CAS updates always have a row.
        conn.execute(
          "INSERT OR IGNORE INTO circuit_breakers
             (provider, tenant_id, state, failure_count, success_count,
              opened_at, updated_at)
           VALUES (?1, ?2, 'closed', 0, 0, NULL, ?3)",
          rusqlite::params![provider, tenant, now_str],
        )?;
        let raw = conn.query_row(
          "SELECT provider, tenant_id, state, failure_count, success_count,
                  opened_at, updated_at
           FROM circuit_breakers WHERE provider = ?1 AND tenant_id = ?2",
          rusqlite::params![provider, tenant],
          |row| {
            Ok(RawBreaker {
              provider:      row.get(0)?,
              tenant_id:     row.get(1)?,
              state:         row.get(2)?,
              failure_count: row.get(3)?,
              success_count: row.get(4)?,
              opened_at:     row.get(5)?,
              updated_at:    row.get(6)?,
            })
          },
        )?;
        Ok(raw)
      })
      .await?;

    raw.into_breaker()
  }

  async fn cas_breaker(
    &self,
    current: &CircuitBreakerState,
    next: &CircuitBreakerState,
  ) -> Result<bool> {
    let provider = current.provider.clone();
    let tenant = current.tenant_id.clone();
    let cur_state = current.state.to_string();
    let cur_failures = i64::from(current.failure_count);
    let cur_successes = i64::from(current.success_count);
    let cur_opened = current.opened_at.map(encode_dt);
    let new_state = next.state.to_string();
    let new_failures = i64::from(next.failure_count);
    let new_successes = i64::from(next.success_count);
    let new_opened = next.opened_at.map(encode_dt);
    let new_updated = encode_dt(next.updated_at);

    let affected: usize = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          "UPDATE circuit_breakers SET
             state = ?3, failure_count = ?4, success_count = ?5,
             opened_at = ?6, updated_at = ?7
           WHERE provider = ?1 AND tenant_id = ?2
             AND state = ?8 AND failure_count = ?9 AND success_count = ?10
             AND opened_at IS ?11",
          rusqlite::params![
            provider,
            tenant,
            new_state,
            new_failures,
            new_successes,
            new_opened,
            new_updated,
            cur_state,
            cur_failures,
            cur_successes,
            cur_opened,
          ],
        )?)
      })
      .await?;

    Ok(affected == 1)
  }

  // ── Dead letters ──────────────────────────────────────────────────────

  async fn push_dead_letter(&self, input: NewDeadLetter) -> Result<DeadLetterEntry> {
    let now = Utc::now();
    let entry = DeadLetterEntry {
      id:             Uuid::new_v4(),
      tenant_id:      input.tenant_id,
      entry_id:       input.entry_id,
      method:         input.method,
      customer_phone: input.customer_phone,
      payload:        input.payload,
      failure_reason: input.failure_reason,
      retry_count:    0,
      max_retries:    input.max_retries,
      next_retry_at:  input.next_retry_at,
      status:         DeadLetterStatus::Pending,
      created_at:     now,
      updated_at:     now,
    };

    let id_str = encode_uuid(entry.id);
    let tenant = entry.tenant_id.clone();
    let entry_str = encode_uuid(entry.entry_id);
    let method_str = entry.method.to_string();
    let phone = entry.customer_phone.clone();
    let payload = entry.payload.clone();
    let reason = entry.failure_reason.clone();
    let max_retries = i64::from(entry.max_retries);
    let retry_str = encode_dt(entry.next_retry_at);
    let now_str = encode_dt(now);

    self
      .conn
      .call(move |conn| {
        conn.execute(
          "INSERT INTO dead_letters (
             id, tenant_id, entry_id, method, customer_phone, payload,
             failure_reason, retry_count, max_retries, next_retry_at, status,
             created_at, updated_at
           ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 0, ?8, ?9, 'pending', ?10, ?10)",
          rusqlite::params![
            id_str, tenant, entry_str, method_str, phone, payload, reason,
            max_retries, retry_str, now_str,
          ],
        )?;
        Ok(())
      })
      .await?;

    Ok(entry)
  }

  async fn due_dead_letters(
    &self,
    now: DateTime<Utc>,
    limit: usize,
  ) -> Result<Vec<DeadLetterEntry>> {
    let now_str = encode_dt(now);
    let limit = limit as i64;
    let raws: Vec<RawDeadLetter> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT id, tenant_id, entry_id, method, customer_phone, payload,
                  failure_reason, retry_count, max_retries, next_retry_at,
                  status, created_at, updated_at
           FROM dead_letters
           WHERE status = 'pending' AND next_retry_at <= ?1
           ORDER BY next_retry_at ASC
           LIMIT ?2",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![now_str, limit], read_dead_letter_row)?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawDeadLetter::into_dead_letter).collect()
  }

  async fn update_dead_letter(
    &self,
    id: Uuid,
    expected: DeadLetterStatus,
    change: DeadLetterChange,
  ) -> Result<Option<DeadLetterEntry>> {
    let id_str = encode_uuid(id);
    let expected_str = expected.to_string();
    let now = Utc::now();

    let outcome: TxOutcome<RawDeadLetter> = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;

        let old: Option<RawDeadLetter> = tx
          .query_row(
            "SELECT id, tenant_id, entry_id, method, customer_phone, payload,
                    failure_reason, retry_count, max_retries, next_retry_at,
                    status, created_at, updated_at
             FROM dead_letters WHERE id = ?1",
            rusqlite::params![id_str],
            read_dead_letter_row,
          )
          .optional()?;
        let Some(old) = old else {
          return Ok(TxOutcome::NotFound);
        };
        if old.status != expected_str {
          return Ok(TxOutcome::Stale);
        }

        let new = old.apply_change(&change, now);
        let affected = tx.execute(
          "UPDATE dead_letters SET
             status = ?3, retry_count = ?4, next_retry_at = ?5,
             failure_reason = ?6, updated_at = ?7
           WHERE id = ?1 AND status = ?2",
          rusqlite::params![
            new.id,
            expected_str,
            new.status,
            new.retry_count,
            new.next_retry_at,
            new.failure_reason,
            new.updated_at,
          ],
        )?;
        if affected == 0 {
          return Ok(TxOutcome::Stale);
        }

        tx.commit()?;
        Ok(TxOutcome::Applied(new))
      })
      .await?;

    match outcome {
      TxOutcome::NotFound => Err(Error::DeadLetterNotFound(id)),
      TxOutcome::Stale => Ok(None),
      TxOutcome::Applied(raw) => raw.into_dead_letter().map(Some),
    }
  }

  async fn list_dead_letters(
    &self,
    status: Option<DeadLetterStatus>,
    limit: usize,
  ) -> Result<Vec<DeadLetterEntry>> {
    let status_str = status.map(|s| s.to_string());
    let limit = limit as i64;
    let raws: Vec<RawDeadLetter> = self
      .conn
      .call(move |conn| {
        let where_clause = if status_str.is_some() { "WHERE status = ?1" } else { "" };
        let sql = format!(
          "SELECT id, tenant_id, entry_id, method, customer_phone, payload,
                  failure_reason, retry_count, max_retries, next_retry_at,
                  status, created_at, updated_at
           FROM dead_letters {where_clause}
           ORDER BY created_at DESC
           LIMIT ?2"
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
          .query_map(
            rusqlite::params![status_str.as_deref(), limit],
            read_dead_letter_row,
          )?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawDeadLetter::into_dead_letter).collect()
  }

  // ── Rate limiting ─────────────────────────────────────────────────────

  async fn rate_check(
    &self,
    tenant_id: &str,
    client_key: &str,
    policy: &RateLimitPolicy,
    now: DateTime<Utc>,
  ) -> Result<RateDecision> {
    let tenant = tenant_id.to_owned();
    let client = client_key.to_owned();
    let now_str = encode_dt(now);
    let bucket = now.timestamp() / RATE_BUCKET_SECONDS * RATE_BUCKET_SECONDS;
    let window_floor = now.timestamp() - i64::from(policy.window_seconds);
    let soft = i64::from(policy.soft_limit);
    let hard = i64::from(policy.hard_limit);
    let block_until_str =
      encode_dt(now + chrono::Duration::minutes(i64::from(policy.block_minutes)));

    enum RateOutcome {
      Allowed,
      Limited,
      Blocked(String),
    }

    let outcome: RateOutcome = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;

        // An active block wins before anything is counted.
        let block: Option<String> = tx
          .query_row(
            "SELECT blocked_until FROM rate_blocks
             WHERE tenant_id = ?1 AND client_key = ?2",
            rusqlite::params![tenant, client],
            |row| row.get(0),
          )
          .optional()?;
        if let Some(until) = block {
          if until > now_str {
            return Ok(RateOutcome::Blocked(until));
          }
          tx.execute(
            "DELETE FROM rate_blocks WHERE tenant_id = ?1 AND client_key = ?2",
            rusqlite::params![tenant, client],
          )?;
        }

        tx.execute(
          "INSERT INTO rate_buckets (tenant_id, client_key, bucket_start, count)
           VALUES (?1, ?2, ?3, 1)
           ON CONFLICT (tenant_id, client_key, bucket_start)
             DO UPDATE SET count = count + 1",
          rusqlite::params![tenant, client, bucket],
        )?;

        let total: i64 = tx.query_row(
          "SELECT COALESCE(SUM(count), 0) FROM rate_buckets
           WHERE tenant_id = ?1 AND client_key = ?2 AND bucket_start > ?3",
          rusqlite::params![tenant, client, window_floor],
          |row| row.get(0),
        )?;

        let outcome = if total > hard {
          tx.execute(
            "INSERT INTO rate_blocks (tenant_id, client_key, blocked_until)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (tenant_id, client_key)
               DO UPDATE SET blocked_until = excluded.blocked_until",
            rusqlite::params![tenant, client, block_until_str],
          )?;
          RateOutcome::Blocked(block_until_str.clone())
        } else if total > soft {
          RateOutcome::Limited
        } else {
          RateOutcome::Allowed
        };

        tx.commit()?;
        Ok(outcome)
      })
      .await?;

    match outcome {
      RateOutcome::Allowed => Ok(RateDecision::Allowed),
      RateOutcome::Limited => Ok(RateDecision::RateLimited),
      RateOutcome::Blocked(until) => Ok(RateDecision::Blocked { until: decode_dt(&until)? }),
    }
  }

  // ── Audit ─────────────────────────────────────────────────────────────

  async fn audit_for_entry(&self, entry_id: Uuid) -> Result<Vec<AuditRecord>> {
    let entry_str = encode_uuid(entry_id);
    let raws: Vec<RawAudit> = self
      .conn
      .call(move |conn| {
        let mut stmt = conn.prepare(
          "SELECT id, tenant_id, entry_id, action, old_values, new_values,
                  changed_by, changed_at
           FROM audit_log WHERE entry_id = ?1
           ORDER BY changed_at ASC",
        )?;
        let rows = stmt
          .query_map(rusqlite::params![entry_str], |row| {
            Ok(RawAudit {
              id:         row.get(0)?,
              tenant_id:  row.get(1)?,
              entry_id:   row.get(2)?,
              action:     row.get(3)?,
              old_values: row.get(4)?,
              new_values: row.get(5)?,
              changed_by: row.get(6)?,
              changed_at: row.get(7)?,
            })
          })?
          .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
      })
      .await?;
    raws.into_iter().map(RawAudit::into_audit).collect()
  }

  // ── Retention sweeps ──────────────────────────────────────────────────

  async fn purge_expired_idempotency(&self, now: DateTime<Utc>) -> Result<u64> {
    let now_str = encode_dt(now);
    let removed: usize = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          "DELETE FROM idempotency_keys WHERE expires_at <= ?1",
          rusqlite::params![now_str],
        )?)
      })
      .await?;
    Ok(removed as u64)
  }

  async fn purge_rate_windows(&self, now: DateTime<Utc>) -> Result<u64> {
    let now_str = encode_dt(now);
    let day_floor = now.timestamp() - 24 * 3600;
    let removed: usize = self
      .conn
      .call(move |conn| {
        let buckets = conn.execute(
          "DELETE FROM rate_buckets WHERE bucket_start <= ?1",
          rusqlite::params![day_floor],
        )?;
        let blocks = conn.execute(
          "DELETE FROM rate_blocks WHERE blocked_until <= ?1",
          rusqlite::params![now_str],
        )?;
        Ok(buckets + blocks)
      })
      .await?;
    Ok(removed as u64)
  }

  async fn purge_audit_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
    let cutoff_str = encode_dt(cutoff);
    let removed: usize = self
      .conn
      .call(move |conn| {
        Ok(conn.execute(
          "DELETE FROM audit_log WHERE changed_at < ?1",
          rusqlite::params![cutoff_str],
        )?)
      })
      .await?;
    Ok(removed as u64)
  }

  async fn purge_expired_entries(&self, now: DateTime<Utc>) -> Result<u64> {
    let now_str = encode_dt(now);
    let removed: usize = self
      .conn
      .call(move |conn| {
        let tx = conn.transaction()?;

        let expired: Vec<RawEntry> = {
          let mut stmt = tx.prepare(&format!(
            "SELECT {ENTRY_COLUMNS} FROM queue_entries
             WHERE data_retention_expires_at <= ?1"
          ))?;
          stmt
            .query_map(rusqlite::params![now_str], read_entry_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?
        };

        for raw in &expired {
          insert_audit_row(
            &tx,
            &raw.tenant_id,
            &raw.id,
            "delete",
            Some(raw.snapshot()),
            None,
            "retention-sweeper",
            &now_str,
          )?;
          // Attempts cascade via the foreign key.
          tx.execute(
            "DELETE FROM queue_entries WHERE id = ?1",
            rusqlite::params![raw.id],
          )?;
        }

        tx.commit()?;
        Ok(expired.len())
      })
      .await?;
    Ok(removed as u64)
  }
}
