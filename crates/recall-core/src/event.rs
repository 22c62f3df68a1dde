//! Webhook event types and the idempotency ledger records that gate them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ─── Inbound event ───────────────────────────────────────────────────────────

/// A "call went unanswered" notification from the telephony webhook source.
///
/// Delivery is at-least-once; `(provider, external_event_id)` is the
/// idempotency key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MissedCallEvent {
  pub external_event_id: String,
  pub call_reference:    String,
  pub customer_phone:    String,
  pub tenant_id:         String,
  pub timestamp:         DateTime<Utc>,
  /// Webhook source identifier; most deployments have exactly one.
  #[serde(default = "default_provider")]
  pub provider:          String,
}

fn default_provider() -> String { "telephony".to_string() }

// ─── Idempotency ledger ──────────────────────────────────────────────────────

/// Ledger row for one externally-sourced event id.
///
/// Created on first sight; on duplicate delivery only `last_seen_at` and
/// `attempts` move. `entry_id` is stamped when the enqueue commits —
/// admission is provisional until then.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
  pub provider:          String,
  pub external_event_id: String,
  pub entry_id:          Option<Uuid>,
  pub first_seen_at:     DateTime<Utc>,
  pub last_seen_at:      DateTime<Utc>,
  /// Total deliveries observed, including the first.
  pub attempts:          u32,
  pub expires_at:        DateTime<Utc>,
}

/// Result of [`crate::store::RecoveryStore::admit_event`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
  /// First sight of this key within the TTL window; processing may proceed.
  Accepted,
  /// Already seen; the caller must not process the event again.
  Duplicate {
    /// The queue entry the original delivery committed to, if any.
    entry_id: Option<Uuid>,
  },
}
