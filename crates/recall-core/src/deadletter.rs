//! Dead letters — outbound sends that failed at the provider level.
//!
//! A dead letter retries on its own bounded schedule, independent of the
//! owning entry's customer-facing retry budget. The owning entry can reach a
//! terminal status while its last payload is still retrying here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

use crate::entry::OutreachMethod;

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeadLetterStatus {
  Pending,
  Processing,
  Failed,
  Resolved,
}

/// A failed outreach payload queued for independent retry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetterEntry {
  pub id:             Uuid,
  pub tenant_id:      String,
  pub entry_id:       Uuid,
  pub method:         OutreachMethod,
  pub customer_phone: String,
  /// The message body that failed to send.
  pub payload:        String,
  pub failure_reason: String,
  pub retry_count:    u32,
  pub max_retries:    u32,
  pub next_retry_at:  DateTime<Utc>,
  pub status:         DeadLetterStatus,
  pub created_at:     DateTime<Utc>,
  pub updated_at:     DateTime<Utc>,
}

/// Input to [`crate::store::RecoveryStore::push_dead_letter`].
#[derive(Debug, Clone)]
pub struct NewDeadLetter {
  pub tenant_id:      String,
  pub entry_id:       Uuid,
  pub method:         OutreachMethod,
  pub customer_phone: String,
  pub payload:        String,
  pub failure_reason: String,
  pub max_retries:    u32,
  pub next_retry_at:  DateTime<Utc>,
}

/// Field updates applied together with a dead-letter status change.
#[derive(Debug, Clone)]
pub struct DeadLetterChange {
  pub status:         DeadLetterStatus,
  pub retry_count:    Option<u32>,
  pub next_retry_at:  Option<DateTime<Utc>>,
  pub failure_reason: Option<String>,
}

impl DeadLetterChange {
  pub fn to(status: DeadLetterStatus) -> Self {
    Self {
      status,
      retry_count:    None,
      next_retry_at:  None,
      failure_reason: None,
    }
  }
}
