//! Audit trail — append-only, tenant-scoped proof of every entry mutation.
//!
//! Written in the same transaction as the mutation it mirrors, independently
//! of the attempt log. Rows are never updated and are deleted only by the
//! retention sweeper.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AuditAction {
  Insert,
  Update,
  Delete,
}

/// One mutation of one queue entry, with before/after snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
  pub id:         Uuid,
  pub tenant_id:  String,
  pub entry_id:   Uuid,
  pub action:     AuditAction,
  pub old_values: Option<serde_json::Value>,
  pub new_values: Option<serde_json::Value>,
  pub changed_by: String,
  pub changed_at: DateTime<Utc>,
}
