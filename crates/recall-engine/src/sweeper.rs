//! The cleanup sweeper: a daily pass that purges expired idempotency keys,
//! stale rate-limit state, audit rows past retention, and queue entries past
//! their data-retention horizon.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use recall_core::store::RecoveryStore;
use serde::Serialize;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy)]
pub struct SweeperConfig {
  pub interval:             Duration,
  /// How long audit rows are kept.
  pub audit_retention_days: u32,
}

impl Default for SweeperConfig {
  fn default() -> Self {
    Self {
      interval:             Duration::from_secs(24 * 60 * 60),
      audit_retention_days: 365,
    }
  }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct SweepStats {
  pub idempotency_keys: u64,
  pub rate_windows:     u64,
  pub audit_rows:       u64,
  pub entries:          u64,
}

pub struct CleanupSweeper<S> {
  store:  Arc<S>,
  config: SweeperConfig,
}

impl<S: RecoveryStore> CleanupSweeper<S> {
  pub fn new(store: Arc<S>, config: SweeperConfig) -> Self {
    Self { store, config }
  }

  pub async fn run(self) {
    let mut ticker = tokio::time::interval(self.config.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
      ticker.tick().await;
      match self.run_cycle(Utc::now()).await {
        Ok(stats) => tracing::info!(?stats, "cleanup sweep complete"),
        Err(err) => tracing::error!(error = %err, "cleanup sweep failed"),
      }
    }
  }

  pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<SweepStats> {
    let audit_cutoff =
      now - chrono::Duration::days(i64::from(self.config.audit_retention_days));

    Ok(SweepStats {
      idempotency_keys: self
        .store
        .purge_expired_idempotency(now)
        .await
        .map_err(Error::store)?,
      rate_windows:     self.store.purge_rate_windows(now).await.map_err(Error::store)?,
      audit_rows:       self
        .store
        .purge_audit_before(audit_cutoff)
        .await
        .map_err(Error::store)?,
      entries:          self.store.purge_expired_entries(now).await.map_err(Error::store)?,
    })
  }
}
