//! The dead-letter worker: retries provider-failed payloads on their own
//! bounded schedule, independent of the owning entry's retry budget.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use recall_core::{
  deadletter::{DeadLetterChange, DeadLetterEntry, DeadLetterStatus},
  store::RecoveryStore,
};
use serde::Serialize;

use crate::{
  Error, Result,
  channels::{ChannelError, ChannelSet, OutboundMessage},
};

#[derive(Debug, Clone, Copy)]
pub struct DeadLetterConfig {
  pub poll_interval: Duration,
  pub batch_size:    usize,
}

impl Default for DeadLetterConfig {
  fn default() -> Self {
    Self { poll_interval: Duration::from_secs(60), batch_size: 25 }
  }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DeadLetterStats {
  pub resolved:  u64,
  pub requeued:  u64,
  pub exhausted: u64,
}

pub struct DeadLetterWorker<S> {
  store:    Arc<S>,
  channels: ChannelSet,
  config:   DeadLetterConfig,
}

impl<S: RecoveryStore> DeadLetterWorker<S> {
  pub fn new(store: Arc<S>, channels: ChannelSet, config: DeadLetterConfig) -> Self {
    Self { store, channels, config }
  }

  pub async fn run(self) {
    let mut ticker = tokio::time::interval(self.config.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
      ticker.tick().await;
      match self.run_cycle(Utc::now()).await {
        Ok(stats) => tracing::debug!(?stats, "dead-letter cycle complete"),
        Err(err) => tracing::error!(error = %err, "dead-letter cycle failed"),
      }
    }
  }

  pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<DeadLetterStats> {
    let mut stats = DeadLetterStats::default();

    let due = self
      .store
      .due_dead_letters(now, self.config.batch_size)
      .await
      .map_err(Error::store)?;

    for letter in due {
      if let Err(err) = self.retry_one(&letter, now, &mut stats).await {
        tracing::error!(dead_letter_id = %letter.id, error = %err, "dead-letter retry failed");
      }
    }
    Ok(stats)
  }

  async fn retry_one(
    &self,
    letter: &DeadLetterEntry,
    now: DateTime<Utc>,
    stats: &mut DeadLetterStats,
  ) -> Result<()> {
    // Claim via conditional update; a racing worker loses and skips.
    let claimed = self
      .store
      .update_dead_letter(
        letter.id,
        DeadLetterStatus::Pending,
        DeadLetterChange::to(DeadLetterStatus::Processing),
      )
      .await
      .map_err(Error::store)?;
    let Some(claimed) = claimed else {
      return Ok(());
    };

    let message = OutboundMessage {
      tenant_id: claimed.tenant_id.clone(),
      entry_id:  claimed.entry_id,
      to:        claimed.customer_phone.clone(),
      body:      claimed.payload.clone(),
    };

    let outcome = match self.channels.get(claimed.method) {
      Ok(channel) => channel.send(&message).await,
      Err(_) => Err(ChannelError::Permanent(format!(
        "no channel configured for {}",
        claimed.method
      ))),
    };

    let change = match outcome {
      Ok(_) => {
        tracing::info!(dead_letter_id = %claimed.id, "dead letter delivered");
        stats.resolved += 1;
        DeadLetterChange::to(DeadLetterStatus::Resolved)
      }
      Err(ChannelError::Permanent(reason)) => {
        tracing::warn!(dead_letter_id = %claimed.id, %reason, "dead letter unsendable");
        stats.exhausted += 1;
        let mut change = DeadLetterChange::to(DeadLetterStatus::Failed);
        change.failure_reason = Some(reason);
        change
      }
      Err(ChannelError::Transient(reason)) => {
        let retries = claimed.retry_count + 1;
        if retries >= claimed.max_retries {
          tracing::warn!(dead_letter_id = %claimed.id, retries, "dead letter retries exhausted");
          stats.exhausted += 1;
          let mut change = DeadLetterChange::to(DeadLetterStatus::Failed);
          change.retry_count = Some(retries);
          change.failure_reason = Some(reason);
          change
        } else {
          stats.requeued += 1;
          let policy = self
            .store
            .get_policy(&claimed.tenant_id)
            .await
            .map_err(Error::store)?;
          let backoff = i64::from(policy.dead_letter_base_minutes.max(1))
            * 2i64.saturating_pow(retries.min(16));
          let mut change = DeadLetterChange::to(DeadLetterStatus::Pending);
          change.retry_count = Some(retries);
          change.next_retry_at = Some(now + chrono::Duration::minutes(backoff));
          change.failure_reason = Some(reason);
          change
        }
      }
    };

    self
      .store
      .update_dead_letter(claimed.id, DeadLetterStatus::Processing, change)
      .await
      .map_err(Error::store)?;
    Ok(())
  }
}
