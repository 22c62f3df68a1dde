//! The SLA scheduler: a fixed-interval poll loop that sweeps breached
//! deadlines first, re-evaluates expired rescue windows, then claims due
//! entries one at a time via conditional update and hands each to the
//! outreach handler.
//!
//! Multiple scheduler instances may run concurrently; the conditional
//! updates guarantee at-most-one claims a given entry per cycle, and losers
//! simply skip it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use recall_core::{
  entry::{EntryChange, EntryStatus, QueueEntry},
  lifecycle::{self, DeadlineBreach, RescueExpiry},
  store::RecoveryStore,
};
use serde::Serialize;
use uuid::Uuid;

use crate::{
  Error, Result,
  outreach::{Disposition, Outreacher},
};

/// Audit actor for scheduler-driven mutations.
const ACTOR: &str = "sla-scheduler";

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
  pub poll_interval: Duration,
  /// Max entries pulled per selection per cycle.
  pub batch_size:    usize,
}

impl Default for SchedulerConfig {
  fn default() -> Self {
    Self { poll_interval: Duration::from_secs(60), batch_size: 50 }
  }
}

// ─── Cycle stats and the operator handle ─────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CycleStats {
  pub claimed:       u64,
  pub recovered:     u64,
  pub requeued:      u64,
  pub rescue_parked: u64,
  pub escalated:     u64,
  pub expired:       u64,
  pub failed:        u64,
  pub deferred:      u64,
  pub dead_lettered: u64,
}

impl CycleStats {
  fn record(&mut self, disposition: Disposition) {
    match disposition {
      Disposition::Recovered => self.recovered += 1,
      Disposition::Requeued => self.requeued += 1,
      Disposition::RescuePending => self.rescue_parked += 1,
      Disposition::Escalated => self.escalated += 1,
      Disposition::Expired => self.expired += 1,
      Disposition::Failed | Disposition::ComplianceHalt => self.failed += 1,
      Disposition::ConsentDeferred
      | Disposition::CircuitDeferred
      | Disposition::AiDeferred => self.deferred += 1,
      Disposition::DeadLettered => self.dead_lettered += 1,
      Disposition::Superseded => {}
    }
  }
}

/// Shared run-gate and telemetry, exposed through the processor-control API.
pub struct ProcessorHandle {
  running:       AtomicBool,
  cycles:        AtomicU64,
  last_cycle:    std::sync::Mutex<Option<(DateTime<Utc>, CycleStats)>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessorStatus {
  pub running:          bool,
  pub cycles_completed: u64,
  pub last_cycle_at:    Option<DateTime<Utc>>,
  pub last_cycle:       Option<CycleStats>,
}

impl ProcessorHandle {
  pub fn new(running: bool) -> Self {
    Self {
      running:    AtomicBool::new(running),
      cycles:     AtomicU64::new(0),
      last_cycle: std::sync::Mutex::new(None),
    }
  }

  pub fn start(&self) {
    self.running.store(true, Ordering::SeqCst);
  }

  pub fn stop(&self) {
    self.running.store(false, Ordering::SeqCst);
  }

  pub fn is_running(&self) -> bool {
    self.running.load(Ordering::SeqCst)
  }

  pub fn status(&self) -> ProcessorStatus {
    let last = self.last_cycle.lock().ok().and_then(|g| *g);
    ProcessorStatus {
      running:          self.is_running(),
      cycles_completed: self.cycles.load(Ordering::SeqCst),
      last_cycle_at:    last.map(|(at, _)| at),
      last_cycle:       last.map(|(_, stats)| stats),
    }
  }

  fn record_cycle(&self, at: DateTime<Utc>, stats: CycleStats) {
    self.cycles.fetch_add(1, Ordering::SeqCst);
    if let Ok(mut guard) = self.last_cycle.lock() {
      *guard = Some((at, stats));
    }
  }
}

// ─── Scheduler ───────────────────────────────────────────────────────────────

pub struct SlaScheduler<S> {
  store:    Arc<S>,
  outreach: Arc<Outreacher<S>>,
  handle:   Arc<ProcessorHandle>,
  config:   SchedulerConfig,
}

impl<S: RecoveryStore> SlaScheduler<S> {
  pub fn new(
    store: Arc<S>,
    outreach: Arc<Outreacher<S>>,
    handle: Arc<ProcessorHandle>,
    config: SchedulerConfig,
  ) -> Self {
    Self { store, outreach, handle, config }
  }

  pub fn handle(&self) -> Arc<ProcessorHandle> {
    Arc::clone(&self.handle)
  }

  /// Poll forever. Errors are logged and the loop keeps going; one bad
  /// cycle must not take the processor down.
  pub async fn run(&self) {
    let mut ticker = tokio::time::interval(self.config.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
      ticker.tick().await;
      if !self.handle.is_running() {
        continue;
      }
      let now = Utc::now();
      match self.run_cycle(now).await {
        Ok(stats) => {
          self.handle.record_cycle(now, stats);
          tracing::debug!(?stats, "scheduler cycle complete");
        }
        Err(err) => tracing::error!(error = %err, "scheduler cycle failed"),
      }
    }
  }

  /// One full pass: deadline sweep, rescue-window expiry, then claims.
  pub async fn run_cycle(&self, now: DateTime<Utc>) -> Result<CycleStats> {
    let mut stats = CycleStats::default();

    self.sweep_deadlines(now, &mut stats).await?;
    self.sweep_rescues(now, &mut stats).await?;
    self.drive_due(now, &mut stats).await?;

    Ok(stats)
  }

  /// DeadlineExceeded always wins: this runs before any claim is taken.
  async fn sweep_deadlines(&self, now: DateTime<Utc>, stats: &mut CycleStats) -> Result<()> {
    let breached = self
      .store
      .breached_deadlines(now, self.config.batch_size)
      .await
      .map_err(Error::store)?;

    for entry in breached {
      let Some(breach) = lifecycle::deadline_breach(&entry, now) else {
        continue;
      };
      let (change, label) = match breach {
        DeadlineBreach::Escalate => {
          let mut change = EntryChange::to(EntryStatus::Escalated);
          change.escalated_at = Some(now);
          (change, "escalated")
        }
        DeadlineBreach::Expire => (EntryChange::to(EntryStatus::Expired), "expired"),
      };

      match self.store.transition(entry.id, entry.status, change, ACTOR).await {
        Ok(Some(_)) => {
          tracing::warn!(entry_id = %entry.id, tenant_id = %entry.tenant_id, label, "deadline breached");
          match breach {
            DeadlineBreach::Escalate => stats.escalated += 1,
            DeadlineBreach::Expire => stats.expired += 1,
          }
        }
        Ok(None) => {} // someone else moved it first
        Err(err) => {
          tracing::error!(entry_id = %entry.id, error = %err, "deadline transition failed");
        }
      }
    }
    Ok(())
  }

  async fn sweep_rescues(&self, now: DateTime<Utc>, stats: &mut CycleStats) -> Result<()> {
    let expired = self
      .store
      .expired_rescues(now, self.config.batch_size)
      .await
      .map_err(Error::store)?;

    for entry in expired {
      let policy = match self.store.get_policy(&entry.tenant_id).await {
        Ok(p) => p,
        Err(err) => {
          tracing::error!(entry_id = %entry.id, error = %err, "policy load failed");
          continue;
        }
      };

      let change = match lifecycle::rescue_expiry(&entry, &policy) {
        RescueExpiry::Requeue { counted_attempts } => {
          let mut change = EntryChange::to(EntryStatus::Queued);
          change.attempt_count = Some(counted_attempts);
          change.next_attempt_at = Some(if entry.business_hours_override {
            now
          } else {
            policy.next_open(now)
          });
          change
        }
        RescueExpiry::Escalate => {
          let mut change = EntryChange::to(EntryStatus::Escalated);
          change.escalated_at = Some(now);
          change
        }
      };
      let escalating = change.status == EntryStatus::Escalated;

      match self.store.transition(entry.id, entry.status, change, ACTOR).await {
        Ok(Some(_)) => {
          if escalating {
            stats.escalated += 1;
          } else {
            stats.requeued += 1;
          }
        }
        Ok(None) => {}
        Err(err) => {
          tracing::error!(entry_id = %entry.id, error = %err, "rescue expiry transition failed");
        }
      }
    }
    Ok(())
  }

  async fn drive_due(&self, now: DateTime<Utc>, stats: &mut CycleStats) -> Result<()> {
    let due = self
      .store
      .due_entries(now, self.config.batch_size)
      .await
      .map_err(Error::store)?;

    for entry in due {
      if let Err(err) = self.drive_one(&entry, now, stats).await {
        // One failing entry never blocks the rest of the batch.
        tracing::error!(entry_id = %entry.id, error = %err, "entry processing failed");
      }
    }
    Ok(())
  }

  async fn drive_one(
    &self,
    entry: &QueueEntry,
    now: DateTime<Utc>,
    stats: &mut CycleStats,
  ) -> Result<()> {
    let policy = self
      .store
      .get_policy(&entry.tenant_id)
      .await
      .map_err(Error::store)?;

    // A queued entry whose budget is already spent fails without a claim.
    if entry.attempt_count >= entry.max_attempts {
      let mut change = EntryChange::to(EntryStatus::Failed);
      change.processed_at = Some(now);
      if self
        .store
        .transition(entry.id, EntryStatus::Queued, change, ACTOR)
        .await
        .map_err(Error::store)?
        .is_some()
      {
        stats.failed += 1;
      }
      return Ok(());
    }

    // Claim: the conditional update makes this race-safe across instances.
    let claimed = self
      .store
      .transition(
        entry.id,
        EntryStatus::Queued,
        EntryChange::to(EntryStatus::Processing),
        ACTOR,
      )
      .await
      .map_err(Error::store)?;
    let Some(claimed) = claimed else {
      return Ok(()); // another scheduler instance won this cycle
    };
    stats.claimed += 1;

    match self.outreach.process_claimed(&claimed, &policy, now).await {
      Ok(disposition) => {
        stats.record(disposition);
        Ok(())
      }
      Err(err) => {
        // Release the claim so the entry is not wedged in `processing`;
        // budget is untouched.
        let mut release = EntryChange::to(EntryStatus::Queued);
        release.next_attempt_at =
          Some(policy.schedule_deferral(now, claimed.business_hours_override));
        let _ = self
          .store
          .transition(claimed.id, EntryStatus::Processing, release, ACTOR)
          .await;
        Err(err)
      }
    }
  }

  /// Operator action: claim and attempt one entry immediately, outside the
  /// scheduler's cadence.
  pub async fn process_entry_now(&self, id: Uuid, now: DateTime<Utc>) -> Result<Disposition> {
    let entry = self
      .store
      .get_entry(id)
      .await
      .map_err(Error::store)?
      .ok_or(Error::EntryNotFound(id))?;

    if entry.status != EntryStatus::Queued {
      return Err(Error::NotClaimable(id));
    }

    let policy = self
      .store
      .get_policy(&entry.tenant_id)
      .await
      .map_err(Error::store)?;

    let claimed = self
      .store
      .transition(
        entry.id,
        EntryStatus::Queued,
        EntryChange::to(EntryStatus::Processing),
        "operator",
      )
      .await
      .map_err(Error::store)?
      .ok_or(Error::NotClaimable(id))?;

    self.outreach.process_claimed(&claimed, &policy, now).await
  }
}
