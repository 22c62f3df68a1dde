//! The circuit-breaker registry: loads per-(provider, tenant) state from the
//! store, runs the pure step functions, and advances state with
//! compare-and-swap so concurrent scheduler instances agree.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use recall_core::{
  breaker::{AllowStep, BreakerPolicy, step_allow, step_outcome},
  store::RecoveryStore,
};

use crate::{Error, Result};

/// Retries for the outcome-recording CAS loop before giving up under
/// contention. Dropping an outcome is safe: the next one re-converges.
const CAS_ATTEMPTS: u32 = 4;

pub struct BreakerRegistry<S> {
  store:  Arc<S>,
  policy: BreakerPolicy,
}

impl<S: RecoveryStore> BreakerRegistry<S> {
  pub fn new(store: Arc<S>, policy: BreakerPolicy) -> Self {
    Self { store, policy }
  }

  /// Whether a call to `provider` on behalf of `tenant` may go out now.
  ///
  /// When the open-circuit cooldown has elapsed, exactly one caller wins the
  /// half-open swap and gets the probe; everyone else is rejected until the
  /// probe's outcome lands.
  pub async fn allow(&self, provider: &str, tenant_id: &str, now: DateTime<Utc>) -> Result<bool> {
    let current = self
      .store
      .load_breaker(provider, tenant_id)
      .await
      .map_err(Error::store)?;

    match step_allow(&current, &self.policy, now) {
      AllowStep::Allow => Ok(true),
      AllowStep::Reject => Ok(false),
      AllowStep::Probe(next) => {
        let won = self
          .store
          .cas_breaker(&current, &next)
          .await
          .map_err(Error::store)?;
        if won {
          tracing::info!(provider, tenant_id, "circuit half-open, probing");
        }
        Ok(won)
      }
    }
  }

  /// Record an attempt's outcome against the circuit.
  pub async fn record_outcome(
    &self,
    provider: &str,
    tenant_id: &str,
    success: bool,
    now: DateTime<Utc>,
  ) -> Result<()> {
    for _ in 0..CAS_ATTEMPTS {
      let current = self
        .store
        .load_breaker(provider, tenant_id)
        .await
        .map_err(Error::store)?;
      let next = step_outcome(&current, &self.policy, success, now);

      if self
        .store
        .cas_breaker(&current, &next)
        .await
        .map_err(Error::store)?
      {
        if current.state != next.state {
          tracing::warn!(
            provider,
            tenant_id,
            from = %current.state,
            to = %next.state,
            "circuit state changed"
          );
        }
        return Ok(());
      }
    }

    tracing::warn!(provider, tenant_id, "breaker outcome dropped after CAS contention");
    Ok(())
  }
}

// Manual impl: `S` itself need not be `Clone` behind the `Arc`.
impl<S> Clone for BreakerRegistry<S> {
  fn clone(&self) -> Self {
    Self { store: Arc::clone(&self.store), policy: self.policy }
  }
}
