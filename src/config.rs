use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::{Result, TxnError};

/// Coordinator ring configuration, injected once at startup and immutable
/// afterwards. Re-configuration is rejected by the runtime builder.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RingConfig {
    /// Number of coordinators in the token ring.
    pub ring_size: usize,
    /// Target interval between deterministic batch emissions per coordinator.
    pub batch_interval: Duration,
    /// Sleep applied before re-forwarding the token once backoff is engaged;
    /// a fraction of `batch_interval` in practice.
    pub backoff_interval: Duration,
    /// How often an idle coordinator probes its buffers while the ring is in
    /// backoff. Must not exceed `backoff_interval`.
    pub idle_probe_interval: Duration,
    /// Bound on a non-deterministic turn wait before the call is classified
    /// as a deadlock and the transaction aborted.
    pub deadlock_timeout: Duration,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            ring_size: 1,
            batch_interval: Duration::from_millis(10),
            backoff_interval: Duration::from_millis(5),
            idle_probe_interval: Duration::from_millis(1),
            deadlock_timeout: Duration::from_secs(5),
        }
    }
}

impl RingConfig {
    /// Rejects configurations that cannot run, before anything is spawned.
    pub fn validate(&self) -> Result<()> {
        if self.ring_size == 0 {
            return Err(TxnError::Configuration(
                "ring_size must be at least 1".into(),
            ));
        }
        if self.batch_interval.is_zero() {
            return Err(TxnError::Configuration(
                "batch_interval must be non-zero".into(),
            ));
        }
        if self.backoff_interval.is_zero() || self.idle_probe_interval.is_zero() {
            return Err(TxnError::Configuration(
                "backoff_interval and idle_probe_interval must be non-zero".into(),
            ));
        }
        if self.idle_probe_interval > self.backoff_interval {
            return Err(TxnError::Configuration(
                "idle_probe_interval must not exceed backoff_interval".into(),
            ));
        }
        if self.deadlock_timeout.is_zero() {
            return Err(TxnError::Configuration(
                "deadlock_timeout must be non-zero".into(),
            ));
        }
        Ok(())
    }
}
