//! Kernel configuration.
//!
//! Built in code with the `with_*` methods or, with the `serialize`
//! feature, deserialized from JSON. Missing fields take their defaults.

use std::time::Duration;

use crate::error::{KernelError, KernelResult};
use crate::time::VirtualTime;

/// How often the coordinator starts a GVT round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serialize", serde(rename_all = "snake_case"))]
pub enum GvtPeriod {
    /// After this many milliseconds of wall time.
    Millis(u64),
    /// After this many events processed on the coordinator node.
    Events(u64),
}

impl Default for GvtPeriod {
    fn default() -> Self {
        GvtPeriod::Millis(10)
    }
}

/// When object state is snapshotted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serialize", serde(default))]
pub struct CheckpointPolicy {
    /// Save a snapshot after every `period`-th processed event.
    /// `1` snapshots after every event; larger values trade memory for
    /// longer coast-forward replays.
    pub period: u32,
}

impl Default for CheckpointPolicy {
    fn default() -> Self {
        CheckpointPolicy { period: 1 }
    }
}

/// Top-level kernel configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serialize", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serialize", serde(default))]
pub struct KernelConfig {
    /// Simulation ceiling: events scheduled after this time are never
    /// delivered.
    pub max_sim_time: VirtualTime,
    /// Worker threads per node.
    pub num_worker_threads: usize,
    /// Schedule queues per node; workers are spread across them.
    pub num_schedulers: usize,
    pub gvt_period: GvtPeriod,
    pub checkpoint: CheckpointPolicy,
    /// How long an idle worker sleeps before polling again, in
    /// microseconds. Zero just yields.
    pub idle_backoff_micros: u64,
    /// Move each object to the next schedule queue after every event it
    /// executes, balancing load across schedulers.
    pub lp_migration: bool,
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig {
            max_sim_time: VirtualTime::new(1_000),
            num_worker_threads: 2,
            num_schedulers: 1,
            gvt_period: GvtPeriod::default(),
            checkpoint: CheckpointPolicy::default(),
            idle_backoff_micros: 50,
            lp_migration: false,
        }
    }
}

impl KernelConfig {
    pub fn with_max_sim_time(mut self, ticks: u64) -> Self {
        self.max_sim_time = VirtualTime::new(ticks);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.num_worker_threads = workers;
        self
    }

    pub fn with_schedulers(mut self, schedulers: usize) -> Self {
        self.num_schedulers = schedulers;
        self
    }

    pub fn with_gvt_period(mut self, period: GvtPeriod) -> Self {
        self.gvt_period = period;
        self
    }

    pub fn with_checkpoint_period(mut self, period: u32) -> Self {
        self.checkpoint.period = period;
        self
    }

    pub fn with_idle_backoff_micros(mut self, micros: u64) -> Self {
        self.idle_backoff_micros = micros;
        self
    }

    pub fn with_lp_migration(mut self, on: bool) -> Self {
        self.lp_migration = on;
        self
    }

    /// The idle backoff as a `Duration`.
    pub fn idle_backoff(&self) -> Duration {
        Duration::from_micros(self.idle_backoff_micros)
    }

    /// Check every value is usable. Called by the dispatchers at startup.
    pub fn validate(&self) -> KernelResult<()> {
        if self.max_sim_time.is_infinite() {
            return Err(KernelError::InvalidConfig(
                "max_sim_time must be finite".into(),
            ));
        }
        if self.num_worker_threads == 0 {
            return Err(KernelError::InvalidConfig(
                "num_worker_threads must be at least 1".into(),
            ));
        }
        if self.num_schedulers == 0 || self.num_schedulers > self.num_worker_threads {
            return Err(KernelError::InvalidConfig(format!(
                "num_schedulers must be between 1 and num_worker_threads ({}), got {}",
                self.num_worker_threads, self.num_schedulers
            )));
        }
        match self.gvt_period {
            GvtPeriod::Millis(0) | GvtPeriod::Events(0) => {
                return Err(KernelError::InvalidConfig(
                    "gvt_period must be non-zero".into(),
                ));
            }
            _ => {}
        }
        if self.checkpoint.period == 0 {
            return Err(KernelError::InvalidConfig(
                "checkpoint.period must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        KernelConfig::default().validate().unwrap();
    }

    #[test]
    fn test_builders() {
        let config = KernelConfig::default()
            .with_max_sim_time(50)
            .with_workers(4)
            .with_schedulers(2)
            .with_gvt_period(GvtPeriod::Events(100))
            .with_checkpoint_period(8)
            .with_lp_migration(true);
        assert_eq!(config.max_sim_time, VirtualTime::new(50));
        assert!(config.lp_migration);
        assert!(!KernelConfig::default().lp_migration);
        assert_eq!(config.num_worker_threads, 4);
        assert_eq!(config.checkpoint.period, 8);
        config.validate().unwrap();
    }

    #[test]
    fn test_rejects_bad_values() {
        let cases = [
            KernelConfig::default().with_workers(0),
            KernelConfig::default().with_workers(2).with_schedulers(3),
            KernelConfig::default().with_schedulers(0),
            KernelConfig::default().with_checkpoint_period(0),
            KernelConfig::default().with_gvt_period(GvtPeriod::Events(0)),
            KernelConfig {
                max_sim_time: VirtualTime::INFINITY,
                ..KernelConfig::default()
            },
        ];
        for config in cases {
            assert!(
                matches!(config.validate(), Err(KernelError::InvalidConfig(_))),
                "accepted {config:?}"
            );
        }
    }

    #[cfg(feature = "serialize")]
    #[test]
    fn test_json_with_defaults() {
        let config: KernelConfig = serde_json::from_str(
            r#"{ "max_sim_time": 200, "num_worker_threads": 3, "gvt_period": { "events": 64 } }"#,
        )
        .unwrap();
        assert_eq!(config.max_sim_time, VirtualTime::new(200));
        assert_eq!(config.num_worker_threads, 3);
        assert_eq!(config.num_schedulers, 1);
        assert_eq!(config.gvt_period, GvtPeriod::Events(64));
        assert_eq!(config.checkpoint, CheckpointPolicy::default());
    }
}
