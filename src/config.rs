//! Engine configuration.
//!
//! Everything has a default good enough for a single worker. Any
//! value can be overridden with a `GROUPFLOW_*` environment variable,
//! e.g.
//!
//! ```text
//! $ GROUPFLOW_NUM_PROCESSORS=8 GROUPFLOW_CHECKPOINT_PERIOD_MS=0 ./worker
//! ```

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::errors::Error;
use crate::errors::Result;

/// How the periodic rebalance sweep moves load around.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RebalanceStrategy {
    /// First-fit bin packing of groups from overloaded processors.
    FirstFit,
    /// Merge split groups of the same tenant.
    GroupMerge,
}

impl FromStr for RebalanceStrategy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "first_fit" | "firstfit" => Ok(Self::FirstFit),
            "group_merge" | "merge" => Ok(Self::GroupMerge),
            other => Err(Error::Config(format!("unknown rebalance strategy `{other}`"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Event processors started with the engine.
    pub num_processors: usize,
    /// Never shrink below this many processors.
    pub min_processors: usize,
    /// Never grow above this many processors, isolation included.
    pub max_processors: usize,
    /// Weight of a group that did not ask for one.
    pub default_weight: u64,
    /// Longest a group runs before it goes back into the run queue
    /// while still active.
    pub time_slice_ms: u64,
    /// Smoothing factor of the group load EWMA, in `(0, 1]`.
    pub ewma_alpha: f64,
    /// Processor load under which it is considered underloaded.
    pub underload_threshold: f64,
    /// Processor load over which it is considered overloaded.
    pub overload_threshold: f64,
    pub rebalance_strategy: RebalanceStrategy,
    /// `0` disables the rebalance sweep.
    pub rebalance_period_ms: u64,
    /// At most this many group merges per rebalance sweep.
    pub max_merges_per_rebalance: usize,
    /// `0` disables the isolation sweep.
    pub isolation_period_ms: u64,
    /// How long a processor may stay on one group before it is
    /// isolated.
    pub isolation_trigger_ms: u64,
    /// `0` disables periodic checkpoints.
    pub checkpoint_period_ms: u64,
    /// Worker load over which it takes no recovered groups.
    pub worker_overload_threshold: f64,
    /// Groups claimed per pull during distributed recovery.
    pub recovery_unit_size: usize,
    /// How long the master waits for the recovery queue to drain.
    pub recovery_timeout_ms: u64,
    /// How often the master polls worker loads.
    pub load_update_period_ms: u64,
    /// Where checkpoints are kept. `None` keeps them in memory.
    pub checkpoint_db: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            num_processors: 4,
            min_processors: 1,
            max_processors: 16,
            default_weight: 1,
            time_slice_ms: 20,
            ewma_alpha: 0.7,
            underload_threshold: 0.4,
            overload_threshold: 0.8,
            rebalance_strategy: RebalanceStrategy::FirstFit,
            rebalance_period_ms: 1000,
            max_merges_per_rebalance: 1,
            isolation_period_ms: 500,
            isolation_trigger_ms: 2000,
            checkpoint_period_ms: 0,
            worker_overload_threshold: 0.8,
            recovery_unit_size: 2,
            recovery_timeout_ms: 30_000,
            load_update_period_ms: 5000,
            checkpoint_db: None,
        }
    }
}

fn env_var<T: FromStr>(name: &str) -> Result<Option<T>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| Error::Config(format!("unable to parse {name}={raw}"))),
        Err(_) => Ok(None),
    }
}

macro_rules! override_from_env {
    ($conf: ident, $($field: ident => $var: literal),* $(,)?) => {
        $(
            if let Some(value) = env_var($var)? {
                $conf.$field = value;
            }
        )*
    };
}

impl EngineConfig {
    /// Defaults overridden by any `GROUPFLOW_*` variables set.
    pub fn from_env() -> Result<Self> {
        let mut conf = Self::default();
        override_from_env!(conf,
            num_processors => "GROUPFLOW_NUM_PROCESSORS",
            min_processors => "GROUPFLOW_MIN_PROCESSORS",
            max_processors => "GROUPFLOW_MAX_PROCESSORS",
            default_weight => "GROUPFLOW_DEFAULT_WEIGHT",
            time_slice_ms => "GROUPFLOW_TIME_SLICE_MS",
            ewma_alpha => "GROUPFLOW_EWMA_ALPHA",
            underload_threshold => "GROUPFLOW_UNDERLOAD_THRESHOLD",
            overload_threshold => "GROUPFLOW_OVERLOAD_THRESHOLD",
            rebalance_strategy => "GROUPFLOW_REBALANCE_STRATEGY",
            rebalance_period_ms => "GROUPFLOW_REBALANCE_PERIOD_MS",
            max_merges_per_rebalance => "GROUPFLOW_MAX_MERGES_PER_REBALANCE",
            isolation_period_ms => "GROUPFLOW_ISOLATION_PERIOD_MS",
            isolation_trigger_ms => "GROUPFLOW_ISOLATION_TRIGGER_MS",
            checkpoint_period_ms => "GROUPFLOW_CHECKPOINT_PERIOD_MS",
            worker_overload_threshold => "GROUPFLOW_WORKER_OVERLOAD_THRESHOLD",
            recovery_unit_size => "GROUPFLOW_RECOVERY_UNIT_SIZE",
            recovery_timeout_ms => "GROUPFLOW_RECOVERY_TIMEOUT_MS",
            load_update_period_ms => "GROUPFLOW_LOAD_UPDATE_PERIOD_MS",
        );
        if let Some(path) = env_var::<PathBuf>("GROUPFLOW_CHECKPOINT_DB")? {
            conf.checkpoint_db = Some(path);
        }
        conf.validate()?;
        Ok(conf)
    }

    pub fn validate(&self) -> Result<()> {
        if self.min_processors == 0 {
            return Err(Error::Config("min_processors must be > 0".into()));
        }
        if !(self.min_processors..=self.max_processors).contains(&self.num_processors) {
            return Err(Error::Config(format!(
                "num_processors {} is outside [{}, {}]",
                self.num_processors, self.min_processors, self.max_processors
            )));
        }
        if self.default_weight == 0 {
            return Err(Error::Config("default_weight must be > 0".into()));
        }
        if !(self.ewma_alpha > 0.0 && self.ewma_alpha <= 1.0) {
            return Err(Error::Config(format!(
                "ewma_alpha {} is outside (0, 1]",
                self.ewma_alpha
            )));
        }
        if self.underload_threshold >= self.overload_threshold {
            return Err(Error::Config(
                "underload_threshold must be below overload_threshold".into(),
            ));
        }
        if self.recovery_unit_size == 0 {
            return Err(Error::Config("recovery_unit_size must be > 0".into()));
        }
        Ok(())
    }

    /// Load every processor should converge to when merging groups.
    pub(crate) fn merge_target_load(&self) -> f64 {
        (self.underload_threshold + self.overload_threshold) / 2.0
    }

    pub(crate) fn time_slice(&self) -> Duration {
        Duration::from_millis(self.time_slice_ms.max(1))
    }

    pub(crate) fn isolation_trigger(&self) -> Duration {
        Duration::from_millis(self.isolation_trigger_ms)
    }

    pub(crate) fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        EngineConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_inverted_thresholds() {
        let conf = EngineConfig {
            underload_threshold: 0.9,
            overload_threshold: 0.5,
            ..Default::default()
        };
        assert!(matches!(conf.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_pool_outside_bounds() {
        let conf = EngineConfig {
            num_processors: 20,
            max_processors: 8,
            ..Default::default()
        };
        assert!(conf.validate().is_err());
    }

    #[test]
    fn strategy_parses() {
        assert_eq!(
            "first_fit".parse::<RebalanceStrategy>().unwrap(),
            RebalanceStrategy::FirstFit
        );
        assert_eq!(
            "MERGE".parse::<RebalanceStrategy>().unwrap(),
            RebalanceStrategy::GroupMerge
        );
        assert!("round_robin".parse::<RebalanceStrategy>().is_err());
    }

    #[test]
    fn merge_target_is_midpoint() {
        let conf = EngineConfig::default();
        assert!((conf.merge_target_load() - 0.6).abs() < 1e-9);
    }
}
