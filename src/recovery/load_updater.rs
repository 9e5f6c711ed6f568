use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use super::blocking_call;
use super::DistributedRecoveryScheduler;
use crate::config::EngineConfig;

/// Keeps the master's [`super::TaskStatsMap`] fresh by polling every
/// registered worker.
pub struct TaskLoadUpdater {
    scheduler: Arc<DistributedRecoveryScheduler>,
    period: Duration,
}

impl TaskLoadUpdater {
    pub fn new(scheduler: Arc<DistributedRecoveryScheduler>, config: &EngineConfig) -> Self {
        Self {
            scheduler,
            period: Duration::from_millis(config.load_update_period_ms),
        }
    }

    /// Poll every worker once. Returns how many answered.
    pub async fn update_once(&self) -> usize {
        let mut updated = 0;
        for (worker, client) in self.scheduler.workers() {
            match blocking_call(&worker, client, |c| c.task_stats()).await {
                Ok(stats) => {
                    tracing::debug!("Worker {worker} updated its load: {:.3}", stats.load);
                    self.scheduler.stats().update(worker, stats);
                    updated += 1;
                }
                Err(err) => tracing::info!("Could not poll worker {worker}: {err}"),
            }
        }
        updated
    }

    /// Poll forever on `handle`. A zero period disables polling.
    pub fn spawn(self, handle: &Handle) -> Option<JoinHandle<()>> {
        if self.period.is_zero() {
            return None;
        }
        Some(handle.spawn(async move {
            loop {
                tokio::time::sleep(jittered(self.period)).await;
                self.update_once().await;
            }
        }))
    }
}

/// `period` plus up to a tenth of it, so that workers are not polled
/// in lock-step by several masters.
fn jittered(period: Duration) -> Duration {
    let spread = (period.as_millis() / 10) as u64;
    period + Duration::from_millis(fastrand::u64(0..=spread))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::GroupId;
    use crate::common::WorkerId;
    use crate::errors::Error;
    use crate::errors::Result;
    use crate::recovery::TaskStats;
    use crate::recovery::TaskStatsMap;
    use crate::recovery::WorkerClient;

    struct Fixed(Option<f64>);

    impl WorkerClient for Fixed {
        fn start_recovery(&self) -> Result<bool> {
            Ok(false)
        }

        fn load(&self) -> Result<f64> {
            self.0.ok_or_else(|| Error::Remote {
                worker: "down".into(),
                reason: "unreachable".into(),
            })
        }

        fn task_stats(&self) -> Result<TaskStats> {
            Ok(TaskStats {
                load: self.load()?,
                processors: 2,
                ..Default::default()
            })
        }

        fn remove_groups(&self, _: &[GroupId]) -> Result<Vec<GroupId>> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn jitter_stays_within_a_tenth() {
        let period = Duration::from_millis(1000);
        for _ in 0..100 {
            let d = jittered(period);
            assert!(d >= period && d <= Duration::from_millis(1100), "{d:?}");
        }
    }

    #[tokio::test]
    async fn unreachable_workers_keep_old_stats() {
        let config = EngineConfig::default();
        let scheduler = Arc::new(DistributedRecoveryScheduler::new(
            &config,
            Arc::new(TaskStatsMap::new()),
        ));
        scheduler.register_worker("up".into(), Arc::new(Fixed(Some(0.3))));
        scheduler.register_worker("down".into(), Arc::new(Fixed(None)));
        scheduler.stats().update(
            "down".into(),
            TaskStats {
                load: 0.6,
                ..Default::default()
            },
        );

        let updater = TaskLoadUpdater::new(scheduler.clone(), &config);
        assert_eq!(updater.update_once().await, 1);
        let up = scheduler.stats().get(&WorkerId::from("up")).unwrap();
        assert_eq!((up.load, up.processors), (0.3, 2));
        assert_eq!(scheduler.stats().get(&"down".into()).unwrap().load, 0.6);
    }
}
