use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use agri_core::{CycleResult, Dataset};
use anyhow::{bail, Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

use crate::CycleRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleMode {
    Once,
    Interval(Duration),
    /// Daily at `hour:minute` UTC.
    Daily { hour: u32, minute: u32 },
}

impl Default for ScheduleMode {
    fn default() -> Self {
        ScheduleMode::Interval(Duration::from_secs(6 * 60 * 60))
    }
}

impl ScheduleMode {
    pub fn interval_secs(secs: u64) -> Result<Self> {
        if secs == 0 {
            bail!("interval must be at least one second");
        }
        Ok(ScheduleMode::Interval(Duration::from_secs(secs)))
    }

    /// Parses `HH:MM` (24h, UTC).
    pub fn daily(raw: &str) -> Result<Self> {
        let (h, m) = raw
            .trim()
            .split_once(':')
            .with_context(|| format!("daily time `{raw}` is not HH:MM"))?;
        let hour: u32 = h.parse().with_context(|| format!("bad hour in `{raw}`"))?;
        let minute: u32 = m.parse().with_context(|| format!("bad minute in `{raw}`"))?;
        if hour > 23 || minute > 59 {
            bail!("daily time `{raw}` is out of range");
        }
        Ok(ScheduleMode::Daily { hour, minute })
    }

    /// Six-field cron expression for daily runs.
    pub fn cron(&self) -> Option<String> {
        match self {
            ScheduleMode::Daily { hour, minute } => Some(format!("0 {minute} {hour} * * *")),
            _ => None,
        }
    }
}

impl FromStr for ScheduleMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "once" => Ok(ScheduleMode::Once),
            other if other.contains(':') => ScheduleMode::daily(other),
            other => {
                let secs = other
                    .parse()
                    .with_context(|| format!("`{other}` is neither `once`, seconds nor HH:MM"))?;
                ScheduleMode::interval_secs(secs)
            }
        }
    }
}

impl fmt::Display for ScheduleMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleMode::Once => f.write_str("once"),
            ScheduleMode::Interval(d) => write!(f, "every {}s", d.as_secs()),
            ScheduleMode::Daily { hour, minute } => write!(f, "daily at {hour:02}:{minute:02} UTC"),
        }
    }
}

/// Drives [`CycleRunner`] on a timer, one dataset after another per tick.
///
/// A tick that finds a cycle already running (from a previous tick or any other
/// trigger sharing the runner) is skipped.
pub struct Scheduler {
    runner: Arc<CycleRunner>,
    datasets: Vec<Dataset>,
    mode: ScheduleMode,
}

impl Scheduler {
    pub fn new(runner: Arc<CycleRunner>, datasets: Vec<Dataset>, mode: ScheduleMode) -> Self {
        Self {
            runner,
            datasets,
            mode,
        }
    }

    /// One tick. Returns `None` when a cycle is already running.
    pub async fn tick(&self) -> Option<Vec<CycleResult>> {
        tick(&self.runner, &self.datasets).await
    }

    fn job(&self) -> Result<Job> {
        let runner = self.runner.clone();
        let datasets = self.datasets.clone();
        let run = move |_id: uuid::Uuid, _sched: JobScheduler| {
            let runner = runner.clone();
            let datasets = datasets.clone();
            Box::pin(async move {
                tick(&runner, &datasets).await;
            }) as std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>>
        };

        match self.mode {
            ScheduleMode::Interval(every) => {
                Job::new_repeated_async(every, run).context("creating interval job")
            }
            ScheduleMode::Daily { .. } => {
                let cron = self.mode.cron().unwrap_or_default();
                Job::new_async(cron.as_str(), run)
                    .with_context(|| format!("creating scheduler job for cron {cron}"))
            }
            ScheduleMode::Once => bail!("a one-shot schedule has no recurring job"),
        }
    }

    /// Runs an initial tick, then (unless `Once`) keeps ticking until Ctrl-C.
    ///
    /// Returns the results of the initial tick.
    pub async fn run_until_shutdown(self) -> Result<Vec<CycleResult>> {
        info!(mode = %self.mode, datasets = ?self.datasets, "scheduler starting");
        let initial = self.tick().await.unwrap_or_default();
        if self.mode == ScheduleMode::Once {
            return Ok(initial);
        }

        let mut sched = JobScheduler::new().await.context("creating scheduler")?;
        sched.add(self.job()?).await.context("adding scheduler job")?;
        sched.start().await.context("starting scheduler")?;

        tokio::signal::ctrl_c()
            .await
            .context("waiting for shutdown signal")?;
        info!("shutdown signal received; stopping scheduler");
        sched.shutdown().await.context("stopping scheduler")?;
        Ok(initial)
    }
}

async fn tick(runner: &CycleRunner, datasets: &[Dataset]) -> Option<Vec<CycleResult>> {
    let Some(permit) = runner.try_acquire() else {
        warn!("previous cycle still running; skipping this tick");
        return None;
    };
    Some(permit.run_datasets(datasets).await)
}

#[cfg(test)]
mod tests {
    use agri_core::CycleStatus;
    use agri_store::{MemoryStore, StoreConnector};

    use super::*;
    use crate::test_support::*;

    fn runner() -> Arc<CycleRunner> {
        let runner = CycleRunner::new(StoreConnector::Memory(MemoryStore::new())).with_source(
            Dataset::Schemes,
            Box::new(ScriptedSource::new(vec![Some(vec![scheme_record(
                "PM Kisan",
                "2026-03-01",
            )])])),
        );
        Arc::new(runner)
    }

    fn scheduler(mode: ScheduleMode) -> Scheduler {
        Scheduler::new(runner(), vec![Dataset::Schemes], mode)
    }

    #[test]
    fn schedule_modes_parse() {
        assert_eq!("once".parse::<ScheduleMode>().unwrap(), ScheduleMode::Once);
        assert_eq!(
            "3600".parse::<ScheduleMode>().unwrap(),
            ScheduleMode::Interval(Duration::from_secs(3600))
        );
        assert_eq!(
            "06:30".parse::<ScheduleMode>().unwrap(),
            ScheduleMode::Daily { hour: 6, minute: 30 }
        );
        assert!("24:00".parse::<ScheduleMode>().is_err());
        assert!("0".parse::<ScheduleMode>().is_err());
        assert!("soon".parse::<ScheduleMode>().is_err());
        assert_eq!(
            ScheduleMode::default(),
            ScheduleMode::Interval(Duration::from_secs(21_600))
        );
        assert_eq!(
            ScheduleMode::Daily { hour: 6, minute: 5 }.cron().as_deref(),
            Some("0 5 6 * * *")
        );
    }

    #[tokio::test]
    async fn tick_is_skipped_while_a_cycle_runs() {
        let runner = runner();
        let sched = Scheduler::new(runner.clone(), vec![Dataset::Schemes], ScheduleMode::Once);
        let held = runner.try_acquire().unwrap();
        assert!(sched.tick().await.is_none());
        drop(held);

        let results = sched.tick().await.expect("tick runs once the runner is free");
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].status, CycleStatus::Success);
        assert!(!runner.is_running());
    }

    #[tokio::test]
    async fn once_mode_returns_initial_results() {
        let results = scheduler(ScheduleMode::Once).run_until_shutdown().await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].inserted_count, 1);
    }

    #[tokio::test]
    async fn recurring_jobs_build() {
        assert!(scheduler(ScheduleMode::Daily { hour: 6, minute: 0 }).job().is_ok());
        assert!(scheduler(ScheduleMode::Interval(Duration::from_secs(60))).job().is_ok());
        assert!(scheduler(ScheduleMode::Once).job().is_err());
    }
}
