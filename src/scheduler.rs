//! Schedule engine: cron-driven probe runs with per-schedule exclusivity
//!
//! One background loop scans for due schedules. Each run holds a [`Lease`]
//! from an in-process arena keyed by schedule id; the lease is taken before
//! `Running` is written and released when the run task ends, however it ends.
//! A tick that finds the lease held skips the schedule. Manual "run now"
//! goes through the same arena and is refused while a run is in flight.

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::cron::{CronError, CronExpression};
use crate::events::{Event, RunCompleted, RunSummary, Trigger};
use crate::model::{RunStatus, ScheduleRecord};
use crate::store::{Repository, StoreError};
use crate::tester::{ConnectionTester, TestError, TestMode};

const ABANDONED_SUMMARY: &str = "run abandoned before completion";

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("invalid cron expression: {0}")]
    InvalidCron(#[from] CronError),
    #[error("schedule {0} not found")]
    NotFound(String),
    #[error("application {0} already has a schedule")]
    Conflict(String),
    #[error("schedule {0} is already running")]
    AlreadyRunning(String),
    #[error("scheduler is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// New schedule as submitted by an operator
#[derive(Debug, Clone, Deserialize)]
pub struct NewSchedule {
    pub application_id: String,
    pub cron_expression: String,
    #[serde(default = "default_enabled")]
    pub is_enabled: bool,
}

/// Partial edit; absent fields keep their value
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ScheduleUpdate {
    pub cron_expression: Option<String>,
    pub is_enabled: Option<bool>,
}

fn default_enabled() -> bool {
    true
}

/// What one tick did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    /// Schedule ids whose run was started
    pub started: Vec<String>,
    /// Due schedules skipped because a run was in flight
    pub skipped_busy: usize,
    pub recovered_schedules: usize,
    pub recovered_connections: usize,
}

#[derive(Debug, Clone)]
struct LeaseInfo {
    trigger: Trigger,
    acquired_at: DateTime<Utc>,
}

/// Exclusive hold on one schedule, released on drop
pub struct Lease {
    arena: Arc<DashMap<String, LeaseInfo>>,
    schedule_id: String,
}

impl Lease {
    fn try_acquire(
        arena: &Arc<DashMap<String, LeaseInfo>>,
        schedule_id: &str,
        trigger: Trigger,
        now: DateTime<Utc>,
    ) -> Option<Self> {
        match arena.entry(schedule_id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(LeaseInfo {
                    trigger,
                    acquired_at: now,
                });
                Some(Self {
                    arena: arena.clone(),
                    schedule_id: schedule_id.to_string(),
                })
            }
        }
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.arena.remove(&self.schedule_id);
    }
}

pub struct ScheduleEngine {
    repo: Arc<dyn Repository>,
    tester: Arc<ConnectionTester>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    leases: Arc<DashMap<String, LeaseInfo>>,
    permits: Arc<Semaphore>,
    /// Serializes read-modify-write of schedule rows within this process
    write_lock: Mutex<()>,
    runs: Mutex<JoinSet<()>>,
    shutting_down: AtomicBool,
}

impl ScheduleEngine {
    pub fn new(
        tester: Arc<ConnectionTester>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            repo: tester.repository().clone(),
            permits: Arc::new(Semaphore::new(config.max_concurrent_probes.max(1))),
            tester,
            clock,
            config,
            leases: Arc::new(DashMap::new()),
            write_lock: Mutex::new(()),
            runs: Mutex::new(JoinSet::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// Whether a run currently holds the schedule's lease
    pub fn is_running(&self, schedule_id: &str) -> bool {
        self.leases.contains_key(schedule_id)
    }

    pub fn in_flight(&self) -> usize {
        self.leases.len()
    }

    pub fn create(&self, input: NewSchedule) -> Result<ScheduleRecord, ScheduleError> {
        let cron = CronExpression::parse(&input.cron_expression)?;
        let now = self.clock.now();

        let schedule = ScheduleRecord {
            id: uuid::Uuid::new_v4().to_string(),
            application_id: input.application_id,
            cron_expression: cron.as_str().to_string(),
            is_enabled: input.is_enabled,
            last_run_time: None,
            next_run_time: if input.is_enabled { cron.next_after(now) } else { None },
            last_run_status: None,
            running_since: None,
            last_run_summary: None,
            created_at: now,
            updated_at: now,
        };

        match self.repo.insert_schedule(&schedule) {
            Ok(()) => {}
            Err(StoreError::Conflict(_)) => {
                return Err(ScheduleError::Conflict(schedule.application_id));
            }
            Err(e) => return Err(e.into()),
        }

        info!(
            schedule_id = %schedule.id,
            application_id = %schedule.application_id,
            cron = %schedule.cron_expression,
            "Schedule created"
        );
        Ok(schedule)
    }

    pub fn update(&self, id: &str, update: ScheduleUpdate) -> Result<ScheduleRecord, ScheduleError> {
        // Parse before touching the row so an invalid edit changes nothing
        let cron = update
            .cron_expression
            .as_deref()
            .map(CronExpression::parse)
            .transpose()?;

        let _guard = self.write_lock.lock();
        let mut schedule = self
            .repo
            .get_schedule(id)?
            .ok_or_else(|| ScheduleError::NotFound(id.to_string()))?;

        let cron = match cron {
            Some(cron) => cron,
            None => CronExpression::parse(&schedule.cron_expression)?,
        };
        let now = self.clock.now();

        schedule.cron_expression = cron.as_str().to_string();
        if let Some(enabled) = update.is_enabled {
            schedule.is_enabled = enabled;
        }
        schedule.next_run_time = if schedule.is_enabled {
            cron.next_after(now)
        } else {
            None
        };
        schedule.updated_at = now;

        self.repo.update_schedule(&schedule)?;
        info!(schedule_id = %schedule.id, enabled = schedule.is_enabled, "Schedule updated");
        Ok(schedule)
    }

    pub fn delete(&self, id: &str) -> Result<(), ScheduleError> {
        let _guard = self.write_lock.lock();
        if !self.repo.delete_schedule(id)? {
            return Err(ScheduleError::NotFound(id.to_string()));
        }
        info!(schedule_id = id, "Schedule deleted");
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<ScheduleRecord, ScheduleError> {
        self.repo
            .get_schedule(id)?
            .ok_or_else(|| ScheduleError::NotFound(id.to_string()))
    }

    pub fn get_for_application(&self, application_id: &str) -> Result<Option<ScheduleRecord>, ScheduleError> {
        Ok(self.repo.get_schedule_for_application(application_id)?)
    }

    /// Recover stale state, then start every due schedule whose lease is free
    pub fn tick(self: &Arc<Self>) -> Result<TickReport, ScheduleError> {
        self.reap_finished();

        let mut report = TickReport {
            recovered_schedules: self.recover_stale_runs()?,
            ..TickReport::default()
        };
        report.recovered_connections = self.tester.recover_stale_tests(self.config.stale_after())?;

        if self.shutting_down.load(Ordering::SeqCst) {
            return Ok(report);
        }

        let now = self.clock.now();
        for due in self.repo.list_due_schedules(now)? {
            let Some(lease) = Lease::try_acquire(&self.leases, &due.id, Trigger::Scheduled, now) else {
                debug!(schedule_id = %due.id, "Previous run still in flight, skipping");
                report.skipped_busy += 1;
                continue;
            };

            // Re-read under the lease: another tick may have run it already
            match self.mark_running(&due.id, now, |s| s.is_due(now))? {
                Some(schedule) => {
                    self.spawn_run(lease, schedule, Trigger::Scheduled);
                    report.started.push(due.id);
                }
                None => report.skipped_busy += 1,
            }
        }

        Ok(report)
    }

    /// Start a run immediately, outside the cron cadence
    pub fn run_now(self: &Arc<Self>, id: &str) -> Result<ScheduleRecord, ScheduleError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(ScheduleError::ShuttingDown);
        }
        if self.repo.get_schedule(id)?.is_none() {
            return Err(ScheduleError::NotFound(id.to_string()));
        }

        let now = self.clock.now();
        let lease = Lease::try_acquire(&self.leases, id, Trigger::RunNow, now)
            .ok_or_else(|| ScheduleError::AlreadyRunning(id.to_string()))?;

        let schedule = self
            .mark_running(id, now, |_| true)?
            .ok_or_else(|| ScheduleError::AlreadyRunning(id.to_string()))?;

        info!(schedule_id = id, "Manual run started");
        self.spawn_run(lease, schedule.clone(), Trigger::RunNow);
        Ok(schedule)
    }

    /// Poll until shutdown, then give in-flight runs the grace period
    pub async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.poll_interval_secs,
            max_concurrent_probes = self.config.max_concurrent_probes,
            "Scheduler started"
        );

        loop {
            // Ticks hit the repository synchronously; keep them off the async workers
            let engine = self.clone();
            match tokio::task::spawn_blocking(move || engine.tick()).await {
                Ok(Ok(report)) if !report.started.is_empty() => {
                    debug!(started = report.started.len(), "Scheduler tick started runs");
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!(error = %e, "Scheduler tick failed"),
                Err(e) => error!(error = %e, "Scheduler tick panicked"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval()) => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Scheduler shutting down");
                        break;
                    }
                }
            }
        }

        let abandoned = self.shutdown(self.config.shutdown_grace()).await;
        if abandoned > 0 {
            warn!(abandoned, "Scheduled runs abandoned at shutdown");
        }
    }

    /// Refuse new runs and wait up to `grace` for in-flight ones
    ///
    /// Returns how many runs were aborted. Their schedules stay `Running`
    /// until stale recovery resets them.
    pub async fn shutdown(&self, grace: Duration) -> usize {
        self.shutting_down.store(true, Ordering::SeqCst);
        self.drain(grace).await
    }

    /// Wait up to `grace` for in-flight runs, aborting whatever is left
    pub async fn drain(&self, grace: Duration) -> usize {
        let mut runs = std::mem::take(&mut *self.runs.lock());
        let finished = tokio::time::timeout(grace, async {
            while runs.join_next().await.is_some() {}
        })
        .await;

        if finished.is_ok() {
            return 0;
        }

        let abandoned = runs.len();
        runs.abort_all();
        while runs.join_next().await.is_some() {}
        abandoned
    }

    fn reap_finished(&self) {
        let mut runs = self.runs.lock();
        while let Some(result) = runs.try_join_next() {
            if let Err(e) = result {
                if e.is_panic() {
                    error!(error = %e, "Scheduled run panicked");
                }
            }
        }
    }

    /// Write `Running` if the fresh row still passes `eligible`
    fn mark_running(
        &self,
        id: &str,
        now: DateTime<Utc>,
        eligible: impl Fn(&ScheduleRecord) -> bool,
    ) -> Result<Option<ScheduleRecord>, ScheduleError> {
        let _guard = self.write_lock.lock();
        let Some(mut schedule) = self.repo.get_schedule(id)? else {
            return Ok(None);
        };
        if schedule.is_running() || !eligible(&schedule) {
            return Ok(None);
        }

        schedule.last_run_status = Some(RunStatus::Running);
        schedule.running_since = Some(now);
        schedule.updated_at = now;
        self.repo.update_schedule(&schedule)?;
        Ok(Some(schedule))
    }

    fn spawn_run(self: &Arc<Self>, lease: Lease, schedule: ScheduleRecord, trigger: Trigger) {
        let engine = Arc::clone(self);
        self.runs.lock().spawn(async move {
            engine.execute(&schedule, trigger).await;
            drop(lease);
        });
    }

    async fn execute(&self, schedule: &ScheduleRecord, trigger: Trigger) {
        let started_at = self.clock.now();

        let (summary, status) = match self.tester.active_connections(&schedule.application_id) {
            Ok(connections) => {
                let summary = self.probe_all(schedule, trigger, &connections).await;
                (summary.to_string(), Some(summary))
            }
            Err(e) => {
                error!(schedule_id = %schedule.id, error = %e, "Could not load connections for run");
                (format!("could not load connections: {}", e), None)
            }
        };

        let run_status = status.map(|s| s.status()).unwrap_or(RunStatus::Failed);
        if let Err(e) = self.finish(schedule, run_status, summary) {
            error!(schedule_id = %schedule.id, error = %e, "Failed to record run completion");
        }

        info!(
            schedule_id = %schedule.id,
            application_id = %schedule.application_id,
            status = run_status.as_str(),
            "Scheduled run finished"
        );

        self.tester.events().publish(Event::RunCompleted(RunCompleted {
            schedule_id: schedule.id.clone(),
            application_id: schedule.application_id.clone(),
            trigger,
            status: run_status,
            summary: status.unwrap_or_default(),
            started_at,
            finished_at: self.clock.now(),
        }));
    }

    async fn probe_all(
        &self,
        schedule: &ScheduleRecord,
        trigger: Trigger,
        connections: &[crate::model::ConnectionRecord],
    ) -> RunSummary {
        let probes = connections.iter().map(|connection| {
            let mode = TestMode::Scheduled {
                schedule_id: schedule.id.clone(),
                trigger,
            };
            async move {
                let Ok(_permit) = self.permits.acquire().await else {
                    return Err(TestError::Unsupported("worker pool closed".to_string()));
                };
                self.tester.test_record(&connection.id, mode).await
            }
        });

        let mut summary = RunSummary::default();
        for (connection, outcome) in connections.iter().zip(join_all(probes).await) {
            match outcome {
                Ok(result) if result.success => summary.connected += 1,
                Ok(_) => summary.failed += 1,
                Err(TestError::Unsupported(_)) => summary.skipped += 1,
                Err(e) => {
                    warn!(connection_id = %connection.id, error = %e, "Connection test did not complete");
                    summary.failed += 1;
                }
            }
        }
        summary
    }

    fn finish(&self, started: &ScheduleRecord, status: RunStatus, summary: String) -> Result<(), ScheduleError> {
        let _guard = self.write_lock.lock();
        let Some(mut schedule) = self.repo.get_schedule(&started.id)? else {
            debug!(schedule_id = %started.id, "Schedule deleted during run");
            return Ok(());
        };

        let now = self.clock.now();
        schedule.last_run_time = Some(now);
        schedule.last_run_status = Some(status);
        schedule.running_since = None;
        schedule.last_run_summary = Some(summary);
        schedule.next_run_time = self.next_run(&schedule, now);
        schedule.updated_at = now;
        self.repo.update_schedule(&schedule)?;
        Ok(())
    }

    fn next_run(&self, schedule: &ScheduleRecord, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !schedule.is_enabled {
            return None;
        }
        match CronExpression::parse(&schedule.cron_expression) {
            Ok(cron) => cron.next_after(now),
            Err(e) => {
                // Only reachable if the row was edited outside the engine
                error!(schedule_id = %schedule.id, error = %e, "Stored cron expression is invalid");
                None
            }
        }
    }

    /// Reset `Running` schedules that no live lease backs and that are older
    /// than the stale threshold
    fn recover_stale_runs(&self) -> Result<usize, ScheduleError> {
        let now = self.clock.now();
        let cutoff = now - self.config.stale_after();
        let mut recovered = 0;

        for running in self.repo.list_running_schedules()? {
            if let Some(lease) = self.leases.get(&running.id) {
                debug!(
                    schedule_id = %running.id,
                    trigger = ?lease.trigger,
                    since = %lease.acquired_at,
                    "Run in flight"
                );
                continue;
            }

            let since = running
                .running_since
                .or(running.last_run_time)
                .unwrap_or(running.updated_at);
            if since > cutoff {
                continue;
            }

            let _guard = self.write_lock.lock();
            let Some(mut schedule) = self.repo.get_schedule(&running.id)? else {
                continue;
            };
            if !schedule.is_running() || self.leases.contains_key(&schedule.id) {
                continue;
            }

            warn!(schedule_id = %schedule.id, since = %since, "Resetting stale Running schedule");
            schedule.last_run_status = Some(RunStatus::Failed);
            schedule.running_since = None;
            schedule.last_run_summary = Some(ABANDONED_SUMMARY.to_string());
            schedule.next_run_time = self.next_run(&schedule, now);
            schedule.updated_at = now;
            self.repo.update_schedule(&schedule)?;
            recovered += 1;
        }

        Ok(recovered)
    }
}
