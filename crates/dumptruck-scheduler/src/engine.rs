//! Scheduler Engine: the main loop that waits for ticks and fires the job.
//! Sleeps in short slices against the wall clock, so a suspended host or a
//! clock jump never makes it oversleep by more than one slice.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dumptruck_core::error::{DumptruckError, Result};

use crate::cancel::CancelToken;
use crate::persistence::RunHistory;
use crate::tasks::{Job, RunKind, RunReport, RunState, new_run_id};
use crate::trigger::TaskTrigger;

/// Longest single sleep before re-reading the clock.
const MAX_SLEEP: Duration = Duration::from_secs(60);

/// The scheduler engine: owns the job, its trigger and the run history.
pub struct SchedulerEngine {
    job: Arc<Job>,
    trigger: TaskTrigger,
    history: Option<RunHistory>,
}

impl SchedulerEngine {
    pub fn new(trigger: TaskTrigger) -> Self {
        let job = Arc::new(trigger.job().clone());
        Self {
            job,
            trigger,
            history: None,
        }
    }

    /// Record every run in `history`.
    pub fn with_history(mut self, history: RunHistory) -> Self {
        self.history = Some(history);
        self
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn history(&self) -> Option<&RunHistory> {
        self.history.as_ref()
    }

    /// The first tick to wait for, given the wall clock and recorded history.
    pub fn first_tick(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let last = if self.job.catchup {
            self.history
                .as_ref()
                .and_then(|h| h.last_scheduled_date(&self.job.id).ok().flatten())
        } else {
            None
        };
        self.job.first_tick(now, last)
    }

    /// Run the job once for `logical_date` and record the outcome.
    /// Never fails: template errors become a failed report with zero attempts.
    pub async fn run_once(
        &mut self,
        logical_date: DateTime<Utc>,
        kind: RunKind,
        cancel: &CancelToken,
    ) -> RunReport {
        let run_id = new_run_id(kind, logical_date);
        let report = match self.blocked_by_past(kind) {
            Some(reason) => {
                tracing::warn!("⏭️ Skipping {run_id} of '{}': {reason}", self.job.id);
                self.unlaunched(run_id, logical_date, kind, RunState::Skipped(reason))
            }
            None => match self.trigger.fire_as(run_id.clone(), logical_date, kind, cancel).await {
                Ok(report) => report,
                Err(e) => self.unlaunched(run_id, logical_date, kind, RunState::Failed(e.to_string())),
            },
        };

        if let Some(history) = &self.history {
            if let Err(e) = history.record(&report) {
                tracing::warn!("⚠️ Failed to record run {}: {e}", report.run_id);
            }
        }
        report
    }

    /// A run that ended before any attempt.
    fn unlaunched(
        &self,
        run_id: String,
        logical_date: DateTime<Utc>,
        kind: RunKind,
        state: RunState,
    ) -> RunReport {
        let now = Utc::now();
        RunReport {
            run_id,
            job_id: self.job.id.clone(),
            kind,
            logical_date,
            state,
            attempts: 0,
            started_at: now,
            finished_at: Some(now),
        }
    }

    /// `depends_on_past`: the reason to skip, if the latest run that was not
    /// itself skipped did not succeed. Manual runs are never blocked.
    fn blocked_by_past(&self, kind: RunKind) -> Option<String> {
        if !self.job.depends_on_past || kind == RunKind::Manual {
            return None;
        }
        let history = self.history.as_ref()?;
        match history.last_settled_run(&self.job.id) {
            Ok(Some(last)) if last.state != RunState::Success => Some(format!(
                "previous run {} ended {}",
                last.run_id,
                last.state.label()
            )),
            Ok(_) => None,
            Err(e) => {
                tracing::warn!("⚠️ Could not read run history: {e}");
                None
            }
        }
    }

    /// Wait for ticks and fire the job until `shutdown` is cancelled.
    pub async fn run_forever(&mut self, shutdown: CancelToken) -> Result<()> {
        let mut next = self.first_tick(Utc::now()).ok_or_else(|| {
            DumptruckError::Config(format!("schedule '{}' never fires", self.job.schedule))
        })?;
        tracing::info!(
            "⏰ Scheduler started for '{}' ({}), next run at {next}",
            self.job.id,
            self.job.schedule
        );

        loop {
            if !sleep_until(next, &shutdown).await {
                tracing::info!("👋 Scheduler stopped");
                return Ok(());
            }

            let report = self.run_once(next, RunKind::Scheduled, &shutdown).await;
            if report.state == RunState::Cancelled && shutdown.is_cancelled() {
                tracing::info!("👋 Scheduler stopped during run {}", report.run_id);
                return Ok(());
            }

            next = match self.job.following_tick(next, Utc::now()) {
                Some(t) => t,
                None => {
                    tracing::warn!("⚠️ Schedule '{}' has no further ticks", self.job.schedule);
                    return Ok(());
                }
            };
            tracing::info!("📅 Next run of '{}' at {next}", self.job.id);
        }
    }
}

/// Sleep until `deadline`; false if cancelled first.
async fn sleep_until(deadline: DateTime<Utc>, cancel: &CancelToken) -> bool {
    loop {
        if cancel.is_cancelled() {
            return false;
        }
        let remaining = match (deadline - Utc::now()).to_std() {
            Ok(d) if !d.is_zero() => d,
            _ => return true,
        };
        tokio::select! {
            _ = tokio::time::sleep(remaining.min(MAX_SLEEP)) => {}
            _ = cancel.cancelled() => return false,
        }
    }
}
