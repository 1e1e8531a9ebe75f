//! Task trigger: one scheduled run of a job, end to end.
//!
//! Resolve templates against the variable store, launch the container, retry
//! launch/execution failures with a fixed delay, and report the outcome.
//! Nothing is kept between runs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dumptruck_core::error::Result;
use tokio::sync::Mutex;

use crate::cancel::CancelToken;
use crate::notify::{NotifyPriority, NotifyRouter};
use crate::runner::{AttemptContext, AttemptOutcome, ContainerRuntime};
use crate::tasks::{Job, RunKind, RunReport, RunState, new_run_id};
use crate::template::TemplateContext;
use crate::variables::VariableStore;

/// Fires a job's task against injected variables and runtime.
pub struct TaskTrigger {
    job: Arc<Job>,
    vars: Arc<dyn VariableStore>,
    runtime: Arc<dyn ContainerRuntime>,
    notifier: Option<Arc<Mutex<NotifyRouter>>>,
}

impl TaskTrigger {
    pub fn new(
        job: Arc<Job>,
        vars: Arc<dyn VariableStore>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            job,
            vars,
            runtime,
            notifier: None,
        }
    }

    /// Route retry/failure notifications through `router` (subject to the
    /// job's notify policy).
    pub fn with_notifier(mut self, router: Arc<Mutex<NotifyRouter>>) -> Self {
        self.notifier = Some(router);
        self
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Run the task for `logical_date` under a fresh run id.
    ///
    /// Template errors (`UnresolvedVariable`, `Template`) are returned as
    /// `Err` before anything is launched. Every other outcome, including
    /// exhausted retries, comes back as a [`RunReport`].
    pub async fn fire(
        &self,
        logical_date: DateTime<Utc>,
        kind: RunKind,
        cancel: &CancelToken,
    ) -> Result<RunReport> {
        self.fire_as(new_run_id(kind, logical_date), logical_date, kind, cancel)
            .await
    }

    /// [`fire`](Self::fire) with a caller-chosen run id.
    pub async fn fire_as(
        &self,
        run_id: String,
        logical_date: DateTime<Utc>,
        kind: RunKind,
        cancel: &CancelToken,
    ) -> Result<RunReport> {
        let job = &self.job;
        let started_at = Utc::now();
        tracing::info!("🔔 Run {run_id} of '{}' (logical date {logical_date})", job.id);

        let ctx = TemplateContext {
            vars: self.vars.as_ref(),
            logical_date,
            run_id: &run_id,
        };
        let resolved = match job.task.resolve(&ctx) {
            Ok(resolved) => resolved,
            Err(e) => {
                tracing::error!("❌ Run {run_id} of '{}' cannot start: {e}", job.id);
                if job.notify.on_failure {
                    self.notify(
                        &format!("{} failed", job.id),
                        &format!("Run {run_id} could not start: {e}"),
                        NotifyPriority::Urgent,
                    )
                    .await;
                }
                return Err(e);
            }
        };

        let policy = job.retry;
        let max_attempts = policy.max_attempts();
        let mut attempts = 0;

        let state = loop {
            if cancel.is_cancelled() {
                break RunState::Cancelled;
            }
            attempts += 1;
            let attempt = AttemptContext {
                container_name: format!("{}-{}-try{}", resolved.task_id, run_id, attempts),
                attempt: attempts,
                timeout: policy.execution_timeout,
            };
            tracing::info!(
                "🚀 Attempt {attempts}/{max_attempts}: {} {}",
                resolved.image,
                resolved.redacted_args()
            );

            match self.runtime.run(&resolved, &attempt, cancel).await {
                Ok(AttemptOutcome::Succeeded) => break RunState::Success,
                Ok(AttemptOutcome::Cancelled) => break RunState::Cancelled,
                Err(e) if e.is_retryable() && attempts < max_attempts => {
                    let reason = resolved.redactor.redact(&e.to_string());
                    tracing::warn!(
                        "⚠️ Attempt {attempts}/{max_attempts} of {run_id} failed: {reason}; retrying in {}s",
                        policy.retry_delay.as_secs()
                    );
                    if job.notify.on_retry {
                        self.notify(
                            &format!("Retrying {}", job.id),
                            &format!("Attempt {attempts}/{max_attempts} of {run_id} failed: {reason}"),
                            NotifyPriority::Normal,
                        )
                        .await;
                    }
                    tokio::select! {
                        _ = tokio::time::sleep(policy.retry_delay) => {}
                        _ = cancel.cancelled() => break RunState::Cancelled,
                    }
                }
                Err(e) => break RunState::Failed(resolved.redactor.redact(&e.to_string())),
            }
        };

        let finished_at = Utc::now();
        match &state {
            RunState::Success => {
                tracing::info!("✅ Run {run_id} succeeded after {attempts} attempt(s)");
            }
            RunState::Cancelled => tracing::warn!("🛑 Run {run_id} cancelled"),
            RunState::Failed(reason) => {
                tracing::error!("❌ Run {run_id} failed after {attempts} attempt(s): {reason}");
                if job.notify.on_failure {
                    self.notify(
                        &format!("{} failed", job.id),
                        &format!("Run {run_id} failed after {attempts} attempt(s): {reason}"),
                        NotifyPriority::Urgent,
                    )
                    .await;
                }
            }
            RunState::Running | RunState::Skipped(_) => {}
        }

        Ok(RunReport {
            run_id,
            job_id: job.id.clone(),
            kind,
            logical_date,
            state,
            attempts,
            started_at,
            finished_at: Some(finished_at),
        })
    }

    async fn notify(&self, title: &str, body: &str, priority: NotifyPriority) {
        if let Some(router) = &self.notifier {
            let notification = NotifyRouter::create(title, body, &self.job.id, priority);
            router.lock().await.send(notification).await;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::dispatch::NotifyTarget;
    use crate::tasks::ResolvedInvocation;
    use crate::variables::MemoryVariables;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use dumptruck_core::config::JobConfig;
    use dumptruck_core::error::DumptruckError;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    /// Scripted runtime: pops one result per attempt, succeeds once the
    /// script runs out.
    pub(crate) struct ScriptedRuntime {
        script: StdMutex<Vec<Result<AttemptOutcome>>>,
        pub(crate) calls: StdMutex<Vec<AttemptContext>>,
        pub(crate) seen_args: StdMutex<Vec<Vec<String>>>,
    }

    impl ScriptedRuntime {
        pub(crate) fn new(mut script: Vec<Result<AttemptOutcome>>) -> Self {
            script.reverse();
            Self {
                script: StdMutex::new(script),
                calls: StdMutex::new(Vec::new()),
                seen_args: StdMutex::new(Vec::new()),
            }
        }

        pub(crate) fn failing(times: usize) -> Self {
            Self::new((0..times).map(|_| Err(exit(1))).collect())
        }

        pub(crate) fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ContainerRuntime for ScriptedRuntime {
        async fn run(
            &self,
            invocation: &ResolvedInvocation,
            attempt: &AttemptContext,
            _cancel: &CancelToken,
        ) -> Result<AttemptOutcome> {
            self.calls.lock().unwrap().push(attempt.clone());
            self.seen_args.lock().unwrap().push(invocation.args.clone());
            self.script.lock().unwrap().pop().unwrap_or(Ok(AttemptOutcome::Succeeded))
        }
    }

    /// Runtime that blocks until cancelled.
    struct HangingRuntime;

    #[async_trait]
    impl ContainerRuntime for HangingRuntime {
        async fn run(
            &self,
            _invocation: &ResolvedInvocation,
            _attempt: &AttemptContext,
            cancel: &CancelToken,
        ) -> Result<AttemptOutcome> {
            cancel.cancelled().await;
            Ok(AttemptOutcome::Cancelled)
        }
    }

    pub(crate) fn exit(code: i32) -> DumptruckError {
        DumptruckError::ProcessExecutionFailure {
            code,
            detail: "pg_dump: connection refused".into(),
        }
    }

    pub(crate) fn backup_vars() -> MemoryVariables {
        MemoryVariables::new()
            .with("s3_backup_bucket", "acme-backups")
            .with("pg_host", "db.internal")
            .with("pg_database", "orders")
            .with("pg_user", "backup")
            .with("pg_password", "hunter2")
            .with("aws_access_key_id", "AKIAEXAMPLE")
            .with("aws_secret_access_key", "wJalrXUtnFEMI")
    }

    /// The default job with retries kept but without the 5 minute wait.
    pub(crate) fn fast_job(retries: u32) -> Arc<Job> {
        let mut config = JobConfig::default();
        config.default_args.retries = retries;
        config.default_args.retry_delay = 0;
        Arc::new(Job::from_config(&config).unwrap())
    }

    fn logical() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 2, 22, 2, 0, 0).unwrap()
    }

    #[tokio::test]
    async fn test_success_first_try() {
        let runtime = Arc::new(ScriptedRuntime::new(vec![]));
        let trigger = TaskTrigger::new(fast_job(2), Arc::new(backup_vars()), runtime.clone());
        let report = trigger.fire(logical(), RunKind::Scheduled, &CancelToken::new()).await.unwrap();

        assert_eq!(report.state, RunState::Success);
        assert_eq!(report.attempts, 1);
        assert_eq!(runtime.call_count(), 1);
        assert_eq!(report.job_id, "pg_s3_backup");
        assert!(report.finished_at.is_some());
    }

    #[tokio::test]
    async fn test_two_failures_then_success() {
        let runtime = Arc::new(ScriptedRuntime::failing(2));
        let trigger = TaskTrigger::new(fast_job(2), Arc::new(backup_vars()), runtime.clone());
        let report = trigger.fire(logical(), RunKind::Scheduled, &CancelToken::new()).await.unwrap();

        assert_eq!(report.state, RunState::Success);
        assert_eq!(report.attempts, 3);
        let attempts: Vec<u32> = runtime.calls.lock().unwrap().iter().map(|c| c.attempt).collect();
        assert_eq!(attempts, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_always_failing_attempts_exactly_three_times() {
        let runtime = Arc::new(ScriptedRuntime::failing(10));
        let trigger = TaskTrigger::new(fast_job(2), Arc::new(backup_vars()), runtime.clone());
        let report = trigger.fire(logical(), RunKind::Scheduled, &CancelToken::new()).await.unwrap();

        assert!(matches!(report.state, RunState::Failed(_)));
        assert_eq!(report.attempts, 3);
        assert_eq!(runtime.call_count(), 3);
    }

    #[tokio::test]
    async fn test_launch_failures_are_retried() {
        let runtime = Arc::new(ScriptedRuntime::new(vec![Err(DumptruckError::ProcessLaunchFailure(
            "Cannot connect to the Docker daemon".into(),
        ))]));
        let trigger = TaskTrigger::new(fast_job(2), Arc::new(backup_vars()), runtime.clone());
        let report = trigger.fire(logical(), RunKind::Manual, &CancelToken::new()).await.unwrap();
        assert_eq!(report.state, RunState::Success);
        assert_eq!(report.attempts, 2);
    }

    #[tokio::test]
    async fn test_zero_retries_fails_once() {
        let runtime = Arc::new(ScriptedRuntime::failing(1));
        let trigger = TaskTrigger::new(fast_job(0), Arc::new(backup_vars()), runtime.clone());
        let report = trigger.fire(logical(), RunKind::Scheduled, &CancelToken::new()).await.unwrap();
        assert!(matches!(report.state, RunState::Failed(_)));
        assert_eq!(runtime.call_count(), 1);
    }

    #[tokio::test]
    async fn test_missing_pg_host_never_launches() {
        let runtime = Arc::new(ScriptedRuntime::new(vec![]));
        let vars = MemoryVariables::new()
            .with("s3_backup_bucket", "acme-backups")
            .with("pg_database", "orders")
            .with("pg_user", "backup")
            .with("pg_password", "hunter2")
            .with("aws_access_key_id", "AKIAEXAMPLE")
            .with("aws_secret_access_key", "wJalrXUtnFEMI");
        let trigger = TaskTrigger::new(fast_job(2), Arc::new(vars), runtime.clone());

        let err = trigger.fire(logical(), RunKind::Scheduled, &CancelToken::new()).await.unwrap_err();
        assert!(matches!(err, DumptruckError::UnresolvedVariable(k) if k == "pg_host"));
        assert_eq!(runtime.call_count(), 0);
    }

    #[tokio::test]
    async fn test_optional_keys_default() {
        let runtime = Arc::new(ScriptedRuntime::new(vec![]));
        let trigger = TaskTrigger::new(fast_job(2), Arc::new(backup_vars()), runtime.clone());
        trigger.fire(logical(), RunKind::Scheduled, &CancelToken::new()).await.unwrap();

        let args = runtime.seen_args.lock().unwrap()[0].clone();
        let flag = |name: &str| {
            let i = args.iter().position(|a| a == name).unwrap();
            args[i + 1].clone()
        };
        assert_eq!(flag("--port"), "5432");
        assert_eq!(flag("--prefix"), "backups/");
    }

    #[tokio::test]
    async fn test_variables_resolved_fresh_each_run() {
        let runtime = Arc::new(ScriptedRuntime::new(vec![]));
        let trigger = TaskTrigger::new(fast_job(0), Arc::new(backup_vars()), runtime.clone());
        let first = trigger.fire(logical(), RunKind::Scheduled, &CancelToken::new()).await.unwrap();
        let second = trigger.fire(logical(), RunKind::Scheduled, &CancelToken::new()).await.unwrap();
        assert_ne!(first.run_id, second.run_id);

        let calls = runtime.calls.lock().unwrap();
        assert_ne!(calls[0].container_name, calls[1].container_name);
        assert!(calls[0].container_name.starts_with("backup_postgres_to_s3-scheduled__"));
    }

    #[tokio::test]
    async fn test_cancel_during_attempt() {
        let cancel = CancelToken::new();
        let trigger = TaskTrigger::new(fast_job(2), Arc::new(backup_vars()), Arc::new(HangingRuntime));
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let report = trigger.fire(logical(), RunKind::Scheduled, &cancel).await.unwrap();
        assert_eq!(report.state, RunState::Cancelled);
        assert_eq!(report.attempts, 1);
    }

    #[tokio::test]
    async fn test_cancel_during_retry_delay() {
        let mut config = JobConfig::default();
        config.default_args.retry_delay = 3600;
        let job = Arc::new(Job::from_config(&config).unwrap());
        let runtime = Arc::new(ScriptedRuntime::failing(10));
        let trigger = TaskTrigger::new(job, Arc::new(backup_vars()), runtime.clone());

        let cancel = CancelToken::new();
        let canceller = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let report = tokio::time::timeout(
            Duration::from_secs(5),
            trigger.fire(logical(), RunKind::Scheduled, &cancel),
        )
        .await
        .expect("cancel should interrupt the retry delay")
        .unwrap();
        assert_eq!(report.state, RunState::Cancelled);
        assert_eq!(runtime.call_count(), 1);
    }

    #[tokio::test]
    async fn test_failure_reason_is_redacted() {
        let runtime = Arc::new(ScriptedRuntime::new(vec![Err(DumptruckError::ProcessExecutionFailure {
            code: 2,
            detail: "auth failed for password hunter2".into(),
        })]));
        let trigger = TaskTrigger::new(fast_job(0), Arc::new(backup_vars()), runtime);
        let report = trigger.fire(logical(), RunKind::Scheduled, &CancelToken::new()).await.unwrap();
        let reason = report.state.reason().unwrap().to_string();
        assert!(!reason.contains("hunter2"));
        assert!(reason.contains("***"));
    }

    #[tokio::test]
    async fn test_notifications_follow_policy() {
        let mut config = JobConfig::default();
        config.default_args.retry_delay = 0;
        config.default_args.notify_on_failure = true;
        config.default_args.notify_on_retry = true;
        let job = Arc::new(Job::from_config(&config).unwrap());

        let mut router = NotifyRouter::new();
        router.register("log", NotifyTarget::Log);
        let router = Arc::new(Mutex::new(router));

        let runtime = Arc::new(ScriptedRuntime::failing(10));
        let trigger = TaskTrigger::new(job, Arc::new(backup_vars()), runtime).with_notifier(router.clone());
        trigger.fire(logical(), RunKind::Scheduled, &CancelToken::new()).await.unwrap();

        let router = router.lock().await;
        let titles: Vec<_> = router.history().iter().map(|n| n.title.as_str()).collect();
        assert_eq!(titles, vec!["Retrying pg_s3_backup", "Retrying pg_s3_backup", "pg_s3_backup failed"]);
        assert_eq!(router.history()[2].priority, NotifyPriority::Urgent);
    }

    #[tokio::test]
    async fn test_unresolved_variable_notifies_on_failure() {
        let mut config = JobConfig::default();
        config.default_args.notify_on_failure = true;
        let job = Arc::new(Job::from_config(&config).unwrap());

        let mut router = NotifyRouter::new();
        router.register("log", NotifyTarget::Log);
        let router = Arc::new(Mutex::new(router));

        let runtime = Arc::new(ScriptedRuntime::new(vec![]));
        let trigger = TaskTrigger::new(job, Arc::new(MemoryVariables::new()), runtime.clone())
            .with_notifier(router.clone());
        let err = trigger
            .fire_as("manual__x".into(), logical(), RunKind::Manual, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DumptruckError::UnresolvedVariable(_)));
        assert_eq!(runtime.call_count(), 0);

        let router = router.lock().await;
        assert_eq!(router.history().len(), 1);
        assert_eq!(router.history()[0].title, "pg_s3_backup failed");
        assert!(router.history()[0].body.contains("manual__x"));
    }

    #[tokio::test]
    async fn test_notifications_disabled_by_default() {
        let mut router = NotifyRouter::new();
        router.register("log", NotifyTarget::Log);
        let router = Arc::new(Mutex::new(router));

        let runtime = Arc::new(ScriptedRuntime::failing(10));
        let trigger = TaskTrigger::new(fast_job(2), Arc::new(backup_vars()), runtime).with_notifier(router.clone());
        trigger.fire(logical(), RunKind::Scheduled, &CancelToken::new()).await.unwrap();
        assert!(router.lock().await.history().is_empty());
    }
}
