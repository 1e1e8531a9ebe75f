//! Job definitions: the core data model for scheduled work.
//!
//! A [`Job`] is built once from the manifest and never mutated afterwards.
//! Its [`TaskInvocation`] still holds raw templates; each run resolves them
//! fresh into a [`ResolvedInvocation`].

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dumptruck_core::config::{AutoRemove, JobConfig, MountConfig};
use dumptruck_core::error::Result;
use serde::{Deserialize, Serialize};

use crate::cron::CronSchedule;
use crate::template::{self, Redactor, TemplateContext};

/// A scheduled job: one cron schedule driving one container task.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub description: String,
    pub schedule: CronSchedule,
    pub start_date: DateTime<Utc>,
    /// Replay missed windows since the last recorded run.
    pub catchup: bool,
    pub tags: Vec<String>,
    pub owner: String,
    /// Skip a run when the previous one did not succeed.
    pub depends_on_past: bool,
    pub retry: RetryPolicy,
    pub notify: NotifyPolicy,
    pub task: TaskInvocation,
}

/// How failed attempts are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Extra attempts after the first one.
    pub retries: u32,
    pub retry_delay: Duration,
    pub execution_timeout: Option<Duration>,
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.retries.saturating_add(1)
    }
}

/// When to raise notifications.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotifyPolicy {
    pub on_failure: bool,
    pub on_retry: bool,
}

/// The container to launch, with templates still unresolved.
#[derive(Debug, Clone)]
pub struct TaskInvocation {
    pub task_id: String,
    pub image: String,
    pub api_version: String,
    pub docker_url: String,
    pub auto_remove: AutoRemove,
    pub environment: BTreeMap<String, String>,
    pub command: Vec<String>,
    pub mounts: Vec<MountConfig>,
}

/// A task with every template rendered for one run.
#[derive(Debug, Clone)]
pub struct ResolvedInvocation {
    pub task_id: String,
    pub image: String,
    pub api_version: String,
    pub docker_url: String,
    pub auto_remove: AutoRemove,
    pub environment: Vec<(String, String)>,
    pub args: Vec<String>,
    pub mounts: Vec<MountConfig>,
    pub redactor: Redactor,
}

impl Job {
    /// Build the job from its manifest. Fails on an invalid schedule.
    pub fn from_config(config: &JobConfig) -> Result<Self> {
        config.validate()?;
        let schedule = CronSchedule::parse(&config.schedule, &config.timezone)?;
        let defaults = &config.default_args;
        let task = &config.task;

        let retry = RetryPolicy {
            retries: task.retries.unwrap_or(defaults.retries),
            retry_delay: Duration::from_secs(task.retry_delay.unwrap_or(defaults.retry_delay)),
            execution_timeout: task
                .execution_timeout
                .or(defaults.execution_timeout)
                .map(Duration::from_secs),
        };

        Ok(Self {
            id: config.job_id.clone(),
            description: config.description.clone(),
            schedule,
            start_date: config.start_date,
            catchup: config.catchup,
            tags: config.tags.clone(),
            owner: defaults.owner.clone(),
            depends_on_past: defaults.depends_on_past,
            retry,
            notify: NotifyPolicy {
                on_failure: defaults.notify_on_failure,
                on_retry: defaults.notify_on_retry,
            },
            task: TaskInvocation {
                task_id: task.task_id.clone(),
                image: task.image.clone(),
                api_version: task.api_version.clone(),
                docker_url: task.docker_url.clone(),
                auto_remove: task.auto_remove,
                environment: task.environment.clone(),
                command: task.command.clone(),
                mounts: task.mounts.clone(),
            },
        })
    }

    /// The first tick the engine should wait for.
    ///
    /// Without catchup this is the first match at or after both the start
    /// date and `now`, so windows missed before startup are never run. With
    /// catchup it resumes right after `last_logical` (or at the start date).
    pub fn first_tick(
        &self,
        now: DateTime<Utc>,
        last_logical: Option<DateTime<Utc>>,
    ) -> Option<DateTime<Utc>> {
        if self.catchup {
            return match last_logical {
                Some(last) => self.schedule.next_after(last.max(self.start_date)),
                None => self.schedule.next_at_or_after(self.start_date),
            };
        }
        self.schedule.next_at_or_after(self.start_date.max(now))
    }

    /// The tick following `tick`, given the wall clock after the run.
    pub fn following_tick(&self, tick: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let next = self.schedule.next_after(tick)?;
        if self.catchup || next >= now {
            Some(next)
        } else {
            // The run overran one or more windows; skip them.
            self.schedule.next_at_or_after(now)
        }
    }
}

impl TaskInvocation {
    /// Render all templates. Fails fast on the first unresolved variable.
    pub fn resolve(&self, ctx: &TemplateContext<'_>) -> Result<ResolvedInvocation> {
        let mut secrets = Vec::new();

        let mut args = Vec::with_capacity(self.command.len());
        for raw in &self.command {
            let rendered = template::render(raw, ctx)?;
            secrets.extend(rendered.secrets);
            args.push(rendered.value);
        }

        let mut environment = Vec::with_capacity(self.environment.len());
        for (name, raw) in &self.environment {
            let rendered = template::render(raw, ctx)?;
            secrets.extend(rendered.secrets);
            environment.push((name.clone(), rendered.value));
        }

        Ok(ResolvedInvocation {
            task_id: self.task_id.clone(),
            image: self.image.clone(),
            api_version: self.api_version.clone(),
            docker_url: self.docker_url.clone(),
            auto_remove: self.auto_remove,
            environment,
            args,
            mounts: self.mounts.clone(),
            redactor: Redactor::new(secrets),
        })
    }

    /// Every variable key referenced by the task, deduplicated, with whether
    /// it carries a default.
    pub fn variables(&self) -> Result<Vec<(String, bool)>> {
        let mut keys: Vec<(String, bool)> = Vec::new();
        for raw in self.command.iter().chain(self.environment.values()) {
            for (key, has_default) in template::referenced_variables(raw)? {
                if !keys.iter().any(|(k, _)| *k == key) {
                    keys.push((key, has_default));
                }
            }
        }
        Ok(keys)
    }
}

impl ResolvedInvocation {
    /// The container arguments as one line with secrets masked.
    pub fn redacted_args(&self) -> String {
        self.redactor.redact(&self.args.join(" "))
    }
}

/// Why a run was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
    Scheduled,
    Manual,
}

impl std::fmt::Display for RunKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunKind::Scheduled => write!(f, "scheduled"),
            RunKind::Manual => write!(f, "manual"),
        }
    }
}

/// Run id: `<kind>__<logical date>_<random>`; also safe as a container name.
pub fn new_run_id(kind: RunKind, logical_date: DateTime<Utc>) -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("{kind}__{}_{}", logical_date.format("%Y%m%dT%H%M%S"), &uuid[..8])
}

/// Final (or current) state of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunState {
    Running,
    Success,
    Failed(String),
    Cancelled,
    Skipped(String),
}

impl RunState {
    pub fn label(&self) -> &'static str {
        match self {
            RunState::Running => "running",
            RunState::Success => "success",
            RunState::Failed(_) => "failed",
            RunState::Cancelled => "cancelled",
            RunState::Skipped(_) => "skipped",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            RunState::Failed(r) | RunState::Skipped(r) => Some(r.as_str()),
            _ => None,
        }
    }

    /// Rebuild from the stored label and reason.
    pub fn from_parts(label: &str, reason: Option<String>) -> Self {
        let reason = reason.unwrap_or_default();
        match label {
            "running" => RunState::Running,
            "success" => RunState::Success,
            "cancelled" => RunState::Cancelled,
            "skipped" => RunState::Skipped(reason),
            _ => RunState::Failed(reason),
        }
    }
}

/// Outcome of one run of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub job_id: String,
    pub kind: RunKind,
    pub logical_date: DateTime<Utc>,
    pub state: RunState,
    pub attempts: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}
