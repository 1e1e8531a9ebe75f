//! # Dumptruck Scheduler
//!
//! Cron-driven trigger for a containerized backup job.
//!
//! ## Design Principles
//! - One job, one task, no DAGs
//! - Variables are injected, read-only, and resolved fresh on every run
//! - Tokio timers only: zero overhead between ticks
//! - No catchup by default: windows missed before startup are never replayed
//!
//! ## Architecture
//! ```text
//! SchedulerEngine (sleep until next tick)
//!   ├── Job: "0 2 * * *" UTC, start 2025-01-01
//!   ├── on tick → TaskTrigger
//!   │     ├── resolve {{ var.value.* }} against VariableStore
//!   │     ├── ContainerRuntime (docker run ...)
//!   │     ├── retry × N with fixed delay
//!   │     └── NotifyRouter (on retry / on failure)
//!   └── RunHistory (SQLite)
//! ```

pub mod cancel;
pub mod cron;
pub mod dispatch;
pub mod engine;
pub mod notify;
pub mod persistence;
pub mod runner;
pub mod tasks;
pub mod template;
pub mod trigger;
pub mod variables;

pub use cancel::CancelToken;
pub use cron::CronSchedule;
pub use engine::SchedulerEngine;
pub use notify::{Notification, NotifyPriority, NotifyRouter};
pub use persistence::RunHistory;
pub use runner::{AttemptContext, AttemptOutcome, ContainerRuntime, DockerCli};
pub use tasks::{Job, ResolvedInvocation, RetryPolicy, RunKind, RunReport, RunState, TaskInvocation};
pub use trigger::TaskTrigger;
pub use variables::{EnvVariables, FileVariables, LayeredVariables, MemoryVariables, VariableStore};
