//! # Dumptruck: scheduled PostgreSQL → S3 backup trigger
//!
//! Launches the backup container on a cron schedule, with retries.
//!
//! Usage:
//!   dumptruck init                  # Write the default job manifest
//!   dumptruck check                 # Validate manifest + variables, launch nothing
//!   dumptruck next -n 3             # Show upcoming runs
//!   dumptruck run                   # Start the scheduler loop
//!   dumptruck trigger               # Run the backup once, now
//!   dumptruck history               # Show recent runs

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use clap::{Parser, Subcommand};
use dumptruck_core::config::{JobConfig, parse_start_date};
use dumptruck_scheduler::template::TemplateContext;
use dumptruck_scheduler::{
    CancelToken, DockerCli, EnvVariables, FileVariables, Job, LayeredVariables, NotifyRouter,
    RunHistory, RunKind, RunState, SchedulerEngine, TaskTrigger, VariableStore,
};
use tokio::sync::Mutex;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "dumptruck",
    version,
    about = "🚚 Dumptruck — scheduled PostgreSQL → S3 backup trigger"
)]
struct Cli {
    /// Job manifest (default: ~/.dumptruck/job.toml)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Variables file, JSON or TOML (overrides the manifest's paths.variables)
    #[arg(long, global = true)]
    vars: Option<String>,

    /// Run history database (overrides the manifest's paths.history)
    #[arg(long, global = true)]
    db: Option<String>,

    /// Verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the scheduler loop
    Run,
    /// Run the job once, immediately
    Trigger {
        /// Logical date (RFC 3339 or YYYY-MM-DD; default: now)
        #[arg(long)]
        date: Option<String>,
    },
    /// Print upcoming scheduled runs
    Next {
        #[arg(short = 'n', long, default_value = "5")]
        count: usize,
    },
    /// Validate the manifest and resolve every template
    Check,
    /// Show recent runs
    History {
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,
    },
    /// Write the default manifest
    Init {
        /// Overwrite an existing manifest
        #[arg(long)]
        force: bool,
    },
}

fn expand_path(p: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(p).to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        "dumptruck=debug,dumptruck_scheduler=debug,dumptruck_core=debug"
    } else {
        "dumptruck=info,dumptruck_scheduler=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .with_target(false)
        .init();

    let config_path = cli
        .config
        .as_deref()
        .map(expand_path)
        .unwrap_or_else(JobConfig::default_path);

    if let Command::Init { force } = cli.command {
        if config_path.exists() && !force {
            bail!("{} already exists (use --force to overwrite)", config_path.display());
        }
        JobConfig::default().save_to(&config_path)?;
        println!("✅ Wrote default manifest to {}", config_path.display());
        return Ok(());
    }

    let config = if config_path.exists() {
        JobConfig::load_from(&config_path)?
    } else {
        if cli.config.is_some() {
            bail!("manifest {} not found", config_path.display());
        }
        tracing::info!("No manifest at {}, using built-in job", config_path.display());
        JobConfig::default()
    };
    let job = Arc::new(Job::from_config(&config)?);

    let vars_path = expand_path(cli.vars.as_deref().unwrap_or(&config.paths.variables));
    let db_path = expand_path(cli.db.as_deref().unwrap_or(&config.paths.history));

    match cli.command {
        Command::Init { .. } => {}
        Command::Next { count } => {
            let first = job
                .first_tick(Utc::now(), None)
                .context("schedule never fires")?;
            println!("📅 {} — {}", job.id, job.schedule);
            for tick in job.schedule.upcoming(first).take(count) {
                println!("   {}", tick.to_rfc3339());
            }
        }
        Command::History { limit } => {
            let history = RunHistory::open(&db_path)?;
            let runs = history.recent(&job.id, limit)?;
            if runs.is_empty() {
                println!("No runs recorded for '{}'", job.id);
            }
            for run in runs {
                println!(
                    "{:<9} {:<45} logical={} attempts={}{}",
                    run.state.label(),
                    run.run_id,
                    run.logical_date.to_rfc3339(),
                    run.attempts,
                    run.state.reason().map(|r| format!(" — {r}")).unwrap_or_default()
                );
            }
        }
        Command::Check => {
            let vars = load_variables(&vars_path)?;
            check(&job, vars.as_ref())?;
        }
        Command::Trigger { date } => {
            let logical_date = match date {
                Some(raw) => parse_start_date(&raw).map_err(anyhow::Error::msg)?,
                None => Utc::now(),
            };
            let mut engine = build_engine(&job, &config, &vars_path, &db_path)?;
            let cancel = CancelToken::new();
            spawn_shutdown_listener(cancel.clone());

            let report = engine.run_once(logical_date, RunKind::Manual, &cancel).await;
            println!(
                "{} run {} after {} attempt(s)",
                report.state.label(),
                report.run_id,
                report.attempts
            );
            if report.state != RunState::Success {
                bail!("run {} ended {}", report.run_id, report.state.label());
            }
        }
        Command::Run => {
            let mut engine = build_engine(&job, &config, &vars_path, &db_path)?;
            let shutdown = CancelToken::new();
            spawn_shutdown_listener(shutdown.clone());

            println!("🚚 Dumptruck v{}", env!("CARGO_PKG_VERSION"));
            println!("   📋 Job:       {} ({})", job.id, job.description);
            println!("   ⏰ Schedule:  {}", job.schedule);
            println!("   🐳 Image:     {}", job.task.image);
            println!("   🔁 Retries:   {} every {}s", job.retry.retries, job.retry.retry_delay.as_secs());
            println!("   🗄️  History:   {}", db_path.display());
            println!();

            engine.run_forever(shutdown).await?;
        }
    }

    Ok(())
}

/// Environment first, then the variables file.
fn load_variables(path: &std::path::Path) -> Result<Arc<dyn VariableStore>> {
    let file = FileVariables::load_or_empty(path)?;
    let env = EnvVariables::from_env();
    tracing::debug!("{} variables from environment, {} from {}", env.len(), file.len(), path.display());
    Ok(Arc::new(LayeredVariables::new().push(env).push(file)))
}

fn build_engine(
    job: &Arc<Job>,
    config: &JobConfig,
    vars_path: &std::path::Path,
    db_path: &std::path::Path,
) -> Result<SchedulerEngine> {
    let vars = load_variables(vars_path)?;
    let router = Arc::new(Mutex::new(NotifyRouter::from_config(&config.notify)));
    let trigger = TaskTrigger::new(job.clone(), vars, Arc::new(DockerCli::new())).with_notifier(router);
    let history = RunHistory::open(db_path)
        .with_context(|| format!("opening run history {}", db_path.display()))?;
    Ok(SchedulerEngine::new(trigger).with_history(history))
}

fn check(job: &Job, vars: &dyn VariableStore) -> Result<()> {
    println!("📋 {} — {} ({})", job.id, job.description, job.schedule);
    let mut missing = 0;
    for (key, has_default) in job.task.variables()? {
        let status = match (vars.get(&key).is_some(), has_default) {
            (true, _) => "✅ set",
            (false, true) => "➖ default",
            (false, false) => {
                missing += 1;
                "❌ MISSING"
            }
        };
        println!("   {status:<12} {key}");
    }
    if missing > 0 {
        bail!("{missing} required variable(s) missing");
    }

    let ctx = TemplateContext {
        vars,
        logical_date: Utc::now(),
        run_id: "check",
    };
    let resolved = job.task.resolve(&ctx)?;
    let argv = DockerCli::run_args(&resolved, "<container>").join(" ");
    println!("\n🐳 docker {}", resolved.redactor.redact(&argv));
    Ok(())
}

fn spawn_shutdown_listener(token: CancelToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::info!("🛑 Shutdown requested");
        token.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    tokio::signal::ctrl_c().await.ok();
}
