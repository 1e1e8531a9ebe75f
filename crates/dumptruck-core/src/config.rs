//! Dumptruck job manifest.
//!
//! The manifest is a TOML file describing one scheduled job: its schedule,
//! the default retry arguments, and the container task to launch. Every field
//! has a default, and the defaults reproduce the nightly PostgreSQL to S3
//! backup, so an empty file (or no file at all) yields a working job.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{DumptruckError, Result};

/// Root manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    #[serde(default = "default_job_id")]
    pub job_id: String,
    #[serde(default = "default_description")]
    pub description: String,
    /// 5-field cron expression.
    #[serde(default = "default_schedule")]
    pub schedule: String,
    /// `UTC` or a fixed offset such as `+05:30`.
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_start_date", deserialize_with = "de_start_date")]
    pub start_date: DateTime<Utc>,
    #[serde(default)]
    pub catchup: bool,
    #[serde(default = "default_tags")]
    pub tags: Vec<String>,
    #[serde(default)]
    pub default_args: DefaultArgsConfig,
    #[serde(default)]
    pub task: TaskConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub paths: PathsConfig,
}

fn default_job_id() -> String { "pg_s3_backup".into() }
fn default_description() -> String { "Backup PostgreSQL database to S3 using Docker container".into() }
fn default_schedule() -> String { "0 2 * * *".into() }
fn default_timezone() -> String { "UTC".into() }
fn default_tags() -> Vec<String> { vec!["backup".into(), "postgres".into(), "s3".into()] }

fn default_start_date() -> DateTime<Utc> {
    NaiveDate::from_ymd_opt(2025, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Accepts either an RFC 3339 timestamp or a bare `YYYY-MM-DD` date (midnight UTC).
fn de_start_date<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_start_date(&raw).map_err(serde::de::Error::custom)
}

/// Parse a start date in either accepted form.
pub fn parse_start_date(raw: &str) -> std::result::Result<DateTime<Utc>, String> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|dt| dt.and_utc())
        .ok_or_else(|| format!("invalid start_date '{raw}' (expected RFC 3339 or YYYY-MM-DD)"))
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            job_id: default_job_id(),
            description: default_description(),
            schedule: default_schedule(),
            timezone: default_timezone(),
            start_date: default_start_date(),
            catchup: false,
            tags: default_tags(),
            default_args: DefaultArgsConfig::default(),
            task: TaskConfig::default(),
            notify: NotifyConfig::default(),
            paths: PathsConfig::default(),
        }
    }
}

impl JobConfig {
    /// Load config from the default path (~/.dumptruck/job.toml).
    pub fn load() -> Result<Self> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DumptruckError::Config(format!("Failed to read {}: {e}", path.display())))?;
        Self::parse(&content)
    }

    /// Parse and validate a manifest from TOML text.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| DumptruckError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save config to the given path, creating parent directories.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| DumptruckError::Config(format!("Failed to serialize config: {e}")))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Structural checks that do not need the scheduler (cron syntax is
    /// checked when the job is built).
    pub fn validate(&self) -> Result<()> {
        if self.job_id.trim().is_empty() {
            return Err(DumptruckError::Config("job_id must not be empty".into()));
        }
        if self.task.task_id.trim().is_empty() {
            return Err(DumptruckError::Config("task.task_id must not be empty".into()));
        }
        if self.task.image.trim().is_empty() {
            return Err(DumptruckError::Config("task.image must not be empty".into()));
        }
        for mount in &self.task.mounts {
            if mount.target.trim().is_empty() {
                return Err(DumptruckError::Config("mount target must not be empty".into()));
            }
            if mount.kind != MountKind::Tmpfs && mount.source.trim().is_empty() {
                return Err(DumptruckError::Config(format!(
                    "mount '{}' needs a source",
                    mount.target
                )));
            }
        }
        for target in &self.notify.targets {
            if let NotifyTargetConfig::Webhook { url, .. } = target {
                if url.trim().is_empty() {
                    return Err(DumptruckError::Config("webhook url must not be empty".into()));
                }
            }
        }
        Ok(())
    }

    /// Get the default config path.
    pub fn default_path() -> PathBuf {
        Self::home_dir().join("job.toml")
    }

    /// Get the dumptruck home directory.
    pub fn home_dir() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".dumptruck")
    }
}

/// Defaults applied to every task unless the task overrides them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultArgsConfig {
    #[serde(default = "default_owner")]
    pub owner: String,
    #[serde(default)]
    pub depends_on_past: bool,
    #[serde(default, alias = "email_on_failure")]
    pub notify_on_failure: bool,
    #[serde(default, alias = "email_on_retry")]
    pub notify_on_retry: bool,
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Seconds between attempts.
    #[serde(default = "default_retry_delay")]
    pub retry_delay: u64,
    /// Per-attempt timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_timeout: Option<u64>,
}

fn default_owner() -> String { "airflow".into() }
fn default_retries() -> u32 { 2 }
fn default_retry_delay() -> u64 { 300 }

impl Default for DefaultArgsConfig {
    fn default() -> Self {
        Self {
            owner: default_owner(),
            depends_on_past: false,
            notify_on_failure: false,
            notify_on_retry: false,
            retries: default_retries(),
            retry_delay: default_retry_delay(),
            execution_timeout: None,
        }
    }
}

/// The container task launched on every tick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(default = "default_task_id")]
    pub task_id: String,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default)]
    pub auto_remove: AutoRemove,
    #[serde(default = "default_docker_url")]
    pub docker_url: String,
    /// Container arguments; entries may contain `{{ ... }}` templates.
    #[serde(default = "default_command")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retries: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_delay: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_timeout: Option<u64>,
    /// Container environment; values may contain `{{ ... }}` templates.
    #[serde(default = "default_environment")]
    pub environment: BTreeMap<String, String>,
    #[serde(default = "default_mounts")]
    pub mounts: Vec<MountConfig>,
}

fn default_task_id() -> String { "backup_postgres_to_s3".into() }
fn default_image() -> String { "regv2.gsingh.io/personal/pg-s3-backup:latest".into() }
fn default_api_version() -> String { "auto".into() }
fn default_docker_url() -> String { "unix://var/run/docker.sock".into() }

fn default_command() -> Vec<String> {
    [
        "--bucket",
        "{{ var.value.s3_backup_bucket }}",
        "--host",
        "{{ var.value.pg_host }}",
        "--port",
        "{{ var.value.pg_port | default('5432') }}",
        "--dbname",
        "{{ var.value.pg_database }}",
        "--user",
        "{{ var.value.pg_user }}",
        "--password",
        "{{ var.value.pg_password }}",
        "--prefix",
        "{{ var.value.s3_backup_prefix | default('backups/') }}",
        "--compress",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_environment() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("AWS_ACCESS_KEY_ID".to_string(), "{{ var.value.aws_access_key_id }}".to_string()),
        ("AWS_SECRET_ACCESS_KEY".to_string(), "{{ var.value.aws_secret_access_key }}".to_string()),
        ("AWS_DEFAULT_REGION".to_string(), "{{ var.value.aws_region | default('us-east-1') }}".to_string()),
    ])
}

fn default_mounts() -> Vec<MountConfig> {
    vec![MountConfig {
        source: "/tmp".into(),
        target: "/tmp".into(),
        kind: MountKind::Bind,
        read_only: false,
    }]
}

impl Default for TaskConfig {
    fn default() -> Self {
        Self {
            task_id: default_task_id(),
            image: default_image(),
            api_version: default_api_version(),
            auto_remove: AutoRemove::default(),
            docker_url: default_docker_url(),
            command: default_command(),
            retries: None,
            retry_delay: None,
            execution_timeout: None,
            environment: default_environment(),
            mounts: default_mounts(),
        }
    }
}

/// When to remove the finished container.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoRemove {
    /// Keep every container.
    Never,
    /// Remove only after a zero exit; failed containers stay for inspection.
    #[default]
    Success,
    /// Always remove (`docker run --rm`).
    Force,
}

/// A host path (or volume) mounted into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountConfig {
    #[serde(default)]
    pub source: String,
    pub target: String,
    #[serde(rename = "type", default)]
    pub kind: MountKind,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountKind {
    #[default]
    Bind,
    Volume,
    Tmpfs,
}

impl std::fmt::Display for MountKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MountKind::Bind => write!(f, "bind"),
            MountKind::Volume => write!(f, "volume"),
            MountKind::Tmpfs => write!(f, "tmpfs"),
        }
    }
}

/// Where failure notifications go.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    #[serde(default)]
    pub targets: Vec<NotifyTargetConfig>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum NotifyTargetConfig {
    /// Log-only target.
    Log,
    /// HTTP POST with a JSON body.
    Webhook {
        url: String,
        #[serde(default)]
        headers: BTreeMap<String, String>,
    },
}

/// Locations of the variable store and run history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    #[serde(default = "default_variables_path")]
    pub variables: String,
    #[serde(default = "default_history_path")]
    pub history: String,
}

fn default_variables_path() -> String { "~/.dumptruck/variables.json".into() }
fn default_history_path() -> String { "~/.dumptruck/history.db".into() }

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            variables: default_variables_path(),
            history: default_history_path(),
        }
    }
}
