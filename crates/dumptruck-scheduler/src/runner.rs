//! Container runtime: launches one attempt of the task and waits for it.
//!
//! [`DockerCli`] shells out to the `docker` binary: environment values go
//! through the child's environment (never on the command line), container
//! output is forwarded to the log with secrets masked, and the finished
//! container is removed according to the task's auto-remove policy.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use dumptruck_core::config::{AutoRemove, MountConfig, MountKind};
use dumptruck_core::error::{DumptruckError, Result};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;

use crate::cancel::CancelToken;
use crate::tasks::ResolvedInvocation;
use crate::template::Redactor;

/// `docker run` exits 125 when the daemon or engine itself failed.
const DOCKER_ENGINE_ERROR: i32 = 125;

enum Waited {
    Exited(std::io::Result<std::process::ExitStatus>),
    Cancelled,
    TimedOut,
}

/// Per-attempt parameters.
#[derive(Debug, Clone)]
pub struct AttemptContext {
    pub container_name: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub timeout: Option<Duration>,
}

/// How an attempt ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    Succeeded,
    Cancelled,
}

/// Runs one attempt of a resolved task.
///
/// Errors must be `ProcessLaunchFailure` when the runtime could not start the
/// process and `ProcessExecutionFailure` when it ran and failed; the trigger
/// retries both.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn run(
        &self,
        invocation: &ResolvedInvocation,
        attempt: &AttemptContext,
        cancel: &CancelToken,
    ) -> Result<AttemptOutcome>;
}

/// Runtime backed by the `docker` CLI.
#[derive(Debug, Clone)]
pub struct DockerCli {
    binary: String,
}

impl DockerCli {
    pub fn new() -> Self {
        Self {
            binary: "docker".into(),
        }
    }

    /// Use a different executable (podman, a wrapper script, ...).
    pub fn with_binary(binary: &str) -> Self {
        Self {
            binary: binary.to_string(),
        }
    }

    /// Full argv (after the binary) for `docker run`.
    pub fn run_args(invocation: &ResolvedInvocation, container_name: &str) -> Vec<String> {
        let mut args = host_args(&invocation.docker_url);
        args.extend(["run".to_string(), "--name".to_string(), container_name.to_string()]);
        if invocation.auto_remove == AutoRemove::Force {
            args.push("--rm".into());
        }
        for (name, _) in &invocation.environment {
            args.push("-e".into());
            args.push(name.clone());
        }
        for mount in &invocation.mounts {
            args.push("--mount".into());
            args.push(mount_spec(mount));
        }
        args.push(invocation.image.clone());
        args.extend(invocation.args.iter().cloned());
        args
    }

    fn command(&self, invocation: &ResolvedInvocation) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.stdin(Stdio::null()).kill_on_drop(true);
        let version = invocation.api_version.trim();
        if !version.is_empty() && !version.eq_ignore_ascii_case("auto") {
            cmd.env("DOCKER_API_VERSION", version);
        }
        cmd
    }

    /// `docker rm [-f]`; failures are logged, never propagated.
    async fn remove(&self, invocation: &ResolvedInvocation, container_name: &str, force: bool) {
        let mut args = host_args(&invocation.docker_url);
        args.push("rm".into());
        if force {
            args.push("-f".into());
        }
        args.push(container_name.to_string());

        let output = self
            .command(invocation)
            .args(&args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output()
            .await;
        match output {
            Ok(o) if o.status.success() => {
                tracing::debug!("🧹 Removed container {container_name}");
            }
            Ok(o) => {
                tracing::warn!(
                    "⚠️ Failed to remove container {container_name}: {}",
                    String::from_utf8_lossy(&o.stderr).trim()
                );
            }
            Err(e) => tracing::warn!("⚠️ Failed to remove container {container_name}: {e}"),
        }
    }
}

impl Default for DockerCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn run(
        &self,
        invocation: &ResolvedInvocation,
        attempt: &AttemptContext,
        cancel: &CancelToken,
    ) -> Result<AttemptOutcome> {
        let name = attempt.container_name.as_str();
        let mut cmd = self.command(invocation);
        cmd.args(Self::run_args(invocation, name))
            .envs(invocation.environment.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            DumptruckError::ProcessLaunchFailure(format!("failed to start '{}': {e}", self.binary))
        })?;

        let stdout = child
            .stdout
            .take()
            .map(|out| forward_lines(out, name.to_string(), invocation.redactor.clone()));
        let stderr = child
            .stderr
            .take()
            .map(|err| forward_lines(err, name.to_string(), invocation.redactor.clone()));

        let deadline = async {
            match attempt.timeout {
                Some(limit) => tokio::time::sleep(limit).await,
                None => std::future::pending::<()>().await,
            }
        };

        // The wait future borrows the child, so decide first and act after.
        let waited = tokio::select! {
            status = child.wait() => Waited::Exited(status),
            _ = cancel.cancelled() => Waited::Cancelled,
            _ = deadline => Waited::TimedOut,
        };

        let status = match waited {
            Waited::Exited(status) => status.map_err(|e| {
                DumptruckError::ProcessLaunchFailure(format!("failed waiting for '{}': {e}", self.binary))
            })?,
            Waited::Cancelled => {
                tracing::warn!("🛑 Cancelling container {name}");
                child.kill().await.ok();
                self.remove(invocation, name, true).await;
                return Ok(AttemptOutcome::Cancelled);
            }
            Waited::TimedOut => {
                let secs = attempt.timeout.map(|t| t.as_secs()).unwrap_or_default();
                tracing::warn!("⏰ Container {name} timed out after {secs}s");
                child.kill().await.ok();
                self.remove(invocation, name, true).await;
                return Err(DumptruckError::ProcessExecutionFailure {
                    code: -1,
                    detail: format!("timed out after {secs}s"),
                });
            }
        };

        if let Some(handle) = stdout {
            handle.await.ok();
        }
        let last_stderr = match stderr {
            Some(handle) => handle.await.ok().flatten(),
            None => None,
        };
        let detail = last_stderr.unwrap_or_else(|| "no output".into());

        match status.code() {
            Some(0) => {
                if invocation.auto_remove == AutoRemove::Success {
                    self.remove(invocation, name, false).await;
                }
                Ok(AttemptOutcome::Succeeded)
            }
            Some(DOCKER_ENGINE_ERROR) => Err(DumptruckError::ProcessLaunchFailure(format!(
                "container runtime error: {detail}"
            ))),
            Some(code) => Err(DumptruckError::ProcessExecutionFailure { code, detail }),
            None => Err(DumptruckError::ProcessExecutionFailure {
                code: -1,
                detail: "terminated by signal".into(),
            }),
        }
    }
}

/// `unix://var/run/docker.sock` → `unix:///var/run/docker.sock`.
pub fn normalize_docker_url(url: &str) -> String {
    match url.trim().strip_prefix("unix://") {
        Some(path) if !path.starts_with('/') => format!("unix:///{path}"),
        _ => url.trim().to_string(),
    }
}

fn host_args(docker_url: &str) -> Vec<String> {
    if docker_url.trim().is_empty() {
        Vec::new()
    } else {
        vec!["--host".into(), normalize_docker_url(docker_url)]
    }
}

fn mount_spec(mount: &MountConfig) -> String {
    let mut spec = format!("type={}", mount.kind);
    if mount.kind != MountKind::Tmpfs {
        spec.push_str(&format!(",source={}", mount.source));
    }
    spec.push_str(&format!(",target={}", mount.target));
    if mount.read_only {
        spec.push_str(",readonly");
    }
    spec
}

/// Forward a child stream to the log line by line; yields the last line.
fn forward_lines<R>(reader: R, container: String, redactor: Redactor) -> JoinHandle<Option<String>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let mut last = None;
        while let Ok(Some(line)) = lines.next_line().await {
            let line = redactor.redact(&line);
            tracing::info!("📦 [{container}] {line}");
            last = Some(line);
        }
        last
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn invocation(auto_remove: AutoRemove) -> ResolvedInvocation {
        ResolvedInvocation {
            task_id: "backup_postgres_to_s3".into(),
            image: "pg-s3-backup:latest".into(),
            api_version: "auto".into(),
            docker_url: "unix://var/run/docker.sock".into(),
            auto_remove,
            environment: vec![("AWS_SECRET_ACCESS_KEY".into(), "wJalr".into())],
            args: vec!["--password".into(), "hunter2".into(), "--compress".into()],
            mounts: vec![
                MountConfig {
                    source: "/tmp".into(),
                    target: "/tmp".into(),
                    kind: MountKind::Bind,
                    read_only: false,
                },
                MountConfig {
                    source: String::new(),
                    target: "/scratch".into(),
                    kind: MountKind::Tmpfs,
                    read_only: false,
                },
            ],
            redactor: Redactor::new(vec!["hunter2".to_string(), "wJalr".to_string()]),
        }
    }

    #[test]
    fn test_normalize_docker_url() {
        assert_eq!(normalize_docker_url("unix://var/run/docker.sock"), "unix:///var/run/docker.sock");
        assert_eq!(normalize_docker_url("unix:///var/run/docker.sock"), "unix:///var/run/docker.sock");
        assert_eq!(normalize_docker_url("tcp://10.0.0.5:2376"), "tcp://10.0.0.5:2376");
    }

    #[test]
    fn test_run_args() {
        let args = DockerCli::run_args(&invocation(AutoRemove::Success), "c1");
        assert_eq!(
            args,
            vec![
                "--host", "unix:///var/run/docker.sock", "run", "--name", "c1",
                "-e", "AWS_SECRET_ACCESS_KEY",
                "--mount", "type=bind,source=/tmp,target=/tmp",
                "--mount", "type=tmpfs,target=/scratch",
                "pg-s3-backup:latest", "--password", "hunter2", "--compress",
            ]
        );
        // env values stay off the command line
        assert!(!args.iter().any(|a| a.contains("wJalr")));
    }

    #[test]
    fn test_force_remove_uses_rm_flag() {
        let args = DockerCli::run_args(&invocation(AutoRemove::Force), "c1");
        assert!(args.contains(&"--rm".to_string()));
        let args = DockerCli::run_args(&invocation(AutoRemove::Success), "c1");
        assert!(!args.contains(&"--rm".to_string()));
    }

    #[tokio::test]
    async fn test_missing_binary_is_launch_failure() {
        let runtime = DockerCli::with_binary("/nonexistent/dumptruck-docker");
        let attempt = AttemptContext {
            container_name: "c1".into(),
            attempt: 1,
            timeout: None,
        };
        let err = runtime
            .run(&invocation(AutoRemove::Success), &attempt, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, DumptruckError::ProcessLaunchFailure(_)));
    }

    #[cfg(unix)]
    mod fake_docker {
        use super::*;
        use std::os::unix::fs::PermissionsExt;
        use std::path::PathBuf;

        /// A shell script standing in for `docker`; logs its argv and exits
        /// with `$FAKE_EXIT` (passed through the container environment).
        fn install(dir_name: &str) -> (PathBuf, PathBuf) {
            let dir = std::env::temp_dir().join(dir_name);
            std::fs::create_dir_all(&dir).unwrap();
            let log = dir.join("calls.log");
            let script = dir.join("docker");
            std::fs::write(
                &script,
                format!(
                    "#!/bin/sh\necho \"$@\" >> {log}\ncase \" $* \" in *\" rm \"*) exit 0;; esac\necho starting backup\nif [ -n \"$FAKE_SLEEP\" ]; then exec sleep \"$FAKE_SLEEP\"; fi\nexit \"${{FAKE_EXIT:-0}}\"\n",
                    log = log.display()
                ),
            )
            .unwrap();
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
            (script, log)
        }

        fn with_env(mut inv: ResolvedInvocation, key: &str, value: &str) -> ResolvedInvocation {
            inv.environment.push((key.into(), value.into()));
            inv
        }

        fn attempt(name: &str) -> AttemptContext {
            AttemptContext {
                container_name: name.into(),
                attempt: 1,
                timeout: None,
            }
        }

        #[tokio::test]
        async fn test_success_removes_container() {
            let (script, log) = install("dumptruck-fake-docker-ok");
            let runtime = DockerCli::with_binary(script.to_str().unwrap());
            let outcome = runtime
                .run(&invocation(AutoRemove::Success), &attempt("ok-1"), &CancelToken::new())
                .await
                .unwrap();
            assert_eq!(outcome, AttemptOutcome::Succeeded);

            let calls = std::fs::read_to_string(&log).unwrap();
            assert!(calls.lines().any(|l| l.contains("run --name ok-1")));
            assert!(calls.lines().any(|l| l.ends_with("rm ok-1")));
            std::fs::remove_dir_all(script.parent().unwrap()).ok();
        }

        #[tokio::test]
        async fn test_nonzero_exit_keeps_container() {
            let (script, log) = install("dumptruck-fake-docker-fail");
            let runtime = DockerCli::with_binary(script.to_str().unwrap());
            let inv = with_env(invocation(AutoRemove::Success), "FAKE_EXIT", "3");
            let err = runtime.run(&inv, &attempt("fail-1"), &CancelToken::new()).await.unwrap_err();
            assert!(matches!(err, DumptruckError::ProcessExecutionFailure { code: 3, .. }));

            let calls = std::fs::read_to_string(&log).unwrap();
            assert!(!calls.contains("rm fail-1"));
            std::fs::remove_dir_all(script.parent().unwrap()).ok();
        }

        #[tokio::test]
        async fn test_engine_error_is_launch_failure() {
            let (script, _) = install("dumptruck-fake-docker-125");
            let runtime = DockerCli::with_binary(script.to_str().unwrap());
            let inv = with_env(invocation(AutoRemove::Success), "FAKE_EXIT", "125");
            let err = runtime.run(&inv, &attempt("e-1"), &CancelToken::new()).await.unwrap_err();
            assert!(matches!(err, DumptruckError::ProcessLaunchFailure(_)));
            std::fs::remove_dir_all(script.parent().unwrap()).ok();
        }

        #[tokio::test]
        async fn test_cancel_kills_and_force_removes() {
            let (script, log) = install("dumptruck-fake-docker-cancel");
            let runtime = DockerCli::with_binary(script.to_str().unwrap());
            let inv = with_env(invocation(AutoRemove::Never), "FAKE_SLEEP", "30");
            let cancel = CancelToken::new();
            let trigger = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                trigger.cancel();
            });

            let outcome = tokio::time::timeout(
                Duration::from_secs(10),
                runtime.run(&inv, &attempt("cancel-1"), &cancel),
            )
            .await
            .expect("cancel should stop the attempt")
            .unwrap();
            assert_eq!(outcome, AttemptOutcome::Cancelled);

            let calls = std::fs::read_to_string(&log).unwrap();
            assert!(calls.contains("rm -f cancel-1"));
            std::fs::remove_dir_all(script.parent().unwrap()).ok();
        }

        #[tokio::test]
        async fn test_timeout_is_execution_failure() {
            let (script, _) = install("dumptruck-fake-docker-timeout");
            let runtime = DockerCli::with_binary(script.to_str().unwrap());
            let inv = with_env(invocation(AutoRemove::Never), "FAKE_SLEEP", "30");
            let ctx = AttemptContext {
                container_name: "slow-1".into(),
                attempt: 1,
                timeout: Some(Duration::from_millis(300)),
            };
            let err = runtime.run(&inv, &ctx, &CancelToken::new()).await.unwrap_err();
            assert!(matches!(err, DumptruckError::ProcessExecutionFailure { code: -1, .. }));
            std::fs::remove_dir_all(script.parent().unwrap()).ok();
        }
    }
}
