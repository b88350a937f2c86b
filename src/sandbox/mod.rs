//! One isolated, reusable execution unit bound to a scratch workspace.
//!
//! A [`Sandbox`] wraps a single long-lived container: commands are exec'd
//! into it rather than paying container creation per call. Exactly one
//! execution may be in flight per sandbox; that discipline is enforced by
//! the pool's lock, not here. A lent sandbox stays `Busy` until the pool
//! reclaims it: `execute` never hands the sandbox back by itself, only the
//! pool's `release` does. Timeout kills only the
//! runaway process and leaves the container reusable; an engine fault
//! marks the sandbox `Error`, after which the pool must retire it.

mod archive;

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use bollard::exec::CreateExecOptions;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use tempfile::TempDir;
use tracing::{debug, warn};

use crate::config::SandboxConfig;
use crate::engine::ContainerClient;
use crate::error::{ExecutionError, Result};

pub(crate) use archive::build_files_archive;

/// Upper bound on the in-container kill issued after a timeout.
const KILL_TIMEOUT_SECS: u64 = 5;

/// Lifecycle state of a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxStatus {
    /// Available for lending.
    Idle,
    /// Lent out with an execution in flight.
    Busy,
    /// Faulted; must be destroyed by the pool, never re-lent.
    Error,
}

/// Outcome of one sandbox execution. Produced once, never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    /// Whether the command exited zero.
    pub success: bool,
    /// The command's exit code.
    pub exit_code: i64,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Wall-clock execution time in milliseconds.
    pub execution_time_ms: u64,
    /// Memory usage sampled after the run, in megabytes.
    pub memory_used_mb: f64,
    /// Error detail when the execution could not complete normally.
    pub error: Option<String>,
}

/// Point-in-time resource usage for a sandbox container.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SandboxStats {
    /// Current memory usage in megabytes.
    pub memory_used_mb: f64,
    /// CPU usage percentage over the engine's sampling window.
    pub cpu_percent: f64,
}

/// One isolated execution container plus its scratch workspace.
pub struct Sandbox {
    id: String,
    container_id: String,
    config: SandboxConfig,
    client: std::sync::Arc<dyn ContainerClient>,
    // Held for its Drop: removing the host scratch directory when the
    // sandbox is destroyed.
    _workspace: TempDir,
    workspace_path: Utf8PathBuf,
    status: Mutex<SandboxStatus>,
    created_at: DateTime<Utc>,
    last_used_at: Mutex<DateTime<Utc>>,
    execution_count: AtomicU64,
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("id", &self.id)
            .field("container_id", &self.container_id)
            .field("status", &self.status())
            .field("execution_count", &self.execution_count())
            .finish_non_exhaustive()
    }
}

impl Sandbox {
    /// Wrap an already-created, already-started container.
    pub(crate) fn new(
        client: std::sync::Arc<dyn ContainerClient>,
        config: SandboxConfig,
        container_id: String,
        workspace: TempDir,
        workspace_path: Utf8PathBuf,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            container_id,
            config,
            client,
            _workspace: workspace,
            workspace_path,
            status: Mutex::new(SandboxStatus::Idle),
            created_at: now,
            last_used_at: Mutex::new(now),
            execution_count: AtomicU64::new(0),
        }
    }

    /// Stable identifier for this sandbox, distinct from the container id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Engine-assigned id of the backing container.
    #[must_use]
    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    /// Resource envelope this sandbox was created with.
    #[must_use]
    pub const fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Host-side path of the bind-mounted scratch workspace.
    #[must_use]
    pub fn workspace_path(&self) -> &Utf8Path {
        &self.workspace_path
    }

    /// Current lifecycle status. A poisoned status lock reads as `Error`,
    /// which retires the sandbox rather than re-lending it.
    #[must_use]
    pub fn status(&self) -> SandboxStatus {
        self.status
            .lock()
            .map_or(SandboxStatus::Error, |status| *status)
    }

    pub(crate) fn set_status(&self, next: SandboxStatus) {
        if let Ok(mut status) = self.status.lock() {
            *status = next;
        }
    }

    /// When this sandbox was created.
    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// When this sandbox last finished an execution.
    #[must_use]
    pub fn last_used_at(&self) -> DateTime<Utc> {
        self.last_used_at
            .lock()
            .map_or(self.created_at, |instant| *instant)
    }

    /// How many executions have completed in this sandbox.
    #[must_use]
    pub fn execution_count(&self) -> u64 {
        self.execution_count.load(Ordering::Relaxed)
    }

    /// Run a shell command inside the container, bounded by `timeout`.
    ///
    /// The command runs as the configured unprivileged user in the
    /// configured working directory. On timeout the runaway process is
    /// killed inside the container (best effort): the container is
    /// reusable, only the process is gone. Callers must tolerate the call
    /// returning slightly after the nominal bound, because a dispatched
    /// engine call cannot be interrupted mid-flight.
    ///
    /// The sandbox remains `Busy` after the call returns, whether it
    /// succeeded or timed out; only the pool's `release` marks it `Idle`
    /// again.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::Timeout` when the bound expires and
    /// `ExecutionError::Failed` on an engine fault, in which case the
    /// sandbox is marked `Error` and must be retired by the pool.
    pub async fn execute(
        &self,
        command: &str,
        timeout: Option<u64>,
        env: Option<Vec<String>>,
    ) -> Result<ExecutionResult> {
        self.set_status(SandboxStatus::Busy);
        let timeout_secs = timeout.unwrap_or(self.config.max_execution_time_seconds);
        let options = self.exec_options(command, env);

        let started = Instant::now();
        let bounded = tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            self.client.run_exec(&self.container_id, options),
        )
        .await;

        match bounded {
            Err(_elapsed) => {
                warn!(
                    sandbox_id = %self.id,
                    timeout_secs,
                    "execution timed out; killing runaway process"
                );
                self.kill_runaway().await;
                self.touch();
                Err(ExecutionError::Timeout {
                    seconds: timeout_secs,
                }
                .into())
            }
            Ok(Err(error)) => {
                self.set_status(SandboxStatus::Error);
                Err(ExecutionError::Failed {
                    sandbox_id: self.id.clone(),
                    message: error.to_string(),
                }
                .into())
            }
            Ok(Ok(output)) => {
                self.execution_count.fetch_add(1, Ordering::Relaxed);
                self.touch();
                debug!(
                    sandbox_id = %self.id,
                    exit_code = output.exit_code,
                    "execution finished"
                );
                Ok(ExecutionResult {
                    success: output.exit_code == 0,
                    exit_code: output.exit_code,
                    stdout: output.stdout,
                    stderr: output.stderr,
                    execution_time_ms: started.elapsed().as_millis() as u64,
                    memory_used_mb: 0.0,
                    error: None,
                })
            }
        }
    }

    /// Upload in-memory files into the container's working directory.
    ///
    /// Files travel as a tar archive through the engine API rather than
    /// being written through the host bind mount, so a symlink planted by a
    /// previous execution cannot redirect the write onto the host.
    ///
    /// # Errors
    ///
    /// Returns `ContainerError::UploadFailed` for invalid file names or
    /// engine upload faults.
    pub async fn upload_files(
        &self,
        files: &std::collections::BTreeMap<String, Vec<u8>>,
    ) -> Result<()> {
        if files.is_empty() {
            return Ok(());
        }

        let archive =
            build_files_archive(files).map_err(|error| crate::error::ContainerError::UploadFailed {
                container_id: self.container_id.clone(),
                message: error.to_string(),
            })?;

        self.client
            .upload_archive(&self.container_id, self.config.working_dir.as_str(), archive)
            .await
            .map_err(|error| crate::error::ContainerError::UploadFailed {
                container_id: self.container_id.clone(),
                message: error.to_string(),
            })?;
        Ok(())
    }

    /// Delete everything under the working directory inside the container,
    /// so no artifact from one execution leaks into the next tenant's.
    ///
    /// # Errors
    ///
    /// Returns `ExecutionError::Failed` when the wipe command cannot run;
    /// the pool treats that as grounds to destroy the sandbox.
    pub async fn cleanup(&self) -> Result<()> {
        let wipe = format!("find {} -mindepth 1 -delete", self.config.working_dir);
        let options = self.exec_options(&wipe, None);

        self.client
            .run_exec(&self.container_id, options)
            .await
            .map_err(|error| ExecutionError::Failed {
                sandbox_id: self.id.clone(),
                message: format!("workspace cleanup failed: {error}"),
            })?;
        Ok(())
    }

    /// Sample current memory and CPU usage from container cgroup stats.
    ///
    /// CPU percent is computed from the delta between the sample's current
    /// and previous cumulative counters; any missing or zero field yields
    /// `0.0` rather than an error.
    pub async fn stats(&self) -> SandboxStats {
        let sample = match self.client.stats(&self.container_id).await {
            Ok(sample) => sample,
            Err(error) => {
                debug!(sandbox_id = %self.id, %error, "stats sample unavailable");
                return SandboxStats::default();
            }
        };

        let memory_used_mb = sample.memory_usage_bytes as f64 / (1024.0 * 1024.0);

        let cpu_delta = sample.cpu_total_usage.saturating_sub(sample.precpu_total_usage);
        let system_delta = sample
            .system_cpu_usage
            .saturating_sub(sample.presystem_cpu_usage);
        let cpu_percent = if cpu_delta > 0 && system_delta > 0 && sample.online_cpus > 0 {
            (cpu_delta as f64 / system_delta as f64) * sample.online_cpus as f64 * 100.0
        } else {
            0.0
        };

        SandboxStats {
            memory_used_mb,
            cpu_percent,
        }
    }

    fn exec_options(&self, command: &str, env: Option<Vec<String>>) -> CreateExecOptions<String> {
        CreateExecOptions::<String> {
            cmd: Some(vec![
                String::from("/bin/sh"),
                String::from("-c"),
                String::from(command),
            ]),
            user: Some(self.config.user.clone()),
            working_dir: Some(self.config.working_dir.to_string()),
            env,
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..CreateExecOptions::default()
        }
    }

    /// Best-effort kill of everything the unprivileged user is running.
    ///
    /// The host-side engine call for the timed-out exec cannot be
    /// interrupted, so the process inside the container is killed instead.
    async fn kill_runaway(&self) {
        let uid = self.config.user.split(':').next().unwrap_or("1000");
        let kill = format!("pkill -9 -u {uid} || true");
        let options = CreateExecOptions::<String> {
            cmd: Some(vec![
                String::from("/bin/sh"),
                String::from("-c"),
                kill,
            ]),
            // Root inside the container: the runaway process must not be
            // able to outrank its own killer.
            user: Some(String::from("0")),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..CreateExecOptions::default()
        };

        let result = tokio::time::timeout(
            Duration::from_secs(KILL_TIMEOUT_SECS),
            self.client.run_exec(&self.container_id, options),
        )
        .await;
        match result {
            Ok(Ok(_)) => {}
            Ok(Err(error)) => {
                warn!(sandbox_id = %self.id, %error, "runaway kill failed");
            }
            Err(_elapsed) => {
                warn!(sandbox_id = %self.id, "runaway kill timed out");
            }
        }
    }

    fn touch(&self) {
        if let Ok(mut last_used) = self.last_used_at.lock() {
            *last_used = Utc::now();
        }
    }
}

#[cfg(test)]
mod tests;
