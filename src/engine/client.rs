//! The narrow engine-client trait the sandbox subsystem is written against.
//!
//! The trait exposes exactly the operations the pool and sandbox need:
//! container lifecycle, one-shot command execution with collected output,
//! archive upload, a stats sample, and image pulling. It is implemented for
//! [`bollard::Docker`] and mocked with `mockall` in tests.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bollard::Docker;
use bollard::container::LogOutput;
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::ContainerCreateBody;
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder, RemoveContainerOptionsBuilder,
    StartContainerOptions, StatsOptionsBuilder, UploadToContainerOptionsBuilder,
};
use futures_util::StreamExt;

/// How often a finished exec session is re-inspected for its exit code.
const EXEC_INSPECT_POLL_INTERVAL_MS: u64 = 100;

/// Boxed future type returned by [`ContainerClient`] methods.
pub type ClientFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, BollardError>> + Send + 'a>>;

/// Collected output of a one-shot exec session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Exit code reported by exec inspect.
    pub exit_code: i64,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

/// One resource-usage sample for a running container.
///
/// The engine embeds the previous CPU counters in each sample, so one sample
/// is enough to compute a usage delta. Missing fields are zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSample {
    /// Current memory usage in bytes.
    pub memory_usage_bytes: u64,
    /// Cumulative container CPU usage, current sample.
    pub cpu_total_usage: u64,
    /// Cumulative container CPU usage, previous sample.
    pub precpu_total_usage: u64,
    /// Cumulative host CPU usage, current sample.
    pub system_cpu_usage: u64,
    /// Cumulative host CPU usage, previous sample.
    pub presystem_cpu_usage: u64,
    /// Number of CPUs available to the container.
    pub online_cpus: u64,
}

/// Behaviour required of a container engine by the sandbox subsystem.
pub trait ContainerClient: Send + Sync {
    /// Create a named container and return its engine-assigned id.
    fn create_container(
        &self,
        name: &str,
        body: ContainerCreateBody,
    ) -> ClientFuture<'_, String>;

    /// Start a created container.
    fn start_container(&self, container_id: &str) -> ClientFuture<'_, ()>;

    /// Force-remove a container.
    fn remove_container(&self, container_id: &str) -> ClientFuture<'_, ()>;

    /// Run a command to completion in a running container, collecting its
    /// output and exit code.
    fn run_exec(
        &self,
        container_id: &str,
        options: CreateExecOptions<String>,
    ) -> ClientFuture<'_, ExecOutput>;

    /// Upload a tar archive into the container at `dest_path`.
    fn upload_archive(
        &self,
        container_id: &str,
        dest_path: &str,
        archive: Vec<u8>,
    ) -> ClientFuture<'_, ()>;

    /// Take one resource-usage sample for a running container.
    fn stats(&self, container_id: &str) -> ClientFuture<'_, StatsSample>;

    /// Pull an image, draining the progress stream.
    fn pull_image(&self, image: &str) -> ClientFuture<'_, ()>;
}

impl ContainerClient for Docker {
    fn create_container(
        &self,
        name: &str,
        body: ContainerCreateBody,
    ) -> ClientFuture<'_, String> {
        let options = CreateContainerOptionsBuilder::new().name(name).build();
        Box::pin(async move {
            let response = Self::create_container(self, Some(options), body).await?;
            Ok(response.id)
        })
    }

    fn start_container(&self, container_id: &str) -> ClientFuture<'_, ()> {
        let container_id_owned = String::from(container_id);
        Box::pin(async move {
            Self::start_container(self, &container_id_owned, None::<StartContainerOptions>).await
        })
    }

    fn remove_container(&self, container_id: &str) -> ClientFuture<'_, ()> {
        let container_id_owned = String::from(container_id);
        let options = RemoveContainerOptionsBuilder::new().force(true).build();
        Box::pin(async move {
            Self::remove_container(self, &container_id_owned, Some(options)).await
        })
    }

    fn run_exec(
        &self,
        container_id: &str,
        options: CreateExecOptions<String>,
    ) -> ClientFuture<'_, ExecOutput> {
        let container_id_owned = String::from(container_id);
        Box::pin(async move {
            let created = Self::create_exec(self, &container_id_owned, options).await?;
            let exec_id = created.id;

            let mut output = ExecOutput::default();
            match Self::start_exec(self, &exec_id, None).await? {
                StartExecResults::Attached {
                    output: mut stream, ..
                } => {
                    while let Some(chunk) = stream.next().await {
                        match chunk? {
                            LogOutput::StdOut { message } => {
                                output.stdout.push_str(&String::from_utf8_lossy(&message));
                            }
                            LogOutput::StdErr { message } => {
                                output.stderr.push_str(&String::from_utf8_lossy(&message));
                            }
                            LogOutput::StdIn { .. } | LogOutput::Console { .. } => {}
                        }
                    }
                }
                StartExecResults::Detached => {}
            }

            output.exit_code = wait_for_exit_code(self, &exec_id).await?;
            Ok(output)
        })
    }

    fn upload_archive(
        &self,
        container_id: &str,
        dest_path: &str,
        archive: Vec<u8>,
    ) -> ClientFuture<'_, ()> {
        let container_id_owned = String::from(container_id);
        let options = UploadToContainerOptionsBuilder::new().path(dest_path).build();
        Box::pin(async move {
            Self::upload_to_container(
                self,
                &container_id_owned,
                Some(options),
                bollard::body_full(archive.into()),
            )
            .await
        })
    }

    fn stats(&self, container_id: &str) -> ClientFuture<'_, StatsSample> {
        let container_id_owned = String::from(container_id);
        let options = StatsOptionsBuilder::new().stream(false).build();
        Box::pin(async move {
            let mut stream = Self::stats(self, &container_id_owned, Some(options));
            let Some(response) = stream.next().await else {
                return Ok(StatsSample::default());
            };
            Ok(sample_from_response(&response?))
        })
    }

    fn pull_image(&self, image: &str) -> ClientFuture<'_, ()> {
        let options = CreateImageOptionsBuilder::new().from_image(image).build();
        Box::pin(async move {
            let mut stream = self.create_image(Some(options), None, None);
            while let Some(progress) = stream.next().await {
                let _ = progress?;
            }
            Ok(())
        })
    }
}

/// Poll exec inspect until the process reports not-running, then return its
/// exit code. A missing exit code maps to `-1` rather than an error.
async fn wait_for_exit_code(docker: &Docker, exec_id: &str) -> Result<i64, BollardError> {
    loop {
        let inspect = docker.inspect_exec(exec_id).await?;
        if inspect.running != Some(true) {
            return Ok(inspect.exit_code.unwrap_or(-1));
        }
        tokio::time::sleep(Duration::from_millis(EXEC_INSPECT_POLL_INTERVAL_MS)).await;
    }
}

/// Flatten the engine's nested stats response into a [`StatsSample`],
/// defaulting every missing field to zero.
fn sample_from_response(response: &bollard::models::ContainerStatsResponse) -> StatsSample {
    let memory_usage_bytes = response
        .memory_stats
        .as_ref()
        .and_then(|memory| memory.usage)
        .unwrap_or(0);

    let cpu = response.cpu_stats.as_ref();
    let precpu = response.precpu_stats.as_ref();

    StatsSample {
        memory_usage_bytes,
        cpu_total_usage: cpu
            .and_then(|stats| stats.cpu_usage.as_ref())
            .and_then(|usage| usage.total_usage)
            .unwrap_or(0),
        precpu_total_usage: precpu
            .and_then(|stats| stats.cpu_usage.as_ref())
            .and_then(|usage| usage.total_usage)
            .unwrap_or(0),
        system_cpu_usage: cpu.and_then(|stats| stats.system_cpu_usage).unwrap_or(0),
        presystem_cpu_usage: precpu.and_then(|stats| stats.system_cpu_usage).unwrap_or(0),
        online_cpus: cpu
            .and_then(|stats| stats.online_cpus)
            .map(u64::from)
            .unwrap_or(0),
    }
}

#[cfg(test)]
mockall::mock! {
    /// Test double for [`ContainerClient`], shared by pool, sandbox, and
    /// manager tests.
    #[derive(Debug)]
    pub EngineClient {}

    impl ContainerClient for EngineClient {
        fn create_container(&self, name: &str, body: ContainerCreateBody) -> ClientFuture<'_, String>;
        fn start_container(&self, container_id: &str) -> ClientFuture<'_, ()>;
        fn remove_container(&self, container_id: &str) -> ClientFuture<'_, ()>;
        fn run_exec(&self, container_id: &str, options: CreateExecOptions<String>) -> ClientFuture<'_, ExecOutput>;
        fn upload_archive(&self, container_id: &str, dest_path: &str, archive: Vec<u8>) -> ClientFuture<'_, ()>;
        fn stats(&self, container_id: &str) -> ClientFuture<'_, StatsSample>;
        fn pull_image(&self, image: &str) -> ClientFuture<'_, ()>;
    }
}
