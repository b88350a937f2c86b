//! Unit tests for the sandbox execution state machine.

use std::sync::Arc;

use bollard::errors::Error as BollardError;
use camino::Utf8PathBuf;
use tempfile::TempDir;

use super::*;
use crate::engine::{ExecOutput, MockEngineClient, StatsSample};
use crate::error::SandcastleError;

fn scratch() -> (TempDir, Utf8PathBuf) {
    let Ok(dir) = tempfile::tempdir() else {
        panic!("failed to create scratch directory");
    };
    let path = Utf8PathBuf::from(dir.path().to_string_lossy().into_owned());
    (dir, path)
}

fn sandbox_with(client: MockEngineClient) -> Sandbox {
    let (dir, path) = scratch();
    Sandbox::new(
        Arc::new(client),
        SandboxConfig::default(),
        String::from("container-1"),
        dir,
        path,
    )
}

fn server_error() -> BollardError {
    BollardError::DockerResponseServerError {
        status_code: 500,
        message: String::from("engine unavailable"),
    }
}

#[tokio::test]
async fn successful_execution_stays_held_and_counts() {
    let mut client = MockEngineClient::new();
    client.expect_run_exec().times(1).returning(|_, options| {
        let cmd = options.cmd.unwrap_or_default();
        assert_eq!(cmd.first().map(String::as_str), Some("/bin/sh"));
        assert_eq!(cmd.get(1).map(String::as_str), Some("-c"));
        Box::pin(async {
            Ok(ExecOutput {
                exit_code: 0,
                stdout: String::from("2\n"),
                stderr: String::new(),
            })
        })
    });

    let sandbox = sandbox_with(client);
    let result = sandbox.execute("echo 2", None, None).await;

    let Ok(result) = result else {
        panic!("expected success, got {result:?}");
    };
    assert!(result.success);
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.stdout, "2\n");
    // Only the pool's release hands a sandbox back; execute leaves it held.
    assert_eq!(sandbox.status(), SandboxStatus::Busy);
    assert_eq!(sandbox.execution_count(), 1);
}

#[tokio::test]
async fn nonzero_exit_is_not_a_fault() {
    let mut client = MockEngineClient::new();
    client.expect_run_exec().times(1).returning(|_, _| {
        Box::pin(async {
            Ok(ExecOutput {
                exit_code: 2,
                stdout: String::new(),
                stderr: String::from("no such file"),
            })
        })
    });

    let sandbox = sandbox_with(client);
    let result = sandbox.execute("cat missing", None, None).await;

    let Ok(result) = result else {
        panic!("expected a result, got {result:?}");
    };
    assert!(!result.success);
    assert_eq!(result.exit_code, 2);
    assert_eq!(sandbox.status(), SandboxStatus::Busy);
}

#[tokio::test]
async fn engine_fault_marks_the_sandbox_error() {
    let mut client = MockEngineClient::new();
    client
        .expect_run_exec()
        .times(1)
        .returning(|_, _| Box::pin(async { Err(server_error()) }));

    let sandbox = sandbox_with(client);
    let result = sandbox.execute("echo hi", None, None).await;

    assert!(matches!(
        result,
        Err(SandcastleError::Execution(ExecutionError::Failed { .. }))
    ));
    assert_eq!(sandbox.status(), SandboxStatus::Error);
    assert_eq!(sandbox.execution_count(), 0);
}

#[tokio::test]
async fn timeout_kills_the_runaway_and_leaves_the_container_reusable() {
    let mut client = MockEngineClient::new();
    let mut sequence = mockall::Sequence::new();

    client
        .expect_run_exec()
        .times(1)
        .in_sequence(&mut sequence)
        .returning(|_, _| {
            Box::pin(std::future::pending::<std::result::Result<ExecOutput, BollardError>>())
        });
    client
        .expect_run_exec()
        .times(1)
        .in_sequence(&mut sequence)
        .withf(|_, options| {
            options
                .cmd
                .as_ref()
                .is_some_and(|cmd| cmd.iter().any(|part| part.contains("pkill -9 -u 1000")))
        })
        .returning(|_, _| Box::pin(async { Ok(ExecOutput::default()) }));
    client
        .expect_run_exec()
        .times(1)
        .in_sequence(&mut sequence)
        .returning(|_, _| {
            Box::pin(async {
                Ok(ExecOutput {
                    exit_code: 0,
                    stdout: String::from("ok\n"),
                    stderr: String::new(),
                })
            })
        });

    let sandbox = sandbox_with(client);
    let result = sandbox.execute("sleep 600", Some(0), None).await;

    assert!(matches!(
        result,
        Err(SandcastleError::Execution(ExecutionError::Timeout { seconds: 0 }))
    ));
    // Timeout is not a fault: the sandbox stays held, not marked Error,
    // so release will wipe it and return it to the idle set.
    assert_eq!(sandbox.status(), SandboxStatus::Busy);

    // The same sandbox keeps working after the runaway kill.
    let followup = sandbox.execute("echo ok", None, None).await;
    let Ok(followup) = followup else {
        panic!("expected the follow-up execution to succeed, got {followup:?}");
    };
    assert!(followup.success);
    assert_eq!(sandbox.execution_count(), 1);
}

#[tokio::test]
async fn cleanup_wipes_the_working_directory() {
    let mut client = MockEngineClient::new();
    client
        .expect_run_exec()
        .times(1)
        .withf(|container_id, options| {
            container_id == "container-1"
                && options.cmd.as_ref().is_some_and(|cmd| {
                    cmd.iter()
                        .any(|part| part == "find /workspace -mindepth 1 -delete")
                })
        })
        .returning(|_, _| Box::pin(async { Ok(ExecOutput::default()) }));

    let sandbox = sandbox_with(client);
    assert!(sandbox.cleanup().await.is_ok());
}

#[tokio::test]
async fn stats_compute_cpu_percent_from_counter_deltas() {
    let mut client = MockEngineClient::new();
    client.expect_stats().times(1).returning(|_| {
        Box::pin(async {
            Ok(StatsSample {
                memory_usage_bytes: 256 * 1024 * 1024,
                cpu_total_usage: 2_000,
                precpu_total_usage: 1_000,
                system_cpu_usage: 20_000,
                presystem_cpu_usage: 10_000,
                online_cpus: 2,
            })
        })
    });

    let sandbox = sandbox_with(client);
    let stats = sandbox.stats().await;

    assert!((stats.memory_used_mb - 256.0).abs() < f64::EPSILON);
    // 1000 / 10000 * 2 cpus * 100 = 20%
    assert!((stats.cpu_percent - 20.0).abs() < f64::EPSILON);
}

#[tokio::test]
async fn stats_default_to_zero_on_missing_fields() {
    let mut client = MockEngineClient::new();
    client
        .expect_stats()
        .times(1)
        .returning(|_| Box::pin(async { Ok(StatsSample::default()) }));

    let sandbox = sandbox_with(client);
    let stats = sandbox.stats().await;
    assert_eq!(stats, SandboxStats::default());
}

#[tokio::test]
async fn stats_errors_are_swallowed_into_zeros() {
    let mut client = MockEngineClient::new();
    client
        .expect_stats()
        .times(1)
        .returning(|_| Box::pin(async { Err(server_error()) }));

    let sandbox = sandbox_with(client);
    assert_eq!(sandbox.stats().await, SandboxStats::default());
}
