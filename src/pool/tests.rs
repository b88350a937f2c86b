//! Unit tests for pool lending, overflow, eviction, and image fallback.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bollard::errors::Error as BollardError;

use super::*;
use crate::config::DEFAULT_IMAGE;
use crate::engine::{ExecOutput, MockEngineClient};
use crate::error::SandcastleError;

fn pull_error() -> BollardError {
    BollardError::DockerResponseServerError {
        status_code: 404,
        message: String::from("manifest unknown"),
    }
}

/// Wire up a client that successfully pulls, creates, starts, wipes, and
/// removes any number of containers, assigning sequential container ids.
fn permissive_client() -> MockEngineClient {
    let mut client = MockEngineClient::new();
    let counter = Arc::new(AtomicUsize::new(0));

    client
        .expect_pull_image()
        .returning(|_| Box::pin(async { Ok(()) }));
    client.expect_create_container().returning(move |_, _| {
        let id = counter.fetch_add(1, Ordering::SeqCst);
        Box::pin(async move { Ok(format!("container-{id}")) })
    });
    client
        .expect_start_container()
        .returning(|_| Box::pin(async { Ok(()) }));
    client
        .expect_run_exec()
        .returning(|_, _| Box::pin(async { Ok(ExecOutput::default()) }));
    client
        .expect_remove_container()
        .returning(|_| Box::pin(async { Ok(()) }));
    client
}

fn pool_with(client: MockEngineClient, pool_size: usize) -> SandboxPool {
    SandboxPool::new(Arc::new(client), SandboxConfig::default(), pool_size)
}

#[tokio::test]
async fn initialize_prewarms_exactly_pool_size_idle_sandboxes() {
    let pool = pool_with(permissive_client(), 3);
    assert!(pool.initialize().await.is_ok());

    assert_eq!(pool.live_count().await, 3);
    assert_eq!(pool.idle_count().await, 3);
}

#[tokio::test]
async fn acquire_before_initialize_is_an_error() {
    let pool = pool_with(permissive_client(), 1);
    assert!(matches!(
        pool.acquire().await,
        Err(SandcastleError::Pool(PoolError::NotInitialized))
    ));
}

#[tokio::test]
async fn acquire_beyond_the_overflow_ceiling_signals_backpressure() {
    let pool_size = 2;
    let pool = pool_with(permissive_client(), pool_size);
    assert!(pool.initialize().await.is_ok());

    let mut held = Vec::new();
    for _ in 0..pool_size * 2 {
        match pool.acquire().await {
            Ok(sandbox) => held.push(sandbox),
            Err(error) => panic!("acquire under the ceiling failed: {error}"),
        }
    }
    assert_eq!(held.len(), pool_size * 2);

    // The (2N+1)th caller hits the ceiling.
    assert!(matches!(
        pool.acquire().await,
        Err(SandcastleError::Pool(PoolError::Exhausted { live: 4, ceiling: 4 }))
    ));
}

#[tokio::test]
async fn release_then_acquire_reuses_the_same_sandbox() {
    let pool = pool_with(permissive_client(), 2);
    assert!(pool.initialize().await.is_ok());

    let Ok(first) = pool.acquire().await else {
        panic!("first acquire failed");
    };
    let first_id = String::from(first.id());
    pool.release(&first).await;

    // Single active client: no container churn, the same sandbox comes back.
    let Ok(second) = pool.acquire().await else {
        panic!("second acquire failed");
    };
    assert_eq!(second.id(), first_id);
    assert_eq!(pool.live_count().await, 2);
}

#[tokio::test]
async fn a_held_sandbox_is_never_re_lent_after_execute() {
    let pool = pool_with(permissive_client(), 1);
    assert!(pool.initialize().await.is_ok());

    let Ok(first) = pool.acquire().await else {
        panic!("first acquire failed");
    };
    let Ok(result) = first.execute("echo hi", None, None).await else {
        panic!("execute failed");
    };
    assert!(result.success);

    // The holder has not released yet, so a second caller must get an
    // overflow container, not the sandbox still lent to the first.
    let Ok(second) = pool.acquire().await else {
        panic!("second acquire failed");
    };
    assert_ne!(second.id(), first.id());
    assert_eq!(pool.idle_count().await, 0);

    pool.release(&first).await;
    assert_eq!(pool.idle_count().await, 1);
    assert_eq!(pool.live_count().await, 2);
}

#[tokio::test]
async fn concurrent_acquires_never_exceed_the_ceiling() {
    let pool_size = 2;
    let pool = pool_with(permissive_client(), pool_size);
    assert!(pool.initialize().await.is_ok());

    // One more caller than the ceiling admits, racing for sandboxes.
    let outcomes =
        futures_util::future::join_all((0..=pool_size * 2).map(|_| pool.acquire())).await;

    let granted: Vec<_> = outcomes.iter().filter(|outcome| outcome.is_ok()).collect();
    assert_eq!(granted.len(), pool_size * 2);
    assert_eq!(
        outcomes
            .iter()
            .filter(|outcome| matches!(
                outcome,
                Err(SandcastleError::Pool(PoolError::Exhausted { .. }))
            ))
            .count(),
        1
    );

    // Every grant is a distinct sandbox; nothing was double-lent.
    let mut ids: Vec<&str> = outcomes
        .iter()
        .filter_map(|outcome| outcome.as_ref().ok().map(|sandbox| sandbox.id()))
        .collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), pool_size * 2);
    assert_eq!(pool.live_count().await, pool_size * 2);
}

#[tokio::test]
async fn release_destroys_faulted_sandboxes() {
    let mut client = MockEngineClient::new();
    client
        .expect_pull_image()
        .returning(|_| Box::pin(async { Ok(()) }));
    client
        .expect_create_container()
        .returning(|_, _| Box::pin(async { Ok(String::from("container-0")) }));
    client
        .expect_start_container()
        .returning(|_| Box::pin(async { Ok(()) }));
    client
        .expect_remove_container()
        .times(1)
        .withf(|container_id| container_id == "container-0")
        .returning(|_| Box::pin(async { Ok(()) }));

    let pool = pool_with(client, 1);
    assert!(pool.initialize().await.is_ok());

    let Ok(sandbox) = pool.acquire().await else {
        panic!("acquire failed");
    };
    sandbox.set_status(crate::sandbox::SandboxStatus::Error);
    pool.release(&sandbox).await;

    // The faulted sandbox is gone, not re-lent.
    assert_eq!(pool.live_count().await, 0);
}

#[tokio::test]
async fn release_trims_overflow_back_toward_pool_size() {
    let pool = pool_with(permissive_client(), 1);
    assert!(pool.initialize().await.is_ok());

    let Ok(steady) = pool.acquire().await else {
        panic!("steady acquire failed");
    };
    let Ok(overflow) = pool.acquire().await else {
        panic!("overflow acquire failed");
    };
    assert_eq!(pool.live_count().await, 2);

    pool.release(&steady).await;
    // Releasing the overflow sandbox evicts the older idle one.
    pool.release(&overflow).await;

    assert_eq!(pool.live_count().await, 1);
    assert_eq!(pool.idle_count().await, 1);
}

#[tokio::test]
async fn shutdown_destroys_everything() {
    let pool = pool_with(permissive_client(), 2);
    assert!(pool.initialize().await.is_ok());

    pool.shutdown().await;
    assert_eq!(pool.live_count().await, 0);

    // The pool is no longer usable without re-initialization.
    assert!(matches!(
        pool.acquire().await,
        Err(SandcastleError::Pool(PoolError::NotInitialized))
    ));
}

#[tokio::test]
async fn failed_image_pull_degrades_to_the_fallback_image() {
    let mut client = MockEngineClient::new();
    let mut sequence = mockall::Sequence::new();

    client
        .expect_pull_image()
        .times(1)
        .in_sequence(&mut sequence)
        .withf(|image| image == DEFAULT_IMAGE)
        .returning(|_| Box::pin(async { Err(pull_error()) }));
    client
        .expect_pull_image()
        .times(1)
        .in_sequence(&mut sequence)
        .withf(|image| image == FALLBACK_IMAGE)
        .returning(|_| Box::pin(async { Ok(()) }));
    client
        .expect_create_container()
        .withf(|_, body| body.image.as_deref() == Some(FALLBACK_IMAGE))
        .returning(|_, _| Box::pin(async { Ok(String::from("container-0")) }));
    client
        .expect_start_container()
        .returning(|_| Box::pin(async { Ok(()) }));

    let pool = pool_with(client, 1);
    assert!(pool.initialize().await.is_ok());
    assert_eq!(pool.live_count().await, 1);
}

#[tokio::test]
async fn container_creation_applies_the_resource_envelope() {
    let mut client = MockEngineClient::new();
    client
        .expect_pull_image()
        .returning(|_| Box::pin(async { Ok(()) }));
    client
        .expect_create_container()
        .times(1)
        .withf(|name, body| {
            let Some(host) = body.host_config.as_ref() else {
                return false;
            };
            name.starts_with("sandcastle-")
                && body.user.as_deref() == Some("1000:1000")
                && host.memory == Some(512 * 1024 * 1024)
                && host.cpu_period == Some(100_000)
                && host.cpu_quota == Some(100_000)
                && host.network_mode.as_deref() == Some("none")
                && host
                    .security_opt
                    .as_ref()
                    .is_some_and(|opts| opts.iter().any(|opt| opt == "no-new-privileges:true"))
                && host
                    .binds
                    .as_ref()
                    .is_some_and(|binds| binds.iter().any(|bind| bind.ends_with(":/workspace")))
        })
        .returning(|_, _| Box::pin(async { Ok(String::from("container-0")) }));
    client
        .expect_start_container()
        .returning(|_| Box::pin(async { Ok(()) }));

    let pool = pool_with(client, 1);
    assert!(pool.initialize().await.is_ok());
}
