//! Ownership and lending of sandbox containers.
//!
//! The pool pre-warms a steady-state set of containers, lends them one
//! caller at a time, and absorbs bursts with overflow containers up to twice
//! the steady-state size. Every mutation — the idle scan, the busy marking,
//! overflow creation, and eviction — happens under one async mutex, so two
//! concurrent `acquire` calls can never claim the same idle sandbox.

use std::sync::Arc;

use bollard::models::{ContainerCreateBody, HostConfig};
use camino::Utf8PathBuf;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{FALLBACK_IMAGE, SandboxConfig};
use crate::engine::ContainerClient;
use crate::error::{ContainerError, PoolError, Result};
use crate::sandbox::{Sandbox, SandboxStatus};

/// CPU quota period in microseconds; quota is computed against this.
const CPU_PERIOD_MICROS: i64 = 100_000;

struct PoolInner {
    sandboxes: Vec<Arc<Sandbox>>,
    image: String,
    initialized: bool,
}

/// Owns the live sandboxes and the lend/reclaim/grow/shrink logic.
pub struct SandboxPool {
    client: Arc<dyn ContainerClient>,
    config: SandboxConfig,
    pool_size: usize,
    inner: tokio::sync::Mutex<PoolInner>,
}

impl std::fmt::Debug for SandboxPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxPool")
            .field("pool_size", &self.pool_size)
            .finish_non_exhaustive()
    }
}

impl SandboxPool {
    /// Create a pool that will hold `pool_size` steady-state sandboxes.
    #[must_use]
    pub fn new(client: Arc<dyn ContainerClient>, config: SandboxConfig, pool_size: usize) -> Self {
        let image = config.docker_image.clone();
        Self {
            client,
            config,
            pool_size,
            inner: tokio::sync::Mutex::new(PoolInner {
                sandboxes: Vec::new(),
                image,
                initialized: false,
            }),
        }
    }

    /// Pull the configured image and pre-warm the steady-state sandboxes.
    ///
    /// A failed pull of the configured image degrades to a known-good
    /// minimal image instead of failing pool startup; only when container
    /// creation itself fails does initialization error out.
    ///
    /// # Errors
    ///
    /// Returns `ContainerError` when a warm-up container cannot be created
    /// or started.
    pub async fn initialize(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.image = self.ensure_image().await;

        while inner.sandboxes.len() < self.pool_size {
            let sandbox = self.create_sandbox(&inner.image).await?;
            inner.sandboxes.push(sandbox);
        }
        inner.initialized = true;
        info!(pool_size = self.pool_size, image = %inner.image, "sandbox pool ready");
        Ok(())
    }

    /// Borrow an idle sandbox, creating an overflow container if needed.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::NotInitialized` before `initialize()`,
    /// `PoolError::Exhausted` when the overflow ceiling (2 × pool size) is
    /// reached — a backpressure signal, safe to retry after backoff — and
    /// `ContainerError` when overflow creation fails.
    pub async fn acquire(&self) -> Result<Arc<Sandbox>> {
        let mut inner = self.inner.lock().await;
        if !inner.initialized {
            return Err(PoolError::NotInitialized.into());
        }

        if let Some(sandbox) = inner
            .sandboxes
            .iter()
            .find(|sandbox| sandbox.status() == SandboxStatus::Idle)
        {
            sandbox.set_status(SandboxStatus::Busy);
            debug!(sandbox_id = %sandbox.id(), "lending idle sandbox");
            return Ok(Arc::clone(sandbox));
        }

        let ceiling = self.pool_size * 2;
        if inner.sandboxes.len() >= ceiling {
            return Err(PoolError::Exhausted {
                live: inner.sandboxes.len(),
                ceiling,
            }
            .into());
        }

        // Overflow creation happens under the lock: slower for the burst
        // that triggers it, but the live count can never overshoot the
        // ceiling.
        let image = inner.image.clone();
        let sandbox = self.create_sandbox(&image).await?;
        sandbox.set_status(SandboxStatus::Busy);
        info!(sandbox_id = %sandbox.id(), live = inner.sandboxes.len() + 1, "created overflow sandbox");
        inner.sandboxes.push(Arc::clone(&sandbox));
        Ok(sandbox)
    }

    /// Return a sandbox to the pool.
    ///
    /// This is the only transition back to `Idle`: a lent sandbox stays
    /// `Busy` across `execute` calls until its holder releases it here.
    ///
    /// Faulted (`Error`) sandboxes are destroyed, never re-lent. Healthy
    /// ones have their workspace wiped before going back to `Idle`; a
    /// failed wipe also retires the sandbox, because a workspace that
    /// cannot be proven clean must not reach the next tenant. When the live
    /// count exceeds the steady-state size, the single oldest idle sandbox
    /// (other than the one just released) is destroyed, trimming overflow
    /// back toward `pool_size`.
    pub async fn release(&self, sandbox: &Arc<Sandbox>) {
        let mut inner = self.inner.lock().await;

        if sandbox.status() == SandboxStatus::Error {
            warn!(sandbox_id = %sandbox.id(), "retiring faulted sandbox");
            Self::remove_from(&mut inner.sandboxes, sandbox.id());
            self.destroy(sandbox).await;
            return;
        }

        if let Err(error) = sandbox.cleanup().await {
            warn!(sandbox_id = %sandbox.id(), %error, "workspace wipe failed; retiring sandbox");
            Self::remove_from(&mut inner.sandboxes, sandbox.id());
            self.destroy(sandbox).await;
            return;
        }

        sandbox.set_status(SandboxStatus::Idle);

        if inner.sandboxes.len() > self.pool_size {
            self.evict_oldest_idle(&mut inner.sandboxes, sandbox.id()).await;
        }
    }

    /// Destroy every sandbox and mark the pool uninitialized.
    pub async fn shutdown(&self) {
        let mut inner = self.inner.lock().await;
        for sandbox in inner.sandboxes.drain(..) {
            self.destroy(&sandbox).await;
        }
        inner.initialized = false;
        info!("sandbox pool shut down");
    }

    /// Number of live sandboxes (idle and busy).
    pub async fn live_count(&self) -> usize {
        self.inner.lock().await.sandboxes.len()
    }

    /// Number of sandboxes currently available for lending.
    pub async fn idle_count(&self) -> usize {
        self.inner
            .lock()
            .await
            .sandboxes
            .iter()
            .filter(|sandbox| sandbox.status() == SandboxStatus::Idle)
            .count()
    }

    /// Pull the configured image, degrading to [`FALLBACK_IMAGE`] on failure.
    async fn ensure_image(&self) -> String {
        let configured = self.config.docker_image.clone();
        match self.client.pull_image(&configured).await {
            Ok(()) => configured,
            Err(error) => {
                warn!(image = %configured, %error, "image pull failed; trying fallback image");
                match self.client.pull_image(FALLBACK_IMAGE).await {
                    Ok(()) => String::from(FALLBACK_IMAGE),
                    Err(fallback_error) => {
                        // A locally cached copy of the configured image may
                        // still exist; container creation will say so.
                        warn!(%fallback_error, "fallback image pull failed; keeping configured image");
                        configured
                    }
                }
            }
        }
    }

    async fn create_sandbox(&self, image: &str) -> Result<Arc<Sandbox>> {
        let workspace = tempfile::Builder::new()
            .prefix("sandcastle-ws-")
            .tempdir()
            .map_err(|error| ContainerError::CreateFailed {
                message: format!("workspace directory creation failed: {error}"),
            })?;
        let workspace_path = Utf8PathBuf::from(workspace.path().to_string_lossy().into_owned());

        let name = format!("sandcastle-{}", Uuid::new_v4().simple());
        let body = self.container_body(image, &workspace_path);

        let container_id = self
            .client
            .create_container(&name, body)
            .await
            .map_err(|error| ContainerError::CreateFailed {
                message: error.to_string(),
            })?;

        self.client
            .start_container(&container_id)
            .await
            .map_err(|error| ContainerError::StartFailed {
                container_id: container_id.clone(),
                message: error.to_string(),
            })?;

        debug!(container_id = %container_id, image, "sandbox container started");
        Ok(Arc::new(Sandbox::new(
            Arc::clone(&self.client),
            self.config.clone(),
            container_id,
            workspace,
            workspace_path,
        )))
    }

    /// Translate the resource envelope into a container-create payload.
    fn container_body(&self, image: &str, workspace_path: &camino::Utf8Path) -> ContainerCreateBody {
        let mut security_opt = vec![String::from("no-new-privileges:true")];
        if let Some(profile) = &self.config.seccomp_profile {
            security_opt.push(format!("seccomp={profile}"));
        }

        let host_config = HostConfig {
            memory: Some((self.config.max_memory_mb * 1024 * 1024) as i64),
            cpu_period: Some(CPU_PERIOD_MICROS),
            cpu_quota: Some((self.config.max_cpu_cores * CPU_PERIOD_MICROS as f64) as i64),
            network_mode: (!self.config.network_access).then(|| String::from("none")),
            security_opt: Some(security_opt),
            binds: Some(vec![format!(
                "{workspace_path}:{}",
                self.config.working_dir
            )]),
            ..HostConfig::default()
        };

        ContainerCreateBody {
            image: Some(String::from(image)),
            // Parked process keeping the container alive between execs;
            // portable across slim and busybox-based images.
            cmd: Some(vec![
                String::from("tail"),
                String::from("-f"),
                String::from("/dev/null"),
            ]),
            user: Some(self.config.user.clone()),
            working_dir: Some(self.config.working_dir.to_string()),
            host_config: Some(host_config),
            ..ContainerCreateBody::default()
        }
    }

    async fn evict_oldest_idle(&self, sandboxes: &mut Vec<Arc<Sandbox>>, keep_id: &str) {
        let oldest = sandboxes
            .iter()
            .filter(|candidate| {
                candidate.status() == SandboxStatus::Idle && candidate.id() != keep_id
            })
            .min_by_key(|candidate| candidate.last_used_at())
            .map(|candidate| String::from(candidate.id()));

        if let Some(evict_id) = oldest {
            debug!(sandbox_id = %evict_id, "evicting oldest idle sandbox");
            if let Some(sandbox) = Self::remove_from(sandboxes, &evict_id) {
                self.destroy(&sandbox).await;
            }
        }
    }

    fn remove_from(sandboxes: &mut Vec<Arc<Sandbox>>, id: &str) -> Option<Arc<Sandbox>> {
        sandboxes
            .iter()
            .position(|sandbox| sandbox.id() == id)
            .map(|index| sandboxes.swap_remove(index))
    }

    /// Remove the backing container; failures are logged, not raised, so a
    /// stuck engine cannot wedge release or shutdown.
    async fn destroy(&self, sandbox: &Arc<Sandbox>) {
        if let Err(error) = self.client.remove_container(sandbox.container_id()).await {
            warn!(
                container_id = %sandbox.container_id(),
                %error,
                "failed to remove sandbox container"
            );
        }
    }
}

#[cfg(test)]
mod tests;
