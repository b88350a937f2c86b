//! Public execution API tying policy, pool, and audit together.
//!
//! The [`SandboxManager`] is the single entry point the agent runtime calls.
//! Every `execute_*` call follows the same path: policy check first (a
//! denial never touches a container), acquire a sandbox, optionally upload
//! files, run with the resolved timeout, merge resource stats, append an
//! audit entry, and release the sandbox in all paths so a failed execution
//! never strands a `Busy` container.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::info;

use crate::audit::{AuditLogEntry, AuditOutcome, AuditSink, MemoryAuditSink, code_digest};
use crate::config::SandboxConfig;
use crate::engine::ContainerClient;
use crate::error::{ConfigError, ExecutionError, Result, SandcastleError};
use crate::policy::{PermissionRequest, PolicyEngine};
use crate::pool::SandboxPool;
use crate::sandbox::{ExecutionResult, Sandbox};

/// Caller attribution carried through to the audit trail.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecutionContext {
    /// Session identifier, for audit queries.
    pub session_id: Option<String>,
    /// Agent identifier, for audit queries.
    pub agent_id: Option<String>,
    /// Organisation identifier.
    pub org_id: Option<String>,
    /// Agent role, consulted by role-based policy rules.
    pub agent_role: Option<String>,
}

/// Per-call execution options.
///
/// Groups the optional arguments of the `execute_*` methods into a single
/// struct, following the usual params-struct convention.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOptions {
    /// Execution time bound in seconds; falls back to the tool permission's
    /// bound, then the default envelope.
    pub timeout: Option<u64>,
    /// In-memory files uploaded into the workspace before the command runs.
    pub files: BTreeMap<String, Vec<u8>>,
    /// Extra environment variables in `KEY=value` form.
    pub env: Option<Vec<String>>,
    /// Caller attribution.
    pub context: ExecutionContext,
}

/// Orchestrates policy-gated execution across the sandbox pool.
pub struct SandboxManager {
    policy: PolicyEngine,
    pool: SandboxPool,
    audit: Arc<dyn AuditSink>,
}

impl std::fmt::Debug for SandboxManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxManager")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

/// Identity of one execution attempt, shared by every audit record it emits.
struct AuditScope<'a> {
    tool: &'a str,
    action: &'a str,
    context: &'a ExecutionContext,
    started: Instant,
}

/// Outcome-specific fields of one audit record.
#[derive(Default)]
struct AuditDetail<'a> {
    sandbox_id: Option<&'a str>,
    exit_code: Option<i64>,
    memory_used_mb: f64,
    error: Option<String>,
}

impl SandboxManager {
    /// Create a manager with an in-memory audit sink.
    ///
    /// The pool is sized at `pool_size` steady-state containers and uses
    /// the policy's default resource envelope.
    #[must_use]
    pub fn new(client: Arc<dyn ContainerClient>, policy: PolicyEngine, pool_size: usize) -> Self {
        let config: SandboxConfig = policy.default_config().clone();
        Self {
            policy,
            pool: SandboxPool::new(client, config, pool_size),
            audit: Arc::new(MemoryAuditSink::new()),
        }
    }

    /// Replace the audit sink, e.g. with a durable store.
    #[must_use]
    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = sink;
        self
    }

    /// Pre-warm the sandbox pool.
    ///
    /// # Errors
    ///
    /// Returns `ContainerError` when warm-up container creation fails.
    pub async fn initialize(&self) -> Result<()> {
        self.pool.initialize().await
    }

    /// Destroy all sandboxes.
    pub async fn shutdown(&self) {
        self.pool.shutdown().await;
    }

    /// Execute a code payload in the named language.
    ///
    /// The payload is wrapped in the language's inline-eval form
    /// (`python3 -c`, `node -e`, `bash -c`, `sh -c`) with single-quote
    /// shell escaping. The audit trail records a digest of the code, never
    /// the code itself.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` for an unsupported language,
    /// policy denials, pool backpressure, timeouts, and container faults.
    /// Non-timeout execution faults are reported in the result's `error`
    /// field instead.
    pub async fn execute_code(
        &self,
        language: &str,
        code: &str,
        options: ExecutionOptions,
    ) -> Result<ExecutionResult> {
        let action = code_digest(code);
        let command = match build_code_command(language, code) {
            Ok(command) => command,
            Err(error) => {
                self.record_rejected(TOOL_CODE_RUN, &action, &options.context, &error);
                return Err(error);
            }
        };
        let request = PermissionRequest::new(TOOL_CODE_RUN).with_code(code);
        self.run(TOOL_CODE_RUN, &action, &command, request, options)
            .await
    }

    /// Execute a shell command.
    ///
    /// # Errors
    ///
    /// Returns policy denials, pool backpressure, timeouts, and container
    /// faults; non-timeout execution faults are reported in the result's
    /// `error` field instead.
    pub async fn execute_shell(
        &self,
        command: &str,
        options: ExecutionOptions,
    ) -> Result<ExecutionResult> {
        let request = PermissionRequest::new(TOOL_SHELL_EXEC).with_command(command);
        self.run(TOOL_SHELL_EXEC, command, command, request, options)
            .await
    }

    /// Execute a script file already present in the workspace.
    ///
    /// The interpreter is taken from `language` when given, otherwise
    /// resolved from the file extension; the call then delegates to
    /// [`Self::execute_shell`].
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` when no interpreter can be
    /// resolved, plus everything [`Self::execute_shell`] returns.
    pub async fn execute_file(
        &self,
        filepath: &str,
        language: Option<&str>,
        args: &[String],
        options: ExecutionOptions,
    ) -> Result<ExecutionResult> {
        let command = match build_file_command(filepath, language, args) {
            Ok(command) => command,
            Err(error) => {
                self.record_rejected(TOOL_SHELL_EXEC, filepath, &options.context, &error);
                return Err(error);
            }
        };
        self.execute_shell(&command, options).await
    }

    /// Query the audit trail, most recent entries last.
    ///
    /// Filters by session and agent attribution when given; `limit` caps
    /// the number of returned entries (most recent are kept).
    #[must_use]
    pub fn get_audit_logs(
        &self,
        session_id: Option<&str>,
        agent_id: Option<&str>,
        limit: usize,
    ) -> Vec<AuditLogEntry> {
        let entries: Vec<AuditLogEntry> = self
            .audit
            .snapshot()
            .into_iter()
            .filter(|entry| {
                session_id.is_none_or(|wanted| entry.session_id.as_deref() == Some(wanted))
                    && agent_id.is_none_or(|wanted| entry.agent_id.as_deref() == Some(wanted))
            })
            .collect();

        let skip = entries.len().saturating_sub(limit);
        entries.into_iter().skip(skip).collect()
    }

    /// Number of sandboxes currently idle, exposed for observability.
    pub async fn idle_sandboxes(&self) -> usize {
        self.pool.idle_count().await
    }

    async fn run(
        &self,
        tool: &str,
        action: &str,
        command: &str,
        request: PermissionRequest<'_>,
        options: ExecutionOptions,
    ) -> Result<ExecutionResult> {
        let ExecutionOptions {
            timeout,
            files,
            env,
            context,
        } = options;
        let scope = AuditScope {
            tool,
            action,
            context: &context,
            started: Instant::now(),
        };
        let request = match context.agent_role.as_deref() {
            Some(role) => request.with_agent_role(role),
            None => request,
        };

        if let Err(denial) = self.policy.check_permission(&request) {
            self.record(
                &scope,
                AuditOutcome::Denied,
                AuditDetail {
                    error: Some(denial.to_string()),
                    ..AuditDetail::default()
                },
            );
            return Err(denial.into());
        }

        let timeout = self.resolve_timeout(tool, timeout);
        let sandbox = match self.pool.acquire().await {
            Ok(sandbox) => sandbox,
            Err(error) => {
                // Backpressure and pool faults are audited too; the trail
                // must show every attempt, not just the ones that ran.
                self.record(
                    &scope,
                    AuditOutcome::Failed,
                    AuditDetail {
                        error: Some(error.to_string()),
                        ..AuditDetail::default()
                    },
                );
                return Err(error);
            }
        };
        let outcome = self
            .run_in_sandbox(&sandbox, command, timeout, &files, env)
            .await;
        self.pool.release(&sandbox).await;

        match outcome {
            Ok(result) => {
                self.record(
                    &scope,
                    AuditOutcome::Completed,
                    AuditDetail {
                        sandbox_id: Some(sandbox.id()),
                        exit_code: Some(result.exit_code),
                        memory_used_mb: result.memory_used_mb,
                        error: None,
                    },
                );
                Ok(result)
            }
            Err(SandcastleError::Execution(ExecutionError::Failed { message, .. })) => {
                // Ran but faulted: normalized into the result rather than
                // raised, so callers can distinguish this from the
                // "could not run" classes below.
                self.record(
                    &scope,
                    AuditOutcome::Failed,
                    AuditDetail {
                        sandbox_id: Some(sandbox.id()),
                        error: Some(message.clone()),
                        ..AuditDetail::default()
                    },
                );
                Ok(ExecutionResult {
                    success: false,
                    exit_code: -1,
                    stdout: String::new(),
                    stderr: String::new(),
                    execution_time_ms: scope.started.elapsed().as_millis() as u64,
                    memory_used_mb: 0.0,
                    error: Some(message),
                })
            }
            Err(error) => {
                let audit_outcome = if matches!(
                    error,
                    SandcastleError::Execution(ExecutionError::Timeout { .. })
                ) {
                    AuditOutcome::TimedOut
                } else {
                    AuditOutcome::Failed
                };
                self.record(
                    &scope,
                    audit_outcome,
                    AuditDetail {
                        sandbox_id: Some(sandbox.id()),
                        error: Some(error.to_string()),
                        ..AuditDetail::default()
                    },
                );
                Err(error)
            }
        }
    }

    async fn run_in_sandbox(
        &self,
        sandbox: &Arc<Sandbox>,
        command: &str,
        timeout: u64,
        files: &BTreeMap<String, Vec<u8>>,
        env: Option<Vec<String>>,
    ) -> Result<ExecutionResult> {
        sandbox.upload_files(files).await?;

        let mut result = sandbox.execute(command, Some(timeout), env).await?;

        let stats = sandbox.stats().await;
        result.memory_used_mb = stats.memory_used_mb;
        Ok(result)
    }

    /// Resolve the effective timeout: per-call override, then the tool
    /// permission's bound, then the default envelope.
    fn resolve_timeout(&self, tool: &str, requested: Option<u64>) -> u64 {
        requested
            .or_else(|| {
                self.policy
                    .permission(tool)
                    .and_then(|permission| permission.max_execution_time_seconds)
            })
            .unwrap_or(self.policy.default_config().max_execution_time_seconds)
    }

    /// Audit an attempt rejected before it reached the policy check, such
    /// as an unsupported language or an unresolvable interpreter.
    fn record_rejected(
        &self,
        tool: &str,
        action: &str,
        context: &ExecutionContext,
        error: &SandcastleError,
    ) {
        let scope = AuditScope {
            tool,
            action,
            context,
            started: Instant::now(),
        };
        self.record(
            &scope,
            AuditOutcome::Failed,
            AuditDetail {
                error: Some(error.to_string()),
                ..AuditDetail::default()
            },
        );
    }

    fn record(&self, scope: &AuditScope<'_>, outcome: AuditOutcome, detail: AuditDetail<'_>) {
        let entry = AuditLogEntry {
            timestamp: Utc::now(),
            session_id: scope.context.session_id.clone(),
            agent_id: scope.context.agent_id.clone(),
            org_id: scope.context.org_id.clone(),
            sandbox_id: detail.sandbox_id.map(String::from),
            tool: String::from(scope.tool),
            action: String::from(scope.action),
            duration_ms: scope.started.elapsed().as_millis() as u64,
            exit_code: detail.exit_code,
            memory_used_mb: detail.memory_used_mb,
            outcome,
            error: detail.error,
        };
        info!(
            tool = %entry.tool,
            outcome = ?entry.outcome,
            sandbox_id = entry.sandbox_id.as_deref().unwrap_or("-"),
            "execution attempt audited"
        );
        self.audit.append(entry);
    }
}

const TOOL_CODE_RUN: &str = "code_run";
const TOOL_SHELL_EXEC: &str = "shell_exec";

/// Wrap a payload in single quotes, escaping embedded single quotes with
/// the `'\''` idiom so the payload reaches the interpreter verbatim.
fn shell_escape(payload: &str) -> String {
    format!("'{}'", payload.replace('\'', "'\\''"))
}

/// Build the inline-eval command for a code payload.
fn build_code_command(language: &str, code: &str) -> Result<String> {
    let eval = match language.to_ascii_lowercase().as_str() {
        "python" | "python3" | "py" => "python3 -c",
        "node" | "javascript" | "js" => "node -e",
        "bash" => "bash -c",
        "sh" | "shell" => "sh -c",
        _ => {
            return Err(ConfigError::InvalidValue {
                field: String::from("language"),
                reason: format!("unsupported language: {language}"),
            }
            .into());
        }
    };
    Ok(format!("{eval} {}", shell_escape(code)))
}

/// Build the command for running a script file, resolving the interpreter
/// from the explicit language or the file extension.
fn build_file_command(filepath: &str, language: Option<&str>, args: &[String]) -> Result<String> {
    let resolved = match language {
        Some(lang) => Some(String::from(lang)),
        None => std::path::Path::new(filepath)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase),
    };

    let interpreter = match resolved.as_deref() {
        Some("python" | "python3" | "py") => "python3",
        Some("node" | "javascript" | "js" | "mjs") => "node",
        Some("ruby" | "rb") => "ruby",
        Some("bash") => "bash",
        Some("sh" | "shell") => "sh",
        _ => {
            return Err(ConfigError::InvalidValue {
                field: String::from("filepath"),
                reason: format!("cannot resolve an interpreter for: {filepath}"),
            }
            .into());
        }
    };

    let mut command = format!("{interpreter} {}", shell_escape(filepath));
    for arg in args {
        command.push(' ');
        command.push_str(&shell_escape(arg));
    }
    Ok(command)
}
