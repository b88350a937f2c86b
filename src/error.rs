//! Semantic error types for the sandcastle sandbox subsystem.
//!
//! This module defines the error hierarchy for the crate, following the
//! principle of using semantic error enums (via `thiserror`) for conditions
//! the caller must be able to inspect: a policy denial must never look like a
//! container fault, and a pool-exhaustion backpressure signal must never look
//! like a fatal error.

use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors that can occur while loading or parsing policy configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The policy file was not found at the expected path.
    #[error("policy file not found: {path}")]
    FileNotFound {
        /// The path where the policy file was expected.
        path: Utf8PathBuf,
    },

    /// The policy file could not be parsed as YAML.
    #[error("failed to parse policy file: {message}")]
    ParseError {
        /// A description of the parse error.
        message: String,
    },

    /// A size or duration string used an unknown unit or malformed value.
    #[error("invalid {kind} value '{value}': {reason}")]
    InvalidUnit {
        /// What was being parsed (`memory` or `duration`).
        kind: &'static str,
        /// The offending input string.
        value: String,
        /// The reason the value is invalid.
        reason: String,
    },

    /// A configuration value failed validation.
    #[error("invalid configuration value for '{field}': {reason}")]
    InvalidValue {
        /// The name of the invalid field.
        field: String,
        /// The reason the value is invalid.
        reason: String,
    },
}

/// Policy denials raised by the policy engine.
///
/// Every denial is an error, never a silent `false`: callers cannot ignore a
/// denial, and each variant names the specific rule that fired so a rejected
/// command never silently "does nothing".
#[derive(Debug, Error)]
pub enum PolicyError {
    /// The agent role's tool allow-list does not include the requested tool.
    #[error("role '{role}' is not permitted to use tool '{tool}'")]
    RoleDenied {
        /// The requesting agent role.
        role: String,
        /// The tool that was requested.
        tool: String,
    },

    /// The tool requires human approval before execution.
    ///
    /// The caller, not the policy engine, obtains approval and retries.
    #[error("tool '{tool}' requires approval before execution")]
    ApprovalRequired {
        /// The tool that needs approval.
        tool: String,
    },

    /// The command contained a globally blocked substring or matched a
    /// globally blocked pattern. These rules are non-overridable.
    #[error("command blocked by global rule '{rule}': {command}")]
    CommandBlocked {
        /// The blocklist entry or pattern that matched.
        rule: String,
        /// The offending command.
        command: String,
    },

    /// The command contained a tool-specific denied substring.
    #[error("command contains denied entry '{entry}' for tool '{tool}'")]
    CommandDenied {
        /// The `denied_commands` entry that matched.
        entry: String,
        /// The tool whose policy fired.
        tool: String,
    },

    /// The tool runs in allowlist mode and the command's base token is not
    /// on the allow-list.
    #[error("command '{base}' is not in the allow-list for tool '{tool}'")]
    CommandNotAllowed {
        /// The first whitespace-delimited token of the command.
        base: String,
        /// The tool whose policy fired.
        tool: String,
    },

    /// The path matched a denied glob pattern.
    #[error("path '{path}' matches denied pattern '{pattern}' for tool '{tool}'")]
    PathDenied {
        /// The offending path.
        path: String,
        /// The `denied_paths` glob that matched.
        pattern: String,
        /// The tool whose policy fired.
        tool: String,
    },

    /// The tool runs in path-allowlist mode and the path matched no entry.
    #[error("path '{path}' is not in the allowed paths for tool '{tool}'")]
    PathNotAllowed {
        /// The offending path.
        path: String,
        /// The tool whose policy fired.
        tool: String,
    },
}

/// Errors that can occur during container engine operations.
///
/// These are fatal to the one container involved, never to the pool.
#[derive(Debug, Error)]
pub enum ContainerError {
    /// Failed to connect to the container engine socket.
    #[error("failed to connect to container engine: {message}")]
    ConnectionFailed {
        /// A description of the connection failure.
        message: String,
    },

    /// Engine health check failed or timed out at connect time.
    #[error("container engine health check failed: {message}")]
    HealthCheckFailed {
        /// A description of the health check failure.
        message: String,
    },

    /// Failed to pull a container image.
    #[error("failed to pull image '{image}': {message}")]
    ImagePullFailed {
        /// The image that could not be pulled.
        image: String,
        /// A description of the pull failure.
        message: String,
    },

    /// Failed to create a container.
    #[error("failed to create container: {message}")]
    CreateFailed {
        /// A description of the creation failure.
        message: String,
    },

    /// Failed to start a container.
    #[error("failed to start container '{container_id}': {message}")]
    StartFailed {
        /// The ID of the container that failed to start.
        container_id: String,
        /// A description of the start failure.
        message: String,
    },

    /// Failed to remove a container.
    #[error("failed to remove container '{container_id}': {message}")]
    RemoveFailed {
        /// The ID of the container that failed to be removed.
        container_id: String,
        /// A description of the removal failure.
        message: String,
    },

    /// Failed to upload files into a container workspace.
    #[error("failed to upload files to container '{container_id}': {message}")]
    UploadFailed {
        /// The ID of the target container.
        container_id: String,
        /// A description of the upload failure.
        message: String,
    },

    /// Failed to execute a command in a container.
    #[error("failed to execute command in container '{container_id}': {message}")]
    ExecFailed {
        /// The ID of the container.
        container_id: String,
        /// A description of the execution failure.
        message: String,
    },
}

/// Execution faults inside an acquired sandbox.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The command exceeded its execution time bound.
    ///
    /// The runaway process is killed inside the container; the container
    /// itself stays reusable.
    #[error("execution timed out after {seconds} seconds")]
    Timeout {
        /// The timeout bound in seconds.
        seconds: u64,
    },

    /// A generic execution fault inside the container.
    ///
    /// The owning sandbox is marked `Error` and must be destroyed on the
    /// next release, never reused.
    #[error("execution failed in sandbox '{sandbox_id}': {message}")]
    Failed {
        /// The sandbox where the fault occurred.
        sandbox_id: String,
        /// A description of the fault.
        message: String,
    },
}

/// Errors raised by the sandbox pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No idle sandbox is available and the overflow ceiling is reached.
    ///
    /// This is a backpressure signal: callers may retry after backoff or
    /// queue, and must not treat it as fatal.
    #[error("sandbox pool exhausted: {live} live sandboxes at ceiling {ceiling}")]
    Exhausted {
        /// The number of live sandboxes.
        live: usize,
        /// The overflow ceiling (2 × pool size).
        ceiling: usize,
    },

    /// The pool was used before `initialize()` or after `shutdown()`.
    #[error("sandbox pool is not initialized")]
    NotInitialized,
}

/// Top-level error type for the sandcastle crate.
///
/// This enum aggregates all domain-specific errors into a single type. The
/// variant boundary is load-bearing for callers: `Policy` never reached a
/// container, `Pool` is retryable backpressure, `Execution::Timeout` ran and
/// was bounded, and `Container` means the engine itself misbehaved.
#[derive(Debug, Error)]
pub enum SandcastleError {
    /// An error occurred during policy configuration loading.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The policy engine denied the request.
    #[error(transparent)]
    Policy(#[from] PolicyError),

    /// An error occurred during container engine operations.
    #[error(transparent)]
    Container(#[from] ContainerError),

    /// An error occurred while executing inside a sandbox.
    #[error(transparent)]
    Execution(#[from] ExecutionError),

    /// An error was raised by the sandbox pool.
    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl SandcastleError {
    /// Returns true when the error is the pool's backpressure signal and the
    /// operation is safe to retry after backoff.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Pool(PoolError::Exhausted { .. }))
    }

    /// Returns true when the request was denied by policy before any
    /// container was touched.
    #[must_use]
    pub const fn is_denial(&self) -> bool {
        matches!(self, Self::Policy(_))
    }
}

/// A specialised `Result` type for sandcastle operations.
pub type Result<T> = std::result::Result<T, SandcastleError>;
