//! Permission rules gating every sandbox execution request.
//!
//! The [`PolicyEngine`] holds per-tool permission records, global command
//! blocklists, and the default resource envelope. It answers two questions:
//! "is this request allowed" ([`PolicyEngine::check_permission`]) and "what
//! limits apply" (via [`PolicyEngine::permission`] and
//! [`PolicyEngine::default_config`]). Denials are always errors, never a
//! silent `false`, so callers cannot ignore them.
//!
//! Rules are loaded once at construction from a YAML file or built-in
//! defaults and are immutable for the process lifetime; there is no hot
//! reload.

mod blocked;
mod loader;

use std::collections::HashMap;

use camino::Utf8Path;
use globset::Glob;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::SandboxConfig;
use crate::error::{ConfigError, PolicyError};

pub use blocked::{BLOCKED_COMMANDS, blocked_command_rule, dangerous_code_findings};

/// Risk classification driving whether sandboxing and approval are required.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Read-only or otherwise benign operations.
    Low,
    /// Operations that mutate state inside the sandbox.
    #[default]
    Medium,
    /// Operations with host- or network-reaching consequences.
    High,
}

/// Per-tool permission record.
///
/// Command lists use substring (denied) and base-command (allowed)
/// semantics; path lists use glob patterns. An empty allow-list means "any
/// entry not explicitly denied passes"; a non-empty allow-list switches the
/// tool into default-deny mode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPermission {
    /// Risk classification for this tool.
    pub risk_level: RiskLevel,

    /// Whether executions for this tool must go through a sandbox.
    pub sandbox_enabled: bool,

    /// Allow-list of base commands; empty means no allowlist mode.
    pub allowed_commands: Vec<String>,

    /// Denied command substrings; deny always takes precedence over allow.
    pub denied_commands: Vec<String>,

    /// Allowed path globs; empty means any path not denied passes.
    pub allowed_paths: Vec<String>,

    /// Denied path globs.
    pub denied_paths: Vec<String>,

    /// Per-tool execution time bound, overriding the default envelope.
    pub max_execution_time_seconds: Option<u64>,

    /// Whether a human approval must be obtained before execution.
    pub requires_approval: bool,
}

/// One permission question put to the engine.
///
/// Built with the usual `with_*` setters; only the tool name is mandatory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionRequest<'a> {
    tool: &'a str,
    command: Option<&'a str>,
    path: Option<&'a str>,
    code: Option<&'a str>,
    agent_role: Option<&'a str>,
}

impl<'a> PermissionRequest<'a> {
    /// Create a request for the named tool.
    #[must_use]
    pub const fn new(tool: &'a str) -> Self {
        Self {
            tool,
            command: None,
            path: None,
            code: None,
            agent_role: None,
        }
    }

    /// Attach the shell command being requested.
    #[must_use]
    pub const fn with_command(mut self, command: &'a str) -> Self {
        self.command = Some(command);
        self
    }

    /// Attach the filesystem path being touched.
    #[must_use]
    pub const fn with_path(mut self, path: &'a str) -> Self {
        self.path = Some(path);
        self
    }

    /// Attach the code payload being requested (advisory scan only).
    #[must_use]
    pub const fn with_code(mut self, code: &'a str) -> Self {
        self.code = Some(code);
        self
    }

    /// Attach the requesting agent's role for role-based gating.
    #[must_use]
    pub const fn with_agent_role(mut self, role: &'a str) -> Self {
        self.agent_role = Some(role);
        self
    }

    /// Return the tool name this request concerns.
    #[must_use]
    pub const fn tool(&self) -> &'a str {
        self.tool
    }
}

/// Holds all permission rules and answers permission questions.
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    default_config: SandboxConfig,
    tools: HashMap<String, ToolPermission>,
    roles: HashMap<String, Vec<String>>,
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl PolicyEngine {
    /// Construct an engine from the built-in default policy.
    ///
    /// Defaults register `file_read` (low risk, unsandboxed) and
    /// `file_write`, `code_run`, `shell_exec`, `browser_automation`
    /// (sandboxed, risk-ranked).
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::from_loaded(loader::builtin_policy())
    }

    /// Construct an engine from a YAML policy file.
    ///
    /// A missing or invalid file falls back to the built-in defaults with a
    /// warning rather than failing: policy startup must not take the whole
    /// runtime down.
    #[must_use]
    pub fn from_file_or_defaults(path: &Utf8Path) -> Self {
        match loader::load_policy_file(path) {
            Ok(loaded) => Self::from_loaded(loaded),
            Err(error) => {
                warn!(%path, %error, "falling back to built-in policy defaults");
                Self::with_defaults()
            }
        }
    }

    /// Construct an engine from policy YAML text.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` for malformed YAML or unit strings.
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        Ok(Self::from_loaded(loader::parse_policy_yaml(contents)?))
    }

    fn from_loaded(loaded: loader::LoadedPolicy) -> Self {
        Self {
            default_config: loaded.default_config,
            tools: loaded.tools,
            roles: loaded.roles,
        }
    }

    /// Return the default resource envelope from `policies.default`.
    #[must_use]
    pub const fn default_config(&self) -> &SandboxConfig {
        &self.default_config
    }

    /// Return the permission record registered for a tool, if any.
    #[must_use]
    pub fn permission(&self, tool: &str) -> Option<&ToolPermission> {
        self.tools.get(tool)
    }

    /// Whether executions for a tool must be routed through a sandbox.
    ///
    /// Unknown tools answer `true`: routing an unregistered tool through the
    /// sandbox is the safe direction to be wrong in.
    #[must_use]
    pub fn requires_sandbox(&self, tool: &str) -> bool {
        self.tools
            .get(tool)
            .is_none_or(|permission| permission.sandbox_enabled)
    }

    /// Check whether a request may proceed.
    ///
    /// Rules are evaluated in order, first match wins: role allow-list,
    /// tool registration, approval requirement, command rules (global
    /// blocklists first, which apply even to unregistered tools), path
    /// rules, and finally the advisory code scan.
    ///
    /// An unregistered tool is allowed with a high-risk warning rather than
    /// denied: failing closed on a typo'd tool name would trade a logged
    /// risk for an availability outage. Global command blocklists still
    /// apply to such tools.
    ///
    /// # Errors
    ///
    /// Returns a [`PolicyError`] naming the specific rule that denied the
    /// request. `PolicyError::ApprovalRequired` is a distinct signal: the
    /// caller obtains approval and retries, the engine itself never routes
    /// approvals.
    pub fn check_permission(&self, request: &PermissionRequest<'_>) -> Result<(), PolicyError> {
        self.check_role(request)?;

        let Some(permission) = self.tools.get(request.tool) else {
            warn!(
                tool = request.tool,
                "no permission registered for tool; allowing and treating as high-risk"
            );
            if let Some(command) = request.command {
                check_global_blocklists(command)?;
            }
            scan_code(request);
            return Ok(());
        };

        if permission.requires_approval {
            return Err(PolicyError::ApprovalRequired {
                tool: String::from(request.tool),
            });
        }

        if let Some(command) = request.command {
            check_command(permission, request.tool, command)?;
        }
        if let Some(path) = request.path {
            check_path(permission, request.tool, path)?;
        }
        scan_code(request);

        Ok(())
    }

    fn check_role(&self, request: &PermissionRequest<'_>) -> Result<(), PolicyError> {
        let Some(role) = request.agent_role else {
            return Ok(());
        };
        let Some(allowed_tools) = self.roles.get(role) else {
            // Unconfigured roles are unrestricted, matching the unknown-tool
            // availability tradeoff.
            warn!(role, "no tool allow-list configured for role");
            return Ok(());
        };
        if allowed_tools.iter().any(|tool| tool == request.tool) {
            Ok(())
        } else {
            Err(PolicyError::RoleDenied {
                role: String::from(role),
                tool: String::from(request.tool),
            })
        }
    }
}

fn check_global_blocklists(command: &str) -> Result<(), PolicyError> {
    if let Some(rule) = blocked_command_rule(command) {
        return Err(PolicyError::CommandBlocked {
            rule,
            command: String::from(command),
        });
    }
    Ok(())
}

fn check_command(
    permission: &ToolPermission,
    tool: &str,
    command: &str,
) -> Result<(), PolicyError> {
    check_global_blocklists(command)?;

    for entry in &permission.denied_commands {
        if command.contains(entry.as_str()) {
            return Err(PolicyError::CommandDenied {
                entry: entry.clone(),
                tool: String::from(tool),
            });
        }
    }

    if !permission.allowed_commands.is_empty() {
        let base = command.split_whitespace().next().unwrap_or_default();
        if !permission.allowed_commands.iter().any(|allowed| allowed == base) {
            return Err(PolicyError::CommandNotAllowed {
                base: String::from(base),
                tool: String::from(tool),
            });
        }
    }

    Ok(())
}

fn check_path(permission: &ToolPermission, tool: &str, path: &str) -> Result<(), PolicyError> {
    let absolute = std::path::absolute(path)
        .map_or_else(|_| String::from(path), |p| p.to_string_lossy().into_owned());

    for pattern in &permission.denied_paths {
        if glob_matches(pattern, &absolute) {
            return Err(PolicyError::PathDenied {
                path: absolute,
                pattern: pattern.clone(),
                tool: String::from(tool),
            });
        }
    }

    if !permission.allowed_paths.is_empty()
        && !permission
            .allowed_paths
            .iter()
            .any(|pattern| glob_matches(pattern, &absolute))
    {
        return Err(PolicyError::PathNotAllowed {
            path: absolute,
            tool: String::from(tool),
        });
    }

    Ok(())
}

/// Match a single glob pattern against a path string.
///
/// Invalid patterns are logged and treated as non-matching; a typo in a
/// denied glob narrows that one rule, it does not disable path checking.
fn glob_matches(pattern: &str, path: &str) -> bool {
    match Glob::new(pattern) {
        Ok(glob) => glob.compile_matcher().is_match(path),
        Err(error) => {
            warn!(pattern, %error, "ignoring invalid path glob in policy");
            false
        }
    }
}

/// Advisory scan of code payloads; findings are logged, never denied.
fn scan_code(request: &PermissionRequest<'_>) {
    let Some(code) = request.code else {
        return;
    };
    let findings = dangerous_code_findings(code);
    if !findings.is_empty() {
        warn!(
            tool = request.tool,
            findings = ?findings,
            "dangerous patterns in code payload; relying on sandbox containment"
        );
    }
}
