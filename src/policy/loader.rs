//! YAML policy file loading.
//!
//! The policy file carries a `policies.default` resource envelope, a
//! `policies.tools.<name>` permission map, and optional
//! `policies.agent_roles.<role>` tool allow-lists. Memory and duration values
//! are strings with units (`"512MB"`, `"30s"`) parsed by the `config` module.

use std::collections::HashMap;

use camino::Utf8Path;
use serde::Deserialize;

use crate::config::{SandboxConfig, parse_duration_secs, parse_memory_mb};
use crate::error::ConfigError;
use crate::policy::{RiskLevel, ToolPermission};

/// Parsed contents of a policy file, ready for `PolicyEngine` construction.
#[derive(Debug, Clone, Default)]
pub(super) struct LoadedPolicy {
    pub(super) default_config: SandboxConfig,
    pub(super) tools: HashMap<String, ToolPermission>,
    pub(super) roles: HashMap<String, Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct RawPolicyFile {
    policies: RawPolicies,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawPolicies {
    default: RawDefault,
    tools: HashMap<String, RawTool>,
    agent_roles: HashMap<String, RawRole>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawDefault {
    max_memory: Option<String>,
    max_cpu: Option<f64>,
    max_execution_time: Option<String>,
    network_access: Option<bool>,
    working_dir: Option<String>,
    docker_image: Option<String>,
    user: Option<String>,
    seccomp_profile: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawTool {
    risk_level: Option<RiskLevel>,
    sandbox_enabled: Option<bool>,
    allowed_commands: Vec<String>,
    denied_commands: Vec<String>,
    allowed_paths: Vec<String>,
    denied_paths: Vec<String>,
    max_execution_time: Option<String>,
    requires_approval: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawRole {
    tools: Vec<String>,
}

/// Load a policy file from disk.
///
/// # Errors
///
/// Returns `ConfigError::FileNotFound` when the file is absent,
/// `ConfigError::ParseError` for malformed YAML, and
/// `ConfigError::InvalidUnit` for unparseable memory/duration strings.
pub(super) fn load_policy_file(path: &Utf8Path) -> Result<LoadedPolicy, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|_| ConfigError::FileNotFound {
        path: path.to_owned(),
    })?;
    parse_policy_yaml(&contents)
}

/// Parse policy YAML text.
///
/// # Errors
///
/// Returns `ConfigError::ParseError` for malformed YAML and
/// `ConfigError::InvalidUnit` for unparseable memory/duration strings.
pub(super) fn parse_policy_yaml(contents: &str) -> Result<LoadedPolicy, ConfigError> {
    let raw: RawPolicyFile =
        serde_yaml::from_str(contents).map_err(|error| ConfigError::ParseError {
            message: error.to_string(),
        })?;

    let default_config = resolve_default_config(&raw.policies.default)?;

    let mut tools = HashMap::new();
    for (name, tool) in raw.policies.tools {
        let permission = resolve_tool_permission(tool)?;
        tools.insert(name, permission);
    }

    let roles = raw
        .policies
        .agent_roles
        .into_iter()
        .map(|(role, entry)| (role, entry.tools))
        .collect();

    Ok(LoadedPolicy {
        default_config,
        tools,
        roles,
    })
}

fn resolve_default_config(raw: &RawDefault) -> Result<SandboxConfig, ConfigError> {
    let mut config = SandboxConfig::default();

    if let Some(memory) = raw.max_memory.as_deref() {
        config.max_memory_mb = parse_memory_mb(memory)?;
    }
    if let Some(cpu) = raw.max_cpu {
        if cpu <= 0.0 {
            return Err(ConfigError::InvalidValue {
                field: String::from("policies.default.max_cpu"),
                reason: String::from("must be positive"),
            });
        }
        config.max_cpu_cores = cpu;
    }
    if let Some(duration) = raw.max_execution_time.as_deref() {
        config.max_execution_time_seconds = parse_duration_secs(duration)?;
    }
    if let Some(network) = raw.network_access {
        config.network_access = network;
    }
    if let Some(dir) = raw.working_dir.as_deref() {
        config.working_dir = dir.into();
    }
    if let Some(image) = raw.docker_image.as_deref() {
        config.docker_image = String::from(image);
    }
    if let Some(user) = raw.user.as_deref() {
        config.user = String::from(user);
    }
    config.seccomp_profile = raw.seccomp_profile.clone();

    Ok(config)
}

fn resolve_tool_permission(raw: RawTool) -> Result<ToolPermission, ConfigError> {
    let max_execution_time_seconds = raw
        .max_execution_time
        .as_deref()
        .map(parse_duration_secs)
        .transpose()?;

    Ok(ToolPermission {
        risk_level: raw.risk_level.unwrap_or(RiskLevel::Medium),
        sandbox_enabled: raw.sandbox_enabled.unwrap_or(true),
        allowed_commands: raw.allowed_commands,
        denied_commands: raw.denied_commands,
        allowed_paths: raw.allowed_paths,
        denied_paths: raw.denied_paths,
        max_execution_time_seconds,
        requires_approval: raw.requires_approval.unwrap_or(false),
    })
}

/// Built-in policy used when no file is given or loading fails.
///
/// Mirrors the documented defaults: `file_read` is low risk and unsandboxed;
/// `file_write`, `code_run`, `shell_exec`, and `browser_automation` are
/// sandboxed with ascending risk.
pub(super) fn builtin_policy() -> LoadedPolicy {
    let mut tools = HashMap::new();

    tools.insert(
        String::from("file_read"),
        ToolPermission {
            risk_level: RiskLevel::Low,
            sandbox_enabled: false,
            denied_paths: vec![
                String::from("/etc/**"),
                String::from("/root/**"),
                String::from("**/.ssh/**"),
            ],
            ..ToolPermission::default()
        },
    );
    tools.insert(
        String::from("file_write"),
        ToolPermission {
            risk_level: RiskLevel::Medium,
            sandbox_enabled: true,
            denied_paths: vec![String::from("/etc/**"), String::from("/usr/**")],
            ..ToolPermission::default()
        },
    );
    tools.insert(
        String::from("code_run"),
        ToolPermission {
            risk_level: RiskLevel::Medium,
            sandbox_enabled: true,
            max_execution_time_seconds: Some(60),
            ..ToolPermission::default()
        },
    );
    tools.insert(
        String::from("shell_exec"),
        ToolPermission {
            risk_level: RiskLevel::High,
            sandbox_enabled: true,
            denied_commands: vec![
                String::from("sudo"),
                String::from("su -"),
                String::from("passwd"),
            ],
            max_execution_time_seconds: Some(60),
            ..ToolPermission::default()
        },
    );
    tools.insert(
        String::from("browser_automation"),
        ToolPermission {
            risk_level: RiskLevel::High,
            sandbox_enabled: true,
            max_execution_time_seconds: Some(300),
            ..ToolPermission::default()
        },
    );

    LoadedPolicy {
        default_config: SandboxConfig::default(),
        tools,
        roles: HashMap::new(),
    }
}
