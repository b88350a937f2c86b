//! Sandbox resource envelope and unit-aware value parsers.
//!
//! [`SandboxConfig`] is produced once by policy loading (or defaults) and is
//! immutable by convention afterwards: the pool reads it at container-creation
//! time and the manager reads it to resolve per-call timeouts. The parsers
//! accept the human-readable memory (`"512MB"`) and duration (`"30s"`, `"5m"`,
//! `"2h"`) strings used by the policy file.

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use smart_default::SmartDefault;

use crate::error::ConfigError;

/// Default container image for sandbox containers.
pub const DEFAULT_IMAGE: &str = "python:3.11-slim";

/// Known-good minimal image used when pulling the configured image fails.
pub const FALLBACK_IMAGE: &str = "alpine:3.20";

/// Resource envelope applied to every sandbox container.
#[derive(Debug, Clone, PartialEq, SmartDefault, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Memory limit for the container, in megabytes.
    #[default = 512]
    pub max_memory_mb: u64,

    /// CPU limit in cores, enforced via the engine's period/quota mechanism.
    #[default = 1.0]
    pub max_cpu_cores: f64,

    /// Default execution time bound in seconds, overridable per call and
    /// per tool permission.
    #[default = 30]
    pub max_execution_time_seconds: u64,

    /// Whether the container gets a network; when false the container is
    /// created with `network_mode=none`.
    #[default = false]
    pub network_access: bool,

    /// Working directory inside the container; a per-sandbox host scratch
    /// directory is bind-mounted here.
    #[default(Utf8PathBuf::from("/workspace"))]
    pub working_dir: Utf8PathBuf,

    /// Container image for sandbox containers.
    #[default(String::from(DEFAULT_IMAGE))]
    pub docker_image: String,

    /// Numeric non-root `uid:gid` the sandboxed process runs as.
    #[default(String::from("1000:1000"))]
    pub user: String,

    /// Optional seccomp profile applied at container creation.
    #[default(None)]
    pub seccomp_profile: Option<String>,
}

/// Parse a human-readable memory size string into megabytes.
///
/// Accepts a bare number (megabytes) or a number with a `KB`, `MB`, or `GB`
/// suffix, case-insensitive. Sub-megabyte values round up to 1 MB so a
/// configured limit never silently becomes "unlimited".
///
/// # Errors
///
/// Returns `ConfigError::InvalidUnit` for unknown suffixes or non-numeric
/// values.
pub fn parse_memory_mb(value: &str) -> Result<u64, ConfigError> {
    let trimmed = value.trim();
    let (number, multiplier_mb) = split_unit(trimmed, &[("GB", 1024.0), ("MB", 1.0), ("KB", 1.0 / 1024.0)])
        .ok_or_else(|| invalid_unit("memory", trimmed, "expected a number with KB, MB, or GB suffix"))?;

    let quantity: f64 = number
        .trim()
        .parse()
        .map_err(|_| invalid_unit("memory", trimmed, "not a number"))?;
    if quantity < 0.0 {
        return Err(invalid_unit("memory", trimmed, "must not be negative"));
    }

    let megabytes = quantity * multiplier_mb;
    if megabytes > 0.0 && megabytes < 1.0 {
        return Ok(1);
    }
    Ok(megabytes.round() as u64)
}

/// Parse a human-readable duration string into seconds.
///
/// Accepts a bare number (seconds) or a number with an `s`, `m`, or `h`
/// suffix, case-insensitive.
///
/// # Errors
///
/// Returns `ConfigError::InvalidUnit` for unknown suffixes or non-numeric
/// values.
pub fn parse_duration_secs(value: &str) -> Result<u64, ConfigError> {
    let trimmed = value.trim();
    let (number, multiplier_secs) = split_unit(trimmed, &[("h", 3600.0), ("m", 60.0), ("s", 1.0)])
        .ok_or_else(|| invalid_unit("duration", trimmed, "expected a number with s, m, or h suffix"))?;

    let quantity: f64 = number
        .trim()
        .parse()
        .map_err(|_| invalid_unit("duration", trimmed, "not a number"))?;
    if quantity < 0.0 {
        return Err(invalid_unit("duration", trimmed, "must not be negative"));
    }

    Ok((quantity * multiplier_secs).round() as u64)
}

/// Split `value` into its numeric part and the multiplier for a recognised
/// unit suffix. A bare number maps to the 1.0-multiplier unit. Returns `None`
/// when the remainder is not plausibly numeric (delegating the precise check
/// to the caller's parse).
fn split_unit<'a>(value: &'a str, units: &[(&str, f64)]) -> Option<(&'a str, f64)> {
    for (suffix, multiplier) in units {
        if value.len() > suffix.len() {
            let (head, tail) = value.split_at(value.len() - suffix.len());
            if tail.eq_ignore_ascii_case(suffix) {
                return Some((head, *multiplier));
            }
        }
    }

    if value.chars().all(|c| c.is_ascii_digit() || c == '.' || c == '-') && !value.is_empty() {
        return Some((value, 1.0));
    }
    None
}

fn invalid_unit(kind: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidUnit {
        kind,
        value: String::from(value),
        reason: String::from(reason),
    }
}
