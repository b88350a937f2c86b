//! Append-only audit trail for execution attempts.
//!
//! Every execution attempt produces exactly one [`AuditLogEntry`], including
//! attempts rejected by policy, so forensics can reconstruct what was asked
//! for as well as what ran. The sink is an injected trait object with a
//! single `append` obligation, letting deployments swap in durable storage
//! without touching sandbox logic; the default sink is an in-process list.
//!
//! Code payloads are recorded as a SHA-256 digest, never verbatim, so the
//! audit trail cannot leak secrets embedded in generated code.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// Terminal outcome of one execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    /// The command ran to completion (its exit code may still be non-zero).
    Completed,
    /// The command could not run or faulted inside the container.
    Failed,
    /// Policy denied the request before any container was touched.
    Denied,
    /// The command exceeded its execution time bound and was killed.
    TimedOut,
}

/// One record in the audit trail.
#[derive(Debug, Clone, Serialize)]
pub struct AuditLogEntry {
    /// When the attempt finished (or was denied).
    pub timestamp: DateTime<Utc>,

    /// Session attribution, when supplied by the caller.
    pub session_id: Option<String>,

    /// Agent attribution, when supplied by the caller.
    pub agent_id: Option<String>,

    /// Organisation attribution, when supplied by the caller.
    pub org_id: Option<String>,

    /// The sandbox that ran the command; `None` for denied attempts.
    pub sandbox_id: Option<String>,

    /// The tool name the policy decision was made for.
    pub tool: String,

    /// The command text, or a `sha256:` digest for code payloads.
    pub action: String,

    /// Wall-clock duration of the attempt in milliseconds.
    pub duration_ms: u64,

    /// Exit code, when the command ran.
    pub exit_code: Option<i64>,

    /// Peak memory observed for the execution, in megabytes.
    pub memory_used_mb: f64,

    /// How the attempt ended.
    pub outcome: AuditOutcome,

    /// Error detail for failed, denied, or timed-out attempts.
    pub error: Option<String>,
}

/// Append-only destination for audit entries.
pub trait AuditSink: Send + Sync {
    /// Record one entry. Implementations must not reorder or drop entries.
    fn append(&self, entry: AuditLogEntry);

    /// Return a copy of the recorded entries, oldest first.
    ///
    /// Durable sinks that cannot enumerate cheaply may return an empty list;
    /// queries then go to the external store instead.
    fn snapshot(&self) -> Vec<AuditLogEntry> {
        Vec::new()
    }
}

/// In-process audit sink backed by a mutex-guarded list.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditLogEntry>>,
}

impl MemoryAuditSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuditSink for MemoryAuditSink {
    fn append(&self, entry: AuditLogEntry) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry);
        }
    }

    fn snapshot(&self) -> Vec<AuditLogEntry> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }
}

/// Digest a code payload for audit recording.
///
/// The raw source never enters the audit trail; model-generated code can
/// embed credentials the agent was given.
#[must_use]
pub fn code_digest(code: &str) -> String {
    let digest = Sha256::digest(code.as_bytes());
    format!("sha256:{}", hex::encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn entry(outcome: AuditOutcome) -> AuditLogEntry {
        AuditLogEntry {
            timestamp: Utc::now(),
            session_id: Some(String::from("s-1")),
            agent_id: None,
            org_id: None,
            sandbox_id: None,
            tool: String::from("shell_exec"),
            action: String::from("ls"),
            duration_ms: 3,
            exit_code: Some(0),
            memory_used_mb: 0.0,
            outcome,
            error: None,
        }
    }

    #[rstest]
    fn memory_sink_preserves_append_order() {
        let sink = MemoryAuditSink::new();
        sink.append(entry(AuditOutcome::Denied));
        sink.append(entry(AuditOutcome::Completed));

        let entries = sink.snapshot();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].outcome, AuditOutcome::Denied);
        assert_eq!(entries[1].outcome, AuditOutcome::Completed);
    }

    #[rstest]
    fn entries_serialize_with_snake_case_outcomes() {
        let Ok(json) = serde_json::to_value(entry(AuditOutcome::TimedOut)) else {
            panic!("entry should serialize");
        };
        assert_eq!(json["outcome"], "timed_out");
        assert_eq!(json["tool"], "shell_exec");
        assert_eq!(json["sandbox_id"], serde_json::Value::Null);
    }

    #[rstest]
    fn code_digest_is_stable_and_prefixed() {
        let first = code_digest("print(1+1)");
        let second = code_digest("print(1+1)");
        assert_eq!(first, second);
        assert!(first.starts_with("sha256:"));
        assert_ne!(first, code_digest("print(2+2)"));
    }
}
