//! Global command blocklists and advisory code-pattern scanning.
//!
//! These rules are non-overridable: no tool permission can re-enable a
//! command that matches them. The code patterns are advisory only; the
//! container boundary, not static analysis, is the containment mechanism.

use std::sync::LazyLock;

use regex::Regex;

/// Commands blocked everywhere by exact substring match.
pub const BLOCKED_COMMANDS: &[&str] = &[
    "rm -rf /",
    "rm -fr /",
    "mkfs",
    "dd if=/dev/zero of=/dev/",
    "chmod -R 777 /",
    "> /dev/sda",
    "shutdown",
    "reboot",
    "poweroff",
    "halt",
    "init 0",
    "init 6",
];

/// Command shapes blocked everywhere by regex match.
///
/// Covers privilege escalation, pipe-to-shell installers, fork bombs, and
/// raw writes to block devices.
static BLOCKED_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\bsudo\s+",
        r"\bcurl\s+[^|]*\|\s*(?:ba|z|da)?sh\b",
        r"\bwget\s+[^|]*\|\s*(?:ba|z|da)?sh\b",
        r":\(\)\s*\{[^}]*\}\s*;?\s*:",
        r"\bdd\s+[^;|&]*of=/dev/[a-z]",
        r"\bmkfs(\.[a-z0-9]+)?\s",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

/// Source patterns flagged by the advisory code scan.
static DANGEROUS_CODE_PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    [
        (r"os\.system\s*\(", "os.system call"),
        (r"(?:^|\n)\s*(?:import\s+subprocess|from\s+subprocess)", "subprocess import"),
        (r"\beval\s*\(", "eval call"),
        (r"\bexec\s*\(", "exec call"),
        (r"\bcompile\s*\(", "compile call"),
        (r"/etc/(?:passwd|shadow|sudoers)", "system credential file access"),
        (r"/proc/", "procfs access"),
    ]
    .iter()
    .filter_map(|(pattern, label)| Regex::new(pattern).ok().map(|regex| (regex, *label)))
    .collect()
});

/// Return the global blocklist rule a command violates, if any.
///
/// Substring entries are checked first, then the regex patterns. The returned
/// string names the rule that fired so the denial can report it verbatim.
#[must_use]
pub fn blocked_command_rule(command: &str) -> Option<String> {
    for entry in BLOCKED_COMMANDS {
        if command.contains(entry) {
            return Some(String::from(*entry));
        }
    }
    BLOCKED_PATTERNS
        .iter()
        .find(|pattern| pattern.is_match(command))
        .map(|pattern| String::from(pattern.as_str()))
}

/// Return labels for every dangerous construct found in a code payload.
///
/// Advisory only: findings are logged, never denied, because the sandbox
/// boundary is the actual containment mechanism and a static scan must not
/// be the sole gate.
#[must_use]
pub fn dangerous_code_findings(code: &str) -> Vec<&'static str> {
    DANGEROUS_CODE_PATTERNS
        .iter()
        .filter(|(pattern, _)| pattern.is_match(code))
        .map(|(_, label)| *label)
        .collect()
}
