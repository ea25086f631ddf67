//! Textual permission scan over raw strategy source.
//!
//! Deliberately shallow: a case-insensitive substring pass that runs before
//! anything is parsed, catching hostile intent even in source the parser
//! would reject. Overlaps with static validation on purpose; the two layers
//! fail independently.

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use serde::Serialize;
use tracing::debug;

/// What kind of host access a matched pattern implies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessCategory {
    Filesystem,
    Process,
    Network,
    Database,
    System,
}

impl AccessCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessCategory::Filesystem => "filesystem",
            AccessCategory::Process => "process",
            AccessCategory::Network => "network",
            AccessCategory::Database => "database",
            AccessCategory::System => "system",
        }
    }
}

impl std::fmt::Display for AccessCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One matched category with the pattern that triggered it.
#[derive(Debug, Clone, Serialize)]
pub struct PermissionViolation {
    pub category: AccessCategory,
    pub detail: String,
}

/// Scan outcome; `allowed` is false when any category matched.
#[derive(Debug, Clone, Serialize)]
pub struct PermissionReport {
    pub allowed: bool,
    pub violations: Vec<PermissionViolation>,
}

const FILESYSTEM_PATTERNS: &[&str] = &[
    "path_open",
    "path_unlink",
    "path_create",
    "fd_read",
    "fd_write",
    "fd_seek",
    "file_open",
    "/etc/",
    "/dev/",
];

const PROCESS_PATTERNS: &[&str] = &[
    "proc_exec",
    "proc_spawn",
    "proc_raise",
    "subprocess",
    "fork(",
    "execve",
];

const NETWORK_PATTERNS: &[&str] = &[
    "sock_open",
    "sock_send",
    "sock_recv",
    "sock_connect",
    "http://",
    "https://",
    "tcp://",
    "udp://",
];

const DATABASE_PATTERNS: &[&str] = &[
    "drop table",
    "insert into",
    "delete from",
    "postgres://",
    "mysql://",
    "redis://",
];

const SYSTEM_PATTERNS: &[&str] = &[
    "environ_get",
    "environ_sizes",
    "getenv",
    "clock_time_get",
    "random_get",
    "syscall",
];

const CATEGORY_PATTERNS: &[(AccessCategory, &[&str])] = &[
    (AccessCategory::Filesystem, FILESYSTEM_PATTERNS),
    (AccessCategory::Process, PROCESS_PATTERNS),
    (AccessCategory::Network, NETWORK_PATTERNS),
    (AccessCategory::Database, DATABASE_PATTERNS),
    (AccessCategory::System, SYSTEM_PATTERNS),
];

/// Call targets and import fields tolerated by the strict scan: the numeric
/// and table-processing vocabulary plus the curated capability surface.
static STRICT_ALLOWED_NAMES: Lazy<BTreeSet<&'static str>> = Lazy::new(|| {
    [
        "init", "main", "alloc", "score", "signals", "sum", "mean", "std", "min", "max", "abs",
        "sqrt", "exp", "ln", "log", "pow", "floor", "ceil", "round", "clamp", "value", "field",
        "price", "close", "volume", "emit", "get", "has", "memory",
    ]
    .into_iter()
    .collect()
});

/// Substring-based scanner over raw source text.
pub struct PermissionScanner {
    strict: bool,
}

impl PermissionScanner {
    pub fn new(strict: bool) -> Self {
        Self { strict }
    }

    /// Scan source text. At most one violation is reported per category.
    pub fn scan(&self, source: &str) -> PermissionReport {
        let lowered = source.to_lowercase();
        let mut violations = Vec::new();

        for (category, patterns) in CATEGORY_PATTERNS {
            for pattern in *patterns {
                if let Some(offset) = lowered.find(pattern) {
                    violations.push(PermissionViolation {
                        category: *category,
                        detail: format!("pattern {pattern:?} at byte {offset}"),
                    });
                    break;
                }
            }
        }

        if self.strict && !violations.iter().any(|v| v.category == AccessCategory::System) {
            if let Some(name) = self.first_unknown_name(source) {
                violations.push(PermissionViolation {
                    category: AccessCategory::System,
                    detail: format!("name {name:?} is outside the numeric allow-list"),
                });
            }
        }

        let allowed = violations.is_empty();
        if !allowed {
            debug!(violations = violations.len(), "permission scan blocked source");
        }
        PermissionReport {
            allowed,
            violations,
        }
    }

    /// Strict pass: collect `call $name` targets and quoted import fields,
    /// returning the first one outside the allow-list.
    fn first_unknown_name(&self, source: &str) -> Option<String> {
        for name in called_names(source).chain(imported_fields(source)) {
            let normal = name.trim_start_matches('_').to_lowercase();
            if !STRICT_ALLOWED_NAMES.contains(normal.as_str()) {
                return Some(name);
            }
        }
        None
    }
}

fn ident_at(source: &str, start: usize) -> Option<String> {
    let rest = &source[start..];
    let end = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.'))
        .unwrap_or(rest.len());
    if end == 0 {
        None
    } else {
        Some(rest[..end].to_string())
    }
}

/// Targets of textual `call $name` occurrences.
fn called_names(source: &str) -> impl Iterator<Item = String> + '_ {
    source.match_indices("call $").filter_map(move |(idx, _)| {
        ident_at(source, idx + "call $".len())
    })
}

/// Field names of textual `(import "mod" "field"` occurrences.
fn imported_fields(source: &str) -> impl Iterator<Item = String> + '_ {
    source.match_indices("(import ").filter_map(move |(idx, _)| {
        let rest = &source[idx..];
        let mut quoted = rest.split('"');
        quoted.next()?;
        let _module = quoted.next()?;
        quoted.next()?;
        let field = quoted.next()?;
        Some(field.to_string())
    })
}
