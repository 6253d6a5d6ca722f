//! Pluggable validation rules run over produced change sets.
//!
//! Validators are stateless, pure functions over an action and the result
//! produced so far. The registry resolves the `checker` name on a
//! `ValidationRule` to a validator; an unknown name fails the rule with an
//! explanatory message rather than panicking.

use regex::Regex;
use std::collections::HashMap;
use std::path::{Component, Path};
use std::sync::Arc;

use crate::task::{
    AgentAction, ChangeKind, RuleCategory, RuleSeverity, StepResult, ValidationOutcome,
    ValidationRule,
};

/// A stateless validation check.
pub trait Validator: Send + Sync {
    /// Name this validator is registered under.
    fn name(&self) -> &str;

    /// Category of checks this validator performs.
    fn category(&self) -> RuleCategory;

    /// Validates an action against the result produced so far.
    fn validate(&self, action: &AgentAction, result: &StepResult) -> ValidationOutcome;
}

fn outcome(
    rule: &str,
    category: RuleCategory,
    passed: bool,
    message: impl Into<String>,
) -> ValidationOutcome {
    ValidationOutcome {
        rule: rule.to_string(),
        category,
        // Severity is filled in from the rule by the registry.
        severity: RuleSeverity::Info,
        passed,
        message: message.into(),
        suggestions: Vec::new(),
    }
}

/// Security validator: scans new file content for secret-looking patterns.
pub struct SecretScanValidator {
    patterns: Vec<Regex>,
}

impl SecretScanValidator {
    /// Creates the validator with the default secret patterns.
    pub fn new() -> Self {
        let patterns = [
            r"(?i)api[_-]?key\s*[:=]\s*['\x22][A-Za-z0-9_\-]{12,}",
            r"(?i)password\s*[:=]\s*['\x22][^'\x22]{6,}",
            r"(?i)secret\s*[:=]\s*['\x22][A-Za-z0-9_\-]{12,}",
            r"-----BEGIN [A-Z ]*PRIVATE KEY-----",
            r"(?i)aws_access_key_id\s*[:=]",
        ]
        .iter()
        .filter_map(|p| Regex::new(p).ok())
        .collect();
        Self { patterns }
    }
}

impl Default for SecretScanValidator {
    fn default() -> Self {
        Self::new()
    }
}

impl Validator for SecretScanValidator {
    fn name(&self) -> &str {
        "secret_scan"
    }

    fn category(&self) -> RuleCategory {
        RuleCategory::Security
    }

    fn validate(&self, _action: &AgentAction, result: &StepResult) -> ValidationOutcome {
        for change in &result.changes {
            let Some(content) = &change.content else { continue };
            for pattern in &self.patterns {
                if pattern.is_match(content) {
                    let mut out = outcome(
                        self.name(),
                        self.category(),
                        false,
                        format!("secret-looking pattern in '{}'", change.path),
                    );
                    out.suggestions.push("move the credential to environment configuration".to_string());
                    return out;
                }
            }
        }
        outcome(self.name(), self.category(), true, "no secret patterns found")
    }
}

/// Quality validator: the provider must produce non-empty output.
pub struct NonEmptyOutputValidator;

impl Validator for NonEmptyOutputValidator {
    fn name(&self) -> &str {
        "non_empty_output"
    }

    fn category(&self) -> RuleCategory {
        RuleCategory::Quality
    }

    fn validate(&self, _action: &AgentAction, result: &StepResult) -> ValidationOutcome {
        let empty = match &result.output {
            serde_json::Value::Null => result.changes.is_empty(),
            serde_json::Value::String(s) => s.is_empty() && result.changes.is_empty(),
            _ => false,
        };
        if empty {
            outcome(self.name(), self.category(), false, "provider produced no output and no changes")
        } else {
            outcome(self.name(), self.category(), true, "output present")
        }
    }
}

/// Performance validator: total produced content must stay under a ceiling.
pub struct OutputSizeValidator {
    /// Maximum total bytes of produced content.
    max_bytes: usize,
}

impl OutputSizeValidator {
    /// Creates the validator with a byte ceiling.
    pub fn new(max_bytes: usize) -> Self {
        Self { max_bytes }
    }
}

impl Validator for OutputSizeValidator {
    fn name(&self) -> &str {
        "output_size"
    }

    fn category(&self) -> RuleCategory {
        RuleCategory::Performance
    }

    fn validate(&self, _action: &AgentAction, result: &StepResult) -> ValidationOutcome {
        let total: usize = result.changes.iter().filter_map(|c| c.content.as_ref()).map(String::len).sum();
        if total > self.max_bytes {
            outcome(
                self.name(),
                self.category(),
                false,
                format!("produced {total} bytes, ceiling is {}", self.max_bytes),
            )
        } else {
            outcome(self.name(), self.category(), true, format!("produced {total} bytes"))
        }
    }
}

/// Compliance validator: every changed path must stay inside the workspace.
pub struct WorkspacePathValidator;

impl WorkspacePathValidator {
    fn escapes_workspace(path: &str) -> bool {
        let path = Path::new(path);
        if path.is_absolute() {
            return true;
        }
        let mut depth: i32 = 0;
        for component in path.components() {
            match component {
                Component::ParentDir => {
                    depth -= 1;
                    if depth < 0 {
                        return true;
                    }
                }
                Component::Normal(_) => depth += 1,
                _ => {}
            }
        }
        false
    }
}

impl Validator for WorkspacePathValidator {
    fn name(&self) -> &str {
        "workspace_path"
    }

    fn category(&self) -> RuleCategory {
        RuleCategory::Compliance
    }

    fn validate(&self, action: &AgentAction, result: &StepResult) -> ValidationOutcome {
        for change in &result.changes {
            if Self::escapes_workspace(&change.path) {
                return outcome(
                    self.name(),
                    self.category(),
                    false,
                    format!("path '{}' escapes the workspace", change.path),
                );
            }
        }
        // Delete actions must name a workspace-relative target even when
        // the provider reported no change records.
        if result.changes.is_empty()
            && action.kind == crate::task::ActionKind::DeleteFile
            && Self::escapes_workspace(&action.target)
        {
            return outcome(
                self.name(),
                self.category(),
                false,
                format!("target '{}' escapes the workspace", action.target),
            );
        }
        outcome(self.name(), self.category(), true, "all paths inside workspace")
    }
}

/// Registry mapping rule checker names to validators.
pub struct ValidatorRegistry {
    validators: HashMap<String, Arc<dyn Validator>>,
}

impl ValidatorRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self { validators: HashMap::new() }
    }

    /// Creates a registry with the built-in validators for every category.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(SecretScanValidator::new()));
        registry.register(Arc::new(NonEmptyOutputValidator));
        registry.register(Arc::new(OutputSizeValidator::new(1_000_000)));
        registry.register(Arc::new(WorkspacePathValidator));
        registry
    }

    /// Registers a validator under its own name.
    pub fn register(&mut self, validator: Arc<dyn Validator>) {
        self.validators.insert(validator.name().to_string(), validator);
    }

    /// Runs one rule against an action and partial result.
    ///
    /// Unknown checker names produce a failed outcome with a message,
    /// never a panic.
    pub fn run_rule(
        &self,
        rule: &ValidationRule,
        action: &AgentAction,
        result: &StepResult,
    ) -> ValidationOutcome {
        match self.validators.get(&rule.checker) {
            Some(validator) => {
                let mut out = validator.validate(action, result);
                out.severity = rule.severity;
                out
            }
            None => ValidationOutcome {
                rule: rule.checker.clone(),
                category: rule.category,
                severity: rule.severity,
                passed: false,
                message: format!("no validator registered for checker '{}'", rule.checker),
                suggestions: vec!["register the checker or remove the rule".to_string()],
            },
        }
    }
}

impl Default for ValidatorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{ActionKind, FileChange};

    fn action(kind: ActionKind) -> AgentAction {
        AgentAction::new(kind, "test", "src/demo.ts")
    }

    #[test]
    fn test_secret_scan_flags_api_keys() {
        let validator = SecretScanValidator::new();
        let result = StepResult::success(serde_json::Value::Null).with_change(
            FileChange::new("src/config.ts", ChangeKind::Create)
                .with_content("const api_key = \"sk_live_abcdef123456789\";"),
        );
        let out = validator.validate(&action(ActionKind::CreateFile), &result);
        assert!(!out.passed);
        assert!(!out.suggestions.is_empty());
    }

    #[test]
    fn test_secret_scan_passes_clean_content() {
        let validator = SecretScanValidator::new();
        let result = StepResult::success(serde_json::Value::Null).with_change(
            FileChange::new("src/math.ts", ChangeKind::Create)
                .with_content("export const add = (a: number, b: number) => a + b;"),
        );
        assert!(validator.validate(&action(ActionKind::CreateFile), &result).passed);
    }

    #[test]
    fn test_workspace_path_rejects_escapes() {
        let validator = WorkspacePathValidator;
        let result = StepResult::success(serde_json::Value::Null)
            .with_change(FileChange::new("../outside.txt", ChangeKind::Delete));
        assert!(!validator.validate(&action(ActionKind::DeleteFile), &result).passed);

        let absolute = StepResult::success(serde_json::Value::Null)
            .with_change(FileChange::new("/etc/passwd", ChangeKind::Delete));
        assert!(!validator.validate(&action(ActionKind::DeleteFile), &absolute).passed);
    }

    #[test]
    fn test_workspace_path_allows_internal_parent_segments() {
        let validator = WorkspacePathValidator;
        let result = StepResult::success(serde_json::Value::Null)
            .with_change(FileChange::new("src/../docs/readme.md", ChangeKind::Modify));
        assert!(validator.validate(&action(ActionKind::EditFile), &result).passed);
    }

    #[test]
    fn test_registry_fails_unknown_checker_softly() {
        let registry = ValidatorRegistry::with_builtins();
        let rule = ValidationRule::new(RuleCategory::Quality, RuleSeverity::Error, "no_such_checker");
        let result = StepResult::success(serde_json::Value::Null);
        let out = registry.run_rule(&rule, &action(ActionKind::AnalyzeCode), &result);
        assert!(!out.passed);
        assert!(out.message.contains("no_such_checker"));
    }

    #[test]
    fn test_registry_applies_rule_severity() {
        let registry = ValidatorRegistry::with_builtins();
        let rule = ValidationRule::new(RuleCategory::Quality, RuleSeverity::Warning, "non_empty_output");
        let result = StepResult::success(serde_json::json!({"summary": "ok"}));
        let out = registry.run_rule(&rule, &action(ActionKind::AnalyzeCode), &result);
        assert!(out.passed);
        assert_eq!(out.severity, RuleSeverity::Warning);
    }
}
