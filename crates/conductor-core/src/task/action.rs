//! Agent actions and the closed action-kind enumeration.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Risk classification driving approval gating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    /// Read-only or trivially reversible operations.
    Low,
    /// Mutating operations with local blast radius.
    Medium,
    /// Destructive or environment-touching operations.
    High,
    /// Operations that can cause irreversible damage.
    Critical,
}

impl std::fmt::Display for RiskLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
            RiskLevel::Critical => "critical",
        };
        write!(f, "{}", s)
    }
}

/// Closed enumeration of action kinds.
///
/// Dispatch is always an explicit `match`, so adding a kind is a
/// compile-time-visible change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Analyze code structure or quality.
    AnalyzeCode,
    /// Create a new file.
    CreateFile,
    /// Edit an existing file.
    EditFile,
    /// Delete a file.
    DeleteFile,
    /// Run a shell command.
    RunCommand,
    /// Run security validation over the workspace.
    ValidateSecurity,
    /// Run the test suite.
    RunTests,
    /// Commit staged changes.
    CommitChanges,
    /// Create a new branch.
    CreateBranch,
    /// Refactor existing code.
    RefactorCode,
    /// Generate documentation.
    GenerateDocumentation,
    /// Analyze project dependencies.
    AnalyzeDependencies,
    /// Optimize performance of existing code.
    OptimizePerformance,
}

impl ActionKind {
    /// Returns true if this kind mutates workspace files or runs commands,
    /// requiring a pre-action backup.
    pub fn is_destructive(self) -> bool {
        matches!(
            self,
            ActionKind::EditFile
                | ActionKind::DeleteFile
                | ActionKind::RunCommand
                | ActionKind::RefactorCode
                | ActionKind::OptimizePerformance
        )
    }

    /// Default risk level inferred from the kind.
    pub fn default_risk(self) -> RiskLevel {
        match self {
            ActionKind::AnalyzeCode
            | ActionKind::ValidateSecurity
            | ActionKind::GenerateDocumentation
            | ActionKind::AnalyzeDependencies => RiskLevel::Low,
            ActionKind::CreateFile
            | ActionKind::CreateBranch
            | ActionKind::RunTests => RiskLevel::Low,
            ActionKind::EditFile
            | ActionKind::RefactorCode
            | ActionKind::OptimizePerformance
            | ActionKind::CommitChanges => RiskLevel::Medium,
            ActionKind::DeleteFile | ActionKind::RunCommand => RiskLevel::High,
        }
    }

    /// Stable display name matching the serialized form.
    pub fn name(self) -> &'static str {
        match self {
            ActionKind::AnalyzeCode => "analyze_code",
            ActionKind::CreateFile => "create_file",
            ActionKind::EditFile => "edit_file",
            ActionKind::DeleteFile => "delete_file",
            ActionKind::RunCommand => "run_command",
            ActionKind::ValidateSecurity => "validate_security",
            ActionKind::RunTests => "run_tests",
            ActionKind::CommitChanges => "commit_changes",
            ActionKind::CreateBranch => "create_branch",
            ActionKind::RefactorCode => "refactor_code",
            ActionKind::GenerateDocumentation => "generate_documentation",
            ActionKind::AnalyzeDependencies => "analyze_dependencies",
            ActionKind::OptimizePerformance => "optimize_performance",
        }
    }
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Category of a validation rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleCategory {
    /// Security checks (secrets, injection, unsafe patterns).
    Security,
    /// Quality checks (output shape, completeness).
    Quality,
    /// Performance checks (output size, resource use).
    Performance,
    /// Compliance checks (path containment, policy).
    Compliance,
}

/// Severity of a validation rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleSeverity {
    /// Failing this rule rejects the produced change.
    Error,
    /// Failing this rule is recorded but does not reject the change.
    Warning,
    /// Informational only.
    Info,
}

/// Declarative validation check attached to an action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationRule {
    /// Rule category.
    pub category: RuleCategory,
    /// Rule severity.
    pub severity: RuleSeverity,
    /// Name of the checking capability, resolved against the validator
    /// registry.
    pub checker: String,
}

impl ValidationRule {
    /// Creates a new validation rule.
    pub fn new(category: RuleCategory, severity: RuleSeverity, checker: impl Into<String>) -> Self {
        Self { category, severity, checker: checker.into() }
    }
}

/// A single intended operation inside a step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentAction {
    /// Unique action identifier.
    pub id: String,
    /// Action kind.
    pub kind: ActionKind,
    /// Human-readable description.
    pub description: String,
    /// File path or command string the action operates on.
    pub target: String,
    /// Opaque payload forwarded to the capability provider.
    pub payload: serde_json::Value,
    /// Validation rules to run against the produced change set.
    pub validation_rules: Vec<ValidationRule>,
    /// Risk level of this action.
    pub risk_level: RiskLevel,
    /// Estimated execution time in milliseconds.
    pub estimated_ms: u64,
    /// Whether a human approval is required before execution.
    pub requires_approval: bool,
}

impl AgentAction {
    /// Creates a new action with risk and approval defaults inferred from
    /// the kind.
    pub fn new(kind: ActionKind, description: impl Into<String>, target: impl Into<String>) -> Self {
        let risk = kind.default_risk();
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            description: description.into(),
            target: target.into(),
            payload: serde_json::Value::Null,
            validation_rules: Vec::new(),
            risk_level: risk,
            estimated_ms: 5_000,
            requires_approval: risk >= RiskLevel::High,
        }
    }

    /// Sets the opaque payload.
    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    /// Attaches a validation rule.
    #[must_use]
    pub fn with_rule(mut self, rule: ValidationRule) -> Self {
        self.validation_rules.push(rule);
        self
    }

    /// Overrides the estimated execution time.
    #[must_use]
    pub fn with_estimated_ms(mut self, estimated_ms: u64) -> Self {
        self.estimated_ms = estimated_ms;
        self
    }
}
