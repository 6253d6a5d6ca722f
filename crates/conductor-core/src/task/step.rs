//! Task steps and step execution results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::action::{AgentAction, RiskLevel, RuleCategory, RuleSeverity};

/// Per-step state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Not yet started.
    Pending,
    /// Currently executing.
    Executing,
    /// Blocked on a human approval.
    WaitingApproval,
    /// Finished successfully.
    Completed,
    /// Finished with an unrecoverable error.
    Failed,
    /// Skipped (dependency failure, rejection, or human choice).
    Skipped,
}

impl StepStatus {
    /// Returns true if the step will not run again without explicit retry.
    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Failed | StepStatus::Skipped)
    }
}

/// Kind of file change produced by an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// A new file was created.
    Create,
    /// An existing file was modified.
    Modify,
    /// A file was deleted.
    Delete,
}

/// Record of one file-level side effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChange {
    /// Path relative to the workspace root.
    pub path: String,
    /// Kind of change.
    pub kind: ChangeKind,
    /// New content after the change, if applicable.
    pub content: Option<String>,
    /// Unified diff of the change, if the provider produced one.
    pub diff: Option<String>,
    /// Content before the change, captured for rollback.
    pub backup: Option<String>,
}

impl FileChange {
    /// Creates a new file-change record.
    pub fn new(path: impl Into<String>, kind: ChangeKind) -> Self {
        Self { path: path.into(), kind, content: None, diff: None, backup: None }
    }

    /// Sets the post-change content.
    #[must_use]
    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    /// Sets the pre-change backup content.
    #[must_use]
    pub fn with_backup(mut self, backup: impl Into<String>) -> Self {
        self.backup = Some(backup.into());
        self
    }
}

/// Result of running one validation rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationOutcome {
    /// Name of the rule checker that produced this outcome.
    pub rule: String,
    /// Rule category.
    pub category: RuleCategory,
    /// Rule severity.
    pub severity: RuleSeverity,
    /// Whether the rule passed.
    pub passed: bool,
    /// Human-readable message.
    pub message: String,
    /// Remediation suggestions.
    pub suggestions: Vec<String>,
}

/// Performance metrics recorded for every execution, success or not.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    /// Wall-clock execution time in milliseconds.
    pub execution_ms: u64,
    /// Peak memory in bytes, when the provider reports it.
    pub memory_bytes: Option<u64>,
    /// CPU utilization percentage, when the provider reports it.
    pub cpu_percent: Option<f32>,
    /// Number of network calls made.
    pub network_calls: u32,
    /// Number of cache hits.
    pub cache_hits: u32,
}

/// Outcome of executing an action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    /// Whether the action (and its validations) succeeded.
    pub success: bool,
    /// Opaque provider output.
    pub output: serde_json::Value,
    /// File-level side effects, with backups for rollback.
    pub changes: Vec<FileChange>,
    /// Validation outcomes.
    pub validations: Vec<ValidationOutcome>,
    /// Performance metrics.
    pub metrics: PerformanceMetrics,
    /// Non-fatal warnings.
    pub warnings: Vec<String>,
    /// Suggested follow-up steps.
    pub next_steps: Vec<String>,
}

impl StepResult {
    /// Creates a successful result with the given output.
    pub fn success(output: serde_json::Value) -> Self {
        Self {
            success: true,
            output,
            changes: Vec::new(),
            validations: Vec::new(),
            metrics: PerformanceMetrics::default(),
            warnings: Vec::new(),
            next_steps: Vec::new(),
        }
    }

    /// Creates a failed result with a message as output.
    pub fn failure(message: impl Into<String>) -> Self {
        let mut result = Self::success(serde_json::Value::String(message.into()));
        result.success = false;
        result
    }

    /// Adds a file change.
    #[must_use]
    pub fn with_change(mut self, change: FileChange) -> Self {
        self.changes.push(change);
        self
    }
}

/// One dependency-ordered unit of work inside a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStep {
    /// Unique step identifier.
    pub id: String,
    /// The action this step performs.
    pub action: AgentAction,
    /// Human-readable description.
    pub description: String,
    /// Identifiers of predecessor steps that must complete first.
    pub dependencies: Vec<String>,
    /// Current status.
    pub status: StepStatus,
    /// Execution result, once available.
    pub result: Option<StepResult>,
    /// Error message, if the step failed.
    pub error: Option<String>,
    /// When execution started.
    pub started_at: Option<DateTime<Utc>>,
    /// When execution finished.
    pub completed_at: Option<DateTime<Utc>>,
    /// Whether this step requires approval before executing.
    pub approval_required: bool,
    /// Risk level, inherited from the action.
    pub risk_level: RiskLevel,
}

impl TaskStep {
    /// Creates a pending step wrapping the given action.
    pub fn new(action: AgentAction, description: impl Into<String>) -> Self {
        let approval_required = action.requires_approval;
        let risk_level = action.risk_level;
        Self {
            id: Uuid::new_v4().to_string(),
            action,
            description: description.into(),
            dependencies: Vec::new(),
            status: StepStatus::Pending,
            result: None,
            error: None,
            started_at: None,
            completed_at: None,
            approval_required,
            risk_level,
        }
    }

    /// Adds a dependency on a predecessor step.
    #[must_use]
    pub fn depends_on(mut self, step_id: impl Into<String>) -> Self {
        self.dependencies.push(step_id.into());
        self
    }

    /// Marks the step skipped with a reason.
    pub fn skip(&mut self, reason: impl Into<String>) {
        self.status = StepStatus::Skipped;
        self.error = Some(reason.into());
        self.completed_at = Some(Utc::now());
    }
}
