//! The agentic task: one user goal and its supervised execution state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::action::RiskLevel;
use super::approval::{ApprovalRequest, HumanIntervention, LearningData, UserFeedback};
use super::step::{StepStatus, TaskStep};

/// Errors raised by task state manipulation.
#[derive(Debug, Error)]
pub enum TaskError {
    /// The requested status transition is not allowed by the state machine.
    #[error("invalid task transition: {from} -> {to}")]
    InvalidTransition {
        /// Current status.
        from: TaskStatus,
        /// Requested status.
        to: TaskStatus,
    },
}

/// Task-level state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Goal decomposition in progress.
    Planning,
    /// Planned and waiting to start.
    Ready,
    /// Steps are being executed.
    Executing,
    /// Blocked on a pending approval.
    WaitingApproval,
    /// Halted by a human; resumable.
    Paused,
    /// All steps reached a terminal status with no unhandled failure.
    Completed,
    /// An unrecoverable step failure ended the task.
    Failed,
    /// Cancelled by a human.
    Cancelled,
}

impl TaskStatus {
    /// Returns true for statuses that end the task instance.
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }

    /// Returns true if the state machine allows moving to `next`.
    ///
    /// Any non-terminal status may move to `Cancelled`. `Paused` is
    /// re-enterable into `Executing` (a paused task frees the scheduler,
    /// but resumption is explicit and never automatic).
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        if self == next {
            return false;
        }
        if !self.is_terminal() && next == TaskStatus::Cancelled {
            return true;
        }
        matches!(
            (self, next),
            (TaskStatus::Planning, TaskStatus::Ready | TaskStatus::Failed)
                | (TaskStatus::Ready, TaskStatus::Executing)
                | (
                    TaskStatus::Executing,
                    TaskStatus::WaitingApproval
                        | TaskStatus::Paused
                        | TaskStatus::Completed
                        | TaskStatus::Failed
                )
                | (TaskStatus::WaitingApproval, TaskStatus::Executing | TaskStatus::Failed)
                | (TaskStatus::Paused, TaskStatus::Executing)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskStatus::Planning => "planning",
            TaskStatus::Ready => "ready",
            TaskStatus::Executing => "executing",
            TaskStatus::WaitingApproval => "waiting_approval",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Task priority for queue scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    /// Background work.
    Low,
    /// Default priority.
    Normal,
    /// Elevated priority.
    High,
    /// Run as soon as possible.
    Urgent,
}

/// Read-only workspace context supplied by external collaborators.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskContext {
    /// Workspace root directory.
    pub workspace_root: String,
    /// Files currently open or of interest.
    pub active_files: Vec<String>,
    /// Active VCS branch, if known.
    pub branch: Option<String>,
    /// Declared project dependencies.
    pub dependencies: Vec<String>,
    /// Architecture snapshot text.
    pub architecture_notes: Option<String>,
    /// Security snapshot text.
    pub security_notes: Option<String>,
    /// Quality snapshot text.
    pub quality_notes: Option<String>,
}

/// Task bookkeeping metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMetadata {
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last-update timestamp.
    pub updated_at: DateTime<Utc>,
    /// Monotonic version counter, bumped by plan adaptation.
    pub version: u32,
    /// Free-form tags (rejection reasons, categories, ...).
    pub tags: Vec<String>,
    /// Where the task came from (goal text, queue, adaptation).
    pub source: String,
}

impl TaskMetadata {
    /// Creates metadata for a freshly planned task.
    pub fn new(source: impl Into<String>) -> Self {
        let now = Utc::now();
        Self { created_at: now, updated_at: now, version: 1, tags: Vec::new(), source: source.into() }
    }

    /// Marks the metadata updated now.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Aggregated step counts for a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskProgress {
    /// Total number of steps.
    pub total_steps: u32,
    /// Steps completed successfully.
    pub completed_steps: u32,
    /// Steps that failed.
    pub failed_steps: u32,
    /// Steps that were skipped.
    pub skipped_steps: u32,
    /// Percent complete (0.0-100.0), counting terminal steps.
    pub percent_complete: f32,
    /// Remaining time estimate in milliseconds.
    pub remaining_ms_estimate: u64,
}

impl TaskProgress {
    /// Recomputes progress from a step list.
    pub fn from_steps(steps: &[TaskStep]) -> Self {
        let total = steps.len() as u32;
        let completed = steps.iter().filter(|s| s.status == StepStatus::Completed).count() as u32;
        let failed = steps.iter().filter(|s| s.status == StepStatus::Failed).count() as u32;
        let skipped = steps.iter().filter(|s| s.status == StepStatus::Skipped).count() as u32;
        let terminal = completed + failed + skipped;
        let percent = if total == 0 { 0.0 } else { (f64::from(terminal) / f64::from(total) * 100.0) as f32 };
        let remaining_ms: u64 = steps
            .iter()
            .filter(|s| !s.status.is_terminal())
            .map(|s| s.action.estimated_ms)
            .sum();

        Self {
            total_steps: total,
            completed_steps: completed,
            failed_steps: failed,
            skipped_steps: skipped,
            percent_complete: percent,
            remaining_ms_estimate: remaining_ms,
        }
    }
}

/// One user goal with its decomposed steps and supervision state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgenticTask {
    /// Unique task identifier.
    pub id: String,
    /// The free-form goal that produced this task.
    pub goal: String,
    /// Ordered, dependency-respecting step list.
    pub steps: Vec<TaskStep>,
    /// Task status.
    pub status: TaskStatus,
    /// Scheduling priority.
    pub priority: TaskPriority,
    /// Aggregate risk across all steps.
    pub risk_level: RiskLevel,
    /// Estimated total duration in milliseconds.
    pub estimated_ms: u64,
    /// Actual duration in milliseconds, once finished.
    pub actual_ms: Option<u64>,
    /// Whether the task as a whole requires up-front approval.
    pub approval_required: bool,
    /// Read-only workspace context.
    pub context: TaskContext,
    /// Bookkeeping metadata.
    pub metadata: TaskMetadata,
    /// Aggregated progress counts.
    pub progress: TaskProgress,
    /// Approval requests raised during execution.
    pub approvals: Vec<ApprovalRequest>,
    /// Interventions recorded during execution.
    pub interventions: Vec<HumanIntervention>,
    /// End-of-task feedback, if the human gave any.
    pub feedback: Option<UserFeedback>,
    /// Learning-ledger entry, if recorded.
    pub learning: Option<LearningData>,
}

impl AgenticTask {
    /// Creates a task in `Planning` from a goal and its decomposed steps.
    ///
    /// Aggregate risk is the maximum step risk; the estimate is the sum of
    /// step estimates; `approval_required` is set when aggregate risk
    /// reaches `High`.
    pub fn new(goal: impl Into<String>, steps: Vec<TaskStep>) -> Self {
        let goal = goal.into();
        let risk = steps.iter().map(|s| s.risk_level).max().unwrap_or(RiskLevel::Low);
        let estimated_ms = steps.iter().map(|s| s.action.estimated_ms).sum();
        let progress = TaskProgress::from_steps(&steps);

        Self {
            id: Uuid::new_v4().to_string(),
            goal: goal.clone(),
            steps,
            status: TaskStatus::Planning,
            priority: TaskPriority::Normal,
            risk_level: risk,
            estimated_ms,
            actual_ms: None,
            approval_required: risk >= RiskLevel::High,
            context: TaskContext::default(),
            metadata: TaskMetadata::new(goal),
            progress,
            approvals: Vec::new(),
            interventions: Vec::new(),
            feedback: None,
            learning: None,
        }
    }

    /// Transitions the task status, enforcing the state machine.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), TaskError> {
        if !self.status.can_transition_to(next) {
            return Err(TaskError::InvalidTransition { from: self.status, to: next });
        }
        self.status = next;
        self.metadata.touch();
        Ok(())
    }

    /// Recomputes `progress` from the current step statuses.
    pub fn refresh_progress(&mut self) {
        self.progress = TaskProgress::from_steps(&self.steps);
        self.metadata.touch();
    }

    /// Finds a step by id.
    pub fn step(&self, step_id: &str) -> Option<&TaskStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    /// Finds a step by id, mutably.
    pub fn step_mut(&mut self, step_id: &str) -> Option<&mut TaskStep> {
        self.steps.iter_mut().find(|s| s.id == step_id)
    }

    /// Ids of steps transitively dependent on `step_id`, in declaration
    /// order.
    pub fn transitive_dependents(&self, step_id: &str) -> Vec<String> {
        let mut affected: Vec<String> = vec![step_id.to_string()];
        // Steps are declared in topological order, so one forward pass
        // reaches every transitive dependent.
        for step in &self.steps {
            if step.dependencies.iter().any(|d| affected.contains(d)) && !affected.contains(&step.id) {
                affected.push(step.id.clone());
            }
        }
        affected.remove(0);
        affected
    }
}
