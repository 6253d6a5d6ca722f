//! Core data model: tasks, steps, actions, approvals, and interventions.
//!
//! The orchestrator creates tasks during planning; after that the state
//! store owns the persisted copy and is the single source of truth. Other
//! components receive snapshots and return intents.

mod action;
mod agentic;
mod approval;
mod step;

pub use action::{ActionKind, AgentAction, RiskLevel, RuleCategory, RuleSeverity, ValidationRule};
pub use agentic::{
    AgenticTask, TaskContext, TaskError, TaskMetadata, TaskPriority, TaskProgress, TaskStatus,
};
pub use approval::{
    ApprovalRequest, ApprovalResponse, ApprovalStatus, HumanIntervention, InterventionKind,
    LearningData, RiskAssessment, UserFeedback,
};
pub use step::{
    ChangeKind, FileChange, PerformanceMetrics, StepResult, StepStatus, TaskStep, ValidationOutcome,
};
