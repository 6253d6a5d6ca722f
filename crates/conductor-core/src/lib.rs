//! Autonomous task orchestration core.
//!
//! Turns a free-form goal into a dependency-ordered plan of agent actions,
//! executes it under human oversight (approval gating, interventions,
//! escalation), and keeps every mutation durable in a JSON state store.
//!
//! The crate is UI- and provider-agnostic: rendering lives behind
//! [`HumanInterface`] and action execution behind [`CapabilityProvider`].

pub mod executor;
pub mod orchestrator;
pub mod oversight;
pub mod planning;
pub mod store;
pub mod task;
pub mod validation;

pub use executor::{CapabilityProvider, ExecutionContext, ExecutorError, ProviderError, StepExecutor};
pub use orchestrator::{
    ExecutionStatus, Orchestrator, OrchestratorConfig, OrchestratorError,
};
pub use oversight::{
    ApprovalDecision, EscalationDecision, HumanInterface, OversightError, OversightGate,
};
pub use planning::{
    ComplexityEstimate, ComplexityLevel, GoalPlanner, PlanningError, ValidationReport,
};
pub use store::{
    AutosaveHandle, LearningRecord, StateStore, StepRecord, StoreError,
    TaskStatistics, DEFAULT_AUTOSAVE_INTERVAL,
};
pub use task::{
    ActionKind, AgentAction, AgenticTask, ApprovalRequest, ApprovalResponse, ApprovalStatus,
    FileChange, HumanIntervention, InterventionKind, LearningData, RiskAssessment, RiskLevel,
    RuleCategory, RuleSeverity, StepResult, StepStatus, TaskError, TaskPriority, TaskProgress,
    TaskStatus, TaskStep, UserFeedback, ValidationOutcome, ValidationRule,
};
pub use validation::{Validator, ValidatorRegistry};
