//! Approval requests, interventions, and end-of-task feedback.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::action::{ActionKind, AgentAction, RiskLevel};

/// Risk assessment attached to an approval request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskAssessment {
    /// Overall risk level.
    pub level: RiskLevel,
    /// Contributing factors.
    pub factors: Vec<String>,
    /// Description of the potential impact.
    pub impact: String,
    /// Suggested mitigations.
    pub mitigations: Vec<String>,
    /// Confidence in the assessment (0.0-1.0).
    pub confidence: f32,
}

impl RiskAssessment {
    /// Builds an assessment for an action from its kind and target.
    pub fn for_action(action: &AgentAction) -> Self {
        let mut factors = vec![format!("action kind: {}", action.kind)];
        let mut mitigations = Vec::new();

        if action.kind.is_destructive() {
            factors.push("action mutates workspace state".to_string());
            mitigations.push("pre-action backup is taken for rollback".to_string());
        }
        let impact = match action.kind {
            ActionKind::DeleteFile => format!("file '{}' will be removed", action.target),
            ActionKind::RunCommand => format!("command '{}' will run in the workspace", action.target),
            ActionKind::EditFile | ActionKind::RefactorCode | ActionKind::OptimizePerformance => {
                format!("file '{}' will be modified", action.target)
            }
            _ => format!("'{}' will be read or created", action.target),
        };

        Self { level: action.risk_level, factors, impact, mitigations, confidence: 0.8 }
    }
}

/// Status of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    /// Awaiting a human decision.
    Pending,
    /// Approved.
    Approved,
    /// Rejected.
    Rejected,
}

/// Recorded human decision on an approval request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalResponse {
    /// Whether the action was approved.
    pub approved: bool,
    /// Optional feedback text.
    pub feedback: Option<String>,
    /// Optional replacement target for the action.
    pub modified_target: Option<String>,
    /// When the decision was made.
    pub timestamp: DateTime<Utc>,
}

impl ApprovalResponse {
    /// Creates an approving response.
    pub fn approve() -> Self {
        Self { approved: true, feedback: None, modified_target: None, timestamp: Utc::now() }
    }

    /// Creates a rejecting response with a reason.
    pub fn reject(reason: impl Into<String>) -> Self {
        Self {
            approved: false,
            feedback: Some(reason.into()),
            modified_target: None,
            timestamp: Utc::now(),
        }
    }
}

/// A pending human decision blocking a step's execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Unique request identifier.
    pub id: String,
    /// The action in question.
    pub action: AgentAction,
    /// Why approval is needed.
    pub reason: String,
    /// Risk assessment for the action.
    pub risk: RiskAssessment,
    /// Alternative actions the human may prefer.
    pub alternatives: Vec<String>,
    /// Request status.
    pub status: ApprovalStatus,
    /// The recorded decision, once resolved.
    pub response: Option<ApprovalResponse>,
}

impl ApprovalRequest {
    /// Creates a pending request for an action.
    pub fn new(action: AgentAction, reason: impl Into<String>) -> Self {
        let risk = RiskAssessment::for_action(&action);
        Self {
            id: Uuid::new_v4().to_string(),
            action,
            reason: reason.into(),
            risk,
            alternatives: Vec::new(),
            status: ApprovalStatus::Pending,
            response: None,
        }
    }

    /// Records a resolution.
    pub fn resolve(&mut self, response: ApprovalResponse) {
        self.status = if response.approved { ApprovalStatus::Approved } else { ApprovalStatus::Rejected };
        self.response = Some(response);
    }
}

/// Kind of out-of-band human control signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterventionKind {
    /// Halt after the current step.
    Pause,
    /// Replace the upcoming step.
    Modify,
    /// Stop the task, no further steps.
    Cancel,
    /// Supply a new goal and re-plan.
    Redirect,
}

/// Out-of-band human control signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanIntervention {
    /// Kind of intervention.
    pub kind: InterventionKind,
    /// Why the human intervened.
    pub reason: String,
    /// Instructions for modify/redirect interventions.
    pub instructions: Option<String>,
    /// When the intervention was recorded.
    pub timestamp: DateTime<Utc>,
}

impl HumanIntervention {
    /// Creates a new intervention.
    pub fn new(kind: InterventionKind, reason: impl Into<String>) -> Self {
        Self { kind, reason: reason.into(), instructions: None, timestamp: Utc::now() }
    }

    /// Attaches instructions.
    #[must_use]
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }
}

/// End-of-task feedback collected from the human.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserFeedback {
    /// Rating from 1 (poor) to 5 (excellent).
    pub rating: u8,
    /// Free-form comment.
    pub comment: Option<String>,
    /// When the feedback was given.
    pub timestamp: DateTime<Utc>,
}

/// Learning-ledger entry attached to a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningData {
    /// Recognized pattern for this task.
    pub pattern: String,
    /// Tags describing what worked.
    pub success_tags: Vec<String>,
    /// Tags describing what failed.
    pub failure_tags: Vec<String>,
    /// Free-form notes.
    pub notes: Option<String>,
}
