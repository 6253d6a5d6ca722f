//! Human-in-the-loop gating: approvals, interventions, escalation, and
//! feedback.
//!
//! The gate is the only path between the orchestrator and a human. The
//! concrete rendering lives behind [`HumanInterface`]; the core calls out
//! through it and treats the answers as intents, never as direct mutations
//! of task state.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info};

use crate::task::{
    ActionKind, AgentAction, AgenticTask, ApprovalRequest, ApprovalResponse, ApprovalStatus,
    HumanIntervention, InterventionKind, RiskAssessment, TaskProgress, UserFeedback,
};

/// Errors that can occur in the oversight gate.
#[derive(Debug, Error)]
pub enum OversightError {
    /// No pending request with the given id.
    #[error("unknown approval request: {0}")]
    UnknownRequest(String),

    /// The request was already resolved.
    #[error("approval request already resolved: {0}")]
    AlreadyResolved(String),

    /// The pending-approval map lock was poisoned.
    #[error("oversight lock poisoned")]
    LockPoisoned,
}

/// Result type for oversight operations.
pub type Result<T> = std::result::Result<T, OversightError>;

/// Immediate answer from the human interface to an approval request.
#[derive(Debug, Clone)]
pub enum ApprovalDecision {
    /// Approved immediately.
    Approved,
    /// Rejected immediately with a reason.
    Rejected(String),
    /// No immediate answer; the request stays pending and execution
    /// suspends.
    Pending,
}

/// Human's choice when an issue is escalated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscalationDecision {
    /// Re-attempt the failing step once more.
    Retry,
    /// Mark the step skipped and continue with independent steps.
    Skip,
    /// Fail the task.
    Abort,
}

/// Contract exposed to the UI collaborator.
///
/// The core calls out through these; rendering is out of scope.
#[async_trait]
pub trait HumanInterface: Send + Sync {
    /// Notifies of a new approval request and returns any immediate
    /// decision.
    async fn on_approval_requested(&self, request: &ApprovalRequest) -> ApprovalDecision;

    /// Reflects progress in the human-visible view.
    async fn on_progress_changed(&self, progress: &TaskProgress);

    /// Polls for an out-of-band intervention.
    async fn on_intervention_available(&self) -> Option<HumanIntervention>;

    /// Presents an escalated issue with suggestions and returns the
    /// human's choice.
    async fn on_issue_escalated(
        &self,
        task: &AgenticTask,
        issue: &str,
        suggestions: &[String],
    ) -> EscalationDecision;

    /// Requests end-of-task feedback; a task may legitimately finish
    /// without any.
    async fn on_feedback_requested(&self, task: &AgenticTask) -> Option<UserFeedback>;
}

/// Turns high-risk actions into approval requests and relays human
/// control signals.
pub struct OversightGate {
    interface: Arc<dyn HumanInterface>,
    pending: Mutex<HashMap<String, ApprovalRequest>>,
}

impl OversightGate {
    /// Creates a gate over a human interface.
    pub fn new(interface: Arc<dyn HumanInterface>) -> Self {
        Self { interface, pending: Mutex::new(HashMap::new()) }
    }

    /// Creates an approval request for an action and notifies the human.
    ///
    /// An immediate decision resolves the request in place; otherwise it
    /// is parked as pending and the caller must suspend the step until
    /// [`resolve_approval`](Self::resolve_approval) is called.
    pub async fn request_approval(
        &self,
        action: &AgentAction,
        risk: RiskAssessment,
        reason: impl Into<String>,
    ) -> Result<ApprovalRequest> {
        let mut request = ApprovalRequest::new(action.clone(), reason);
        request.risk = risk;
        info!(
            request_id = %request.id,
            kind = %action.kind,
            risk = %request.risk.level,
            "approval requested"
        );

        match self.interface.on_approval_requested(&request).await {
            ApprovalDecision::Approved => request.resolve(ApprovalResponse::approve()),
            ApprovalDecision::Rejected(reason) => request.resolve(ApprovalResponse::reject(reason)),
            ApprovalDecision::Pending => {
                self.pending
                    .lock()
                    .map_err(|_| OversightError::LockPoisoned)?
                    .insert(request.id.clone(), request.clone());
            }
        }
        Ok(request)
    }

    /// Resolves a parked approval request.
    pub fn resolve_approval(&self, request_id: &str, response: ApprovalResponse) -> Result<ApprovalRequest> {
        let mut pending = self.pending.lock().map_err(|_| OversightError::LockPoisoned)?;
        let mut request = pending
            .remove(request_id)
            .ok_or_else(|| OversightError::UnknownRequest(request_id.to_string()))?;
        if request.status != ApprovalStatus::Pending {
            return Err(OversightError::AlreadyResolved(request_id.to_string()));
        }
        request.resolve(response);
        info!(request_id, status = ?request.status, "approval resolved");
        Ok(request)
    }

    /// Returns a parked pending request by id.
    pub fn pending_approval(&self, request_id: &str) -> Result<Option<ApprovalRequest>> {
        Ok(self.pending.lock().map_err(|_| OversightError::LockPoisoned)?.get(request_id).cloned())
    }

    /// Forwards progress to the human-visible view.
    pub async fn show_progress(&self, task: &AgenticTask) {
        self.interface.on_progress_changed(&task.progress).await;
    }

    /// Records an intervention and returns it.
    pub fn handle_intervention(
        &self,
        kind: InterventionKind,
        reason: impl Into<String>,
        instructions: Option<String>,
    ) -> HumanIntervention {
        let mut intervention = HumanIntervention::new(kind, reason);
        if let Some(instructions) = instructions {
            intervention = intervention.with_instructions(instructions);
        }
        info!(?kind, "intervention recorded");
        intervention
    }

    /// Polls the interface for an out-of-band intervention.
    pub async fn poll_intervention(&self) -> Option<HumanIntervention> {
        let intervention = self.interface.on_intervention_available().await;
        if let Some(ref i) = intervention {
            debug!(kind = ?i.kind, "intervention available");
        }
        intervention
    }

    /// Escalates an issue with context-aware suggestions and returns the
    /// human's choice.
    pub async fn escalate_issue(&self, task: &AgenticTask, issue: &str) -> EscalationDecision {
        let suggestions = Self::suggest_remediations(task, issue);
        info!(task_id = %task.id, issue, "issue escalated");
        self.interface.on_issue_escalated(task, issue, &suggestions).await
    }

    /// Requests end-of-task feedback.
    pub async fn collect_feedback(&self, task: &AgenticTask) -> Option<UserFeedback> {
        self.interface.on_feedback_requested(task).await
    }

    /// Remediation suggestions derived from the failing step's action kind.
    fn suggest_remediations(task: &AgenticTask, issue: &str) -> Vec<String> {
        let mut suggestions = Vec::new();

        let failing_kind = task
            .steps
            .iter()
            .find(|s| s.error.as_deref().is_some_and(|e| issue.contains(e)) || s.status == crate::task::StepStatus::Failed)
            .map(|s| s.action.kind);

        match failing_kind {
            Some(ActionKind::RunCommand) => {
                suggestions.push("retry with a longer timeout".to_string());
                suggestions.push("run the command manually and skip this step".to_string());
            }
            Some(ActionKind::RunTests) => {
                suggestions.push("inspect the failing tests before retrying".to_string());
            }
            Some(ActionKind::DeleteFile) => {
                suggestions.push("verify the file list and retry".to_string());
                suggestions.push("skip the deletion and continue".to_string());
            }
            Some(_) | None => {
                suggestions.push("retry the step".to_string());
                suggestions.push("skip the step and continue with independent work".to_string());
            }
        }
        suggestions.push("abort the task".to_string());
        suggestions
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::planning::GoalPlanner;
    use crate::task::RiskLevel;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Interface double with scripted answers.
    struct ScriptedInterface {
        decision: ApprovalDecision,
        escalations: AtomicU32,
    }

    impl ScriptedInterface {
        fn new(decision: ApprovalDecision) -> Self {
            Self { decision, escalations: AtomicU32::new(0) }
        }
    }

    #[async_trait]
    impl HumanInterface for ScriptedInterface {
        async fn on_approval_requested(&self, _request: &ApprovalRequest) -> ApprovalDecision {
            self.decision.clone()
        }

        async fn on_progress_changed(&self, _progress: &TaskProgress) {}

        async fn on_intervention_available(&self) -> Option<HumanIntervention> {
            None
        }

        async fn on_issue_escalated(
            &self,
            _task: &AgenticTask,
            _issue: &str,
            suggestions: &[String],
        ) -> EscalationDecision {
            self.escalations.fetch_add(1, Ordering::SeqCst);
            assert!(!suggestions.is_empty());
            EscalationDecision::Abort
        }

        async fn on_feedback_requested(&self, _task: &AgenticTask) -> Option<UserFeedback> {
            None
        }
    }

    fn risky_action() -> AgentAction {
        AgentAction::new(ActionKind::DeleteFile, "Delete temp files", "tmp")
    }

    #[tokio::test]
    async fn test_immediate_approval_resolves_in_place() {
        let gate = OversightGate::new(Arc::new(ScriptedInterface::new(ApprovalDecision::Approved)));
        let action = risky_action();
        let risk = RiskAssessment::for_action(&action);
        let request = gate.request_approval(&action, risk, "high risk").await.unwrap();
        assert_eq!(request.status, ApprovalStatus::Approved);
        assert!(gate.pending_approval(&request.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pending_approval_parks_and_resolves() {
        let gate = OversightGate::new(Arc::new(ScriptedInterface::new(ApprovalDecision::Pending)));
        let action = risky_action();
        let risk = RiskAssessment::for_action(&action);
        let request = gate.request_approval(&action, risk, "high risk").await.unwrap();
        assert_eq!(request.status, ApprovalStatus::Pending);
        assert!(gate.pending_approval(&request.id).unwrap().is_some());

        let resolved = gate.resolve_approval(&request.id, ApprovalResponse::reject("no")).unwrap();
        assert_eq!(resolved.status, ApprovalStatus::Rejected);
        assert!(gate.pending_approval(&request.id).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_resolve_unknown_request_fails() {
        let gate = OversightGate::new(Arc::new(ScriptedInterface::new(ApprovalDecision::Pending)));
        let err = gate.resolve_approval("nope", ApprovalResponse::approve()).unwrap_err();
        assert!(matches!(err, OversightError::UnknownRequest(_)));
    }

    #[tokio::test]
    async fn test_escalation_reaches_interface_with_suggestions() {
        let interface = Arc::new(ScriptedInterface::new(ApprovalDecision::Approved));
        let gate = OversightGate::new(interface.clone());
        let mut task = GoalPlanner::new().decompose_goal("Delete stale build artifacts").unwrap();
        task.steps[1].status = crate::task::StepStatus::Failed;
        task.steps[1].error = Some("provider timed out".to_string());

        let decision = gate.escalate_issue(&task, "provider timed out after 2 attempts").await;
        assert_eq!(decision, EscalationDecision::Abort);
        assert_eq!(interface.escalations.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_risk_assessment_levels_drive_gating() {
        let low = AgentAction::new(ActionKind::AnalyzeCode, "Analyze", "src");
        assert!(RiskAssessment::for_action(&low).level < RiskLevel::High);
        assert!(RiskAssessment::for_action(&risky_action()).level >= RiskLevel::High);
    }
}
