//! End-to-end orchestration flows over scripted provider and human doubles.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use tempfile::TempDir;

use conductor_core::{
    ActionKind, AgentAction, AgenticTask, ApprovalDecision, ApprovalRequest, ApprovalResponse,
    ApprovalStatus, CapabilityProvider, EscalationDecision, ExecutionContext, HumanInterface,
    HumanIntervention, InterventionKind, Orchestrator, OrchestratorConfig, OrchestratorError,
    OversightGate, ProviderError, StateStore, StepExecutor, StepResult, StepStatus, TaskProgress,
    TaskStatus, UserFeedback, ValidatorRegistry,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Per-kind scripted provider behavior.
#[derive(Debug, Clone, Copy)]
enum Behavior {
    /// Succeed with a summary payload.
    Ok,
    /// Never answer within any reasonable budget.
    Hang,
    /// Fail structurally.
    Fail,
}

struct ScriptedProvider {
    behaviors: HashMap<ActionKind, Behavior>,
    calls: AtomicU32,
}

impl ScriptedProvider {
    fn ok() -> Self {
        Self { behaviors: HashMap::new(), calls: AtomicU32::new(0) }
    }

    fn with_behavior(mut self, kind: ActionKind, behavior: Behavior) -> Self {
        self.behaviors.insert(kind, behavior);
        self
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CapabilityProvider for ScriptedProvider {
    async fn perform(
        &self,
        action: &AgentAction,
        _ctx: &ExecutionContext,
    ) -> Result<StepResult, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.behaviors.get(&action.kind).copied().unwrap_or(Behavior::Ok) {
            Behavior::Ok => Ok(StepResult::success(
                serde_json::json!({ "summary": action.description }),
            )),
            Behavior::Hang => {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(StepResult::success(serde_json::Value::Null))
            }
            Behavior::Fail => Err(ProviderError::Failed("scripted failure".to_string())),
        }
    }
}

/// Human double answering from scripted queues.
struct ScriptedHuman {
    /// Approval decisions, consumed front-to-back; empty means approve.
    decisions: Mutex<VecDeque<ApprovalDecision>>,
    /// Intervention poll answers, consumed front-to-back; empty means none.
    interventions: Mutex<VecDeque<Option<HumanIntervention>>>,
    escalation: EscalationDecision,
    escalations: AtomicU32,
    progress_updates: AtomicU32,
}

impl ScriptedHuman {
    fn approving() -> Self {
        Self {
            decisions: Mutex::new(VecDeque::new()),
            interventions: Mutex::new(VecDeque::new()),
            escalation: EscalationDecision::Abort,
            escalations: AtomicU32::new(0),
            progress_updates: AtomicU32::new(0),
        }
    }

    fn with_decisions(self, decisions: Vec<ApprovalDecision>) -> Self {
        *self.decisions.lock().unwrap() = decisions.into();
        self
    }

    fn with_interventions(self, interventions: Vec<Option<HumanIntervention>>) -> Self {
        *self.interventions.lock().unwrap() = interventions.into();
        self
    }

    fn with_escalation(mut self, decision: EscalationDecision) -> Self {
        self.escalation = decision;
        self
    }

    fn escalations(&self) -> u32 {
        self.escalations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HumanInterface for ScriptedHuman {
    async fn on_approval_requested(&self, _request: &ApprovalRequest) -> ApprovalDecision {
        self.decisions.lock().unwrap().pop_front().unwrap_or(ApprovalDecision::Approved)
    }

    async fn on_progress_changed(&self, _progress: &TaskProgress) {
        self.progress_updates.fetch_add(1, Ordering::SeqCst);
    }

    async fn on_intervention_available(&self) -> Option<HumanIntervention> {
        self.interventions.lock().unwrap().pop_front().flatten()
    }

    async fn on_issue_escalated(
        &self,
        _task: &AgenticTask,
        _issue: &str,
        suggestions: &[String],
    ) -> EscalationDecision {
        assert!(!suggestions.is_empty());
        self.escalations.fetch_add(1, Ordering::SeqCst);
        self.escalation
    }

    async fn on_feedback_requested(&self, task: &AgenticTask) -> Option<UserFeedback> {
        if task.status == TaskStatus::Completed {
            Some(UserFeedback { rating: 5, comment: None, timestamp: chrono::Utc::now() })
        } else {
            None
        }
    }
}

struct Harness {
    orchestrator: Orchestrator,
    store: Arc<StateStore>,
    human: Arc<ScriptedHuman>,
    provider: Arc<ScriptedProvider>,
    _dir: TempDir,
}

fn fast_config() -> OrchestratorConfig {
    OrchestratorConfig {
        max_step_retries: 1,
        retry_backoff: Duration::from_millis(5),
        step_time_limit: Duration::from_millis(50),
        ..OrchestratorConfig::default()
    }
}

fn harness(provider: ScriptedProvider, human: ScriptedHuman, config: OrchestratorConfig) -> Harness {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let store = Arc::new(StateStore::new(dir.path()).unwrap());
    let provider = Arc::new(provider);
    let human = Arc::new(human);
    let executor = StepExecutor::new(provider.clone(), Arc::new(ValidatorRegistry::with_builtins()));
    let gate = OversightGate::new(human.clone());
    let orchestrator = Orchestrator::new(executor, store.clone(), gate, config);
    Harness { orchestrator, store, human, provider, _dir: dir }
}

#[tokio::test]
async fn test_low_risk_goal_runs_to_completion() {
    let h = harness(ScriptedProvider::ok(), ScriptedHuman::approving(), OrchestratorConfig::default());

    let task_id = h.orchestrator.execute_goal("Implement a json config loader").await.unwrap();

    let task = h.store.current_task().unwrap().unwrap();
    assert_eq!(task.id, task_id);
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.steps.iter().all(|s| s.status == StepStatus::Completed));
    assert!((task.progress.percent_complete - 100.0).abs() < f32::EPSILON);
    assert!(task.actual_ms.is_some());
    assert_eq!(task.feedback.as_ref().map(|f| f.rating), Some(5));

    let history = h.store.execution_history(&task_id).unwrap();
    assert_eq!(history.len(), task.steps.len());
    assert!(history.iter().all(|r| r.success));
    assert!(h.human.progress_updates.load(Ordering::SeqCst) >= task.steps.len() as u32);
}

#[tokio::test]
async fn test_high_risk_steps_are_gated_and_approved() {
    let h = harness(ScriptedProvider::ok(), ScriptedHuman::approving(), OrchestratorConfig::default());

    let task_id = h.orchestrator.execute_goal("Delete stale build artifacts").await.unwrap();

    let task = h.store.current_task().unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    // DeleteFile and RunCommand are both high risk and each needs its own
    // approval; AnalyzeCode passes ungated.
    assert_eq!(task.approvals.len(), 2);
    assert!(task.approvals.iter().all(|a| a.status == ApprovalStatus::Approved));
    assert_eq!(h.store.execution_history(&task_id).unwrap().len(), 3);
}

#[tokio::test]
async fn test_pending_approval_suspends_and_resumes() {
    let human = ScriptedHuman::approving()
        .with_decisions(vec![ApprovalDecision::Pending, ApprovalDecision::Approved]);
    let h = harness(ScriptedProvider::ok(), human, OrchestratorConfig::default());

    let task_id = h.orchestrator.execute_goal("Remove the legacy telemetry module").await.unwrap();

    let task = h.store.current_task().unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::WaitingApproval);
    let request = task
        .approvals
        .iter()
        .find(|a| a.status == ApprovalStatus::Pending)
        .expect("a pending approval should be on file");
    // Only the analysis step ran before the gate suspended the task.
    assert_eq!(h.store.execution_history(&task_id).unwrap().len(), 1);

    h.orchestrator.resolve_approval(&request.id, ApprovalResponse::approve()).unwrap();
    h.orchestrator.execute_task(&task_id).await.unwrap();

    let task = h.store.current_task().unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert!(task.approvals.iter().all(|a| a.status == ApprovalStatus::Approved));
    assert_eq!(h.store.execution_history(&task_id).unwrap().len(), 3);
}

#[tokio::test]
async fn test_rejected_approval_skips_step_and_dependents() {
    let human = ScriptedHuman::approving()
        .with_decisions(vec![ApprovalDecision::Rejected("too risky".to_string())]);
    let h = harness(ScriptedProvider::ok(), human, OrchestratorConfig::default());

    let task_id = h.orchestrator.execute_goal("Delete stale build artifacts").await.unwrap();

    let task = h.store.current_task().unwrap().unwrap();
    assert_eq!(task.id, task_id);
    // The deletion and everything downstream of it is skipped; since the
    // rejected path was the only remaining work, the task fails.
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.steps[0].status, StepStatus::Completed);
    assert_eq!(task.steps[1].status, StepStatus::Skipped);
    assert_eq!(task.steps[2].status, StepStatus::Skipped);
    assert!(task.steps[1].error.as_deref().unwrap().contains("too risky"));
    assert!(task.metadata.tags.iter().any(|t| t.contains("approval rejected")));
}

#[tokio::test]
async fn test_deferred_rejection_fails_sole_path_task() {
    // The gate first answers Pending, parking the task in WaitingApproval;
    // the rejection then arrives out of band via resolve_approval.
    let human = ScriptedHuman::approving().with_decisions(vec![ApprovalDecision::Pending]);
    let h = harness(ScriptedProvider::ok(), human, OrchestratorConfig::default());

    let task_id = h.orchestrator.execute_goal("Delete stale build artifacts").await.unwrap();
    let task = h.store.current_task().unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::WaitingApproval);
    let request_id = task
        .approvals
        .iter()
        .find(|a| a.status == ApprovalStatus::Pending)
        .map(|a| a.id.clone())
        .unwrap();

    h.orchestrator.resolve_approval(&request_id, ApprovalResponse::reject("too risky")).unwrap();

    // The rejected deletion was the only remaining path, so the task
    // fails right there instead of waiting for a resume.
    let task = h.store.current_task().unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.steps[1].status, StepStatus::Skipped);
    assert_eq!(task.steps[2].status, StepStatus::Skipped);
    assert!(task.steps[1].error.as_deref().unwrap().contains("too risky"));
    assert!(task.metadata.tags.iter().any(|t| t.contains("approval rejected")));

    // Resuming a failed task is refused rather than completing it.
    let err = h.orchestrator.execute_task(&task_id).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::TaskNotRunnable { .. }));
}

#[tokio::test]
async fn test_pause_intervention_suspends_and_resume_finishes() {
    // Refactor plans four steps; pause lands after the second.
    let human = ScriptedHuman::approving().with_interventions(vec![
        None,
        None,
        Some(HumanIntervention::new(InterventionKind::Pause, "lunch")),
    ]);
    let h = harness(ScriptedProvider::ok(), human, OrchestratorConfig::default());

    let task_id = h.orchestrator.execute_goal("Refactor the session cache").await.unwrap();

    let task = h.store.current_task().unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Paused);
    assert_eq!(task.progress.completed_steps, 2);
    assert_eq!(task.interventions.len(), 1);
    assert_eq!(h.store.execution_history(&task_id).unwrap().len(), 2);

    h.orchestrator.execute_task(&task_id).await.unwrap();

    let task = h.store.current_task().unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.progress.completed_steps, 4);
    assert_eq!(h.store.execution_history(&task_id).unwrap().len(), 4);
}

#[tokio::test]
async fn test_cancel_intervention_stops_after_current_step() {
    let human = ScriptedHuman::approving().with_interventions(vec![
        None,
        Some(HumanIntervention::new(InterventionKind::Cancel, "wrong workspace")),
    ]);
    let h = harness(ScriptedProvider::ok(), human, OrchestratorConfig::default());

    let task_id = h.orchestrator.execute_goal("Fix the session expiry bug").await.unwrap();

    let task = h.store.current_task().unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(task.steps[0].status, StepStatus::Completed);
    // Steps after the cancellation point never start.
    assert!(task.steps[1..].iter().all(|s| s.status == StepStatus::Pending));
    // History holds exactly the one step that actually ran.
    assert_eq!(h.store.execution_history(&task_id).unwrap().len(), 1);
}

#[tokio::test]
async fn test_repeated_timeout_escalates_once_then_fails() {
    let provider = ScriptedProvider::ok().with_behavior(ActionKind::EditFile, Behavior::Hang);
    let human = ScriptedHuman::approving().with_escalation(EscalationDecision::Abort);
    let h = harness(provider, human, fast_config());

    let task_id = h.orchestrator.execute_goal("Fix the session expiry bug").await.unwrap();

    let task = h.store.current_task().unwrap().unwrap();
    assert_eq!(task.id, task_id);
    assert_eq!(task.status, TaskStatus::Failed);
    // One initial attempt plus one bounded retry timed out inside the
    // executor; the failure then escalated exactly once.
    assert_eq!(h.human.escalations(), 1);
    let edit = task.steps.iter().find(|s| s.action.kind == ActionKind::EditFile).unwrap();
    assert_eq!(edit.status, StepStatus::Failed);
    assert!(edit.error.as_deref().unwrap().contains("timed out"));
    assert!(task.metadata.tags.iter().any(|t| t.starts_with("failed:")));
}

#[tokio::test]
async fn test_escalation_retry_reattempts_the_step() {
    let provider = ScriptedProvider::ok().with_behavior(ActionKind::RunTests, Behavior::Fail);
    let human = ScriptedHuman::approving().with_escalation(EscalationDecision::Retry);
    let h = harness(provider, human, fast_config());

    h.orchestrator.execute_goal("Run the full regression tests").await.unwrap();

    let task = h.store.current_task().unwrap().unwrap();
    // Retry was granted once; the second structural failure ends the task.
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(h.human.escalations(), 1);
}

#[tokio::test]
async fn test_escalation_skip_continues_without_the_step() {
    let provider = ScriptedProvider::ok().with_behavior(ActionKind::AnalyzeCode, Behavior::Fail);
    let human = ScriptedHuman::approving().with_escalation(EscalationDecision::Skip);
    let h = harness(provider, human, fast_config());

    h.orchestrator.execute_goal("Document the storage layer").await.unwrap();

    let task = h.store.current_task().unwrap().unwrap();
    // Documenting plans analyze -> generate; skipping the analysis also
    // skips its dependent, leaving nothing runnable but nothing failed.
    assert_eq!(task.steps[0].status, StepStatus::Skipped);
    assert_eq!(task.steps[1].status, StepStatus::Skipped);
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(h.human.escalations(), 1);
}

#[tokio::test]
async fn test_second_goal_queues_behind_suspended_task() {
    let human = ScriptedHuman::approving().with_decisions(vec![ApprovalDecision::Pending]);
    let h = harness(ScriptedProvider::ok(), human, OrchestratorConfig::default());

    let first = h.orchestrator.execute_goal("Remove obsolete fixtures").await.unwrap();
    assert_eq!(h.store.current_task().unwrap().unwrap().status, TaskStatus::WaitingApproval);

    let second = h.orchestrator.execute_goal("Document the storage layer").await.unwrap();
    assert_ne!(first, second);
    assert_eq!(h.store.queue_len().unwrap(), 1);

    let request_id = {
        let task = h.store.current_task().unwrap().unwrap();
        task.approvals
            .iter()
            .find(|a| a.status == ApprovalStatus::Pending)
            .map(|a| a.id.clone())
            .unwrap()
    };
    h.orchestrator.resolve_approval(&request_id, ApprovalResponse::approve()).unwrap();
    h.orchestrator.execute_task(&first).await.unwrap();

    // The first task finished and the queued one was pulled and completed.
    assert_eq!(h.store.queue_len().unwrap(), 0);
    let current = h.store.current_task().unwrap().unwrap();
    assert_eq!(current.id, second);
    assert_eq!(current.status, TaskStatus::Completed);
    assert!(h.store.execution_history(&first).unwrap().iter().all(|r| r.success));

    let stats = h.store.task_statistics().unwrap();
    assert_eq!(stats.total_tasks, 2);
}

/// Approves everything, but files one cancellation request from the
/// feedback hook, after the task already reached its terminal status.
struct CancelOnFeedback {
    orchestrator: OnceLock<Arc<Orchestrator>>,
    fired: AtomicU32,
}

#[async_trait]
impl HumanInterface for CancelOnFeedback {
    async fn on_approval_requested(&self, _request: &ApprovalRequest) -> ApprovalDecision {
        ApprovalDecision::Approved
    }

    async fn on_progress_changed(&self, _progress: &TaskProgress) {}

    async fn on_intervention_available(&self) -> Option<HumanIntervention> {
        None
    }

    async fn on_issue_escalated(
        &self,
        _task: &AgenticTask,
        _issue: &str,
        _suggestions: &[String],
    ) -> EscalationDecision {
        EscalationDecision::Abort
    }

    async fn on_feedback_requested(&self, _task: &AgenticTask) -> Option<UserFeedback> {
        if self.fired.fetch_add(1, Ordering::SeqCst) == 0 {
            self.orchestrator.get().unwrap().cancel_execution().unwrap();
        }
        None
    }
}

#[tokio::test]
async fn test_late_cancel_request_does_not_leak_into_queued_task() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let store = Arc::new(StateStore::new(dir.path()).unwrap());
    let human = Arc::new(CancelOnFeedback {
        orchestrator: OnceLock::new(),
        fired: AtomicU32::new(0),
    });
    let executor = StepExecutor::new(
        Arc::new(ScriptedProvider::ok()),
        Arc::new(ValidatorRegistry::with_builtins()),
    );
    let orchestrator = Arc::new(Orchestrator::new(
        executor,
        store.clone(),
        OversightGate::new(human.clone()),
        OrchestratorConfig::default(),
    ));
    assert!(human.orchestrator.set(orchestrator.clone()).is_ok());

    // The cancellation lands while the first task is concluding, too late
    // to affect it and aimed at nothing else.
    let first = orchestrator.execute_goal("Implement a retry helper").await.unwrap();
    assert_eq!(h_status(&store, &first), TaskStatus::Completed);
    assert_eq!(human.fired.load(Ordering::SeqCst), 1);

    // The next task must start fresh instead of inheriting the stale flag.
    let second = orchestrator.execute_goal("Document the storage layer").await.unwrap();
    assert_eq!(h_status(&store, &second), TaskStatus::Completed);
}

fn h_status(store: &StateStore, task_id: &str) -> TaskStatus {
    let task = store.current_task().unwrap().unwrap();
    assert_eq!(task.id, task_id);
    task.status
}

#[tokio::test]
async fn test_cancel_while_idle_cancels_current_task() {
    let human = ScriptedHuman::approving().with_decisions(vec![ApprovalDecision::Pending]);
    let h = harness(ScriptedProvider::ok(), human, OrchestratorConfig::default());

    h.orchestrator.execute_goal("Remove obsolete fixtures").await.unwrap();
    assert_eq!(h.store.current_task().unwrap().unwrap().status, TaskStatus::WaitingApproval);

    h.orchestrator.cancel_execution().unwrap();
    assert_eq!(h.store.current_task().unwrap().unwrap().status, TaskStatus::Cancelled);
}

#[tokio::test]
async fn test_execution_status_reflects_idle_state() {
    let h = harness(ScriptedProvider::ok(), ScriptedHuman::approving(), OrchestratorConfig::default());

    let status = h.orchestrator.get_execution_status();
    assert!(!status.is_executing);
    assert!(status.current_task.is_none());
    assert!(status.current_step.is_none());

    let task_id = h.orchestrator.execute_goal("Audit the dependency tree").await.unwrap();
    let status = h.orchestrator.get_execution_status();
    assert!(!status.is_executing);
    assert_eq!(status.current_task.as_deref(), Some(task_id.as_str()));
}

#[tokio::test]
async fn test_modify_intervention_rewrites_next_pending_step() {
    let human = ScriptedHuman::approving().with_interventions(vec![
        None,
        Some(
            HumanIntervention::new(InterventionKind::Modify, "narrower scope")
                .with_instructions("Apply the fix only to the session module"),
        ),
    ]);
    let h = harness(ScriptedProvider::ok(), human, OrchestratorConfig::default());

    h.orchestrator.execute_goal("Fix the session expiry bug").await.unwrap();

    let task = h.store.current_task().unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.interventions.len(), 1);
    assert!(task
        .steps
        .iter()
        .any(|s| s.description == "Apply the fix only to the session module"));
}

#[tokio::test]
async fn test_empty_goal_is_a_planning_error() {
    let h = harness(ScriptedProvider::ok(), ScriptedHuman::approving(), OrchestratorConfig::default());
    let err = h.orchestrator.execute_goal("   ").await.unwrap_err();
    assert!(err.to_string().contains("empty"));
    assert_eq!(h.provider.calls(), 0);
}

#[tokio::test]
async fn test_state_survives_reopen() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let task_id;
    {
        let store = Arc::new(StateStore::new(dir.path()).unwrap());
        let provider: Arc<ScriptedProvider> = Arc::new(ScriptedProvider::ok());
        let human: Arc<ScriptedHuman> = Arc::new(ScriptedHuman::approving());
        let executor =
            StepExecutor::new(provider, Arc::new(ValidatorRegistry::with_builtins()));
        let orchestrator = Orchestrator::new(
            executor,
            store.clone(),
            OversightGate::new(human),
            OrchestratorConfig::default(),
        );
        task_id = orchestrator.execute_goal("Implement a retry helper").await.unwrap();
    }

    let reopened = StateStore::new(dir.path()).unwrap();
    let task = reopened.current_task().unwrap().unwrap();
    assert_eq!(task.id, task_id);
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(reopened.execution_history(&task_id).unwrap().len(), task.steps.len());
}
