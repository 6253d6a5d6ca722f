//! Top-level coordinator: walks a task's steps in dependency order under
//! approval gating, interventions, and the error-recovery policy.
//!
//! One logical task executes at a time. Each step execution and each
//! approval wait is a suspension point: interventions and cancellation are
//! observed there, never by interrupting an in-flight action. Queued tasks
//! wait until the current one reaches a terminal state, then the next is
//! pulled FIFO from the state store.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::executor::{ExecutionContext, ExecutorError, StepExecutor};
use crate::oversight::{EscalationDecision, OversightError, OversightGate};
use crate::planning::{ComplexityLevel, GoalPlanner, PlanningError};
use crate::store::{StateStore, StoreError};
use crate::task::{
    AgenticTask, ApprovalResponse, ApprovalStatus, InterventionKind, LearningData, RiskAssessment,
    RiskLevel, StepStatus, TaskError, TaskStatus,
};

/// Errors surfaced by orchestrator entry points.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Goal decomposition failed.
    #[error(transparent)]
    Planning(#[from] PlanningError),

    /// The decomposed plan failed validation.
    #[error("plan validation failed: {0}")]
    InvalidPlan(String),

    /// Store operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Task state machine violation.
    #[error(transparent)]
    Task(#[from] TaskError),

    /// Approval bookkeeping failed.
    #[error(transparent)]
    Oversight(#[from] OversightError),

    /// No task with the given id is current or queued.
    #[error("task not found: {0}")]
    TaskNotFound(String),

    /// The task cannot be (re)started from its current status.
    #[error("task '{task_id}' is not runnable from status {status}")]
    TaskNotRunnable {
        /// Task in question.
        task_id: String,
        /// Its observed status.
        status: TaskStatus,
    },

    /// Another task is already executing on this orchestrator.
    #[error("an execution is already in progress")]
    AlreadyExecuting,
}

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Orchestrator tuning knobs.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Retry bound for transient step errors (timeouts, provider
    /// unavailability).
    pub max_step_retries: u32,
    /// Base backoff between retries; doubled per attempt.
    pub retry_backoff: Duration,
    /// Resource ceiling for one provider call.
    pub step_time_limit: Duration,
    /// Steps at or above this risk level are gated on approval.
    pub approval_risk_threshold: RiskLevel,
    /// Goals at or above this complexity require up-front approval.
    pub approval_complexity: ComplexityLevel,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_step_retries: 2,
            retry_backoff: Duration::from_millis(500),
            step_time_limit: Duration::from_secs(60),
            approval_risk_threshold: RiskLevel::High,
            approval_complexity: ComplexityLevel::High,
        }
    }
}

/// Snapshot of what the orchestrator is doing.
#[derive(Debug, Clone)]
pub struct ExecutionStatus {
    /// Whether a task is actively executing.
    pub is_executing: bool,
    /// Id of the current task, if any.
    pub current_task: Option<String>,
    /// Id of the step currently executing, if any.
    pub current_step: Option<String>,
}

/// Outcome of one pass over the current task's steps.
enum Flow {
    /// Keep walking steps.
    Continue,
    /// Execution suspended (pause or pending approval); return to caller.
    Suspended,
    /// The task reached a terminal status.
    Terminal,
}

/// Top-level coordinator over planner, executor, store, and oversight.
pub struct Orchestrator {
    planner: GoalPlanner,
    executor: StepExecutor,
    store: Arc<StateStore>,
    gate: OversightGate,
    config: OrchestratorConfig,
    executing: AtomicBool,
    pause_requested: AtomicBool,
    cancel_requested: AtomicBool,
    current_step: Mutex<Option<String>>,
}

impl Orchestrator {
    /// Creates an orchestrator over its collaborators.
    pub fn new(
        executor: StepExecutor,
        store: Arc<StateStore>,
        gate: OversightGate,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            planner: GoalPlanner::new(),
            executor,
            store,
            gate,
            config,
            executing: AtomicBool::new(false),
            pause_requested: AtomicBool::new(false),
            cancel_requested: AtomicBool::new(false),
            current_step: Mutex::new(None),
        }
    }

    /// Plans a goal and starts (or queues) the resulting task.
    ///
    /// Returns the new task's id. Planning and plan-validation errors
    /// surface directly; step-level failures during execution do not.
    pub async fn execute_goal(&self, goal: &str) -> Result<String> {
        let mut task = self.planner.decompose_goal(goal)?;

        let complexity = self.planner.estimate_complexity(goal);
        if complexity.level >= self.config.approval_complexity {
            task.approval_required = true;
        }

        let report = self.planner.validate_plan(&task);
        if !report.is_valid {
            return Err(OrchestratorError::InvalidPlan(report.errors.join("; ")));
        }

        task.transition(TaskStatus::Ready)?;
        let task_id = task.id.clone();
        info!(task_id = %task_id, steps = task.steps.len(), risk = %task.risk_level, "task planned");

        let busy = self.executing.load(Ordering::SeqCst)
            || self
                .store
                .current_task()?
                .is_some_and(|t| !t.status.is_terminal());
        if busy {
            self.store.add_task_to_queue(task)?;
            debug!(task_id = %task_id, "orchestrator busy, task queued");
            return Ok(task_id);
        }

        self.store.set_current_task(task)?;
        self.execute_task(&task_id).await?;
        Ok(task_id)
    }

    /// Starts or resumes a previously planned or queued task.
    ///
    /// Returns once the task reaches a terminal status or suspends
    /// (pause or pending approval). After a terminal status, queued tasks
    /// are pulled FIFO and executed in turn.
    pub async fn execute_task(&self, task_id: &str) -> Result<()> {
        if self.executing.swap(true, Ordering::SeqCst) {
            return Err(OrchestratorError::AlreadyExecuting);
        }
        let outcome = self.execute_task_inner(task_id).await;
        self.executing.store(false, Ordering::SeqCst);
        self.set_current_step(None);
        outcome
    }

    async fn execute_task_inner(&self, task_id: &str) -> Result<()> {
        let mut task = self.load_task(task_id)?;

        loop {
            let status = self.run_task(&mut task).await?;
            if !status.is_terminal() {
                return Ok(());
            }
            // Control flags aimed at the finished task must not leak into
            // the next one pulled from the queue.
            self.pause_requested.store(false, Ordering::SeqCst);
            self.cancel_requested.store(false, Ordering::SeqCst);
            // Current task finished; pull the next queued task, if any.
            match self.store.next_task()? {
                Some(next) => {
                    info!(task_id = %next.id, "pulling next task from queue");
                    self.store.set_current_task(next.clone())?;
                    task = next;
                }
                None => return Ok(()),
            }
        }
    }

    /// Requests a pause; observed at the next suspension point.
    pub fn pause_execution(&self) {
        self.pause_requested.store(true, Ordering::SeqCst);
        info!("pause requested");
    }

    /// Requests cancellation; observed at the next suspension point, or
    /// applied immediately when nothing is executing.
    pub fn cancel_execution(&self) -> Result<()> {
        if self.executing.load(Ordering::SeqCst) {
            self.cancel_requested.store(true, Ordering::SeqCst);
            info!("cancellation requested");
            return Ok(());
        }
        if let Some(task) = self.store.current_task()? {
            if !task.status.is_terminal() {
                self.store.update_task_status(&task.id, TaskStatus::Cancelled)?;
                info!(task_id = %task.id, "task cancelled while idle");
            }
        }
        Ok(())
    }

    /// Resolves a parked approval request against the current task.
    ///
    /// A rejection skips the gated step (and its dependents) and records
    /// the reason; call [`execute_task`](Self::execute_task) afterwards to
    /// resume.
    pub fn resolve_approval(&self, request_id: &str, response: ApprovalResponse) -> Result<()> {
        let resolved = self.gate.resolve_approval(request_id, response)?;

        let mut task = self
            .store
            .current_task()?
            .ok_or_else(|| OrchestratorError::TaskNotFound(request_id.to_string()))?;

        if let Some(slot) = task.approvals.iter_mut().find(|a| a.id == request_id) {
            *slot = resolved.clone();
        } else {
            task.approvals.push(resolved.clone());
        }

        if resolved.status == ApprovalStatus::Rejected {
            let reason = resolved
                .response
                .as_ref()
                .and_then(|r| r.feedback.clone())
                .unwrap_or_else(|| "approval rejected".to_string());
            self.reject_step(&mut task, &resolved.action.id, &reason);
        }

        task.refresh_progress();
        self.store.update_task(&task)?;
        Ok(())
    }

    /// Returns a snapshot of current execution state.
    pub fn get_execution_status(&self) -> ExecutionStatus {
        let current_task = self.store.current_task().ok().flatten().map(|t| t.id);
        let current_step = self.current_step.lock().map(|g| g.clone()).unwrap_or_default();
        ExecutionStatus {
            is_executing: self.executing.load(Ordering::SeqCst),
            current_task,
            current_step,
        }
    }

    // ---- internals -----------------------------------------------------

    fn load_task(&self, task_id: &str) -> Result<AgenticTask> {
        if let Some(current) = self.store.current_task()? {
            if current.id == task_id {
                return Ok(current);
            }
            if !current.status.is_terminal() {
                return Err(OrchestratorError::TaskNotRunnable {
                    task_id: task_id.to_string(),
                    status: current.status,
                });
            }
        }
        let queued = self
            .store
            .take_queued(task_id)?
            .ok_or_else(|| OrchestratorError::TaskNotFound(task_id.to_string()))?;
        self.store.set_current_task(queued.clone())?;
        Ok(queued)
    }

    /// Runs one task until it suspends or reaches a terminal status.
    async fn run_task(&self, task: &mut AgenticTask) -> Result<TaskStatus> {
        match task.status {
            TaskStatus::Ready | TaskStatus::Paused | TaskStatus::WaitingApproval => {
                task.transition(TaskStatus::Executing)?;
                self.write_task(task);
            }
            TaskStatus::Executing => {}
            status => {
                return Err(OrchestratorError::TaskNotRunnable {
                    task_id: task.id.clone(),
                    status,
                });
            }
        }

        let started = Instant::now();
        let mut escalated: HashSet<String> = HashSet::new();

        let final_status = loop {
            match self.observe_interventions(task).await? {
                Flow::Continue => {}
                Flow::Suspended => return Ok(task.status),
                Flow::Terminal => break task.status,
            }

            self.cascade_skips(task);

            let Some(index) = Self::next_runnable(task) else {
                break self.finish_task(task)?;
            };

            match self.run_step(task, index, &mut escalated).await? {
                Flow::Continue => {}
                Flow::Suspended => return Ok(task.status),
                Flow::Terminal => break task.status,
            }
        };

        task.actual_ms = Some(task.actual_ms.unwrap_or(0) + started.elapsed().as_millis() as u64);
        self.write_task(task);
        self.conclude(task).await;
        Ok(final_status)
    }

    /// Observes pause/cancel flags and polled interventions at a
    /// suspension point.
    async fn observe_interventions(&self, task: &mut AgenticTask) -> Result<Flow> {
        if self.cancel_requested.swap(false, Ordering::SeqCst) {
            return self.apply_cancel(task, "cancel requested by caller");
        }
        if self.pause_requested.swap(false, Ordering::SeqCst) {
            return self.apply_pause(task, "pause requested by caller");
        }

        let Some(intervention) = self.gate.poll_intervention().await else {
            return Ok(Flow::Continue);
        };
        task.interventions.push(intervention.clone());

        match intervention.kind {
            InterventionKind::Cancel => self.apply_cancel(task, &intervention.reason),
            InterventionKind::Pause => self.apply_pause(task, &intervention.reason),
            InterventionKind::Modify => {
                if let Some(instructions) = intervention.instructions {
                    if let Some(step) = task.steps.iter_mut().find(|s| s.status == StepStatus::Pending) {
                        info!(step_id = %step.id, "step modified by intervention");
                        step.description = instructions.clone();
                        step.action.description = instructions;
                    }
                }
                self.write_task(task);
                Ok(Flow::Continue)
            }
            InterventionKind::Redirect => {
                if let Some(new_goal) = intervention.instructions {
                    self.apply_redirect(task, &new_goal)?;
                }
                Ok(Flow::Continue)
            }
        }
    }

    fn apply_cancel(&self, task: &mut AgenticTask, reason: &str) -> Result<Flow> {
        task.transition(TaskStatus::Cancelled)?;
        task.metadata.tags.push(format!("cancelled: {reason}"));
        info!(task_id = %task.id, reason, "task cancelled");
        Ok(Flow::Terminal)
    }

    fn apply_pause(&self, task: &mut AgenticTask, reason: &str) -> Result<Flow> {
        task.transition(TaskStatus::Paused)?;
        task.metadata.tags.push(format!("paused: {reason}"));
        self.write_task(task);
        info!(task_id = %task.id, reason, "task paused");
        Ok(Flow::Suspended)
    }

    /// Re-plans the remaining work from a new goal.
    fn apply_redirect(&self, task: &mut AgenticTask, new_goal: &str) -> Result<()> {
        let plan = self.planner.decompose_goal(new_goal)?;
        info!(task_id = %task.id, new_goal, "task redirected");

        task.steps.retain(|s| s.status != StepStatus::Pending);
        // New steps keep only their internal dependency chain; completed
        // work stays recorded but does not gate them.
        task.steps.extend(plan.steps);
        task.goal = new_goal.to_string();
        task.metadata.version += 1;
        task.metadata.tags.push("redirected".to_string());
        task.refresh_progress();
        self.write_task(task);
        Ok(())
    }

    /// Skips every pending step downstream of a failed or skipped step.
    fn cascade_skips(&self, task: &mut AgenticTask) {
        let roots: Vec<String> = task
            .steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Failed | StepStatus::Skipped))
            .map(|s| s.id.clone())
            .collect();

        let mut touched = false;
        for root in roots {
            for id in task.transitive_dependents(&root) {
                if task.step(&id).is_some_and(|s| s.status == StepStatus::Pending) {
                    if let Some(step) = task.step_mut(&id) {
                        step.skip("dependency failed or was skipped");
                        debug!(step_id = %id, "step skipped: blocked dependency");
                    }
                    self.record_step(task, &id);
                    touched = true;
                }
            }
        }
        if touched {
            task.refresh_progress();
        }
    }

    /// First declared pending step with all dependencies completed.
    ///
    /// Steps are never re-sorted; a step with an unmet (but still viable)
    /// dependency is deferred in favor of later runnable steps.
    fn next_runnable(task: &AgenticTask) -> Option<usize> {
        let completed: HashSet<&str> = task
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .map(|s| s.id.as_str())
            .collect();
        task.steps.iter().position(|s| {
            s.status == StepStatus::Pending
                && s.dependencies.iter().all(|d| completed.contains(d.as_str()))
        })
    }

    /// Executes one step with approval gating and the recovery policy.
    async fn run_step(
        &self,
        task: &mut AgenticTask,
        index: usize,
        escalated: &mut HashSet<String>,
    ) -> Result<Flow> {
        let step_id = task.steps[index].id.clone();

        let gated = task.steps[index].approval_required
            || task.steps[index].risk_level >= self.config.approval_risk_threshold;
        if gated {
            match self.ensure_approved(task, index).await? {
                Flow::Continue => {}
                other => return Ok(other),
            }
        }

        self.set_current_step(Some(step_id.clone()));
        let ctx = self.execution_context(task);
        let outcome = self.executor.execute_step(&mut task.steps[index], &ctx).await;
        self.set_current_step(None);

        self.record_step(task, &step_id);
        task.refresh_progress();
        self.write_task(task);
        self.gate.show_progress(task).await;

        match outcome {
            Ok(_) => Ok(Flow::Continue),
            Err(ExecutorError::ApprovalPending(_)) => {
                // The executor refused an ungated run; put the step back
                // so resumption re-gates it.
                if let Some(step) = task.step_mut(&step_id) {
                    step.status = StepStatus::Pending;
                }
                task.transition(TaskStatus::WaitingApproval)?;
                self.write_task(task);
                Ok(Flow::Suspended)
            }
            Err(err) => self.recover_step(task, index, err, escalated).await,
        }
    }

    /// Applies the error-recovery policy to a failed step.
    ///
    /// Transient errors were already retried by the executor up to the
    /// configured bound, so by the time a failure reaches here it is
    /// structural: escalate exactly once, then honor the human's choice.
    async fn recover_step(
        &self,
        task: &mut AgenticTask,
        index: usize,
        err: ExecutorError,
        escalated: &mut HashSet<String>,
    ) -> Result<Flow> {
        let step_id = task.steps[index].id.clone();
        let issue = format!(
            "step '{}' failed: {err}",
            task.steps[index].description
        );
        warn!(task_id = %task.id, step_id = %step_id, error = %err, transient = err.is_transient(), "step failure");

        if escalated.contains(&step_id) {
            // Already escalated once for this step; fail the task.
            return self.fail_task(task, &issue).map(|()| Flow::Terminal);
        }
        escalated.insert(step_id.clone());

        match self.gate.escalate_issue(task, &issue).await {
            EscalationDecision::Retry => {
                let step = &mut task.steps[index];
                step.status = StepStatus::Pending;
                step.error = None;
                step.result = None;
                step.started_at = None;
                step.completed_at = None;
                task.refresh_progress();
                self.write_task(task);
                info!(step_id = %step_id, "retrying step after escalation");
                Ok(Flow::Continue)
            }
            EscalationDecision::Skip => {
                if let Some(step) = task.step_mut(&step_id) {
                    step.status = StepStatus::Skipped;
                }
                self.record_step(task, &step_id);
                task.refresh_progress();
                self.write_task(task);
                info!(step_id = %step_id, "step skipped after escalation");
                Ok(Flow::Continue)
            }
            EscalationDecision::Abort => self.fail_task(task, &issue).map(|()| Flow::Terminal),
        }
    }

    /// Blocks a gated step on an approval, requesting one if none is on
    /// file.
    async fn ensure_approved(&self, task: &mut AgenticTask, index: usize) -> Result<Flow> {
        let action = task.steps[index].action.clone();
        let existing = task.approvals.iter().find(|a| a.action.id == action.id).cloned();

        let request = match existing {
            Some(request) => request,
            None => {
                let risk = RiskAssessment::for_action(&action);
                let request = self
                    .gate
                    .request_approval(
                        &action,
                        risk,
                        format!("{} risk action: {}", action.risk_level, action.description),
                    )
                    .await?;
                task.approvals.push(request.clone());
                self.write_task(task);
                request
            }
        };

        match request.status {
            ApprovalStatus::Approved => Ok(Flow::Continue),
            ApprovalStatus::Rejected => {
                let reason = request
                    .response
                    .as_ref()
                    .and_then(|r| r.feedback.clone())
                    .unwrap_or_else(|| "approval rejected".to_string());
                self.reject_step(task, &action.id, &reason);
                task.refresh_progress();
                self.write_task(task);
                if task.status.is_terminal() {
                    return Ok(Flow::Terminal);
                }
                Ok(Flow::Continue)
            }
            ApprovalStatus::Pending => {
                task.transition(TaskStatus::WaitingApproval)?;
                self.write_task(task);
                info!(task_id = %task.id, "task waiting for approval");
                Ok(Flow::Suspended)
            }
        }
    }

    /// Skips the step gated by a rejected approval, cascades to its
    /// dependents, and fails the task when no viable path remains.
    fn reject_step(&self, task: &mut AgenticTask, action_id: &str, reason: &str) {
        let Some(step_id) = task
            .steps
            .iter()
            .find(|s| s.action.id == action_id)
            .map(|s| s.id.clone())
        else {
            return;
        };

        if let Some(step) = task.step_mut(&step_id) {
            step.skip(format!("approval rejected: {reason}"));
        }
        task.metadata.tags.push(format!("approval rejected: {reason}"));
        self.record_step(task, &step_id);
        self.cascade_skips(task);

        let viable_remaining = task.steps.iter().any(|s| s.status == StepStatus::Pending);
        // A deferred rejection arrives while the task is parked in
        // WaitingApproval; both entry states must fail the same way.
        let failable = matches!(task.status, TaskStatus::Executing | TaskStatus::WaitingApproval);
        if task.approval_required && !viable_remaining && failable {
            // The rejected step was the sole remaining path.
            if let Err(e) = self.fail_task(task, &format!("approval rejected: {reason}")) {
                warn!(task_id = %task.id, error = %e, "failing rejected task was not permitted");
            }
        }
    }

    fn fail_task(&self, task: &mut AgenticTask, reason: &str) -> Result<()> {
        task.transition(TaskStatus::Failed)?;
        task.metadata.tags.push(format!("failed: {reason}"));
        warn!(task_id = %task.id, reason, "task failed");
        Ok(())
    }

    /// Resolves the task's final status once no runnable step remains.
    fn finish_task(&self, task: &mut AgenticTask) -> Result<TaskStatus> {
        task.refresh_progress();
        if let Some(failed) = task.steps.iter().find(|s| s.status == StepStatus::Failed) {
            let reason = failed
                .error
                .clone()
                .unwrap_or_else(|| format!("step '{}' failed", failed.description));
            self.fail_task(task, &reason)?;
        } else if task.status == TaskStatus::Executing {
            task.transition(TaskStatus::Completed)?;
            info!(task_id = %task.id, "task completed");
        }
        Ok(task.status)
    }

    /// Terminal housekeeping: feedback, learning ledger, final flush.
    async fn conclude(&self, task: &mut AgenticTask) {
        if let Some(feedback) = self.gate.collect_feedback(task).await {
            task.feedback = Some(feedback);
        }

        let (success_tags, failure_tags) = match task.status {
            TaskStatus::Completed => (vec![task.metadata.source.clone()], Vec::new()),
            _ => (Vec::new(), vec![task.metadata.source.clone()]),
        };
        let learning = LearningData {
            pattern: task.metadata.source.clone(),
            success_tags,
            failure_tags,
            notes: None,
        };
        task.learning = Some(learning.clone());
        self.write_task(task);
        if let Err(e) = self.store.add_learning_data(&task.id, learning) {
            warn!(error = %e, "learning ledger append failed");
        }
    }

    fn execution_context(&self, task: &AgenticTask) -> ExecutionContext {
        let mut ctx = ExecutionContext::new(PathBuf::from(&task.context.workspace_root));
        ctx.completed_steps = task
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Completed)
            .map(|s| s.id.clone())
            .collect();
        ctx.time_limit = self.config.step_time_limit;
        ctx.max_retries = self.config.max_step_retries;
        ctx.retry_backoff = self.config.retry_backoff;
        // Gating already happened; the executor must not re-park the step.
        ctx.approval_granted = true;
        ctx
    }

    /// Writes the task through to the store, retrying the flush once.
    ///
    /// A flush failure must not discard in-memory progress; it is retried
    /// and then surfaced as a warning.
    fn write_task(&self, task: &AgenticTask) {
        if let Err(e) = self.store.update_task(task) {
            warn!(task_id = %task.id, error = %e, "state flush failed, retrying");
            if let Err(e) = self.store.update_task(task) {
                warn!(task_id = %task.id, error = %e, "state flush retry failed; keeping in-memory progress");
            }
        }
    }

    /// Appends the step's history record, tolerating flush failures.
    fn record_step(&self, task: &AgenticTask, step_id: &str) {
        let Some(step) = task.step(step_id) else { return };
        let duration_ms = step.result.as_ref().map_or(0, |r| r.metrics.execution_ms);
        let success = step.status == StepStatus::Completed;
        if let Err(e) =
            self.store.record_execution_step(&task.id, step_id, step.status, duration_ms, success)
        {
            warn!(task_id = %task.id, step_id, error = %e, "history append failed");
        }
    }

    fn set_current_step(&self, step_id: Option<String>) {
        if let Ok(mut guard) = self.current_step.lock() {
            *guard = step_id;
        }
    }
}
