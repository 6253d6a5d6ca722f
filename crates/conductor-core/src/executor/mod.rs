//! Step execution against a capability provider.
//!
//! The executor owns the risk controls around one step: dependency
//! pre-flight, pre-action file backups, a bounded timeout derived from the
//! action estimate, bounded retries with exponential backoff for transient
//! provider errors, validation of the produced change set, and rollback
//! from backups when validation rejects the output or the step times out.
//! The provider itself is an external collaborator behind an async trait.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::task::{
    ActionKind, AgentAction, ChangeKind, FileChange, RuleSeverity, StepResult, StepStatus, TaskStep,
};
use crate::validation::ValidatorRegistry;

/// Errors returned by capability providers.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider is temporarily unavailable; the call may be retried.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// The provider failed structurally; retrying will not help.
    #[error("provider failed: {0}")]
    Failed(String),
}

/// Errors that can occur while executing a step.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// A declared dependency has not completed.
    ///
    /// Indicates a planner or orchestrator bug; correct operation never
    /// surfaces this.
    #[error("step '{step_id}' dependency '{dependency}' is not completed")]
    DependencyNotSatisfied {
        /// The step that was about to run.
        step_id: String,
        /// The unmet dependency.
        dependency: String,
    },

    /// The step was not pending when execution was attempted.
    #[error("step '{step_id}' is not pending (status: {status:?})")]
    StepNotPending {
        /// The step in question.
        step_id: String,
        /// Its observed status.
        status: StepStatus,
    },

    /// The action requires an approval that is not on file.
    #[error("step '{0}' requires approval before execution")]
    ApprovalPending(String),

    /// The provider did not finish within the step's time budget.
    #[error("provider timed out after {0} ms")]
    ProviderTimeout(u64),

    /// The provider was unavailable past the retry bound.
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// The provider failed structurally.
    #[error("provider failed: {0}")]
    ProviderFailed(String),

    /// An error-severity validation rule rejected the produced change set.
    #[error("validation failed: {0}")]
    ValidationFailure(String),

    /// Filesystem error while taking or restoring backups.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecutorError {
    /// Returns true for errors that a retry at a higher level may resolve.
    pub fn is_transient(&self) -> bool {
        matches!(self, ExecutorError::ProviderTimeout(_) | ExecutorError::ProviderUnavailable(_))
    }
}

/// Result type for executor operations.
pub type Result<T> = std::result::Result<T, ExecutorError>;

/// Context for executing one step.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    /// Workspace root all file paths resolve against.
    pub workspace_root: PathBuf,
    /// Ids of steps that have completed; dependency pre-flight checks
    /// against this set.
    pub completed_steps: HashSet<String>,
    /// Resource ceiling for one provider call.
    pub time_limit: Duration,
    /// Retry bound for transient provider errors.
    pub max_retries: u32,
    /// Base backoff between retries; doubled per attempt.
    pub retry_backoff: Duration,
    /// Whether an approval is on file for the step about to run.
    pub approval_granted: bool,
}

impl ExecutionContext {
    /// Creates a context rooted at a workspace with default limits.
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            completed_steps: HashSet::new(),
            time_limit: Duration::from_secs(60),
            max_retries: 2,
            retry_backoff: Duration::from_millis(500),
            approval_granted: false,
        }
    }
}

/// External collaborator that actually performs an action.
///
/// The core does not specify how actions are implemented, only that the
/// provider conforms to this shape and respects the supplied timeout
/// budget.
#[async_trait]
pub trait CapabilityProvider: Send + Sync {
    /// Performs the action and reports its result and side effects.
    async fn perform(&self, action: &AgentAction, ctx: &ExecutionContext) -> std::result::Result<StepResult, ProviderError>;
}

/// Executes steps against a capability provider with validation.
pub struct StepExecutor {
    provider: Arc<dyn CapabilityProvider>,
    validators: Arc<ValidatorRegistry>,
}

impl StepExecutor {
    /// Creates an executor over a provider and validator registry.
    pub fn new(provider: Arc<dyn CapabilityProvider>, validators: Arc<ValidatorRegistry>) -> Self {
        Self { provider, validators }
    }

    /// Executes one step, mutating its status, result, and timestamps.
    ///
    /// On success the step is `Completed` and carries its result. On
    /// failure the step is `Failed` (or `WaitingApproval` for unapproved
    /// gated steps), partial file effects are rolled back from backups,
    /// and the error is also recorded on the step. Wall-clock metrics are
    /// recorded regardless of outcome.
    pub async fn execute_step(&self, step: &mut TaskStep, ctx: &ExecutionContext) -> Result<StepResult> {
        self.preflight(step, ctx)?;

        if step.approval_required && !ctx.approval_granted {
            step.status = StepStatus::WaitingApproval;
            return Err(ExecutorError::ApprovalPending(step.id.clone()));
        }

        step.status = StepStatus::Executing;
        step.started_at = Some(Utc::now());
        let started = Instant::now();

        let backup = self.snapshot_target(&step.action, ctx)?;
        let budget = Duration::from_millis(step.action.estimated_ms).min(ctx.time_limit).max(Duration::from_millis(1));

        let outcome = self.dispatch_with_retries(&step.action, ctx, budget).await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(mut result) => {
                result.metrics.execution_ms = elapsed_ms;
                self.attach_backup(&mut result, &step.action, backup);
                self.apply_validations(step, ctx, &mut result);

                if result.success {
                    step.status = StepStatus::Completed;
                    step.completed_at = Some(Utc::now());
                    step.result = Some(result.clone());
                    debug!(step_id = %step.id, kind = %step.action.kind, elapsed_ms, "step completed");
                    Ok(result)
                } else {
                    // Validation rejected the output; the operation itself
                    // succeeded, so roll its effects back.
                    self.rollback(&result.changes, ctx);
                    let message = result
                        .validations
                        .iter()
                        .filter(|v| !v.passed && v.severity == RuleSeverity::Error)
                        .map(|v| v.message.clone())
                        .collect::<Vec<_>>()
                        .join("; ");
                    step.status = StepStatus::Failed;
                    step.completed_at = Some(Utc::now());
                    step.error = Some(format!("validation failed: {message}"));
                    step.result = Some(result);
                    Err(ExecutorError::ValidationFailure(message))
                }
            }
            Err(err) => {
                // Partial side effects of a timed-out or failed call must
                // not be left half-applied.
                if let Some(change) = backup_change(&step.action, backup) {
                    self.rollback(&[change], ctx);
                }
                step.status = StepStatus::Failed;
                step.completed_at = Some(Utc::now());
                step.error = Some(err.to_string());
                let mut result = StepResult::failure(err.to_string());
                result.metrics.execution_ms = elapsed_ms;
                step.result = Some(result);
                warn!(step_id = %step.id, error = %err, "step failed");
                Err(err)
            }
        }
    }

    fn preflight(&self, step: &TaskStep, ctx: &ExecutionContext) -> Result<()> {
        if step.status != StepStatus::Pending {
            return Err(ExecutorError::StepNotPending { step_id: step.id.clone(), status: step.status });
        }
        for dep in &step.dependencies {
            if !ctx.completed_steps.contains(dep) {
                return Err(ExecutorError::DependencyNotSatisfied {
                    step_id: step.id.clone(),
                    dependency: dep.clone(),
                });
            }
        }
        Ok(())
    }

    /// Snapshots the target file content for destructive actions.
    fn snapshot_target(&self, action: &AgentAction, ctx: &ExecutionContext) -> Result<Option<String>> {
        if !action.kind.is_destructive() || action.kind == ActionKind::RunCommand {
            return Ok(None);
        }
        let path = ctx.workspace_root.join(&action.target);
        if path.exists() {
            let content = fs::read_to_string(&path)?;
            debug!(target = %action.target, bytes = content.len(), "captured pre-action backup");
            Ok(Some(content))
        } else {
            Ok(None)
        }
    }

    async fn dispatch_with_retries(
        &self,
        action: &AgentAction,
        ctx: &ExecutionContext,
        budget: Duration,
    ) -> Result<StepResult> {
        let mut attempt: u32 = 0;
        loop {
            let call = self.provider.perform(action, ctx);
            let outcome = tokio::time::timeout(budget, call).await;

            let transient: ExecutorError = match outcome {
                Ok(Ok(result)) => return Ok(result),
                Ok(Err(ProviderError::Failed(msg))) => return Err(ExecutorError::ProviderFailed(msg)),
                Ok(Err(ProviderError::Unavailable(msg))) => ExecutorError::ProviderUnavailable(msg),
                Err(_) => ExecutorError::ProviderTimeout(budget.as_millis() as u64),
            };

            if attempt >= ctx.max_retries {
                return Err(transient);
            }
            let backoff = ctx.retry_backoff * 2u32.saturating_pow(attempt);
            info!(
                kind = %action.kind,
                attempt = attempt + 1,
                backoff_ms = backoff.as_millis() as u64,
                error = %transient,
                "transient provider error, retrying"
            );
            tokio::time::sleep(backoff).await;
            attempt += 1;
        }
    }

    /// Ensures the change set carries the pre-action backup for the target.
    fn attach_backup(&self, result: &mut StepResult, action: &AgentAction, backup: Option<String>) {
        let Some(backup) = backup else { return };
        if let Some(change) = result.changes.iter_mut().find(|c| c.path == action.target) {
            if change.backup.is_none() {
                change.backup = Some(backup);
            }
        } else {
            let kind = if action.kind == ActionKind::DeleteFile { ChangeKind::Delete } else { ChangeKind::Modify };
            result.changes.push(FileChange::new(action.target.clone(), kind).with_backup(backup));
        }
    }

    fn apply_validations(&self, step: &TaskStep, _ctx: &ExecutionContext, result: &mut StepResult) {
        let snapshot = result.clone();
        for rule in &step.action.validation_rules {
            let out = self.validators.run_rule(rule, &step.action, &snapshot);
            if !out.passed && out.severity == RuleSeverity::Error {
                result.success = false;
            } else if !out.passed {
                result.warnings.push(out.message.clone());
            }
            result.validations.push(out);
        }
    }

    /// Restores files from recorded backups; removes created files with no
    /// prior content. Silent to data loss, explicit in the log.
    fn rollback(&self, changes: &[FileChange], ctx: &ExecutionContext) {
        for change in changes {
            let path = ctx.workspace_root.join(&change.path);
            match &change.backup {
                Some(backup) => {
                    if let Err(e) = fs::write(&path, backup) {
                        warn!(path = %change.path, error = %e, "rollback restore failed");
                    } else {
                        info!(path = %change.path, "rolled back to pre-action content");
                    }
                }
                None if change.kind == ChangeKind::Create => {
                    if path.exists() {
                        if let Err(e) = fs::remove_file(&path) {
                            warn!(path = %change.path, error = %e, "rollback removal failed");
                        } else {
                            info!(path = %change.path, "removed created file during rollback");
                        }
                    }
                }
                None => {}
            }
        }
    }
}

fn backup_change(action: &AgentAction, backup: Option<String>) -> Option<FileChange> {
    backup.map(|content| {
        FileChange::new(action.target.clone(), ChangeKind::Modify).with_backup(content)
    })
}
