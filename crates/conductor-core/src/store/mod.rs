//! Durable orchestration state: current task, queue, history, statistics,
//! preferences, and the learning ledger.
//!
//! The whole state is one JSON document per workspace, rewritten after
//! every mutating call. All mutations go through a single mutex, so the
//! persisted file stays consistent even when the hosting process fields
//! overlapping calls. An autosave task additionally flushes on a fixed
//! interval (30 seconds by default), bounding what an abrupt termination
//! can lose.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::task::{AgenticTask, LearningData, StepStatus, TaskError, TaskProgress, TaskStatus};

/// Default autosave interval.
pub const DEFAULT_AUTOSAVE_INTERVAL: Duration = Duration::from_secs(30);

const STATE_FILE: &str = "orchestration-state.json";

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// I/O error while flushing or loading.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No task with the given id is known to the store.
    #[error("unknown task: {0}")]
    UnknownTask(String),

    /// A status update violated the task state machine.
    #[error(transparent)]
    Task(#[from] TaskError),

    /// The store mutex was poisoned by a panicking thread.
    #[error("store lock poisoned")]
    LockPoisoned,
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// One execution-history record, appended per step resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    /// The step this record describes.
    pub step_id: String,
    /// Terminal (or waiting) status the step reached.
    pub status: StepStatus,
    /// Wall-clock duration in milliseconds.
    pub duration_ms: u64,
    /// Whether the step succeeded.
    pub success: bool,
    /// When the record was appended.
    pub recorded_at: DateTime<Utc>,
}

/// Aggregate statistics derived from stored state, never independently
/// mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatistics {
    /// Distinct task ids ever seen by the store.
    pub total_tasks: u64,
    /// Tasks currently in `Completed`.
    pub completed_tasks: u64,
    /// Tasks currently in `Failed`.
    pub failed_tasks: u64,
    /// Total step records across all tasks.
    pub total_steps: u64,
    /// Step records marked successful.
    pub successful_steps: u64,
    /// Successful fraction of recorded steps (0.0-1.0).
    pub success_rate: f64,
    /// Mean recorded step duration in milliseconds.
    pub average_step_duration_ms: f64,
}

/// Learning-ledger record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningRecord {
    /// Task this record came from.
    pub task_id: String,
    /// The learning payload.
    pub data: LearningData,
    /// When the record was added.
    pub recorded_at: DateTime<Utc>,
}

/// The persisted document, written wholesale on every mutation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PersistedState {
    current_task: Option<AgenticTask>,
    task_queue: VecDeque<AgenticTask>,
    execution_history: HashMap<String, Vec<StepRecord>>,
    user_preferences: HashMap<String, String>,
    learning_data: Vec<LearningRecord>,
    /// Every task id ever passed to `set_current_task` or
    /// `record_execution_step`; statistics derive `total_tasks` from it.
    seen_task_ids: BTreeSet<String>,
    last_saved: Option<DateTime<Utc>>,
}

/// Durable record of orchestration state for one workspace.
pub struct StateStore {
    state_path: PathBuf,
    state: Mutex<PersistedState>,
}

impl StateStore {
    /// Opens (or creates) the store in a data directory.
    ///
    /// # Errors
    /// Returns error if the directory cannot be created or an existing
    /// state file cannot be parsed.
    pub fn new(data_dir: impl AsRef<Path>) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)?;

        let state_path = data_dir.join(STATE_FILE);
        let state = if state_path.exists() {
            let content = fs::read_to_string(&state_path)?;
            serde_json::from_str(&content)?
        } else {
            PersistedState::default()
        };

        let store = Self { state_path, state: Mutex::new(state) };
        store.save_state()?;
        Ok(store)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, PersistedState>> {
        self.state.lock().map_err(|_| StoreError::LockPoisoned)
    }

    fn flush(&self, state: &mut PersistedState) -> Result<()> {
        state.last_saved = Some(Utc::now());
        let json = serde_json::to_string_pretty(state)?;
        fs::write(&self.state_path, json)?;
        Ok(())
    }

    /// Explicitly flushes the in-memory state to disk.
    pub fn save_state(&self) -> Result<()> {
        let mut state = self.lock()?;
        self.flush(&mut state)
    }

    /// Replaces the current task. The previous current task, if any and
    /// not terminal, is pushed back to the front of the queue.
    pub fn set_current_task(&self, task: AgenticTask) -> Result<()> {
        let mut state = self.lock()?;
        state.seen_task_ids.insert(task.id.clone());
        if let Some(previous) = state.current_task.take() {
            if !previous.status.is_terminal() && previous.id != task.id {
                state.task_queue.push_front(previous);
            }
        }
        state.current_task = Some(task);
        self.flush(&mut state)
    }

    /// Returns a snapshot of the current task.
    pub fn current_task(&self) -> Result<Option<AgenticTask>> {
        Ok(self.lock()?.current_task.clone())
    }

    /// Appends a task to the back of the FIFO queue.
    pub fn add_task_to_queue(&self, task: AgenticTask) -> Result<()> {
        let mut state = self.lock()?;
        state.seen_task_ids.insert(task.id.clone());
        state.task_queue.push_back(task);
        self.flush(&mut state)
    }

    /// Pops the next queued task (FIFO).
    pub fn next_task(&self) -> Result<Option<AgenticTask>> {
        let mut state = self.lock()?;
        let task = state.task_queue.pop_front();
        if task.is_some() {
            self.flush(&mut state)?;
        }
        Ok(task)
    }

    /// Number of queued tasks.
    pub fn queue_len(&self) -> Result<usize> {
        Ok(self.lock()?.task_queue.len())
    }

    /// Removes and returns a specific queued task by id.
    pub fn take_queued(&self, task_id: &str) -> Result<Option<AgenticTask>> {
        let mut state = self.lock()?;
        let position = state.task_queue.iter().position(|t| t.id == task_id);
        let task = position.and_then(|i| state.task_queue.remove(i));
        if task.is_some() {
            self.flush(&mut state)?;
        }
        Ok(task)
    }

    /// Applies a full replacement of the stored copy of a task.
    ///
    /// The task must already be known as current or queued.
    pub fn update_task(&self, task: &AgenticTask) -> Result<()> {
        let mut state = self.lock()?;
        if state.current_task.as_ref().is_some_and(|t| t.id == task.id) {
            state.current_task = Some(task.clone());
        } else if let Some(slot) = state.task_queue.iter_mut().find(|t| t.id == task.id) {
            *slot = task.clone();
        } else {
            return Err(StoreError::UnknownTask(task.id.clone()));
        }
        self.flush(&mut state)
    }

    /// Transitions a stored task's status through the task state machine.
    pub fn update_task_status(&self, task_id: &str, status: TaskStatus) -> Result<()> {
        let mut state = self.lock()?;
        let task = Self::find_task_mut(&mut state, task_id)
            .ok_or_else(|| StoreError::UnknownTask(task_id.to_string()))?;
        task.transition(status)?;
        debug!(task_id, %status, "task status updated");
        self.flush(&mut state)
    }

    /// Replaces a stored task's progress counters.
    pub fn update_task_progress(&self, task_id: &str, progress: TaskProgress) -> Result<()> {
        let mut state = self.lock()?;
        let task = Self::find_task_mut(&mut state, task_id)
            .ok_or_else(|| StoreError::UnknownTask(task_id.to_string()))?;
        task.progress = progress;
        task.metadata.touch();
        self.flush(&mut state)
    }

    /// Appends an execution-history record for a task.
    ///
    /// History is append-only and ordered by recording time.
    pub fn record_execution_step(
        &self,
        task_id: &str,
        step_id: &str,
        status: StepStatus,
        duration_ms: u64,
        success: bool,
    ) -> Result<()> {
        let mut state = self.lock()?;
        state.seen_task_ids.insert(task_id.to_string());
        state.execution_history.entry(task_id.to_string()).or_default().push(StepRecord {
            step_id: step_id.to_string(),
            status,
            duration_ms,
            success,
            recorded_at: Utc::now(),
        });
        self.flush(&mut state)
    }

    /// Returns the ordered execution history for a task.
    pub fn execution_history(&self, task_id: &str) -> Result<Vec<StepRecord>> {
        Ok(self.lock()?.execution_history.get(task_id).cloned().unwrap_or_default())
    }

    /// Derives aggregate statistics from the stored state.
    ///
    /// Calling this twice with no intervening mutation returns identical
    /// values.
    pub fn task_statistics(&self) -> Result<TaskStatistics> {
        let state = self.lock()?;

        let mut completed = 0u64;
        let mut failed = 0u64;
        let tasks = state.current_task.iter().chain(state.task_queue.iter());
        for task in tasks {
            match task.status {
                TaskStatus::Completed => completed += 1,
                TaskStatus::Failed => failed += 1,
                _ => {}
            }
        }

        let records = state.execution_history.values().flatten();
        let mut total_steps = 0u64;
        let mut successful_steps = 0u64;
        let mut total_duration = 0u64;
        for record in records {
            total_steps += 1;
            if record.success {
                successful_steps += 1;
            }
            total_duration += record.duration_ms;
        }

        let success_rate = if total_steps == 0 { 0.0 } else { successful_steps as f64 / total_steps as f64 };
        let average_step_duration_ms =
            if total_steps == 0 { 0.0 } else { total_duration as f64 / total_steps as f64 };

        Ok(TaskStatistics {
            total_tasks: state.seen_task_ids.len() as u64,
            completed_tasks: completed,
            failed_tasks: failed,
            total_steps,
            successful_steps,
            success_rate,
            average_step_duration_ms,
        })
    }

    /// Returns the per-user preference map.
    pub fn user_preferences(&self) -> Result<HashMap<String, String>> {
        Ok(self.lock()?.user_preferences.clone())
    }

    /// Merges updates into the per-user preference map.
    pub fn update_user_preferences(&self, updates: HashMap<String, String>) -> Result<()> {
        let mut state = self.lock()?;
        state.user_preferences.extend(updates);
        self.flush(&mut state)
    }

    /// Appends a learning-ledger record.
    pub fn add_learning_data(&self, task_id: &str, data: LearningData) -> Result<()> {
        let mut state = self.lock()?;
        state.learning_data.push(LearningRecord {
            task_id: task_id.to_string(),
            data,
            recorded_at: Utc::now(),
        });
        self.flush(&mut state)
    }

    /// Returns the learning ledger.
    pub fn learning_data(&self) -> Result<Vec<LearningRecord>> {
        Ok(self.lock()?.learning_data.clone())
    }

    fn find_task_mut<'a>(state: &'a mut PersistedState, task_id: &str) -> Option<&'a mut AgenticTask> {
        if state.current_task.as_ref().is_some_and(|t| t.id == task_id) {
            return state.current_task.as_mut();
        }
        state.task_queue.iter_mut().find(|t| t.id == task_id)
    }

    /// Starts the autosave background task.
    ///
    /// The returned handle owns the timer; dropping it (or calling
    /// [`AutosaveHandle::stop`]) cancels autosaving. Flush failures are
    /// logged, never fatal, and never discard in-memory state.
    pub fn start_autosave(self: &Arc<Self>, interval: Duration) -> AutosaveHandle {
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        let store = Arc::clone(self);

        let join = tokio::spawn(async move {
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // Skip the immediate first tick.
            timer.tick().await;

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        match store.save_state() {
                            Ok(()) => debug!("autosave flushed state"),
                            Err(e) => warn!(error = %e, "autosave flush failed"),
                        }
                    }
                    _ = &mut cancel_rx => {
                        info!("autosave stopped");
                        break;
                    }
                }
            }
        });

        AutosaveHandle { cancel_tx: Some(cancel_tx), join: Some(join) }
    }
}

/// Cancellable handle for the autosave background task.
pub struct AutosaveHandle {
    cancel_tx: Option<oneshot::Sender<()>>,
    join: Option<tokio::task::JoinHandle<()>>,
}

impl AutosaveHandle {
    /// Stops the autosave task.
    pub fn stop(&mut self) {
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.send(());
        }
        if let Some(join) = self.join.take() {
            join.abort();
        }
    }
}

impl Drop for AutosaveHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
