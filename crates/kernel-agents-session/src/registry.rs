//! Registry of background executions.

use std::{collections::HashMap, fmt, future::Future, str::FromStr, sync::Arc};

use kernel_agents_core::{ExecutionResult, KernelHandle, OutputEvent};
use serde::{Deserialize, Serialize};
use tokio::{
    sync::{Mutex, RwLock},
    task::{AbortHandle, JoinSet},
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Reason recorded when a job is aborted by the caller or by shutdown.
pub const CANCELLED: &str = "execution cancelled";

/// Identifier of a background execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionId(Uuid);

impl ExecutionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ExecutionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ExecutionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for ExecutionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Lifecycle of a background execution. `Completed` and `Error` are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Running,
    Completed,
    Error,
}

impl JobStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }
}

/// What a job runs against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerRefs {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    pub kernel: KernelHandle,
}

/// Result of one unit of a batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitResult {
    /// Position of the unit in the batch.
    pub position: usize,
    /// Cell index, when the unit came from a document.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cell_index: Option<usize>,
    pub result: ExecutionResult,
}

/// Progress of a batch run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchProgress {
    pub total_units: usize,
    pub completed_units: usize,
    pub current_unit_index: Option<usize>,
    pub failed_unit_index: Option<usize>,
    /// Document cell of the current unit, for runs over a document.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_cell_index: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_cell_index: Option<usize>,
    pub per_unit_results: Vec<UnitResult>,
}

impl BatchProgress {
    #[must_use]
    pub fn new(total_units: usize) -> Self {
        Self {
            total_units,
            ..Self::default()
        }
    }

    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn progress_percent(&self) -> f64 {
        if self.total_units == 0 {
            return 100.0;
        }
        (self.completed_units as f64 / self.total_units as f64 * 1000.0).round() / 10.0
    }
}

/// Snapshot of a background execution.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AsyncExecution {
    pub id: ExecutionId,
    pub status: JobStatus,
    pub outputs: Vec<OutputEvent>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub owner: OwnerRefs,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch: Option<BatchProgress>,
}

impl AsyncExecution {
    #[must_use]
    pub const fn running(id: ExecutionId, owner: OwnerRefs) -> Self {
        Self {
            id,
            status: JobStatus::Running,
            outputs: Vec::new(),
            seq: None,
            error: None,
            owner,
            batch: None,
        }
    }

    #[must_use]
    pub fn with_batch(mut self, total_units: usize) -> Self {
        self.batch = Some(BatchProgress::new(total_units));
        self
    }
}

/// Registry error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Unknown execution id: {0}")]
    UnknownExecutionId(ExecutionId),
    #[error("Execution {0} has already finished")]
    AlreadyFinished(ExecutionId),
}

struct Entry {
    state: AsyncExecution,
    task: Option<AbortHandle>,
}

/// Shared registry of background executions and the tasks driving them.
///
/// Entries stay until [`forget`](Self::forget) is called; nothing expires on
/// its own. Only the task that owns an entry moves it out of `Running`.
#[derive(Default)]
pub struct ExecutionRegistry {
    entries: RwLock<HashMap<ExecutionId, Entry>>,
    tasks: Mutex<JoinSet<()>>,
}

impl ExecutionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new job in `Running` and drive it with `work`.
    ///
    /// `work` runs in its own task under a supervisor; a panic or abort is
    /// recorded as an `Error` on the entry rather than lost.
    pub async fn launch<F>(self: &Arc<Self>, state: AsyncExecution, work: F) -> ExecutionId
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let id = state.id;
        self.entries
            .write()
            .await
            .insert(id, Entry { state, task: None });

        let worker = tokio::spawn(work);
        if let Some(entry) = self.entries.write().await.get_mut(&id) {
            entry.task = Some(worker.abort_handle());
        }

        let registry = Arc::clone(self);
        let mut tasks = self.tasks.lock().await;
        while tasks.try_join_next().is_some() {}
        tasks.spawn(async move {
            if let Err(err) = worker.await {
                let reason = if err.is_cancelled() {
                    CANCELLED.to_string()
                } else {
                    error!(execution_id = %id, "Execution task panicked: {err}");
                    format!("execution task panicked: {err}")
                };
                registry.fail(id, reason).await;
            }
            if let Some(entry) = registry.entries.write().await.get_mut(&id) {
                entry.task = None;
            }
        });
        info!(execution_id = %id, "Started background execution");
        id
    }

    /// Current state of a job.
    ///
    /// # Errors
    /// `UnknownExecutionId` if the id was never registered or has been forgotten.
    pub async fn snapshot(&self, id: ExecutionId) -> Result<AsyncExecution, RegistryError> {
        self.entries
            .read()
            .await
            .get(&id)
            .map(|e| e.state.clone())
            .ok_or(RegistryError::UnknownExecutionId(id))
    }

    /// Ids of all known jobs.
    pub async fn list(&self) -> Vec<ExecutionId> {
        let mut ids: Vec<_> = self.entries.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Mutate a running job. Returns `false` if the job is unknown or already terminal.
    pub async fn update(&self, id: ExecutionId, f: impl FnOnce(&mut AsyncExecution)) -> bool {
        let mut entries = self.entries.write().await;
        match entries.get_mut(&id) {
            Some(entry) if !entry.state.status.is_terminal() => {
                f(&mut entry.state);
                true
            }
            Some(_) => {
                debug!(execution_id = %id, "Ignoring update to finished execution");
                false
            }
            None => false,
        }
    }

    /// Record the single-execution outcome. `Ok` completes the job; anything else fails it.
    pub async fn finish(&self, id: ExecutionId, result: ExecutionResult) {
        let reason = result.failure_reason();
        let finished = self
            .update(id, move |state| {
                state.seq = result.seq;
                state.outputs = result.outputs;
                state.status = if reason.is_some() {
                    JobStatus::Error
                } else {
                    JobStatus::Completed
                };
                state.error = reason;
            })
            .await;
        if finished {
            info!(execution_id = %id, "Background execution finished");
        }
    }

    /// Mark a running job as completed without touching its outputs.
    pub async fn complete(&self, id: ExecutionId) {
        if self
            .update(id, |state| state.status = JobStatus::Completed)
            .await
        {
            info!(execution_id = %id, "Background execution completed");
        }
    }

    /// Fail a running job, keeping whatever progress it recorded.
    pub async fn fail(&self, id: ExecutionId, reason: impl Into<String>) {
        let reason = reason.into();
        let logged = reason.clone();
        if self
            .update(id, move |state| {
                state.status = JobStatus::Error;
                state.error = Some(reason);
            })
            .await
        {
            warn!(execution_id = %id, reason = %logged, "Background execution failed");
        }
    }

    /// Abort a running job's task. Its entry ends in `Error` with progress intact.
    ///
    /// # Errors
    /// `UnknownExecutionId` for an unknown id, `AlreadyFinished` for a terminal job.
    pub async fn cancel(&self, id: ExecutionId) -> Result<(), RegistryError> {
        let task = {
            let mut entries = self.entries.write().await;
            let entry = entries
                .get_mut(&id)
                .ok_or(RegistryError::UnknownExecutionId(id))?;
            if entry.state.status.is_terminal() {
                return Err(RegistryError::AlreadyFinished(id));
            }
            entry.state.status = JobStatus::Error;
            entry.state.error = Some(CANCELLED.to_string());
            entry.task.take()
        };
        if let Some(task) = task {
            task.abort();
        }
        info!(execution_id = %id, "Cancelled background execution");
        Ok(())
    }

    /// Drop a job's entry. A job that is still running is aborted first.
    ///
    /// # Errors
    /// `UnknownExecutionId` if there is no such entry.
    pub async fn forget(&self, id: ExecutionId) -> Result<AsyncExecution, RegistryError> {
        let entry = self
            .entries
            .write()
            .await
            .remove(&id)
            .ok_or(RegistryError::UnknownExecutionId(id))?;
        if let Some(task) = entry.task {
            task.abort();
        }
        debug!(execution_id = %id, "Forgot execution");
        Ok(entry.state)
    }

    /// Abort every running job and wait for the supervisors to record it.
    pub async fn shutdown(&self) {
        let running: Vec<_> = self
            .entries
            .read()
            .await
            .values()
            .filter_map(|e| e.task.clone())
            .collect();
        for task in &running {
            task.abort();
        }
        let mut tasks = std::mem::take(&mut *self.tasks.lock().await);
        while tasks.join_next().await.is_some() {}
        info!(aborted = running.len(), "Execution registry shut down");
    }
}
