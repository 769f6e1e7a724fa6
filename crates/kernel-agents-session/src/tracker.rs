//! Fire-and-forget execution of single requests.

use std::{sync::Arc, time::Duration};

use kernel_agents_core::{DocumentError, ExecutionContext, ExecutionRequest};
use kernel_agents_executor::{ExecuteError, ExecutionClient};
use tracing::warn;

use crate::registry::{
    AsyncExecution, ExecutionId, ExecutionRegistry, OwnerRefs, RegistryError,
};

/// Tracker error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrackerError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Execute(#[from] ExecuteError),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error("Nothing to execute: the batch has no units")]
    EmptyBatch,
}

/// Runs execution requests in the background and reports on them by id.
#[derive(Clone)]
pub struct ExecutionTracker {
    ctx: ExecutionContext,
    client: ExecutionClient,
    registry: Arc<ExecutionRegistry>,
}

impl ExecutionTracker {
    #[must_use]
    pub const fn new(
        ctx: ExecutionContext,
        client: ExecutionClient,
        registry: Arc<ExecutionRegistry>,
    ) -> Self {
        Self {
            ctx,
            client,
            registry,
        }
    }

    #[must_use]
    pub const fn registry(&self) -> &Arc<ExecutionRegistry> {
        &self.registry
    }

    /// Start executing `request` and return its id without waiting.
    ///
    /// When the request is tied to a cell, the cell's outputs and execution
    /// count are written back once the kernel is done; a failed write turns
    /// the execution into an error.
    pub async fn start(&self, request: ExecutionRequest, timeout: Option<Duration>) -> ExecutionId {
        let id = ExecutionId::new();
        let owner = OwnerRefs {
            document_id: request.correlation.as_ref().map(|c| c.document_id.clone()),
            kernel: request.kernel.clone(),
        };
        let ctx = self.ctx.clone();
        let client = self.client.clone();
        let registry = Arc::clone(&self.registry);

        let work = async move {
            let result = match client.execute(&request.kernel, &request.code, timeout).await {
                Ok(result) => result,
                Err(e) => {
                    registry.fail(id, e.to_string()).await;
                    return;
                }
            };
            if let Some(cell) = &request.correlation {
                if let Err(e) = ctx.record_result(cell, &result).await {
                    warn!(execution_id = %id, cell = cell.cell_index, error = %e, "Failed to write cell outputs");
                    registry
                        .update(id, |state| {
                            state.seq = result.seq;
                            state.outputs = result.outputs;
                        })
                        .await;
                    registry
                        .fail(id, format!("failed to write outputs to cell: {e}"))
                        .await;
                    return;
                }
            }
            registry.finish(id, result).await;
        };

        self.registry
            .launch(AsyncExecution::running(id, owner), work)
            .await
    }

    /// Snapshot of an execution.
    ///
    /// # Errors
    /// `UnknownExecutionId` if the id is not registered.
    pub async fn status(&self, id: ExecutionId) -> Result<AsyncExecution, TrackerError> {
        Ok(self.registry.snapshot(id).await?)
    }
}
