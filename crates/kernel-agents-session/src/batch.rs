//! Sequential, fail-fast execution of an ordered set of code units.

use std::{sync::Arc, time::Duration};

use kernel_agents_core::{CellRef, ExecutionContext, ExecutionResult, KernelHandle};
use kernel_agents_executor::ExecutionClient;
use tracing::{debug, info, warn};

use crate::{
    registry::{AsyncExecution, ExecutionId, ExecutionRegistry, OwnerRefs, UnitResult},
    tracker::TrackerError,
};

/// One piece of code in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchUnit {
    pub code: String,
    /// Cell the unit came from; its outputs are written back there.
    pub cell: Option<CellRef>,
}

impl BatchUnit {
    #[must_use]
    pub fn code(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            cell: None,
        }
    }

    #[must_use]
    pub fn cell(cell: CellRef, code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            cell: Some(cell),
        }
    }

    fn is_blank(&self) -> bool {
        self.code.trim().is_empty()
    }
}

/// Drives a kernel through a list of units in order, stopping at the first failure.
#[derive(Clone)]
pub struct BatchCoordinator {
    ctx: ExecutionContext,
    client: ExecutionClient,
    registry: Arc<ExecutionRegistry>,
    restart_settle: Duration,
}

impl BatchCoordinator {
    #[must_use]
    pub const fn new(
        ctx: ExecutionContext,
        client: ExecutionClient,
        registry: Arc<ExecutionRegistry>,
        restart_settle: Duration,
    ) -> Self {
        Self {
            ctx,
            client,
            registry,
            restart_settle,
        }
    }

    /// Start running `units` in the background.
    ///
    /// Units have no individual timeout. Blank units are skipped but still
    /// count towards `completed_units`.
    ///
    /// # Errors
    /// `EmptyBatch` for an empty list; `KernelNotFound`/`KernelBusy` if the
    /// kernel cannot accept work right now.
    pub async fn start_batch(
        &self,
        kernel: &KernelHandle,
        units: Vec<BatchUnit>,
        restart_first: bool,
    ) -> Result<ExecutionId, TrackerError> {
        self.start(kernel, None, units, restart_first).await
    }

    /// Start running every code cell of a document, top to bottom.
    ///
    /// # Errors
    /// As [`start_batch`](Self::start_batch), plus document lookup failures.
    pub async fn start_document(
        &self,
        document_id: &str,
        kernel: &KernelHandle,
        restart_first: bool,
    ) -> Result<ExecutionId, TrackerError> {
        let units = self
            .ctx
            .code_cells(document_id)
            .await?
            .into_iter()
            .map(|(index, source)| BatchUnit::cell(CellRef::new(document_id, index), source))
            .collect();
        self.start(kernel, Some(document_id.to_string()), units, restart_first)
            .await
    }

    async fn start(
        &self,
        kernel: &KernelHandle,
        document_id: Option<String>,
        units: Vec<BatchUnit>,
        restart_first: bool,
    ) -> Result<ExecutionId, TrackerError> {
        if units.is_empty() {
            return Err(TrackerError::EmptyBatch);
        }
        self.client.check_admission(kernel).await?;

        let id = ExecutionId::new();
        let state = AsyncExecution::running(
            id,
            OwnerRefs {
                document_id,
                kernel: kernel.clone(),
            },
        )
        .with_batch(units.len());
        let run = BatchRun {
            id,
            kernel: kernel.clone(),
            units,
            restart_first,
            ctx: self.ctx.clone(),
            client: self.client.clone(),
            registry: Arc::clone(&self.registry),
            restart_settle: self.restart_settle,
        };
        Ok(self.registry.launch(state, run.drive()).await)
    }
}

struct BatchRun {
    id: ExecutionId,
    kernel: KernelHandle,
    units: Vec<BatchUnit>,
    restart_first: bool,
    ctx: ExecutionContext,
    client: ExecutionClient,
    registry: Arc<ExecutionRegistry>,
    restart_settle: Duration,
}

impl BatchRun {
    async fn drive(self) {
        let id = self.id;
        if self.restart_first {
            info!(execution_id = %id, kernel = %self.kernel, "Restarting kernel before batch");
            if let Err(e) = self.ctx.kernels.restart(&self.kernel).await {
                self.registry
                    .fail(id, format!("failed to restart kernel: {e}"))
                    .await;
                return;
            }
            tokio::time::sleep(self.restart_settle).await;
        }

        for (position, unit) in self.units.iter().enumerate() {
            let cell_index = unit.cell.as_ref().map(|c| c.cell_index);
            self.registry
                .update(id, |state| {
                    if let Some(batch) = state.batch.as_mut() {
                        batch.current_unit_index = Some(position);
                        batch.current_cell_index = cell_index;
                    }
                })
                .await;

            if unit.is_blank() {
                debug!(execution_id = %id, position, "Skipping blank unit");
                self.mark_done(position, None).await;
                continue;
            }

            let result = match self.client.execute(&self.kernel, &unit.code, None).await {
                Ok(result) => result,
                Err(e) => {
                    self.fail_at(position, e.to_string()).await;
                    return;
                }
            };
            if let Some(cell) = &unit.cell {
                if let Err(e) = self.ctx.record_result(cell, &result).await {
                    warn!(execution_id = %id, cell = cell.cell_index, error = %e, "Failed to write cell outputs");
                    self.mark_done(position, Some(result)).await;
                    self.fail_at(position, format!("failed to write outputs to cell: {e}"))
                        .await;
                    return;
                }
            }

            let failure = result.failure_reason();
            self.mark_done(position, Some(result)).await;
            if let Some(reason) = failure {
                self.fail_at(position, reason).await;
                return;
            }
        }

        self.registry
            .update(id, |state| {
                if let Some(batch) = state.batch.as_mut() {
                    batch.current_unit_index = None;
                    batch.current_cell_index = None;
                }
            })
            .await;
        self.registry.complete(id).await;
    }

    async fn mark_done(&self, position: usize, result: Option<ExecutionResult>) {
        let cell_index = self.units[position].cell.as_ref().map(|c| c.cell_index);
        self.registry
            .update(self.id, |state| {
                if let Some(batch) = state.batch.as_mut() {
                    batch.completed_units += 1;
                    if let Some(result) = result {
                        batch.per_unit_results.push(UnitResult {
                            position,
                            cell_index,
                            result,
                        });
                    }
                }
            })
            .await;
    }

    async fn fail_at(&self, position: usize, reason: String) {
        let cell_index = self.units[position].cell.as_ref().map(|c| c.cell_index);
        self.registry
            .update(self.id, |state| {
                if let Some(batch) = state.batch.as_mut() {
                    batch.failed_unit_index = Some(position);
                    batch.failed_cell_index = cell_index;
                }
            })
            .await;
        self.registry.fail(self.id, reason).await;
    }
}
