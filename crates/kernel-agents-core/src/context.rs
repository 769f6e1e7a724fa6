//! Execution context shared by every kernel-facing operation.

use std::{fmt, sync::Arc};

use crate::{
    output::{CellRef, ExecutionResult},
    traits::{CellType, DocumentError, DocumentStore, KernelTransport},
};

/// The collaborators an operation may use, named explicitly.
///
/// Cheap to clone; both capabilities are shared.
#[derive(Clone)]
pub struct ExecutionContext {
    /// Submit/poll/control access to kernels.
    pub kernels: Arc<dyn KernelTransport>,
    /// Cell source and output access.
    pub documents: Arc<dyn DocumentStore>,
}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext").finish_non_exhaustive()
    }
}

impl ExecutionContext {
    #[must_use]
    pub fn new(kernels: Arc<dyn KernelTransport>, documents: Arc<dyn DocumentStore>) -> Self {
        Self { kernels, documents }
    }

    /// Read the source of a non-empty code cell.
    ///
    /// # Errors
    /// `IndexOutOfRange`, `CellTypeMismatch` or `EmptyCell` for a bad reference.
    pub async fn code_cell_source(&self, cell: &CellRef) -> Result<String, DocumentError> {
        let len = self.documents.cell_count(&cell.document_id).await?;
        if cell.cell_index >= len {
            return Err(DocumentError::IndexOutOfRange {
                index: cell.cell_index,
                len,
            });
        }
        let found = self
            .documents
            .get_cell(&cell.document_id, cell.cell_index)
            .await?;
        if found.cell_type != CellType::Code {
            return Err(DocumentError::CellTypeMismatch {
                index: cell.cell_index,
                found: found.cell_type,
            });
        }
        if found.source.trim().is_empty() {
            return Err(DocumentError::EmptyCell(cell.cell_index));
        }
        Ok(found.source)
    }

    /// All code cells of a document in order, as `(index, source)`.
    ///
    /// Cells whose source is blank are included; callers decide whether to skip them.
    ///
    /// # Errors
    /// Returns error if the document cannot be read.
    pub async fn code_cells(&self, document_id: &str) -> Result<Vec<(usize, String)>, DocumentError> {
        let len = self.documents.cell_count(document_id).await?;
        let mut cells = Vec::new();
        for index in 0..len {
            let cell = self.documents.get_cell(document_id, index).await?;
            if cell.cell_type == CellType::Code {
                cells.push((index, cell.source));
            }
        }
        Ok(cells)
    }

    /// Write an execution result into its cell.
    ///
    /// The execution count always comes from the kernel's reply; a result
    /// without one (a timeout) only updates the outputs.
    ///
    /// # Errors
    /// Returns error if the document store rejects either write.
    pub async fn record_result(
        &self,
        cell: &CellRef,
        result: &ExecutionResult,
    ) -> Result<(), DocumentError> {
        if let Some(seq) = result.seq {
            self.documents
                .set_cell_exec_count(&cell.document_id, cell.cell_index, seq)
                .await?;
        }
        self.documents
            .set_cell_outputs(&cell.document_id, cell.cell_index, &result.outputs)
            .await?;
        tracing::debug!(
            document_id = %cell.document_id,
            cell_index = cell.cell_index,
            outputs = result.outputs.len(),
            "Recorded execution result"
        );
        Ok(())
    }
}
