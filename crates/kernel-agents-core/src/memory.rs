//! In-memory document store.

use std::{collections::HashMap, sync::RwLock};

use async_trait::async_trait;

use crate::{
    output::OutputEvent,
    traits::{Cell, CellType, DocumentError, DocumentStore},
};

#[derive(Debug, Clone)]
struct StoredCell {
    cell: Cell,
    outputs: Vec<OutputEvent>,
    exec_count: Option<u64>,
}

/// In-memory notebook storage.
///
/// Useful for development and single-process deployments.
/// Data is lost on restart.
#[derive(Debug, Default)]
pub struct MemoryDocuments {
    documents: RwLock<HashMap<String, Vec<StoredCell>>>,
}

impl MemoryDocuments {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace a document with the given cells.
    pub fn insert_document<I>(&self, document_id: impl Into<String>, cells: I)
    where
        I: IntoIterator<Item = (CellType, String)>,
    {
        let cells = cells
            .into_iter()
            .map(|(cell_type, source)| StoredCell {
                cell: Cell { cell_type, source },
                outputs: Vec::new(),
                exec_count: None,
            })
            .collect();
        if let Ok(mut documents) = self.documents.write() {
            documents.insert(document_id.into(), cells);
        }
    }

    /// Outputs currently stored for a cell.
    #[must_use]
    pub fn outputs(&self, document_id: &str, index: usize) -> Option<Vec<OutputEvent>> {
        self.documents
            .read()
            .ok()?
            .get(document_id)?
            .get(index)
            .map(|c| c.outputs.clone())
    }

    /// Execution count currently stored for a cell.
    #[must_use]
    pub fn exec_count(&self, document_id: &str, index: usize) -> Option<u64> {
        self.documents
            .read()
            .ok()?
            .get(document_id)?
            .get(index)?
            .exec_count
    }

    fn with_cell<T>(
        &self,
        document_id: &str,
        index: usize,
        f: impl FnOnce(&mut StoredCell) -> T,
    ) -> Result<T, DocumentError> {
        let mut documents = self
            .documents
            .write()
            .map_err(|e| DocumentError::Internal(e.to_string()))?;
        let cells = documents
            .get_mut(document_id)
            .ok_or_else(|| DocumentError::NotFound(document_id.to_string()))?;
        let len = cells.len();
        let cell = cells
            .get_mut(index)
            .ok_or(DocumentError::IndexOutOfRange { index, len })?;
        Ok(f(cell))
    }
}

#[async_trait]
impl DocumentStore for MemoryDocuments {
    async fn cell_count(&self, document_id: &str) -> Result<usize, DocumentError> {
        self.documents
            .read()
            .map_err(|e| DocumentError::Internal(e.to_string()))?
            .get(document_id)
            .map(Vec::len)
            .ok_or_else(|| DocumentError::NotFound(document_id.to_string()))
    }

    async fn get_cell(&self, document_id: &str, index: usize) -> Result<Cell, DocumentError> {
        self.with_cell(document_id, index, |c| c.cell.clone())
    }

    async fn set_cell_outputs(
        &self,
        document_id: &str,
        index: usize,
        outputs: &[OutputEvent],
    ) -> Result<(), DocumentError> {
        self.with_cell(document_id, index, |c| c.outputs = outputs.to_vec())
    }

    async fn set_cell_exec_count(
        &self,
        document_id: &str,
        index: usize,
        seq: u64,
    ) -> Result<(), DocumentError> {
        self.with_cell(document_id, index, |c| c.exec_count = Some(seq))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        context::ExecutionContext,
        output::{CellRef, ExecutionResult, ExecutionStatus},
        testing::ScriptedKernel,
    };

    fn context(docs: Arc<MemoryDocuments>) -> ExecutionContext {
        ExecutionContext::new(Arc::new(ScriptedKernel::new()), docs)
    }

    fn notebook() -> Arc<MemoryDocuments> {
        let docs = Arc::new(MemoryDocuments::new());
        docs.insert_document(
            "nb",
            [
                (CellType::Markdown, "# Title".to_string()),
                (CellType::Code, "print(\"a\")".to_string()),
                (CellType::Code, "   ".to_string()),
            ],
        );
        docs
    }

    #[tokio::test]
    async fn code_cell_source_validates_reference() {
        let ctx = context(notebook());

        assert_eq!(
            ctx.code_cell_source(&CellRef::new("nb", 1)).await.unwrap(),
            "print(\"a\")"
        );
        assert_eq!(
            ctx.code_cell_source(&CellRef::new("nb", 0)).await,
            Err(DocumentError::CellTypeMismatch {
                index: 0,
                found: CellType::Markdown
            })
        );
        assert_eq!(
            ctx.code_cell_source(&CellRef::new("nb", 2)).await,
            Err(DocumentError::EmptyCell(2))
        );
        assert_eq!(
            ctx.code_cell_source(&CellRef::new("nb", 9)).await,
            Err(DocumentError::IndexOutOfRange { index: 9, len: 3 })
        );
        assert!(matches!(
            ctx.code_cell_source(&CellRef::new("missing", 0)).await,
            Err(DocumentError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn code_cells_lists_only_code() {
        let ctx = context(notebook());
        let cells = ctx.code_cells("nb").await.unwrap();
        assert_eq!(cells.len(), 2);
        assert_eq!(cells[0].0, 1);
        assert_eq!(cells[1].0, 2);
    }

    #[tokio::test]
    async fn record_result_writes_outputs_and_count() {
        let docs = notebook();
        let ctx = context(Arc::clone(&docs));
        let result = ExecutionResult {
            outputs: vec![OutputEvent::stdout("a\n")],
            seq: Some(7),
            status: ExecutionStatus::Ok,
        };

        tokio_test::assert_ok!(ctx.record_result(&CellRef::new("nb", 1), &result).await);

        assert_eq!(docs.exec_count("nb", 1), Some(7));
        assert_eq!(docs.outputs("nb", 1).unwrap(), result.outputs);
    }
}
