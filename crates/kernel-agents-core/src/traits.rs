//! Collaborator traits: the kernel transport and the document store.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::output::{ExecutionHandle, KernelHandle, OutputEvent};

/// Logical channel of a kernel connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Replies to submitted requests.
    Reply,
    /// Broadcast events (outputs, status changes).
    Events,
}

/// Kind of a message received from a kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Stream,
    ExecuteResult,
    DisplayData,
    Error,
    Status,
    Reply,
    #[serde(other)]
    Other,
}

/// A message read from one of the kernel channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KernelMessage {
    /// Request id of the message this one answers, if any.
    pub parent_id: Option<String>,
    pub kind: MessageKind,
    #[serde(default)]
    pub content: Value,
}

impl KernelMessage {
    #[must_use]
    pub fn new(parent_id: impl Into<String>, kind: MessageKind, content: Value) -> Self {
        Self {
            parent_id: Some(parent_id.into()),
            kind,
            content,
        }
    }

    /// Whether this message belongs to the request identified by `handle`.
    #[must_use]
    pub fn answers(&self, handle: &ExecutionHandle) -> bool {
        self.parent_id.as_deref() == Some(handle.as_str())
    }
}

/// Code submission sent on the request channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// Unique id generated by the caller for this submission.
    pub request_id: String,
    pub code: String,
    pub silent: bool,
    pub store_history: bool,
    pub allow_stdin: bool,
    pub stop_on_error: bool,
}

impl SubmitRequest {
    /// A visible, history-recording execution with stdin disabled.
    #[must_use]
    pub fn execute(request_id: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            code: code.into(),
            silent: false,
            store_history: true,
            allow_stdin: false,
            stop_on_error: false,
        }
    }
}

/// Execution state reported by a kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KernelState {
    Starting,
    Idle,
    Busy,
    Restarting,
    Dead,
    #[serde(other)]
    Unknown,
}

/// Kernel metadata as listed by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelInfo {
    pub id: KernelHandle,
    pub name: String,
    pub execution_state: KernelState,
    #[serde(default)]
    pub last_activity: Option<String>,
    #[serde(default)]
    pub connections: u32,
}

/// Transport error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Kernel '{0}' not found")]
    KernelNotFound(KernelHandle),
    #[error("Kernel '{0}' channel closed")]
    ChannelClosed(KernelHandle),
    #[error("Malformed kernel message: {0}")]
    Malformed(String),
    #[error("Transport error: {0}")]
    Other(String),
}

/// Access to running kernels.
///
/// `poll` must be cancel-safe: a poll future dropped before completion must
/// not lose a message. Callers race the two channels against each other.
#[async_trait]
pub trait KernelTransport: Send + Sync {
    /// Submit code for execution. Returns the handle correlating its messages.
    async fn submit(
        &self,
        kernel: &KernelHandle,
        request: SubmitRequest,
    ) -> Result<ExecutionHandle, TransportError>;

    /// Wait up to `wait` for the next message on `channel`.
    async fn poll(
        &self,
        kernel: &KernelHandle,
        channel: Channel,
        wait: Duration,
    ) -> Result<Option<KernelMessage>, TransportError>;

    /// Describe one kernel. `None` when the handle is unknown.
    async fn kernel_info(&self, kernel: &KernelHandle) -> Result<Option<KernelInfo>, TransportError>;

    /// All kernels known to the transport.
    async fn list_kernels(&self) -> Result<Vec<KernelInfo>, TransportError>;

    /// Ask the kernel to abort the running execution.
    async fn interrupt(&self, kernel: &KernelHandle) -> Result<(), TransportError>;

    /// Restart the kernel, discarding its state.
    async fn restart(&self, kernel: &KernelHandle) -> Result<(), TransportError>;
}

/// Notebook cell type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CellType {
    Code,
    Markdown,
    Raw,
}

impl std::fmt::Display for CellType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Code => "code",
            Self::Markdown => "markdown",
            Self::Raw => "raw",
        })
    }
}

/// Cell contents read from the document store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub cell_type: CellType,
    pub source: String,
}

/// Document store error.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DocumentError {
    #[error("Document not found: {0}")]
    NotFound(String),
    #[error("Cell index {index} out of range. Notebook has {len} cells.")]
    IndexOutOfRange { index: usize, len: usize },
    #[error("Cell {index} is not a code cell (type: {found})")]
    CellTypeMismatch { index: usize, found: CellType },
    #[error("Cell {0} is empty")]
    EmptyCell(usize),
    #[error("Document store error: {0}")]
    Internal(String),
}

/// The collaborative notebook model, reduced to what execution needs.
///
/// Each call is atomic from the caller's perspective.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Number of cells in the document.
    async fn cell_count(&self, document_id: &str) -> Result<usize, DocumentError>;

    /// Read one cell.
    async fn get_cell(&self, document_id: &str, index: usize) -> Result<Cell, DocumentError>;

    /// Replace the outputs of one cell.
    async fn set_cell_outputs(
        &self,
        document_id: &str,
        index: usize,
        outputs: &[OutputEvent],
    ) -> Result<(), DocumentError>;

    /// Set the execution count shown next to one cell.
    async fn set_cell_exec_count(
        &self,
        document_id: &str,
        index: usize,
        seq: u64,
    ) -> Result<(), DocumentError>;
}
