//! Core abstractions for agent-driven kernel execution.
//!
//! This crate provides the fundamental building blocks:
//! - `OutputEvent` / `ExecutionResult` - What one execution produced
//! - `KernelTransport` / `DocumentStore` - The collaborators execution talks to
//! - `ExecutionContext` - Both collaborators, named explicitly
//! - `EngineConfig` - Timeouts and intervals for every component

pub mod config;
pub mod context;
#[cfg(feature = "memory")]
pub mod memory;
pub mod output;
pub mod telemetry;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod traits;

pub use config::EngineConfig;
pub use context::ExecutionContext;
#[cfg(feature = "memory")]
pub use memory::MemoryDocuments;
pub use output::{
    CellRef, ExecutionHandle, ExecutionRequest, ExecutionResult, ExecutionStatus, KernelHandle,
    MimeBundle, MimeValue, OutputEvent, StreamName,
};
pub use traits::{
    Cell, CellType, Channel, DocumentError, DocumentStore, KernelInfo, KernelMessage, KernelState,
    KernelTransport, MessageKind, SubmitRequest, TransportError,
};
