//! Background execution tracking and session orchestration.
//!
//! Provides:
//! - `ExecutionRegistry` - Shared state of background jobs and their tasks
//! - `ExecutionTracker` - Fire-and-forget single executions
//! - `BatchCoordinator` - Sequential fail-fast runs over many units
//! - `SessionManager` - One agent client per owner key

pub mod batch;
pub mod manager;
pub mod registry;
pub mod tracker;

pub use batch::{BatchCoordinator, BatchUnit};
pub use manager::{AgentClient, ClientConnector, ClientError, SessionInfo, SessionManager};
pub use registry::{
    AsyncExecution, BatchProgress, ExecutionId, ExecutionRegistry, JobStatus, OwnerRefs,
    RegistryError, UnitResult,
};
pub use tracker::{ExecutionTracker, TrackerError};
