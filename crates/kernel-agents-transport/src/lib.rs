//! Delegation and tool-call surface for kernel agents.
//!
//! Provides:
//! - Wire protocol for the delegation peer (tagged JSON)
//! - `DelegationBroker` - Correlate peer requests with their responses
//! - `ToolRouter` - Uniform `{success, ...}` envelopes for every tool

pub mod delegation;
pub mod protocol;
pub mod tools;

pub use delegation::{DelegationBroker, DelegationError, DelegationPeer};
pub use protocol::{DELEGATED_TOOLS, PeerMessage, is_delegated};
pub use tools::{LOCAL_TOOLS, ToolError, ToolRouter};
