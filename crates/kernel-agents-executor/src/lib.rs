//! Kernel execution client.
//!
//! Provides:
//! - `ExecutionClient` - submit code, collect outputs, enforce a deadline
//! - Message classification for the kernel's reply and event channels

pub mod client;
pub mod messages;

pub use client::{ExecuteError, ExecutionClient};
pub use messages::{Reply, ReplyStatus, Routed, classify_event, parse_reply};
