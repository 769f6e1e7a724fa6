//! Request/response correlation with a remote peer.

use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use kernel_agents_core::config::DelegationConfig;
use serde_json::Value;
use tokio::{
    sync::{Mutex, RwLock, oneshot},
    time::Instant,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::PeerMessage;

/// Delegation error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DelegationError {
    #[error("No peer is connected to handle '{0}'")]
    NoActivePeer(String),
    #[error("Peer did not answer '{name}' within {}s", .timeout.as_secs_f64())]
    DelegationTimeout { name: String, timeout: Duration },
    #[error("Peer disconnected before answering")]
    PeerDetached,
    #[error("Failed to send request to peer: {0}")]
    Send(String),
}

/// Outbound half of the channel to a peer.
#[async_trait]
pub trait DelegationPeer: Send + Sync {
    /// Transmit one message. Delivery of the answer happens separately.
    async fn send(&self, message: PeerMessage) -> Result<(), DelegationError>;
}

struct PendingDelegation {
    name: String,
    reply: oneshot::Sender<Result<Value, DelegationError>>,
}

/// Correlates requests sent to the peer with the responses it sends back.
///
/// At most one peer is attached at a time. Each pending request is resolved
/// exactly once: by a matching response, by its timeout, or by the peer
/// detaching.
pub struct DelegationBroker {
    peer: RwLock<Option<Arc<dyn DelegationPeer>>>,
    pending: Mutex<HashMap<Uuid, PendingDelegation>>,
    default_timeout: Duration,
}

impl DelegationBroker {
    #[must_use]
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            peer: RwLock::new(None),
            pending: Mutex::new(HashMap::new()),
            default_timeout,
        }
    }

    #[must_use]
    pub fn from_config(config: &DelegationConfig) -> Self {
        Self::new(config.timeout())
    }

    /// Use `peer` for all further requests, replacing any previous one.
    pub async fn attach_peer(&self, peer: Arc<dyn DelegationPeer>) {
        if self.peer.write().await.replace(peer).is_some() {
            info!("Replaced delegation peer");
        } else {
            info!("Delegation peer attached");
        }
    }

    /// Drop the peer and fail every request still waiting on it.
    pub async fn detach_peer(&self) {
        self.peer.write().await.take();
        let drained: Vec<_> = self.pending.lock().await.drain().collect();
        for (id, pending) in drained {
            debug!(request_id = %id, tool = %pending.name, "Failing pending delegation");
            let _ = pending.reply.send(Err(DelegationError::PeerDetached));
        }
        info!("Delegation peer detached");
    }

    pub async fn has_peer(&self) -> bool {
        self.peer.read().await.is_some()
    }

    /// Requests still waiting for an answer.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Ask the peer to run tool `name` and wait for its result.
    ///
    /// # Errors
    /// `NoActivePeer` immediately if no peer is attached, `DelegationTimeout`
    /// if no answer arrives within `timeout` (or the broker default), and
    /// `PeerDetached` if the peer goes away first.
    pub async fn send(
        &self,
        name: &str,
        args: Value,
        timeout: Option<Duration>,
    ) -> Result<Value, DelegationError> {
        let peer = self
            .peer
            .read()
            .await
            .clone()
            .ok_or_else(|| DelegationError::NoActivePeer(name.to_string()))?;
        let timeout = timeout.unwrap_or(self.default_timeout);
        let deadline = Instant::now() + timeout;

        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(
            id,
            PendingDelegation {
                name: name.to_string(),
                reply: tx,
            },
        );

        let request = PeerMessage::ToolRequest {
            id,
            name: name.to_string(),
            args,
        };
        if let Err(e) = peer.send(request).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }
        debug!(request_id = %id, tool = %name, "Sent delegation request");

        // The deadline covers the send as well as the wait.
        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DelegationError::PeerDetached),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                warn!(request_id = %id, tool = %name, "Delegation timed out");
                Err(DelegationError::DelegationTimeout {
                    name: name.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Resolve request `id` with `result`. Returns `false` for an unknown,
    /// already-resolved or timed-out id, which is otherwise ignored.
    pub async fn deliver(&self, id: Uuid, result: Value) -> bool {
        let Some(pending) = self.pending.lock().await.remove(&id) else {
            warn!(request_id = %id, "Dropping response for unknown or resolved request");
            return false;
        };
        if pending.reply.send(Ok(result)).is_err() {
            warn!(request_id = %id, tool = %pending.name, "Dropping response that arrived after its deadline");
            return false;
        }
        debug!(request_id = %id, tool = %pending.name, "Delivered delegation response");
        true
    }

    /// Route a frame from the peer's receive path.
    pub async fn handle_incoming(&self, message: PeerMessage) -> bool {
        match message {
            PeerMessage::ToolResponse { id, result } => self.deliver(id, result).await,
            PeerMessage::ToolRequest { id, name, .. } => {
                warn!(request_id = %id, tool = %name, "Ignoring tool request from peer");
                false
            }
        }
    }
}
