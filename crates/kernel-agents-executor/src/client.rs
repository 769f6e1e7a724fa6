//! Synchronous execution of code on a kernel.

use std::{future, sync::Arc, time::Duration};

use kernel_agents_core::{
    Channel, ExecutionHandle, ExecutionResult, ExecutionStatus, KernelHandle, KernelInfo,
    KernelMessage, KernelState, KernelTransport, MessageKind, OutputEvent, SubmitRequest,
    TransportError, config::ExecutionConfig,
};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::messages::{ReplyStatus, Routed, classify_event, parse_reply};

/// Execution error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecuteError {
    #[error("Kernel '{0}' not found; it may have been shut down or restarted")]
    KernelNotFound(KernelHandle),
    #[error("Kernel '{0}' is busy; wait for it to finish or interrupt it")]
    KernelBusy(KernelHandle),
    #[error("Transport error: {0}")]
    Transport(TransportError),
}

impl From<TransportError> for ExecuteError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::KernelNotFound(kernel) => Self::KernelNotFound(kernel),
            other => Self::Transport(other),
        }
    }
}

/// Runs one piece of code on a kernel and collects everything it emits.
///
/// Output events are matched to the request by parent id; messages that
/// belong to other requests are dropped. The kernel's reply supplies the
/// execution counter, and a short grace window after the reply picks up
/// events that arrive late on the event channel.
#[derive(Clone)]
pub struct ExecutionClient {
    transport: Arc<dyn KernelTransport>,
    config: ExecutionConfig,
}

impl std::fmt::Debug for ExecutionClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionClient")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Progress of one request while its messages are being collected.
#[derive(Default)]
struct Collected {
    outputs: Vec<OutputEvent>,
    reply: Option<(ReplyStatus, u64)>,
    idle: bool,
}

impl Collected {
    fn into_result(self) -> ExecutionResult {
        let (reply_status, seq) = match self.reply {
            Some((status, seq)) => (status, Some(seq)),
            None => (ReplyStatus::Error, None),
        };
        let failed =
            reply_status != ReplyStatus::Ok || self.outputs.iter().any(OutputEvent::is_error);
        ExecutionResult {
            outputs: self.outputs,
            seq,
            status: if failed {
                ExecutionStatus::Error
            } else {
                ExecutionStatus::Ok
            },
        }
    }
}

impl ExecutionClient {
    #[must_use]
    pub fn new(transport: Arc<dyn KernelTransport>, config: ExecutionConfig) -> Self {
        Self { transport, config }
    }

    #[must_use]
    pub fn transport(&self) -> &Arc<dyn KernelTransport> {
        &self.transport
    }

    /// Advisory check that the kernel exists and is not already running something.
    ///
    /// The answer can be stale by the time the caller acts on it; it does not
    /// reserve the kernel.
    ///
    /// # Errors
    /// `KernelNotFound` for an unknown kernel, `KernelBusy` if it reports busy.
    pub async fn check_admission(&self, kernel: &KernelHandle) -> Result<KernelInfo, ExecuteError> {
        let info = self
            .transport
            .kernel_info(kernel)
            .await?
            .ok_or_else(|| ExecuteError::KernelNotFound(kernel.clone()))?;
        if info.execution_state == KernelState::Busy {
            return Err(ExecuteError::KernelBusy(kernel.clone()));
        }
        Ok(info)
    }

    /// Execute `code` and wait for its outputs.
    ///
    /// `timeout` bounds the wait for the kernel's reply; `None` waits
    /// indefinitely. On timeout the kernel is interrupted (best effort) and a
    /// result with [`ExecutionStatus::Timeout`] carrying the partial outputs is
    /// returned.
    ///
    /// # Errors
    /// Returns an error if the kernel is unknown, the transport fails, or the
    /// reply lacks an execution counter.
    pub async fn execute(
        &self,
        kernel: &KernelHandle,
        code: &str,
        timeout: Option<Duration>,
    ) -> Result<ExecutionResult, ExecuteError> {
        if self.transport.kernel_info(kernel).await?.is_none() {
            return Err(ExecuteError::KernelNotFound(kernel.clone()));
        }

        let request = SubmitRequest::execute(Uuid::new_v4().to_string(), code);
        let handle = self.transport.submit(kernel, request).await?;
        info!(kernel = %kernel, request = %handle, "Submitted execution request");

        let deadline = timeout.map(|t| Instant::now() + t);
        let mut collected = Collected::default();
        let mut grace_until: Option<Instant> = None;

        loop {
            let (wait, until) = match grace_until {
                Some(at) => (self.config.grace_poll_interval(), Some(at)),
                None => (self.config.poll_interval(), deadline),
            };
            let expiry = async move {
                match until {
                    Some(at) => sleep_until(at).await,
                    None => future::pending().await,
                }
            };

            tokio::select! {
                biased;
                msg = self.transport.poll(kernel, Channel::Events, wait) => {
                    if let Some(msg) = msg? {
                        if route_event(&handle, &msg, &mut collected)? {
                            break;
                        }
                    }
                }
                msg = self.transport.poll(kernel, Channel::Reply, wait), if collected.reply.is_none() => {
                    let Some(msg) = msg? else { continue };
                    if !msg.answers(&handle) || msg.kind != MessageKind::Reply {
                        debug!(request = %handle, parent = ?msg.parent_id, "Dropping unrelated reply");
                        continue;
                    }
                    let reply = parse_reply(&msg, &handle)?;
                    debug!(request = %handle, seq = reply.seq, status = ?reply.status, "Received reply");
                    collected.reply = Some((reply.status, reply.seq));
                    if collected.idle {
                        break;
                    }
                    grace_until = Some(Instant::now() + self.config.grace_period());
                }
                () = expiry => {
                    if collected.reply.is_some() {
                        break;
                    }
                    return Ok(self.timed_out(kernel, &handle, collected.outputs).await);
                }
            }
        }

        let result = collected.into_result();
        info!(
            kernel = %kernel,
            request = %handle,
            seq = ?result.seq,
            status = ?result.status,
            outputs = result.outputs.len(),
            "Execution finished"
        );
        Ok(result)
    }

    async fn timed_out(
        &self,
        kernel: &KernelHandle,
        handle: &ExecutionHandle,
        outputs: Vec<OutputEvent>,
    ) -> ExecutionResult {
        warn!(kernel = %kernel, request = %handle, "Execution timed out; interrupting kernel");
        if let Err(e) = self.transport.interrupt(kernel).await {
            warn!(kernel = %kernel, error = %e, "Failed to interrupt kernel after timeout");
        }
        ExecutionResult {
            outputs,
            seq: None,
            status: ExecutionStatus::Timeout,
        }
    }
}

/// Route one event-channel message. Returns `true` once collection is complete.
fn route_event(
    handle: &ExecutionHandle,
    msg: &KernelMessage,
    collected: &mut Collected,
) -> Result<bool, ExecuteError> {
    if !msg.answers(handle) {
        return Ok(false);
    }
    match classify_event(msg)? {
        Routed::Output(event) => collected.outputs.push(event),
        Routed::Idle => {
            collected.idle = true;
            return Ok(collected.reply.is_some());
        }
        Routed::Ignored => {}
    }
    Ok(false)
}
