//! Classification of kernel messages into output events.

use kernel_agents_core::{
    ExecutionHandle, KernelMessage, KernelState, MessageKind, MimeBundle, MimeValue, OutputEvent,
    StreamName, TransportError,
};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Map, Value};

/// What an event-channel message means for the execution it belongs to.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    /// An output to append, in arrival order.
    Output(OutputEvent),
    /// The kernel went idle after handling the request; no more events follow.
    Idle,
    /// Anything else (busy status, input echo, comm traffic).
    Ignored,
}

/// Outcome reported by the kernel's reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyStatus {
    Ok,
    Error,
    Aborted,
}

/// Parsed reply for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    pub status: ReplyStatus,
    /// Execution counter assigned by the kernel.
    pub seq: u64,
}

#[derive(Deserialize)]
struct StreamContent {
    #[serde(default = "default_stream")]
    name: StreamName,
    #[serde(default)]
    text: String,
}

const fn default_stream() -> StreamName {
    StreamName::Stdout
}

#[derive(Deserialize)]
struct DataContent {
    #[serde(default)]
    data: Map<String, Value>,
    #[serde(default)]
    execution_count: Option<u64>,
}

#[derive(Deserialize)]
struct ErrorContent {
    #[serde(default)]
    ename: String,
    #[serde(default)]
    evalue: String,
    #[serde(default)]
    traceback: Vec<String>,
}

#[derive(Deserialize)]
struct StatusContent {
    execution_state: KernelState,
}

#[derive(Deserialize)]
struct ReplyContent {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    execution_count: Option<u64>,
}

fn parse<T: DeserializeOwned>(msg: &KernelMessage) -> Result<T, TransportError> {
    T::deserialize(&msg.content)
        .map_err(|e| TransportError::Malformed(format!("{:?} message: {e}", msg.kind)))
}

fn bundle(data: Map<String, Value>) -> MimeBundle {
    data.into_iter()
        .map(|(mimetype, value)| {
            let value = MimeValue::from_wire(&mimetype, value);
            (mimetype, value)
        })
        .collect()
}

/// Classify an event-channel message that belongs to our request.
///
/// # Errors
/// Returns `Malformed` if the content does not match its kind.
pub fn classify_event(msg: &KernelMessage) -> Result<Routed, TransportError> {
    let routed = match msg.kind {
        MessageKind::Stream => {
            let StreamContent { name, text } = parse(msg)?;
            Routed::Output(OutputEvent::Stream { name, text })
        }
        MessageKind::ExecuteResult => {
            let DataContent {
                data,
                execution_count,
            } = parse(msg)?;
            Routed::Output(OutputEvent::Result {
                mime_data: bundle(data),
                seq: execution_count,
            })
        }
        MessageKind::DisplayData => {
            let DataContent { data, .. } = parse(msg)?;
            Routed::Output(OutputEvent::DisplayData {
                mime_data: bundle(data),
            })
        }
        MessageKind::Error => {
            let ErrorContent {
                ename,
                evalue,
                traceback,
            } = parse(msg)?;
            Routed::Output(OutputEvent::Error {
                kind: ename,
                message: evalue,
                trace: traceback,
            })
        }
        MessageKind::Status => match parse::<StatusContent>(msg)?.execution_state {
            KernelState::Idle => Routed::Idle,
            _ => Routed::Ignored,
        },
        MessageKind::Reply | MessageKind::Other => Routed::Ignored,
    };
    Ok(routed)
}

/// Parse the reply to `handle`.
///
/// # Errors
/// The kernel must supply its execution counter; a reply without one is `Malformed`.
pub fn parse_reply(msg: &KernelMessage, handle: &ExecutionHandle) -> Result<Reply, TransportError> {
    let ReplyContent {
        status,
        execution_count,
    } = parse(msg)?;
    let seq = execution_count.ok_or_else(|| {
        TransportError::Malformed(format!(
            "kernel did not return execution_count in reply to {handle}"
        ))
    })?;
    let status = match status.as_deref() {
        Some("ok") | None => ReplyStatus::Ok,
        Some("aborted") => ReplyStatus::Aborted,
        Some(_) => ReplyStatus::Error,
    };
    Ok(Reply { status, seq })
}
