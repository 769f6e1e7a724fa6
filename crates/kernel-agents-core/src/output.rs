//! Execution requests, results and the output event model.

use std::{collections::BTreeMap, fmt};

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Value, json};

/// Identifier of a running kernel.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KernelHandle(String);

impl KernelHandle {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KernelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for KernelHandle {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for KernelHandle {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Request id correlating the reply and events of one submitted execution.
///
/// Generated fresh for every submission and never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExecutionHandle(String);

impl ExecutionHandle {
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExecutionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Address of a notebook cell in the document store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellRef {
    /// Document the cell belongs to.
    pub document_id: String,
    /// Zero-based cell position.
    pub cell_index: usize,
}

impl CellRef {
    #[must_use]
    pub fn new(document_id: impl Into<String>, cell_index: usize) -> Self {
        Self {
            document_id: document_id.into(),
            cell_index,
        }
    }
}

/// A unit of code to run on a kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub code: String,
    pub kernel: KernelHandle,
    /// Cell whose source produced `code`, if any. Results are written back there.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation: Option<CellRef>,
}

impl ExecutionRequest {
    #[must_use]
    pub fn new(kernel: KernelHandle, code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            kernel,
            correlation: None,
        }
    }

    #[must_use]
    pub fn for_cell(mut self, cell: CellRef) -> Self {
        self.correlation = Some(cell);
        self
    }
}

/// Stream name of a `Stream` output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamName {
    Stdout,
    Stderr,
}

impl StreamName {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
        }
    }
}

/// One value of a MIME bundle.
#[derive(Debug, Clone, PartialEq)]
pub enum MimeValue {
    Text(String),
    /// Decoded binary payload (images, pdf). Base64 encoded on the wire.
    Binary(Bytes),
    /// Structured payloads such as `application/json`.
    Json(Value),
}

impl MimeValue {
    /// Build a value from the JSON the kernel sent for `mimetype`.
    ///
    /// Binary mimetypes arrive base64 encoded and are decoded here; anything
    /// that fails to decode is kept as text.
    #[must_use]
    pub fn from_wire(mimetype: &str, value: Value) -> Self {
        match value {
            Value::String(text) if is_binary_mimetype(mimetype) => {
                let compact: String = text.split_whitespace().collect();
                BASE64
                    .decode(compact.as_bytes())
                    .map_or(Self::Text(text), |raw| Self::Binary(Bytes::from(raw)))
            }
            Value::String(text) => Self::Text(text),
            other => Self::Json(other),
        }
    }

    /// JSON representation used in nbformat and tool payloads.
    #[must_use]
    pub fn to_json(&self) -> Value {
        match self {
            Self::Text(text) => Value::String(text.clone()),
            Self::Binary(raw) => Value::String(BASE64.encode(raw)),
            Self::Json(value) => value.clone(),
        }
    }
}

impl Serialize for MimeValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Text(text) => serializer.serialize_str(text),
            Self::Binary(raw) => serializer.serialize_str(&BASE64.encode(raw)),
            Self::Json(value) => value.serialize(serializer),
        }
    }
}

fn is_binary_mimetype(mimetype: &str) -> bool {
    (mimetype.starts_with("image/") && mimetype != "image/svg+xml") || mimetype == "application/pdf"
}

/// MIME bundle keyed by mimetype.
pub type MimeBundle = BTreeMap<String, MimeValue>;

/// One output produced by an execution, in event-stream arrival order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputEvent {
    Stream {
        name: StreamName,
        text: String,
    },
    Result {
        mime_data: MimeBundle,
        seq: Option<u64>,
    },
    DisplayData {
        mime_data: MimeBundle,
    },
    /// The executed code raised. This is data, not an infrastructure fault.
    Error {
        kind: String,
        message: String,
        trace: Vec<String>,
    },
}

impl OutputEvent {
    #[must_use]
    pub fn stdout(text: impl Into<String>) -> Self {
        Self::Stream {
            name: StreamName::Stdout,
            text: text.into(),
        }
    }

    #[must_use]
    pub const fn is_error(&self) -> bool {
        matches!(self, Self::Error { .. })
    }

    /// Convert to an nbformat output object.
    #[must_use]
    pub fn to_nbformat(&self) -> Value {
        match self {
            Self::Stream { name, text } => json!({
                "output_type": "stream",
                "name": name.as_str(),
                "text": text,
            }),
            Self::Result { mime_data, seq } => json!({
                "output_type": "execute_result",
                "data": bundle_to_json(mime_data),
                "metadata": {},
                "execution_count": seq,
            }),
            Self::DisplayData { mime_data } => json!({
                "output_type": "display_data",
                "data": bundle_to_json(mime_data),
                "metadata": {},
            }),
            Self::Error {
                kind,
                message,
                trace,
            } => json!({
                "output_type": "error",
                "ename": kind,
                "evalue": message,
                "traceback": trace,
            }),
        }
    }

    /// Plain-text rendering with terminal escapes removed.
    #[must_use]
    pub fn summary(&self) -> String {
        match self {
            Self::Stream { text, .. } => strip_ansi(text),
            Self::Result { mime_data, .. } | Self::DisplayData { mime_data } => {
                summarize_bundle(mime_data)
            }
            Self::Error { trace, kind, message } if trace.is_empty() => {
                format!("{kind}: {message}")
            }
            Self::Error { trace, .. } => trace
                .iter()
                .map(|line| strip_ansi(line))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

fn bundle_to_json(bundle: &MimeBundle) -> Value {
    Value::Object(
        bundle
            .iter()
            .map(|(mimetype, value)| (mimetype.clone(), value.to_json()))
            .collect(),
    )
}

fn summarize_bundle(bundle: &MimeBundle) -> String {
    match bundle.get("text/plain") {
        Some(MimeValue::Text(text)) => strip_ansi(text),
        Some(other) => other.to_json().to_string(),
        None if bundle.contains_key("text/html") => "[HTML Output]".to_string(),
        None if bundle.contains_key("image/png") => "[Image Output (PNG)]".to_string(),
        None => format!(
            "[Data: keys={}]",
            bundle.keys().cloned().collect::<Vec<_>>().join(", ")
        ),
    }
}

/// Remove CSI escape sequences (`ESC [ ... letter`).
#[must_use]
pub fn strip_ansi(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' && chars.peek() == Some(&'[') {
            chars.next();
            for next in chars.by_ref() {
                if next.is_ascii_alphabetic() {
                    break;
                }
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Terminal status of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Ok,
    /// The code raised; see the `Error` output.
    Error,
    /// No reply arrived within the wall-clock bound.
    Timeout,
}

/// Aggregated outcome of one execution request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionResult {
    pub outputs: Vec<OutputEvent>,
    /// Kernel execution counter taken from the reply. `None` only for `Timeout`.
    pub seq: Option<u64>,
    pub status: ExecutionStatus,
}

impl ExecutionResult {
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.status == ExecutionStatus::Ok
    }

    /// First `Error` output, if the code raised.
    #[must_use]
    pub fn error_event(&self) -> Option<&OutputEvent> {
        self.outputs.iter().find(|o| o.is_error())
    }

    /// Short `kind: message` description of why this result is not `Ok`.
    #[must_use]
    pub fn failure_reason(&self) -> Option<String> {
        match self.status {
            ExecutionStatus::Ok => None,
            ExecutionStatus::Timeout => Some("execution timed out".to_string()),
            ExecutionStatus::Error => Some(match self.error_event() {
                Some(OutputEvent::Error { kind, message, .. }) => format!("{kind}: {message}"),
                _ => "kernel reported an execution error".to_string(),
            }),
        }
    }

    /// Outputs as nbformat objects.
    #[must_use]
    pub fn nbformat_outputs(&self) -> Vec<Value> {
        self.outputs.iter().map(OutputEvent::to_nbformat).collect()
    }
}
