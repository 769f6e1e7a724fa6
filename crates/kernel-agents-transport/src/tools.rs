//! Tool-call surface: `(name, args) -> {success, ...}` envelopes.

use std::{fmt::Display, sync::Arc, time::Duration};

use kernel_agents_core::{
    CellRef, DocumentError, EngineConfig, ExecutionContext, ExecutionRequest, ExecutionResult,
    KernelHandle, OutputEvent, TransportError,
};
use kernel_agents_executor::{ExecuteError, ExecutionClient};
use kernel_agents_session::{
    BatchCoordinator, ExecutionId, ExecutionRegistry, ExecutionTracker, RegistryError,
    TrackerError,
};
use serde::{Deserialize, de::DeserializeOwned};
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use crate::{
    delegation::{DelegationBroker, DelegationError},
    protocol::{DELEGATED_TOOLS, is_delegated},
};

/// Tools handled by the engine itself.
pub const LOCAL_TOOLS: &[&str] = &[
    "execute_cell",
    "execute_cell_async",
    "check_execution_status",
    "execute_all_cells",
    "check_all_cells_status",
    "execute_code",
    "cancel_execution",
    "forget_execution",
    "get_kernel_status",
    "interrupt_kernel",
    "restart_kernel",
    "list_kernels",
    "insert_and_execute_cell",
];

/// Tool error.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error("Invalid arguments for {tool}: {reason}")]
    InvalidArgs { tool: String, reason: String },
    #[error("Execution {0} is not a batch run")]
    NotABatch(ExecutionId),
    #[error(transparent)]
    Execute(#[from] ExecuteError),
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Document(#[from] DocumentError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Delegation(#[from] DelegationError),
    #[error("Failed to encode response: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Deserialize)]
struct CellArgs {
    document_id: String,
    cell_index: usize,
    kernel_id: String,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

#[derive(Deserialize)]
struct DocumentArgs {
    document_id: String,
    kernel_id: String,
    #[serde(default)]
    restart_kernel: bool,
}

#[derive(Deserialize)]
struct CodeArgs {
    kernel_id: String,
    code: String,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

#[derive(Deserialize)]
struct InsertArgs {
    document_id: String,
    cell_index: usize,
    code: String,
    kernel_id: String,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

#[derive(Deserialize)]
struct KernelArgs {
    kernel_id: String,
}

#[derive(Deserialize)]
struct ExecutionArgs {
    execution_id: String,
}

fn parse<T: DeserializeOwned>(tool: &str, args: Value) -> Result<T, ToolError> {
    serde_json::from_value(args).map_err(|e| ToolError::InvalidArgs {
        tool: tool.to_string(),
        reason: e.to_string(),
    })
}

fn execution_id(tool: &str, args: Value) -> Result<ExecutionId, ToolError> {
    let ExecutionArgs { execution_id } = parse(tool, args)?;
    execution_id.parse().map_err(|e| ToolError::InvalidArgs {
        tool: tool.to_string(),
        reason: format!("execution_id: {e}"),
    })
}

/// `{success: true, ...payload}`.
fn success(payload: Value) -> Value {
    let mut envelope = Map::new();
    envelope.insert("success".into(), Value::Bool(true));
    if let Value::Object(fields) = payload {
        envelope.extend(fields);
    }
    Value::Object(envelope)
}

/// `{success: false, error}`.
fn failure(error: impl Display) -> Value {
    json!({"success": false, "error": error.to_string()})
}

/// Envelope for a finished execution: code-level failures are reported, not raised.
fn execution_envelope(result: &ExecutionResult) -> Value {
    let text: Vec<_> = result.outputs.iter().map(OutputEvent::summary).collect();
    let mut envelope = json!({
        "success": result.is_ok(),
        "status": result.status,
        "execution_count": result.seq,
        "outputs": result.nbformat_outputs(),
        "output_text": text.join("\n"),
    });
    if let Some(reason) = result.failure_reason() {
        envelope["error"] = Value::String(reason);
    }
    envelope
}

/// Dispatches tool calls to the execution engine or the delegation peer.
pub struct ToolRouter {
    ctx: ExecutionContext,
    client: ExecutionClient,
    tracker: ExecutionTracker,
    batch: BatchCoordinator,
    broker: Arc<DelegationBroker>,
    default_timeout: Duration,
}

impl ToolRouter {
    #[must_use]
    pub fn new(ctx: ExecutionContext, config: &EngineConfig, broker: Arc<DelegationBroker>) -> Self {
        let client = ExecutionClient::new(Arc::clone(&ctx.kernels), config.execution.clone());
        let registry = Arc::new(ExecutionRegistry::new());
        let tracker = ExecutionTracker::new(ctx.clone(), client.clone(), Arc::clone(&registry));
        let batch = BatchCoordinator::new(
            ctx.clone(),
            client.clone(),
            registry,
            config.batch.restart_settle(),
        );
        Self {
            ctx,
            client,
            tracker,
            batch,
            broker,
            default_timeout: config.execution.default_timeout(),
        }
    }

    /// Registry shared by single and batch background executions.
    #[must_use]
    pub const fn registry(&self) -> &Arc<ExecutionRegistry> {
        self.tracker.registry()
    }

    /// Cancel outstanding background executions and wait for their tasks.
    pub async fn shutdown(&self) {
        self.registry().shutdown().await;
    }

    /// Names of every tool this router answers.
    pub fn tool_names() -> impl Iterator<Item = &'static str> {
        LOCAL_TOOLS.iter().chain(DELEGATED_TOOLS).copied()
    }

    /// Run tool `name` and wrap the outcome in a `{success, ...}` envelope.
    pub async fn call(&self, name: &str, args: Value) -> Value {
        debug!(tool = %name, "Tool call");
        match self.dispatch(name, args).await {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(tool = %name, error = %e, "Tool call failed");
                failure(e)
            }
        }
    }

    async fn dispatch(&self, name: &str, args: Value) -> Result<Value, ToolError> {
        match name {
            "execute_cell" => self.execute_cell(parse(name, args)?).await,
            "execute_cell_async" => self.execute_cell_async(parse(name, args)?).await,
            "check_execution_status" => {
                let id = execution_id(name, args)?;
                let snapshot = self.tracker.status(id).await?;
                Ok(success(serde_json::to_value(snapshot)?))
            }
            "execute_all_cells" => {
                let args: DocumentArgs = parse(name, args)?;
                let kernel = KernelHandle::new(args.kernel_id);
                let id = self
                    .batch
                    .start_document(&args.document_id, &kernel, args.restart_kernel)
                    .await?;
                let total = self
                    .tracker
                    .status(id)
                    .await?
                    .batch
                    .map_or(0, |b| b.total_units);
                Ok(success(json!({
                    "execution_id": id,
                    "status": "running",
                    "total_units": total,
                })))
            }
            "check_all_cells_status" => {
                let id = execution_id(name, args)?;
                let snapshot = self.tracker.status(id).await?;
                let progress = snapshot
                    .batch
                    .as_ref()
                    .map(kernel_agents_session::BatchProgress::progress_percent)
                    .ok_or(ToolError::NotABatch(id))?;
                let mut envelope = success(serde_json::to_value(snapshot)?);
                envelope["progress_percent"] = json!(progress);
                Ok(envelope)
            }
            "execute_code" => {
                let args: CodeArgs = parse(name, args)?;
                let kernel = KernelHandle::new(args.kernel_id);
                self.client.check_admission(&kernel).await?;
                let result = self
                    .client
                    .execute(&kernel, &args.code, Some(self.timeout(args.timeout_secs)))
                    .await?;
                Ok(execution_envelope(&result))
            }
            "cancel_execution" => {
                let id = execution_id(name, args)?;
                self.registry().cancel(id).await?;
                Ok(success(json!({"execution_id": id, "status": "error"})))
            }
            "forget_execution" => {
                let id = execution_id(name, args)?;
                let last = self.registry().forget(id).await?;
                Ok(success(json!({"execution_id": id, "status": last.status})))
            }
            "get_kernel_status" => {
                let KernelArgs { kernel_id } = parse(name, args)?;
                let kernel = KernelHandle::new(kernel_id);
                let info = self
                    .ctx
                    .kernels
                    .kernel_info(&kernel)
                    .await?
                    .ok_or(TransportError::KernelNotFound(kernel))?;
                Ok(success(json!({"kernel": info})))
            }
            "interrupt_kernel" => {
                let KernelArgs { kernel_id } = parse(name, args)?;
                let kernel = KernelHandle::new(kernel_id);
                self.ctx.kernels.interrupt(&kernel).await?;
                Ok(success(json!({"kernel_id": kernel, "message": "Kernel interrupted"})))
            }
            "restart_kernel" => {
                let KernelArgs { kernel_id } = parse(name, args)?;
                let kernel = KernelHandle::new(kernel_id);
                self.ctx.kernels.restart(&kernel).await?;
                Ok(success(json!({"kernel_id": kernel, "message": "Kernel restarted"})))
            }
            "list_kernels" => {
                let kernels = self.ctx.kernels.list_kernels().await?;
                Ok(success(json!({"kernels": kernels})))
            }
            "insert_and_execute_cell" => self.insert_and_execute(parse(name, args)?).await,
            _ if is_delegated(name) => {
                let result = self.broker.send(name, args, None).await?;
                match result {
                    Value::Object(fields) if fields.contains_key("success") => {
                        Ok(Value::Object(fields))
                    }
                    other => Ok(success(json!({"result": other}))),
                }
            }
            _ => Err(ToolError::UnknownTool(name.to_string())),
        }
    }

    fn timeout(&self, secs: Option<u64>) -> Duration {
        secs.map_or(self.default_timeout, Duration::from_secs)
    }

    async fn execute_cell(&self, args: CellArgs) -> Result<Value, ToolError> {
        let cell = CellRef::new(args.document_id, args.cell_index);
        let code = self.ctx.code_cell_source(&cell).await?;
        let kernel = KernelHandle::new(args.kernel_id);
        self.client.check_admission(&kernel).await?;

        let result = self
            .client
            .execute(&kernel, &code, Some(self.timeout(args.timeout_secs)))
            .await?;
        self.ctx.record_result(&cell, &result).await?;

        let mut envelope = execution_envelope(&result);
        envelope["cell_index"] = json!(cell.cell_index);
        Ok(envelope)
    }

    async fn execute_cell_async(&self, args: CellArgs) -> Result<Value, ToolError> {
        let cell = CellRef::new(args.document_id, args.cell_index);
        let code = self.ctx.code_cell_source(&cell).await?;
        let kernel = KernelHandle::new(args.kernel_id);
        self.client.check_admission(&kernel).await?;

        let timeout = args.timeout_secs.map(Duration::from_secs);
        let request = ExecutionRequest::new(kernel, code).for_cell(cell.clone());
        let id = self.tracker.start(request, timeout).await;
        Ok(success(json!({
            "execution_id": id,
            "status": "running",
            "cell_index": cell.cell_index,
        })))
    }

    /// Insert a code cell through the peer, then run its code.
    ///
    /// The peer owns the inserted cell, so outputs are returned rather than
    /// written back.
    async fn insert_and_execute(&self, args: InsertArgs) -> Result<Value, ToolError> {
        let kernel = KernelHandle::new(args.kernel_id);
        self.client.check_admission(&kernel).await?;

        let inserted = self
            .broker
            .send(
                "insert_cell",
                json!({
                    "document_id": args.document_id,
                    "cell_index": args.cell_index,
                    "cell_type": "code",
                    "source": args.code,
                }),
                None,
            )
            .await?;
        if inserted.get("success").and_then(Value::as_bool) == Some(false) {
            return Ok(inserted);
        }

        let result = self
            .client
            .execute(&kernel, &args.code, Some(self.timeout(args.timeout_secs)))
            .await?;
        let mut envelope = execution_envelope(&result);
        envelope["cell_index"] = json!(args.cell_index);
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use kernel_agents_core::{
        CellType, MemoryDocuments,
        testing::{DEFAULT_KERNEL, ScriptedKernel},
    };
    use tokio::sync::mpsc;

    use super::*;
    use crate::{delegation::DelegationPeer, protocol::PeerMessage};

    struct Fixture {
        kernel: Arc<ScriptedKernel>,
        docs: Arc<MemoryDocuments>,
        broker: Arc<DelegationBroker>,
        router: ToolRouter,
    }

    struct ChannelPeer(mpsc::UnboundedSender<PeerMessage>);

    #[async_trait]
    impl DelegationPeer for ChannelPeer {
        async fn send(&self, message: PeerMessage) -> Result<(), DelegationError> {
            self.0
                .send(message)
                .map_err(|e| DelegationError::Send(e.to_string()))
        }
    }

    /// Attach a peer that answers every request with `answer` and records what it was asked.
    async fn attach_peer(
        broker: &Arc<DelegationBroker>,
        answer: Value,
    ) -> mpsc::UnboundedReceiver<(String, Value)> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (seen_tx, seen_rx) = mpsc::unbounded_channel();
        broker.attach_peer(Arc::new(ChannelPeer(tx))).await;
        let broker = Arc::clone(broker);
        tokio::spawn(async move {
            while let Some(PeerMessage::ToolRequest { id, name, args }) = rx.recv().await {
                let _ = seen_tx.send((name, args));
                broker.deliver(id, answer.clone()).await;
            }
        });
        seen_rx
    }

    fn fixture() -> Fixture {
        let kernel = Arc::new(ScriptedKernel::new());
        let docs = Arc::new(MemoryDocuments::new());
        docs.insert_document(
            "nb",
            [
                (CellType::Markdown, "# Analysis".to_string()),
                (CellType::Code, "print(\"hello\")".to_string()),
                (CellType::Code, "raise ZeroDivisionError(\"division by zero\")".to_string()),
                (CellType::Code, "print(\"unreached\")".to_string()),
                (CellType::Code, "time.sleep(5)".to_string()),
            ],
        );
        let ctx = ExecutionContext::new(kernel.clone(), docs.clone());
        let mut config = EngineConfig::default();
        config.batch.restart_settle_ms = 10;
        let broker = Arc::new(DelegationBroker::new(Duration::from_millis(200)));
        Fixture {
            kernel,
            docs,
            broker: Arc::clone(&broker),
            router: ToolRouter::new(ctx, &config, broker),
        }
    }

    fn cell(index: usize) -> Value {
        json!({"document_id": "nb", "cell_index": index, "kernel_id": DEFAULT_KERNEL})
    }

    async fn poll_until_done(router: &ToolRouter, tool: &str, id: &Value) -> Value {
        for _ in 0..300 {
            let status = router.call(tool, json!({"execution_id": id})).await;
            if status["status"] != "running" {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{tool} never reported a terminal status");
    }

    #[tokio::test]
    async fn execute_cell_writes_back_and_reports() {
        let f = fixture();

        let response = f.router.call("execute_cell", cell(1)).await;

        assert_eq!(response["success"], true);
        assert_eq!(response["execution_count"], 1);
        assert_eq!(response["outputs"][0]["output_type"], "stream");
        assert_eq!(response["output_text"], "hello\n");
        assert_eq!(f.docs.exec_count("nb", 1), Some(1));
    }

    #[tokio::test]
    async fn raised_error_is_reported_not_thrown() {
        let f = fixture();

        let response = f.router.call("execute_cell", cell(2)).await;

        assert_eq!(response["success"], false);
        assert_eq!(response["status"], "error");
        assert_eq!(response["error"], "ZeroDivisionError: division by zero");
        assert_eq!(response["outputs"][0]["ename"], "ZeroDivisionError");
    }

    #[tokio::test]
    async fn bad_cell_references_are_rejected_before_execution() {
        let f = fixture();

        let markdown = f.router.call("execute_cell", cell(0)).await;
        let missing = f.router.call("execute_cell", cell(42)).await;

        assert_eq!(markdown["success"], false);
        assert!(markdown["error"].as_str().unwrap().contains("not a code cell"));
        assert_eq!(missing["success"], false);
        assert!(missing["error"].as_str().unwrap().contains("out of range"));
        assert!(f.kernel.executed(DEFAULT_KERNEL).is_empty());
    }

    #[tokio::test]
    async fn async_cell_can_be_polled() {
        let f = fixture();

        let started = f.router.call("execute_cell_async", cell(1)).await;
        assert_eq!(started["success"], true);
        assert_eq!(started["status"], "running");

        let status = poll_until_done(&f.router, "check_execution_status", &started["execution_id"]).await;
        assert_eq!(status["success"], true);
        assert_eq!(status["status"], "completed");
        assert_eq!(status["seq"], 1);
        assert_eq!(f.docs.outputs("nb", 1).unwrap(), vec![OutputEvent::stdout("hello\n")]);
    }

    #[tokio::test]
    async fn all_cells_stop_at_failure() {
        let f = fixture();

        let started = f
            .router
            .call(
                "execute_all_cells",
                json!({"document_id": "nb", "kernel_id": DEFAULT_KERNEL, "restart_kernel": true}),
            )
            .await;
        assert_eq!(started["total_units"], 4);

        let status = poll_until_done(&f.router, "check_all_cells_status", &started["execution_id"]).await;
        assert_eq!(status["status"], "error");
        assert_eq!(status["batch"]["completed_units"], 2);
        assert_eq!(status["batch"]["failed_unit_index"], 1);
        assert_eq!(status["batch"]["failed_cell_index"], 2);
        assert_eq!(f.kernel.restarts(DEFAULT_KERNEL), 1);
        assert!(f.docs.outputs("nb", 3).unwrap().is_empty());
    }

    #[tokio::test]
    async fn single_status_on_batch_tool_is_rejected() {
        let f = fixture();
        let started = f.router.call("execute_cell_async", cell(1)).await;
        poll_until_done(&f.router, "check_execution_status", &started["execution_id"]).await;

        let response = f
            .router
            .call("check_all_cells_status", json!({"execution_id": started["execution_id"]}))
            .await;

        assert_eq!(response["success"], false);
        assert!(response["error"].as_str().unwrap().contains("not a batch"));
    }

    #[tokio::test]
    async fn busy_kernel_is_refused() {
        let f = fixture();
        f.kernel.set_busy(DEFAULT_KERNEL, true);

        let response = f
            .router
            .call("execute_code", json!({"kernel_id": DEFAULT_KERNEL, "code": "1"}))
            .await;

        assert_eq!(response["success"], false);
        assert!(response["error"].as_str().unwrap().contains("busy"));
    }

    #[tokio::test]
    async fn argument_and_id_errors_become_envelopes() {
        let f = fixture();

        let missing = f.router.call("execute_code", json!({"code": "1"})).await;
        let bad_id = f
            .router
            .call("check_execution_status", json!({"execution_id": "nope"}))
            .await;
        let unknown_id = f
            .router
            .call(
                "check_execution_status",
                json!({"execution_id": ExecutionId::new().to_string()}),
            )
            .await;
        let unknown_tool = f.router.call("format_disk", json!({})).await;

        assert!(missing["error"].as_str().unwrap().starts_with("Invalid arguments"));
        assert!(bad_id["error"].as_str().unwrap().starts_with("Invalid arguments"));
        assert!(unknown_id["error"].as_str().unwrap().contains("Unknown execution id"));
        assert_eq!(unknown_tool["error"], "Unknown tool: format_disk");
    }

    #[tokio::test]
    async fn kernel_control_tools() {
        let f = fixture();

        let list = f.router.call("list_kernels", json!({})).await;
        let status = f
            .router
            .call("get_kernel_status", json!({"kernel_id": DEFAULT_KERNEL}))
            .await;
        let gone = f
            .router
            .call("get_kernel_status", json!({"kernel_id": "gone"}))
            .await;
        let interrupted = f
            .router
            .call("interrupt_kernel", json!({"kernel_id": DEFAULT_KERNEL}))
            .await;

        assert_eq!(list["kernels"].as_array().unwrap().len(), 1);
        assert_eq!(status["kernel"]["execution_state"], "idle");
        assert_eq!(gone["success"], false);
        assert_eq!(interrupted["success"], true);
        assert_eq!(f.kernel.interrupts(DEFAULT_KERNEL), 1);
    }

    #[tokio::test]
    async fn delegated_tool_without_peer_fails_fast() {
        let f = fixture();

        let response = f.router.call("read_cell", json!({"cell_index": 0})).await;

        assert_eq!(response["success"], false);
        assert!(response["error"].as_str().unwrap().contains("No peer"));
    }

    #[tokio::test]
    async fn insert_then_execute_through_peer() {
        let f = fixture();
        let mut seen = attach_peer(&f.broker, json!({"success": true})).await;

        let response = f
            .router
            .call(
                "insert_and_execute_cell",
                json!({
                    "document_id": "nb",
                    "cell_index": 2,
                    "code": "print(\"inserted\")",
                    "kernel_id": DEFAULT_KERNEL,
                }),
            )
            .await;

        assert_eq!(response["success"], true);
        assert_eq!(response["cell_index"], 2);
        assert_eq!(response["output_text"], "inserted\n");
        let (name, args) = seen.recv().await.unwrap();
        assert_eq!(name, "insert_cell");
        assert_eq!(args["cell_type"], "code");
        assert_eq!(args["source"], "print(\"inserted\")");
    }

    #[tokio::test]
    async fn rejected_insert_is_not_executed() {
        let f = fixture();
        let _seen = attach_peer(
            &f.broker,
            json!({"success": false, "error": "Cell index 99 out of range"}),
        )
        .await;

        let response = f
            .router
            .call(
                "insert_and_execute_cell",
                json!({
                    "document_id": "nb",
                    "cell_index": 99,
                    "code": "print(\"x\")",
                    "kernel_id": DEFAULT_KERNEL,
                }),
            )
            .await;

        assert_eq!(response["success"], false);
        assert_eq!(response["error"], "Cell index 99 out of range");
        assert!(f.kernel.executed(DEFAULT_KERNEL).is_empty());
    }

    #[tokio::test]
    async fn shutdown_cancels_running_jobs() {
        let f = fixture();
        let slow = f.router.call("execute_cell_async", cell(4)).await;
        let id: ExecutionId = slow["execution_id"].as_str().unwrap().parse().unwrap();
        let cancelled = f
            .router
            .call("cancel_execution", json!({"execution_id": id.to_string()}))
            .await;
        assert_eq!(cancelled["success"], true);

        f.router.shutdown().await;

        let status = f
            .router
            .call("check_execution_status", json!({"execution_id": id.to_string()}))
            .await;
        assert_eq!(status["status"], "error");
        assert_eq!(status["error"], "execution cancelled");
        let forgotten = f
            .router
            .call("forget_execution", json!({"execution_id": id.to_string()}))
            .await;
        assert_eq!(forgotten["success"], true);
        assert!(f.router.registry().list().await.is_empty());
    }

    #[test]
    fn every_tool_is_named_once() {
        let names: Vec<_> = ToolRouter::tool_names().collect();
        let mut unique = names.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(names.len(), unique.len());
        assert_eq!(names.len(), 20);
    }
}
