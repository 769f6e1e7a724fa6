//! Scripted in-process kernel for tests.
//!
//! Understands a tiny line-oriented dialect:
//!
//! | line | effect |
//! |---|---|
//! | `print("x")` / `eprint("x")` | stdout / stderr stream `x\n` |
//! | `display("x")` | display_data with `text/plain` |
//! | `print_late("x")` | stdout stream delivered after the reply |
//! | `42` | execute_result with `text/plain` `42` |
//! | `time.sleep(0.2)` | delay, interruptible |
//! | `raise Kind("msg")` | error output, error reply, stop |
//! | `# hang` | block until interrupted |
//! | `# no-reply` | never send a reply |
//! | `# no-seq` | reply without `execution_count` |

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex as StdMutex,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::{Mutex, Notify, mpsc};

use crate::{
    output::{ExecutionHandle, KernelHandle},
    traits::{
        Channel, KernelInfo, KernelMessage, KernelState, KernelTransport, MessageKind,
        SubmitRequest, TransportError,
    },
};

/// Kernel id registered by [`ScriptedKernel::new`].
pub const DEFAULT_KERNEL: &str = "kernel-1";

const LATE_EVENT_DELAY: Duration = Duration::from_millis(20);

struct SimKernel {
    replies_tx: mpsc::UnboundedSender<KernelMessage>,
    replies_rx: Mutex<mpsc::UnboundedReceiver<KernelMessage>>,
    events_tx: mpsc::UnboundedSender<KernelMessage>,
    events_rx: Mutex<mpsc::UnboundedReceiver<KernelMessage>>,
    exec_lock: Mutex<()>,
    counter: AtomicU64,
    busy: AtomicBool,
    forced_busy: AtomicBool,
    interrupt: Notify,
    executed: StdMutex<Vec<String>>,
    interrupts: AtomicUsize,
    restarts: AtomicUsize,
}

impl SimKernel {
    fn new() -> Self {
        let (replies_tx, replies_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            replies_tx,
            replies_rx: Mutex::new(replies_rx),
            events_tx,
            events_rx: Mutex::new(events_rx),
            exec_lock: Mutex::new(()),
            counter: AtomicU64::new(0),
            busy: AtomicBool::new(false),
            forced_busy: AtomicBool::new(false),
            interrupt: Notify::new(),
            executed: StdMutex::new(Vec::new()),
            interrupts: AtomicUsize::new(0),
            restarts: AtomicUsize::new(0),
        }
    }

    fn event(&self, parent: &str, kind: MessageKind, content: Value) {
        let _ = self.events_tx.send(KernelMessage::new(parent, kind, content));
    }

    async fn run(self: Arc<Self>, parent: String, code: String) {
        let _turn = self.exec_lock.lock().await;
        self.busy.store(true, Ordering::SeqCst);
        if let Ok(mut executed) = self.executed.lock() {
            executed.push(code.clone());
        }
        self.event(&parent, MessageKind::Status, json!({"execution_state": "busy"}));

        let seq = self.counter.fetch_add(1, Ordering::SeqCst) + 1;
        let mut failed = false;
        let mut send_reply = true;
        let mut include_seq = true;
        let mut late = Vec::new();

        for line in code.lines().map(str::trim) {
            if let Some(text) = call_arg(line, "print") {
                self.event(&parent, MessageKind::Stream, stream("stdout", text));
            } else if let Some(text) = call_arg(line, "eprint") {
                self.event(&parent, MessageKind::Stream, stream("stderr", text));
            } else if let Some(text) = call_arg(line, "print_late") {
                late.push(stream("stdout", text));
            } else if let Some(text) = call_arg(line, "display") {
                self.event(
                    &parent,
                    MessageKind::DisplayData,
                    json!({"data": {"text/plain": text}, "metadata": {}}),
                );
            } else if let Some(secs) = call_arg(line, "time.sleep") {
                let wait = Duration::from_secs_f64(secs.parse().unwrap_or(0.0));
                tokio::select! {
                    () = tokio::time::sleep(wait) => {}
                    () = self.interrupt.notified() => {
                        self.event(&parent, MessageKind::Error, error("KeyboardInterrupt", ""));
                        failed = true;
                        break;
                    }
                }
            } else if let Some(rest) = line.strip_prefix("raise ") {
                let (kind, message) = rest
                    .split_once('(')
                    .map_or((rest, ""), |(k, m)| (k, unquote(m.trim_end_matches(')'))));
                self.event(&parent, MessageKind::Error, error(kind, message));
                failed = true;
                break;
            } else if line == "# hang" {
                self.interrupt.notified().await;
                self.event(&parent, MessageKind::Error, error("KeyboardInterrupt", ""));
                failed = true;
                break;
            } else if line == "# no-reply" {
                send_reply = false;
            } else if line == "# no-seq" {
                include_seq = false;
            } else if line.parse::<i64>().is_ok() {
                self.event(
                    &parent,
                    MessageKind::ExecuteResult,
                    json!({"data": {"text/plain": line}, "metadata": {}, "execution_count": seq}),
                );
            }
        }

        if send_reply {
            let mut content = json!({"status": if failed { "error" } else { "ok" }});
            if include_seq {
                content["execution_count"] = json!(seq);
            }
            let _ = self
                .replies_tx
                .send(KernelMessage::new(&parent, MessageKind::Reply, content));
        }
        if !late.is_empty() {
            tokio::time::sleep(LATE_EVENT_DELAY).await;
            for content in late {
                self.event(&parent, MessageKind::Stream, content);
            }
        }
        self.busy.store(false, Ordering::SeqCst);
        self.event(&parent, MessageKind::Status, json!({"execution_state": "idle"}));
    }
}

fn call_arg<'a>(line: &'a str, name: &str) -> Option<&'a str> {
    let inner = line
        .strip_prefix(name)?
        .strip_prefix('(')?
        .strip_suffix(')')?;
    Some(unquote(inner))
}

fn unquote(text: &str) -> &str {
    text.trim().trim_matches(|c| c == '"' || c == '\'')
}

fn stream(name: &str, text: &str) -> Value {
    json!({"name": name, "text": format!("{text}\n")})
}

fn error(kind: &str, message: &str) -> Value {
    json!({
        "ename": kind,
        "evalue": message,
        "traceback": [
            "Traceback (most recent call last):",
            format!("\u{1b}[0;31m{kind}\u{1b}[0m: {message}"),
        ],
    })
}

/// In-process fake of a kernel transport.
#[derive(Default)]
pub struct ScriptedKernel {
    kernels: StdMutex<HashMap<KernelHandle, Arc<SimKernel>>>,
}

impl ScriptedKernel {
    /// A transport with one idle kernel, [`DEFAULT_KERNEL`].
    #[must_use]
    pub fn new() -> Self {
        let transport = Self::default();
        transport.add_kernel(DEFAULT_KERNEL);
        transport
    }

    /// Register another kernel.
    pub fn add_kernel(&self, id: &str) {
        if let Ok(mut kernels) = self.kernels.lock() {
            kernels.insert(KernelHandle::new(id), Arc::new(SimKernel::new()));
        }
    }

    /// Pretend the kernel is busy regardless of what it is doing.
    pub fn set_busy(&self, id: &str, busy: bool) {
        if let Some(sim) = self.sim(&KernelHandle::new(id)) {
            sim.forced_busy.store(busy, Ordering::SeqCst);
        }
    }

    /// Code submitted to the kernel, in execution order.
    #[must_use]
    pub fn executed(&self, id: &str) -> Vec<String> {
        self.sim(&KernelHandle::new(id))
            .and_then(|sim| sim.executed.lock().ok().map(|e| e.clone()))
            .unwrap_or_default()
    }

    #[must_use]
    pub fn interrupts(&self, id: &str) -> usize {
        self.sim(&KernelHandle::new(id))
            .map_or(0, |sim| sim.interrupts.load(Ordering::SeqCst))
    }

    #[must_use]
    pub fn restarts(&self, id: &str) -> usize {
        self.sim(&KernelHandle::new(id))
            .map_or(0, |sim| sim.restarts.load(Ordering::SeqCst))
    }

    fn sim(&self, kernel: &KernelHandle) -> Option<Arc<SimKernel>> {
        self.kernels.lock().ok()?.get(kernel).cloned()
    }

    fn require(&self, kernel: &KernelHandle) -> Result<Arc<SimKernel>, TransportError> {
        self.sim(kernel)
            .ok_or_else(|| TransportError::KernelNotFound(kernel.clone()))
    }

    fn info(id: &KernelHandle, sim: &SimKernel) -> KernelInfo {
        let busy = sim.busy.load(Ordering::SeqCst) || sim.forced_busy.load(Ordering::SeqCst);
        KernelInfo {
            id: id.clone(),
            name: "python3".to_string(),
            execution_state: if busy { KernelState::Busy } else { KernelState::Idle },
            last_activity: None,
            connections: 1,
        }
    }
}

#[async_trait]
impl KernelTransport for ScriptedKernel {
    async fn submit(
        &self,
        kernel: &KernelHandle,
        request: SubmitRequest,
    ) -> Result<ExecutionHandle, TransportError> {
        let sim = self.require(kernel)?;
        let handle = ExecutionHandle::new(request.request_id.clone());
        tokio::spawn(sim.run(request.request_id, request.code));
        Ok(handle)
    }

    async fn poll(
        &self,
        kernel: &KernelHandle,
        channel: Channel,
        wait: Duration,
    ) -> Result<Option<KernelMessage>, TransportError> {
        let sim = self.require(kernel)?;
        let rx = match channel {
            Channel::Reply => &sim.replies_rx,
            Channel::Events => &sim.events_rx,
        };
        let mut rx = rx.lock().await;
        match tokio::time::timeout(wait, rx.recv()).await {
            Ok(Some(msg)) => Ok(Some(msg)),
            Ok(None) => Err(TransportError::ChannelClosed(kernel.clone())),
            Err(_) => Ok(None),
        }
    }

    async fn kernel_info(&self, kernel: &KernelHandle) -> Result<Option<KernelInfo>, TransportError> {
        Ok(self.sim(kernel).map(|sim| Self::info(kernel, &sim)))
    }

    async fn list_kernels(&self) -> Result<Vec<KernelInfo>, TransportError> {
        let kernels = self
            .kernels
            .lock()
            .map_err(|e| TransportError::Other(e.to_string()))?;
        let mut infos: Vec<_> = kernels.iter().map(|(id, sim)| Self::info(id, sim)).collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(infos)
    }

    async fn interrupt(&self, kernel: &KernelHandle) -> Result<(), TransportError> {
        let sim = self.require(kernel)?;
        sim.interrupts.fetch_add(1, Ordering::SeqCst);
        sim.interrupt.notify_waiters();
        Ok(())
    }

    async fn restart(&self, kernel: &KernelHandle) -> Result<(), TransportError> {
        let sim = self.require(kernel)?;
        sim.restarts.fetch_add(1, Ordering::SeqCst);
        sim.counter.store(0, Ordering::SeqCst);
        Ok(())
    }
}
