//! In-memory kernels for tests.
//!
//! [`spawn_fake_session`] wires a [`KernelSession`] to a task that speaks the
//! channels protocol over in-process channels and understands a tiny subset
//! of Python: integer sums (`1+1`), `print(...)`, `raise Name('msg')`, and
//! `while True` (never finishes). Every line is otherwise accepted silently.
//! [`FakeLauncher`] hands those sessions to a pool.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::future::BoxFuture;
use futures::{Sink, SinkExt, StreamExt};
use serde_json::{json, Value};

use crate::error::{KernelError, Result};
use crate::launcher::KernelLauncher;
use crate::session::{FrameSink, FrameStream, KernelSession};

/// Build an inbound envelope as a Jupyter server would send it.
pub fn envelope(msg_type: &str, parent_msg_id: Option<&str>, content: Value) -> String {
    let parent_header = match parent_msg_id {
        Some(msg_id) => json!({
            "date": "2025-05-14T14:32:23.000Z",
            "msg_id": msg_id,
            "msg_type": "execute_request",
            "session": "client-session",
            "username": "",
            "version": "5.3"
        }),
        None => json!({}),
    };

    json!({
        "header": {
            "date": "2025-05-14T14:32:23.490Z",
            "msg_id": uuid::Uuid::new_v4().to_string(),
            "msg_type": msg_type,
            "session": "fake-kernel-session",
            "username": "",
            "version": "5.3"
        },
        "parent_header": parent_header,
        "metadata": {},
        "content": content,
        "buffers": [],
        "channel": if msg_type == "execute_reply" { "shell" } else { "iopub" }
    })
    .to_string()
}

/// The kernel side of an in-memory transport.
pub struct ManualKernel {
    outbound: UnboundedReceiver<String>,
    inbound: UnboundedSender<String>,
}

impl ManualKernel {
    /// Next request the session sent, parsed as JSON.
    pub async fn next_request(&mut self) -> Option<Value> {
        let frame = self.outbound.next().await?;
        serde_json::from_str(&frame).ok()
    }

    /// Deliver a raw frame to the session.
    pub fn push(&self, frame: String) {
        let _ = self.inbound.unbounded_send(frame);
    }
}

/// A connected sink/stream pair plus the kernel end that drives it.
pub fn channel_transport() -> (FrameSink, FrameStream, ManualKernel) {
    let (out_tx, out_rx) = unbounded::<String>();
    let (in_tx, in_rx) = unbounded::<String>();

    let sink = out_tx.sink_map_err(|e| KernelError::Transport(e.to_string()));
    let stream = in_rx.map(Ok);

    (
        Box::pin(sink),
        Box::pin(stream),
        ManualKernel {
            outbound: out_rx,
            inbound: in_tx,
        },
    )
}

/// A sink whose close never completes, like a socket to a wedged server.
struct StalledClose(FrameSink);

impl Sink<String> for StalledClose {
    type Error = KernelError;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.0.as_mut().poll_ready(cx)
    }

    fn start_send(mut self: Pin<&mut Self>, item: String) -> Result<()> {
        self.0.as_mut().start_send(item)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.0.as_mut().poll_flush(cx)
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Pending
    }
}

/// Observes what a fake kernel was asked to run.
#[derive(Clone, Default)]
pub struct FakeKernel {
    executed: Arc<StdMutex<Vec<String>>>,
}

impl FakeKernel {
    /// Every code string received over the wire, in arrival order.
    pub fn executed(&self) -> Vec<String> {
        self.executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Start a session backed by a scripted in-process kernel.
pub fn spawn_fake_session(
    kernel_id: &str,
    execute_timeout: Option<Duration>,
) -> (Arc<KernelSession>, FakeKernel) {
    spawn_session(kernel_id, execute_timeout, false)
}

fn spawn_session(
    kernel_id: &str,
    execute_timeout: Option<Duration>,
    stall_close: bool,
) -> (Arc<KernelSession>, FakeKernel) {
    let kernel = FakeKernel::default();
    let (sink, stream, manual) = channel_transport();
    let sink: FrameSink = if stall_close {
        Box::pin(StalledClose(sink))
    } else {
        sink
    };
    tokio::spawn(run_fake_kernel(manual, kernel.clone()));
    (
        KernelSession::from_transport(kernel_id, sink, stream, execute_timeout),
        kernel,
    )
}

async fn run_fake_kernel(mut manual: ManualKernel, kernel: FakeKernel) {
    while let Some(request) = manual.next_request().await {
        let msg_id = request["header"]["msg_id"].as_str().unwrap_or_default().to_string();
        let code = request["content"]["code"].as_str().unwrap_or_default().to_string();
        kernel
            .executed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(code.clone());

        let parent = Some(msg_id.as_str());
        manual.push(envelope("status", parent, json!({"execution_state": "busy"})));
        manual.push(envelope("execute_input", parent, json!({"code": code})));

        if code.contains("while True") {
            continue;
        }

        let mut status = "ok";
        for line in code.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if let Some(arg) = line.strip_prefix("print(").and_then(|l| l.strip_suffix(')')) {
                let text = format!("{}\n", unquote(arg));
                manual.push(envelope(
                    "stream",
                    parent,
                    json!({"name": "stdout", "text": text}),
                ));
            } else if let Some(raised) = line.strip_prefix("raise ") {
                let (ename, evalue) = parse_raise(raised);
                manual.push(envelope(
                    "error",
                    parent,
                    json!({
                        "ename": ename,
                        "evalue": evalue,
                        "traceback": [
                            "\u{1b}[0;31m---------------------------------------------------------------------------\u{1b}[0m",
                            format!("\u{1b}[0;31m{}\u{1b}[0m: {}", ename, evalue),
                        ]
                    }),
                ));
                status = "error";
                break;
            } else if let Some(sum) = eval_sum(line) {
                manual.push(envelope(
                    "execute_result",
                    parent,
                    json!({
                        "data": {"text/plain": sum.to_string()},
                        "metadata": {},
                        "execution_count": 1
                    }),
                ));
            }
        }

        // iopub idle usually overtakes the shell reply on a real server.
        manual.push(envelope("status", parent, json!({"execution_state": "idle"})));
        manual.push(envelope(
            "execute_reply",
            parent,
            json!({"status": status, "execution_count": 1}),
        ));
    }
}

fn unquote(arg: &str) -> &str {
    let arg = arg.trim();
    arg.strip_prefix('\'')
        .and_then(|a| a.strip_suffix('\''))
        .or_else(|| arg.strip_prefix('"').and_then(|a| a.strip_suffix('"')))
        .unwrap_or(arg)
}

fn parse_raise(raised: &str) -> (String, String) {
    match raised.split_once('(') {
        Some((name, rest)) => (
            name.trim().to_string(),
            unquote(rest.trim_end_matches(')')).to_string(),
        ),
        None => (raised.trim().to_string(), String::new()),
    }
}

fn eval_sum(line: &str) -> Option<i64> {
    line.split('+')
        .map(|term| term.trim().parse::<i64>().ok())
        .sum()
}

/// Launches fake sessions, optionally slowly or not at all.
#[derive(Default)]
pub struct FakeLauncher {
    launched: AtomicUsize,
    failing: AtomicBool,
    stall_close: AtomicBool,
    delay: StdMutex<Option<Duration>>,
    kernels: StdMutex<Vec<(Arc<KernelSession>, FakeKernel)>>,
}

impl FakeLauncher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Sleep this long before every launch completes.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock().unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Make every launch fail with a connection error.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Sessions launched from now on never finish closing.
    pub fn set_close_stalls(&self, stalls: bool) {
        self.stall_close.store(stalls, Ordering::SeqCst);
    }

    pub fn launched(&self) -> usize {
        self.launched.load(Ordering::SeqCst)
    }

    /// Every session launched so far with the kernel backing it.
    pub fn sessions(&self) -> Vec<(Arc<KernelSession>, FakeKernel)> {
        self.kernels
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// All code received by every launched kernel.
    pub fn executed(&self) -> Vec<String> {
        self.sessions()
            .iter()
            .flat_map(|(_, kernel)| kernel.executed())
            .collect()
    }
}

impl KernelLauncher for FakeLauncher {
    fn launch(&self) -> BoxFuture<'_, Result<Arc<KernelSession>>> {
        Box::pin(async move {
            let delay = *self.delay.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            if self.failing.load(Ordering::SeqCst) {
                return Err(KernelError::Connection("fake launcher is failing".into()));
            }

            let n = self.launched.fetch_add(1, Ordering::SeqCst);
            let stall_close = self.stall_close.load(Ordering::SeqCst);
            let (session, kernel) = spawn_session(&format!("fake-{}", n), None, stall_close);
            self.kernels
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((session.clone(), kernel));
            Ok(session)
        })
    }
}
