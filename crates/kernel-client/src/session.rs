//! One remote kernel and the requests in flight on it.
//!
//! A session owns the outbound half of the channels socket and two tasks:
//! a reader that decodes frames off the socket, and a dispatcher that routes
//! each decoded message to the pending request named by its
//! `parent_header.msg_id`. Many `execute_code` calls may be in flight on the
//! same session at once; each one resolves independently when the kernel
//! reports `idle` for it.
//!
//! Pending requests leave the registry when they resolve, when their waiter
//! times out, or when the session closes. Closing drops whatever is left,
//! which wakes the waiters with a transport error.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use futures::{future, Sink, SinkExt, Stream, StreamExt};
use log::{debug, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use uuid::Uuid;

use crate::error::{KernelError, Result};
use crate::message::{
    ExceptionRecord, ExecuteEnvelope, KernelMessage, MessageKind, ResultRecord, StreamFragment,
};
use crate::rest::KernelsApi;

/// Outbound half of a channels transport: JSON text frames.
pub type FrameSink = Pin<Box<dyn Sink<String, Error = KernelError> + Send>>;

/// Inbound half of a channels transport: JSON text frames.
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Everything one submission produced.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExecutionOutput {
    pub results: Vec<ResultRecord>,
    pub exceptions: Vec<ExceptionRecord>,
}

struct PendingRequest {
    code: String,
    output: ExecutionOutput,
    /// Last stream chunk not yet attached to a result.
    pending_stream: Option<StreamFragment>,
    done: oneshot::Sender<ExecutionOutput>,
}

type Registry = Arc<StdMutex<HashMap<String, PendingRequest>>>;

fn lock(
    registry: &StdMutex<HashMap<String, PendingRequest>>,
) -> MutexGuard<'_, HashMap<String, PendingRequest>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct KernelSession {
    id: String,
    session_id: String,
    sink: Mutex<FrameSink>,
    registry: Registry,
    reader_task: StdMutex<Option<JoinHandle<()>>>,
    dispatcher_task: StdMutex<Option<JoinHandle<()>>>,
    api: Option<KernelsApi>,
    execute_timeout: Option<Duration>,
    preamble: OnceLock<String>,
    closed: AtomicBool,
}

impl std::fmt::Debug for KernelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelSession")
            .field("id", &self.id)
            .field("session_id", &self.session_id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl KernelSession {
    /// Create a kernel on the server and connect to its channels.
    ///
    /// If the channels handshake fails the kernel is deleted again before the
    /// error is returned.
    pub async fn create(api: &KernelsApi) -> Result<Arc<Self>> {
        let kernel_id = api.create_kernel().await?;
        let session_id = Uuid::new_v4().to_string();

        let socket = match api.connect_channels(&kernel_id, &session_id).await {
            Ok(socket) => socket,
            Err(e) => {
                if let Err(delete_err) = api.delete_kernel(&kernel_id).await {
                    warn!(
                        "[kernel] Failed to delete kernel {} after handshake error: {}",
                        kernel_id, delete_err
                    );
                }
                return Err(e);
            }
        };

        let (ws_sink, ws_stream) = socket.split();

        let sink = ws_sink
            .with(|text: String| {
                future::ready(Ok::<_, tokio_tungstenite::tungstenite::Error>(WsMessage::Text(
                    text,
                )))
            })
            .sink_map_err(|e: tokio_tungstenite::tungstenite::Error| {
                KernelError::Transport(e.to_string())
            });

        let stream = ws_stream.filter_map(|frame| {
            future::ready(match frame {
                Ok(WsMessage::Text(text)) => Some(Ok(text)),
                Ok(WsMessage::Binary(bytes)) => String::from_utf8(bytes).ok().map(Ok),
                Ok(_) => None,
                Err(e) => Some(Err(KernelError::Transport(e.to_string()))),
            })
        });

        Ok(Self::spawn(
            kernel_id,
            session_id,
            Box::pin(sink),
            Box::pin(stream),
            Some(api.clone()),
            api.config().execute_timeout,
        ))
    }

    /// Run a session over an already-established transport.
    ///
    /// Closing such a session closes the transport but issues no REST call.
    pub fn from_transport(
        kernel_id: impl Into<String>,
        sink: FrameSink,
        stream: FrameStream,
        execute_timeout: Option<Duration>,
    ) -> Arc<Self> {
        Self::spawn(
            kernel_id.into(),
            Uuid::new_v4().to_string(),
            sink,
            stream,
            None,
            execute_timeout,
        )
    }

    fn spawn(
        id: String,
        session_id: String,
        sink: FrameSink,
        mut stream: FrameStream,
        api: Option<KernelsApi>,
        execute_timeout: Option<Duration>,
    ) -> Arc<Self> {
        let registry: Registry = Arc::new(StdMutex::new(HashMap::new()));
        let (tx, mut rx) = mpsc::unbounded_channel::<KernelMessage>();

        let reader_id = id.clone();
        let reader_task = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let text = match frame {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("[kernel {}] Channel read error: {}", reader_id, e);
                        break;
                    }
                };
                debug!("[kernel {}] <- {}", reader_id, text);

                match KernelMessage::from_json(&text) {
                    Ok(message) => {
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("[kernel {}] Dropping message: {}", reader_id, e),
                }
            }
            debug!("[kernel {}] Reader finished", reader_id);
        });

        let dispatcher_registry = registry.clone();
        let dispatcher_id = id.clone();
        let dispatcher_task = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                dispatch(&dispatcher_registry, &dispatcher_id, message);
            }
            // Channel gone: nothing will ever resolve what is left.
            let abandoned = lock(&dispatcher_registry).drain().count();
            if abandoned > 0 {
                warn!(
                    "[kernel {}] Channel closed with {} request(s) in flight",
                    dispatcher_id, abandoned
                );
            }
        });

        Arc::new(KernelSession {
            id,
            session_id,
            sink: Mutex::new(sink),
            registry,
            reader_task: StdMutex::new(Some(reader_task)),
            dispatcher_task: StdMutex::new(Some(dispatcher_task)),
            api,
            execute_timeout,
            preamble: OnceLock::new(),
            closed: AtomicBool::new(false),
        })
    }

    /// Kernel id assigned by the server.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Client session id stamped on outbound headers.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of requests still waiting for an idle status.
    pub fn pending_requests(&self) -> usize {
        lock(&self.registry).len()
    }

    /// Code this session was initialized with, if it came from a pool.
    pub fn preamble(&self) -> Option<&str> {
        self.preamble.get().map(String::as_str)
    }

    /// Record the preamble this session was initialized with. Only the first
    /// call has any effect.
    pub(crate) fn mark_initialized(&self, preamble: &str) {
        let _ = self.preamble.set(preamble.to_string());
    }

    /// Execute code and wait until the kernel reports idle for it.
    ///
    /// Blank code resolves immediately without touching the socket.
    pub async fn execute_code(&self, code: &str) -> Result<ExecutionOutput> {
        if code.trim().is_empty() {
            return Ok(ExecutionOutput::default());
        }
        if self.is_closed() {
            return Err(KernelError::Transport(format!(
                "kernel {} is closed",
                self.id
            )));
        }

        let envelope = ExecuteEnvelope::new(code, &self.session_id);
        let msg_id = envelope.msg_id().to_string();
        let frame = envelope.to_json()?;

        let (tx, rx) = oneshot::channel();
        lock(&self.registry).insert(
            msg_id.clone(),
            PendingRequest {
                code: code.to_string(),
                output: ExecutionOutput::default(),
                pending_stream: None,
                done: tx,
            },
        );

        let sent = self.sink.lock().await.send(frame).await;
        if let Err(e) = sent {
            lock(&self.registry).remove(&msg_id);
            return Err(e);
        }
        debug!("[kernel {}] Sent execute_request msg_id={}", self.id, msg_id);

        let outcome = match self.execute_timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    lock(&self.registry).remove(&msg_id);
                    warn!(
                        "[kernel {}] msg_id={} still running after {:?}, giving up",
                        self.id, msg_id, limit
                    );
                    return Err(KernelError::Timeout(limit));
                }
            },
            None => rx.await,
        };

        outcome.map_err(|_| {
            KernelError::Transport(format!(
                "kernel {} closed before msg_id={} finished",
                self.id, msg_id
            ))
        })
    }

    /// Tear the session down: close the channel, then delete the kernel.
    ///
    /// Only the first call does anything. Both steps are always attempted and
    /// failures are logged rather than returned.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("[kernel] Closing kernel {}", self.id);

        if let Err(e) = self.sink.lock().await.close().await {
            warn!("[kernel {}] Failed to close channel: {}", self.id, e);
        }
        self.abort_tasks();
        lock(&self.registry).clear();

        if let Some(api) = &self.api {
            if let Err(e) = api.delete_kernel(&self.id).await {
                warn!("[kernel {}] Failed to delete kernel: {}", self.id, e);
            }
        }
    }

    fn abort_tasks(&self) {
        for slot in [&self.reader_task, &self.dispatcher_task] {
            if let Some(task) = slot.lock().unwrap_or_else(PoisonError::into_inner).take() {
                task.abort();
            }
        }
    }
}

impl Drop for KernelSession {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

/// Route one inbound message to the request it answers.
fn dispatch(
    registry: &StdMutex<HashMap<String, PendingRequest>>,
    kernel_id: &str,
    message: KernelMessage,
) {
    let Some(parent) = message.parent_msg_id.as_deref() else {
        return;
    };
    let mut registry = lock(registry);

    if message.kind == MessageKind::Status {
        match message.execution_state() {
            Ok(state) if state == "idle" => {
                if let Some(mut request) = registry.remove(parent) {
                    // Console text that never got a result to ride on.
                    if let Some(stream) = request.pending_stream.take() {
                        request.output.results.push(ResultRecord {
                            stream: Some(stream),
                            ..Default::default()
                        });
                    }
                    debug!(
                        "[kernel {}] msg_id={} idle ({} results, {} exceptions) for {:?}",
                        kernel_id,
                        parent,
                        request.output.results.len(),
                        request.output.exceptions.len(),
                        request.code
                    );
                    let _ = request.done.send(request.output);
                }
            }
            Ok(_) => {}
            Err(e) => warn!("[kernel {}] {}", kernel_id, e),
        }
        return;
    }

    let Some(request) = registry.get_mut(parent) else {
        return;
    };

    match &message.kind {
        MessageKind::Stream => match message.stream_fragment() {
            Ok(stream) => request.pending_stream = Some(stream),
            Err(e) => warn!("[kernel {}] {}", kernel_id, e),
        },
        MessageKind::ExecuteResult | MessageKind::DisplayData => match message.result_record() {
            Ok(mut record) => {
                record.stream = request.pending_stream.take();
                request.output.results.push(record);
            }
            Err(e) => warn!("[kernel {}] {}", kernel_id, e),
        },
        MessageKind::ExecuteReply => {
            if let Some(stream) = request.pending_stream.take() {
                request.output.results.push(ResultRecord {
                    stream: Some(stream),
                    ..Default::default()
                });
            }
        }
        MessageKind::Error => match message.exception_record() {
            Ok(exception) => request.output.exceptions.push(exception),
            Err(e) => warn!("[kernel {}] {}", kernel_id, e),
        },
        MessageKind::Status | MessageKind::Other(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{channel_transport, envelope, spawn_fake_session};
    use serde_json::{json, Value};

    fn msg(text: String) -> KernelMessage {
        KernelMessage::from_json(&text).unwrap()
    }

    fn register(registry: &Registry, msg_id: &str) -> oneshot::Receiver<ExecutionOutput> {
        let (tx, rx) = oneshot::channel();
        lock(registry).insert(
            msg_id.to_string(),
            PendingRequest {
                code: String::new(),
                output: ExecutionOutput::default(),
                pending_stream: None,
                done: tx,
            },
        );
        rx
    }

    #[tokio::test]
    async fn test_dispatch_correlates_interleaved_requests() {
        let registry: Registry = Arc::new(StdMutex::new(HashMap::new()));
        let rx_a = register(&registry, "a");
        let rx_b = register(&registry, "b");

        let data = |v: &str| json!({"data": {"text/plain": v}, "metadata": {}});
        let frames = vec![
            envelope("status", Some("a"), json!({"execution_state": "busy"})),
            envelope("status", Some("b"), json!({"execution_state": "busy"})),
            envelope("stream", Some("b"), json!({"name": "stdout", "text": "from b"})),
            envelope("execute_result", Some("a"), data("A1")),
            envelope("error", Some("a"), json!({"ename": "KeyError", "evalue": "k", "traceback": []})),
            envelope("display_data", Some("b"), data("B1")),
            envelope("execute_result", Some("stray"), data("S")),
            envelope("status", Some("b"), json!({"execution_state": "idle"})),
            envelope("execute_result", Some("a"), data("A2")),
            envelope("status", Some("a"), json!({"execution_state": "idle"})),
        ];
        for frame in frames {
            dispatch(&registry, "test", msg(frame));
        }

        let a = rx_a.await.unwrap();
        let b = rx_b.await.unwrap();

        let texts = |out: &ExecutionOutput| -> Vec<Value> {
            out.results
                .iter()
                .map(|r| r.data.get("text/plain").cloned().unwrap_or(Value::Null))
                .collect()
        };
        assert_eq!(texts(&a), vec![json!("A1"), json!("A2")]);
        assert_eq!(a.exceptions.len(), 1);
        assert_eq!(a.exceptions[0].ename, "KeyError");
        assert!(a.results.iter().all(|r| r.stream.is_none()));

        assert_eq!(texts(&b), vec![json!("B1")]);
        assert!(b.exceptions.is_empty());
        assert_eq!(b.results[0].stream.as_ref().unwrap().text, "from b");

        assert!(lock(&registry).is_empty());
    }

    #[tokio::test]
    async fn test_stream_is_overwritten_not_merged() {
        let registry: Registry = Arc::new(StdMutex::new(HashMap::new()));
        let rx = register(&registry, "r");

        for text in ["one", "two"] {
            dispatch(
                &registry,
                "test",
                msg(envelope("stream", Some("r"), json!({"name": "stdout", "text": text}))),
            );
        }
        dispatch(&registry, "test", msg(envelope("execute_reply", Some("r"), json!({"status": "ok"}))));
        dispatch(&registry, "test", msg(envelope("status", Some("r"), json!({"execution_state": "idle"}))));

        let out = rx.await.unwrap();
        assert_eq!(out.results.len(), 1);
        assert!(out.results[0].data.is_empty());
        assert_eq!(out.results[0].stream.as_ref().unwrap().text, "two");
    }

    #[tokio::test]
    async fn test_stream_flushed_on_idle_before_reply() {
        let registry: Registry = Arc::new(StdMutex::new(HashMap::new()));
        let rx = register(&registry, "r");

        dispatch(&registry, "test", msg(envelope("stream", Some("r"), json!({"name": "stdout", "text": "hi\n"}))));
        dispatch(&registry, "test", msg(envelope("status", Some("r"), json!({"execution_state": "idle"}))));
        dispatch(&registry, "test", msg(envelope("execute_reply", Some("r"), json!({"status": "ok"}))));

        let out = rx.await.unwrap();
        assert_eq!(out.results.len(), 1);
        assert!(out.results[0].data.is_empty());
        assert_eq!(out.results[0].stream.as_ref().unwrap().text, "hi\n");
        assert!(out.exceptions.is_empty());
        assert!(lock(&registry).is_empty());
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dropped() {
        let registry: Registry = Arc::new(StdMutex::new(HashMap::new()));
        let rx = register(&registry, "r");

        dispatch(&registry, "test", msg(envelope("execute_result", Some("r"), json!({"data": 5}))));
        dispatch(&registry, "test", msg(envelope("execute_result", Some("r"), json!({"data": {"text/plain": "ok"}}))));
        dispatch(&registry, "test", msg(envelope("status", Some("r"), json!({"execution_state": "idle"}))));

        let out = rx.await.unwrap();
        assert_eq!(out.results.len(), 1);
        assert_eq!(out.results[0].data["text/plain"], json!("ok"));
    }

    #[tokio::test]
    async fn test_execute_sum() {
        let (session, _kernel) = spawn_fake_session("fake-1", None);
        let out = session.execute_code("1+1").await.unwrap();

        assert_eq!(out.results.len(), 1);
        assert_eq!(out.results[0].data["text/plain"], json!("2"));
        assert!(out.results[0].stream.is_none());
        assert!(out.exceptions.is_empty());
        assert_eq!(session.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_execute_raise() {
        let (session, _kernel) = spawn_fake_session("fake-2", None);
        let out = session.execute_code("raise ValueError('x')").await.unwrap();

        assert!(out.results.is_empty());
        assert_eq!(out.exceptions.len(), 1);
        assert_eq!(out.exceptions[0].ename, "ValueError");
        assert_eq!(out.exceptions[0].evalue, "x");
    }

    #[tokio::test]
    async fn test_print_output_is_kept() {
        let (session, _kernel) = spawn_fake_session("fake-3", None);
        let out = session.execute_code("print('hi')").await.unwrap();

        assert_eq!(out.results.len(), 1);
        let stream = out.results[0].stream.as_ref().unwrap();
        assert_eq!(stream.name, "stdout");
        assert_eq!(stream.text, "hi\n");
    }

    #[tokio::test]
    async fn test_blank_code_skips_round_trip() {
        let (session, kernel) = spawn_fake_session("fake-4", None);
        let out = session.execute_code("  \n\t").await.unwrap();

        assert_eq!(out, ExecutionOutput::default());
        assert!(kernel.executed().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_submissions_resolve_independently() {
        let (session, _kernel) = spawn_fake_session("fake-5", None);

        let (a, b, c) = tokio::join!(
            session.execute_code("1+2"),
            session.execute_code("raise KeyError('k')"),
            session.execute_code("20+22"),
        );

        assert_eq!(a.unwrap().results[0].data["text/plain"], json!("3"));
        assert_eq!(b.unwrap().exceptions[0].ename, "KeyError");
        assert_eq!(c.unwrap().results[0].data["text/plain"], json!("42"));
    }

    #[tokio::test]
    async fn test_timeout_unregisters_request() {
        let (session, _kernel) = spawn_fake_session("fake-6", Some(Duration::from_millis(50)));
        let result = session.execute_code("while True: pass").await;

        assert!(matches!(result, Err(KernelError::Timeout(_))));
        assert_eq!(session.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_close_wakes_waiters_and_rejects_new_work() {
        let (session, _kernel) = spawn_fake_session("fake-7", None);

        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.execute_code("while True: pass").await })
        };
        while session.pending_requests() == 0 {
            tokio::task::yield_now().await;
        }

        session.close().await;
        session.close().await;

        let result = waiter.await.unwrap();
        assert!(matches!(result, Err(KernelError::Transport(_))));
        assert!(session.is_closed());
        assert!(matches!(
            session.execute_code("1+1").await,
            Err(KernelError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_send_failure_is_transport_error() {
        let (sink, stream, manual) = channel_transport();
        let session = KernelSession::from_transport("manual", sink, stream, None);
        drop(manual);

        let result = session.execute_code("1+1").await;
        assert!(matches!(result, Err(KernelError::Transport(_))));
        assert_eq!(session.pending_requests(), 0);
    }

    #[tokio::test]
    async fn test_undecodable_frames_do_not_stop_the_reader() {
        let (sink, stream, mut manual) = channel_transport();
        let session = KernelSession::from_transport("manual", sink, stream, None);

        let exec = {
            let session = session.clone();
            tokio::spawn(async move { session.execute_code("anything").await })
        };

        let request = manual.next_request().await.unwrap();
        let msg_id = request["header"]["msg_id"].as_str().unwrap().to_string();

        manual.push("this is not json".to_string());
        manual.push(envelope("execute_result", Some(&msg_id), json!({"data": {"text/plain": "7"}})));
        manual.push(envelope("status", Some(&msg_id), json!({"execution_state": "idle"})));

        let out = exec.await.unwrap().unwrap();
        assert_eq!(out.results[0].data["text/plain"], json!("7"));
    }
}
