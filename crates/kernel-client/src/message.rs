//! Envelope codec for the Jupyter server's `/channels` WebSocket.
//!
//! Inbound frames are decoded in two steps, the same way the notebook
//! frontends do it: the envelope is parsed first with `content` kept as raw
//! JSON, and the content is only decoded into a typed payload once the
//! dispatcher knows which shape it needs. A bad payload therefore fails only
//! the message it came in, never the stream.

use jupyter_protocol::{ExecuteRequest, Header, JupyterMessage};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{KernelError, Result};
use crate::traceback::render_traceback;

/// Inbound message kinds the session cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageKind {
    Stream,
    ExecuteResult,
    DisplayData,
    ExecuteReply,
    Error,
    Status,
    /// Anything else (`execute_input`, `comm_msg`, ...). Ignored.
    Other(String),
}

impl MessageKind {
    pub fn from_msg_type(msg_type: &str) -> Self {
        match msg_type {
            "stream" => MessageKind::Stream,
            "execute_result" => MessageKind::ExecuteResult,
            "display_data" => MessageKind::DisplayData,
            "execute_reply" => MessageKind::ExecuteReply,
            "error" => MessageKind::Error,
            "status" => MessageKind::Status,
            other => MessageKind::Other(other.to_string()),
        }
    }
}

/// Envelope as it arrives on the wire, content still untyped.
///
/// `parent_header` may be `{}`, `null`, or a full header.
#[derive(Debug, Clone, Deserialize)]
pub struct RawKernelMessage {
    pub header: Header,

    #[serde(
        default,
        deserialize_with = "jupyter_protocol::deserialize_parent_header"
    )]
    pub parent_header: Option<Header>,

    #[serde(default)]
    pub metadata: Value,

    #[serde(default)]
    pub content: Value,

    #[serde(default)]
    pub channel: Option<String>,
}

/// A decoded inbound message: kind, free-form content, correlation id.
#[derive(Debug, Clone)]
pub struct KernelMessage {
    pub kind: MessageKind,
    pub content: Map<String, Value>,
    /// `parent_header.msg_id`, i.e. the id of the request this answers.
    pub parent_msg_id: Option<String>,
}

impl TryFrom<RawKernelMessage> for KernelMessage {
    type Error = KernelError;

    fn try_from(raw: RawKernelMessage) -> Result<Self> {
        let content = match raw.content {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(KernelError::Protocol(format!(
                    "{} content is not an object: {}",
                    raw.header.msg_type, other
                )))
            }
        };

        Ok(KernelMessage {
            kind: MessageKind::from_msg_type(&raw.header.msg_type),
            content,
            parent_msg_id: raw.parent_header.map(|h| h.msg_id),
        })
    }
}

/// A chunk of stdout/stderr text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamFragment {
    pub name: String,
    pub text: String,
}

/// One rich result: `execute_result`, `display_data`, or a bare reply.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResultRecord {
    /// MIME type → payload.
    pub data: Map<String, Value>,
    pub metadata: Map<String, Value>,
    /// Most recent stream chunk seen before this result, if any.
    pub stream: Option<StreamFragment>,
}

/// An exception raised by user code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExceptionRecord {
    pub ename: String,
    pub evalue: String,
    /// Raw traceback lines, ANSI escapes included.
    pub traceback: Vec<String>,
    /// Traceback rendered as escaped, colorized HTML.
    pub traceback_html: String,
}

#[derive(Deserialize)]
struct ResultPayload {
    data: Map<String, Value>,
    #[serde(default)]
    metadata: Map<String, Value>,
}

#[derive(Deserialize)]
struct ErrorPayload {
    ename: String,
    evalue: String,
    #[serde(default)]
    traceback: Vec<String>,
}

#[derive(Deserialize)]
struct StatusPayload {
    execution_state: String,
}

impl KernelMessage {
    /// Parse one text frame.
    pub fn from_json(text: &str) -> Result<Self> {
        let raw: RawKernelMessage = serde_json::from_str(text)
            .map_err(|e| KernelError::Protocol(format!("malformed envelope: {}", e)))?;
        raw.try_into()
    }

    fn decode<T: DeserializeOwned>(&self, what: &str) -> Result<T> {
        serde_json::from_value(Value::Object(self.content.clone()))
            .map_err(|e| KernelError::Protocol(format!("malformed {} content: {}", what, e)))
    }

    pub fn stream_fragment(&self) -> Result<StreamFragment> {
        self.decode("stream")
    }

    /// Decode an `execute_result` / `display_data` payload. The stream
    /// fragment is left empty for the caller to attach.
    pub fn result_record(&self) -> Result<ResultRecord> {
        let payload: ResultPayload = self.decode("result")?;
        Ok(ResultRecord {
            data: payload.data,
            metadata: payload.metadata,
            stream: None,
        })
    }

    pub fn exception_record(&self) -> Result<ExceptionRecord> {
        let payload: ErrorPayload = self.decode("error")?;
        Ok(ExceptionRecord {
            traceback_html: render_traceback(&payload.traceback),
            ename: payload.ename,
            evalue: payload.evalue,
            traceback: payload.traceback,
        })
    }

    /// `execution_state` of a `status` message (`busy`, `idle`, ...).
    pub fn execution_state(&self) -> Result<String> {
        let payload: StatusPayload = self.decode("status")?;
        Ok(payload.execution_state)
    }
}

/// Content of an outbound `execute_request`.
#[derive(Debug, Clone, Serialize)]
pub struct ExecuteContent {
    pub code: String,
    pub silent: bool,
    pub store_history: bool,
    pub allow_stdin: bool,
    pub stop_on_error: bool,
    pub user_expressions: Map<String, Value>,
}

/// Outbound `execute_request` envelope, ready to serialize onto the socket.
#[derive(Debug, Clone, Serialize)]
pub struct ExecuteEnvelope {
    pub header: Header,
    pub parent_header: Map<String, Value>,
    pub metadata: Map<String, Value>,
    pub content: ExecuteContent,
    pub buffers: Vec<Value>,
    pub channel: &'static str,
}

impl ExecuteEnvelope {
    /// Build a request with a fresh msg_id, stamped with the client session.
    pub fn new(code: &str, session_id: &str) -> Self {
        let message: JupyterMessage = ExecuteRequest::new(code.to_string()).into();
        let mut header = message.header;
        header.session = session_id.to_string();

        ExecuteEnvelope {
            header,
            parent_header: Map::new(),
            metadata: Map::new(),
            content: ExecuteContent {
                code: code.to_string(),
                silent: false,
                store_history: false,
                allow_stdin: false,
                stop_on_error: true,
                user_expressions: Map::new(),
            },
            buffers: Vec::new(),
            channel: "shell",
        }
    }

    pub fn msg_id(&self) -> &str {
        &self.header.msg_id
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
