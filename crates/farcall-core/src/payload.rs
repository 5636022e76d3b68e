//! Payload envelope
//!
//! Every message on the wire is exactly one [`Payload`], serialized as
//! `{"kind": "<kind>", "content": <body>}`. The kind set is closed: the
//! dispatcher and the proxy match on it exhaustively.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::codec::{CacheId, CallbackId, Map, Reference, Value};

/// Version of the wire protocol spoken by this crate
pub const PROTOCOL_VERSION: &str = "1";

/// The single envelope type exchanged over a connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "content", rename_all = "snake_case")]
pub enum Payload {
    /// Client → server: register a function and obtain its reference
    Function(FunctionRequest),
    /// Client → server: invoke a function reference
    Call(CallRequest),
    /// Client → server: store data and obtain its reference
    Cache(CacheRequest),
    /// Client → server: unwrap a reference to inlined data
    Get(GetRequest),
    /// Client → server: administrative command
    Control(ControlCommand),
    /// Terminal success. Also the client's answer to a callback request.
    Result(Value),
    /// Terminal failure. Also the client's answer to a failed callback.
    Error(RemoteError),
    /// Server → client, non-terminal: run a client-held callable
    Callback(CallbackRequest),
    /// Server → client, non-terminal: log line or task lifecycle event
    Listen(ListenEvent),
}

impl Payload {
    /// Wire name of this payload's kind
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Function(_) => "function",
            Payload::Call(_) => "call",
            Payload::Cache(_) => "cache",
            Payload::Get(_) => "get",
            Payload::Control(_) => "control",
            Payload::Result(_) => "result",
            Payload::Error(_) => "error",
            Payload::Callback(_) => "callback",
            Payload::Listen(_) => "listen",
        }
    }

    /// Whether this payload ends a client-initiated exchange
    pub fn is_terminal(&self) -> bool {
        matches!(self, Payload::Result(_) | Payload::Error(_))
    }
}

/// Where a function comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum FunctionTarget {
    /// A function resolved by qualified name (e.g. `geometry.transform_points`)
    Package { name: String },
    /// Source text defined through the trusted-execution evaluator
    Source { name: String, source: String },
}

impl FunctionTarget {
    pub fn name(&self) -> &str {
        match self {
            FunctionTarget::Package { name } | FunctionTarget::Source { name, .. } => name,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionRequest {
    pub target: FunctionTarget,
    #[serde(default)]
    pub cache_result: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRequest {
    pub function: Reference,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRequest {
    pub data: Value,
    /// Caller-chosen id; the store generates one when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_id: Option<CacheId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetRequest {
    pub reference: Reference,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackRequest {
    pub id: CallbackId,
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Map,
}

/// Administrative commands
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
pub enum ControlCommand {
    /// Liveness probe; answered with `"ok"`
    Check,
    /// Close the connection, then terminate the server process
    Shutdown,
    /// Terminate the server once this connection closes
    Once,
    /// Report installed package versions
    Version,
    /// Drive the per-connection task runner
    Sessions { request: SessionsRequest },
}

/// Task runner actions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SessionsRequest {
    Create {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        worker_num: Option<usize>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        log_dir: Option<String>,
    },
    AddTask {
        function: Reference,
        #[serde(default)]
        args: Vec<Value>,
        #[serde(default)]
        kwargs: Map,
    },
    Start,
    Listen,
    Terminate,
}

/// Error categories reported by the server
pub mod error_type {
    pub const UNKNOWN_REFERENCE: &str = "unknown_reference";
    pub const UNRESOLVED_FUNCTION: &str = "unresolved_function";
    pub const NOT_A_FUNCTION: &str = "not_a_function";
    pub const NOT_DATA: &str = "not_data";
    pub const FUNCTION: &str = "function";
    pub const DECODE: &str = "decode";
    pub const INVALID_REQUEST: &str = "invalid_request";
    pub const TRUSTED_EXECUTION_DISABLED: &str = "trusted_execution_disabled";
    pub const SESSIONS: &str = "sessions";
    pub const CALLBACK: &str = "callback";
}

/// Structured description of a failure on the other side of the connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub error_type: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_id: Option<CacheId>,
    /// Chain of underlying causes, outermost first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub trace: Vec<String>,
}

impl RemoteError {
    pub fn new(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            message: message.into(),
            cache_id: None,
            trace: Vec::new(),
        }
    }

    /// Build from an error value, recording its `source()` chain
    pub fn from_error(error_type: impl Into<String>, error: &dyn std::error::Error) -> Self {
        let mut trace = Vec::new();
        let mut source = error.source();
        while let Some(cause) = source {
            trace.push(cause.to_string());
            source = cause.source();
        }
        Self {
            error_type: error_type.into(),
            message: error.to_string(),
            cache_id: None,
            trace,
        }
    }

    pub fn with_cache_id(mut self, cache_id: CacheId) -> Self {
        self.cache_id = Some(cache_id);
        self
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.error_type, self.message)?;
        for cause in &self.trace {
            write!(f, "\n  caused by: {cause}")?;
        }
        Ok(())
    }
}

/// Kind of a proactive server → client event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenEventKind {
    /// Free-form log line from a running function
    Log,
    /// Informational message from the task runner
    Message,
    TaskRunning,
    TaskFinished,
    TaskFailed,
    TaskLog,
}

impl fmt::Display for ListenEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenEventKind::Log => write!(f, "log"),
            ListenEventKind::Message => write!(f, "message"),
            ListenEventKind::TaskRunning => write!(f, "task_running"),
            ListenEventKind::TaskFinished => write!(f, "task_finished"),
            ListenEventKind::TaskFailed => write!(f, "task_failed"),
            ListenEventKind::TaskLog => write!(f, "task_log"),
        }
    }
}

/// Tally of task states in a sessions run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub waiting: usize,
    pub running: usize,
    pub failed: usize,
    pub finished: usize,
    pub total: usize,
}

impl SessionStatus {
    pub fn all_done(&self) -> bool {
        self.finished + self.failed == self.total
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "waiting={} running={} finished={} failed={} total={}",
            self.waiting, self.running, self.finished, self.failed, self.total
        )
    }
}

/// A proactive event sent while a request is outstanding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenEvent {
    pub timestamp: DateTime<Utc>,
    pub event: ListenEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<u64>,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<SessionStatus>,
}

impl ListenEvent {
    pub fn new(event: ListenEventKind, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            event,
            task_id: None,
            message: message.into(),
            status: None,
        }
    }

    pub fn log(message: impl Into<String>) -> Self {
        Self::new(ListenEventKind::Log, message)
    }

    pub fn with_task(mut self, task_id: u64) -> Self {
        self.task_id = Some(task_id);
        self
    }

    pub fn with_status(mut self, status: SessionStatus) -> Self {
        self.status = Some(status);
        self
    }
}
