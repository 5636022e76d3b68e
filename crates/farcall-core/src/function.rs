//! Server-side functions
//!
//! A [`RemoteFunction`] is anything the dispatcher can invoke on behalf of a
//! client. Functions are looked up by qualified name through a
//! [`FunctionResolver`]; [`FunctionRegistry`] is the map-backed resolver the
//! CLI populates with its built-in set.
//!
//! While running, a function talks back to its caller through a
//! [`CallContext`]: it can invoke client-held callbacks and emit log lines.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::codec::{self, CallbackId, CodecError, Map, Value};
use crate::payload::{CallbackRequest, ListenEvent, Payload, RemoteError};
use crate::sessions::TaskLogger;
use crate::transport::{MessageTransport, TransportError};

/// Errors raised by a function invocation
#[derive(Debug, thiserror::Error)]
pub enum FunctionError {
    #[error("{0}")]
    Failed(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Callback {id} failed: {error}")]
    Callback { id: CallbackId, error: RemoteError },

    #[error("Callbacks are only available to calls made over a client connection")]
    CallbackUnavailable,

    #[error("Unexpected `{0}` payload while waiting for a callback result")]
    UnexpectedPayload(&'static str),

    #[error("Execution failed: {0}")]
    Execution(String),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),
}

impl FunctionError {
    pub fn failed(message: impl Into<String>) -> Self {
        FunctionError::Failed(message.into())
    }

    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        FunctionError::InvalidArguments(message.into())
    }
}

/// A callable the server can store and invoke
#[async_trait]
pub trait RemoteFunction: Send + Sync {
    async fn call(
        &self,
        ctx: &mut CallContext<'_>,
        args: Vec<Value>,
        kwargs: Map,
    ) -> Result<Value, FunctionError>;
}

/// Adapter turning a plain closure into a [`RemoteFunction`]
pub struct FnFunction<F> {
    f: F,
}

#[async_trait]
impl<F> RemoteFunction for FnFunction<F>
where
    F: Fn(Vec<Value>, Map) -> Result<Value, FunctionError> + Send + Sync,
{
    async fn call(
        &self,
        _ctx: &mut CallContext<'_>,
        args: Vec<Value>,
        kwargs: Map,
    ) -> Result<Value, FunctionError> {
        (self.f)(args, kwargs)
    }
}

/// Wrap a synchronous closure that needs neither callbacks nor logging
pub fn from_fn<F>(f: F) -> FnFunction<F>
where
    F: Fn(Vec<Value>, Map) -> Result<Value, FunctionError> + Send + Sync,
{
    FnFunction { f }
}

/// Positional argument `index`, or an `InvalidArguments` error naming it
pub fn required_arg<'a>(args: &'a [Value], index: usize, name: &str) -> Result<&'a Value, FunctionError> {
    args.get(index).ok_or_else(|| {
        FunctionError::invalid_arguments(format!("missing argument `{name}` at position {index}"))
    })
}

/// Where a running function's output goes
enum Output<'a> {
    /// A live client connection; callbacks and log events go over the wire
    Connection(&'a mut dyn MessageTransport),
    /// A sessions task; log lines go to the task runner
    Task(TaskLogger),
    /// Nowhere to report to; log lines go to tracing only
    Detached,
}

/// Per-invocation handle a function uses to reach its caller
pub struct CallContext<'a> {
    output: Output<'a>,
}

impl<'a> CallContext<'a> {
    /// Context for a call dispatched on `transport`
    pub fn connection(transport: &'a mut dyn MessageTransport) -> Self {
        Self {
            output: Output::Connection(transport),
        }
    }

    /// Context for a function running as a sessions task
    pub fn task(logger: TaskLogger) -> Self {
        Self {
            output: Output::Task(logger),
        }
    }

    /// Context with no caller attached
    pub fn detached() -> Self {
        Self {
            output: Output::Detached,
        }
    }

    pub fn has_client(&self) -> bool {
        matches!(self.output, Output::Connection(_))
    }

    /// Ask the client to run callback `id` and wait for its return value
    ///
    /// The request goes out as an interim `callback` payload; the very next
    /// message on the connection must be the client's `result` or `error`.
    pub async fn invoke_callback(
        &mut self,
        id: CallbackId,
        args: Vec<Value>,
        kwargs: Map,
    ) -> Result<Value, FunctionError> {
        let Output::Connection(transport) = &mut self.output else {
            return Err(FunctionError::CallbackUnavailable);
        };

        let request = Payload::Callback(CallbackRequest { id, args, kwargs });
        transport.send(codec::encode(&request)?).await?;

        let reply = transport.receive().await?;
        match codec::decode::<Payload>(&reply)? {
            Payload::Result(value) => Ok(value),
            Payload::Error(error) => Err(FunctionError::Callback { id, error }),
            other => Err(FunctionError::UnexpectedPayload(other.kind())),
        }
    }

    /// Report a progress line to whoever is waiting on this call
    pub async fn log(&mut self, line: impl Into<String>) {
        let line = line.into();
        match &mut self.output {
            Output::Connection(transport) => {
                let event = Payload::Listen(ListenEvent::log(line));
                let sent = match codec::encode(&event) {
                    Ok(text) => transport.send(text).await.map_err(|e| e.to_string()),
                    Err(e) => Err(e.to_string()),
                };
                if let Err(e) = sent {
                    warn!("Failed to forward log line to client: {}", e);
                }
            }
            Output::Task(logger) => logger.log(line).await,
            Output::Detached => info!("{}", line),
        }
    }
}

/// Looks up functions by qualified name
pub trait FunctionResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<Arc<dyn RemoteFunction>>;

    /// Installed packages and their versions, reported by `version`
    fn packages(&self) -> BTreeMap<String, String> {
        BTreeMap::new()
    }
}

/// Map-backed function resolver
#[derive(Default, Clone)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn RemoteFunction>>,
    packages: BTreeMap<String, String>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `function` under a qualified name such as `geometry.scale`
    pub fn register(&mut self, name: impl Into<String>, function: impl RemoteFunction + 'static) -> &mut Self {
        self.functions.insert(name.into(), Arc::new(function));
        self
    }

    pub fn register_fn<F>(&mut self, name: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(Vec<Value>, Map) -> Result<Value, FunctionError> + Send + Sync + 'static,
    {
        self.register(name, from_fn(f))
    }

    /// Record a package version for `version` reports
    pub fn register_package(&mut self, name: impl Into<String>, version: impl Into<String>) -> &mut Self {
        self.packages.insert(name.into(), version.into());
        self
    }

    /// Registered function names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl FunctionResolver for FunctionRegistry {
    fn resolve(&self, name: &str) -> Option<Arc<dyn RemoteFunction>> {
        self.functions.get(name).cloned()
    }

    fn packages(&self) -> BTreeMap<String, String> {
        self.packages.clone()
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FunctionRegistry")
            .field("functions", &self.names())
            .field("packages", &self.packages)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::memory_pair;

    fn add(args: Vec<Value>, _kwargs: Map) -> Result<Value, FunctionError> {
        let a = required_arg(&args, 0, "a")?.as_i64().unwrap_or(0);
        let b = required_arg(&args, 1, "b")?.as_i64().unwrap_or(0);
        Ok(Value::from(a + b))
    }

    #[tokio::test]
    async fn test_registry_resolves_registered() {
        let mut registry = FunctionRegistry::new();
        registry.register_fn("math.add", add).register_package("math", "1.2.0");

        let function = registry.resolve("math.add").unwrap();
        let mut ctx = CallContext::detached();
        let result = function
            .call(&mut ctx, vec![Value::from(2), Value::from(3)], Map::new())
            .await
            .unwrap();
        assert_eq!(result, Value::from(5));

        assert!(registry.resolve("math.sub").is_none());
        assert_eq!(registry.packages().get("math").map(String::as_str), Some("1.2.0"));
        assert_eq!(registry.names(), vec!["math.add"]);
    }

    #[tokio::test]
    async fn test_missing_argument() {
        let function = from_fn(add);
        let mut ctx = CallContext::detached();
        let err = function
            .call(&mut ctx, vec![Value::from(1)], Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FunctionError::InvalidArguments(_)));
        assert!(err.to_string().contains("`b`"));
    }

    #[tokio::test]
    async fn test_callback_unavailable_when_detached() {
        let mut ctx = CallContext::detached();
        let err = ctx
            .invoke_callback(CallbackId(1), vec![], Map::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FunctionError::CallbackUnavailable));
    }

    #[tokio::test]
    async fn test_invoke_callback_roundtrip() {
        let (mut server_end, mut client_end) = memory_pair();

        let client = tokio::spawn(async move {
            let request: Payload = codec::decode(&client_end.receive().await.unwrap()).unwrap();
            let Payload::Callback(request) = request else {
                panic!("expected callback request");
            };
            assert_eq!(request.id, CallbackId(7));
            assert_eq!(request.args, vec![Value::from(3)]);
            let reply = Payload::Result(Value::from(9));
            client_end.send(codec::encode(&reply).unwrap()).await.unwrap();
        });

        let mut ctx = CallContext::connection(&mut server_end);
        let value = ctx
            .invoke_callback(CallbackId(7), vec![Value::from(3)], Map::new())
            .await
            .unwrap();
        assert_eq!(value, Value::from(9));
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_callback_error_reply() {
        let (mut server_end, mut client_end) = memory_pair();
        let client = tokio::spawn(async move {
            let _ = client_end.receive().await.unwrap();
            let reply = Payload::Error(RemoteError::new("callback", "client blew up"));
            client_end.send(codec::encode(&reply).unwrap()).await.unwrap();
        });

        let mut ctx = CallContext::connection(&mut server_end);
        let err = ctx
            .invoke_callback(CallbackId(1), vec![], Map::new())
            .await
            .unwrap_err();
        match err {
            FunctionError::Callback { id, error } => {
                assert_eq!(id, CallbackId(1));
                assert_eq!(error.message, "client blew up");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        client.await.unwrap();
    }

    #[tokio::test]
    async fn test_log_sends_listen_event() {
        let (mut server_end, mut client_end) = memory_pair();
        {
            let mut ctx = CallContext::connection(&mut server_end);
            ctx.log("halfway there").await;
        }
        let payload: Payload = codec::decode(&client_end.receive().await.unwrap()).unwrap();
        match payload {
            Payload::Listen(event) => assert_eq!(event.message, "halfway there"),
            other => panic!("unexpected payload: {other:?}"),
        }
    }
}
