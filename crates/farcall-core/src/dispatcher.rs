//! Request dispatcher
//!
//! Interprets payloads arriving on one connection and produces exactly one
//! terminal reply per request. Requests on a connection are handled strictly
//! one after another; a request that invokes callbacks or streams sessions
//! events keeps the connection until it has sent its terminal payload.
//!
//! Every failure while handling a request is answered with an `error`
//! payload and the loop keeps serving. Only `control: shutdown` ends it on
//! purpose.

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::codec::{self, CacheId, Map, Reference, Value};
use crate::function::{CallContext, FunctionError, FunctionResolver, RemoteFunction};
use crate::payload::{
    error_type, CacheRequest, CallRequest, ControlCommand, FunctionRequest, FunctionTarget,
    GetRequest, Payload, RemoteError, SessionsRequest, PROTOCOL_VERSION,
};
use crate::sessions::{Sessions, SessionsError};
use crate::store::{ObjectStore, StoreError, StoredObject};
use crate::transport::{preview, MessageTransport, TransportError};
use crate::trusted::SourceEvaluator;

/// Errors raised while handling one request
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Unknown reference {0}")]
    UnknownReference(CacheId),

    #[error("Cannot resolve function `{0}`")]
    UnresolvedFunction(String),

    #[error("Reference {0} does not point to a function")]
    NotAFunction(CacheId),

    #[error("Reference {0} points to a function, not data")]
    NotData(CacheId),

    #[error("Function `{name}` failed")]
    Function {
        name: String,
        #[source]
        source: FunctionError,
    },

    #[error("Trusted execution is disabled on this server")]
    TrustedExecutionDisabled,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Sessions(#[from] SessionsError),
}

impl From<StoreError> for DispatchError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::UnknownId(id) => DispatchError::UnknownReference(id),
        }
    }
}

impl DispatchError {
    fn error_type(&self) -> &'static str {
        match self {
            DispatchError::UnknownReference(_) => error_type::UNKNOWN_REFERENCE,
            DispatchError::UnresolvedFunction(_) => error_type::UNRESOLVED_FUNCTION,
            DispatchError::NotAFunction(_) => error_type::NOT_A_FUNCTION,
            DispatchError::NotData(_) => error_type::NOT_DATA,
            DispatchError::Function {
                source: FunctionError::Callback { .. },
                ..
            } => error_type::CALLBACK,
            DispatchError::Function { .. } => error_type::FUNCTION,
            DispatchError::TrustedExecutionDisabled => error_type::TRUSTED_EXECUTION_DISABLED,
            DispatchError::InvalidRequest(_) => error_type::INVALID_REQUEST,
            DispatchError::Sessions(_) => error_type::SESSIONS,
        }
    }

    /// Wire form of this error
    pub fn to_remote(&self) -> RemoteError {
        let remote = RemoteError::from_error(self.error_type(), self);
        match self {
            DispatchError::UnknownReference(id) => remote.with_cache_id(id.clone()),
            _ => remote,
        }
    }
}

/// How a connection's handling flow ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEnd {
    /// The client went away; `once` is set if it asked for the server to
    /// terminate with it
    Disconnected { once: bool },
    /// The client sent `control: shutdown`
    Shutdown,
}

enum Reply {
    Send(Payload),
    Shutdown,
}

/// State scoped to one connection
#[derive(Default)]
struct ConnectionState {
    once: bool,
    sessions: Option<Sessions>,
}

/// Interprets payloads against a shared object store
pub struct Dispatcher {
    store: Arc<dyn ObjectStore>,
    resolver: Arc<dyn FunctionResolver>,
    evaluator: Option<Arc<dyn SourceEvaluator>>,
}

impl Dispatcher {
    pub fn new(store: Arc<dyn ObjectStore>, resolver: Arc<dyn FunctionResolver>) -> Self {
        Self {
            store,
            resolver,
            evaluator: None,
        }
    }

    /// Enable source-defined functions
    pub fn with_evaluator(mut self, evaluator: Arc<dyn SourceEvaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// Serve requests on `transport` until the client leaves or asks for shutdown
    pub async fn serve_connection(&self, transport: &mut dyn MessageTransport) -> ConnectionEnd {
        let mut state = ConnectionState::default();

        let end = loop {
            let text = match transport.receive().await {
                Ok(text) => text,
                Err(TransportError::Closed) => break ConnectionEnd::Disconnected { once: state.once },
                Err(e) => {
                    warn!("Connection error: {}", e);
                    break ConnectionEnd::Disconnected { once: state.once };
                }
            };

            let reply = match codec::decode::<Payload>(&text) {
                Ok(payload) => {
                    debug!("Handling `{}` request", payload.kind());
                    self.handle(payload, &mut state, transport).await
                }
                Err(e) => {
                    warn!("Undecodable request {}: {}", preview(&text), e);
                    Ok(Reply::Send(Payload::Error(RemoteError::from_error(
                        error_type::DECODE,
                        &e,
                    ))))
                }
            };

            let payload = match reply {
                Ok(Reply::Send(payload)) => payload,
                Ok(Reply::Shutdown) => {
                    info!("Shutdown requested");
                    let _ = transport.close().await;
                    break ConnectionEnd::Shutdown;
                }
                Err(e) => {
                    debug!("Request failed: {}", e);
                    Payload::Error(e.to_remote())
                }
            };

            if let Err(e) = send_payload(transport, &payload).await {
                warn!("Failed to send reply: {}", e);
                break ConnectionEnd::Disconnected { once: state.once };
            }
        };

        if let Some(mut sessions) = state.sessions.take() {
            sessions.terminate();
        }
        end
    }

    async fn handle(
        &self,
        payload: Payload,
        state: &mut ConnectionState,
        transport: &mut dyn MessageTransport,
    ) -> Result<Reply, DispatchError> {
        let value = match payload {
            Payload::Cache(request) => self.cache(request),
            Payload::Function(request) => self.function(request)?,
            Payload::Call(request) => self.call(request, transport).await?,
            Payload::Get(request) => self.get(request)?,
            Payload::Control(ControlCommand::Shutdown) => return Ok(Reply::Shutdown),
            Payload::Control(command) => self.control(command, state, transport).await?,
            other @ (Payload::Result(_)
            | Payload::Error(_)
            | Payload::Callback(_)
            | Payload::Listen(_)) => {
                return Err(DispatchError::InvalidRequest(format!(
                    "`{}` payload outside of a callback exchange",
                    other.kind()
                )))
            }
        };
        Ok(Reply::Send(Payload::Result(value)))
    }

    fn cache(&self, request: CacheRequest) -> Value {
        let id = self
            .store
            .insert(request.cache_id, StoredObject::Data(request.data));
        Value::Reference(Reference::data(id))
    }

    fn function(&self, request: FunctionRequest) -> Result<Value, DispatchError> {
        let name = request.target.name().to_string();
        let function = match &request.target {
            FunctionTarget::Package { name } => self
                .resolver
                .resolve(name)
                .ok_or_else(|| DispatchError::UnresolvedFunction(name.clone()))?,
            FunctionTarget::Source { name, source } => {
                let evaluator = self
                    .evaluator
                    .as_ref()
                    .ok_or(DispatchError::TrustedExecutionDisabled)?;
                evaluator
                    .define(name, source)
                    .map_err(|e| DispatchError::Function {
                        name: name.clone(),
                        source: e,
                    })?
            }
        };

        let id = self.store.insert(None, StoredObject::Function(function));
        debug!("Registered function `{}` as {}", name, id);
        Ok(Value::Reference(Reference::function(
            id,
            name,
            request.cache_result,
        )))
    }

    async fn call(
        &self,
        request: CallRequest,
        transport: &mut dyn MessageTransport,
    ) -> Result<Value, DispatchError> {
        let function = self.lookup_function(&request.function)?;
        let args = request
            .args
            .into_iter()
            .map(|arg| self.resolve_value(arg))
            .collect::<Result<Vec<_>, _>>()?;
        let kwargs = self.resolve_map(request.kwargs)?;

        let name = function_name(&request.function);
        let mut ctx = CallContext::connection(transport);
        let result = function
            .call(&mut ctx, args, kwargs)
            .await
            .map_err(|source| DispatchError::Function { name, source })?;

        if request.function.caches_result() {
            let id = self.store.insert(None, StoredObject::Data(result));
            Ok(Value::Reference(Reference::data(id)))
        } else {
            Ok(result)
        }
    }

    fn get(&self, request: GetRequest) -> Result<Value, DispatchError> {
        let id = request.reference.cache_id;
        match self.store.get(&id)? {
            StoredObject::Data(value) => Ok(value),
            StoredObject::Function(_) => Err(DispatchError::NotData(id)),
        }
    }

    async fn control(
        &self,
        command: ControlCommand,
        state: &mut ConnectionState,
        transport: &mut dyn MessageTransport,
    ) -> Result<Value, DispatchError> {
        match command {
            ControlCommand::Check => Ok(Value::from("ok")),
            ControlCommand::Once => {
                state.once = true;
                Ok(Value::from("server will terminate when this connection closes"))
            }
            ControlCommand::Version => Ok(self.version()),
            ControlCommand::Sessions { request } => self.sessions(request, state, transport).await,
            // Handled before reaching here
            ControlCommand::Shutdown => Ok(Value::Null),
        }
    }

    fn version(&self) -> Value {
        let mut versions = Map::new();
        versions.insert(
            "farcall".to_string(),
            Value::from(env!("CARGO_PKG_VERSION")),
        );
        versions.insert("protocol".to_string(), Value::from(PROTOCOL_VERSION));
        for (package, version) in self.resolver.packages() {
            versions.insert(package, Value::from(version));
        }
        Value::Map(versions)
    }

    async fn sessions(
        &self,
        request: SessionsRequest,
        state: &mut ConnectionState,
        transport: &mut dyn MessageTransport,
    ) -> Result<Value, DispatchError> {
        match request {
            SessionsRequest::Create {
                worker_num,
                log_dir,
            } => {
                if state.sessions.is_some() {
                    return Err(SessionsError::AlreadyCreated.into());
                }
                let sessions = Sessions::create(worker_num, log_dir.as_deref()).await?;
                let message = format!("sessions created with {} workers", sessions.worker_num());
                state.sessions = Some(sessions);
                Ok(Value::from(message))
            }
            SessionsRequest::AddTask {
                function,
                args,
                kwargs,
            } => {
                let callable = self.lookup_function(&function)?;
                let args = args
                    .into_iter()
                    .map(|arg| self.resolve_value(arg))
                    .collect::<Result<Vec<_>, _>>()?;
                let kwargs = self.resolve_map(kwargs)?;
                let sessions = state.sessions.as_mut().ok_or(SessionsError::NotCreated)?;
                let id = sessions.add_task(function_name(&function), callable, args, kwargs)?;
                Ok(Value::Int(id as i64))
            }
            SessionsRequest::Start => {
                let sessions = state.sessions.as_mut().ok_or(SessionsError::NotCreated)?;
                let workers = sessions.start()?;
                Ok(Value::from(format!("sessions started with {workers} workers")))
            }
            SessionsRequest::Listen => {
                let sessions = state.sessions.as_mut().ok_or(SessionsError::NotCreated)?;
                let status = sessions.listen(transport).await?;
                state.sessions = None;
                info!("Sessions concluded: {}", status);
                Ok(Value::from("All sessions concluded"))
            }
            SessionsRequest::Terminate => {
                let mut sessions = state.sessions.take().ok_or(SessionsError::NotCreated)?;
                sessions.terminate();
                Ok(Value::from("sessions terminated"))
            }
        }
    }

    fn lookup_function(&self, reference: &Reference) -> Result<Arc<dyn RemoteFunction>, DispatchError> {
        match self.store.get(&reference.cache_id)? {
            StoredObject::Function(function) => Ok(function),
            StoredObject::Data(_) => Err(DispatchError::NotAFunction(reference.cache_id.clone())),
        }
    }

    /// Replace data references with their stored values, recursively
    ///
    /// References to stored functions stay as they are.
    fn resolve_value(&self, value: Value) -> Result<Value, DispatchError> {
        match value {
            Value::Reference(reference) => match self.store.get(&reference.cache_id)? {
                StoredObject::Data(data) => Ok(data),
                StoredObject::Function(_) => Ok(Value::Reference(reference)),
            },
            Value::List(items) => Ok(Value::List(
                items
                    .into_iter()
                    .map(|item| self.resolve_value(item))
                    .collect::<Result<Vec<_>, _>>()?,
            )),
            Value::Map(map) => Ok(Value::Map(self.resolve_map(map)?)),
            other => Ok(other),
        }
    }

    fn resolve_map(&self, map: Map) -> Result<Map, DispatchError> {
        map.into_iter()
            .map(|(key, value)| Ok((key, self.resolve_value(value)?)))
            .collect()
    }
}

fn function_name(reference: &Reference) -> String {
    reference
        .function_name
        .clone()
        .unwrap_or_else(|| reference.cache_id.to_string())
}

async fn send_payload(
    transport: &mut dyn MessageTransport,
    payload: &Payload,
) -> Result<(), TransportError> {
    let text = match codec::encode(payload) {
        Ok(text) => text,
        Err(e) => {
            // A result that cannot be encoded still gets an answer
            let fallback = Payload::Error(RemoteError::from_error(error_type::FUNCTION, &e));
            codec::encode(&fallback).map_err(|e| TransportError::WebSocket(e.to_string()))?
        }
    };
    transport.send(text).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CallbackId;
    use crate::function::FunctionRegistry;
    use crate::payload::{CallbackRequest, ListenEventKind};
    use crate::store::MemoryStore;
    use crate::transport::{memory_pair, MemoryTransport};

    struct Callbacker;

    #[async_trait::async_trait]
    impl RemoteFunction for Callbacker {
        async fn call(
            &self,
            ctx: &mut CallContext<'_>,
            args: Vec<Value>,
            _kwargs: Map,
        ) -> Result<Value, FunctionError> {
            let Some(Value::Callback(id)) = args.first() else {
                return Err(FunctionError::invalid_arguments("expected a callback"));
            };
            let reply = ctx.invoke_callback(*id, vec![Value::from(3)], Map::new()).await?;
            Ok(Value::list(vec![Value::from("called"), reply]))
        }
    }

    fn registry() -> FunctionRegistry {
        let mut registry = FunctionRegistry::new();
        registry
            .register_fn("test.first", |args: Vec<Value>, _kwargs: Map| {
                Ok(args.into_iter().next().unwrap_or_default())
            })
            .register_fn("test.fail", |_args: Vec<Value>, _kwargs: Map| {
                Err(FunctionError::failed("division by zero"))
            })
            .register("test.callback", Callbacker)
            .register_package("testpkg", "0.3.1");
        registry
    }

    struct Harness {
        client: MemoryTransport,
        store: Arc<MemoryStore>,
        server: tokio::task::JoinHandle<ConnectionEnd>,
    }

    fn start() -> Harness {
        let store = Arc::new(MemoryStore::unbounded());
        let dispatcher = Dispatcher::new(store.clone(), Arc::new(registry()));
        let (mut server_end, client) = memory_pair();
        let server = tokio::spawn(async move { dispatcher.serve_connection(&mut server_end).await });
        Harness {
            client,
            store,
            server,
        }
    }

    impl Harness {
        async fn request(&mut self, payload: Payload) -> Payload {
            self.client.send(codec::encode(&payload).unwrap()).await.unwrap();
            codec::decode(&self.client.receive().await.unwrap()).unwrap()
        }

        async fn function(&mut self, name: &str, cache_result: bool) -> Reference {
            let reply = self
                .request(Payload::Function(FunctionRequest {
                    target: FunctionTarget::Package {
                        name: name.to_string(),
                    },
                    cache_result,
                }))
                .await;
            match reply {
                Payload::Result(Value::Reference(reference)) => reference,
                other => panic!("unexpected reply: {other:?}"),
            }
        }
    }

    fn expect_error(payload: Payload) -> RemoteError {
        match payload {
            Payload::Error(error) => error,
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cache_then_get() {
        let mut h = start();
        let data = Value::list(vec![vec![0, 0, 0], vec![1, 0, 0]]);
        let reply = h
            .request(Payload::Cache(CacheRequest {
                data: data.clone(),
                cache_id: None,
            }))
            .await;
        let Payload::Result(Value::Reference(reference)) = reply else {
            panic!("expected reference");
        };
        assert!(!reference.is_function());

        let reply = h.request(Payload::Get(GetRequest { reference })).await;
        assert_eq!(reply, Payload::Result(data));
    }

    #[tokio::test]
    async fn test_unknown_reference() {
        let mut h = start();
        let reply = h
            .request(Payload::Get(GetRequest {
                reference: Reference::data(CacheId::new("stale")),
            }))
            .await;
        let error = expect_error(reply);
        assert_eq!(error.error_type, error_type::UNKNOWN_REFERENCE);
        assert_eq!(error.cache_id, Some(CacheId::new("stale")));
    }

    #[tokio::test]
    async fn test_call_resolves_nested_references() {
        let mut h = start();
        let first = h.function("test.first", false).await;
        let cached = h.store.insert(None, StoredObject::Data(Value::from(41)));

        let mut inner = Map::new();
        inner.insert("x".to_string(), Value::Reference(Reference::data(cached)));
        let reply = h
            .request(Payload::Call(CallRequest {
                function: first,
                args: vec![Value::list(vec![Value::Map(inner)])],
                kwargs: Map::new(),
            }))
            .await;

        let mut expected = Map::new();
        expected.insert("x".to_string(), Value::from(41));
        assert_eq!(reply, Payload::Result(Value::list(vec![Value::Map(expected)])));
    }

    #[tokio::test]
    async fn test_function_references_stay_references() {
        let mut h = start();
        let first = h.function("test.first", false).await;
        let reply = h
            .request(Payload::Call(CallRequest {
                function: first.clone(),
                args: vec![Value::Reference(first.clone())],
                kwargs: Map::new(),
            }))
            .await;
        assert_eq!(reply, Payload::Result(Value::Reference(first)));
    }

    #[tokio::test]
    async fn test_cache_result_chaining() {
        let mut h = start();
        let first = h.function("test.first", true).await;
        let before = h.store.len();

        let reply = h
            .request(Payload::Call(CallRequest {
                function: first.clone(),
                args: vec![Value::from("payload")],
                kwargs: Map::new(),
            }))
            .await;
        let Payload::Result(Value::Reference(intermediate)) = reply else {
            panic!("expected reference");
        };

        let reply = h
            .request(Payload::Call(CallRequest {
                function: first,
                args: vec![Value::Reference(intermediate)],
                kwargs: Map::new(),
            }))
            .await;
        let Payload::Result(Value::Reference(last)) = reply else {
            panic!("expected reference");
        };
        assert_eq!(h.store.len(), before + 2);

        let reply = h.request(Payload::Get(GetRequest { reference: last })).await;
        assert_eq!(reply, Payload::Result(Value::from("payload")));
    }

    #[tokio::test]
    async fn test_function_error_keeps_connection() {
        let mut h = start();
        let fail = h.function("test.fail", false).await;
        let reply = h
            .request(Payload::Call(CallRequest {
                function: fail,
                args: vec![],
                kwargs: Map::new(),
            }))
            .await;
        let error = expect_error(reply);
        assert_eq!(error.error_type, error_type::FUNCTION);
        assert_eq!(error.trace, vec!["division by zero".to_string()]);

        let reply = h.request(Payload::Control(ControlCommand::Check)).await;
        assert_eq!(reply, Payload::Result(Value::from("ok")));
    }

    #[tokio::test]
    async fn test_garbage_then_valid_request() {
        let mut h = start();
        h.client.send("{not json".to_string()).await.unwrap();
        let reply: Payload = codec::decode(&h.client.receive().await.unwrap()).unwrap();
        assert_eq!(expect_error(reply).error_type, error_type::DECODE);

        let reply = h.request(Payload::Control(ControlCommand::Check)).await;
        assert_eq!(reply, Payload::Result(Value::from("ok")));
    }

    #[tokio::test]
    async fn test_unresolved_and_source_functions() {
        let mut h = start();
        let reply = h
            .request(Payload::Function(FunctionRequest {
                target: FunctionTarget::Package {
                    name: "nope.missing".to_string(),
                },
                cache_result: false,
            }))
            .await;
        assert_eq!(expect_error(reply).error_type, error_type::UNRESOLVED_FUNCTION);

        let reply = h
            .request(Payload::Function(FunctionRequest {
                target: FunctionTarget::Source {
                    name: "f".to_string(),
                    source: "def f(): pass".to_string(),
                },
                cache_result: false,
            }))
            .await;
        assert_eq!(
            expect_error(reply).error_type,
            error_type::TRUSTED_EXECUTION_DISABLED
        );
    }

    #[tokio::test]
    async fn test_get_function_is_not_data() {
        let mut h = start();
        let first = h.function("test.first", false).await;
        let reply = h.request(Payload::Get(GetRequest { reference: first })).await;
        assert_eq!(expect_error(reply).error_type, error_type::NOT_DATA);

        let data = h.store.insert(None, StoredObject::Data(Value::Null));
        let reply = h
            .request(Payload::Call(CallRequest {
                function: Reference::data(data),
                args: vec![],
                kwargs: Map::new(),
            }))
            .await;
        assert_eq!(expect_error(reply).error_type, error_type::NOT_A_FUNCTION);
    }

    #[tokio::test]
    async fn test_check_does_not_touch_store() {
        let mut h = start();
        h.store.insert(None, StoredObject::Data(Value::from(1)));
        let before = h.store.len();
        let reply = h.request(Payload::Control(ControlCommand::Check)).await;
        assert_eq!(reply, Payload::Result(Value::from("ok")));
        assert_eq!(h.store.len(), before);
    }

    #[tokio::test]
    async fn test_version_reports_packages() {
        let mut h = start();
        let reply = h.request(Payload::Control(ControlCommand::Version)).await;
        let Payload::Result(Value::Map(versions)) = reply else {
            panic!("expected map");
        };
        assert_eq!(versions.get("protocol"), Some(&Value::from(PROTOCOL_VERSION)));
        assert_eq!(versions.get("testpkg"), Some(&Value::from("0.3.1")));
        assert!(versions.contains_key("farcall"));
    }

    #[tokio::test]
    async fn test_callback_exchange() {
        let mut h = start();
        let function = h.function("test.callback", false).await;
        let call = Payload::Call(CallRequest {
            function,
            args: vec![Value::Callback(CallbackId(5))],
            kwargs: Map::new(),
        });
        h.client.send(codec::encode(&call).unwrap()).await.unwrap();

        let interim: Payload = codec::decode(&h.client.receive().await.unwrap()).unwrap();
        assert_eq!(
            interim,
            Payload::Callback(CallbackRequest {
                id: CallbackId(5),
                args: vec![Value::from(3)],
                kwargs: Map::new(),
            })
        );

        let answer = h.request(Payload::Result(Value::from(30))).await;
        assert_eq!(
            answer,
            Payload::Result(Value::list(vec![Value::from("called"), Value::from(30)]))
        );
    }

    #[tokio::test]
    async fn test_unsolicited_result_rejected() {
        let mut h = start();
        let reply = h.request(Payload::Result(Value::Null)).await;
        assert_eq!(expect_error(reply).error_type, error_type::INVALID_REQUEST);
    }

    #[tokio::test]
    async fn test_once_and_disconnect() {
        let mut h = start();
        h.request(Payload::Control(ControlCommand::Once)).await;
        h.client.close().await.unwrap();
        assert_eq!(h.server.await.unwrap(), ConnectionEnd::Disconnected { once: true });
    }

    #[tokio::test]
    async fn test_shutdown_ends_connection() {
        let mut h = start();
        let shutdown = Payload::Control(ControlCommand::Shutdown);
        h.client.send(codec::encode(&shutdown).unwrap()).await.unwrap();
        assert_eq!(h.server.await.unwrap(), ConnectionEnd::Shutdown);
        assert!(h.client.receive().await.is_err());
    }

    #[tokio::test]
    async fn test_sessions_over_connection() {
        let mut h = start();
        let first = h.function("test.first", false).await;

        let sessions = |request| Payload::Control(ControlCommand::Sessions { request });

        let reply = h
            .request(sessions(SessionsRequest::Start))
            .await;
        assert_eq!(expect_error(reply).error_type, error_type::SESSIONS);

        h.request(sessions(SessionsRequest::Create {
            worker_num: Some(2),
            log_dir: None,
        }))
        .await;
        for i in 0..3 {
            let reply = h
                .request(sessions(SessionsRequest::AddTask {
                    function: first.clone(),
                    args: vec![Value::from(i)],
                    kwargs: Map::new(),
                }))
                .await;
            assert_eq!(reply, Payload::Result(Value::Int(i + 1)));
        }
        h.request(sessions(SessionsRequest::Start)).await;

        let listen = sessions(SessionsRequest::Listen);
        h.client.send(codec::encode(&listen).unwrap()).await.unwrap();
        let mut finished = 0;
        loop {
            let payload: Payload = codec::decode(&h.client.receive().await.unwrap()).unwrap();
            match payload {
                Payload::Listen(event) => {
                    if event.event == ListenEventKind::TaskFinished {
                        finished += 1;
                    }
                }
                Payload::Result(value) => {
                    assert_eq!(value, Value::from("All sessions concluded"));
                    break;
                }
                other => panic!("unexpected payload: {other:?}"),
            }
        }
        assert_eq!(finished, 3);

        // The run is dropped once listen completes
        let reply = h.request(sessions(SessionsRequest::Start)).await;
        assert_eq!(expect_error(reply).error_type, error_type::SESSIONS);
    }

    #[test]
    fn test_callback_error_type() {
        let err = DispatchError::Function {
            name: "f".to_string(),
            source: FunctionError::Callback {
                id: CallbackId(1),
                error: RemoteError::new("callback", "boom"),
            },
        };
        assert_eq!(err.to_remote().error_type, error_type::CALLBACK);
    }
}
