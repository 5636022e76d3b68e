//! Client proxy
//!
//! [`Proxy`] drives the protocol from the client side and owns the server
//! lifecycle: it reuses a running server when one answers on the configured
//! endpoint, otherwise spawns one and polls until it accepts connections.
//!
//! Every request is one exchange: a single send followed by receives until
//! a terminal `result` or `error` arrives. In between, the server may ask
//! for client callbacks to be run (answered on the same connection) or push
//! `listen` events (handed to the [`EventSink`]).

mod callbacks;
mod process;
mod sessions;

pub use callbacks::{Callback, CallbackTable};
pub use process::ServerProcess;
pub use sessions::SessionsClient;

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::codec::{self, CacheId, CallbackId, Map, Reference, Value};
use crate::config::{ProxyConfig, ServerCommand};
use crate::error::{Error, Result};
use crate::events::{EventSink, TracingEventSink};
use crate::payload::{
    error_type, CacheRequest, CallRequest, ControlCommand, FunctionRequest, FunctionTarget,
    GetRequest, Payload, RemoteError,
};
use crate::transport::{self, MessageTransport, TransportError};

struct ProxyInner {
    connection: Option<Box<dyn MessageTransport>>,
    /// Set only when this proxy started the server
    process: Option<ServerProcess>,
}

/// Observer for failed function calls, run after retries are exhausted
pub type ErrorHandler = Arc<dyn Fn(&Error) + Send + Sync>;

/// Client-side façade for one server endpoint
///
/// Cloning is cheap; clones share the connection, the spawned process and
/// the callback table. Exchanges from different clones are serialized.
#[derive(Clone)]
pub struct Proxy {
    inner: Arc<Mutex<ProxyInner>>,
    callbacks: Arc<CallbackTable>,
    events: Arc<dyn EventSink>,
    error_handler: Option<ErrorHandler>,
    config: Arc<ProxyConfig>,
}

impl Proxy {
    /// Create a disconnected proxy
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ProxyInner {
                connection: None,
                process: None,
            })),
            callbacks: Arc::new(CallbackTable::new()),
            events: Arc::new(TracingEventSink),
            error_handler: None,
            config: Arc::new(config),
        }
    }

    /// Connect to a running server, or spawn one
    pub async fn connect(config: ProxyConfig) -> Result<Self> {
        let proxy = Self::new(config);
        proxy.ensure_connected().await?;
        Ok(proxy)
    }

    /// Connect to a running server; never spawns
    pub async fn attach(config: ProxyConfig) -> Result<Self> {
        let proxy = Self::new(config);
        if !proxy.try_reconnect().await? {
            return Err(Error::Connect(TransportError::ConnectFailed {
                addr: proxy.config.endpoint.to_string(),
                reason: "no server is listening".to_string(),
            }));
        }
        Ok(proxy)
    }

    /// Drive an already established transport
    pub fn with_transport(transport: impl MessageTransport + 'static, config: ProxyConfig) -> Self {
        let proxy = Self::new(config);
        // Freshly created, so the lock is free
        if let Ok(mut inner) = proxy.inner.try_lock() {
            inner.connection = Some(Box::new(transport));
        }
        proxy
    }

    pub fn with_event_sink(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Run `handler` on every error a [`FunctionProxy`] call returns
    pub fn with_error_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Error) + Send + Sync + 'static,
    {
        self.error_handler = Some(Arc::new(handler));
        self
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    pub async fn is_connected(&self) -> bool {
        self.inner.lock().await.connection.is_some()
    }

    /// Whether this proxy started the server it talks to
    pub async fn owns_server(&self) -> bool {
        self.inner.lock().await.process.is_some()
    }

    /// Reuse a running server if one answers; a refused connection is not an error
    pub async fn try_reconnect(&self) -> Result<bool> {
        let mut inner = self.inner.lock().await;
        if inner.connection.is_some() {
            return Ok(true);
        }
        match transport::connect(&self.config.endpoint).await {
            Ok(connection) => {
                inner.connection = Some(Box::new(connection));
                self.emit_connected(false).await;
                Ok(true)
            }
            Err(e) => {
                debug!("No server at {}: {}", self.config.endpoint, e);
                Ok(false)
            }
        }
    }

    /// Spawn a server and poll until it accepts a connection
    pub async fn start_server(&self) -> Result<()> {
        let command = match &self.config.server_command {
            Some(command) => command.clone(),
            None => ServerCommand::locate_default().ok_or_else(|| {
                Error::Spawn("`farcall` executable not found on PATH".to_string())
            })?,
        };

        let mut process = ServerProcess::spawn(&command, &self.config.endpoint)?;

        for attempt in 1..=self.config.connect_attempts {
            if let Some(status) = process.poll()? {
                let output = process.communicate().await;
                return Err(Error::Spawn(format!(
                    "server exited with {status} before accepting connections\n{output}"
                )));
            }

            match transport::connect(&self.config.endpoint).await {
                Ok(connection) => {
                    process.forward_output();
                    let mut inner = self.inner.lock().await;
                    inner.connection = Some(Box::new(connection));
                    inner.process = Some(process);
                    drop(inner);
                    info!("Server started on {} after {} attempts", self.config.endpoint, attempt);
                    self.emit_connected(true).await;
                    return Ok(());
                }
                Err(e) => {
                    debug!("Connect attempt {} failed: {}", attempt, e);
                    tokio::time::sleep(self.config.connect_delay()).await;
                }
            }
        }

        let attempts = self.config.connect_attempts;
        if let Err(e) = process.kill().await {
            warn!("Failed to kill unreachable server: {}", e);
        }
        Err(Error::Spawn(format!(
            "server did not accept connections on {} after {attempts} attempts",
            self.config.endpoint
        )))
    }

    /// Reconnect if possible, otherwise spawn
    pub async fn ensure_connected(&self) -> Result<()> {
        if self.try_reconnect().await? {
            return Ok(());
        }
        self.start_server().await
    }

    /// Register a function by qualified name
    pub async fn function(&self, name: &str) -> Result<FunctionProxy> {
        self.function_with(name, false).await
    }

    /// Register a function by name; `cache_result` keeps its results server-side
    pub async fn function_with(&self, name: &str, cache_result: bool) -> Result<FunctionProxy> {
        let target = FunctionTarget::Package {
            name: name.to_string(),
        };
        self.register_function(target, cache_result).await
    }

    /// Define a function from source text (trusted execution)
    pub async fn function_from_source(
        &self,
        name: &str,
        source: &str,
        cache_result: bool,
    ) -> Result<FunctionProxy> {
        let target = FunctionTarget::Source {
            name: name.to_string(),
            source: source.to_string(),
        };
        self.register_function(target, cache_result).await
    }

    async fn register_function(&self, target: FunctionTarget, cache_result: bool) -> Result<FunctionProxy> {
        let value = self
            .request(Payload::Function(FunctionRequest {
                target,
                cache_result,
            }))
            .await?;
        Ok(FunctionProxy {
            proxy: self.clone(),
            reference: expect_reference(value)?,
        })
    }

    /// Rebuild a handle for a function reference obtained earlier
    pub fn function_handle(&self, reference: Reference) -> FunctionProxy {
        FunctionProxy {
            proxy: self.clone(),
            reference,
        }
    }

    /// Store `data` on the server
    pub async fn cache(&self, data: impl Into<Value>) -> Result<Reference> {
        let value = self
            .request(Payload::Cache(CacheRequest {
                data: data.into(),
                cache_id: None,
            }))
            .await?;
        expect_reference(value)
    }

    /// Store `data` under a caller-chosen id, replacing any previous entry
    pub async fn cache_with_id(&self, data: impl Into<Value>, id: CacheId) -> Result<Reference> {
        let value = self
            .request(Payload::Cache(CacheRequest {
                data: data.into(),
                cache_id: Some(id),
            }))
            .await?;
        expect_reference(value)
    }

    /// Unwrap a reference to inlined data
    pub async fn get(&self, reference: &Reference) -> Result<Value> {
        self.request(Payload::Get(GetRequest {
            reference: reference.clone(),
        }))
        .await
    }

    /// Liveness probe
    pub async fn check(&self) -> Result<()> {
        match self.request(Payload::Control(ControlCommand::Check)).await? {
            Value::Str(ack) if ack == "ok" => Ok(()),
            other => Err(Error::Protocol(format!("unexpected check reply: {other:?}"))),
        }
    }

    /// Versions of the server and its installed packages
    pub async fn version(&self) -> Result<BTreeMap<String, String>> {
        let value = self.request(Payload::Control(ControlCommand::Version)).await?;
        let Value::Map(map) = value else {
            return Err(Error::Protocol(format!("unexpected version reply: {value:?}")));
        };
        Ok(map
            .into_iter()
            .filter_map(|(name, version)| version.as_str().map(|v| (name, v.to_string())))
            .collect())
    }

    /// Ask the server to terminate once this connection closes
    pub async fn once(&self) -> Result<()> {
        self.request(Payload::Control(ControlCommand::Once)).await?;
        Ok(())
    }

    /// Make a local callable passable as a call argument
    pub fn register_callback<F>(&self, f: F) -> Value
    where
        F: Fn(Vec<Value>, Map) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        Value::Callback(self.callbacks.register(Arc::new(f)))
    }

    pub fn forget_callback(&self, id: CallbackId) -> bool {
        self.callbacks.remove(id)
    }

    /// Task runner on this connection
    pub fn sessions(&self) -> SessionsClient {
        SessionsClient::new(self.clone())
    }

    /// Send `control: shutdown`; a no-op when not connected
    pub async fn shutdown(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(mut connection) = inner.connection.take() else {
            debug!("Shutdown on a disconnected proxy");
            return Ok(());
        };
        drop(inner);

        let text = codec::encode(&Payload::Control(ControlCommand::Shutdown))?;
        let sent = connection.send(text).await;
        // The server answers by closing the connection
        let _ = tokio::time::timeout(self.config.stop_grace(), connection.receive()).await;
        let _ = connection.close().await;
        self.emit_disconnected().await;
        sent?;
        info!("Shutdown sent to {}", self.config.endpoint);
        Ok(())
    }

    /// Shut down, then make sure a server this proxy spawned has exited
    pub async fn stop_server(&self) -> Result<()> {
        let shutdown = self.shutdown().await;
        let process = self.inner.lock().await.process.take();
        if let Some(process) = process {
            let status = process.wait_or_kill(self.config.stop_grace()).await?;
            info!("Server process exited with {}", status);
        }
        shutdown
    }

    /// Shut the server down and start a fresh one
    pub async fn restart(&self) -> Result<()> {
        if let Err(e) = self.try_reconnect().await {
            debug!("Reconnect before restart failed: {}", e);
        }
        self.shutdown().await?;
        tokio::time::sleep(self.config.restart_delay()).await;

        let old = self.inner.lock().await.process.take();
        if let Some(old) = old {
            old.wait_or_kill(self.config.stop_grace()).await?;
        }
        self.start_server().await
    }

    /// One exchange with bounded retries for transport failures
    pub async fn request(&self, payload: Payload) -> Result<Value> {
        let retry = self.config.retry;
        let attempts = retry.attempts.max(1);
        let mut attempt = 1;

        loop {
            match self.exchange(payload.clone()).await {
                Err(e) if e.is_transient() && attempt < attempts => {
                    warn!("Attempt {}/{} failed: {}; retrying", attempt, attempts, e);
                    attempt += 1;
                    tokio::time::sleep(retry.wait()).await;
                    if let Err(e) = self.try_reconnect().await {
                        debug!("Reconnect failed: {}", e);
                    }
                }
                result => return result,
            }
        }
    }

    /// One exchange, no retries
    pub async fn exchange(&self, payload: Payload) -> Result<Value> {
        let text = codec::encode(&payload)?;
        let mut inner = self.inner.lock().await;
        let connection = inner.connection.as_mut().ok_or(Error::NotConnected)?;

        let result = self.exchange_on(connection.as_mut(), text).await;
        if let Err(e) = &result {
            if !is_server_reply(e) {
                // Stopped before the terminal payload; the conversation is out of step
                warn!("Dropping connection to {}: {}", self.config.endpoint, e);
                inner.connection = None;
                drop(inner);
                self.emit_disconnected().await;
            }
        }
        result
    }

    async fn exchange_on(&self, connection: &mut dyn MessageTransport, text: String) -> Result<Value> {
        connection.send(text).await?;

        loop {
            let text = connection.receive().await?;
            match codec::decode::<Payload>(&text)? {
                Payload::Result(value) => return Ok(value),
                Payload::Error(error) => return Err(error.into()),
                Payload::Callback(request) => {
                    let id = request.id;
                    debug!("Running callback {}", id);
                    let reply = match self.callbacks.invoke(id, request.args, request.kwargs) {
                        Ok(value) => Payload::Result(value),
                        Err(message) => {
                            Payload::Error(RemoteError::new(error_type::CALLBACK, message))
                        }
                    };
                    // The server is blocked on this answer, so something must go back
                    let text = match codec::encode(&reply) {
                        Ok(text) => text,
                        Err(e) => {
                            warn!("Callback {} returned an unencodable value: {}", id, e);
                            codec::encode(&Payload::Error(RemoteError::new(
                                error_type::CALLBACK,
                                e.to_string(),
                            )))?
                        }
                    };
                    connection.send(text).await?;
                }
                Payload::Listen(event) => {
                    if let Err(e) = self.events.emit_listen(&event).await {
                        warn!("Event sink rejected listen event: {}", e);
                    }
                }
                other => {
                    return Err(Error::Protocol(format!(
                        "unexpected `{}` payload from server",
                        other.kind()
                    )))
                }
            }
        }
    }

    async fn emit_connected(&self, spawned: bool) {
        if let Err(e) = self.events.emit_connected(&self.config.endpoint, spawned).await {
            warn!("Event sink error: {}", e);
        }
    }

    async fn emit_disconnected(&self) {
        if let Err(e) = self.events.emit_disconnected(&self.config.endpoint).await {
            warn!("Event sink error: {}", e);
        }
    }
}

/// Errors carried by a terminal `error` payload leave the connection in step
fn is_server_reply(error: &Error) -> bool {
    matches!(error, Error::ServerSide(_) | Error::UnknownReference(_))
}

fn expect_reference(value: Value) -> Result<Reference> {
    match value {
        Value::Reference(reference) => Ok(reference),
        other => Err(Error::Protocol(format!("expected a reference, got {other:?}"))),
    }
}

/// Invocable handle for a server-side function
#[derive(Clone)]
pub struct FunctionProxy {
    proxy: Proxy,
    reference: Reference,
}

impl FunctionProxy {
    pub fn reference(&self) -> &Reference {
        &self.reference
    }

    pub fn name(&self) -> &str {
        self.reference.function_name.as_deref().unwrap_or_default()
    }

    /// Whether calls return references instead of inlined data
    pub fn caches_result(&self) -> bool {
        self.reference.caches_result()
    }

    pub async fn call(&self, args: Vec<Value>) -> Result<Value> {
        self.call_with(args, Map::new()).await
    }

    pub async fn call_with(&self, args: Vec<Value>, kwargs: Map) -> Result<Value> {
        let result = self
            .proxy
            .request(Payload::Call(CallRequest {
                function: self.reference.clone(),
                args,
                kwargs,
            }))
            .await;
        if let (Err(e), Some(handler)) = (&result, &self.proxy.error_handler) {
            handler(e);
        }
        result
    }
}

impl std::fmt::Debug for FunctionProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionProxy")
            .field("reference", &self.reference)
            .finish()
    }
}
