//! Server process
//!
//! Binds the configured endpoint and gives every accepted connection its
//! own task running the [`Dispatcher`]. All connections share one object
//! store, so references cached by one client stay valid for the next.
//!
//! The accept loop stops when a client sends `control: shutdown`, or when a
//! connection that asked for `once` (or any connection, with
//! [`ServerConfig::once`]) closes.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::config::ServerConfig;
use crate::dispatcher::{ConnectionEnd, Dispatcher};
use crate::function::FunctionResolver;
use crate::store::{MemoryStore, ObjectStore};
use crate::transport::{self, TransportError};
use crate::trusted::CommandEvaluator;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Trusted execution is enabled but no interpreter command was given")]
    MissingInterpreter,

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// A configured, not yet listening server
pub struct Server {
    config: ServerConfig,
    dispatcher: Arc<Dispatcher>,
}

impl Server {
    pub fn new(config: ServerConfig, resolver: Arc<dyn FunctionResolver>) -> Result<Self, ServerError> {
        let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new(config.eviction));
        Self::with_store(config, resolver, store)
    }

    /// Use a caller-provided object store
    pub fn with_store(
        config: ServerConfig,
        resolver: Arc<dyn FunctionResolver>,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Self, ServerError> {
        let mut dispatcher = Dispatcher::new(store, resolver);
        if config.trusted_execution {
            let evaluator =
                CommandEvaluator::new(&config.interpreter).ok_or(ServerError::MissingInterpreter)?;
            warn!(
                "Trusted execution enabled: client source runs through `{}`",
                evaluator.program()
            );
            dispatcher = dispatcher.with_evaluator(Arc::new(evaluator));
        }
        Ok(Self {
            config,
            dispatcher: Arc::new(dispatcher),
        })
    }

    /// Bind the listening socket
    pub async fn bind(self) -> Result<BoundServer, ServerError> {
        let addr = self.config.endpoint.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| TransportError::BindFailed {
                addr: addr.clone(),
                reason: e.to_string(),
            })?;
        let local_addr = listener.local_addr().map_err(TransportError::Io)?;
        let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);

        info!("Listening on ws://{}", local_addr);
        Ok(BoundServer {
            listener,
            local_addr,
            dispatcher: self.dispatcher,
            shutdown_tx,
            shutdown_rx,
            once: self.config.once,
        })
    }

    /// Bind and serve until shutdown
    pub async fn run(self) -> Result<(), ServerError> {
        self.bind().await?.run().await
    }
}

/// Handle for stopping a running server from outside its accept loop
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: broadcast::Sender<()>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(());
    }
}

/// A server with its listening socket bound
pub struct BoundServer {
    listener: TcpListener,
    local_addr: SocketAddr,
    dispatcher: Arc<Dispatcher>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_rx: broadcast::Receiver<()>,
    once: bool,
}

impl BoundServer {
    /// Actual bound address (useful with port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown_tx.clone(),
        }
    }

    /// Accept connections until a shutdown is triggered
    pub async fn run(self) -> Result<(), ServerError> {
        let mut shutdown_rx = self.shutdown_rx;

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            info!("Client connected from {}", addr);
                            tokio::spawn(handle_connection(
                                stream,
                                Arc::clone(&self.dispatcher),
                                self.shutdown_tx.clone(),
                                self.once,
                            ));
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection(
    stream: TcpStream,
    dispatcher: Arc<Dispatcher>,
    shutdown_tx: broadcast::Sender<()>,
    server_once: bool,
) {
    let mut connection = match transport::accept(stream).await {
        Ok(connection) => connection,
        Err(e) => {
            warn!("Rejected connection: {}", e);
            return;
        }
    };
    let peer = connection.peer().to_string();

    let end = dispatcher.serve_connection(&mut connection).await;
    debug!("Connection {} ended: {:?}", peer, end);

    match end {
        ConnectionEnd::Shutdown => {
            let _ = shutdown_tx.send(());
        }
        ConnectionEnd::Disconnected { once } if once || server_once => {
            info!("Client {} disconnected in once mode", peer);
            let _ = shutdown_tx.send(());
        }
        ConnectionEnd::Disconnected { .. } => {
            info!("Client {} disconnected", peer);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{self, Value};
    use crate::function::FunctionRegistry;
    use crate::payload::{ControlCommand, Payload};
    use crate::transport::{Endpoint, MessageTransport};
    use std::time::Duration;

    async fn bound(config: ServerConfig) -> BoundServer {
        let config = config.with_endpoint(Endpoint::new("127.0.0.1", 0));
        Server::new(config, Arc::new(FunctionRegistry::new()))
            .unwrap()
            .bind()
            .await
            .unwrap()
    }

    async fn control(port: u16, command: ControlCommand) -> transport::ClientConnection {
        let mut client = transport::connect(&Endpoint::new("127.0.0.1", port))
            .await
            .unwrap();
        client
            .send(codec::encode(&Payload::Control(command)).unwrap())
            .await
            .unwrap();
        client
    }

    #[test]
    fn test_trusted_execution_requires_interpreter() {
        let config = ServerConfig::new().with_trusted_execution(Vec::new());
        let result = Server::new(config, Arc::new(FunctionRegistry::new()));
        assert!(matches!(result, Err(ServerError::MissingInterpreter)));
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let server = bound(ServerConfig::new()).await;
        let port = server.local_addr().port();
        let second = Server::new(
            ServerConfig::new().with_endpoint(Endpoint::new("127.0.0.1", port)),
            Arc::new(FunctionRegistry::new()),
        )
        .unwrap()
        .bind()
        .await;
        assert!(matches!(
            second,
            Err(ServerError::Transport(TransportError::BindFailed { .. }))
        ));
    }

    #[tokio::test]
    async fn test_shutdown_command_stops_server() {
        let server = bound(ServerConfig::new()).await;
        let port = server.local_addr().port();
        let running = tokio::spawn(server.run());

        let mut client = control(port, ControlCommand::Check).await;
        let reply: Payload = codec::decode(&client.receive().await.unwrap()).unwrap();
        assert_eq!(reply, Payload::Result(Value::from("ok")));

        client
            .send(codec::encode(&Payload::Control(ControlCommand::Shutdown)).unwrap())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_once_disconnect_stops_server() {
        let server = bound(ServerConfig::new()).await;
        let port = server.local_addr().port();
        let running = tokio::spawn(server.run());

        let mut client = control(port, ControlCommand::Once).await;
        let _ack = client.receive().await.unwrap();
        client.close().await.unwrap();
        drop(client);

        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_handle() {
        let server = bound(ServerConfig::new()).await;
        let handle = server.shutdown_handle();
        let running = tokio::spawn(server.run());
        handle.shutdown();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
