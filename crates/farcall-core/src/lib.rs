//! Farcall Core Library
//!
//! Remote function calls against a long-lived server process that keeps
//! results in an in-memory object store. Clients hold opaque references to
//! server-side objects and pass them back into later calls, so large data
//! never has to cross the connection twice.
//!
//! # Modules
//!
//! - [`codec`] - Value graph and its JSON wire form
//! - [`payload`] - The message envelope and request/response bodies
//! - [`transport`] - WebSocket and in-memory message transports
//! - [`store`] - Server-side object store and eviction policies
//! - [`function`] - Remote functions, call context and the function registry
//! - [`trusted`] - Interpreter-backed functions defined from source text
//! - [`sessions`] - Parallel task runner scoped to one connection
//! - [`dispatcher`] - Per-connection request handling
//! - [`server`] - Listening server and its shutdown triggers
//! - [`proxy`] - Client proxy with spawn/reconnect/restart lifecycle
//! - [`events`] - Event sink trait for listen and connection events
//! - [`config`] - Proxy and server configuration
//! - [`error`] - Error types

pub mod codec;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod function;
pub mod payload;
pub mod proxy;
pub mod server;
pub mod sessions;
pub mod store;
pub mod transport;
pub mod trusted;

// Re-export commonly used types
pub use codec::{CacheId, CallbackId, Map, Reference, Value};
pub use config::{ProxyConfig, RetryPolicy, ServerCommand, ServerConfig};
pub use dispatcher::Dispatcher;
pub use error::{Error, Result};
pub use events::{EventSink, StdoutEventSink, TracingEventSink};
pub use function::{
    from_fn, required_arg, CallContext, FunctionError, FunctionRegistry, FunctionResolver,
    RemoteFunction,
};
pub use payload::{ListenEvent, ListenEventKind, Payload, RemoteError, SessionStatus};
pub use proxy::{ErrorHandler, FunctionProxy, Proxy, SessionsClient};
pub use server::{BoundServer, Server, ServerError, ShutdownHandle};
pub use store::{EvictionPolicy, MemoryStore, ObjectStore};
pub use transport::{Endpoint, MessageTransport, TransportError};
