//! Client side of the task runner
//!
//! Sessions live on one server connection, so these requests are never
//! retried: a reconnect would land on an empty runner.

use tracing::info;

use super::{FunctionProxy, Proxy};
use crate::codec::{Map, Reference, Value};
use crate::error::{Error, Result};
use crate::payload::{ControlCommand, Payload, SessionsRequest};

pub struct SessionsClient {
    proxy: Proxy,
}

impl SessionsClient {
    pub(super) fn new(proxy: Proxy) -> Self {
        Self { proxy }
    }

    /// Create the runner; `worker_num` defaults to the server's CPU count
    pub async fn create(&self, worker_num: Option<usize>, log_dir: Option<&str>) -> Result<String> {
        let reply = self
            .send(SessionsRequest::Create {
                worker_num,
                log_dir: log_dir.map(str::to_string),
            })
            .await?;
        text(reply)
    }

    /// Queue `function(*args, **kwargs)`; returns the task id
    pub async fn add_task(&self, function: &FunctionProxy, args: Vec<Value>, kwargs: Map) -> Result<u64> {
        self.add_task_ref(function.reference(), args, kwargs).await
    }

    pub async fn add_task_ref(&self, function: &Reference, args: Vec<Value>, kwargs: Map) -> Result<u64> {
        let reply = self
            .send(SessionsRequest::AddTask {
                function: function.clone(),
                args,
                kwargs,
            })
            .await?;
        match reply {
            Value::Int(id) if id > 0 => Ok(id as u64),
            other => Err(Error::Protocol(format!("expected a task id, got {other:?}"))),
        }
    }

    pub async fn start(&self) -> Result<String> {
        text(self.send(SessionsRequest::Start).await?)
    }

    /// Block until every task has finished or failed
    ///
    /// Task events stream to the proxy's event sink while this runs.
    pub async fn listen(&self) -> Result<String> {
        let summary = text(self.send(SessionsRequest::Listen).await?)?;
        info!("{}", summary);
        Ok(summary)
    }

    pub async fn terminate(&self) -> Result<String> {
        text(self.send(SessionsRequest::Terminate).await?)
    }

    async fn send(&self, request: SessionsRequest) -> Result<Value> {
        self.proxy
            .exchange(Payload::Control(ControlCommand::Sessions { request }))
            .await
    }
}

fn text(value: Value) -> Result<String> {
    match value {
        Value::Str(message) => Ok(message),
        other => Err(Error::Protocol(format!("expected a message, got {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{self, CacheId};
    use crate::config::{ProxyConfig, RetryPolicy};
    use crate::payload::{error_type, RemoteError};
    use crate::transport::{memory_pair, MessageTransport};

    #[tokio::test]
    async fn test_add_task_sends_reference() {
        let (client, mut server) = memory_pair();
        let server = tokio::spawn(async move {
            let request: Payload = codec::decode(&server.receive().await.unwrap()).unwrap();
            server
                .send(codec::encode(&Payload::Result(Value::Int(1))).unwrap())
                .await
                .unwrap();
            request
        });

        let proxy = Proxy::with_transport(client, ProxyConfig::new().with_retry(RetryPolicy::none()));
        let function = Reference::function(CacheId::new("f"), "work", false);
        let id = proxy
            .sessions()
            .add_task_ref(&function, vec![Value::from(2)], Map::new())
            .await
            .unwrap();
        assert_eq!(id, 1);

        match server.await.unwrap() {
            Payload::Control(ControlCommand::Sessions {
                request: SessionsRequest::AddTask { function: sent, args, .. },
            }) => {
                assert_eq!(sent, function);
                assert_eq!(args, vec![Value::from(2)]);
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_runner_errors_surface() {
        let (client, mut server) = memory_pair();
        tokio::spawn(async move {
            let _ = server.receive().await.unwrap();
            let error = RemoteError::new(error_type::SESSIONS, "sessions not created");
            server
                .send(codec::encode(&Payload::Error(error)).unwrap())
                .await
                .unwrap();
        });

        let proxy = Proxy::with_transport(client, ProxyConfig::new());
        match proxy.sessions().start().await {
            Err(Error::ServerSide(error)) => assert_eq!(error.error_type, error_type::SESSIONS),
            other => panic!("unexpected: {other:?}"),
        }
    }
}
