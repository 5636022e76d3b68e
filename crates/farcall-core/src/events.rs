//! Event Sink Trait
//!
//! This module provides the EventSink trait that receives the proactive
//! events a server sends while a request is outstanding (function log lines,
//! sessions task lifecycle), plus connection lifecycle notifications from
//! the proxy. Implementations can log through tracing, print to stdout
//! (CLI), collect in memory (tests), or anything else.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Mutex;

use crate::payload::ListenEvent;
use crate::transport::Endpoint;

/// Event sink for server events seen by a proxy
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emit a `listen` event received during an exchange
    async fn emit_listen(&self, event: &ListenEvent) -> Result<(), String>;

    /// Emit a connected event; `spawned` is set when the proxy started the server
    async fn emit_connected(&self, endpoint: &Endpoint, spawned: bool) -> Result<(), String>;

    /// Emit a disconnected event
    async fn emit_disconnected(&self, endpoint: &Endpoint) -> Result<(), String>;
}

/// No-op event sink
#[derive(Default, Clone)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit_listen(&self, _event: &ListenEvent) -> Result<(), String> {
        Ok(())
    }

    async fn emit_connected(&self, _endpoint: &Endpoint, _spawned: bool) -> Result<(), String> {
        Ok(())
    }

    async fn emit_disconnected(&self, _endpoint: &Endpoint) -> Result<(), String> {
        Ok(())
    }
}

/// Default sink: events become tracing records
#[derive(Default, Clone)]
pub struct TracingEventSink;

#[async_trait]
impl EventSink for TracingEventSink {
    async fn emit_listen(&self, event: &ListenEvent) -> Result<(), String> {
        match (event.task_id, event.status) {
            (Some(task), Some(status)) => {
                tracing::info!(task, %status, "[{}] {}", event.event, event.message)
            }
            (Some(task), None) => tracing::info!(task, "[{}] {}", event.event, event.message),
            (None, _) => tracing::info!("[{}] {}", event.event, event.message),
        }
        Ok(())
    }

    async fn emit_connected(&self, endpoint: &Endpoint, spawned: bool) -> Result<(), String> {
        if spawned {
            tracing::info!("Connected to spawned server at {}", endpoint);
        } else {
            tracing::info!("Connected to existing server at {}", endpoint);
        }
        Ok(())
    }

    async fn emit_disconnected(&self, endpoint: &Endpoint) -> Result<(), String> {
        tracing::info!("Disconnected from {}", endpoint);
        Ok(())
    }
}

/// Stdout event sink for CLI mode - prints events to console
#[derive(Default, Clone)]
pub struct StdoutEventSink {
    /// Whether to print in JSON format
    pub json_output: bool,
}

impl StdoutEventSink {
    pub fn new(json_output: bool) -> Self {
        Self { json_output }
    }
}

#[async_trait]
impl EventSink for StdoutEventSink {
    async fn emit_listen(&self, event: &ListenEvent) -> Result<(), String> {
        if self.json_output {
            println!("{}", serde_json::to_string(event).map_err(|e| e.to_string())?);
        } else {
            let task = event
                .task_id
                .map(|id| format!(" task {id}"))
                .unwrap_or_default();
            println!(
                "[{}] {}{} {}",
                format_timestamp(event.timestamp),
                event.event,
                task,
                event.message
            );
            if let Some(status) = event.status {
                println!("    {status}");
            }
        }
        Ok(())
    }

    async fn emit_connected(&self, endpoint: &Endpoint, spawned: bool) -> Result<(), String> {
        if self.json_output {
            println!("{}", connection_json("connected", endpoint, Some(spawned)));
        } else {
            println!("Connected: {endpoint}{}", if spawned { " (spawned)" } else { "" });
        }
        Ok(())
    }

    async fn emit_disconnected(&self, endpoint: &Endpoint) -> Result<(), String> {
        if self.json_output {
            println!("{}", connection_json("disconnected", endpoint, None));
        } else {
            println!("Disconnected: {endpoint}");
        }
        Ok(())
    }
}

/// Sink that keeps every listen event in memory
#[derive(Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<ListenEvent>>,
}

impl RecordingEventSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the events received so far
    pub fn events(&self) -> Vec<ListenEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl EventSink for RecordingEventSink {
    async fn emit_listen(&self, event: &ListenEvent) -> Result<(), String> {
        self.events
            .lock()
            .map_err(|e| e.to_string())?
            .push(event.clone());
        Ok(())
    }

    async fn emit_connected(&self, _endpoint: &Endpoint, _spawned: bool) -> Result<(), String> {
        Ok(())
    }

    async fn emit_disconnected(&self, _endpoint: &Endpoint) -> Result<(), String> {
        Ok(())
    }
}

fn connection_json(event: &str, endpoint: &Endpoint, spawned: Option<bool>) -> String {
    let mut line = serde_json::json!({
        "event": event,
        "endpoint": endpoint.to_string(),
    });
    if let Some(spawned) = spawned {
        line["spawned"] = spawned.into();
    }
    line.to_string()
}

fn format_timestamp(timestamp: DateTime<Utc>) -> String {
    timestamp.format("%H:%M:%S%.3f").to_string()
}
