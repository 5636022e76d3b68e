use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::defaults;
use crate::transport::Endpoint;

/// Client-side proxy configuration
///
/// Provides centralized configuration with:
/// - Serde support for loading from files/env
/// - Builder methods for customization
/// - Defaults matching the reference server
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Where the server listens
    pub endpoint: Endpoint,

    /// How to launch a server when none is reachable.
    /// `None` looks up the `farcall` binary on `PATH`.
    pub server_command: Option<ServerCommand>,

    /// Connection attempts while waiting for a spawned server
    pub connect_attempts: u32,

    /// Delay between connection attempts (milliseconds)
    pub connect_delay_ms: u64,

    /// Retry policy for remote calls
    pub retry: RetryPolicy,

    /// Pause between shutdown and respawn in `restart` (milliseconds)
    pub restart_delay_ms: u64,

    /// Grace period before killing a spawned server in `stop_server` (milliseconds)
    pub stop_grace_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            endpoint: Endpoint::default(),
            server_command: None,
            connect_attempts: defaults::DEFAULT_CONNECT_ATTEMPTS,
            connect_delay_ms: defaults::DEFAULT_CONNECT_DELAY_MS,
            retry: RetryPolicy::default(),
            restart_delay_ms: defaults::DEFAULT_RESTART_DELAY_MS,
            stop_grace_ms: defaults::DEFAULT_STOP_GRACE_MS,
        }
    }
}

impl ProxyConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.endpoint.port = port;
        self
    }

    pub fn with_server_command(mut self, command: ServerCommand) -> Self {
        self.server_command = Some(command);
        self
    }

    pub fn with_connect_attempts(mut self, attempts: u32, delay_ms: u64) -> Self {
        self.connect_attempts = attempts;
        self.connect_delay_ms = delay_ms;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_restart_delay_ms(mut self, delay_ms: u64) -> Self {
        self.restart_delay_ms = delay_ms;
        self
    }

    pub fn connect_delay(&self) -> Duration {
        Duration::from_millis(self.connect_delay_ms)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

/// Bounded retry for transient call failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub attempts: u32,
    /// Fixed wait between attempts (milliseconds)
    pub wait_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: defaults::DEFAULT_CALL_ATTEMPTS,
            wait_ms: defaults::DEFAULT_CALL_RETRY_WAIT_MS,
        }
    }
}

impl RetryPolicy {
    /// A single attempt, no retries
    pub fn none() -> Self {
        Self {
            attempts: 1,
            wait_ms: 0,
        }
    }

    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }
}

/// Program used to launch a server process
///
/// The proxy appends `serve --host <host> --port <port>` followed by
/// `extra_args`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerCommand {
    pub program: PathBuf,
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default)]
    pub env: Vec<(String, String)>,
}

impl ServerCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            extra_args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.extra_args.push(arg.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Full argument list for a server listening on `endpoint`
    pub fn args_for(&self, endpoint: &Endpoint) -> Vec<String> {
        let mut args = vec![
            "serve".to_string(),
            "--host".to_string(),
            endpoint.host.clone(),
            "--port".to_string(),
            endpoint.port.to_string(),
        ];
        args.extend(self.extra_args.iter().cloned());
        args
    }

    /// Locate the default server binary on `PATH`
    pub fn locate_default() -> Option<Self> {
        which::which(defaults::SERVER_BINARY).ok().map(Self::new)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ProxyConfig::new();
        assert_eq!(config.endpoint.port, defaults::DEFAULT_PORT);
        assert_eq!(config.connect_attempts, 20);
        assert_eq!(config.retry.attempts, 5);
        assert_eq!(config.retry.wait(), Duration::from_millis(500));
        assert!(config.server_command.is_none());
    }

    #[test]
    fn test_server_command_args() {
        let command = ServerCommand::new("/usr/bin/farcall").arg("--trusted-exec");
        let args = command.args_for(&Endpoint::new("127.0.0.1", 9123));
        assert_eq!(
            args,
            vec!["serve", "--host", "127.0.0.1", "--port", "9123", "--trusted-exec"]
        );
    }

    #[test]
    fn test_config_serde_roundtrip() {
        let config = ProxyConfig::new()
            .with_port(9100)
            .with_server_command(ServerCommand::new("farcall").env("RUST_LOG", "debug"));
        let json = serde_json::to_string(&config).unwrap();
        let parsed: ProxyConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.endpoint.port, 9100);
        assert_eq!(parsed.server_command, config.server_command);
    }
}
