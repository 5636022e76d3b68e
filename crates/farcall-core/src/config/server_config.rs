use serde::{Deserialize, Serialize};

use crate::store::EvictionPolicy;
use crate::transport::Endpoint;

/// Server process configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerConfig {
    /// Address to listen on
    pub endpoint: Endpoint,

    /// Allow clients to define functions from source text.
    /// This executes client-supplied code; never enabled by default.
    #[serde(default)]
    pub trusted_execution: bool,

    /// Interpreter command line used for source-defined functions
    #[serde(default)]
    pub interpreter: Vec<String>,

    /// Object store eviction; unbounded unless configured
    #[serde(default)]
    pub eviction: EvictionPolicy,

    /// Terminate after the first client connection closes
    #[serde(default)]
    pub once: bool,
}

impl ServerConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_endpoint(mut self, endpoint: Endpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// Enable trusted execution through `interpreter`
    pub fn with_trusted_execution(mut self, interpreter: Vec<String>) -> Self {
        self.trusted_execution = true;
        self.interpreter = interpreter;
        self
    }

    pub fn with_eviction(mut self, eviction: EvictionPolicy) -> Self {
        self.eviction = eviction;
        self
    }

    pub fn with_once(mut self, once: bool) -> Self {
        self.once = once;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trusted_execution_off_by_default() {
        let config = ServerConfig::new();
        assert!(!config.trusted_execution);
        assert_eq!(config.eviction, EvictionPolicy::Unbounded);
    }

    #[test]
    fn test_config_from_partial_json() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"endpoint": {"host": "0.0.0.0", "port": 9001}}"#).unwrap();
        assert_eq!(config.endpoint.port, 9001);
        assert!(config.interpreter.is_empty());
        assert!(!config.once);
    }
}
