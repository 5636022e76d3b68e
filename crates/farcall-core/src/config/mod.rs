//! Configuration
//!
//! This module defines configuration types and default values:
//! - `proxy_config`: client-side proxy settings (endpoint, spawn, retries)
//! - `server_config`: server process settings (endpoint, store, trusted execution)
//! - `defaults`: Default configuration values

pub mod defaults;
pub mod proxy_config;
pub mod server_config;

pub use proxy_config::{ProxyConfig, RetryPolicy, ServerCommand};
pub use server_config::ServerConfig;
