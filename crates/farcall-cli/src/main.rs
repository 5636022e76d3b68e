//! Farcall CLI
//!
//! `farcall serve` runs the server process that proxies spawn and connect
//! to. The remaining subcommands are small administrative clients for a
//! server that is already running.

use clap::{Parser, Subcommand};
use farcall_core::store::EvictionPolicy;
use farcall_core::transport::Endpoint;
use farcall_core::{Server, ServerConfig};
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod admin;
mod builtins;

/// Farcall - remote function calls with a server-side object cache
#[derive(Parser, Debug)]
#[command(name = "farcall")]
#[command(version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Args, Debug, Clone)]
struct EndpointArgs {
    /// Host to bind or connect to
    #[arg(long, env = "FARCALL_HOST", default_value = farcall_core::config::defaults::DEFAULT_HOST)]
    host: String,

    /// Port to bind or connect to
    #[arg(short, long, env = "FARCALL_PORT", default_value_t = farcall_core::config::defaults::DEFAULT_PORT)]
    port: u16,
}

impl EndpointArgs {
    fn endpoint(&self) -> Endpoint {
        Endpoint::new(self.host.clone(), self.port)
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a server
    Serve {
        #[command(flatten)]
        endpoint: EndpointArgs,

        /// Exit after the first client disconnects
        #[arg(long)]
        once: bool,

        /// Allow clients to define functions from source text
        #[arg(long, requires = "interpreter")]
        trusted_exec: bool,

        /// Interpreter command line for source-defined functions (split on whitespace)
        #[arg(long)]
        interpreter: Option<String>,

        /// Expire cached objects unused for this many milliseconds
        #[arg(long, conflicts_with = "lru_capacity")]
        ttl_ms: Option<u64>,

        /// Keep at most this many cached objects, evicting the least recently used
        #[arg(long)]
        lru_capacity: Option<usize>,
    },

    /// Check that a server is answering
    Check {
        #[command(flatten)]
        endpoint: EndpointArgs,
    },

    /// Print the versions a server reports
    Version {
        #[command(flatten)]
        endpoint: EndpointArgs,

        /// Output format: text or json
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Ask a server to shut down
    Shutdown {
        #[command(flatten)]
        endpoint: EndpointArgs,
    },
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> ExitCode {
    // Logs go to stderr; stdout is reserved for command output
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let result = match args.command {
        Command::Serve {
            endpoint,
            once,
            trusted_exec,
            interpreter,
            ttl_ms,
            lru_capacity,
        } => {
            let mut config = ServerConfig::new()
                .with_endpoint(endpoint.endpoint())
                .with_once(once)
                .with_eviction(eviction(ttl_ms, lru_capacity));
            if trusted_exec {
                let command = interpreter
                    .as_deref()
                    .unwrap_or_default()
                    .split_whitespace()
                    .map(str::to_string)
                    .collect();
                config = config.with_trusted_execution(command);
            }
            serve(config).await
        }
        Command::Check { endpoint } => admin::check(endpoint.endpoint()).await,
        Command::Version { endpoint, format } => {
            admin::version(endpoint.endpoint(), matches!(format, OutputFormat::Json)).await
        }
        Command::Shutdown { endpoint } => admin::shutdown(endpoint.endpoint()).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn eviction(ttl_ms: Option<u64>, lru_capacity: Option<usize>) -> EvictionPolicy {
    match (ttl_ms, lru_capacity) {
        (Some(ttl_ms), _) => EvictionPolicy::Ttl { ttl_ms },
        (None, Some(capacity)) => EvictionPolicy::Lru { capacity },
        (None, None) => EvictionPolicy::Unbounded,
    }
}

async fn serve(config: ServerConfig) -> Result<(), Box<dyn std::error::Error>> {
    let registry = builtins::registry();
    tracing::info!("Serving {} built-in functions", registry.len());

    let server = Server::new(config, Arc::new(registry))?.bind().await?;
    let handle = server.shutdown_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted");
            handle.shutdown();
        }
    });

    server.run().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_serve_args() {
        let args = Args::try_parse_from([
            "farcall", "serve", "--host", "127.0.0.1", "--port", "9123", "--once",
        ])
        .unwrap();
        match args.command {
            Command::Serve { endpoint, once, .. } => {
                assert_eq!(endpoint.endpoint(), Endpoint::new("127.0.0.1", 9123));
                assert!(once);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_trusted_exec_requires_interpreter() {
        assert!(Args::try_parse_from(["farcall", "serve", "--trusted-exec"]).is_err());
        assert!(Args::try_parse_from([
            "farcall",
            "serve",
            "--trusted-exec",
            "--interpreter",
            "python3 -u runner.py"
        ])
        .is_ok());
    }

    #[test]
    fn test_eviction_flags() {
        assert_eq!(eviction(Some(50), None), EvictionPolicy::Ttl { ttl_ms: 50 });
        assert_eq!(eviction(None, Some(8)), EvictionPolicy::Lru { capacity: 8 });
        assert_eq!(eviction(None, None), EvictionPolicy::Unbounded);
        assert!(Args::try_parse_from([
            "farcall", "serve", "--ttl-ms", "10", "--lru-capacity", "3"
        ])
        .is_err());
    }
}
