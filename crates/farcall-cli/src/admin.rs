//! Administrative client commands
//!
//! Each command attaches to an already running server; none of them ever
//! spawns one.

use farcall_core::transport::Endpoint;
use farcall_core::{Error, Proxy, ProxyConfig, RetryPolicy};

type CommandResult = Result<(), Box<dyn std::error::Error>>;

fn config(endpoint: Endpoint) -> ProxyConfig {
    ProxyConfig::new()
        .with_endpoint(endpoint)
        .with_retry(RetryPolicy::none())
}

pub async fn check(endpoint: Endpoint) -> CommandResult {
    let proxy = Proxy::attach(config(endpoint)).await?;
    proxy.check().await?;
    println!("ok");
    Ok(())
}

pub async fn version(endpoint: Endpoint, json_output: bool) -> CommandResult {
    let proxy = Proxy::attach(config(endpoint)).await?;
    let versions = proxy.version().await?;
    if json_output {
        println!("{}", serde_json::to_string_pretty(&versions)?);
    } else {
        for (package, version) in &versions {
            println!("{package} {version}");
        }
    }
    Ok(())
}

/// Shutting down a server that is not running is not an error
pub async fn shutdown(endpoint: Endpoint) -> CommandResult {
    let proxy = match Proxy::attach(config(endpoint.clone())).await {
        Ok(proxy) => proxy,
        Err(Error::Connect(_)) => {
            println!("No server running on {endpoint}");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };
    proxy.shutdown().await?;
    println!("Server on {endpoint} shut down");
    Ok(())
}
