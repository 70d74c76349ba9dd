//! Prints endpoint address changes for a Kubernetes service.
//!
//! Drives the watcher directly instead of going through a tonic balance
//! channel, which makes it handy for verifying RBAC and port configuration
//! before wiring discovery into a client.
//!
//! # Environment Variables
//!
//! - `SERVICE_NAME`: Kubernetes service name (default: greeter-server)
//! - `SERVICE_NAMESPACE`: Kubernetes namespace (default: uses pod's namespace)
//! - `GRPC_PORT`: gRPC port number or name (default: 50051)

use std::env;

use tonic_discover_k8s::{DiscoveryConfig, KubeEndpoints, Port, Update, Watcher};
use tracing::{Level, info};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(Level::INFO.into()),
        )
        .init();

    let service_name = env::var("SERVICE_NAME").unwrap_or_else(|_| "greeter-server".to_string());
    let service_namespace = env::var("SERVICE_NAMESPACE").ok();
    let port = match env::var("GRPC_PORT") {
        Ok(value) => match value.parse::<u16>() {
            Ok(number) => Port::Number(number),
            Err(_) => Port::Name(value),
        },
        Err(_) => Port::Number(50051),
    };

    info!("Watching service: {service_name}");
    if let Some(ref ns) = service_namespace {
        info!("Namespace: {ns}");
    }

    info!("Port: {port:?}");

    let mut config = DiscoveryConfig::new(&service_name, port);
    if let Some(ns) = service_namespace {
        config = config.namespace(ns);
    }

    let mut watcher = Watcher::start(config, KubeEndpoints::new()).await?;
    let token = watcher.cancel_token();

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            token.cancel();
        }
    });

    loop {
        match watcher.next().await {
            Ok(updates) => {
                for update in updates {
                    match update {
                        Update::Add(addr) => info!("+ {addr}"),
                        Update::Remove(addr) => info!("- {addr}"),
                    }
                }
            }

            Err(e) => {
                info!("watch ended: {e}");
                return Ok(());
            }
        }
    }
}
