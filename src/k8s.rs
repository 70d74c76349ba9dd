//! Kubernetes `Endpoints` event source and tonic balance-channel glue.
//!
//! [`KubeEndpoints`] implements [`EventSource`] on top of a kube runtime
//! watch of the core/v1 `Endpoints` object for the configured service. The
//! watch reconnects with backoff on transient failures, so the watcher only
//! ever sees fresh subset snapshots or a single terminal error.
//!
//! [`discover`] wires a [`Watcher`] into a user-provided tonic balance
//! channel for the common load-balancing case.

use std::net::SocketAddr;

use async_trait::async_trait;
use futures::TryStreamExt;
use k8s_openapi::api::core::v1::Endpoints;
use kube::runtime::WatchStreamExt;
use kube::runtime::watcher::{self, Config as WatcherConfig, Event};
use kube::{Api, Client};
use tokio::sync::mpsc::{self, Sender};
use tokio_util::sync::CancellationToken;
use tonic::transport::Endpoint;
use tonic::transport::channel::Change;

use crate::config::DiscoveryConfig;
use crate::error::{BoxError, WatchError};
use crate::watcher::{EventSource, Update, WatchItem, Watcher};

/// Event source backed by a Kubernetes `Endpoints` watch.
///
/// Requires RBAC permission to watch `Endpoints` in the target namespace,
/// and a Kubernetes client configuration (in-cluster or kubeconfig).
#[derive(Clone, Default)]
pub struct KubeEndpoints {
    client: Option<Client>,
}

impl KubeEndpoints {
    /// Creates an event source using the default client configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an event source using an explicitly configured client.
    #[must_use]
    pub fn with_client(client: Client) -> Self {
        Self {
            client: Some(client),
        }
    }
}

#[async_trait]
impl EventSource for KubeEndpoints {
    async fn start(
        self,
        config: &DiscoveryConfig,
        tx: mpsc::Sender<WatchItem>,
        cancel: CancellationToken,
    ) -> Result<(), BoxError> {
        let client = match self.client {
            Some(client) => client,
            None => Client::try_default().await?,
        };

        let namespace = config
            .namespace
            .clone()
            .unwrap_or_else(|| client.default_namespace().to_string());
        let endpoints: Api<Endpoints> = Api::namespaced(client, &namespace);

        let field_selector = format!("metadata.name={}", config.service_name);
        let watcher_config = WatcherConfig::default().fields(&field_selector);

        tracing::debug!(
            "starting Kubernetes endpoint watch for {namespace}/{} on port {:?}",
            config.service_name,
            config.port
        );

        let stream = watcher::watcher(endpoints, watcher_config).default_backoff();
        tokio::spawn(async move {
            tokio::pin!(stream);
            loop {
                let item = tokio::select! {
                    () = cancel.cancelled() => return,
                    item = stream.try_next() => item,
                };

                let snapshot = match item {
                    Ok(Some(Event::Apply(object) | Event::InitApply(object))) => {
                        object.subsets.unwrap_or_default()
                    }

                    // The Endpoints object itself is gone; every address
                    // goes with it.
                    Ok(Some(Event::Delete(_))) => Vec::new(),

                    Ok(Some(Event::Init | Event::InitDone)) => continue,

                    Ok(None) => {
                        deliver(&tx, &cancel, Err("endpoint watch stream ended".into())).await;
                        return;
                    }

                    Err(e) => {
                        deliver(&tx, &cancel, Err(e.into())).await;
                        return;
                    }
                };

                if !deliver(&tx, &cancel, Ok(snapshot)).await {
                    tracing::debug!("watcher gone, stopping Kubernetes endpoint watch");
                    return;
                }
            }
        });

        Ok(())
    }
}

/// Sends one item unless cancellation wins first; returns whether the
/// receiver is still interested.
async fn deliver(
    tx: &mpsc::Sender<WatchItem>,
    cancel: &CancellationToken,
    item: WatchItem,
) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        sent = tx.send(item) => sent.is_ok(),
    }
}

/// Starts watching Kubernetes endpoints and sends changes to the provided
/// sender.
///
/// Spawns a background task that runs a [`Watcher`] over [`KubeEndpoints`]
/// and forwards each address delta as a `Change` for a tonic balance
/// channel. The user is responsible for creating the balance channel and
/// building endpoints.
///
/// The task ends quietly when the channel's receiver is dropped; any
/// terminal watch error is logged.
///
/// # Example
///
/// ```ignore
/// use std::net::SocketAddr;
/// use std::time::Duration;
/// use tonic::transport::{Channel, Endpoint};
/// use tonic_discover_k8s::{DiscoveryConfig, discover};
///
/// let (channel, tx) = Channel::balance_channel::<SocketAddr>(1024);
///
/// let config = DiscoveryConfig::new("my-grpc-service", 50051_u16);
/// discover(config, tx, |addr| {
///     Endpoint::from_shared(format!("http://{addr}"))
///         .unwrap()
///         .connect_timeout(Duration::from_secs(5))
/// });
///
/// // Use with your generated gRPC client
/// // let client = MyServiceClient::new(channel);
/// ```
pub fn discover<F>(config: DiscoveryConfig, tx: Sender<Change<SocketAddr, Endpoint>>, build: F)
where
    F: Fn(SocketAddr) -> Endpoint + Send + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = discovery_loop(config, tx, build).await {
            tracing::error!("Kubernetes endpoint watcher failed: {e}");
        }
    });
}

/// Consumer loop bridging watcher deltas to a tonic balance channel.
async fn discovery_loop<F>(
    config: DiscoveryConfig,
    tx: Sender<Change<SocketAddr, Endpoint>>,
    build: F,
) -> Result<(), WatchError>
where
    F: Fn(SocketAddr) -> Endpoint,
{
    let service_name = config.service_name.clone();
    let mut watcher = Watcher::start(config, KubeEndpoints::new()).await?;

    loop {
        let updates = match watcher.next().await {
            Ok(updates) => updates,
            Err(WatchError::Cancelled) => return Ok(()),
            Err(e) => return Err(e),
        };

        let count = updates.len();
        for update in updates {
            let change = match update {
                Update::Add(addr) => Change::Insert(addr, build(addr)),
                Update::Remove(addr) => Change::Remove(addr),
            };

            if tx.send(change).await.is_err() {
                tracing::warn!("channel closed, stopping Kubernetes watcher");
                watcher.close();
                return Ok(());
            }
        }

        if count > 0 {
            tracing::debug!("Kubernetes discovery: {count} endpoint change(s) for {service_name}");
        }
    }
}
