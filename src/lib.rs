#![deny(missing_docs)]
#![deny(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

//! Kubernetes endpoint discovery for [Tonic](https://docs.rs/tonic) gRPC load balancing.
//!
//! When using gRPC (HTTP/2) with Kubernetes, standard `ClusterIP` services don't load balance
//! effectively because HTTP/2 multiplexes all requests over a single long-lived TCP connection.
//! This crate watches the `Endpoints` object of a named service and turns each change into a
//! minimal batch of add/remove address deltas for a connection-level balancer.
//!
//! The core is the [`Watcher`]: it pulls full endpoint snapshots from an [`EventSource`],
//! resolves them against a [`Port`] specification (literal number, named port, or first-found),
//! and diffs them against the last known address set. Unchanged addresses produce no churn.
//! Any error from [`Watcher::next`] is terminal for that watcher; the bundled [`KubeEndpoints`]
//! source reconnects transparently on transient transport failures so the watcher rarely sees
//! one.
//!
//! # Features
//!
//! - **Kubernetes API discovery**: Real-time updates via an `Endpoints` watch
//! - **Minimal deltas**: only genuinely added or removed addresses are reported
//! - **User-controlled channels**: You create the channel and endpoints however you want
//! - **Cooperative shutdown**: close the watcher from any task via its cancellation token
//!
//! # Usage
//!
//! ```ignore
//! use std::net::SocketAddr;
//! use std::time::Duration;
//! use tonic::transport::{Channel, Endpoint};
//! use tonic_discover_k8s::{discover, DiscoveryConfig};
//!
//! // Create your own balance channel
//! let (channel, tx) = Channel::balance_channel::<SocketAddr>(1024);
//!
//! // Start discovery - build function returns Endpoint for each address
//! let config = DiscoveryConfig::new("my-grpc-service", 50051_u16);
//! discover(config, tx, |addr| {
//!     Endpoint::from_shared(format!("http://{addr}"))
//!         .unwrap()
//!         .connect_timeout(Duration::from_secs(5))
//! });
//!
//! // Use with your generated gRPC client
//! // let client = MyServiceClient::new(channel);
//! ```
//!
//! For full control over the consumer loop, drive the watcher directly:
//!
//! ```ignore
//! use tonic_discover_k8s::{DiscoveryConfig, KubeEndpoints, Port, Watcher};
//!
//! let config = DiscoveryConfig::new("my-grpc-service", Port::Name("grpc".into()));
//! let mut watcher = Watcher::start(config, KubeEndpoints::new()).await?;
//! while let Ok(updates) = watcher.next().await {
//!     for update in updates {
//!         // open or close a connection
//!     }
//! }
//! ```

mod config;
mod error;
mod k8s;
mod resolve;
mod watcher;

pub use config::{DiscoveryConfig, Port};
pub use error::{BoxError, WatchError};
pub use k8s::{KubeEndpoints, discover};
pub use watcher::{EventSource, Update, WatchItem, Watcher};
