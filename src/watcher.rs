//! The endpoint watcher state machine.
//!
//! A [`Watcher`] consumes snapshots of a service's endpoint subsets from an
//! [`EventSource`], resolves each snapshot into a set of dialable addresses,
//! and returns the difference against the previously resolved set as a batch
//! of [`Update`]s. The first error `next()` returns is terminal: the watcher
//! never retries or resumes, and every later call fails with
//! [`WatchError::AlreadyStopped`]. Transport-level reconnects belong to the
//! event source, which keeps delivering snapshots without surfacing them.

use std::collections::HashSet;
use std::net::SocketAddr;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::EndpointSubset;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::config::{DiscoveryConfig, Port};
use crate::error::{BoxError, WatchError};
use crate::resolve::subset_addresses;

/// One delivery from an event source: a full snapshot of the watched
/// service's current subsets, or the stream's terminal error.
pub type WatchItem = Result<Vec<EndpointSubset>, BoxError>;

/// A producer of endpoint snapshots for a watched service.
///
/// `start` establishes the underlying watch and then delivers [`WatchItem`]s
/// into `tx` from a background task until the receiver is dropped, `cancel`
/// fires, or the stream fails terminally (the error is forwarded once as the
/// final item). Reconnecting on transient transport failures is the source's
/// responsibility; the watcher never sees those.
#[async_trait]
pub trait EventSource: Send {
    /// Starts delivering snapshots for the configured service.
    ///
    /// # Errors
    ///
    /// Fails only if the watch cannot be established at all, e.g. initial
    /// connection or auth failure.
    async fn start(
        self,
        config: &DiscoveryConfig,
        tx: mpsc::Sender<WatchItem>,
        cancel: CancellationToken,
    ) -> Result<(), BoxError>;
}

/// An incremental change to the resolved address set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Update {
    /// The address joined the set and should gain a connection.
    Add(SocketAddr),
    /// The address left the set and its connection should be dropped.
    Remove(SocketAddr),
}

/// Watches a service's endpoints and yields address-set deltas.
///
/// Designed for a single consumer calling [`next`](Self::next) in a loop.
/// To close the watcher from another task while `next()` is blocked, cancel
/// a clone of its [`cancel_token`](Self::cancel_token).
pub struct Watcher {
    port: Port,
    events: mpsc::Receiver<WatchItem>,
    cancel: CancellationToken,
    known: HashSet<SocketAddr>,
    stopped: bool,
}

impl Watcher {
    /// Starts the event source for the configured service and returns a
    /// watcher with an empty address set.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Start`] if the event source cannot be started;
    /// no watcher exists in that case.
    pub async fn start<S>(config: DiscoveryConfig, source: S) -> Result<Self, WatchError>
    where
        S: EventSource,
    {
        Self::start_with_cancel(config, source, CancellationToken::new()).await
    }

    /// Like [`start`](Self::start), but observes the given cancellation
    /// token, so the watcher can participate in an application-wide
    /// shutdown tree.
    ///
    /// # Errors
    ///
    /// Returns [`WatchError::Start`] if the event source cannot be started.
    pub async fn start_with_cancel<S>(
        config: DiscoveryConfig,
        source: S,
        cancel: CancellationToken,
    ) -> Result<Self, WatchError>
    where
        S: EventSource,
    {
        let (tx, rx) = mpsc::channel(1);
        source
            .start(&config, tx, cancel.clone())
            .await
            .map_err(WatchError::Start)?;

        Ok(Self {
            port: config.port,
            events: rx,
            cancel,
            known: HashSet::new(),
            stopped: false,
        })
    }

    /// Returns a clone of the watcher's cancellation token.
    ///
    /// Cancelling it has the same effect as [`close`](Self::close) and is
    /// safe from any task, including while `next()` is blocked.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Signals cancellation. Idempotent.
    ///
    /// The next (or currently blocked) `next()` call observes it and fails
    /// with [`WatchError::Cancelled`].
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Waits for the next endpoint snapshot and returns the resulting
    /// address-set deltas. An empty batch means the snapshot changed
    /// nothing.
    ///
    /// # Errors
    ///
    /// Every error is terminal for this watcher. After the first failure,
    /// all subsequent calls fail with [`WatchError::AlreadyStopped`].
    pub async fn next(&mut self) -> Result<Vec<Update>, WatchError> {
        if self.stopped {
            return Err(WatchError::AlreadyStopped);
        }

        let updates = self.step().await;
        if updates.is_err() {
            self.stopped = true;
            // Tear down the event source as well.
            self.cancel.cancel();
        }

        updates
    }

    async fn step(&mut self) -> Result<Vec<Update>, WatchError> {
        let subsets = tokio::select! {
            () = self.cancel.cancelled() => return Err(WatchError::Cancelled),
            item = self.events.recv() => match item {
                Some(Ok(subsets)) => subsets,
                Some(Err(e)) => return Err(WatchError::EventStream(e)),
                None => {
                    return Err(WatchError::EventStream(
                        "endpoint event stream closed".into(),
                    ));
                }
            },
        };

        // A snapshot is the full current state, so any subset that fails to
        // resolve poisons the whole event; applying it partially would leave
        // the known set out of sync with the registry.
        let mut current = HashSet::new();
        for subset in &subsets {
            current.extend(subset_addresses(&self.port, subset)?);
        }

        let mut updates = Vec::new();
        for addr in &current {
            if !self.known.contains(addr) {
                tracing::debug!("adding endpoint: {addr}");
                updates.push(Update::Add(*addr));
            }
        }

        for addr in &self.known {
            if !current.contains(addr) {
                tracing::debug!("removing endpoint: {addr}");
                updates.push(Update::Remove(*addr));
            }
        }

        self.known = current;
        Ok(updates)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use k8s_openapi::api::core::v1::{EndpointAddress, EndpointPort};
    use tokio::time::sleep;

    use super::*;

    /// Plays back a fixed sequence of items, then optionally keeps the
    /// channel open so the watcher blocks.
    struct Scripted {
        items: Vec<WatchItem>,
        hold_open: bool,
    }

    impl Scripted {
        fn new(items: Vec<WatchItem>) -> Self {
            Self {
                items,
                hold_open: false,
            }
        }

        fn holding_open(items: Vec<WatchItem>) -> Self {
            Self {
                items,
                hold_open: true,
            }
        }
    }

    #[async_trait]
    impl EventSource for Scripted {
        async fn start(
            self,
            _config: &DiscoveryConfig,
            tx: mpsc::Sender<WatchItem>,
            _cancel: CancellationToken,
        ) -> Result<(), BoxError> {
            let Self { items, hold_open } = self;
            tokio::spawn(async move {
                for item in items {
                    if tx.send(item).await.is_err() {
                        return;
                    }
                }

                if hold_open {
                    // Keep the sender alive until the receiver goes away.
                    tx.closed().await;
                }
            });

            Ok(())
        }
    }

    struct FailingStart;

    #[async_trait]
    impl EventSource for FailingStart {
        async fn start(
            self,
            _config: &DiscoveryConfig,
            _tx: mpsc::Sender<WatchItem>,
            _cancel: CancellationToken,
        ) -> Result<(), BoxError> {
            Err("connection refused".into())
        }
    }

    fn subset(ips: &[&str], ports: &[(Option<&str>, i32)]) -> EndpointSubset {
        EndpointSubset {
            addresses: Some(
                ips.iter()
                    .map(|ip| EndpointAddress {
                        ip: (*ip).to_string(),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ports: Some(
                ports
                    .iter()
                    .map(|(name, port)| EndpointPort {
                        name: name.map(String::from),
                        port: *port,
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }
    }

    fn config() -> DiscoveryConfig {
        DiscoveryConfig::new("my-service", 50051_u16)
    }

    #[tokio::test]
    async fn start_failure_returns_start_error() {
        let result = Watcher::start(config(), FailingStart).await;
        assert!(matches!(result, Err(WatchError::Start(_))));
    }

    #[tokio::test]
    async fn first_snapshot_adds_all_addresses() {
        let source = Scripted::new(vec![Ok(vec![subset(
            &["10.0.0.1", "10.0.0.2"],
            &[(None, 80)],
        )])]);

        let mut watcher = Watcher::start(config(), source).await.unwrap();
        let updates = watcher.next().await.unwrap();

        assert_eq!(updates.len(), 2);
        assert!(updates.contains(&Update::Add("10.0.0.1:50051".parse().unwrap())));
        assert!(updates.contains(&Update::Add("10.0.0.2:50051".parse().unwrap())));
    }

    #[tokio::test]
    async fn identical_snapshots_produce_empty_batch() {
        let snapshot = vec![subset(&["10.0.0.1"], &[(None, 80)])];
        let source = Scripted::new(vec![Ok(snapshot.clone()), Ok(snapshot)]);

        let mut watcher = Watcher::start(config(), source).await.unwrap();
        watcher.next().await.unwrap();
        let updates = watcher.next().await.unwrap();

        assert!(updates.is_empty());
    }

    #[tokio::test]
    async fn diff_emits_only_changed_addresses() {
        let source = Scripted::new(vec![
            Ok(vec![subset(&["10.0.0.1", "10.0.0.2"], &[(None, 80)])]),
            Ok(vec![subset(&["10.0.0.2", "10.0.0.3"], &[(None, 80)])]),
        ]);

        let mut watcher = Watcher::start(config(), source).await.unwrap();
        watcher.next().await.unwrap();
        let updates = watcher.next().await.unwrap();

        assert_eq!(updates.len(), 2);
        assert!(updates.contains(&Update::Remove("10.0.0.1:50051".parse().unwrap())));
        assert!(updates.contains(&Update::Add("10.0.0.3:50051".parse().unwrap())));
    }

    #[tokio::test]
    async fn duplicate_addresses_across_subsets_collapse() {
        let source = Scripted::new(vec![Ok(vec![
            subset(&["10.0.0.1"], &[(None, 80)]),
            subset(&["10.0.0.1"], &[(None, 80)]),
        ])]);

        let mut watcher = Watcher::start(config(), source).await.unwrap();
        let updates = watcher.next().await.unwrap();

        assert_eq!(
            updates,
            vec![Update::Add("10.0.0.1:50051".parse().unwrap())]
        );
    }

    #[tokio::test]
    async fn empty_snapshot_removes_everything() {
        let source = Scripted::new(vec![
            Ok(vec![subset(&["10.0.0.1", "10.0.0.2"], &[(None, 80)])]),
            Ok(vec![]),
        ]);

        let mut watcher = Watcher::start(config(), source).await.unwrap();
        watcher.next().await.unwrap();
        let updates = watcher.next().await.unwrap();

        assert_eq!(updates.len(), 2);
        assert!(updates.contains(&Update::Remove("10.0.0.1:50051".parse().unwrap())));
        assert!(updates.contains(&Update::Remove("10.0.0.2:50051".parse().unwrap())));
    }

    #[tokio::test]
    async fn no_port_subset_stops_the_watcher() {
        let source = Scripted::holding_open(vec![Ok(vec![subset(&["10.0.0.1"], &[])])]);

        let mut watcher = Watcher::start(config(), source).await.unwrap();

        let err = watcher.next().await.unwrap_err();
        assert!(matches!(err, WatchError::NoPort));

        let err = watcher.next().await.unwrap_err();
        assert!(matches!(err, WatchError::AlreadyStopped));
    }

    #[tokio::test]
    async fn stream_error_stops_the_watcher() {
        let source = Scripted::holding_open(vec![Err("watch expired".into())]);

        let mut watcher = Watcher::start(config(), source).await.unwrap();

        let err = watcher.next().await.unwrap_err();
        assert!(matches!(err, WatchError::EventStream(_)));

        let err = watcher.next().await.unwrap_err();
        assert!(matches!(err, WatchError::AlreadyStopped));
    }

    #[tokio::test]
    async fn closed_channel_is_a_stream_error() {
        let source = Scripted::new(vec![]);

        let mut watcher = Watcher::start(config(), source).await.unwrap();

        let err = watcher.next().await.unwrap_err();
        assert!(matches!(err, WatchError::EventStream(_)));
    }

    #[tokio::test]
    async fn cancel_unblocks_a_pending_next() {
        let source = Scripted::holding_open(vec![]);

        let mut watcher = Watcher::start(config(), source).await.unwrap();
        let token = watcher.cancel_token();

        tokio::spawn(async move {
            sleep(Duration::from_millis(10)).await;
            token.cancel();
        });

        let err = watcher.next().await.unwrap_err();
        assert!(matches!(err, WatchError::Cancelled));

        let err = watcher.next().await.unwrap_err();
        assert!(matches!(err, WatchError::AlreadyStopped));
    }

    #[tokio::test]
    async fn close_before_next_is_observed_as_cancellation() {
        let source = Scripted::holding_open(vec![]);

        let mut watcher = Watcher::start(config(), source).await.unwrap();
        watcher.close();
        watcher.close();

        let err = watcher.next().await.unwrap_err();
        assert!(matches!(err, WatchError::Cancelled));
    }

    #[tokio::test]
    async fn external_token_cancels_the_watcher() {
        let source = Scripted::holding_open(vec![]);
        let shutdown = CancellationToken::new();

        let mut watcher = Watcher::start_with_cancel(config(), source, shutdown.child_token())
            .await
            .unwrap();

        shutdown.cancel();

        let err = watcher.next().await.unwrap_err();
        assert!(matches!(err, WatchError::Cancelled));
    }

    #[tokio::test]
    async fn successes_resume_until_first_error() {
        let source = Scripted::new(vec![
            Ok(vec![subset(&["10.0.0.1"], &[(None, 80)])]),
            Ok(vec![subset(&["10.0.0.2"], &[(None, 80)])]),
            Err("watch expired".into()),
        ]);

        let mut watcher = Watcher::start(config(), source).await.unwrap();

        assert_eq!(watcher.next().await.unwrap().len(), 1);
        assert_eq!(watcher.next().await.unwrap().len(), 2);
        assert!(matches!(
            watcher.next().await.unwrap_err(),
            WatchError::EventStream(_)
        ));
        assert!(matches!(
            watcher.next().await.unwrap_err(),
            WatchError::AlreadyStopped
        ));
    }
}
