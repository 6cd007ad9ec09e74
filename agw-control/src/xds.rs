//! Snapshot rebuild and fanout.
//!
//! The broadcast loop selects over file reloads and the Registry's dirty
//! signal; either rebuilds the merged snapshot and pushes it to every
//! subscriber over a capacity-1 channel with a non-blocking send, so one
//! stalled gateway can never hold back the rest.

use crate::registry::Registry;
use agw_core::{ConfigSnapshot, DiscoverSnapshots, Node, SnapshotStream, TlsConfig};
use anyhow::Result;
use futures::Stream;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

#[derive(Debug)]
pub struct Broadcaster {
    registry: Arc<Registry>,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    current: Option<ConfigSnapshot>,
    next_id: u64,
    subscribers: HashMap<u64, mpsc::Sender<ConfigSnapshot>>,
}

// === impl Broadcaster ===

impl Broadcaster {
    pub fn new(registry: Arc<Registry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            inner: Mutex::new(Inner::default()),
        })
    }

    /// Drives rebuilds until both inputs close.
    pub async fn run(
        self: Arc<Self>,
        mut file_rx: watch::Receiver<ConfigSnapshot>,
        mut dirty_rx: mpsc::Receiver<()>,
    ) {
        let initial = file_rx.borrow_and_update().clone();
        self.rebuild_and_broadcast(&initial);

        loop {
            tokio::select! {
                changed = file_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let static_snapshot = file_rx.borrow_and_update().clone();
                    self.rebuild_and_broadcast(&static_snapshot);
                }
                signal = dirty_rx.recv() => {
                    if signal.is_none() {
                        return;
                    }
                    let static_snapshot = file_rx.borrow().clone();
                    self.rebuild_and_broadcast(&static_snapshot);
                }
            }
        }
    }

    pub fn rebuild_and_broadcast(&self, static_snapshot: &ConfigSnapshot) {
        let suffix = chrono::Local::now().format("%H%M%S").to_string();
        let snapshot = rebuild_snapshot(static_snapshot, &self.registry, &suffix);
        debug!(
            version = %snapshot.version_id,
            routes = snapshot.routes.len(),
            clusters = snapshot.clusters.len(),
            listeners = snapshot.listeners.len(),
            "broadcasting snapshot"
        );

        let mut inner = self.inner.lock();
        inner.current = Some(snapshot.clone());
        inner.subscribers.retain(|id, tx| match tx.try_send(snapshot.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(subscriber = id, "subscriber lagging; dropping this update for it");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(subscriber = id, "subscriber gone; unregistering");
                false
            }
        });
    }

    /// Registers a subscriber and pre-loads the current snapshot.
    ///
    /// The pre-load is a `try_send` into the subscriber's own fresh
    /// capacity-1 channel: it cannot block registration and it cannot
    /// reorder ahead of a concurrent broadcast, since both happen under the
    /// subscriber lock.
    fn register(&self) -> (u64, mpsc::Receiver<ConfigSnapshot>) {
        let (tx, rx) = mpsc::channel(1);
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        if let Some(current) = inner.current.clone() {
            let _ = tx.try_send(current);
        }
        inner.subscribers.insert(id, tx);
        (id, rx)
    }

    fn unregister(&self, id: u64) {
        self.inner.lock().subscribers.remove(&id);
    }

    #[cfg(test)]
    fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

/// Merges the static snapshot with Registry state into the broadcastable
/// form: static routes/clusters first, secrets inlined, dangling references
/// dropped.
pub(crate) fn rebuild_snapshot(
    static_snapshot: &ConfigSnapshot,
    registry: &Registry,
    version_suffix: &str,
) -> ConfigSnapshot {
    // The static snapshot is shared with the file watcher; never mutate it
    // in place.
    let mut snapshot = static_snapshot.clone();

    snapshot.routes.extend(registry.list_routes());

    let mut names: HashSet<String> =
        snapshot.clusters.iter().map(|c| c.name.clone()).collect();
    for cluster in registry.list_clusters() {
        if !names.insert(cluster.name.clone()) {
            warn!(cluster = %cluster.name, "discovered cluster shadowed by static cluster");
            continue;
        }
        snapshot.clusters.push(cluster);
    }

    let listeners = std::mem::take(&mut snapshot.listeners);
    snapshot.listeners = listeners
        .into_iter()
        .filter_map(|mut listener| {
            let resolved = match &listener.tls {
                Some(TlsConfig::SecretName(name)) => match registry.get_secret(name) {
                    Some(secret) => Some(TlsConfig::Resolved {
                        cert_pem: String::from_utf8_lossy(&secret.cert).into_owned(),
                        key_pem: String::from_utf8_lossy(&secret.key).into_owned(),
                    }),
                    None => {
                        warn!(
                            listener = %listener.name,
                            secret = %name,
                            "TLS secret not found; dropping listener from this snapshot"
                        );
                        return None;
                    }
                },
                _ => None,
            };
            if resolved.is_some() {
                listener.tls = resolved;
            }
            Some(listener)
        })
        .collect();

    let cluster_names: HashSet<&str> =
        snapshot.clusters.iter().map(|c| c.name.as_str()).collect();
    snapshot.routes.retain(|route| {
        let resolved = cluster_names.contains(route.cluster_id.as_str());
        if !resolved {
            warn!(
                route = %route.path_prefix,
                cluster = %route.cluster_id,
                "route references unknown cluster; dropping from this snapshot"
            );
        }
        resolved
    });

    snapshot.version_id = format!("{}-k8s-{}", static_snapshot.version_id, version_suffix);
    snapshot
}

/// The subscription seam handed to the gRPC layer.
#[derive(Clone, Debug)]
pub struct Discover {
    broadcaster: Arc<Broadcaster>,
}

impl Discover {
    pub fn new(broadcaster: Arc<Broadcaster>) -> Self {
        Self { broadcaster }
    }
}

#[async_trait::async_trait]
impl DiscoverSnapshots for Discover {
    async fn subscribe(&self, node: Node) -> Result<SnapshotStream> {
        let (id, rx) = self.broadcaster.register();
        info!(
            node.id = %node.id,
            node.region = node.region.as_deref().unwrap_or(""),
            subscriber = id,
            "node subscribed"
        );
        Ok(Box::pin(Subscription {
            rx,
            _guard: SubscriptionGuard {
                id,
                node_id: node.id,
                broadcaster: self.broadcaster.clone(),
            },
        }))
    }
}

struct Subscription {
    rx: mpsc::Receiver<ConfigSnapshot>,
    _guard: SubscriptionGuard,
}

impl Stream for Subscription {
    type Item = ConfigSnapshot;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

struct SubscriptionGuard {
    id: u64,
    node_id: String,
    broadcaster: Arc<Broadcaster>,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        info!(node.id = %self.node_id, subscriber = self.id, "node unsubscribed");
        self.broadcaster.unregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agw_core::{Cluster, Endpoint, Listener, Route};
    use futures::StreamExt;

    fn static_snapshot() -> ConfigSnapshot {
        ConfigSnapshot {
            version_id: "v1-cafe0123".to_string(),
            listeners: vec![
                Listener {
                    name: "http".to_string(),
                    address: "0.0.0.0".to_string(),
                    port: 6188,
                    tls: None,
                },
                Listener {
                    name: "https".to_string(),
                    address: "0.0.0.0".to_string(),
                    port: 6443,
                    tls: Some(TlsConfig::SecretName("my-tls".to_string())),
                },
            ],
            routes: vec![Route {
                path_prefix: "/a".to_string(),
                cluster_id: "c1".to_string(),
                ..Default::default()
            }],
            clusters: vec![Cluster {
                name: "c1".to_string(),
                endpoints: vec![Endpoint {
                    address: "127.0.0.1".to_string(),
                    port: 8080,
                }],
            }],
            ..Default::default()
        }
    }

    #[test]
    fn rebuild_merges_static_first_and_resolves() {
        let (registry, _dirty_rx) = Registry::new();
        registry.upsert_cluster(
            "k8s/default/my-svc".to_string(),
            vec![Endpoint {
                address: "10.0.0.7".to_string(),
                port: 8080,
            }],
        );
        registry.set_crd_routes(vec![
            Route {
                path_prefix: "/api".to_string(),
                cluster_id: "k8s/default/my-svc".to_string(),
                ..Default::default()
            },
            Route {
                path_prefix: "/dangling".to_string(),
                cluster_id: "k8s/default/gone".to_string(),
                ..Default::default()
            },
        ]);
        registry.upsert_secret("my-tls".to_string(), b"CERT".to_vec(), b"KEY".to_vec());

        let snapshot = rebuild_snapshot(&static_snapshot(), &registry, "101112");

        assert_eq!(snapshot.version_id, "v1-cafe0123-k8s-101112");

        // Static routes first, dangling CRD route dropped.
        let prefixes: Vec<_> = snapshot.routes.iter().map(|r| r.path_prefix.as_str()).collect();
        assert_eq!(prefixes, vec!["/a", "/api"]);

        // Every remaining route resolves within the snapshot.
        for route in &snapshot.routes {
            assert!(snapshot.cluster(&route.cluster_id).is_some());
        }

        // Cluster names are unique.
        let mut names: Vec<_> = snapshot.clusters.iter().map(|c| c.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), snapshot.clusters.len());

        // TLS resolved inline.
        assert_eq!(
            snapshot.listeners[1].tls,
            Some(TlsConfig::Resolved {
                cert_pem: "CERT".to_string(),
                key_pem: "KEY".to_string(),
            })
        );
    }

    #[test]
    fn unresolved_secret_drops_the_listener() {
        let (registry, _dirty_rx) = Registry::new();
        let snapshot = rebuild_snapshot(&static_snapshot(), &registry, "000000");

        let names: Vec<_> = snapshot.listeners.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["http"]);
    }

    #[test]
    fn static_snapshot_is_never_mutated() {
        let (registry, _dirty_rx) = Registry::new();
        registry.upsert_secret("my-tls".to_string(), b"CERT".to_vec(), b"KEY".to_vec());

        let original = static_snapshot();
        let _ = rebuild_snapshot(&original, &registry, "000000");
        assert_eq!(original, static_snapshot());
    }

    #[tokio::test]
    async fn new_subscriber_receives_current_snapshot() {
        let (registry, _dirty_rx) = Registry::new();
        let broadcaster = Broadcaster::new(registry);
        broadcaster.rebuild_and_broadcast(&static_snapshot());

        let discover = Discover::new(broadcaster);
        let mut stream = discover
            .subscribe(Node {
                id: "dp-1".to_string(),
                ..Default::default()
            })
            .await
            .expect("subscribe");

        let snapshot = stream.next().await.expect("current snapshot");
        assert!(snapshot.version_id.starts_with("v1-cafe0123-k8s-"));
    }

    #[tokio::test]
    async fn lagging_subscriber_skips_to_a_later_snapshot() {
        let (registry, _dirty_rx) = Registry::new();
        let broadcaster = Broadcaster::new(registry);

        let discover = Discover::new(broadcaster.clone());
        let mut stream = discover
            .subscribe(Node {
                id: "dp-1".to_string(),
                ..Default::default()
            })
            .await
            .expect("subscribe");

        let mut static_snapshot = static_snapshot();
        for version in ["a", "b", "c"] {
            static_snapshot.version_id = version.to_string();
            broadcaster.rebuild_and_broadcast(&static_snapshot);
        }

        // The channel held only the first unread update; later ones were
        // dropped, and the next read observes a strictly later version.
        let first = stream.next().await.expect("first");
        assert!(first.version_id.starts_with("a-k8s-"));

        static_snapshot.version_id = "d".to_string();
        broadcaster.rebuild_and_broadcast(&static_snapshot);
        let next = stream.next().await.expect("next");
        assert!(next.version_id.starts_with("d-k8s-"));
    }

    #[tokio::test]
    async fn dropping_the_stream_unregisters() {
        let (registry, _dirty_rx) = Registry::new();
        let broadcaster = Broadcaster::new(registry);
        let discover = Discover::new(broadcaster.clone());

        let stream = discover
            .subscribe(Node {
                id: "dp-1".to_string(),
                ..Default::default()
            })
            .await
            .expect("subscribe");
        assert_eq!(broadcaster.subscriber_count(), 1);

        drop(stream);
        assert_eq!(broadcaster.subscriber_count(), 0);
    }
}
