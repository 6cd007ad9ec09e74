//! The control plane's in-memory projection of Kubernetes-discovered state.
//!
//! All mutations go through one writer lock and then perform a non-blocking
//! enqueue onto a capacity-1 dirty channel, so watchers never stall on a slow
//! broadcast loop and at most one notification is ever pending.

use agw_core::{Cluster, Endpoint, Route};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::warn;

/// TLS material mirrored from a `kubernetes.io/tls` Secret.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TlsSecret {
    pub cert: Vec<u8>,
    pub key: Vec<u8>,
}

#[derive(Debug, Default)]
struct State {
    clusters: BTreeMap<String, Vec<Endpoint>>,
    crd_routes: Vec<Route>,
    secrets: BTreeMap<String, TlsSecret>,
}

#[derive(Debug)]
pub struct Registry {
    state: RwLock<State>,
    dirty: mpsc::Sender<()>,
}

// === impl Registry ===

impl Registry {
    /// Builds a registry and the dirty-signal receiver the broadcast loop
    /// selects on.
    pub fn new() -> (Arc<Self>, mpsc::Receiver<()>) {
        let (dirty, dirty_rx) = mpsc::channel(1);
        let registry = Arc::new(Self {
            state: RwLock::new(State::default()),
            dirty,
        });
        (registry, dirty_rx)
    }

    pub fn upsert_cluster(&self, name: String, endpoints: Vec<Endpoint>) {
        self.state.write().clusters.insert(name, endpoints);
        self.mark_dirty();
    }

    pub fn delete_cluster(&self, name: &str) {
        self.state.write().clusters.remove(name);
        self.mark_dirty();
    }

    /// Replaces the whole CRD-derived route list.
    pub fn set_crd_routes(&self, routes: Vec<Route>) {
        self.state.write().crd_routes = routes;
        self.mark_dirty();
    }

    pub fn upsert_secret(&self, name: String, cert: Vec<u8>, key: Vec<u8>) {
        if cert.is_empty() || key.is_empty() {
            warn!(secret = %name, "refusing to store empty TLS material");
            return;
        }
        self.state.write().secrets.insert(name, TlsSecret { cert, key });
        self.mark_dirty();
    }

    pub fn delete_secret(&self, name: &str) {
        self.state.write().secrets.remove(name);
        self.mark_dirty();
    }

    pub fn list_clusters(&self) -> Vec<Cluster> {
        self.state
            .read()
            .clusters
            .iter()
            .map(|(name, endpoints)| Cluster {
                name: name.clone(),
                endpoints: endpoints.clone(),
            })
            .collect()
    }

    pub fn list_routes(&self) -> Vec<Route> {
        self.state.read().crd_routes.clone()
    }

    pub fn get_secret(&self, name: &str) -> Option<TlsSecret> {
        self.state.read().secrets.get(name).cloned()
    }

    /// Signals the broadcast loop, dropping the signal if one is already
    /// pending. Mutations are unconditional signals; coalescing happens here.
    fn mark_dirty(&self) {
        let _ = self.dirty.try_send(());
    }
}
