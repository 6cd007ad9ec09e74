//! The data plane's validated, hot-swappable view of a configuration
//! snapshot.
//!
//! Built once per received snapshot and published as an `Arc` over a watch
//! channel: request tasks clone the `Arc` at entry and keep it until the
//! response completes, so a swap never changes the configuration under an
//! in-flight request and old snapshots die with their last reference.

use crate::router;
use crate::wasm::PluginEngine;
use agw_core::{ConfigSnapshot, Endpoint, ExternalResources, Listener, Route, TlsConfig};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::warn;

pub type SharedSnapshot = Arc<ActiveSnapshot>;

/// Module compilation outcome for one wasm path, valid for this snapshot.
pub type ModuleResult = Result<wasmtime::Module, String>;

pub struct ActiveSnapshot {
    pub version_id: String,
    pub listeners: Vec<Listener>,
    pub routes: Vec<Route>,
    pub resources: ExternalResources,
    clusters: HashMap<String, ClusterState>,
    plugins: HashMap<String, ModuleResult>,
}

#[derive(Debug)]
pub struct ClusterState {
    endpoints: Vec<Endpoint>,
    next: AtomicUsize,
}

// === impl ClusterState ===

impl ClusterState {
    fn new(endpoints: Vec<Endpoint>) -> Self {
        Self {
            endpoints,
            next: AtomicUsize::new(0),
        }
    }

    /// Round-robin endpoint choice; `None` when the cluster is empty.
    pub fn pick(&self) -> Option<&Endpoint> {
        if self.endpoints.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.endpoints.len();
        Some(&self.endpoints[index])
    }
}

// === impl ActiveSnapshot ===

impl ActiveSnapshot {
    /// The pre-subscription state: no listeners, so no traffic is accepted
    /// until the first snapshot arrives.
    pub fn startup() -> SharedSnapshot {
        Arc::new(Self {
            version_id: "startup".to_string(),
            listeners: Vec::new(),
            routes: Vec::new(),
            resources: ExternalResources::default(),
            clusters: HashMap::new(),
            plugins: HashMap::new(),
        })
    }

    /// Validates a received snapshot and pre-compiles its plugin modules.
    ///
    /// Routes with dangling cluster references are dropped with a warning;
    /// listeners whose TLS never resolved are dropped (the control plane
    /// should not have sent them). Compile failures are recorded so routed
    /// requests fail with 500 until a later snapshot retries the path.
    pub fn build(snapshot: ConfigSnapshot, engine: &PluginEngine) -> Self {
        let ConfigSnapshot {
            version_id,
            listeners,
            mut routes,
            clusters,
            resources,
        } = snapshot;

        let cluster_names: HashSet<&str> = clusters.iter().map(|c| c.name.as_str()).collect();
        routes.retain(|route| {
            let resolved = cluster_names.contains(route.cluster_id.as_str());
            if !resolved {
                warn!(
                    route = %route.path_prefix,
                    cluster = %route.cluster_id,
                    "route references unknown cluster; dropping"
                );
            }
            resolved
        });

        let listeners = listeners
            .into_iter()
            .filter(|listener| {
                let ok = !matches!(listener.tls, Some(TlsConfig::SecretName(_)));
                if !ok {
                    warn!(listener = %listener.name, "unresolved TLS reference; dropping listener");
                }
                ok
            })
            .collect();

        let plugins = engine.prepare(&routes);
        let clusters = clusters
            .into_iter()
            .map(|c| (c.name, ClusterState::new(c.endpoints)))
            .collect();

        Self {
            version_id,
            listeners,
            routes,
            resources,
            clusters,
            plugins,
        }
    }

    pub fn find_route(&self, path: &str, host: Option<&str>) -> Option<&Route> {
        router::find_route(&self.routes, path, host)
    }

    pub fn cluster(&self, name: &str) -> Option<&ClusterState> {
        self.clusters.get(name)
    }

    /// Compilation outcome for a wasm path referenced by this snapshot.
    pub fn plugin_module(&self, wasm_path: &str) -> Option<&ModuleResult> {
        self.plugins.get(wasm_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agw_core::Cluster;

    fn engine() -> Arc<PluginEngine> {
        PluginEngine::new().expect("engine")
    }

    fn snapshot_with_routes(routes: Vec<Route>) -> ConfigSnapshot {
        ConfigSnapshot {
            version_id: "test".to_string(),
            routes,
            clusters: vec![Cluster {
                name: "c1".to_string(),
                endpoints: vec![
                    Endpoint {
                        address: "10.0.0.1".to_string(),
                        port: 8080,
                    },
                    Endpoint {
                        address: "10.0.0.2".to_string(),
                        port: 8080,
                    },
                ],
            }],
            ..Default::default()
        }
    }

    #[test]
    fn dangling_routes_are_dropped() {
        let snapshot = snapshot_with_routes(vec![
            Route {
                path_prefix: "/ok".to_string(),
                cluster_id: "c1".to_string(),
                ..Default::default()
            },
            Route {
                path_prefix: "/dangling".to_string(),
                cluster_id: "missing".to_string(),
                ..Default::default()
            },
        ]);

        let active = ActiveSnapshot::build(snapshot, &engine());
        let prefixes: Vec<_> = active.routes.iter().map(|r| r.path_prefix.as_str()).collect();
        assert_eq!(prefixes, vec!["/ok"]);
    }

    #[test]
    fn unresolved_tls_listener_is_dropped() {
        let mut snapshot = snapshot_with_routes(vec![]);
        snapshot.listeners = vec![
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
                tls: Some(TlsConfig::SecretName("gone".to_string())),
            },
        ];

        let active = ActiveSnapshot::build(snapshot, &engine());
        let names: Vec<_> = active.listeners.iter().map(|l| l.name.as_str()).collect();
        assert_eq!(names, vec!["http"]);
    }

    #[test]
    fn endpoints_rotate_round_robin() {
        let active = ActiveSnapshot::build(snapshot_with_routes(vec![]), &engine());
        let cluster = active.cluster("c1").expect("cluster");

        let picks: Vec<_> = (0..4)
            .map(|_| cluster.pick().expect("endpoint").address.clone())
            .collect();
        assert_eq!(picks, vec!["10.0.0.1", "10.0.0.2", "10.0.0.1", "10.0.0.2"]);
    }

    #[test]
    fn empty_cluster_picks_nothing() {
        let mut snapshot = snapshot_with_routes(vec![]);
        snapshot.clusters[0].endpoints.clear();

        let active = ActiveSnapshot::build(snapshot, &engine());
        assert!(active.cluster("c1").expect("cluster").pick().is_none());
    }

    #[test]
    fn missing_plugin_file_is_recorded_as_failure() {
        let snapshot = snapshot_with_routes(vec![Route {
            path_prefix: "/p".to_string(),
            cluster_id: "c1".to_string(),
            plugins: vec![agw_core::PluginSpec {
                name: "ghost".to_string(),
                wasm_path: "/nonexistent/ghost.wasm".to_string(),
                config: Default::default(),
            }],
            ..Default::default()
        }]);

        let active = ActiveSnapshot::build(snapshot, &engine());
        let result = active.plugin_module("/nonexistent/ghost.wasm").expect("recorded");
        assert!(result.is_err());
    }
}
