#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

use anyhow::Result;
use futures::prelude::*;
use std::{collections::BTreeMap, pin::Pin};

/// Models configuration snapshot discovery for connected gateway nodes.
///
/// Implemented by the control plane's broadcaster; consumed by the gRPC
/// transport layer. The returned stream yields every snapshot the node
/// should observe, starting with the current one, and unregisters the
/// node when dropped.
#[async_trait::async_trait]
pub trait DiscoverSnapshots {
    async fn subscribe(&self, node: Node) -> Result<SnapshotStream>;
}

pub type SnapshotStream = Pin<Box<dyn Stream<Item = ConfigSnapshot> + Send + Sync + 'static>>;

/// Identifies a data-plane instance. Sent once when a node subscribes.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Node {
    pub id: String,
    pub region: Option<String>,
    pub version: Option<String>,
}

/// The atomic unit of gateway configuration.
///
/// Snapshots are immutable once published. Route order is match precedence:
/// the first route whose predicate matches a request wins.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfigSnapshot {
    pub version_id: String,
    pub listeners: Vec<Listener>,
    pub routes: Vec<Route>,
    pub clusters: Vec<Cluster>,
    pub resources: ExternalResources,
}

impl ConfigSnapshot {
    pub fn empty(version_id: impl Into<String>) -> Self {
        Self {
            version_id: version_id.into(),
            ..Default::default()
        }
    }

    pub fn cluster(&self, name: &str) -> Option<&Cluster> {
        self.clusters.iter().find(|c| c.name == name)
    }
}

/// A socket the data plane should accept traffic on.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Listener {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub tls: Option<TlsConfig>,
}

/// Listener TLS material.
///
/// The control plane resolves `SecretName` references against the stored
/// K8s secrets before a snapshot leaves the process; data planes only ever
/// see the `Resolved` variant.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TlsConfig {
    /// An unresolved reference to a TLS secret by name.
    SecretName(String),
    /// Inlined PEM material, ready to build an acceptor from.
    Resolved { cert_pem: String, key_pem: String },
}

impl TlsConfig {
    pub fn is_resolved(&self) -> bool {
        matches!(self, TlsConfig::Resolved { .. })
    }
}

/// A path/domain predicate paired with a cluster target and plugin chain.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Route {
    pub path_prefix: String,
    pub domain: Option<String>,
    pub cluster_id: String,
    pub plugins: Vec<PluginSpec>,
}

/// A Wasm plugin attached to a route.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PluginSpec {
    /// Stable identifier, used for logging and caching.
    pub name: String,
    /// Filesystem path to the module, readable by the data plane.
    pub wasm_path: String,
    /// Opaque key/value configuration handed to each instance.
    pub config: BTreeMap<String, String>,
}

/// A named set of upstream endpoints.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Cluster {
    pub name: String,
    pub endpoints: Vec<Endpoint>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub address: String,
    pub port: u16,
}

impl Endpoint {
    pub fn authority(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }
}

/// Externally configured backends available to plugin host calls.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ExternalResources {
    pub redis: Vec<RedisConfig>,
    pub databases: Vec<DatabaseConfig>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RedisConfig {
    pub name: String,
    pub address: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub name: String,
    pub kind: DbKind,
    pub connection_string: String,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DbKind {
    Postgres,
    MySql,
}

#[derive(Clone, Debug, thiserror::Error)]
#[error("unsupported database type: {0}")]
pub struct InvalidDbKind(String);

impl std::str::FromStr for DbKind {
    type Err = InvalidDbKind;

    fn from_str(s: &str) -> Result<Self, InvalidDbKind> {
        match s {
            "postgres" => Ok(DbKind::Postgres),
            "mysql" => Ok(DbKind::MySql),
            s => Err(InvalidDbKind(s.to_string())),
        }
    }
}

impl std::fmt::Display for DbKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DbKind::Postgres => "postgres".fmt(f),
            DbKind::MySql => "mysql".fmt(f),
        }
    }
}

/// Builds the canonical cluster name for a Kubernetes service.
///
/// CRD-derived routes reference discovered clusters by this exact key.
pub fn k8s_cluster_name(namespace: &str, service: &str) -> String {
    format!("k8s/{namespace}/{service}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn db_kind_round_trips() {
        for kind in [DbKind::Postgres, DbKind::MySql] {
            assert_eq!(kind.to_string().parse::<DbKind>().unwrap(), kind);
        }
        assert!("sqlite".parse::<DbKind>().is_err());
    }

    #[test]
    fn k8s_cluster_names_are_stable() {
        assert_eq!(k8s_cluster_name("default", "my-svc"), "k8s/default/my-svc");
    }

    #[test]
    fn cluster_lookup_is_by_name() {
        let snapshot = ConfigSnapshot {
            clusters: vec![
                Cluster {
                    name: "a".to_string(),
                    endpoints: vec![],
                },
                Cluster {
                    name: "b".to_string(),
                    endpoints: vec![Endpoint {
                        address: "127.0.0.1".to_string(),
                        port: 8080,
                    }],
                },
            ],
            ..Default::default()
        };
        assert_eq!(snapshot.cluster("b").unwrap().endpoints.len(), 1);
        assert!(snapshot.cluster("c").is_none());
    }
}
