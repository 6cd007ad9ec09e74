//! Conversions between the wire schema and the `agw-core` model.
//!
//! Core → proto is total. Proto → core is tolerant: entries that cannot be
//! represented (out-of-range ports, unknown database kinds) are dropped with
//! a warning rather than failing the whole snapshot, since the data plane
//! re-validates everything it applies.

use crate::v1;
use agw_core as model;
use tracing::warn;

// === Node ===

impl From<model::Node> for v1::Node {
    fn from(node: model::Node) -> Self {
        Self {
            id: node.id,
            region: node.region.unwrap_or_default(),
            version: node.version.unwrap_or_default(),
        }
    }
}

impl From<v1::Node> for model::Node {
    fn from(node: v1::Node) -> Self {
        let region = (!node.region.is_empty()).then_some(node.region);
        let version = (!node.version.is_empty()).then_some(node.version);
        Self {
            id: node.id,
            region,
            version,
        }
    }
}

// === ConfigSnapshot ===

impl From<model::ConfigSnapshot> for v1::ConfigSnapshot {
    fn from(snapshot: model::ConfigSnapshot) -> Self {
        Self {
            version_id: snapshot.version_id,
            listeners: snapshot.listeners.into_iter().map(Into::into).collect(),
            routes: snapshot.routes.into_iter().map(Into::into).collect(),
            clusters: snapshot.clusters.into_iter().map(Into::into).collect(),
            resources: Some(snapshot.resources.into()),
        }
    }
}

impl From<v1::ConfigSnapshot> for model::ConfigSnapshot {
    fn from(snapshot: v1::ConfigSnapshot) -> Self {
        Self {
            version_id: snapshot.version_id,
            listeners: snapshot
                .listeners
                .into_iter()
                .filter_map(listener_from_proto)
                .collect(),
            routes: snapshot.routes.into_iter().map(Into::into).collect(),
            clusters: snapshot.clusters.into_iter().map(Into::into).collect(),
            resources: snapshot.resources.map(Into::into).unwrap_or_default(),
        }
    }
}

// === Listener ===

impl From<model::Listener> for v1::Listener {
    fn from(listener: model::Listener) -> Self {
        Self {
            name: listener.name,
            address: listener.address,
            port: listener.port.into(),
            tls: listener.tls.map(Into::into),
        }
    }
}

fn listener_from_proto(listener: v1::Listener) -> Option<model::Listener> {
    let port = match u16::try_from(listener.port) {
        Ok(port) => port,
        Err(_) => {
            warn!(listener = %listener.name, port = listener.port, "listener port out of range");
            return None;
        }
    };
    Some(model::Listener {
        name: listener.name,
        address: listener.address,
        port,
        tls: listener.tls.and_then(tls_from_proto),
    })
}

impl From<model::TlsConfig> for v1::TlsConfig {
    fn from(tls: model::TlsConfig) -> Self {
        match tls {
            model::TlsConfig::SecretName(secret_name) => Self {
                secret_name,
                ..Default::default()
            },
            model::TlsConfig::Resolved { cert_pem, key_pem } => Self {
                cert_pem,
                key_pem,
                ..Default::default()
            },
        }
    }
}

fn tls_from_proto(tls: v1::TlsConfig) -> Option<model::TlsConfig> {
    if !tls.cert_pem.is_empty() && !tls.key_pem.is_empty() {
        return Some(model::TlsConfig::Resolved {
            cert_pem: tls.cert_pem,
            key_pem: tls.key_pem,
        });
    }
    if !tls.secret_name.is_empty() {
        return Some(model::TlsConfig::SecretName(tls.secret_name));
    }
    None
}

// === Route ===

impl From<model::Route> for v1::Route {
    fn from(route: model::Route) -> Self {
        Self {
            path_prefix: route.path_prefix,
            domain: route.domain.unwrap_or_default(),
            cluster_id: route.cluster_id,
            plugins: route.plugins.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<v1::Route> for model::Route {
    fn from(route: v1::Route) -> Self {
        let domain = (!route.domain.is_empty()).then_some(route.domain);
        Self {
            path_prefix: route.path_prefix,
            domain,
            cluster_id: route.cluster_id,
            plugins: route.plugins.into_iter().map(Into::into).collect(),
        }
    }
}

impl From<model::PluginSpec> for v1::Plugin {
    fn from(plugin: model::PluginSpec) -> Self {
        Self {
            name: plugin.name,
            wasm_path: plugin.wasm_path,
            config: plugin.config.into_iter().collect(),
        }
    }
}

impl From<v1::Plugin> for model::PluginSpec {
    fn from(plugin: v1::Plugin) -> Self {
        Self {
            name: plugin.name,
            wasm_path: plugin.wasm_path,
            config: plugin.config.into_iter().collect(),
        }
    }
}

// === Cluster ===

impl From<model::Cluster> for v1::Cluster {
    fn from(cluster: model::Cluster) -> Self {
        Self {
            name: cluster.name,
            endpoints: cluster
                .endpoints
                .into_iter()
                .map(|ep| v1::Endpoint {
                    address: ep.address,
                    port: ep.port.into(),
                })
                .collect(),
        }
    }
}

impl From<v1::Cluster> for model::Cluster {
    fn from(cluster: v1::Cluster) -> Self {
        let name = cluster.name;
        let endpoints = cluster
            .endpoints
            .into_iter()
            .filter_map(|ep| match u16::try_from(ep.port) {
                Ok(port) => Some(model::Endpoint {
                    address: ep.address,
                    port,
                }),
                Err(_) => {
                    warn!(cluster = %name, port = ep.port, "endpoint port out of range");
                    None
                }
            })
            .collect();
        Self { name, endpoints }
    }
}

// === ExternalResources ===

impl From<model::ExternalResources> for v1::ExternalResources {
    fn from(resources: model::ExternalResources) -> Self {
        Self {
            redis: resources
                .redis
                .into_iter()
                .map(|r| v1::RedisConfig {
                    name: r.name,
                    address: r.address,
                })
                .collect(),
            databases: resources
                .databases
                .into_iter()
                .map(|db| v1::DatabaseConfig {
                    name: db.name,
                    r#type: db.kind.to_string(),
                    connection_string: db.connection_string,
                })
                .collect(),
        }
    }
}

impl From<v1::ExternalResources> for model::ExternalResources {
    fn from(resources: v1::ExternalResources) -> Self {
        Self {
            redis: resources
                .redis
                .into_iter()
                .map(|r| model::RedisConfig {
                    name: r.name,
                    address: r.address,
                })
                .collect(),
            databases: resources
                .databases
                .into_iter()
                .filter_map(|db| match db.r#type.parse::<model::DbKind>() {
                    Ok(kind) => Some(model::DatabaseConfig {
                        name: db.name,
                        kind,
                        connection_string: db.connection_string,
                    }),
                    Err(error) => {
                        warn!(database = %db.name, %error, "dropping database resource");
                        None
                    }
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::v1;
    use agw_core as model;
    use std::collections::BTreeMap;

    fn sample() -> model::ConfigSnapshot {
        model::ConfigSnapshot {
            version_id: "v1-abc123".to_string(),
            listeners: vec![
                model::Listener {
                    name: "http".to_string(),
                    address: "0.0.0.0".to_string(),
                    port: 6188,
                    tls: None,
                },
                model::Listener {
                    name: "https".to_string(),
                    address: "0.0.0.0".to_string(),
                    port: 6443,
                    tls: Some(model::TlsConfig::Resolved {
                        cert_pem: "CERT".to_string(),
                        key_pem: "KEY".to_string(),
                    }),
                },
            ],
            routes: vec![model::Route {
                path_prefix: "/api".to_string(),
                domain: Some("example.com".to_string()),
                cluster_id: "k8s/default/my-svc".to_string(),
                plugins: vec![model::PluginSpec {
                    name: "auth".to_string(),
                    wasm_path: "/plugins/auth.wasm".to_string(),
                    config: BTreeMap::from([("mode".to_string(), "strict".to_string())]),
                }],
            }],
            clusters: vec![model::Cluster {
                name: "k8s/default/my-svc".to_string(),
                endpoints: vec![model::Endpoint {
                    address: "10.0.0.7".to_string(),
                    port: 8080,
                }],
            }],
            resources: model::ExternalResources {
                redis: vec![model::RedisConfig {
                    name: "rl".to_string(),
                    address: "redis://127.0.0.1:6379".to_string(),
                }],
                databases: vec![model::DatabaseConfig {
                    name: "main".to_string(),
                    kind: model::DbKind::Postgres,
                    connection_string: "postgres://localhost/app".to_string(),
                }],
            },
        }
    }

    #[test]
    fn snapshot_round_trips() {
        let snapshot = sample();
        let wire: v1::ConfigSnapshot = snapshot.clone().into();
        let back: model::ConfigSnapshot = wire.into();
        assert_eq!(back, snapshot);
    }

    #[test]
    fn unknown_database_kind_is_dropped() {
        let wire = v1::ExternalResources {
            redis: vec![],
            databases: vec![v1::DatabaseConfig {
                name: "bad".to_string(),
                r#type: "sqlite".to_string(),
                connection_string: "sqlite://x".to_string(),
            }],
        };
        let resources: model::ExternalResources = wire.into();
        assert!(resources.databases.is_empty());
    }

    #[test]
    fn out_of_range_listener_port_is_dropped() {
        let wire = v1::ConfigSnapshot {
            version_id: "v".to_string(),
            listeners: vec![v1::Listener {
                name: "bad".to_string(),
                address: "0.0.0.0".to_string(),
                port: 70_000,
                tls: None,
            }],
            ..Default::default()
        };
        let snapshot: model::ConfigSnapshot = wire.into();
        assert!(snapshot.listeners.is_empty());
    }

    #[test]
    fn node_empty_strings_become_none() {
        let node: model::Node = v1::Node {
            id: "dp-1".to_string(),
            region: String::new(),
            version: "0.1.0".to_string(),
        }
        .into();
        assert_eq!(node.region, None);
        assert_eq!(node.version.as_deref(), Some("0.1.0"));
    }
}
