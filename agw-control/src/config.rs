//! Static file configuration.
//!
//! The YAML file is the first snapshot source: it is parsed into the core
//! model with a content-hash version, and a notify watcher republishes it on
//! change. Parse failures keep the previous snapshot.

use agw_core::{
    Cluster, ConfigSnapshot, DatabaseConfig, Endpoint, ExternalResources, Listener, PluginSpec,
    RedisConfig, Route, TlsConfig,
};
use anyhow::{bail, Context, Result};
use notify::{RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

/// Version id served before any file has been loaded.
pub const INIT_VERSION: &str = "init";

const DEBOUNCE: Duration = Duration::from_millis(200);

/// On-disk configuration shape. Listeners nest their routes; the snapshot
/// flattens them in listener order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub resources: ResourcesFile,
    #[serde(default)]
    pub listeners: Vec<ListenerFile>,
    #[serde(default)]
    pub clusters: Vec<ClusterFile>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourcesFile {
    #[serde(default)]
    pub redis: Vec<RedisFile>,
    #[serde(default)]
    pub databases: Vec<DatabaseFile>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RedisFile {
    pub name: String,
    pub address: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DatabaseFile {
    pub name: String,
    pub r#type: String,
    pub connection_string: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ListenerFile {
    pub name: String,
    #[serde(default = "default_address")]
    pub address: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsFile>,
    #[serde(default)]
    pub routes: Vec<RouteFile>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TlsFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_pem: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_pem: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RouteFile {
    pub path_prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    pub cluster_id: String,
    #[serde(default)]
    pub plugins: Vec<PluginFile>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PluginFile {
    pub name: String,
    pub wasm_path: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

fn default_address() -> String {
    "0.0.0.0".to_string()
}

// === impl ConfigFile ===

impl ConfigFile {
    pub fn into_snapshot(self, version_id: String) -> Result<ConfigSnapshot> {
        let mut redis = Vec::with_capacity(self.resources.redis.len());
        let mut seen = BTreeSet::new();
        for r in self.resources.redis {
            if !seen.insert(r.name.clone()) {
                bail!("duplicate redis resource name: {}", r.name);
            }
            redis.push(RedisConfig {
                name: r.name,
                address: r.address,
            });
        }

        let mut databases = Vec::with_capacity(self.resources.databases.len());
        let mut seen = BTreeSet::new();
        for db in self.resources.databases {
            if !seen.insert(db.name.clone()) {
                bail!("duplicate database resource name: {}", db.name);
            }
            let kind = db
                .r#type
                .parse()
                .with_context(|| format!("database {}", db.name))?;
            databases.push(DatabaseConfig {
                name: db.name,
                kind,
                connection_string: db.connection_string,
            });
        }

        let mut clusters = Vec::with_capacity(self.clusters.len());
        let mut seen = BTreeSet::new();
        for c in self.clusters {
            if !seen.insert(c.name.clone()) {
                bail!("duplicate cluster name: {}", c.name);
            }
            clusters.push(Cluster {
                name: c.name,
                endpoints: c
                    .endpoints
                    .into_iter()
                    .map(|ep| Endpoint {
                        address: ep.address,
                        port: ep.port,
                    })
                    .collect(),
            });
        }

        let mut listeners = Vec::with_capacity(self.listeners.len());
        let mut routes = Vec::new();
        for l in self.listeners {
            let tls = l.tls.map(TlsFile::into_tls).transpose()?;
            for r in l.routes {
                routes.push(Route {
                    path_prefix: r.path_prefix,
                    domain: r.domain,
                    cluster_id: r.cluster_id,
                    plugins: r
                        .plugins
                        .into_iter()
                        .map(|p| PluginSpec {
                            name: p.name,
                            wasm_path: p.wasm_path,
                            config: p.config,
                        })
                        .collect(),
                });
            }
            listeners.push(Listener {
                name: l.name,
                address: l.address,
                port: l.port,
                tls,
            });
        }

        Ok(ConfigSnapshot {
            version_id,
            listeners,
            routes,
            clusters,
            resources: ExternalResources { redis, databases },
        })
    }
}

impl TlsFile {
    fn into_tls(self) -> Result<TlsConfig> {
        match (self.cert_pem, self.key_pem, self.secret_name) {
            (Some(cert_pem), Some(key_pem), _) => Ok(TlsConfig::Resolved { cert_pem, key_pem }),
            (None, None, Some(name)) => Ok(TlsConfig::SecretName(name)),
            _ => bail!("tls requires either secret_name or both cert_pem and key_pem"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ClusterFile {
    pub name: String,
    #[serde(default)]
    pub endpoints: Vec<EndpointFile>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EndpointFile {
    pub address: String,
    pub port: u16,
}

/// Parses the file body, versioning the result by content hash.
pub fn parse(bytes: &[u8]) -> Result<ConfigSnapshot> {
    let file: ConfigFile =
        serde_yaml::from_slice(bytes).context("invalid configuration file")?;
    let version_id = version_for(file.version.as_deref(), bytes);
    file.into_snapshot(version_id)
}

pub fn load(path: &Path) -> Result<ConfigSnapshot> {
    let bytes =
        std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    parse(&bytes)
}

/// Loads the startup snapshot. A missing or broken file is not fatal: the
/// control plane serves the empty `init` snapshot until the file appears.
pub fn initial(path: &Path) -> ConfigSnapshot {
    match std::fs::read(path) {
        Ok(bytes) => match parse(&bytes) {
            Ok(snapshot) => {
                info!(path = %path.display(), version = %snapshot.version_id, "loaded configuration file");
                snapshot
            }
            Err(error) => {
                error!(path = %path.display(), %error, "failed to parse configuration file; starting empty");
                ConfigSnapshot::empty(INIT_VERSION)
            }
        },
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
            info!(path = %path.display(), "no configuration file; starting empty");
            ConfigSnapshot::empty(INIT_VERSION)
        }
        Err(error) => {
            error!(path = %path.display(), %error, "failed to read configuration file; starting empty");
            ConfigSnapshot::empty(INIT_VERSION)
        }
    }
}

/// Watches the configuration file and publishes reloads whose content hash
/// differs from the last published snapshot.
pub async fn watch(path: PathBuf, tx: watch::Sender<ConfigSnapshot>) {
    if let Err(error) = watch_inner(path, tx).await {
        error!(%error, "config watcher stopped; file edits will no longer be picked up");
    }
}

async fn watch_inner(path: PathBuf, tx: watch::Sender<ConfigSnapshot>) -> Result<()> {
    let (event_tx, mut event_rx) = mpsc::channel::<()>(1);

    // notify delivers on its own thread; bridge into the async world with a
    // lossy capacity-1 channel, since reloads coalesce anyway.
    let file_name = path.file_name().map(|n| n.to_os_string());
    let mut watcher = notify::recommended_watcher(
        move |res: std::result::Result<notify::Event, notify::Error>| match res {
            Ok(event) => {
                let relevant = event.paths.is_empty()
                    || event
                        .paths
                        .iter()
                        .any(|p| p.file_name().map(|n| n.to_os_string()) == file_name);
                if relevant {
                    let _ = event_tx.try_send(());
                }
            }
            Err(error) => warn!(%error, "config watch error"),
        },
    )?;

    // Watch the parent directory so renames and editor save patterns
    // (write-to-temp, rename-over) are observed.
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("failed to watch {}", dir.display()))?;

    let mut last_version = tx.borrow().version_id.clone();
    while event_rx.recv().await.is_some() {
        tokio::time::sleep(DEBOUNCE).await;
        while event_rx.try_recv().is_ok() {}

        match load(&path) {
            Ok(snapshot) if snapshot.version_id != last_version => {
                info!(version = %snapshot.version_id, "configuration file reloaded");
                last_version = snapshot.version_id.clone();
                let _ = tx.send(snapshot);
            }
            Ok(_) => {}
            Err(error) => {
                error!(%error, "failed to reload configuration; keeping previous snapshot");
            }
        }
    }
    Ok(())
}

fn version_for(version: Option<&str>, bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut hash = String::with_capacity(8);
    for b in &digest[..4] {
        let _ = write!(&mut hash, "{b:02x}");
    }
    format!("{}-{}", version.unwrap_or("v0"), hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
version: v3
resources:
  redis:
    - name: rl
      address: redis://127.0.0.1:6379
  databases:
    - name: main
      type: postgres
      connection_string: postgres://localhost/app
listeners:
  - name: http
    port: 6188
    routes:
      - path_prefix: /a
        cluster_id: c1
        plugins:
          - name: auth
            wasm_path: /plugins/auth.wasm
            config:
              mode: strict
  - name: https
    address: 127.0.0.1
    port: 6443
    tls:
      secret_name: my-tls
    routes:
      - path_prefix: /b
        domain: example.com
        cluster_id: c1
clusters:
  - name: c1
    endpoints:
      - address: 127.0.0.1
        port: 8080
"#;

    #[test]
    fn parses_and_flattens_listener_routes() {
        let snapshot = parse(SAMPLE.as_bytes()).expect("must parse");

        assert!(snapshot.version_id.starts_with("v3-"));
        assert_eq!(snapshot.listeners.len(), 2);
        assert_eq!(snapshot.listeners[0].address, "0.0.0.0");
        assert_eq!(
            snapshot.listeners[1].tls,
            Some(TlsConfig::SecretName("my-tls".to_string()))
        );

        // Routes flattened in listener order.
        let prefixes: Vec<_> = snapshot.routes.iter().map(|r| r.path_prefix.as_str()).collect();
        assert_eq!(prefixes, vec!["/a", "/b"]);
        assert_eq!(snapshot.routes[0].plugins.len(), 1);
        assert_eq!(snapshot.routes[1].domain.as_deref(), Some("example.com"));

        assert_eq!(snapshot.clusters.len(), 1);
        assert_eq!(snapshot.resources.redis.len(), 1);
        assert_eq!(snapshot.resources.databases.len(), 1);
    }

    #[test]
    fn version_tracks_content() {
        let a = parse(SAMPLE.as_bytes()).expect("must parse");
        let b = parse(SAMPLE.as_bytes()).expect("must parse");
        assert_eq!(a.version_id, b.version_id);

        let edited = SAMPLE.replace("/a", "/changed");
        let c = parse(edited.as_bytes()).expect("must parse");
        assert_ne!(a.version_id, c.version_id);
    }

    #[test]
    fn file_model_round_trips_losslessly() {
        let file: ConfigFile = serde_yaml::from_str(SAMPLE).expect("must parse");
        let reemitted = serde_yaml::to_string(&file).expect("must serialize");
        let reparsed: ConfigFile = serde_yaml::from_str(&reemitted).expect("must reparse");
        assert_eq!(file, reparsed);

        // Logical snapshot content is identical (versions pinned equal).
        let a = file.into_snapshot("v".to_string()).expect("snapshot");
        let b = reparsed.into_snapshot("v".to_string()).expect("snapshot");
        assert_eq!(a, b);
    }

    #[test]
    fn duplicate_cluster_names_are_rejected() {
        let yaml = r#"
clusters:
  - name: c1
  - name: c1
"#;
        assert!(parse(yaml.as_bytes()).is_err());
    }

    #[test]
    fn unknown_database_type_is_rejected() {
        let yaml = r#"
resources:
  databases:
    - name: d
      type: sqlite
      connection_string: sqlite://x
"#;
        assert!(parse(yaml.as_bytes()).is_err());
    }

    #[test]
    fn tls_without_material_or_reference_is_rejected() {
        let yaml = r#"
listeners:
  - name: https
    port: 6443
    tls: {}
"#;
        assert!(parse(yaml.as_bytes()).is_err());
    }

    #[test]
    fn missing_file_starts_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let snapshot = initial(&dir.path().join("nope.yaml"));
        assert_eq!(snapshot.version_id, INIT_VERSION);
        assert!(snapshot.listeners.is_empty());
    }
}
