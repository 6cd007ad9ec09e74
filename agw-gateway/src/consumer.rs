//! The snapshot consumer: a long-lived stream from the control plane.
//!
//! Reconnects with exponential backoff, re-sending the node identity on
//! each attempt. Every received snapshot is validated, its plugin modules
//! compiled, its resource pools reconciled, and the result atomically
//! published to the hot path.

use crate::resources::Pools;
use crate::snapshot::{ActiveSnapshot, SharedSnapshot};
use crate::wasm::PluginEngine;
use agw_core::{ConfigSnapshot, Node};
use agw_proto::v1;
use agw_proto::v1::snapshot_discovery_client::SnapshotDiscoveryClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

const BACKOFF_MIN: Duration = Duration::from_millis(250);
const BACKOFF_MAX: Duration = Duration::from_secs(8);

pub async fn run(
    url: String,
    node: Node,
    publisher: watch::Sender<SharedSnapshot>,
    engine: Arc<PluginEngine>,
    pools: Arc<Pools>,
) {
    let mut backoff = BACKOFF_MIN;
    loop {
        match stream_once(&url, &node, &publisher, &engine, &pools, &mut backoff).await {
            Ok(()) => info!("control plane closed the stream; reconnecting"),
            Err(error) => warn!(%error, url = %url, "control plane connection failed"),
        }

        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(BACKOFF_MAX);
    }
}

async fn stream_once(
    url: &str,
    node: &Node,
    publisher: &watch::Sender<SharedSnapshot>,
    engine: &PluginEngine,
    pools: &Pools,
    backoff: &mut Duration,
) -> anyhow::Result<()> {
    let mut client = SnapshotDiscoveryClient::connect(url.to_string()).await?;
    info!(url = %url, node.id = %node.id, "subscribed to control plane");

    let response = client
        .stream_snapshots(v1::Node::from(node.clone()))
        .await?;
    let mut stream = response.into_inner();

    while let Some(wire) = stream.message().await? {
        // A healthy stream resets the reconnect backoff.
        *backoff = BACKOFF_MIN;
        apply(wire, publisher, engine, pools);
    }
    Ok(())
}

fn apply(
    wire: v1::ConfigSnapshot,
    publisher: &watch::Sender<SharedSnapshot>,
    engine: &PluginEngine,
    pools: &Pools,
) {
    let snapshot = ConfigSnapshot::from(wire);
    info!(
        version = %snapshot.version_id,
        listeners = snapshot.listeners.len(),
        routes = snapshot.routes.len(),
        clusters = snapshot.clusters.len(),
        "received snapshot"
    );

    pools.reconcile(&snapshot.resources);
    let active = ActiveSnapshot::build(snapshot, engine);
    let _ = publisher.send(Arc::new(active));
}
