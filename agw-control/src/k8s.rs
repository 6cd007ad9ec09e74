//! Kubernetes controllers.
//!
//! One watcher task per resource kind, each translating events into Registry
//! mutations. Watch errors are retried with backoff and never tear down the
//! process; a full re-list (`Restarted`) converges to the same state as the
//! event stream it replaces.

pub mod endpoint_slice;
pub mod gateway_route;
pub mod secret;
pub mod service;

use crate::registry::Registry;
use agw_k8s_api::Client;
use anyhow::Result;
use std::sync::Arc;
use tracing::{info, info_span, Instrument};

/// Connects to the cluster and spawns all resource watchers.
///
/// Client construction follows kube's default resolution: in-cluster config,
/// then `KUBECONFIG`, then `~/.kube/config`. Failure to build a client is
/// reported to the caller, which degrades to file-only configuration.
pub async fn spawn_watchers(registry: Arc<Registry>) -> Result<()> {
    let client = Client::try_default().await?;
    info!("kubernetes watchers starting");

    tokio::spawn(
        endpoint_slice::run(client.clone(), registry.clone())
            .instrument(info_span!("endpointslices")),
    );
    tokio::spawn(
        service::run(client.clone(), registry.clone()).instrument(info_span!("services")),
    );
    tokio::spawn(
        gateway_route::run(client.clone(), registry.clone())
            .instrument(info_span!("gatewayroutes")),
    );
    tokio::spawn(secret::run(client, registry).instrument(info_span!("secrets")));

    Ok(())
}
