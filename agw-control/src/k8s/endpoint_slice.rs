//! Translates `EndpointSlice` events into cluster records.
//!
//! Each slice carries the owning Service in the `kubernetes.io/service-name`
//! label; the derived cluster keeps the `k8s/<namespace>/<service>` key that
//! CRD routes reference. Only ready endpoints are kept; slice deletion leaves
//! an empty cluster so routes fail with 502 rather than 404.

use crate::registry::Registry;
use agw_core::{k8s_cluster_name, Endpoint};
use agw_k8s_api::{
    watcher, Api, Client, EndpointSlice, ResourceExt, WatchStreamExt, SERVICE_NAME_LABEL,
};
use futures::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

pub async fn run(client: Client, registry: Arc<Registry>) {
    let api = Api::<EndpointSlice>::all(client);
    let events = watcher(api, watcher::Config::default()).default_backoff();
    tokio::pin!(events);

    // Cluster names this watcher has produced, so a relist can reconcile
    // deletions that happened while the watch was down.
    let mut owned = BTreeSet::new();
    while let Some(event) = events.next().await {
        match event {
            Ok(watcher::Event::Applied(slice)) => apply(&registry, &mut owned, &slice),
            Ok(watcher::Event::Deleted(slice)) => delete(&registry, &mut owned, &slice),
            Ok(watcher::Event::Restarted(slices)) => restart(&registry, &mut owned, &slices),
            Err(error) => warn!(%error, "endpointslice watch failed; retrying"),
        }
    }
}

fn apply(registry: &Registry, owned: &mut BTreeSet<String>, slice: &EndpointSlice) {
    if let Some((name, endpoints)) = cluster_for_slice(slice) {
        debug!(cluster = %name, endpoints = endpoints.len(), "updating cluster");
        owned.insert(name.clone());
        registry.upsert_cluster(name, endpoints);
    }
}

fn delete(registry: &Registry, owned: &mut BTreeSet<String>, slice: &EndpointSlice) {
    if let Some((name, _)) = cluster_for_slice(slice) {
        debug!(cluster = %name, "slice deleted; emptying cluster");
        owned.insert(name.clone());
        registry.upsert_cluster(name, Vec::new());
    }
}

/// A relist is authoritative. Owned clusters with no backing slice in the
/// new set are emptied, exactly as the missed deletion event would have.
fn restart(registry: &Registry, owned: &mut BTreeSet<String>, slices: &[EndpointSlice]) {
    let mut current = BTreeSet::new();
    for slice in slices {
        if let Some((name, _)) = cluster_for_slice(slice) {
            current.insert(name);
        }
    }

    let stale: Vec<String> = owned.difference(&current).cloned().collect();
    for name in stale {
        debug!(cluster = %name, "slice gone after relist; emptying cluster");
        registry.upsert_cluster(name, Vec::new());
    }

    for slice in slices {
        apply(registry, owned, slice);
    }
}

/// Derives the cluster record for a slice, or `None` when the slice carries
/// no service-name label.
pub(crate) fn cluster_for_slice(slice: &EndpointSlice) -> Option<(String, Vec<Endpoint>)> {
    let service = slice.labels().get(SERVICE_NAME_LABEL)?;
    let namespace = slice.namespace().unwrap_or_else(|| "default".to_string());
    let name = k8s_cluster_name(&namespace, service);

    // The slice port applies to every endpoint; absent means 80.
    let port = slice
        .ports
        .as_deref()
        .and_then(<[_]>::first)
        .and_then(|p| p.port)
        .and_then(|p| u16::try_from(p).ok())
        .unwrap_or(80);

    let mut endpoints = Vec::new();
    for ep in &slice.endpoints {
        // Readiness is tri-state: only an explicit `false` excludes.
        if matches!(ep.conditions.as_ref().and_then(|c| c.ready), Some(false)) {
            continue;
        }
        for address in &ep.addresses {
            endpoints.push(Endpoint {
                address: address.clone(),
                port,
            });
        }
    }

    Some((name, endpoints))
}
