//! Materializes `GatewayRoute` resources into the Registry's route list.
//!
//! Every event rebuilds the full list from a local cache and replaces it
//! atomically, so ordering is deterministic (by namespace, then name) and
//! deleted resources simply stop appearing.

use crate::registry::Registry;
use agw_core::{k8s_cluster_name, PluginSpec, Route};
use agw_k8s_api::{watcher, Api, Client, GatewayRoute, ResourceExt, WatchStreamExt};
use futures::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub async fn run(client: Client, registry: Arc<Registry>) {
    let api = Api::<GatewayRoute>::all(client);
    let events = watcher(api, watcher::Config::default()).default_backoff();
    tokio::pin!(events);

    let mut cache = BTreeMap::new();
    while let Some(event) = events.next().await {
        match event {
            Ok(watcher::Event::Applied(route)) => {
                cache.insert(cache_key(&route), route);
            }
            Ok(watcher::Event::Deleted(route)) => {
                cache.remove(&cache_key(&route));
            }
            Ok(watcher::Event::Restarted(routes)) => {
                cache.clear();
                cache.extend(routes.into_iter().map(|r| (cache_key(&r), r)));
            }
            Err(error) => {
                warn!(%error, "gatewayroute watch failed; retrying");
                continue;
            }
        }
        registry.set_crd_routes(routes_from_cache(&cache));
    }
}

fn cache_key(route: &GatewayRoute) -> (String, String) {
    let namespace = route.namespace().unwrap_or_else(|| "default".to_string());
    (namespace, route.name_any())
}

pub(crate) fn routes_from_cache(cache: &BTreeMap<(String, String), GatewayRoute>) -> Vec<Route> {
    cache.values().filter_map(route_for_crd).collect()
}

/// Builds a route from a resource, or `None` when required spec fields are
/// missing.
pub(crate) fn route_for_crd(resource: &GatewayRoute) -> Option<Route> {
    let spec = &resource.spec;
    let (path_prefix, service) = match (
        spec.r#match.clone(),
        spec.backend.as_ref().and_then(|b| b.service_name.clone()),
    ) {
        (Some(path_prefix), Some(service)) => (path_prefix, service),
        _ => {
            debug!(route = %resource.name_any(), "incomplete GatewayRoute spec; skipping");
            return None;
        }
    };

    let namespace = resource.namespace().unwrap_or_else(|| "default".to_string());
    let plugins = spec
        .plugins
        .iter()
        .flatten()
        .map(|p| PluginSpec {
            name: p.name.clone(),
            wasm_path: p.wasm_path.clone(),
            config: p.config.clone(),
        })
        .collect();

    Some(Route {
        path_prefix,
        domain: None,
        cluster_id: k8s_cluster_name(&namespace, &service),
        plugins,
    })
}
