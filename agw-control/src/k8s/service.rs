//! Removes clusters when their owning `Service` goes away.
//!
//! Endpoint membership is driven entirely by EndpointSlices; the Service
//! watch only exists so a deleted Service takes its cluster record with it.

use crate::registry::Registry;
use agw_core::k8s_cluster_name;
use agw_k8s_api::{watcher, Api, Client, ResourceExt, Service, WatchStreamExt};
use futures::prelude::*;
use std::sync::Arc;
use tracing::{debug, warn};

pub async fn run(client: Client, registry: Arc<Registry>) {
    let api = Api::<Service>::all(client);
    let events = watcher(api, watcher::Config::default()).default_backoff();
    tokio::pin!(events);

    while let Some(event) = events.next().await {
        match event {
            Ok(watcher::Event::Deleted(service)) => delete(&registry, &service),
            Ok(watcher::Event::Applied(_)) | Ok(watcher::Event::Restarted(_)) => {}
            Err(error) => warn!(%error, "service watch failed; retrying"),
        }
    }
}

fn delete(registry: &Registry, service: &Service) {
    let namespace = service.namespace().unwrap_or_else(|| "default".to_string());
    let name = k8s_cluster_name(&namespace, &service.name_any());
    debug!(cluster = %name, "service deleted; removing cluster");
    registry.delete_cluster(&name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use agw_core::Endpoint;
    use agw_k8s_api::ObjectMeta;

    #[test]
    fn deletion_removes_the_cluster() {
        let (registry, _dirty_rx) = Registry::new();
        registry.upsert_cluster(
            "k8s/default/my-svc".to_string(),
            vec![Endpoint {
                address: "10.0.0.1".to_string(),
                port: 80,
            }],
        );

        let service = Service {
            metadata: ObjectMeta {
                name: Some("my-svc".to_string()),
                namespace: Some("default".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        delete(&registry, &service);

        assert!(registry.list_clusters().is_empty());
    }
}
