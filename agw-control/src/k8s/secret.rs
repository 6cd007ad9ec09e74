//! Mirrors TLS secrets into the Registry for listener resolution.
//!
//! Only `kubernetes.io/tls` secrets with non-empty `tls.crt` and `tls.key`
//! are stored; everything else is ignored.

use crate::registry::Registry;
use agw_k8s_api::{watcher, Api, Client, ResourceExt, Secret, WatchStreamExt, TLS_SECRET_TYPE};
use futures::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

pub async fn run(client: Client, registry: Arc<Registry>) {
    let api = Api::<Secret>::all(client);
    let events = watcher(api, watcher::Config::default()).default_backoff();
    tokio::pin!(events);

    // Names this watcher has stored, so a relist can reconcile deletions
    // that happened while the watch was down.
    let mut owned = BTreeSet::new();
    while let Some(event) = events.next().await {
        match event {
            Ok(watcher::Event::Applied(secret)) => apply(&registry, &mut owned, &secret),
            Ok(watcher::Event::Deleted(secret)) => {
                debug!(secret = %secret.name_any(), "secret deleted");
                owned.remove(&secret.name_any());
                registry.delete_secret(&secret.name_any());
            }
            Ok(watcher::Event::Restarted(secrets)) => restart(&registry, &mut owned, &secrets),
            Err(error) => warn!(%error, "secret watch failed; retrying"),
        }
    }
}

fn apply(registry: &Registry, owned: &mut BTreeSet<String>, secret: &Secret) {
    if let Some((cert, key)) = tls_material(secret) {
        debug!(secret = %secret.name_any(), "storing TLS material");
        owned.insert(secret.name_any());
        registry.upsert_secret(secret.name_any(), cert, key);
    }
}

/// A relist is authoritative. Stored secrets whose backing object vanished,
/// or is no longer TLS-shaped, are removed.
fn restart(registry: &Registry, owned: &mut BTreeSet<String>, secrets: &[Secret]) {
    let current: BTreeSet<String> = secrets
        .iter()
        .filter(|secret| tls_material(secret).is_some())
        .map(|secret| secret.name_any())
        .collect();

    let stale: Vec<String> = owned.difference(&current).cloned().collect();
    for name in stale {
        debug!(secret = %name, "secret gone after relist; removing");
        owned.remove(&name);
        registry.delete_secret(&name);
    }

    for secret in secrets {
        apply(registry, owned, secret);
    }
}

/// Extracts cert/key bytes from a TLS-typed secret, or `None` for any other
/// shape.
pub(crate) fn tls_material(secret: &Secret) -> Option<(Vec<u8>, Vec<u8>)> {
    if secret.type_.as_deref() != Some(TLS_SECRET_TYPE) {
        return None;
    }
    let data = secret.data.as_ref()?;
    let cert = data.get("tls.crt")?.0.clone();
    let key = data.get("tls.key")?.0.clone();
    if cert.is_empty() || key.is_empty() {
        return None;
    }
    Some((cert, key))
}
