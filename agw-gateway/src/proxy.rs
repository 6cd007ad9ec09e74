//! The request path: route match, plugin chain, upstream forwarding.
//!
//! A request clones the active snapshot `Arc` once at entry and uses it for
//! every decision until the response completes; a concurrent snapshot swap
//! never changes configuration mid-request.

use crate::resources::Pools;
use crate::snapshot::SharedSnapshot;
use crate::wasm::{ChainOutcome, PluginEngine};
use hyper::client::HttpConnector;
use hyper::header::{HeaderValue, HOST};
use hyper::{Body, Request, Response, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(15);

/// Everything a connection needs to serve requests.
#[derive(Clone)]
pub struct GatewayContext {
    snapshots: watch::Receiver<SharedSnapshot>,
    pub pools: Arc<Pools>,
    pub engine: Arc<PluginEngine>,
    client: hyper::Client<HttpConnector>,
}

// === impl GatewayContext ===

impl GatewayContext {
    pub fn new(
        snapshots: watch::Receiver<SharedSnapshot>,
        pools: Arc<Pools>,
        engine: Arc<PluginEngine>,
    ) -> Self {
        Self {
            snapshots,
            pools,
            engine,
            client: hyper::Client::builder().build_http(),
        }
    }

    pub fn current(&self) -> SharedSnapshot {
        self.snapshots.borrow().clone()
    }

    /// A receiver for snapshot-change notifications (listener manager).
    pub fn watch(&self) -> watch::Receiver<SharedSnapshot> {
        self.snapshots.clone()
    }
}

pub async fn handle(
    mut req: Request<Body>,
    ctx: GatewayContext,
    peer: SocketAddr,
    cancel: CancellationToken,
) -> Result<Response<Body>, Infallible> {
    let snapshot = ctx.current();

    let path = req.uri().path().to_string();
    let host = req
        .headers()
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    let Some(route) = snapshot.find_route(&path, host.as_deref()) else {
        return Ok(status_response(StatusCode::NOT_FOUND, "no route"));
    };

    if !route.plugins.is_empty() {
        match ctx
            .engine
            .run_chain(&snapshot, route, &ctx.pools, &cancel)
            .await
        {
            ChainOutcome::Allow => {}
            ChainOutcome::Deny { plugin, code } => {
                info!(
                    route = %route.path_prefix,
                    plugin = %plugin,
                    code,
                    "request denied by plugin"
                );
                return Ok(status_response(StatusCode::FORBIDDEN, "forbidden"));
            }
            ChainOutcome::Failed { plugin, error } => {
                warn!(route = %route.path_prefix, plugin = %plugin, %error, "plugin chain failed");
                return Ok(status_response(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "plugin failure",
                ));
            }
        }
    }

    let Some(endpoint) = snapshot.cluster(&route.cluster_id).and_then(|c| c.pick()) else {
        return Ok(status_response(StatusCode::BAD_GATEWAY, "no endpoints"));
    };

    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri = format!("http://{}{}", endpoint.authority(), path_and_query);
    match uri.parse() {
        Ok(uri) => *req.uri_mut() = uri,
        Err(error) => {
            warn!(%error, authority = %endpoint.authority(), "invalid upstream uri");
            return Ok(status_response(StatusCode::BAD_GATEWAY, "bad upstream"));
        }
    }

    // Drop the downstream Host so the client derives it from the rewritten
    // authority; the routing host was already captured above.
    req.headers_mut().remove(HOST);

    append_forwarded_for(&mut req, peer);
    if let Ok(value) = HeaderValue::from_str(&route.path_prefix) {
        req.headers_mut().insert("x-agw-route", value);
    }

    match tokio::time::timeout(UPSTREAM_TIMEOUT, ctx.client.request(req)).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(error)) => {
            warn!(%error, authority = %endpoint.authority(), "upstream request failed");
            Ok(status_response(StatusCode::BAD_GATEWAY, "upstream error"))
        }
        Err(_) => {
            warn!(authority = %endpoint.authority(), "upstream request timed out");
            Ok(status_response(StatusCode::BAD_GATEWAY, "upstream timeout"))
        }
    }
}

fn append_forwarded_for(req: &mut Request<Body>, peer: SocketAddr) {
    let client = peer.ip().to_string();
    let value = match req.headers().get("x-forwarded-for") {
        Some(existing) => match existing.to_str() {
            Ok(existing) => format!("{existing}, {client}"),
            Err(_) => client,
        },
        None => client,
    };
    if let Ok(value) = HeaderValue::from_str(&value) {
        req.headers_mut().insert("x-forwarded-for", value);
    }
}

fn status_response(status: StatusCode, message: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::from(message));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::ActiveSnapshot;
    use agw_core::{Cluster, ConfigSnapshot, Endpoint, Route};
    use hyper::service::{make_service_fn, service_fn};
    use std::net::TcpListener as StdTcpListener;

    fn context_for(snapshot: ConfigSnapshot) -> GatewayContext {
        let engine = PluginEngine::new().expect("engine");
        let active = Arc::new(ActiveSnapshot::build(snapshot, &engine));
        let (tx, rx) = watch::channel(active);
        std::mem::forget(tx);
        GatewayContext::new(rx, Pools::new(), engine)
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:55555".parse().expect("addr")
    }

    async fn roundtrip(ctx: &GatewayContext, req: Request<Body>) -> Response<Body> {
        handle(req, ctx.clone(), peer(), CancellationToken::new())
            .await
            .expect("infallible")
    }

    /// Serves 200 "hello from upstream" on an ephemeral port.
    async fn spawn_upstream() -> u16 {
        let listener = StdTcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        listener.set_nonblocking(true).expect("nonblocking");

        let make = make_service_fn(|_conn| async {
            Ok::<_, Infallible>(service_fn(|_req| async {
                Ok::<_, Infallible>(Response::new(Body::from("hello from upstream")))
            }))
        });
        let server = hyper::Server::from_tcp(listener).expect("server").serve(make);
        tokio::spawn(server);
        port
    }

    fn snapshot_with_cluster(endpoints: Vec<Endpoint>) -> ConfigSnapshot {
        ConfigSnapshot {
            version_id: "test".to_string(),
            routes: vec![Route {
                path_prefix: "/a".to_string(),
                cluster_id: "c1".to_string(),
                ..Default::default()
            }],
            clusters: vec![Cluster {
                name: "c1".to_string(),
                endpoints,
            }],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn unmatched_paths_get_404() {
        let ctx = context_for(snapshot_with_cluster(vec![]));
        let response = roundtrip(
            &ctx,
            Request::builder().uri("/b").body(Body::empty()).expect("request"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn empty_clusters_get_502() {
        let ctx = context_for(snapshot_with_cluster(vec![]));
        let response = roundtrip(
            &ctx,
            Request::builder().uri("/a").body(Body::empty()).expect("request"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }

    #[tokio::test]
    async fn matched_requests_are_proxied_upstream() {
        let port = spawn_upstream().await;
        let ctx = context_for(snapshot_with_cluster(vec![Endpoint {
            address: "127.0.0.1".to_string(),
            port,
        }]));

        // The downstream Host must not leak upstream; the client derives a
        // new one from the rewritten authority.
        let response = roundtrip(
            &ctx,
            Request::builder()
                .uri("/a/sub?q=1")
                .header("host", "gateway.example.com")
                .body(Body::empty())
                .expect("request"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = hyper::body::to_bytes(response.into_body()).await.expect("body");
        assert_eq!(&body[..], b"hello from upstream");
    }

    #[tokio::test]
    async fn unreachable_upstreams_get_502() {
        // A port from the ephemeral range with nothing listening.
        let ctx = context_for(snapshot_with_cluster(vec![Endpoint {
            address: "127.0.0.1".to_string(),
            port: 1,
        }]));

        let response = roundtrip(
            &ctx,
            Request::builder().uri("/a").body(Body::empty()).expect("request"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    }
}
