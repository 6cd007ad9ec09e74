//! Listener lifecycle: materializes and tears down listening sockets as
//! snapshots change.
//!
//! Bound sockets are keyed by `(address, port)` and diffed against each new
//! snapshot: additions bind, removals stop accepting and drain their
//! connections in the background, and any change to a listener's declared
//! config (name, TLS material) is remove-then-add. A listener whose TLS is
//! still an unresolved reference is never bound.

use crate::proxy::{self, GatewayContext};
use agw_core::{Listener, TlsConfig};
use anyhow::{Context as _, Result};
use hyper::server::conn::Http;
use hyper::service::service_fn;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub async fn run(ctx: GatewayContext, drain: drain::Watch) {
    let mut snapshots = ctx.watch();
    let mut bound: HashMap<(String, u16), BoundListener> = HashMap::new();

    tokio::pin! {
        let shutdown = drain.signaled();
    }

    loop {
        let snapshot = ctx.current();
        reconcile(&mut bound, &snapshot.listeners, &ctx).await;

        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = &mut shutdown => break,
        }
    }

    info!("shutting down; closing all listeners");
    for (_, listener) in bound.drain() {
        listener.shutdown().await;
    }
}

async fn reconcile(
    bound: &mut HashMap<(String, u16), BoundListener>,
    listeners: &[Listener],
    ctx: &GatewayContext,
) {
    let mut desired: HashMap<(String, u16), &Listener> = HashMap::new();
    for listener in listeners {
        // The snapshot build already dropped unresolved TLS; never bind one.
        if matches!(listener.tls, Some(TlsConfig::SecretName(_))) {
            continue;
        }
        desired.insert((listener.address.clone(), listener.port), listener);
    }

    let existing: Vec<(String, u16)> = bound.keys().cloned().collect();
    for key in existing {
        let stale = match desired.get(&key) {
            None => true,
            Some(want) => **want != bound[&key].listener,
        };
        if stale {
            if let Some(listener) = bound.remove(&key) {
                info!(
                    listener = %listener.listener.name,
                    addr = %listener.local_addr,
                    "closing listener"
                );
                listener.close().await;
            }
        }
    }

    for (key, listener) in desired {
        if bound.contains_key(&key) {
            continue;
        }
        match bind(listener, ctx).await {
            Ok(b) => {
                info!(
                    listener = %listener.name,
                    addr = %b.local_addr,
                    tls = listener.tls.is_some(),
                    "listener bound"
                );
                bound.insert(key, b);
            }
            Err(error) => {
                warn!(listener = %listener.name, port = listener.port, %error, "failed to bind listener");
            }
        }
    }
}

struct BoundListener {
    listener: Listener,
    local_addr: SocketAddr,
    accept: tokio::task::JoinHandle<()>,
    signal: drain::Signal,
}

// === impl BoundListener ===

impl BoundListener {
    /// Stops accepting (the port closes as soon as the accept task is
    /// reaped) and drains in-flight connections in the background.
    async fn close(self) {
        let Self { accept, signal, .. } = self;
        accept.abort();
        let _ = accept.await;
        tokio::spawn(async move {
            signal.drain().await;
        });
    }

    /// Like `close`, but waits for in-flight connections. Used at process
    /// shutdown.
    async fn shutdown(self) {
        let Self { accept, signal, .. } = self;
        accept.abort();
        let _ = accept.await;
        signal.drain().await;
    }
}

async fn bind(config: &Listener, ctx: &GatewayContext) -> Result<BoundListener> {
    let tls = match &config.tls {
        Some(TlsConfig::Resolved { cert_pem, key_pem }) => Some(tls_acceptor(cert_pem, key_pem)?),
        Some(TlsConfig::SecretName(name)) => {
            anyhow::bail!("listener TLS reference {name} is unresolved")
        }
        None => None,
    };

    let addr = format!("{}:{}", config.address, config.port);
    let socket = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let local_addr = socket.local_addr().context("listener has no local addr")?;

    let (signal, watch) = drain::channel();
    let accept = tokio::spawn(accept_loop(socket, tls, ctx.clone(), watch));

    Ok(BoundListener {
        listener: config.clone(),
        local_addr,
        accept,
        signal,
    })
}

async fn accept_loop(
    socket: TcpListener,
    tls: Option<TlsAcceptor>,
    ctx: GatewayContext,
    watch: drain::Watch,
) {
    loop {
        let (stream, peer) = match socket.accept().await {
            Ok(conn) => conn,
            Err(error) => {
                warn!(%error, "accept failed");
                continue;
            }
        };
        let tls = tls.clone();
        let ctx = ctx.clone();
        let watch = watch.clone();
        tokio::spawn(async move {
            if let Err(error) = serve_connection(stream, peer, tls, ctx, watch).await {
                debug!(%error, %peer, "connection closed with error");
            }
        });
    }
}

trait Io: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin {}
impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin> Io for T {}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    tls: Option<TlsAcceptor>,
    ctx: GatewayContext,
    watch: drain::Watch,
) -> Result<()> {
    // Dropping this task (client disconnect, abort) cancels any outstanding
    // plugin host calls via the token's drop guard.
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();

    let service = service_fn(move |req| proxy::handle(req, ctx.clone(), peer, cancel.clone()));

    let io: Box<dyn Io> = match tls {
        Some(acceptor) => Box::new(
            acceptor
                .accept(stream)
                .await
                .context("TLS handshake failed")?,
        ),
        None => Box::new(stream),
    };

    let conn = Http::new().serve_connection(io, service);
    tokio::pin!(conn);
    tokio::select! {
        result = &mut conn => result.context("connection error"),
        handle = watch.signaled() => {
            conn.as_mut().graceful_shutdown();
            handle.release_after(conn).await.context("connection error during drain")
        }
    }
}

fn tls_acceptor(cert_pem: &str, key_pem: &str) -> Result<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut cert_pem.as_bytes())
        .context("invalid certificate PEM")?
        .into_iter()
        .map(rustls::Certificate)
        .collect::<Vec<_>>();
    anyhow::ensure!(!certs.is_empty(), "no certificates in PEM");

    let mut keys =
        rustls_pemfile::pkcs8_private_keys(&mut key_pem.as_bytes()).context("invalid key PEM")?;
    if keys.is_empty() {
        keys = rustls_pemfile::rsa_private_keys(&mut key_pem.as_bytes())
            .context("invalid key PEM")?;
    }
    let key = keys
        .into_iter()
        .next()
        .map(rustls::PrivateKey)
        .context("no private key in PEM")?;

    let mut config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid TLS material")?;
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}
