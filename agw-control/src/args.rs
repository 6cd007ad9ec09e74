use crate::{config, grpc, k8s, registry::Registry, xds};
use anyhow::Result;
use clap::Parser;
use futures::prelude::*;
use std::net::SocketAddr;
use std::path::PathBuf;
use tokio::sync::watch;
use tonic::transport::Server;
use tracing::{info, info_span, warn, Instrument};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[clap(name = "agw-control", about = "AGW control plane")]
pub struct Args {
    #[clap(long, default_value = "info", env = "AGW_LOG")]
    log_level: String,

    /// Port the snapshot gRPC server listens on.
    #[clap(long, default_value = "18000", env = "PORT")]
    port: u16,

    /// Static YAML configuration file.
    #[clap(long, default_value = "config.yaml", env = "AGW_CONFIG_PATH")]
    config_path: PathBuf,
}

// === impl Args ===

impl Args {
    #[inline]
    pub async fn parse_and_run() -> Result<()> {
        Self::parse().run().await
    }

    pub async fn run(self) -> Result<()> {
        let Self {
            log_level,
            port,
            config_path,
        } = self;

        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(log_level))
            .init();

        let initial = config::initial(&config_path);
        let (file_tx, file_rx) = watch::channel(initial);
        tokio::spawn(config::watch(config_path, file_tx).instrument(info_span!("config")));

        let (registry, dirty_rx) = Registry::new();
        // Without a cluster the control plane still serves the file
        // configuration; watchers are simply not spawned.
        if let Err(error) = k8s::spawn_watchers(registry.clone()).await {
            warn!(%error, "kubernetes unavailable; serving file configuration only");
        }

        let broadcaster = xds::Broadcaster::new(registry);
        tokio::spawn(
            broadcaster
                .clone()
                .run(file_rx, dirty_rx)
                .instrument(info_span!("broadcast")),
        );

        let (signal, drain) = drain::channel();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("shutdown signal received; draining");
            signal.drain().await;
        });

        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        serve_grpc(addr, xds::Discover::new(broadcaster), drain).await
    }
}

async fn serve_grpc(addr: SocketAddr, discover: xds::Discover, drain: drain::Watch) -> Result<()> {
    let svc = grpc::SnapshotServer::new(discover, drain.clone()).svc();

    let (close_tx, close_rx) = tokio::sync::oneshot::channel();
    tokio::pin! {
        let srv = Server::builder()
            .add_service(svc)
            .serve_with_shutdown(addr, close_rx.map(|_| ()));
    }

    info!(%addr, "snapshot gRPC server listening");
    tokio::select! {
        res = (&mut srv) => res?,
        handle = drain.signaled() => {
            let _ = close_tx.send(());
            handle.release_after(srv).await?;
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut terminate =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
