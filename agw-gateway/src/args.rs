use crate::proxy::GatewayContext;
use crate::resources::Pools;
use crate::snapshot::ActiveSnapshot;
use crate::wasm::PluginEngine;
use crate::{consumer, listener};
use agw_core::Node;
use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, info_span, Instrument};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[clap(name = "agw-gateway", about = "AGW data plane")]
pub struct Args {
    #[clap(long, default_value = "info", env = "AGW_LOG")]
    log_level: String,

    /// Control plane snapshot stream, e.g. http://127.0.0.1:18000.
    #[clap(long, env = "AGW_CONTROL_PLANE_URL")]
    control_plane_url: String,

    /// Node identity sent at subscription; defaults to the hostname.
    #[clap(long, env = "AGW_NODE_ID")]
    node_id: Option<String>,

    #[clap(long, env = "AGW_REGION")]
    region: Option<String>,
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
            control_plane_url,
            node_id,
            region,
        } = self;

        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(log_level))
            .init();

        let node = Node {
            id: node_id
                .or_else(|| std::env::var("HOSTNAME").ok())
                .unwrap_or_else(|| "agw-gateway".to_string()),
            region,
            version: Some(env!("CARGO_PKG_VERSION").to_string()),
        };

        let engine = PluginEngine::new()?;
        let pools = Pools::new();
        let (snapshot_tx, snapshot_rx) = watch::channel(ActiveSnapshot::startup());
        let ctx = GatewayContext::new(snapshot_rx, pools.clone(), engine.clone());

        info!(node.id = %node.id, url = %control_plane_url, "starting gateway");
        tokio::spawn(
            consumer::run(control_plane_url, node, snapshot_tx, engine, pools)
                .instrument(info_span!("consumer")),
        );

        let (signal, drain) = drain::channel();
        tokio::spawn(async move {
            shutdown_signal().await;
            info!("shutdown signal received; draining");
            signal.drain().await;
        });

        listener::run(ctx, drain).await;
        Ok(())
    }
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
