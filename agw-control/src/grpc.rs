//! The snapshot transport: a single server-streaming RPC.
//!
//! Generic over the core `DiscoverSnapshots` seam so tests can drive it
//! without a broadcaster. Streams close when the client disconnects (tonic
//! drops the stream, unregistering the subscriber) or when the process
//! drains.

use agw_core::{DiscoverSnapshots, Node, SnapshotStream};
use agw_proto::v1;
use agw_proto::v1::snapshot_discovery_server::{SnapshotDiscovery, SnapshotDiscoveryServer};
use futures::prelude::*;
use std::pin::Pin;

#[derive(Clone, Debug)]
pub struct SnapshotServer<T> {
    discover: T,
    drain: drain::Watch,
}

// === impl SnapshotServer ===

impl<T> SnapshotServer<T>
where
    T: DiscoverSnapshots + Send + Sync + 'static,
{
    pub fn new(discover: T, drain: drain::Watch) -> Self {
        Self { discover, drain }
    }

    pub fn svc(self) -> SnapshotDiscoveryServer<Self> {
        SnapshotDiscoveryServer::new(self)
    }
}

#[async_trait::async_trait]
impl<T> SnapshotDiscovery for SnapshotServer<T>
where
    T: DiscoverSnapshots + Send + Sync + 'static,
{
    type StreamSnapshotsStream = BoxSnapshotStream;

    async fn stream_snapshots(
        &self,
        request: tonic::Request<v1::Node>,
    ) -> Result<tonic::Response<BoxSnapshotStream>, tonic::Status> {
        let node = Node::from(request.into_inner());
        if node.id.is_empty() {
            return Err(tonic::Status::invalid_argument("node id is required"));
        }

        let rx = self
            .discover
            .subscribe(node)
            .await
            .map_err(|e| tonic::Status::internal(format!("subscription failed: {e}")))?;

        Ok(tonic::Response::new(response_stream(
            self.drain.clone(),
            rx,
        )))
    }
}

type BoxSnapshotStream =
    Pin<Box<dyn Stream<Item = Result<v1::ConfigSnapshot, tonic::Status>> + Send + Sync>>;

fn response_stream(drain: drain::Watch, mut rx: SnapshotStream) -> BoxSnapshotStream {
    Box::pin(async_stream::try_stream! {
        tokio::pin! {
            let shutdown = drain.signaled();
        }

        loop {
            tokio::select! {
                res = rx.next() => match res {
                    Some(snapshot) => {
                        yield v1::ConfigSnapshot::from(snapshot);
                    }
                    None => return,
                },

                // On shutdown, close the stream so it doesn't hold the
                // server open.
                _ = (&mut shutdown) => {
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use agw_core::ConfigSnapshot;
    use anyhow::Result;

    #[derive(Clone)]
    struct StaticDiscover(Vec<ConfigSnapshot>);

    #[async_trait::async_trait]
    impl DiscoverSnapshots for StaticDiscover {
        async fn subscribe(&self, _node: Node) -> Result<SnapshotStream> {
            Ok(Box::pin(futures::stream::iter(self.0.clone())))
        }
    }

    #[tokio::test]
    async fn streams_snapshots_in_order() {
        let (_signal, watch) = drain::channel();
        let server = SnapshotServer::new(
            StaticDiscover(vec![
                ConfigSnapshot::empty("one"),
                ConfigSnapshot::empty("two"),
            ]),
            watch,
        );

        let response = server
            .stream_snapshots(tonic::Request::new(v1::Node {
                id: "dp-1".to_string(),
                ..Default::default()
            }))
            .await
            .expect("stream");

        let versions: Vec<_> = response
            .into_inner()
            .map(|res| res.expect("ok").version_id)
            .collect()
            .await;
        assert_eq!(versions, vec!["one", "two"]);
    }

    #[tokio::test]
    async fn anonymous_nodes_are_rejected() {
        let (_signal, watch) = drain::channel();
        let server = SnapshotServer::new(StaticDiscover(vec![]), watch);

        let status = match server
            .stream_snapshots(tonic::Request::new(v1::Node::default()))
            .await
        {
            Err(e) => e,
            Ok(_) => panic!("must reject"),
        };
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }
}
