mod persistence_test;

use postmesh::sync::GossipConfig;
use postmesh::transport::{MockProxy, TcpDialer};
use postmesh::{NetworkController, NodeConfig};
use std::sync::Arc;
use std::time::Duration;

pub fn local_config() -> NodeConfig {
    NodeConfig::new(0, 9050)
        .with_bind_address("127.0.0.1")
        .with_gossip(GossipConfig::new().with_sync_interval(Duration::from_millis(200)))
}

pub fn node_with_proxy(config: NodeConfig, proxy: MockProxy) -> NetworkController {
    NetworkController::init_with(config, Arc::new(TcpDialer::new()), Arc::new(proxy)).unwrap()
}

/// Poll `check` until it holds or `limit` passes
pub async fn wait_for(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

/// A loopback port nothing listens on
pub async fn closed_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}
