// Persistence Tests
// Identity, posts and the bootstrap cache survive a restart.

use crate::{local_config, node_with_proxy};
use postmesh::transport::MockProxy;
use postmesh::NetworkController;
use tempfile::TempDir;

#[test]
fn test_identity_and_posts_survive_restart() {
    let dir = TempDir::new().unwrap();
    let config = local_config().with_data_dir(dir.path());

    let (id, post) = {
        let node = NetworkController::with_config(config.clone()).unwrap();
        let post = node.create_post("persisted", "anon").unwrap();
        node.cleanup();
        (*node.node_id(), post)
    };

    let node = NetworkController::with_config(config).unwrap();
    assert_eq!(*node.node_id(), id);
    assert_eq!(node.get_posts().unwrap(), vec![post]);
}

#[tokio::test]
async fn test_known_peers_are_restored() {
    let dir = TempDir::new().unwrap();
    let remote = node_with_proxy(local_config(), MockProxy::new());
    remote.start().await.unwrap();
    let token = remote.generate_discovery_token().unwrap();

    {
        let node = node_with_proxy(local_config().with_data_dir(dir.path()), MockProxy::new());
        node.parse_discovery_token(&token).unwrap();
        node.stop();
    }

    let node = node_with_proxy(local_config().with_data_dir(dir.path()), MockProxy::new());
    let peers = node.peers();
    assert_eq!(peers.len(), 1);
    assert_eq!(peers[0].peer_id(), remote.node_id());
}

#[test]
fn test_in_memory_nodes_do_not_share_identity() {
    let a = NetworkController::init(0, 9050).unwrap();
    let b = NetworkController::init(0, 9050).unwrap();
    assert_ne!(a.node_id(), b.node_id());
}
