// Transport Layer Tests
// Listening, direct dialing, connectivity checks and shutdown

use crate::{layer_with, local_config, responder};
use postmesh::identity::NodeId;
use postmesh::peer::{PeerInfo, PeerState};
use postmesh::transport::{MockProxy, PeerAddress, TransportError, TransportKind};
use std::time::Duration;

#[tokio::test]
async fn test_listen_binds_ephemeral_port() {
    let (layer, _) = layer_with(local_config(), MockProxy::new());
    assert!(!layer.is_listening());
    assert!(layer.local_addr().is_none());

    let _incoming = layer.listen().await.unwrap();
    assert!(layer.is_listening());
    assert_ne!(layer.local_addr().unwrap().port(), 0);
}

#[tokio::test]
async fn test_second_listen_fails() {
    let (layer, _) = layer_with(local_config(), MockProxy::new());
    let _incoming = layer.listen().await.unwrap();
    assert_eq!(layer.listen().await.err(), Some(TransportError::AlreadyRunning));
}

#[tokio::test]
async fn test_connectivity_to_own_listener() {
    let (layer, _) = responder().await;
    let rtt = layer.test_connectivity(None).await.unwrap();
    assert!(rtt < Duration::from_secs(5));
}

#[tokio::test]
async fn test_connectivity_without_listener_is_not_running() {
    let (layer, _) = layer_with(local_config(), MockProxy::new());
    assert_eq!(layer.test_connectivity(None).await, Err(TransportError::NotRunning));
}

#[tokio::test]
async fn test_connectivity_to_remote_target() {
    let (_remote, address) = responder().await;
    let (layer, _) = layer_with(local_config(), MockProxy::new());

    assert!(layer.test_connectivity(Some(address)).await.is_ok());
    // Check connection is gone once the check returns
    assert_eq!(layer.connection_count(), 0);
}

#[tokio::test]
async fn test_connect_registered_peer() {
    let (_remote, address) = responder().await;
    let (layer, registry) = layer_with(local_config(), MockProxy::new());
    let peer = NodeId::generate();
    registry
        .upsert(PeerInfo::new(peer, address, TransportKind::Direct))
        .unwrap();

    let connection = layer.connect(&peer).await.unwrap();
    assert_eq!(connection.route(), TransportKind::Direct);
    assert_eq!(registry.get(&peer).unwrap().state(), PeerState::Connecting);
    assert_eq!(layer.connection_count(), 1);
    assert_eq!(layer.stats().connections_outbound, 1);

    drop(connection);
    assert_eq!(layer.connection_count(), 0);
}

#[tokio::test]
async fn test_refused_connect_marks_peer_unreachable() {
    // Grab a free port, then close it
    let port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let (layer, registry) = layer_with(local_config(), MockProxy::new());
    let peer = NodeId::generate();
    registry
        .upsert(PeerInfo::new(peer, PeerAddress::new("127.0.0.1", port), TransportKind::Direct))
        .unwrap();

    let err = layer.connect(&peer).await.unwrap_err();
    assert!(err.is_retryable());

    let record = registry.get(&peer).unwrap();
    assert_eq!(record.state(), PeerState::Unreachable);
    assert_eq!(record.failed_attempts(), 1);
    assert_eq!(layer.stats().connect_failures, 1);
}

#[tokio::test]
async fn test_redundant_dial_leaves_connected_peer_connected() {
    let port = {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };
    let (layer, registry) = layer_with(local_config(), MockProxy::new());
    let peer = NodeId::generate();
    registry
        .upsert(PeerInfo::new(peer, PeerAddress::new("127.0.0.1", port), TransportKind::Direct))
        .unwrap();
    // Live inbound session
    registry.transition(&peer, PeerState::Connected).unwrap();

    assert_eq!(layer.connect(&peer).await.err(), Some(TransportError::AlreadyConnected));

    let record = registry.get(&peer).unwrap();
    assert_eq!(record.state(), PeerState::Connected);
    assert_eq!(record.failed_attempts(), 0);
    assert_eq!(registry.inconsistencies(), 0);
    assert_eq!(layer.stats().connect_failures, 0);
}

#[tokio::test]
async fn test_connect_unknown_peer_fails() {
    let (layer, _) = layer_with(local_config(), MockProxy::new());
    let err = layer.connect(&NodeId::generate()).await.unwrap_err();
    assert!(matches!(err, TransportError::ConnectionFailed(_)));
}

#[tokio::test]
async fn test_close_peer_interrupts_pending_receive() {
    let (_remote, address) = responder().await;
    let (layer, registry) = layer_with(local_config(), MockProxy::new());
    let peer = NodeId::generate();
    registry
        .upsert(PeerInfo::new(peer, address, TransportKind::Direct))
        .unwrap();
    let mut connection = layer.connect(&peer).await.unwrap();

    let pending = tokio::spawn(async move { connection.recv::<postmesh::sync::Message>().await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(layer.close_peer(&peer), 1);

    let result = tokio::time::timeout(Duration::from_secs(2), pending).await.unwrap().unwrap();
    assert_eq!(result, Err(TransportError::Closed));
    assert_eq!(layer.stats().connections_force_closed, 1);
}

#[tokio::test]
async fn test_shutdown_stops_listening_and_closes() {
    let (_remote, address) = responder().await;
    let (layer, registry) = layer_with(local_config(), MockProxy::new());
    let _incoming = layer.listen().await.unwrap();
    let peer = NodeId::generate();
    registry
        .upsert(PeerInfo::new(peer, address, TransportKind::Direct))
        .unwrap();
    let connection = layer.connect(&peer).await.unwrap();

    assert_eq!(layer.shutdown(), 1);
    assert!(!layer.is_listening());
    assert!(connection.is_closed());
    assert_eq!(layer.connection_count(), 0);
}

#[tokio::test]
async fn test_onion_peer_needs_anonymization() {
    let (layer, registry) = layer_with(local_config(), MockProxy::new());
    let peer = NodeId::generate();
    registry
        .upsert(PeerInfo::new(
            peer,
            PeerAddress::new("abcdefghijklmnop.onion", 80),
            TransportKind::Direct,
        ))
        .unwrap();

    assert_eq!(layer.connect(&peer).await.err(), Some(TransportError::AnonymizationDisabled));
    assert_eq!(registry.get(&peer).unwrap().state(), PeerState::Unreachable);
}
