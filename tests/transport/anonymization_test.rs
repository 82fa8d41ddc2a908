// Anonymization Lifecycle Tests
// Enabling routes through the proxy; disabling restores direct routing
// and force-closes anonymized connections.

use crate::{layer_with, local_config, responder};
use postmesh::identity::NodeId;
use postmesh::peer::PeerInfo;
use postmesh::transport::{MockProxy, ProxyState, TransportError, TransportKind};
use std::time::Duration;

#[tokio::test]
async fn test_enable_then_disable_restores_direct_routing() {
    let (_remote, address) = responder().await;
    let proxy = MockProxy::new();
    let (layer, registry) = layer_with(local_config(), proxy.clone());
    let peer = NodeId::generate();
    registry
        .upsert(PeerInfo::new(peer, address, TransportKind::Direct))
        .unwrap();

    assert!(!layer.is_anonymization_enabled());
    layer.enable_anonymization().await.unwrap();
    assert!(layer.is_anonymization_enabled());
    assert_eq!(layer.proxy_state(), ProxyState::Running);

    let anonymized = layer.connect(&peer).await.unwrap();
    assert_eq!(anonymized.route(), TransportKind::Anonymized);
    assert_eq!(proxy.dial_count(), 1);
    assert_eq!(layer.anonymized_connection_count(), 1);

    assert_eq!(layer.disable_anonymization().await, 1);
    assert!(!layer.is_anonymization_enabled());
    assert_eq!(layer.proxy_state(), ProxyState::Disabled);
    assert_eq!(layer.anonymized_connection_count(), 0);
    assert!(anonymized.is_closed());

    let direct = layer.connect(&peer).await.unwrap();
    assert_eq!(direct.route(), TransportKind::Direct);
    assert_eq!(proxy.dial_count(), 1);
}

#[tokio::test]
async fn test_disable_keeps_direct_connections() {
    let (_remote, address) = responder().await;
    let (layer, registry) = layer_with(local_config(), MockProxy::new());
    let peer = NodeId::generate();
    registry
        .upsert(PeerInfo::new(peer, address, TransportKind::Direct))
        .unwrap();

    let direct = layer.connect(&peer).await.unwrap();
    layer.enable_anonymization().await.unwrap();
    assert_eq!(layer.disable_anonymization().await, 0);
    assert!(!direct.is_closed());
    assert_eq!(layer.connection_count(), 1);
}

#[tokio::test]
async fn test_unreachable_proxy_fails_startup() {
    let (layer, _) = layer_with(local_config(), MockProxy::unreachable());

    let result = layer.enable_anonymization().await;
    assert!(matches!(result, Err(TransportError::ProxyStartup(_))));
    assert!(!layer.is_anonymization_enabled());
    assert_eq!(layer.proxy_state(), ProxyState::Disabled);
}

#[tokio::test]
async fn test_slow_proxy_times_out_at_startup() {
    let config = local_config().with_proxy_startup_timeout(Duration::from_millis(50));
    let (layer, _) = layer_with(config, MockProxy::new().with_check_delay(Duration::from_secs(5)));

    assert!(matches!(
        layer.enable_anonymization().await,
        Err(TransportError::ProxyStartup(_))
    ));
    assert!(!layer.is_anonymization_enabled());
}

#[tokio::test]
async fn test_disable_cancels_inflight_dial() {
    let (_remote, address) = responder().await;
    let config = local_config().with_cancel_grace(Duration::from_millis(500));
    let proxy = MockProxy::new().with_dial_delay(Duration::from_secs(5));
    let (layer, registry) = layer_with(config, proxy);
    let layer = std::sync::Arc::new(layer);
    let peer = NodeId::generate();
    registry
        .upsert(PeerInfo::new(peer, address, TransportKind::Anonymized))
        .unwrap();
    layer.enable_anonymization().await.unwrap();

    let dialing = {
        let layer = std::sync::Arc::clone(&layer);
        tokio::spawn(async move { layer.connect(&peer).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    layer.disable_anonymization().await;

    let result = tokio::time::timeout(Duration::from_secs(2), dialing).await.unwrap().unwrap();
    assert_eq!(result.err(), Some(TransportError::Cancelled));
}

#[tokio::test]
async fn test_enable_is_idempotent() {
    let proxy = MockProxy::new();
    let (layer, _) = layer_with(local_config(), proxy.clone());

    layer.enable_anonymization().await.unwrap();
    layer.enable_anonymization().await.unwrap();
    assert_eq!(proxy.check_count(), 1);
}
