// Peer Registry Tests
// State machine, retry scheduling, cold set and degraded mode

use postmesh::identity::NodeId;
use postmesh::peer::{
    now_ms, BackoffPolicy, PeerError, PeerInfo, PeerRegistry, PeerState, RegistryConfig,
};
use postmesh::transport::{PeerAddress, TransportKind};
use std::time::Duration;

fn info(port: u16) -> PeerInfo {
    PeerInfo::new(NodeId::generate(), PeerAddress::new("127.0.0.1", port), TransportKind::Direct)
}

fn config() -> RegistryConfig {
    RegistryConfig::new()
        .with_max_peers(3)
        .with_cold_capacity(2)
        .with_unreachable_ttl(Duration::from_secs(10))
        .with_backoff(BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(8)).with_jitter(0.0))
}

fn registry() -> PeerRegistry {
    PeerRegistry::new(NodeId::generate(), config())
}

// ============================================================================
// UPSERT AND STATE
// ============================================================================

#[test]
fn test_new_peer_is_discovered() {
    let registry = registry();
    let peer = info(1);
    let id = *peer.peer_id();

    assert_eq!(registry.upsert(peer.clone()), Ok(PeerState::Discovered));
    let stored = registry.get(&id).unwrap();
    assert_eq!(stored.info(), &peer);
    assert_eq!(stored.failed_attempts(), 0);
    assert_eq!(registry.known_count(), 1);
    assert_eq!(registry.connected_count(), 0);
}

#[test]
fn test_upsert_existing_keeps_state() {
    let registry = registry();
    let peer = info(1);
    let id = *peer.peer_id();
    registry.upsert(peer.clone()).unwrap();
    registry.transition(&id, PeerState::Connecting).unwrap();
    registry.transition(&id, PeerState::Connected).unwrap();

    assert_eq!(registry.upsert(peer), Ok(PeerState::Connected));
    assert_eq!(registry.list_active().len(), 1);
}

#[test]
fn test_invalid_transition_is_refused_and_counted() {
    let registry = registry();
    let peer = info(1);
    let id = *peer.peer_id();
    registry.upsert(peer).unwrap();
    registry.transition(&id, PeerState::Connected).unwrap();

    let result = registry.transition(&id, PeerState::Connecting);
    assert!(matches!(result, Err(PeerError::InvalidTransition { .. })));
    assert_eq!(registry.get(&id).unwrap().state(), PeerState::Connected);
    assert_eq!(registry.inconsistencies(), 1);
}

#[test]
fn test_transition_unknown_peer() {
    let registry = registry();
    assert_eq!(
        registry.transition(&NodeId::generate(), PeerState::Connecting),
        Err(PeerError::PeerNotFound)
    );
}

#[test]
fn test_connect_resets_failures() {
    let registry = registry();
    let peer = info(1);
    let id = *peer.peer_id();
    registry.upsert(peer).unwrap();
    registry.record_failure(&id).unwrap();
    registry.record_failure(&id).unwrap();
    assert_eq!(registry.get(&id).unwrap().failed_attempts(), 2);

    registry.transition(&id, PeerState::Connecting).unwrap();
    registry.transition(&id, PeerState::Connected).unwrap();
    let peer = registry.get(&id).unwrap();
    assert_eq!(peer.failed_attempts(), 0);
    assert_eq!(peer.unreachable_since(), None);
}

// ============================================================================
// RETRY SCHEDULING
// ============================================================================

#[test]
fn test_failures_back_off_exponentially() {
    let registry = registry();
    let peer = info(1);
    let id = *peer.peer_id();
    registry.upsert(peer).unwrap();

    let delays: Vec<Duration> = (0..6)
        .map(|_| registry.record_failure_at(&id, 1_000).unwrap())
        .collect();
    let secs: Vec<u64> = delays.iter().map(|d| d.as_secs()).collect();
    assert_eq!(secs, vec![1, 2, 4, 8, 8, 8]);
    assert_eq!(registry.get(&id).unwrap().state(), PeerState::Unreachable);
}

#[test]
fn test_due_for_dial_respects_backoff() {
    let registry = registry();
    let peer = info(1);
    let id = *peer.peer_id();
    registry.upsert(peer).unwrap();

    let due: Vec<NodeId> = registry.due_for_dial(now_ms()).iter().map(|p| *p.peer_id()).collect();
    assert_eq!(due, vec![id]);

    let t = now_ms();
    registry.record_failure_at(&id, t).unwrap();
    assert!(registry.due_for_dial(t + 999).is_empty());
    assert_eq!(registry.due_for_dial(t + 1_000).len(), 1);
}

#[test]
fn test_connected_peers_are_never_due() {
    let registry = registry();
    let peer = info(1);
    let id = *peer.peer_id();
    registry.upsert(peer).unwrap();
    registry.transition(&id, PeerState::Connected).unwrap();

    assert!(registry.due_for_dial(u64::MAX).is_empty());
}

#[test]
fn test_rediscovery_makes_unreachable_peer_due() {
    let registry = registry();
    let peer = info(1);
    let id = *peer.peer_id();
    registry.upsert(peer.clone()).unwrap();

    let t = now_ms();
    registry.record_failure_at(&id, t).unwrap();
    registry.record_failure_at(&id, t).unwrap();
    assert!(registry.due_for_dial(now_ms()).is_empty());

    registry.upsert(peer).unwrap();
    assert_eq!(registry.due_for_dial(now_ms()).len(), 1);
}

// ============================================================================
// COLD SET AND DEGRADED MODE
// ============================================================================

#[test]
fn test_expired_unreachable_peers_go_cold() {
    let registry = registry();
    let peer = info(1);
    let id = *peer.peer_id();
    registry.upsert(peer).unwrap();
    registry.record_failure_at(&id, 1_000).unwrap();

    assert_eq!(registry.evict_expired(1_000 + 9_999), 0);
    assert_eq!(registry.evict_expired(1_000 + 10_000), 1);
    assert!(registry.get(&id).is_none());
    assert_eq!(registry.cold_peers().len(), 1);
    assert_eq!(registry.stats().cold, 1);
}

#[test]
fn test_cold_set_is_bounded() {
    let registry = registry();
    for port in 1..=3 {
        let peer = info(port);
        let id = *peer.peer_id();
        registry.upsert(peer).unwrap();
        registry.record_failure_at(&id, 1_000).unwrap();
    }

    assert_eq!(registry.evict_expired(100_000), 3);
    assert_eq!(registry.cold_peers().len(), 2);
    assert_eq!(registry.known_count(), 0);
}

#[test]
fn test_cold_peer_revives_on_rediscovery() {
    let registry = registry();
    let peer = info(1);
    let id = *peer.peer_id();
    registry.upsert(peer.clone()).unwrap();
    registry.record_failure_at(&id, 1_000).unwrap();
    registry.evict_expired(100_000);

    assert_eq!(registry.upsert(peer), Ok(PeerState::Discovered));
    assert!(registry.cold_peers().is_empty());
    assert_eq!(registry.get(&id).unwrap().failed_attempts(), 0);
}

#[test]
fn test_full_registry_rejects_new_peers() {
    let registry = registry();
    let known: Vec<PeerInfo> = (1..=3).map(info).collect();
    for peer in &known {
        registry.upsert(peer.clone()).unwrap();
    }

    assert!(registry.is_degraded());
    assert_eq!(registry.upsert(info(4)), Err(PeerError::RegistryFull { max: 3 }));
    // Known peers can still be refreshed
    assert!(registry.upsert(known[0].clone()).is_ok());

    let stats = registry.stats();
    assert!(stats.degraded);
    assert_eq!(stats.rejected, 1);
}

#[test]
fn test_degraded_mode_clears_after_eviction() {
    let registry = registry();
    let first = info(1);
    let first_id = *first.peer_id();
    registry.upsert(first).unwrap();
    registry.upsert(info(2)).unwrap();
    registry.upsert(info(3)).unwrap();

    registry.record_failure_at(&first_id, 1_000).unwrap();
    registry.evict_expired(100_000);

    assert!(!registry.is_degraded());
    assert!(registry.upsert(info(4)).is_ok());
}

// ============================================================================
// EXCHANGE AND CACHE
// ============================================================================

#[test]
fn test_exchange_sample_excludes_requester_and_unreachable() {
    let registry = PeerRegistry::new(NodeId::generate(), RegistryConfig::default());
    let requester = info(1);
    let requester_id = *requester.peer_id();
    let down = info(2);
    let down_id = *down.peer_id();
    registry.upsert(requester).unwrap();
    registry.upsert(down).unwrap();
    for port in 3..8 {
        registry.upsert(info(port)).unwrap();
    }
    registry.record_failure(&down_id).unwrap();

    let sample = registry.sample_for_exchange(&requester_id, 3);
    assert_eq!(sample.len(), 3);
    assert!(sample.iter().all(|p| *p.peer_id() != requester_id && *p.peer_id() != down_id));
}

#[test]
fn test_export_import_roundtrip() {
    let source = registry();
    source.upsert(info(1)).unwrap();
    source.upsert(info(2).with_shared_secret("net")).unwrap();

    let target = registry();
    assert_eq!(target.import(source.export()), 2);

    let mut exported = source.export();
    let mut imported = target.export();
    exported.sort_by_key(|p| *p.peer_id());
    imported.sort_by_key(|p| *p.peer_id());
    assert_eq!(exported, imported);
}

#[test]
fn test_rtt_average() {
    let registry = registry();
    let peer = info(1);
    let id = *peer.peer_id();
    registry.upsert(peer).unwrap();

    assert_eq!(registry.get(&id).unwrap().average_rtt(), None);
    registry.record_rtt(&id, 10);
    registry.record_rtt(&id, 30);
    assert_eq!(registry.get(&id).unwrap().average_rtt(), Some(20));
}

// ============================================================================
// REMOVAL AND DIAL OUTCOMES
// ============================================================================

#[test]
fn test_dial_failure_keeps_connected_peer() {
    let registry = registry();
    let peer = info(1);
    let id = *peer.peer_id();
    registry.upsert(peer).unwrap();
    registry.transition(&id, PeerState::Connected).unwrap();

    assert_eq!(registry.record_dial_failure(&id), Ok(None));
    let record = registry.get(&id).unwrap();
    assert_eq!(record.state(), PeerState::Connected);
    assert_eq!(record.failed_attempts(), 0);
}

#[test]
fn test_dial_failure_schedules_retry() {
    let registry = registry();
    let peer = info(1);
    let id = *peer.peer_id();
    registry.upsert(peer).unwrap();
    registry.transition(&id, PeerState::Connecting).unwrap();

    assert_eq!(registry.record_dial_failure(&id), Ok(Some(Duration::from_secs(1))));
    assert_eq!(registry.get(&id).unwrap().state(), PeerState::Unreachable);
    assert_eq!(registry.record_dial_failure(&NodeId::generate()), Err(PeerError::PeerNotFound));
}

#[test]
fn test_remove_active_and_cold_peers() {
    let registry = registry();
    let active = info(1);
    let cold = info(2);
    let (active_id, cold_id) = (*active.peer_id(), *cold.peer_id());
    registry.upsert(active).unwrap();
    registry.upsert(cold).unwrap();
    registry.record_failure_at(&cold_id, 1_000).unwrap();
    registry.evict_expired(11_000);
    assert_eq!(registry.cold_peers().len(), 1);

    assert!(registry.remove(&active_id).is_some());
    assert!(registry.remove(&cold_id).is_some());
    assert!(registry.remove(&cold_id).is_none());
    assert_eq!(registry.stats().known, 0);
    assert_eq!(registry.stats().cold, 0);
}

#[test]
fn test_remove_idle_spares_live_peers() {
    let registry = registry();
    let idle = info(1);
    let live = info(2);
    let (idle_id, live_id) = (*idle.peer_id(), *live.peer_id());
    registry.upsert(idle).unwrap();
    registry.upsert(live).unwrap();
    registry.transition(&live_id, PeerState::Connecting).unwrap();

    assert!(registry.remove_idle(&idle_id));
    assert!(!registry.remove_idle(&live_id));
    assert!(registry.get(&idle_id).is_none());
    assert_eq!(registry.get(&live_id).unwrap().state(), PeerState::Connecting);
}
