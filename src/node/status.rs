use crate::transport::ProxyState;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Lifecycle of a controller; Stopped is terminal
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum ControllerState {
    Initialized,
    Started,
    Stopped,
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControllerState::Initialized => f.write_str("initialized"),
            ControllerState::Started => f.write_str("started"),
            ControllerState::Stopped => f.write_str("stopped"),
        }
    }
}

/// Point-in-time view of the node, built fresh on every call
#[derive(Clone, Debug, Serialize)]
pub struct NetworkStatus {
    pub state: ControllerState,
    pub node_id: String,
    /// Listener up and sync running
    pub network_enabled: bool,
    pub anonymization_enabled: bool,
    pub proxy_state: ProxyState,
    /// Peers with an established session
    pub peers_count: usize,
    /// Peers known to the registry, in any state
    pub discovery_peers_count: usize,
    /// Long-unreachable peers parked outside the active set
    pub cold_peers_count: usize,
    /// Open connections routed through the proxy
    pub anonymized_connections: usize,
    pub port: u16,
    pub proxy_port: u16,
    pub posts_count: usize,
    /// Registry full; new discovery rejected
    pub degraded: bool,
    pub last_sync: Option<DateTime<Utc>>,
}
