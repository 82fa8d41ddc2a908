// Peer module - WHO WE KNOW
// Peer registry, reachability state machine and retry backoff

mod backoff;
mod registry;

pub use backoff::BackoffPolicy;
pub use registry::{
    now_ms, Peer, PeerError, PeerInfo, PeerRegistry, PeerState, PeerStats, RegistryConfig,
};
