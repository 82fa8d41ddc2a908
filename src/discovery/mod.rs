// Discovery module - HOW NODES FIND EACH OTHER
// Signed, versioned bootstrap tokens exchanged out-of-band, and signed
// UDP announces on the local network

mod lan;
mod service;
mod token;

pub use lan::{Announce, AnnounceKind, LanConfig, LanDiscovery, LanError, LanStats, DEFAULT_LAN_PORT};
pub use service::{DiscoveryError, DiscoveryService};
pub use token::{generate_token, parse_token, DiscoveryToken, TokenError, TokenV1, TOKEN_PREFIX, TOKEN_VERSION_V1};
