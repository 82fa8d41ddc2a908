// Transport module - THE WIRE
// Direct TCP and anonymized (SOCKS5 proxy) connections, framing, listener

mod codec;
mod connection;
mod layer;
mod proxy;
mod socks;
mod tcp;
mod traits;

pub use traits::{
    // Capabilities
    AsyncStream, BoxedStream, Dialer, ProxyConnector,
    // Configuration
    TransportConfig, DEFAULT_MAX_FRAME_LEN, DEFAULT_PORT, DEFAULT_PROXY_PORT,
    // Address types
    PeerAddress, TransportKind,
    // Errors and statistics
    TransportError, TransportStats,
};

pub use codec::{encode_frame, read_frame, write_frame};
pub use connection::{Connection, ConnectionId, ConnectionReader, ConnectionWriter, Direction};
pub use layer::TransportLayer;
pub use proxy::{MockProxy, ProxyState, ProxySupervisor};
pub use socks::Socks5Proxy;
pub use tcp::TcpDialer;
