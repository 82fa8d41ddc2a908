// Transport Traits and Core Types
// Defines the dialing capabilities and common types used by the transport layer

use crate::peer::PeerError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

pub const DEFAULT_PORT: u16 = 8888;
pub const DEFAULT_PROXY_PORT: u16 = 9050;
pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

// ============================================================================
// TRANSPORT CONFIG
// ============================================================================

/// Configuration for the transport layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Interface the listener binds to
    pub bind_address: String,
    /// Listen port (0 = pick a free port)
    pub port: u16,
    /// Host of the local anonymizing proxy
    pub proxy_host: String,
    /// SOCKS port of the local anonymizing proxy
    pub proxy_port: u16,
    /// Maximum number of simultaneous connections
    pub max_connections: usize,
    /// Bound on establishing an outbound connection
    pub connect_timeout: Duration,
    /// Bound on a single request/response exchange
    pub message_timeout: Duration,
    /// Bound on the proxy answering its first health check
    pub proxy_startup_timeout: Duration,
    /// How often the proxy supervisor re-checks the proxy
    pub proxy_health_interval: Duration,
    /// How long disable waits for anonymized dials to unwind before force-closing
    pub cancel_grace: Duration,
    /// Largest frame accepted on the wire
    pub max_frame_len: usize,
    /// Inbound connections queued for the sync engine
    pub accept_backlog: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            proxy_host: "127.0.0.1".to_string(),
            proxy_port: DEFAULT_PROXY_PORT,
            max_connections: 128,
            connect_timeout: Duration::from_secs(10),
            message_timeout: Duration::from_secs(10),
            proxy_startup_timeout: Duration::from_secs(5),
            proxy_health_interval: Duration::from_secs(30),
            cancel_grace: Duration::from_secs(2),
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            accept_backlog: 64,
        }
    }
}

impl TransportConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bind_address(mut self, address: impl Into<String>) -> Self {
        self.bind_address = address.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_proxy_host(mut self, host: impl Into<String>) -> Self {
        self.proxy_host = host.into();
        self
    }

    pub fn with_proxy_port(mut self, port: u16) -> Self {
        self.proxy_port = port;
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_message_timeout(mut self, timeout: Duration) -> Self {
        self.message_timeout = timeout;
        self
    }

    pub fn with_proxy_startup_timeout(mut self, timeout: Duration) -> Self {
        self.proxy_startup_timeout = timeout;
        self
    }

    pub fn with_proxy_health_interval(mut self, interval: Duration) -> Self {
        self.proxy_health_interval = interval;
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn with_max_frame_len(mut self, len: usize) -> Self {
        self.max_frame_len = len;
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.max_connections == 0 {
            return Err(TransportError::InvalidConfig("max_connections cannot be 0".to_string()));
        }
        if self.max_frame_len < 64 {
            return Err(TransportError::InvalidConfig("max_frame_len must be at least 64".to_string()));
        }
        if self.accept_backlog == 0 {
            return Err(TransportError::InvalidConfig("accept_backlog cannot be 0".to_string()));
        }
        for (name, value) in [
            ("connect_timeout", self.connect_timeout),
            ("message_timeout", self.message_timeout),
            ("proxy_startup_timeout", self.proxy_startup_timeout),
            ("proxy_health_interval", self.proxy_health_interval),
        ] {
            if value.is_zero() {
                return Err(TransportError::InvalidConfig(format!("{} cannot be zero", name)));
            }
        }
        Ok(())
    }
}

// ============================================================================
// PEER ADDRESS
// ============================================================================

/// How traffic to a peer is routed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportKind {
    /// Plain TCP socket
    Direct,
    /// Through the local anonymizing proxy
    Anonymized,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Direct => f.write_str("direct"),
            TransportKind::Anonymized => f.write_str("anonymized"),
        }
    }
}

/// A peer endpoint: IP address, DNS name or overlay (.onion) name
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PeerAddress {
    host: String,
    port: u16,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port` or `[v6]:port`
    pub fn parse(s: &str) -> Result<Self, TransportError> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| TransportError::InvalidAddress(s.to_string()))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(TransportError::InvalidAddress(s.to_string()));
        }
        let port = port
            .parse::<u16>()
            .map_err(|_| TransportError::InvalidAddress(s.to_string()))?;
        Ok(Self::new(host, port))
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Overlay names only resolve inside the anonymizing network
    pub fn is_onion(&self) -> bool {
        self.host.ends_with(".onion")
    }

    pub fn is_loopback(&self) -> bool {
        self.host == "localhost"
            || self
                .host
                .parse::<std::net::IpAddr>()
                .map(|ip| ip.is_loopback())
                .unwrap_or(false)
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

// ============================================================================
// TRANSPORT ERRORS
// ============================================================================

/// Errors from transport operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection refused: {0}")]
    Refused(String),

    #[error("Connection timeout")]
    Timeout,

    #[error("Proxy unavailable: {0}")]
    ProxyUnavailable(String),

    #[error("Proxy failed to start: {0}")]
    ProxyStartup(String),

    #[error("Peer requires anonymized routing but anonymization is disabled")]
    AnonymizationDisabled,

    #[error("Connection attempt cancelled")]
    Cancelled,

    #[error("Connection closed")]
    Closed,

    #[error("Transport not running")]
    NotRunning,

    #[error("Transport already running")]
    AlreadyRunning,

    #[error("Peer already has a live session")]
    AlreadyConnected,

    #[error("Peer registry: {0}")]
    Peer(#[from] PeerError),

    #[error("Maximum connections reached")]
    MaxConnectionsReached,

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Frame too large: {len} bytes (max {max})")]
    FrameTooLarge { len: usize, max: usize },

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("IO error: {0}")]
    IoError(String),
}

impl TransportError {
    /// Check if this is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }

    /// Check if the operation can be retried later
    ///
    /// Retryable errors describe the path to a peer, not the peer's data.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout
                | Self::ConnectionFailed(_)
                | Self::Refused(_)
                | Self::ProxyUnavailable(_)
                | Self::AnonymizationDisabled
                | Self::Cancelled
                | Self::Closed
                | Self::MaxConnectionsReached
                | Self::IoError(_)
        )
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match e.kind() {
            ErrorKind::ConnectionRefused => Self::Refused(e.to_string()),
            ErrorKind::TimedOut => Self::Timeout,
            ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe => Self::Closed,
            _ => Self::IoError(e.to_string()),
        }
    }
}

// ============================================================================
// TRANSPORT STATISTICS
// ============================================================================

/// Statistics for transport operations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransportStats {
    /// Number of open connections
    pub connections_active: usize,
    /// Open connections routed through the proxy
    pub connections_anonymized: usize,
    /// Outbound connections established
    pub connections_outbound: u64,
    /// Inbound connections accepted
    pub connections_inbound: u64,
    /// Outbound attempts that failed
    pub connect_failures: u64,
    /// Connections force-closed by the transport
    pub connections_force_closed: u64,
}

// ============================================================================
// DIALING CAPABILITIES
// ============================================================================

/// Byte stream a connection runs over
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens direct streams to peers
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, address: &PeerAddress) -> Result<BoxedStream, TransportError>;
}

/// The anonymizing proxy, as seen by the transport layer
///
/// Implementations must answer `health_check` quickly; the supervisor bounds it.
#[async_trait]
pub trait ProxyConnector: Send + Sync {
    /// Human-readable endpoint for logs and status
    fn endpoint(&self) -> String;

    /// Check that the proxy is up and speaking its protocol
    async fn health_check(&self) -> Result<(), TransportError>;

    /// Open a stream to `address` through the proxy
    async fn dial(&self, address: &PeerAddress) -> Result<BoxedStream, TransportError>;
}
