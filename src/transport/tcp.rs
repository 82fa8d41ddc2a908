// TCP Transport Implementation
// Direct dialing and the inbound connection acceptor

use super::connection::{Connection, ConnectionTracker, Direction};
use super::{BoxedStream, Dialer, PeerAddress, TransportError, TransportKind};
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Dials peers with plain TCP
#[derive(Debug, Clone)]
pub struct TcpDialer {
    nodelay: bool,
}

impl Default for TcpDialer {
    fn default() -> Self {
        Self { nodelay: true }
    }
}

impl TcpDialer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, address: &PeerAddress) -> Result<BoxedStream, TransportError> {
        let stream = TcpStream::connect((address.host(), address.port())).await?;
        if self.nodelay {
            let _ = stream.set_nodelay(true);
        }
        Ok(Box::new(stream))
    }
}

/// Bind the listener, mapping failures to a transport error
pub(crate) async fn bind(bind_address: &str, port: u16) -> Result<TcpListener, TransportError> {
    TcpListener::bind((bind_address, port))
        .await
        .map_err(|e| TransportError::ConnectionFailed(format!("bind {}:{} failed: {}", bind_address, port, e)))
}

/// Everything the acceptor needs, moved into its task
pub(crate) struct Acceptor {
    pub listener: TcpListener,
    pub tracker: Arc<ConnectionTracker>,
    pub incoming: mpsc::Sender<Connection>,
    pub max_connections: usize,
    pub max_frame_len: usize,
    pub accepted: Arc<AtomicU64>,
}

impl Acceptor {
    /// Accept until the receiving side goes away
    pub(crate) async fn run(self) {
        loop {
            let (stream, addr) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    // Usually fd exhaustion; back off instead of spinning
                    warn!(error = %e, "Accept failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            if self.tracker.count() >= self.max_connections {
                warn!(remote = %addr, max = self.max_connections, "Refusing connection: limit reached");
                continue;
            }

            let _ = stream.set_nodelay(true);
            let connection = Connection::new(
                Box::new(stream),
                TransportKind::Direct,
                Direction::Inbound,
                PeerAddress::from(addr),
                &self.tracker,
                self.max_frame_len,
            );
            self.accepted.fetch_add(1, Ordering::Relaxed);
            debug!(remote = %addr, conn = %connection.id(), "Accepted connection");

            match self.incoming.try_send(connection) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(remote = %addr, "Dropping connection: accept backlog full");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => break,
            }
        }
    }
}
