
use postmesh::identity::NodeId;
use postmesh::sync::{GossipConfig, Hello, Message, MessageType, PROTOCOL_VERSION};
use postmesh::transport::{read_frame, write_frame, MockProxy, TcpDialer, TransportKind, DEFAULT_MAX_FRAME_LEN};
use postmesh::{NetworkController, NodeConfig};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

pub fn fast_gossip() -> GossipConfig {
    GossipConfig::new()
        .with_sync_interval(Duration::from_millis(200))
        .with_handshake_timeout(Duration::from_secs(2))
}

pub fn local_node(config: NodeConfig) -> NetworkController {
    node_with_gossip(config, fast_gossip())
}

pub fn node_with_gossip(config: NodeConfig, gossip: GossipConfig) -> NetworkController {
    let config = config.with_bind_address("127.0.0.1").with_gossip(gossip);
    NetworkController::init_with(config, Arc::new(TcpDialer::new()), Arc::new(MockProxy::new())).unwrap()
}

pub async fn started_node() -> NetworkController {
    let node = local_node(NodeConfig::new(0, 9050));
    node.start().await.unwrap();
    node
}

/// Poll `check` until it holds or `limit` passes
pub async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// A hand-driven peer speaking the wire protocol
pub struct RawPeer {
    pub id: NodeId,
    pub listen_port: u16,
    stream: TcpStream,
}

impl RawPeer {
    pub async fn connect(addr: SocketAddr) -> Self {
        Self::connect_as(addr, NodeId::generate()).await
    }

    /// Connect reusing an identity another connection already presented
    pub async fn connect_as(addr: SocketAddr, id: NodeId) -> Self {
        Self {
            id,
            listen_port: 1,
            stream: TcpStream::connect(addr).await.unwrap(),
        }
    }

    /// Take the next connection the node dials to us
    pub async fn accept(listener: &TcpListener, id: NodeId) -> Self {
        let (stream, _) = tokio::time::timeout(Duration::from_secs(10), listener.accept())
            .await
            .expect("node never dialed")
            .unwrap();
        Self {
            id,
            listen_port: listener.local_addr().unwrap().port(),
            stream,
        }
    }

    pub fn hello(&self, secret: Option<&str>) -> Message {
        Message::Hello(Hello {
            node_id: self.id,
            protocol_version: PROTOCOL_VERSION,
            listen_port: self.listen_port,
            advertised_host: Some("127.0.0.1".to_string()),
            transport_kind: TransportKind::Direct,
            shared_secret: secret.map(str::to_string),
        })
    }

    pub async fn send(&mut self, message: &Message) {
        write_frame(&mut self.stream, message, DEFAULT_MAX_FRAME_LEN).await.unwrap();
    }

    pub async fn recv(&mut self) -> Option<Message> {
        match tokio::time::timeout(
            Duration::from_secs(5),
            read_frame::<_, Message>(&mut self.stream, DEFAULT_MAX_FRAME_LEN),
        )
        .await
        {
            Ok(Ok(message)) => Some(message),
            _ => None,
        }
    }

    /// Skip messages until one of `wanted` type arrives
    pub async fn recv_type(&mut self, wanted: MessageType) -> Message {
        loop {
            let message = self.recv().await.expect("connection ended before expected message");
            if message.message_type() == wanted {
                return message;
            }
        }
    }

    /// Everything that arrives within `window`
    pub async fn collect_for(&mut self, window: Duration) -> Vec<Message> {
        let deadline = tokio::time::Instant::now() + window;
        let mut seen = Vec::new();
        while let Ok(Ok(message)) = tokio::time::timeout_at(
            deadline,
            read_frame::<_, Message>(&mut self.stream, DEFAULT_MAX_FRAME_LEN),
        )
        .await
        {
            seen.push(message);
        }
        seen
    }

    /// True once the node closes the connection, false if it is still open after `limit`
    pub async fn closed_within(&mut self, limit: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + limit;
        loop {
            match tokio::time::timeout_at(
                deadline,
                read_frame::<_, Message>(&mut self.stream, DEFAULT_MAX_FRAME_LEN),
            )
            .await
            {
                Ok(Ok(_)) => continue,
                Ok(Err(_)) => return true,
                Err(_) => return false,
            }
        }
    }

    /// Answer a hello the node sent on a connection it dialed
    pub async fn answer_handshake(&mut self) -> Hello {
        let theirs = match self.recv().await {
            Some(Message::Hello(hello)) => hello,
            other => panic!("expected hello, got {:?}", other),
        };
        let hello = self.hello(None);
        self.send(&hello).await;
        theirs
    }

    /// Hello exchange; returns the node's hello
    pub async fn handshake(&mut self, secret: Option<&str>) -> Hello {
        let hello = self.hello(secret);
        self.send(&hello).await;
        match self.recv().await {
            Some(Message::Hello(reply)) => reply,
            other => panic!("expected hello, got {:?}", other),
        }
    }
}
