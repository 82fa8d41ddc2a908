// Sync module - HOW NODES TALK
// Wire protocol, per-peer replication bookkeeping and the sync engine

mod engine;
mod gossip;
mod protocol;

pub use engine::{LocalEndpoint, SyncEngine};
pub use gossip::{GossipConfig, OutboundBatch, PeerSession, SyncStats};
pub use protocol::{Hello, Message, MessageType, ProtocolError, PROTOCOL_VERSION};
