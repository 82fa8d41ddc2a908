// postmesh - pseudonymous micro-posting over a peer-to-peer mesh
//
// Nodes store short posts, find each other through out-of-band discovery
// tokens and replicate posts by gossip, optionally routing all traffic
// through a local anonymizing proxy.

pub mod discovery;
pub mod error;
pub mod identity;
pub mod node;
pub mod peer;
pub mod post;
pub mod storage;
pub mod sync;
pub mod transport;

pub use error::MeshError;
pub use node::{ControllerState, NetworkController, NetworkStatus, NodeConfig};
