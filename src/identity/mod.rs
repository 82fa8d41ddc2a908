// Identity module - WHO A NODE IS
// Ed25519 keypair and the node id derived from it

mod keypair;
mod node_id;

pub use keypair::{Keypair, KeypairError, PublicKey, PUBLIC_KEY_LEN, SIGNATURE_LEN};
pub use node_id::NodeId;
