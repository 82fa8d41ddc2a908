// Node module - THE FRONT DOOR
// Configuration, lifecycle and status of a running node

mod config;
mod controller;
mod status;

pub use config::NodeConfig;
pub use controller::NetworkController;
pub use status::{ControllerState, NetworkStatus};
