//! This mod is meant to hold most of the code for the library's client-facing API.
mod event_bus;
mod node;
mod options;
mod wiring;

pub use event_bus::ElectionEvent;
pub use event_bus::EventListener;
pub use event_bus::NodeEvent;
pub use node::ConsensusNode;
pub use node::NodeFailure;
pub use node::NodeStopped;
pub use node::ProposeError;
pub use node::ProposeOutput;
pub use node::ReadLogError;
pub use options::RaftOptions;
pub use wiring::start_node;
pub use wiring::NetworkConfig;
pub use wiring::NodeConfig;
pub use wiring::NodeStartError;
