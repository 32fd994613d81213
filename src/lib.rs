mod actor;
mod api;
mod commitlog;
mod config;
mod hub;
mod logging;
mod replica;
mod server;
mod transport;
mod grpc {
    include!("../generated/consensus.rs");
}

pub use api::start_node;
pub use api::ConsensusNode;
pub use api::ElectionEvent;
pub use api::EventListener;
pub use api::NetworkConfig;
pub use api::NodeConfig;
pub use api::NodeEvent;
pub use api::NodeFailure;
pub use api::NodeStartError;
pub use api::NodeStopped;
pub use api::ProposeError;
pub use api::ProposeOutput;
pub use api::RaftOptions;
pub use api::ReadLogError;
pub use commitlog::Index;
pub use commitlog::StorageError;
pub use config::ClusterMembership;
pub use config::ConfigError;
pub use config::HubConfig;
pub use config::MemberConfig;
pub use hub::HubClient;
pub use hub::HubError;
pub use hub::HubProposal;
pub use hub::HubServeError;
pub use hub::HubServer;
pub use hub::ReportedDecision;
pub use hub::DEFAULT_HUB_CACHE_TTL;
pub use hub::DEFAULT_HUB_CALL_TIMEOUT;
pub use logging::level_from_env;
pub use logging::terminal_logger;
pub use logging::LOG_LEVEL_ENV;
pub use replica::CommitStream;
pub use replica::CommittedEntry;
pub use replica::LeaderRedirectInfo;
pub use replica::LogEntry;
pub use replica::MeNotInCluster;
pub use replica::NoOpStateMachine;
pub use replica::NodeId;
pub use replica::ReplicaStatus;
pub use replica::Role;
pub use replica::StateMachine;
pub use replica::StateMachineOutput;
pub use replica::Term;
pub use transport::LocalNetwork;
pub use transport::NetworkFaults;

// Learning 1: `create::{root_mod}` should not have any code. Just `mod` and `pub use` statements.
// Learning 2: All `mod` statements, anywhere, should not be `pub`. Only export `pub` via individual
//             use statements.
//
// This keeps the `crate::{root_mod}` root_mod only responsible for exporting types to the rest of
// crate, and allows me to organize my root_mod impl however I want.
