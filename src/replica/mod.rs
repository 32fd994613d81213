mod election;
mod local_state;
mod peers;
mod replica;
mod replica_api;
mod replica_wiring;
mod state_machine;
mod write_ahead_log;

pub use election::ElectionStateChangeListener;
pub use election::ElectionStateSnapshot;
pub use local_state::Term;
pub use peers::MeNotInCluster;
pub use peers::NodeId;
pub use replica_api::LeaderRedirectInfo;
pub use replica_api::LogEntry;
pub use replica_api::ReplicaStatus;
pub use replica_api::Role;
pub use state_machine::NoOpStateMachine;
pub use state_machine::StateMachine;
pub use state_machine::StateMachineOutput;
pub use write_ahead_log::CommitStream;
pub use write_ahead_log::CommittedEntry;

pub(crate) use local_state::FileLocalState;
pub(crate) use local_state::PersistentLocalState;
pub(crate) use local_state::VolatileLocalState;
pub(crate) use peers::ClusterTracker;
pub(crate) use replica::Replica;
pub(crate) use replica_api::append_entries_reply;
pub(crate) use replica_api::AppendEntriesError;
pub(crate) use replica_api::AppendEntriesInput;
pub(crate) use replica_api::AppendEntriesLogEntry;
pub(crate) use replica_api::AppendEntriesOutput;
pub(crate) use replica_api::AppendEntriesReplyFromPeer;
pub(crate) use replica_api::AppendEntriesReplyFromPeerError;
pub(crate) use replica_api::EnqueueForReplicationError;
pub(crate) use replica_api::EnqueueForReplicationInput;
pub(crate) use replica_api::EnqueueForReplicationOutput;
pub(crate) use replica_api::HeartbeatTick;
#[cfg(test)]
pub(crate) use replica_api::TermOutOfDateInfo;
pub(crate) use replica_api::ReadLogError;
pub(crate) use replica_api::RequestVoteError;
pub(crate) use replica_api::RequestVoteInput;
pub(crate) use replica_api::RequestVoteOutput;
pub(crate) use replica_api::RequestVoteReplyFromPeer;
pub(crate) use replica_api::RequestVoteResult;
pub(crate) use replica_wiring::create_replica;
pub(crate) use replica_wiring::ReplicaWiring;
pub(crate) use write_ahead_log::WriteAheadLogEntry;
