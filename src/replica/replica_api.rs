use crate::commitlog::{Index, StorageError};
use crate::replica::local_state::Term;
use crate::replica::peers::NodeId;
use bytes::Bytes;

#[derive(Debug)]
pub(crate) struct EnqueueForReplicationInput {
    pub(crate) data: Bytes,
}

#[derive(Debug)]
pub(crate) struct EnqueueForReplicationOutput {
    pub(crate) enqueued_term: Term,
    pub(crate) enqueued_index: Index,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum EnqueueForReplicationError {
    #[error("I'm not leader")]
    LeaderRedirect(LeaderRedirectInfo),

    // Can be retried with exponential backoff with recommended initial delay of 200ms. Likely an
    // election is in progress.
    #[error("Cluster is in a tough shape. No one is leader.")]
    NoLeader,

    #[error("Failed to persist log: {0}")]
    LocalStorageError(StorageError),

    #[error("Replica actor is dead RIP")]
    ActorExited,
}

/// Where to send proposals instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderRedirectInfo {
    pub node_id: NodeId,
    /// `host:port` of the leader if the static membership knows it.
    pub address: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct RequestVoteInput {
    pub(crate) candidate_term: Term,
    pub(crate) candidate_id: NodeId,
    pub(crate) candidate_last_log_entry: Option<(Term, Index)>,
}

#[derive(Debug)]
pub(crate) struct RequestVoteOutput {
    pub(crate) vote_granted: bool,
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum RequestVoteError {
    #[error("Requesting candidate is not in the cluster")]
    CandidateNotInCluster,
    #[error("Requesting candidate's term is out of date")]
    RequestTermOutOfDate(TermOutOfDateInfo),
    #[error("We (server) failed to persist our vote: {0}")]
    ServerStorageError(StorageError),
    #[error("We (server) are unavailable because actor is dead RIP")]
    ActorExited,
}

#[derive(Debug, Clone)]
pub(crate) struct AppendEntriesInput {
    pub(crate) leader_term: Term,
    pub(crate) leader_id: NodeId,
    // "Previous log entry" is the log entry immediately preceding the new ones in AppendEntriesInput.
    pub(crate) leader_previous_log_entry: Option<(Term, Index)>,
    pub(crate) leader_commit_index: Option<Index>,
    pub(crate) new_entries: Vec<AppendEntriesLogEntry>,
}

#[derive(Debug, Clone)]
pub(crate) struct AppendEntriesLogEntry {
    pub(crate) term: Term,
    pub(crate) data: Bytes,
}

#[derive(Debug)]
pub(crate) struct AppendEntriesOutput {
    // Nothing
}

#[derive(thiserror::Error, Debug)]
pub(crate) enum AppendEntriesError {
    #[error("Client is not in cluster")]
    ClientNotInCluster,
    #[error("Client's term is out of date")]
    ClientTermOutOfDate(TermOutOfDateInfo),
    #[error("We (server) are missing previous log entry")]
    ServerMissingPreviousLogEntry { last_log_index: Option<Index> },
    #[error("We (server) had a storage failure: {0}")]
    ServerStorageError(StorageError),
    #[error("We (server) are unavailable because actor is dead RIP")]
    ActorExited,
}

#[derive(Debug)]
pub(crate) struct TermOutOfDateInfo {
    pub(crate) current_term: Term,
}

#[derive(Debug)]
pub(crate) struct RequestVoteReplyFromPeer {
    pub(crate) peer_id: NodeId,
    pub(crate) term: Term,
    pub(crate) result: RequestVoteResult,
}

#[derive(Debug)]
pub(crate) enum RequestVoteResult {
    VoteGranted,
    VoteNotGranted,
    StaleTerm { new_term: Term },
    RetryableFailure(String),
}

#[derive(Debug)]
pub(crate) struct AppendEntriesReplyFromPeer {
    pub(crate) descriptor: AppendEntriesReplyFromPeerDescriptor,
    pub(crate) result: Result<(), AppendEntriesReplyFromPeerError>,
}

// This is basically info about the original request
#[derive(Debug)]
pub(crate) struct AppendEntriesReplyFromPeerDescriptor {
    pub(crate) peer_id: NodeId,
    pub(crate) term: Term,
    pub(crate) seq_no: u64,
    pub(crate) previous_log_entry_index: Option<Index>,
    pub(crate) num_log_entries: usize,
}

#[derive(Debug)]
pub(crate) enum AppendEntriesReplyFromPeerError {
    PeerMissingPreviousLogEntry { last_log_index: Option<Index> },
    RetryableFailure(String),
    StaleTerm { new_term: Term },
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum ReadLogError {
    #[error("Failed to read local log: {0}")]
    LocalStorageError(StorageError),
    #[error("Replica actor is dead RIP")]
    ActorExited,
}

/// HeartbeatTick contains info for a single tick of a leader's per-peer timer.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct HeartbeatTick {
    pub(crate) peer_id: NodeId,
    pub(crate) term: Term,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Leader,
    Candidate,
    Follower,
}

/// Point-in-time view of a node, as seen by its own driver.
#[derive(Clone, Debug, PartialEq)]
pub struct ReplicaStatus {
    pub node_id: NodeId,
    pub role: Role,
    pub term: Term,
    pub leader: Option<NodeId>,
    pub commit_index: Option<Index>,
    pub last_applied: Option<Index>,
    pub last_log_entry: Option<(Term, Index)>,
}

/// One entry of the local log.
#[derive(Clone, Debug, PartialEq)]
pub struct LogEntry {
    pub index: Index,
    pub term: Term,
    pub data: Bytes,
}

// ------- Conversions --------

// These turn a peer's local handler result into what the calling leader/candidate observes. Both
// transports use them so the in-process network and gRPC behave the same.

impl From<Result<RequestVoteOutput, RequestVoteError>> for RequestVoteResult {
    fn from(result: Result<RequestVoteOutput, RequestVoteError>) -> Self {
        match result {
            Ok(RequestVoteOutput { vote_granted: true }) => RequestVoteResult::VoteGranted,
            Ok(RequestVoteOutput { vote_granted: false }) => RequestVoteResult::VoteNotGranted,
            Err(RequestVoteError::CandidateNotInCluster) => RequestVoteResult::VoteNotGranted,
            Err(RequestVoteError::RequestTermOutOfDate(info)) => RequestVoteResult::StaleTerm {
                new_term: info.current_term,
            },
            Err(e @ RequestVoteError::ServerStorageError(_)) | Err(e @ RequestVoteError::ActorExited) => {
                RequestVoteResult::RetryableFailure(e.to_string())
            }
        }
    }
}

pub(crate) fn append_entries_reply(
    result: Result<AppendEntriesOutput, AppendEntriesError>,
) -> Result<(), AppendEntriesReplyFromPeerError> {
    match result {
        Ok(_) => Ok(()),
        Err(AppendEntriesError::ClientTermOutOfDate(info)) => Err(AppendEntriesReplyFromPeerError::StaleTerm {
            new_term: info.current_term,
        }),
        Err(AppendEntriesError::ServerMissingPreviousLogEntry { last_log_index }) => {
            Err(AppendEntriesReplyFromPeerError::PeerMissingPreviousLogEntry { last_log_index })
        }
        // Retry in case peer is out of date. Not expecting this in practice.
        Err(AppendEntriesError::ClientNotInCluster) => Err(AppendEntriesReplyFromPeerError::RetryableFailure(
            "Peer doesn't think we're in the cluster".into(),
        )),
        Err(e @ AppendEntriesError::ServerStorageError(_)) | Err(e @ AppendEntriesError::ActorExited) => {
            Err(AppendEntriesReplyFromPeerError::RetryableFailure(e.to_string()))
        }
    }
}
