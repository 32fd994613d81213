use crate::actor::WeakActorClient;
use crate::commitlog::Index;
use crate::grpc::grpc_raft_server::{GrpcRaft, GrpcRaftServer};
use crate::grpc::{
    proto_append_entries_error, proto_append_entries_result, proto_propose_result, proto_request_vote_error,
    proto_request_vote_result, ProtoAppendEntriesError, ProtoAppendEntriesReq, ProtoAppendEntriesResult,
    ProtoAppendEntriesSuccess, ProtoClientNotInCluster, ProtoClientStaleTerm, ProtoNoLeader, ProtoNotLeader,
    ProtoProposeAccepted, ProtoProposeReq, ProtoProposeResult, ProtoRequestVoteError, ProtoRequestVoteReq,
    ProtoRequestVoteResult, ProtoRequestVoteSuccess, ProtoServerFault, ProtoServerMissingPreviousLog,
};
use crate::replica::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesLogEntry, AppendEntriesOutput, EnqueueForReplicationError,
    EnqueueForReplicationInput, EnqueueForReplicationOutput, NodeId, RequestVoteError, RequestVoteInput,
    RequestVoteOutput, Term,
};
use bytes::Bytes;
use std::convert::TryFrom;
use std::future::Future;
use std::net::SocketAddr;
use tonic::transport::Server;
use tonic::{Request, Response, Status};

/// RpcServer answers peers' RequestVote and AppendEntries, and proposals relayed by the hub. Each
/// call becomes an event on the local driver's queue, and the reply goes out once the driver has
/// handled (and persisted) it.
pub(crate) struct RpcServer {
    logger: slog::Logger,
    local_replica: WeakActorClient,
}

impl RpcServer {
    pub(crate) fn new(logger: slog::Logger, local_replica: WeakActorClient) -> Self {
        RpcServer { logger, local_replica }
    }

    pub(crate) async fn run<F>(self, socket_addr: SocketAddr, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let logger = self.logger.clone();
        slog::info!(logger, "Listening on '{:?}'", socket_addr);

        let result = Server::builder()
            .add_service(GrpcRaftServer::new(self))
            .serve_with_shutdown(socket_addr, shutdown)
            .await;

        match result {
            Ok(()) => slog::info!(logger, "RPC server stopped"),
            Err(e) => slog::error!(logger, "RPC server failed: {:?}", e),
        }
    }
}

#[async_trait::async_trait]
impl GrpcRaft for RpcServer {
    async fn request_vote(
        &self,
        request: Request<ProtoRequestVoteReq>,
    ) -> Result<Response<ProtoRequestVoteResult>, Status> {
        let request = request.into_inner();
        slog::trace!(self.logger, "ServerWire - {:?}", request);

        let input = RequestVoteInput::try_from(request)?;
        let reply = ProtoRequestVoteResult::from(self.local_replica.request_vote(input).await);

        slog::trace!(self.logger, "ServerWire - {:?}", reply);
        Ok(Response::new(reply))
    }

    async fn append_entries(
        &self,
        request: Request<ProtoAppendEntriesReq>,
    ) -> Result<Response<ProtoAppendEntriesResult>, Status> {
        let request = request.into_inner();
        slog::trace!(self.logger, "ServerWire - {:?}", request);

        let input = AppendEntriesInput::try_from(request)?;
        let reply = ProtoAppendEntriesResult::from(self.local_replica.append_entries(input).await);

        slog::trace!(self.logger, "ServerWire - {:?}", reply);
        Ok(Response::new(reply))
    }

    async fn propose(&self, request: Request<ProtoProposeReq>) -> Result<Response<ProtoProposeResult>, Status> {
        let request = request.into_inner();
        slog::trace!(self.logger, "ServerWire - Propose {} bytes", request.data.len());

        let input = EnqueueForReplicationInput {
            data: Bytes::from(request.data),
        };
        let reply = ProtoProposeResult::from(self.local_replica.enqueue_for_replication(input).await);

        slog::trace!(self.logger, "ServerWire - {:?}", reply);
        Ok(Response::new(reply))
    }
}

// ------- Conversions --------

/// Term and index travel as 0 together, meaning "no entry". One without the other is a bad request.
fn log_position(term: u64, index: u64) -> Result<Option<(Term, Index)>, Status> {
    match (term, index) {
        (0, 0) => Ok(None),
        (0, _) | (_, 0) => Err(Status::invalid_argument(format!(
            "log position must be all zero or all non-zero, got term={} index={}",
            term, index
        ))),
        (term, index) => Ok(Some((Term::new(term), Index::new(index)))),
    }
}

impl TryFrom<ProtoRequestVoteReq> for RequestVoteInput {
    type Error = Status;

    fn try_from(request: ProtoRequestVoteReq) -> Result<Self, Self::Error> {
        Ok(RequestVoteInput {
            candidate_term: Term::new(request.term),
            candidate_id: NodeId::new(request.client_node_id),
            candidate_last_log_entry: log_position(request.last_log_entry_term, request.last_log_entry_index)?,
        })
    }
}

impl TryFrom<ProtoAppendEntriesReq> for AppendEntriesInput {
    type Error = Status;

    fn try_from(request: ProtoAppendEntriesReq) -> Result<Self, Self::Error> {
        let leader_term = request.term;
        // A leader only sends entries it got from itself or earlier leaders.
        let new_entries = request
            .new_entries
            .into_iter()
            .map(|entry| {
                if entry.term == 0 || entry.term > leader_term {
                    return Err(Status::invalid_argument(format!(
                        "entry term {} must be in 1..={}",
                        entry.term, leader_term
                    )));
                }
                Ok(AppendEntriesLogEntry {
                    term: Term::new(entry.term),
                    data: Bytes::from(entry.data),
                })
            })
            .collect::<Result<Vec<_>, Status>>()?;

        Ok(AppendEntriesInput {
            leader_term: Term::new(leader_term),
            leader_id: NodeId::new(request.client_node_id),
            leader_previous_log_entry: log_position(request.previous_log_entry_term, request.previous_log_entry_index)?,
            leader_commit_index: Index::from_wire(request.commit_index),
            new_entries,
        })
    }
}

fn vote_error(err: proto_request_vote_error::Err) -> ProtoRequestVoteResult {
    ProtoRequestVoteResult {
        result: Some(proto_request_vote_result::Result::Err(ProtoRequestVoteError { err: Some(err) })),
    }
}

impl From<Result<RequestVoteOutput, RequestVoteError>> for ProtoRequestVoteResult {
    fn from(result: Result<RequestVoteOutput, RequestVoteError>) -> Self {
        let vote_granted = match result {
            Ok(output) => output.vote_granted,
            // A stranger asking for our vote just doesn't get it.
            Err(RequestVoteError::CandidateNotInCluster) => false,
            Err(RequestVoteError::RequestTermOutOfDate(info)) => {
                return vote_error(proto_request_vote_error::Err::StaleTerm(ProtoClientStaleTerm {
                    current_term: info.current_term.as_u64(),
                }))
            }
            Err(e @ RequestVoteError::ServerStorageError(_)) | Err(e @ RequestVoteError::ActorExited) => {
                return vote_error(proto_request_vote_error::Err::ServerFault(ProtoServerFault {
                    message: e.to_string(),
                }))
            }
        };

        ProtoRequestVoteResult {
            result: Some(proto_request_vote_result::Result::Ok(ProtoRequestVoteSuccess { vote_granted })),
        }
    }
}

impl From<Result<AppendEntriesOutput, AppendEntriesError>> for ProtoAppendEntriesResult {
    fn from(result: Result<AppendEntriesOutput, AppendEntriesError>) -> Self {
        let err = match result {
            Ok(_) => {
                return ProtoAppendEntriesResult {
                    result: Some(proto_append_entries_result::Result::Ok(ProtoAppendEntriesSuccess {})),
                }
            }
            Err(AppendEntriesError::ClientNotInCluster) => {
                proto_append_entries_error::Err::ClientNotInCluster(ProtoClientNotInCluster {})
            }
            Err(AppendEntriesError::ClientTermOutOfDate(info)) => {
                proto_append_entries_error::Err::StaleTerm(ProtoClientStaleTerm {
                    current_term: info.current_term.as_u64(),
                })
            }
            Err(AppendEntriesError::ServerMissingPreviousLogEntry { last_log_index }) => {
                proto_append_entries_error::Err::MissingLog(ProtoServerMissingPreviousLog {
                    last_log_index: last_log_index.map(|i| i.as_u64()).unwrap_or(0),
                })
            }
            Err(e @ AppendEntriesError::ServerStorageError(_)) | Err(e @ AppendEntriesError::ActorExited) => {
                proto_append_entries_error::Err::ServerFault(ProtoServerFault { message: e.to_string() })
            }
        };

        ProtoAppendEntriesResult {
            result: Some(proto_append_entries_result::Result::Err(ProtoAppendEntriesError { err: Some(err) })),
        }
    }
}

impl From<Result<EnqueueForReplicationOutput, EnqueueForReplicationError>> for ProtoProposeResult {
    fn from(result: Result<EnqueueForReplicationOutput, EnqueueForReplicationError>) -> Self {
        let result = match result {
            Ok(output) => proto_propose_result::Result::Ok(ProtoProposeAccepted {
                term: output.enqueued_term.as_u64(),
                index: output.enqueued_index.as_u64(),
            }),
            Err(EnqueueForReplicationError::LeaderRedirect(leader)) => {
                proto_propose_result::Result::NotLeader(ProtoNotLeader {
                    leader_id: leader.node_id.as_u64(),
                })
            }
            Err(EnqueueForReplicationError::NoLeader) => proto_propose_result::Result::NoLeader(ProtoNoLeader {}),
            Err(e @ EnqueueForReplicationError::LocalStorageError(_))
            | Err(e @ EnqueueForReplicationError::ActorExited) => {
                proto_propose_result::Result::ServerFault(ProtoServerFault { message: e.to_string() })
            }
        };

        ProtoProposeResult { result: Some(result) }
    }
}
