use crate::commitlog::Index;
use crate::grpc::grpc_raft_client::GrpcRaftClient;
use crate::grpc::{
    proto_append_entries_error, proto_append_entries_result, proto_request_vote_error, proto_request_vote_result,
    ProtoAppendEntriesReq, ProtoAppendEntriesResult, ProtoLogEntry, ProtoRequestVoteReq, ProtoRequestVoteResult,
};
use crate::replica::{
    AppendEntriesInput, AppendEntriesReplyFromPeerError, NodeId, RequestVoteInput, RequestVoteResult, Term,
};
use crate::transport::{AddressResolver, AppendEntriesReply, PeerTransport, TransportError};
use std::collections::HashMap;
use std::sync::Mutex;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};

/// PeerTransport over tonic. Keeps one channel per peer and drops it whenever the peer looks gone,
/// so the next call resolves and connects again.
pub(crate) struct GrpcTransport {
    logger: slog::Logger,
    resolver: AddressResolver,
    clients: Mutex<HashMap<NodeId, GrpcRaftClient<Channel>>>,
}

impl GrpcTransport {
    pub(crate) fn new(logger: slog::Logger, resolver: AddressResolver) -> Self {
        GrpcTransport {
            logger,
            resolver,
            clients: Mutex::new(HashMap::new()),
        }
    }

    async fn client(&self, peer_id: NodeId) -> Result<GrpcRaftClient<Channel>, TransportError> {
        if let Some(client) = self.cached_client(peer_id) {
            return Ok(client);
        }

        let address = self.resolver.resolve(peer_id).await?;
        let unreachable = |reason: String| TransportError::PeerUnreachable { peer_id, reason };

        let endpoint =
            Endpoint::from_shared(format!("http://{}", address)).map_err(|e| unreachable(format!("{:?}", e)))?;
        let channel = endpoint.connect().await.map_err(|e| {
            // Address may be stale.
            self.resolver.invalidate(peer_id);
            unreachable(format!("connect to {}: {}", address, e))
        })?;
        slog::debug!(self.logger, "Connected to {:?} at {}", peer_id, address);

        let client = GrpcRaftClient::new(channel);
        self.lock_clients().insert(peer_id, client.clone());
        Ok(client)
    }

    fn cached_client(&self, peer_id: NodeId) -> Option<GrpcRaftClient<Channel>> {
        self.lock_clients().get(&peer_id).cloned()
    }

    fn evict(&self, peer_id: NodeId) {
        self.lock_clients().remove(&peer_id);
        self.resolver.invalidate(peer_id);
    }

    fn lock_clients(&self) -> std::sync::MutexGuard<'_, HashMap<NodeId, GrpcRaftClient<Channel>>> {
        self.clients.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn status_to_error(&self, peer_id: NodeId, status: Status) -> TransportError {
        if matches!(status.code(), Code::Unavailable | Code::Unknown) {
            self.evict(peer_id);
        }
        TransportError::PeerUnreachable {
            peer_id,
            reason: format!("{:?}", status),
        }
    }
}

#[async_trait::async_trait]
impl PeerTransport for GrpcTransport {
    async fn request_vote(&self, peer_id: NodeId, input: RequestVoteInput) -> Result<RequestVoteResult, TransportError> {
        let mut client = self.client(peer_id).await?;

        let rpc_request = convert::request_vote_request(input);
        slog::trace!(self.logger, "ClientWire - {:?}", rpc_request);
        let rpc_reply = client.request_vote(rpc_request).await;
        slog::trace!(self.logger, "ClientWire - {:?}", rpc_reply);

        match rpc_reply {
            Ok(reply) => convert::request_vote_result(peer_id, reply.into_inner()),
            Err(status) => Err(self.status_to_error(peer_id, status)),
        }
    }

    async fn append_entries(
        &self,
        peer_id: NodeId,
        input: AppendEntriesInput,
    ) -> Result<AppendEntriesReply, TransportError> {
        let mut client = self.client(peer_id).await?;

        let rpc_request = convert::append_entries_request(input);
        slog::trace!(self.logger, "ClientWire - {:?}", rpc_request);
        let rpc_reply = client.append_entries(rpc_request).await;
        slog::trace!(self.logger, "ClientWire - {:?}", rpc_reply);

        match rpc_reply {
            Ok(reply) => convert::append_entries_result(peer_id, reply.into_inner()),
            Err(status) => Err(self.status_to_error(peer_id, status)),
        }
    }
}

mod convert {
    use super::*;

    fn log_entry_metadata(entry: Option<(Term, Index)>) -> (u64, u64) {
        match entry {
            None => (0, 0),
            Some((term, index)) => (term.as_u64(), index.as_u64()),
        }
    }

    pub(super) fn request_vote_request(input: RequestVoteInput) -> ProtoRequestVoteReq {
        let (last_log_entry_term, last_log_entry_index) = log_entry_metadata(input.candidate_last_log_entry);

        ProtoRequestVoteReq {
            client_node_id: input.candidate_id.as_u64(),
            term: input.candidate_term.as_u64(),
            last_log_entry_index,
            last_log_entry_term,
        }
    }

    pub(super) fn request_vote_result(
        peer_id: NodeId,
        rpc_result: ProtoRequestVoteResult,
    ) -> Result<RequestVoteResult, TransportError> {
        let malformed = |reason: &str| TransportError::MalformedReply {
            peer_id,
            reason: reason.to_string(),
        };

        match rpc_result.result {
            Some(proto_request_vote_result::Result::Ok(success)) => Ok(if success.vote_granted {
                RequestVoteResult::VoteGranted
            } else {
                RequestVoteResult::VoteNotGranted
            }),
            Some(proto_request_vote_result::Result::Err(err)) => match err.err {
                Some(proto_request_vote_error::Err::ServerFault(fault)) => {
                    Ok(RequestVoteResult::RetryableFailure(format!(
                        "Explicit server fault: {}",
                        fault.message
                    )))
                }
                Some(proto_request_vote_error::Err::StaleTerm(stale)) => Ok(RequestVoteResult::StaleTerm {
                    new_term: Term::new(stale.current_term),
                }),
                None => Err(malformed("RequestVote Err without a variant")),
            },
            None => Err(malformed("RequestVote result without a variant")),
        }
    }

    pub(super) fn append_entries_request(input: AppendEntriesInput) -> ProtoAppendEntriesReq {
        let (previous_log_entry_term, previous_log_entry_index) = log_entry_metadata(input.leader_previous_log_entry);

        ProtoAppendEntriesReq {
            client_node_id: input.leader_id.as_u64(),
            term: input.leader_term.as_u64(),
            commit_index: input.leader_commit_index.map(|i| i.as_u64()).unwrap_or(0),
            previous_log_entry_term,
            previous_log_entry_index,
            new_entries: input
                .new_entries
                .into_iter()
                .map(|entry| ProtoLogEntry {
                    term: entry.term.as_u64(),
                    data: entry.data.to_vec(),
                })
                .collect(),
        }
    }

    pub(super) fn append_entries_result(
        peer_id: NodeId,
        rpc_result: ProtoAppendEntriesResult,
    ) -> Result<AppendEntriesReply, TransportError> {
        let malformed = |reason: &str| TransportError::MalformedReply {
            peer_id,
            reason: reason.to_string(),
        };

        let err = match rpc_result.result {
            Some(proto_append_entries_result::Result::Ok(_)) => return Ok(Ok(())),
            Some(proto_append_entries_result::Result::Err(err)) => err,
            None => return Err(malformed("AppendEntries result without a variant")),
        };

        let reply_error = match err.err {
            Some(proto_append_entries_error::Err::ServerFault(fault)) => {
                AppendEntriesReplyFromPeerError::RetryableFailure(format!("Explicit server fault: {}", fault.message))
            }
            Some(proto_append_entries_error::Err::StaleTerm(stale)) => AppendEntriesReplyFromPeerError::StaleTerm {
                new_term: Term::new(stale.current_term),
            },
            Some(proto_append_entries_error::Err::MissingLog(missing)) => {
                AppendEntriesReplyFromPeerError::PeerMissingPreviousLogEntry {
                    last_log_index: Index::from_wire(missing.last_log_index),
                }
            }
            Some(proto_append_entries_error::Err::ClientNotInCluster(_)) => {
                // Retry in case peer is out of date. Not expecting this in practice.
                AppendEntriesReplyFromPeerError::RetryableFailure("Peer doesn't think we're in the cluster".into())
            }
            None => return Err(malformed("AppendEntries Err without a variant")),
        };

        Ok(Err(reply_error))
    }
}

#[cfg(test)]
mod tests {
    use super::convert;
    use super::*;
    use crate::grpc::{ProtoAppendEntriesError, ProtoServerMissingPreviousLog};
    use crate::replica::AppendEntriesLogEntry;
    use bytes::Bytes;

    #[test]
    fn append_entries_request_encodes_empty_previous_entry_as_zero() {
        let request = convert::append_entries_request(AppendEntriesInput {
            leader_term: Term::new(4),
            leader_id: NodeId::new(2),
            leader_previous_log_entry: None,
            leader_commit_index: None,
            new_entries: vec![AppendEntriesLogEntry {
                term: Term::new(4),
                data: Bytes::from_static(b"x"),
            }],
        });

        assert_eq!(request.client_node_id, 2);
        assert_eq!(request.term, 4);
        assert_eq!(request.commit_index, 0);
        assert_eq!((request.previous_log_entry_term, request.previous_log_entry_index), (0, 0));
        assert_eq!(request.new_entries.len(), 1);
        assert_eq!(request.new_entries[0].data, b"x".to_vec());
    }

    #[test]
    fn missing_log_reply_carries_last_index_hint() {
        let reply = ProtoAppendEntriesResult {
            result: Some(proto_append_entries_result::Result::Err(ProtoAppendEntriesError {
                err: Some(proto_append_entries_error::Err::MissingLog(ProtoServerMissingPreviousLog {
                    last_log_index: 7,
                })),
            })),
        };

        match convert::append_entries_result(NodeId::new(1), reply) {
            Ok(Err(AppendEntriesReplyFromPeerError::PeerMissingPreviousLogEntry { last_log_index })) => {
                assert_eq!(last_log_index, Some(Index::new(7)))
            }
            other => panic!("Unexpected: {:?}", other),
        }
    }

    #[test]
    fn empty_reply_is_malformed() {
        let reply = ProtoAppendEntriesResult { result: None };
        assert!(matches!(
            convert::append_entries_result(NodeId::new(1), reply),
            Err(TransportError::MalformedReply { .. })
        ));
    }
}
