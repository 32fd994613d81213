//! How a node reaches its peers. The replica only sees `PeerTransport`; it never knows whether the
//! peer is across a gRPC channel or inside the same process.

mod grpc;
mod local;
mod resolver;

use crate::replica::{
    AppendEntriesInput, AppendEntriesReplyFromPeerError, NodeId, RequestVoteInput, RequestVoteResult,
};

pub(crate) use grpc::GrpcTransport;
pub use local::LocalNetwork;
pub use local::NetworkFaults;
pub(crate) use resolver::AddressResolver;

/// What a leader or candidate observes after calling AppendEntries on a peer.
pub(crate) type AppendEntriesReply = Result<(), AppendEntriesReplyFromPeerError>;

#[async_trait::async_trait]
pub(crate) trait PeerTransport: Send + Sync + 'static {
    /// Deliver a RequestVote and wait for the peer's answer. Not bounded in time; callers apply
    /// their own timeout.
    async fn request_vote(&self, peer_id: NodeId, input: RequestVoteInput) -> Result<RequestVoteResult, TransportError>;

    async fn append_entries(
        &self,
        peer_id: NodeId,
        input: AppendEntriesInput,
    ) -> Result<AppendEntriesReply, TransportError>;
}

/// Delivery failures. All of them are transient from the protocol's point of view: the caller
/// retries on its next timer.
#[derive(Debug, thiserror::Error)]
pub(crate) enum TransportError {
    #[error("Peer {peer_id:?} is unreachable: {reason}")]
    PeerUnreachable { peer_id: NodeId, reason: String },
    #[error("Peer {peer_id:?} sent a malformed reply: {reason}")]
    MalformedReply { peer_id: NodeId, reason: String },
}
