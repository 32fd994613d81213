use crate::grpc::grpc_hub_server::{GrpcHub, GrpcHubServer};
use crate::grpc::grpc_raft_client::GrpcRaftClient;
use crate::grpc::{
    proto_hub_propose_result, proto_propose_result, proto_resolve_result, ProtoDecisionReq, ProtoDecisionResult,
    ProtoHubProposeAccepted, ProtoHubProposeReq, ProtoHubProposeResult, ProtoNoLeader, ProtoProposeReq,
    ProtoRegisterReq, ProtoRegisterResult, ProtoResolveReq, ProtoResolveResult, ProtoUnknownNode,
};
use crate::replica::NodeId;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tonic::transport::{Endpoint, Server};
use tonic::{Request, Response, Status};

const DEFAULT_NODE_CALL_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
#[error("hub server failed: {0}")]
pub struct HubServeError(#[from] tonic::transport::Error);

/// One entry a node reported as applied.
#[derive(Clone, Debug, PartialEq)]
pub struct ReportedDecision {
    pub index: u64,
    pub term: u64,
    pub data: Bytes,
}

/// HubServer is a rendezvous point for a cluster. Nodes register `host:port` under their id, and
/// peers that lack a static address for a node resolve it here. Nodes also report every entry
/// they apply, and clients can hand the hub a proposal to pass on to the leader. Everything lives
/// in memory only.
#[derive(Clone)]
pub struct HubServer {
    logger: slog::Logger,
    directory: Arc<Mutex<HashMap<NodeId, String>>>,
    decisions: Arc<Mutex<HashMap<NodeId, BTreeMap<u64, ReportedDecision>>>>,
    // Where the last relayed proposal was accepted.
    last_leader: Arc<Mutex<Option<NodeId>>>,
    node_call_timeout: Duration,
}

impl HubServer {
    pub fn new(logger: slog::Logger) -> Self {
        HubServer {
            logger,
            directory: Arc::new(Mutex::new(HashMap::new())),
            decisions: Arc::new(Mutex::new(HashMap::new())),
            last_leader: Arc::new(Mutex::new(None)),
            node_call_timeout: DEFAULT_NODE_CALL_TIMEOUT,
        }
    }

    /// Serves until `shutdown` completes.
    pub async fn run<F>(self, socket_addr: SocketAddr, shutdown: F) -> Result<(), HubServeError>
    where
        F: Future<Output = ()>,
    {
        let logger = self.logger.clone();
        slog::info!(logger, "Hub listening on '{:?}'", socket_addr);

        let result = Server::builder()
            .add_service(GrpcHubServer::new(self))
            .serve_with_shutdown(socket_addr, shutdown)
            .await;

        slog::info!(logger, "Hub run() has exited: {:?}", result);
        result.map_err(HubServeError::from)
    }

    /// Everything `node_id` has reported so far, in index order. A clone of the server sees the
    /// same reports.
    pub fn decisions(&self, node_id: NodeId) -> Vec<ReportedDecision> {
        lock(&self.decisions)
            .get(&node_id)
            .map(|decided| decided.values().cloned().collect())
            .unwrap_or_default()
    }

    fn register_node(&self, node_id: NodeId, address: String) {
        let previous = lock(&self.directory).insert(node_id, address.clone());
        match previous {
            Some(previous) if previous != address => {
                slog::info!(self.logger, "{:?} moved from {} to {}", node_id, previous, address)
            }
            Some(_) => {}
            None => slog::info!(self.logger, "{:?} registered at {}", node_id, address),
        }
    }

    fn lookup(&self, node_id: NodeId) -> Option<String> {
        lock(&self.directory).get(&node_id).cloned()
    }

    fn record_decision(&self, node_id: NodeId, decision: ReportedDecision) {
        slog::info!(
            self.logger,
            "{:?} decided {} at index {}", node_id, String::from_utf8_lossy(&decision.data), decision.index;
            "Term" => decision.term
        );
        lock(&self.decisions)
            .entry(node_id)
            .or_default()
            .insert(decision.index, decision);
    }

    /// The last known leader first, then every registered node in id order.
    fn relay_order(&self) -> VecDeque<NodeId> {
        let mut node_ids: Vec<NodeId> = lock(&self.directory).keys().copied().collect();
        node_ids.sort();

        let mut order: VecDeque<NodeId> = node_ids.into_iter().collect();
        if let Some(leader) = *lock(&self.last_leader) {
            if let Some(position) = order.iter().position(|id| *id == leader) {
                order.remove(position);
                order.push_front(leader);
            }
        }
        order
    }

    async fn relay_proposal(&self, data: Vec<u8>) -> proto_hub_propose_result::Result {
        let mut order = self.relay_order();
        // Every node once, plus one redirect.
        let attempts = order.len() + 1;

        for _ in 0..attempts {
            let node_id = match order.pop_front() {
                Some(node_id) => node_id,
                None => break,
            };
            let address = match self.lookup(node_id) {
                Some(address) => address,
                None => continue,
            };

            match self.propose_to(&address, data.clone()).await {
                Ok(proto_propose_result::Result::Ok(accepted)) => {
                    slog::debug!(self.logger, "{:?} accepted proposal at index {}", node_id, accepted.index);
                    lock(&self.last_leader).replace(node_id);
                    return proto_hub_propose_result::Result::Accepted(ProtoHubProposeAccepted {
                        node_id: node_id.as_u64(),
                        term: accepted.term,
                        index: accepted.index,
                    });
                }
                Ok(proto_propose_result::Result::NotLeader(redirect)) => {
                    let leader = NodeId::new(redirect.leader_id);
                    slog::debug!(self.logger, "{:?} redirected proposal to {:?}", node_id, leader);
                    order.retain(|id| *id != leader);
                    order.push_front(leader);
                }
                Ok(proto_propose_result::Result::NoLeader(_)) => {
                    slog::debug!(self.logger, "{:?} knows no leader", node_id);
                }
                Ok(proto_propose_result::Result::ServerFault(fault)) => {
                    slog::warn!(self.logger, "{:?} failed the proposal: {}", node_id, fault.message);
                }
                Err(reason) => {
                    slog::warn!(self.logger, "Can't relay proposal to {:?} at {}: {}", node_id, address, reason);
                }
            }
        }

        proto_hub_propose_result::Result::NoLeader(ProtoNoLeader {})
    }

    async fn propose_to(&self, address: &str, data: Vec<u8>) -> Result<proto_propose_result::Result, String> {
        let call = async {
            let endpoint = Endpoint::from_shared(format!("http://{}", address)).map_err(|e| format!("{:?}", e))?;
            let channel = endpoint.connect().await.map_err(|e| e.to_string())?;
            let reply = GrpcRaftClient::new(channel)
                .propose(ProtoProposeReq { data })
                .await
                .map_err(|status| format!("{:?}", status))?;
            reply.into_inner().result.ok_or_else(|| "empty reply".to_string())
        };

        match tokio::time::timeout(self.node_call_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(format!("timed out after {:?}", self.node_call_timeout)),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait::async_trait]
impl GrpcHub for HubServer {
    async fn register(&self, request: Request<ProtoRegisterReq>) -> Result<Response<ProtoRegisterResult>, Status> {
        let request = request.into_inner();
        slog::debug!(self.logger, "ServerWire - {:?}", request);

        if request.address.is_empty() {
            return Err(Status::invalid_argument("address must not be empty"));
        }
        self.register_node(NodeId::new(request.node_id), request.address);

        Ok(Response::new(ProtoRegisterResult {}))
    }

    async fn resolve(&self, request: Request<ProtoResolveReq>) -> Result<Response<ProtoResolveResult>, Status> {
        let request = request.into_inner();
        slog::debug!(self.logger, "ServerWire - {:?}", request);

        let result = match self.lookup(NodeId::new(request.node_id)) {
            Some(address) => proto_resolve_result::Result::Address(address),
            None => proto_resolve_result::Result::Unknown(ProtoUnknownNode {}),
        };

        Ok(Response::new(ProtoResolveResult { result: Some(result) }))
    }

    async fn report_decision(
        &self,
        request: Request<ProtoDecisionReq>,
    ) -> Result<Response<ProtoDecisionResult>, Status> {
        let request = request.into_inner();
        slog::trace!(self.logger, "ServerWire - {:?}", request);

        if request.index == 0 || request.term == 0 {
            return Err(Status::invalid_argument("decided entries have a non-zero index and term"));
        }
        self.record_decision(
            NodeId::new(request.node_id),
            ReportedDecision {
                index: request.index,
                term: request.term,
                data: Bytes::from(request.data),
            },
        );

        Ok(Response::new(ProtoDecisionResult {}))
    }

    async fn propose(&self, request: Request<ProtoHubProposeReq>) -> Result<Response<ProtoHubProposeResult>, Status> {
        let request = request.into_inner();
        slog::debug!(self.logger, "ServerWire - Propose {} bytes", request.data.len());

        let result = self.relay_proposal(request.data).await;
        Ok(Response::new(ProtoHubProposeResult { result: Some(result) }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn directory_answers_latest_registration() {
        let hub = HubServer::new(slog::Logger::root(slog::Discard, slog::o!()));

        let unknown = hub
            .resolve(Request::new(ProtoResolveReq { node_id: 3 }))
            .await
            .unwrap()
            .into_inner();
        assert!(matches!(unknown.result, Some(proto_resolve_result::Result::Unknown(_))));

        for address in &["10.0.0.3:7000", "10.0.0.3:7100"] {
            hub.register(Request::new(ProtoRegisterReq {
                node_id: 3,
                address: address.to_string(),
            }))
            .await
            .unwrap();
        }

        let known = hub
            .resolve(Request::new(ProtoResolveReq { node_id: 3 }))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(
            known.result,
            Some(proto_resolve_result::Result::Address("10.0.0.3:7100".into()))
        );
    }

    #[tokio::test]
    async fn empty_address_is_rejected() {
        let hub = HubServer::new(slog::Logger::root(slog::Discard, slog::o!()));
        let status = hub
            .register(Request::new(ProtoRegisterReq {
                node_id: 1,
                address: String::new(),
            }))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    fn decision(node_id: u64, index: u64, term: u64, data: &'static [u8]) -> ProtoDecisionReq {
        ProtoDecisionReq {
            node_id,
            term,
            index,
            data: data.to_vec(),
        }
    }

    #[tokio::test]
    async fn decisions_are_kept_per_node_in_index_order() {
        let hub = HubServer::new(slog::Logger::root(slog::Discard, slog::o!()));

        for request in vec![
            decision(1, 2, 1, b"second"),
            decision(1, 1, 1, b"first"),
            decision(2, 1, 1, b"first"),
            // Reported twice, e.g. replayed after a restart.
            decision(1, 2, 1, b"second"),
        ] {
            hub.report_decision(Request::new(request)).await.unwrap();
        }

        let node_1: Vec<(u64, Bytes)> = hub
            .decisions(NodeId::new(1))
            .into_iter()
            .map(|d| (d.index, d.data))
            .collect();
        assert_eq!(
            node_1,
            vec![(1, Bytes::from_static(b"first")), (2, Bytes::from_static(b"second"))]
        );
        assert_eq!(hub.decisions(NodeId::new(2)).len(), 1);
        assert!(hub.decisions(NodeId::new(3)).is_empty());
    }

    #[tokio::test]
    async fn decision_without_index_is_rejected() {
        let hub = HubServer::new(slog::Logger::root(slog::Discard, slog::o!()));
        let status = hub
            .report_decision(Request::new(decision(1, 0, 1, b"x")))
            .await
            .unwrap_err();
        assert_eq!(status.code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn proposal_without_reachable_nodes_finds_no_leader() {
        let mut hub = HubServer::new(slog::Logger::root(slog::Discard, slog::o!()));
        hub.node_call_timeout = Duration::from_millis(300);

        let reply = hub
            .propose(Request::new(ProtoHubProposeReq { data: b"x".to_vec() }))
            .await
            .unwrap()
            .into_inner();
        assert!(matches!(reply.result, Some(proto_hub_propose_result::Result::NoLeader(_))));

        // Nothing listens on the discard port.
        hub.register_node(NodeId::new(1), "127.0.0.1:9".into());
        let reply = hub
            .propose(Request::new(ProtoHubProposeReq { data: b"x".to_vec() }))
            .await
            .unwrap()
            .into_inner();
        assert!(matches!(reply.result, Some(proto_hub_propose_result::Result::NoLeader(_))));
    }

    #[test]
    fn relay_tries_last_leader_first() {
        let hub = HubServer::new(slog::Logger::root(slog::Discard, slog::o!()));
        for id in &[3u64, 1, 2] {
            hub.register_node(NodeId::new(*id), format!("127.0.0.1:700{}", id));
        }
        assert_eq!(
            hub.relay_order(),
            vec![NodeId::new(1), NodeId::new(2), NodeId::new(3)]
        );

        lock(&hub.last_leader).replace(NodeId::new(2));
        assert_eq!(
            hub.relay_order(),
            vec![NodeId::new(2), NodeId::new(1), NodeId::new(3)]
        );
    }
}
