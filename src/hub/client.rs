use crate::grpc::grpc_hub_client::GrpcHubClient;
use crate::commitlog::Index;
use crate::grpc::{
    proto_hub_propose_result, proto_resolve_result, ProtoDecisionReq, ProtoHubProposeReq, ProtoRegisterReq,
    ProtoResolveReq,
};
use crate::replica::{CommittedEntry, NodeId, Term};
use bytes::Bytes;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tonic::transport::{Channel, Endpoint};

pub const DEFAULT_HUB_CACHE_TTL: Duration = Duration::from_secs(30);
pub const DEFAULT_HUB_CALL_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("hub has no address for node {0}")]
    Unknown(NodeId),
    #[error("hub at {address} is unreachable: {reason}")]
    Unreachable { address: String, reason: String },
    #[error("hub call timed out after {0:?}")]
    Timeout(Duration),
    #[error("hub turned the request down: {0}")]
    Rejected(String),
}

/// Where the hub got a proposal accepted. Accepted means durable in that leader's log, not
/// committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubProposal {
    pub node_id: NodeId,
    pub term: Term,
    pub index: Index,
}

/// HubClient talks to the hub: registration, address lookups, decision reports and relayed
/// proposals. Resolved addresses are cached for a bounded time; misses and failures are not.
#[derive(Clone)]
pub struct HubClient {
    inner: Arc<Inner>,
}

struct Inner {
    logger: slog::Logger,
    hub_address: String,
    call_timeout: Duration,
    cache: Mutex<AddressCache>,
    client: tokio::sync::Mutex<Option<GrpcHubClient<Channel>>>,
}

impl HubClient {
    pub fn new(logger: slog::Logger, hub_address: impl Into<String>, ttl: Duration, call_timeout: Duration) -> Self {
        HubClient {
            inner: Arc::new(Inner {
                logger,
                hub_address: hub_address.into(),
                call_timeout,
                cache: Mutex::new(AddressCache::new(ttl)),
                client: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Tell the hub where `node_id` listens.
    pub async fn register(&self, node_id: NodeId, address: impl Into<String>) -> Result<(), HubError> {
        let request = ProtoRegisterReq {
            node_id: node_id.as_u64(),
            address: address.into(),
        };

        self.call(|mut client| async move { client.register(request).await })
            .await
            .map(|_| ())
    }

    pub async fn resolve(&self, node_id: NodeId) -> Result<String, HubError> {
        if let Some(address) = self.lock_cache().get(node_id, Instant::now()) {
            return Ok(address);
        }

        let request = ProtoResolveReq {
            node_id: node_id.as_u64(),
        };
        let reply = self
            .call(|mut client| async move { client.resolve(request).await })
            .await?;

        match reply.result {
            Some(proto_resolve_result::Result::Address(address)) => {
                slog::debug!(self.inner.logger, "Hub resolved {:?} to {}", node_id, address);
                self.lock_cache().insert(node_id, address.clone(), Instant::now());
                Ok(address)
            }
            Some(proto_resolve_result::Result::Unknown(_)) | None => Err(HubError::Unknown(node_id)),
        }
    }

    /// Tell the hub that `node_id` applied `entry`.
    pub async fn report_decision(&self, node_id: NodeId, entry: &CommittedEntry) -> Result<(), HubError> {
        let request = ProtoDecisionReq {
            node_id: node_id.as_u64(),
            term: entry.term.as_u64(),
            index: entry.index.as_u64(),
            data: entry.data.to_vec(),
        };

        self.call(|mut client| async move { client.report_decision(request).await })
            .await
            .map(|_| ())
    }

    /// Ask the hub to hand `data` to the cluster's leader.
    pub async fn propose(&self, data: impl Into<Bytes>) -> Result<HubProposal, HubError> {
        let request = ProtoHubProposeReq {
            data: data.into().to_vec(),
        };
        let reply = self
            .call(|mut client| async move { client.propose(request).await })
            .await?;

        match reply.result {
            Some(proto_hub_propose_result::Result::Accepted(accepted)) if accepted.index != 0 => Ok(HubProposal {
                node_id: NodeId::new(accepted.node_id),
                term: Term::new(accepted.term),
                index: Index::new(accepted.index),
            }),
            Some(proto_hub_propose_result::Result::Accepted(_)) => {
                Err(HubError::Rejected("accepted at index 0".into()))
            }
            Some(proto_hub_propose_result::Result::NoLeader(_)) | None => {
                Err(HubError::Rejected("no registered node is leading".into()))
            }
        }
    }

    pub fn invalidate(&self, node_id: NodeId) {
        self.lock_cache().invalidate(node_id);
    }

    async fn call<T, F, Fut>(&self, rpc: F) -> Result<T, HubError>
    where
        F: FnOnce(GrpcHubClient<Channel>) -> Fut,
        Fut: Future<Output = Result<tonic::Response<T>, tonic::Status>>,
    {
        let call_timeout = self.inner.call_timeout;
        let attempt = async {
            let client = self.client().await?;
            rpc(client).await.map_err(|status| {
                self.unreachable(format!("{:?}", status))
            })
        };

        match tokio::time::timeout(call_timeout, attempt).await {
            Ok(Ok(response)) => Ok(response.into_inner()),
            Ok(Err(e)) => {
                // Reconnect next time.
                self.inner.client.lock().await.take();
                Err(e)
            }
            Err(_) => {
                self.inner.client.lock().await.take();
                Err(HubError::Timeout(call_timeout))
            }
        }
    }

    async fn client(&self) -> Result<GrpcHubClient<Channel>, HubError> {
        let mut cached = self.inner.client.lock().await;
        if let Some(client) = cached.as_ref() {
            return Ok(client.clone());
        }

        let endpoint = Endpoint::from_shared(format!("http://{}", self.inner.hub_address))
            .map_err(|e| self.unreachable(format!("{:?}", e)))?;
        let channel = endpoint
            .connect()
            .await
            .map_err(|e| self.unreachable(e.to_string()))?;

        let client = GrpcHubClient::new(channel);
        cached.replace(client.clone());
        Ok(client)
    }

    fn unreachable(&self, reason: String) -> HubError {
        HubError::Unreachable {
            address: self.inner.hub_address.clone(),
            reason,
        }
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, AddressCache> {
        self.inner.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct AddressCache {
    ttl: Duration,
    entries: HashMap<NodeId, (String, Instant)>,
}

impl AddressCache {
    fn new(ttl: Duration) -> Self {
        AddressCache {
            ttl,
            entries: HashMap::new(),
        }
    }

    fn get(&mut self, node_id: NodeId, now: Instant) -> Option<String> {
        match self.entries.get(&node_id) {
            Some((address, expires_at)) if now < *expires_at => Some(address.clone()),
            Some(_) => {
                self.entries.remove(&node_id);
                None
            }
            None => None,
        }
    }

    fn insert(&mut self, node_id: NodeId, address: String, now: Instant) {
        self.entries.insert(node_id, (address, now + self.ttl));
    }

    fn invalidate(&mut self, node_id: NodeId) {
        self.entries.remove(&node_id);
    }
}
