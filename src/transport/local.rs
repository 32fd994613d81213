use crate::actor::WeakActorClient;
use crate::replica::{append_entries_reply, AppendEntriesInput, NodeId, RequestVoteInput, RequestVoteResult};
use crate::transport::{AppendEntriesReply, PeerTransport, TransportError};
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Faults applied to every message on a `LocalNetwork`.
#[derive(Clone, Debug, Default)]
pub struct NetworkFaults {
    /// Fraction of requests that vanish. The caller sees nothing until its own timeout fires.
    pub drop_ratio: f64,
    /// Fraction of requests delivered a second time. The duplicate's reply is discarded.
    pub duplicate_ratio: f64,
    /// Each delivery waits a random delay up to this, which also reorders messages.
    pub max_delay: Duration,
}

/// An in-process network connecting nodes started in the same process. Links can be cut and
/// faults injected at runtime.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    inner: Arc<Mutex<NetworkState>>,
}

#[derive(Default)]
struct NetworkState {
    nodes: HashMap<NodeId, WeakActorClient>,
    // Directed (from, to) pairs that can't talk.
    cut_links: HashSet<(NodeId, NodeId)>,
    faults: NetworkFaults,
}

enum Route {
    Deliver {
        target: WeakActorClient,
        delay: Duration,
        duplicate: bool,
    },
    Drop,
    Cut,
    NotRegistered,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Separate `side_a` from `side_b` in both directions. Links inside each side stay up.
    pub fn partition(&self, side_a: &[NodeId], side_b: &[NodeId]) {
        let mut state = self.lock();
        for a in side_a {
            for b in side_b {
                state.cut_links.insert((*a, *b));
                state.cut_links.insert((*b, *a));
            }
        }
    }

    /// Cut `node` off from every node registered so far.
    pub fn isolate(&self, node: NodeId) {
        let mut state = self.lock();
        let others: Vec<NodeId> = state.nodes.keys().copied().filter(|n| *n != node).collect();
        for other in others {
            state.cut_links.insert((node, other));
            state.cut_links.insert((other, node));
        }
    }

    /// Restore every link. Faults set with `set_faults` stay in place.
    pub fn heal(&self) {
        self.lock().cut_links.clear();
    }

    pub fn set_faults(&self, faults: NetworkFaults) {
        self.lock().faults = faults;
    }

    /// Attach a node's driver. A restarted node re-registers under the same id.
    pub(crate) fn register(&self, node_id: NodeId, actor_client: WeakActorClient) {
        self.lock().nodes.insert(node_id, actor_client);
    }

    pub(crate) fn transport_for(&self, node_id: NodeId) -> LocalTransport {
        LocalTransport {
            me: node_id,
            network: self.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, NetworkState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn route(&self, from: NodeId, to: NodeId) -> Route {
        let state = self.lock();
        if state.cut_links.contains(&(from, to)) {
            return Route::Cut;
        }
        let target = match state.nodes.get(&to) {
            Some(target) => target.clone(),
            None => return Route::NotRegistered,
        };

        // Decide everything up front; ThreadRng can't be held across an await.
        let mut rng = rand::thread_rng();
        let faults = &state.faults;
        if faults.drop_ratio > 0.0 && rng.gen_bool(faults.drop_ratio.min(1.0)) {
            return Route::Drop;
        }
        let duplicate = faults.duplicate_ratio > 0.0 && rng.gen_bool(faults.duplicate_ratio.min(1.0));
        let delay = if faults.max_delay > Duration::from_millis(0) {
            rng.gen_range(Duration::from_millis(0)..=faults.max_delay)
        } else {
            Duration::from_millis(0)
        };

        Route::Deliver {
            target,
            delay,
            duplicate,
        }
    }

    fn is_cut(&self, from: NodeId, to: NodeId) -> bool {
        self.lock().cut_links.contains(&(from, to))
    }
}

/// One node's view of a `LocalNetwork`.
pub(crate) struct LocalTransport {
    me: NodeId,
    network: LocalNetwork,
}

impl LocalTransport {
    async fn deliver(&self, peer_id: NodeId) -> Result<(WeakActorClient, bool), TransportError> {
        let unreachable = |reason: &str| TransportError::PeerUnreachable {
            peer_id,
            reason: reason.to_string(),
        };

        match self.network.route(self.me, peer_id) {
            Route::Deliver {
                target,
                delay,
                duplicate,
            } => {
                if delay > Duration::from_millis(0) {
                    tokio::time::sleep(delay).await;
                }
                Ok((target, duplicate))
            }
            Route::Drop => {
                // Lost in flight. Only the caller's timeout ends this.
                std::future::pending::<()>().await;
                Err(unreachable("message dropped"))
            }
            Route::Cut => Err(unreachable("link is partitioned")),
            Route::NotRegistered => Err(unreachable("no such node on this network")),
        }
    }

    fn reply_path(&self, peer_id: NodeId) -> Result<(), TransportError> {
        if self.network.is_cut(peer_id, self.me) {
            return Err(TransportError::PeerUnreachable {
                peer_id,
                reason: "reply lost to partition".into(),
            });
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl PeerTransport for LocalTransport {
    async fn request_vote(&self, peer_id: NodeId, input: RequestVoteInput) -> Result<RequestVoteResult, TransportError> {
        let (target, duplicate) = self.deliver(peer_id).await?;
        if duplicate {
            let twin = target.clone();
            let input = input.clone();
            tokio::spawn(async move {
                let _ = twin.request_vote(input).await;
            });
        }

        let result = target.request_vote(input).await;
        self.reply_path(peer_id)?;
        Ok(RequestVoteResult::from(result))
    }

    async fn append_entries(
        &self,
        peer_id: NodeId,
        input: AppendEntriesInput,
    ) -> Result<AppendEntriesReply, TransportError> {
        let (target, duplicate) = self.deliver(peer_id).await?;
        if duplicate {
            let twin = target.clone();
            let input = input.clone();
            tokio::spawn(async move {
                let _ = twin.append_entries(input).await;
            });
        }

        let result = target.append_entries(input).await;
        self.reply_path(peer_id)?;
        Ok(append_entries_reply(result))
    }
}
