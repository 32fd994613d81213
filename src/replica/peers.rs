use crate::config::ClusterMembership;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

/// NodeId identifies one member of the cluster. It's stable for the lifetime of the process and
/// across restarts.
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(u64);

impl NodeId {
    pub fn new(id: u64) -> Self {
        NodeId(id)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node-{}", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("node {0} is not a member of the configured cluster")]
pub struct MeNotInCluster(pub NodeId);

/// ClusterTracker is the static view of cluster membership from the local node's point of view.
#[derive(Clone)]
pub(crate) struct ClusterTracker {
    my_node_id: NodeId,
    // Static address of each peer, if the membership file has one.
    peers: HashMap<NodeId, Option<String>>,
    my_address: Option<String>,
}

impl ClusterTracker {
    pub(crate) fn new(my_node_id: NodeId, membership: &ClusterMembership) -> Result<Self, MeNotInCluster> {
        let mut my_address = None;
        let mut found_me = false;
        let mut peers = HashMap::with_capacity(membership.members().len());
        for member in membership.members() {
            if member.id == my_node_id {
                found_me = true;
                my_address = member.address();
            } else {
                peers.insert(member.id, member.address());
            }
        }

        if !found_me {
            return Err(MeNotInCluster(my_node_id));
        }

        Ok(ClusterTracker {
            my_node_id,
            peers,
            my_address,
        })
    }

    pub(crate) fn my_node_id(&self) -> NodeId {
        self.my_node_id
    }

    pub(crate) fn my_address(&self) -> Option<&str> {
        self.my_address.as_deref()
    }

    pub(crate) fn contains_member(&self, node_id: &NodeId) -> bool {
        *node_id == self.my_node_id || self.peers.contains_key(node_id)
    }

    pub(crate) fn peer_ids(&self) -> HashSet<NodeId> {
        self.peers.keys().copied().collect()
    }

    pub(crate) fn num_voting_replicas(&self) -> usize {
        self.peers.len() + 1
    }

    pub(crate) fn static_address(&self, node_id: &NodeId) -> Option<&str> {
        if *node_id == self.my_node_id {
            return self.my_address();
        }
        self.peers.get(node_id).and_then(|a| a.as_deref())
    }
}
