use crate::hub::HubClient;
use crate::replica::{ClusterTracker, NodeId};
use crate::transport::TransportError;

/// Finds a peer's `host:port`. The static membership wins; the hub is only asked about members
/// that were configured without an address.
#[derive(Clone)]
pub(crate) struct AddressResolver {
    cluster_tracker: ClusterTracker,
    hub: Option<HubClient>,
}

impl AddressResolver {
    pub(crate) fn new(cluster_tracker: ClusterTracker, hub: Option<HubClient>) -> Self {
        AddressResolver { cluster_tracker, hub }
    }

    pub(crate) async fn resolve(&self, peer_id: NodeId) -> Result<String, TransportError> {
        if let Some(address) = self.cluster_tracker.static_address(&peer_id) {
            return Ok(address.to_string());
        }

        match &self.hub {
            None => Err(TransportError::PeerUnreachable {
                peer_id,
                reason: "no static address and no hub configured".into(),
            }),
            // A hub miss or an unreachable hub is the same as an unreachable peer.
            Some(hub) => hub.resolve(peer_id).await.map_err(|e| TransportError::PeerUnreachable {
                peer_id,
                reason: e.to_string(),
            }),
        }
    }

    /// Forget a hub answer, e.g. after the peer stopped answering at that address.
    pub(crate) fn invalidate(&self, peer_id: NodeId) {
        if let Some(hub) = &self.hub {
            hub.invalidate(peer_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ClusterMembership, MemberConfig};

    #[tokio::test]
    async fn static_address_wins_and_missing_address_without_hub_is_unreachable() {
        let membership = ClusterMembership::new(vec![
            MemberConfig::with_address(1, "127.0.0.1", 7001),
            MemberConfig::with_address(2, "10.0.0.2", 7002),
            MemberConfig::without_address(3),
        ]);
        let tracker = ClusterTracker::new(NodeId::new(1), &membership).unwrap();
        let resolver = AddressResolver::new(tracker, None);

        assert_eq!(resolver.resolve(NodeId::new(2)).await.unwrap(), "10.0.0.2:7002");
        assert!(matches!(
            resolver.resolve(NodeId::new(3)).await,
            Err(TransportError::PeerUnreachable { .. })
        ));
    }
}
