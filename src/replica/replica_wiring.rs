use crate::actor::WeakActorClient;
use crate::commitlog::{Log, StorageError};
use crate::replica::election::{ElectionConfig, ElectionState};
use crate::replica::replica::ReplicaConfig;
use crate::replica::{
    write_ahead_log, ClusterTracker, CommitStream, CommittedEntry, ElectionStateChangeListener, PersistentLocalState,
    Replica, StateMachine, WriteAheadLogEntry,
};
use crate::server::RpcServerShutdownHandle;
use crate::transport::PeerTransport;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Everything needed to assemble one node's `Replica`.
pub(crate) struct ReplicaWiring<L> {
    pub(crate) logger: slog::Logger,
    pub(crate) cluster_tracker: ClusterTracker,
    pub(crate) log: L,
    pub(crate) local_state: Box<dyn PersistentLocalState>,
    pub(crate) state_machine: Box<dyn StateMachine>,
    pub(crate) transport: Arc<dyn PeerTransport>,
    pub(crate) actor_client: WeakActorClient,
    pub(crate) server_shutdown_handle: Option<RpcServerShutdownHandle>,
    pub(crate) leader_heartbeat_duration: Duration,
    pub(crate) follower_min_timeout: Duration,
    pub(crate) follower_max_timeout: Duration,
    pub(crate) rpc_timeout: Duration,
    pub(crate) max_entries_per_append: usize,
    // Receives a copy of every applied entry, e.g. for reporting to the hub.
    pub(crate) decision_sink: Option<mpsc::Sender<CommittedEntry>>,
}

pub(crate) fn create_replica<L>(
    wiring: ReplicaWiring<L>,
) -> Result<(Replica<L>, CommitStream, ElectionStateChangeListener), StorageError>
where
    L: Log<WriteAheadLogEntry> + 'static,
{
    let my_node_id = wiring.cluster_tracker.my_node_id();

    // Everything up to the durable last applied index is committed; applying resumes after it.
    let last_applied = wiring.local_state.last_applied();
    let (write_ahead_log, commit_stream) = write_ahead_log::wired(
        wiring.logger.clone(),
        wiring.log,
        wiring.state_machine,
        last_applied,
        wiring.decision_sink,
    )?;

    let (election_state, election_state_change_listener) = ElectionState::new_follower(
        ElectionConfig {
            my_node_id,
            leader_heartbeat_duration: wiring.leader_heartbeat_duration,
            follower_min_timeout: wiring.follower_min_timeout,
            follower_max_timeout: wiring.follower_max_timeout,
        },
        wiring.actor_client.clone(),
    );

    let replica = Replica::new(ReplicaConfig {
        logger: wiring.logger,
        cluster_tracker: wiring.cluster_tracker,
        local_state: wiring.local_state,
        election_state,
        write_ahead_log,
        transport: wiring.transport,
        actor_client: wiring.actor_client,
        rpc_timeout: wiring.rpc_timeout,
        request_vote_retry_backoff: wiring.leader_heartbeat_duration,
        max_entries_per_append: wiring.max_entries_per_append,
        server_shutdown_handle: wiring.server_shutdown_handle,
    });

    Ok((replica, commit_stream, election_state_change_listener))
}
