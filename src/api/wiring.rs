use crate::actor::{ActorClient, Event, ReplicaActor};
use crate::api::event_bus::EventListener;
use crate::api::node::{ConsensusNode, DriverHandle};
use crate::api::options::RaftOptionsValidated;
use crate::commitlog::{FileLog, InMemoryLog, Log, StorageError};
use crate::config::{ClusterMembership, ConfigError, HubConfig};
use crate::hub::{spawn_decision_reporter, HubClient, DEFAULT_HUB_CACHE_TTL, DEFAULT_HUB_CALL_TIMEOUT};
use crate::replica::{
    create_replica, ClusterTracker, CommitStream, CommittedEntry, FileLocalState, MeNotInCluster, NodeId,
    PersistentLocalState, ReplicaWiring, StateMachine, VolatileLocalState, WriteAheadLogEntry,
};
use crate::server::{RpcServer, RpcServerShutdownHandle};
use crate::transport::{AddressResolver, GrpcTransport, LocalNetwork, PeerTransport};
use crate::{server, RaftOptions};
use std::convert::TryFrom;
use std::io;
use std::net::{SocketAddr, TcpListener, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const ACTOR_QUEUE_SIZE: usize = 32;
const LOG_FILE_NAME: &str = "log";
const METADATA_FILE_NAME: &str = "metadata.json";
const HUB_REGISTRATION_ATTEMPTS: u32 = 20;
const HUB_REGISTRATION_BACKOFF: Duration = Duration::from_millis(500);

pub struct NodeConfig {
    pub node_id: NodeId,
    pub membership: ClusterMembership,
    /// Where the log and metadata live. None keeps everything in memory, which loses all state on
    /// restart and is only meant for tests.
    pub data_dir: Option<PathBuf>,
    pub logger: slog::Logger,
    pub options: RaftOptions,
}

/// How this node talks to its peers.
pub enum NetworkConfig {
    /// Listen on our own membership address and call peers over gRPC. Peers without a static
    /// address are looked up in the hub, if there is one.
    Grpc { hub: Option<HubConfig> },
    /// Deliver through an in-process network shared by every node of a test cluster.
    Local(LocalNetwork),
}

#[derive(Debug, thiserror::Error)]
pub enum NodeStartError {
    #[error("Invalid cluster config: {0}")]
    InvalidConfig(#[from] ConfigError),
    #[error("Illegal options: {0}")]
    IllegalOptions(String),
    #[error(transparent)]
    MeNotInCluster(#[from] MeNotInCluster),
    #[error("Node {0} has no host/port in the membership, so there's nothing to listen on")]
    NoListenAddress(NodeId),
    #[error("Can't resolve listen address '{address}': {reason}")]
    InvalidListenAddress { address: String, reason: String },
    #[error("Can't listen on {address}: {source}")]
    Bind { address: SocketAddr, source: io::Error },
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl NodeStartError {
    /// Process exit code for an operator: 1 for local storage or socket trouble, 2 for bad config.
    pub fn exit_code(&self) -> i32 {
        match self {
            NodeStartError::Storage(_) | NodeStartError::Bind { .. } => 1,
            NodeStartError::InvalidConfig(_)
            | NodeStartError::IllegalOptions(_)
            | NodeStartError::MeNotInCluster(_)
            | NodeStartError::NoListenAddress(_)
            | NodeStartError::InvalidListenAddress { .. } => 2,
        }
    }
}

/// Loads (or creates) the node's durable state, starts its driver and network, and returns once
/// the node is running as a follower. Nothing is left running if this fails.
pub async fn start_node(
    config: NodeConfig,
    state_machine: Box<dyn StateMachine>,
    network: NetworkConfig,
) -> Result<ConsensusNode, NodeStartError> {
    config.membership.validate()?;
    let options =
        RaftOptionsValidated::try_from(config.options).map_err(|e| NodeStartError::IllegalOptions(e.to_string()))?;
    let cluster_tracker = ClusterTracker::new(config.node_id, &config.membership)?;
    let logger = config.logger.new(slog::o!("NodeId" => config.node_id.as_u64()));

    // Check the socket before touching storage, so a bad address can't leave a half started node.
    let listen_address = match &network {
        NetworkConfig::Grpc { .. } => Some(check_listen_address(&cluster_tracker)?),
        NetworkConfig::Local(_) => None,
    };

    let (actor_client, actor_queue_rx) = ActorClient::new(ACTOR_QUEUE_SIZE);

    let mut hub_registration = None;
    let mut decision_sink = None;
    let (transport, rpc_server): (Arc<dyn PeerTransport>, Option<(SocketAddr, RpcServer)>) = match &network {
        NetworkConfig::Grpc { hub } => {
            let hub_client = hub.as_ref().map(|hub| {
                HubClient::new(
                    logger.new(slog::o!("Hub" => hub.address())),
                    hub.address(),
                    DEFAULT_HUB_CACHE_TTL,
                    DEFAULT_HUB_CALL_TIMEOUT,
                )
            });
            if let (Some(hub_client), Some(my_address)) = (&hub_client, cluster_tracker.my_address()) {
                hub_registration = Some((hub_client.clone(), my_address.to_string()));
            }
            if let Some(hub_client) = &hub_client {
                decision_sink = Some(spawn_decision_reporter(logger.clone(), hub_client.clone(), config.node_id));
            }

            let resolver = AddressResolver::new(cluster_tracker.clone(), hub_client);
            let transport = GrpcTransport::new(logger.clone(), resolver);
            let server = RpcServer::new(logger.clone(), actor_client.weak());
            let socket_addr = listen_address.ok_or(NodeStartError::NoListenAddress(config.node_id))?;

            (Arc::new(transport), Some((socket_addr, server)))
        }
        NetworkConfig::Local(local_network) => {
            local_network.register(config.node_id, actor_client.weak());
            (Arc::new(local_network.transport_for(config.node_id)), None)
        }
    };

    let (server_shutdown_handle, server_shutdown_signal) = if rpc_server.is_some() {
        let (handle, signal) = server::shutdown_signal();
        (Some(handle), Some(signal))
    } else {
        (None, None)
    };

    let parts = DriverParts {
        logger: logger.clone(),
        cluster_tracker,
        state_machine,
        transport,
        actor_client: &actor_client,
        server_shutdown_handle,
        decision_sink,
        options: &options,
    };
    let (commit_stream, event_listener, driver) = match &config.data_dir {
        Some(data_dir) => {
            std::fs::create_dir_all(data_dir).map_err(StorageError::from)?;
            let log = FileLog::open(data_dir.join(LOG_FILE_NAME), options.storage_timeout)?;
            let local_state =
                FileLocalState::open(data_dir.join(METADATA_FILE_NAME), config.node_id, options.storage_timeout)?;
            spawn_driver(parts, log, Box::new(local_state), actor_queue_rx)?
        }
        None => {
            let log = InMemoryLog::create();
            let local_state = VolatileLocalState::new(config.node_id);
            spawn_driver(parts, log, Box::new(local_state), actor_queue_rx)?
        }
    };

    if let (Some((socket_addr, server)), Some(signal)) = (rpc_server, server_shutdown_signal) {
        tokio::spawn(server.run(socket_addr, signal));
    }
    if let Some((hub_client, my_address)) = hub_registration {
        spawn_hub_registration(logger.clone(), hub_client, config.node_id, my_address);
    }

    slog::info!(logger, "Node started"; "DataDir" => ?config.data_dir);

    Ok(ConsensusNode::new(
        config.node_id,
        actor_client,
        driver,
        commit_stream,
        event_listener,
    ))
}

struct DriverParts<'a> {
    logger: slog::Logger,
    cluster_tracker: ClusterTracker,
    state_machine: Box<dyn StateMachine>,
    transport: Arc<dyn PeerTransport>,
    actor_client: &'a ActorClient,
    server_shutdown_handle: Option<RpcServerShutdownHandle>,
    decision_sink: Option<mpsc::Sender<CommittedEntry>>,
    options: &'a RaftOptionsValidated,
}

fn spawn_driver<L>(
    parts: DriverParts<'_>,
    log: L,
    local_state: Box<dyn PersistentLocalState>,
    actor_queue_rx: mpsc::Receiver<Event>,
) -> Result<(CommitStream, EventListener, DriverHandle), StorageError>
where
    L: Log<WriteAheadLogEntry> + 'static,
{
    let (replica, commit_stream, election_state_change_listener) = create_replica(ReplicaWiring {
        logger: parts.logger.clone(),
        cluster_tracker: parts.cluster_tracker,
        log,
        local_state,
        state_machine: parts.state_machine,
        transport: parts.transport,
        actor_client: parts.actor_client.weak(),
        server_shutdown_handle: parts.server_shutdown_handle,
        leader_heartbeat_duration: parts.options.leader_heartbeat_duration,
        follower_min_timeout: parts.options.follower_min_timeout,
        follower_max_timeout: parts.options.follower_max_timeout,
        rpc_timeout: parts.options.rpc_timeout,
        max_entries_per_append: parts.options.max_entries_per_append,
        decision_sink: parts.decision_sink,
    })?;

    let replica_actor = ReplicaActor::new(parts.logger, actor_queue_rx, replica);
    let driver = tokio::spawn(replica_actor.run_event_loop());

    Ok((
        commit_stream,
        EventListener::new(election_state_change_listener),
        driver,
    ))
}

fn check_listen_address(cluster_tracker: &ClusterTracker) -> Result<SocketAddr, NodeStartError> {
    let address = cluster_tracker
        .my_address()
        .ok_or_else(|| NodeStartError::NoListenAddress(cluster_tracker.my_node_id()))?;
    let invalid = |reason: String| NodeStartError::InvalidListenAddress {
        address: address.to_string(),
        reason,
    };

    let socket_addr = address
        .to_socket_addrs()
        .map_err(|e| invalid(e.to_string()))?
        .next()
        .ok_or_else(|| invalid("resolved to nothing".into()))?;

    // Bind once and let go. The RPC server binds again for real right after startup.
    TcpListener::bind(socket_addr).map_err(|source| NodeStartError::Bind {
        address: socket_addr,
        source,
    })?;

    Ok(socket_addr)
}

fn spawn_hub_registration(logger: slog::Logger, hub_client: HubClient, node_id: NodeId, my_address: String) {
    tokio::spawn(async move {
        for attempt in 1..=HUB_REGISTRATION_ATTEMPTS {
            match hub_client.register(node_id, my_address.clone()).await {
                Ok(()) => {
                    slog::info!(logger, "Registered {} with hub", my_address);
                    return;
                }
                Err(e) => slog::warn!(logger, "Hub registration attempt {} failed: {}", attempt, e),
            }
            tokio::time::sleep(HUB_REGISTRATION_BACKOFF).await;
        }
        slog::error!(logger, "Giving up on hub registration. Peers must have our address statically.");
    });
}
