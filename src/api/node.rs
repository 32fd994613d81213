use crate::actor::ActorClient;
use crate::api::event_bus::EventListener;
use crate::commitlog::{Index, StorageError};
use crate::replica;
use crate::replica::{CommitStream, LeaderRedirectInfo, LogEntry, NodeId, ReplicaStatus, Term};
use bytes::Bytes;
use tokio::task::JoinHandle;

pub(crate) type DriverHandle = JoinHandle<Result<(), StorageError>>;

/// ConsensusNode is the application's handle on one running node. Dropping it without calling
/// `shutdown()` still stops the node, just without waiting for it.
pub struct ConsensusNode {
    node_id: NodeId,
    actor_client: ActorClient,
    // None once `stopped()` has seen the driver exit.
    driver: Option<DriverHandle>,
    commit_stream: Option<CommitStream>,
    event_listener: EventListener,
}

impl ConsensusNode {
    pub(crate) fn new(
        node_id: NodeId,
        actor_client: ActorClient,
        driver: DriverHandle,
        commit_stream: CommitStream,
        event_listener: EventListener,
    ) -> Self {
        ConsensusNode {
            node_id,
            actor_client,
            driver: Some(driver),
            commit_stream: Some(commit_stream),
            event_listener,
        }
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Appends `data` to the leader's log and starts replicating it. Returning Ok means the entry
    /// is durable on this node, not that it's committed. Watch the commit stream for that.
    pub async fn propose(&self, data: impl Into<Bytes>) -> Result<ProposeOutput, ProposeError> {
        let input = replica::EnqueueForReplicationInput { data: data.into() };

        self.actor_client
            .enqueue_for_replication(input)
            .await
            .map(ProposeOutput::from)
            .map_err(ProposeError::from)
    }

    pub async fn status(&self) -> Result<ReplicaStatus, NodeStopped> {
        self.actor_client.status().await.map_err(|_| NodeStopped)
    }

    /// A copy of the whole local log, committed or not.
    pub async fn log_entries(&self) -> Result<Vec<LogEntry>, ReadLogError> {
        self.actor_client.read_log().await.map_err(ReadLogError::from)
    }

    /// Committed entries, in index order, along with the state machine's output. There is only one
    /// stream per node; later calls return None.
    pub fn take_commit_stream(&mut self) -> Option<CommitStream> {
        self.commit_stream.take()
    }

    pub fn event_listener(&self) -> EventListener {
        self.event_listener.clone()
    }

    /// Stops the node once the event it's currently handling (including its writes) is done, then
    /// waits for the driver task to exit.
    pub async fn shutdown(self) {
        let ConsensusNode {
            actor_client, driver, ..
        } = self;

        // An error means the driver is already gone, which is what we want anyway.
        let _ = actor_client.shutdown().await;
        drop(actor_client);
        if let Some(driver) = driver {
            let _ = driver.await;
        }
    }

    /// Resolves when the node stops without being asked to, which only happens when its local
    /// storage fails in a way it can't continue from. The process should exit then. Cancel safe.
    pub async fn stopped(&mut self) -> NodeFailure {
        let driver = match self.driver.as_mut() {
            Some(driver) => driver,
            None => return NodeFailure::AlreadyReported,
        };

        let result = driver.await;
        self.driver = None;
        match result {
            Ok(Err(e)) => NodeFailure::Storage(e),
            // The node holds a strong client, so the driver can't run out of clients.
            Ok(Ok(())) => NodeFailure::Exited,
            Err(join_error) => NodeFailure::Crashed(join_error.to_string()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum NodeFailure {
    #[error("Local storage failed: {0}")]
    Storage(StorageError),

    #[error("Driver exited unexpectedly")]
    Exited,

    #[error("Driver crashed: {0}")]
    Crashed(String),

    #[error("Failure was already returned by an earlier call")]
    AlreadyReported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProposeOutput {
    pub term: Term,
    pub index: Index,
}

#[derive(Debug, thiserror::Error)]
pub enum ProposeError {
    #[error("Not leader, try {0:?}")]
    NotLeader(LeaderRedirectInfo),

    // Likely an election is in progress. Retry after a short delay.
    #[error("No leader is known right now")]
    NoLeader,

    #[error("Failed to persist entry: {0}")]
    Storage(StorageError),

    #[error("Node has stopped")]
    Stopped,
}

#[derive(Debug, thiserror::Error)]
pub enum ReadLogError {
    #[error("Failed to read local log: {0}")]
    Storage(StorageError),

    #[error("Node has stopped")]
    Stopped,
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("Node has stopped")]
pub struct NodeStopped;

// ------- Conversions --------

impl From<replica::EnqueueForReplicationOutput> for ProposeOutput {
    fn from(internal_output: replica::EnqueueForReplicationOutput) -> Self {
        ProposeOutput {
            term: internal_output.enqueued_term,
            index: internal_output.enqueued_index,
        }
    }
}

impl From<replica::EnqueueForReplicationError> for ProposeError {
    fn from(internal_error: replica::EnqueueForReplicationError) -> Self {
        match internal_error {
            replica::EnqueueForReplicationError::LeaderRedirect(leader) => ProposeError::NotLeader(leader),
            replica::EnqueueForReplicationError::NoLeader => ProposeError::NoLeader,
            replica::EnqueueForReplicationError::LocalStorageError(e) => ProposeError::Storage(e),
            replica::EnqueueForReplicationError::ActorExited => ProposeError::Stopped,
        }
    }
}

impl From<replica::ReadLogError> for ReadLogError {
    fn from(internal_error: replica::ReadLogError) -> Self {
        match internal_error {
            replica::ReadLogError::LocalStorageError(e) => ReadLogError::Storage(e),
            replica::ReadLogError::ActorExited => ReadLogError::Stopped,
        }
    }
}
