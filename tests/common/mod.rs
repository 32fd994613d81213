#![allow(dead_code)] // Each test binary uses a different subset.

use bytes::Bytes;
use consensus_node::{
    start_node, ClusterMembership, ConsensusNode, LocalNetwork, LogEntry, MemberConfig, NetworkConfig, NodeConfig,
    NodeId, ProposeError, ProposeOutput, RaftOptions, Role, StateMachine, StateMachineOutput, Term,
};
use slog::Drain;
use std::collections::HashMap;
use std::error::Error;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::time::{Duration, Instant};

pub const DEADLINE: Duration = Duration::from_secs(15);

pub fn options() -> RaftOptions {
    RaftOptions {
        leader_heartbeat_duration: Some(Duration::from_millis(50)),
        follower_min_timeout: Some(Duration::from_millis(300)),
        follower_max_timeout: Some(Duration::from_millis(600)),
        rpc_timeout: Some(Duration::from_millis(100)),
        max_entries_per_append: Some(4),
        storage_timeout: Some(Duration::from_secs(2)),
    }
}

/// Quiet unless CONSENSUS_LOG is set, then the same terminal output as the binary.
pub fn logger() -> slog::Logger {
    if std::env::var(consensus_node::LOG_LEVEL_ENV).is_err() {
        return slog::Logger::root(slog::Discard, slog::o!());
    }

    let decorator = slog_term::TermDecorator::new().build();
    let drain = slog_term::FullFormat::new(decorator).use_file_location().build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    let drain = slog::LevelFilter::new(drain, consensus_node::level_from_env()).fuse();
    slog::Logger::root(drain, slog::o!())
}

/// Remembers every entry it's asked to apply, in order.
#[derive(Clone, Default)]
pub struct RecordingStateMachine {
    applied: Arc<Mutex<Vec<(u64, Bytes)>>>,
}

impl RecordingStateMachine {
    pub fn applied(&self) -> Vec<(u64, Bytes)> {
        self.applied.lock().unwrap().clone()
    }

    pub fn applied_data(&self) -> Vec<Bytes> {
        self.applied().into_iter().map(|(_, data)| data).collect()
    }

    pub fn len(&self) -> usize {
        self.applied.lock().unwrap().len()
    }
}

impl StateMachine for RecordingStateMachine {
    fn apply(&mut self, entry: &LogEntry) -> StateMachineOutput {
        self.applied
            .lock()
            .unwrap()
            .push((entry.index.as_u64(), entry.data.clone()));
        StateMachineOutput::Data(entry.data.clone())
    }
}

/// An in-process cluster on a LocalNetwork.
pub struct TestCluster {
    pub network: LocalNetwork,
    membership: ClusterMembership,
    nodes: HashMap<u64, ConsensusNode>,
    state_machines: HashMap<u64, RecordingStateMachine>,
    data_dirs: Option<HashMap<u64, TempDir>>,
    // term -> the one node seen leading it.
    observed_leaders: Mutex<HashMap<Term, NodeId>>,
}

impl TestCluster {
    pub async fn start(num_nodes: u64) -> Result<Self, Box<dyn Error>> {
        Self::start_with_storage(num_nodes, false).await
    }

    /// With `durable`, every node keeps its log and metadata in its own temp directory, so a
    /// restart recovers them.
    pub async fn start_with_storage(num_nodes: u64, durable: bool) -> Result<Self, Box<dyn Error>> {
        let ids: Vec<u64> = (1..=num_nodes).collect();
        let membership = ClusterMembership::new(ids.iter().map(|id| MemberConfig::without_address(*id)).collect());
        let data_dirs = if durable {
            let mut dirs = HashMap::new();
            for id in ids.iter() {
                dirs.insert(*id, tempfile::tempdir()?);
            }
            Some(dirs)
        } else {
            None
        };

        let mut cluster = TestCluster {
            network: LocalNetwork::new(),
            membership,
            nodes: HashMap::new(),
            state_machines: HashMap::new(),
            data_dirs,
            observed_leaders: Mutex::new(HashMap::new()),
        };
        for id in ids {
            cluster.start_node(id).await?;
        }

        Ok(cluster)
    }

    /// Starts (or restarts) `id` with a fresh state machine.
    pub async fn start_node(&mut self, id: u64) -> Result<(), Box<dyn Error>> {
        let state_machine = RecordingStateMachine::default();
        let data_dir: Option<PathBuf> = self
            .data_dirs
            .as_ref()
            .and_then(|dirs| dirs.get(&id))
            .map(|dir| dir.path().to_path_buf());

        let node = start_node(
            NodeConfig {
                node_id: NodeId::new(id),
                membership: self.membership.clone(),
                data_dir,
                logger: logger(),
                options: options(),
            },
            Box::new(state_machine.clone()),
            NetworkConfig::Local(self.network.clone()),
        )
        .await?;

        self.nodes.insert(id, node);
        self.state_machines.insert(id, state_machine);
        Ok(())
    }

    /// Stops `id` the way a crash would look to its peers: it just stops answering.
    pub async fn stop_node(&mut self, id: u64) {
        if let Some(node) = self.nodes.remove(&id) {
            node.shutdown().await;
        }
    }

    pub async fn shutdown(mut self) {
        for (_, node) in self.nodes.drain() {
            node.shutdown().await;
        }
    }

    pub fn node(&self, id: u64) -> &ConsensusNode {
        &self.nodes[&id]
    }

    pub fn running(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.nodes.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn state_machine(&self, id: u64) -> &RecordingStateMachine {
        &self.state_machines[&id]
    }

    /// Waits until one of `among` leads in a term at least as high as every other node in `among`.
    pub async fn wait_for_leader(&self, among: &[u64]) -> Result<u64, Box<dyn Error>> {
        let deadline = Instant::now() + DEADLINE;
        while Instant::now() < deadline {
            let mut max_term = Term::new(0);
            let mut leader = None;
            for id in among {
                let status = self.nodes[id].status().await?;
                max_term = max_term.max(status.term);
                if status.role == Role::Leader {
                    self.observe_leader(status.term, status.node_id);
                    leader = Some((*id, status.term));
                }
            }

            if let Some((id, term)) = leader {
                if term >= max_term {
                    return Ok(id);
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        Err("no leader elected before the deadline".into())
    }

    /// Proposes through whoever leads `among`, retrying through elections.
    pub async fn propose(&self, among: &[u64], data: &str) -> Result<(u64, ProposeOutput), Box<dyn Error>> {
        let deadline = Instant::now() + DEADLINE;
        while Instant::now() < deadline {
            let leader = self.wait_for_leader(among).await?;
            match self.nodes[&leader].propose(Bytes::copy_from_slice(data.as_bytes())).await {
                Ok(output) => return Ok((leader, output)),
                Err(ProposeError::NotLeader(_)) | Err(ProposeError::NoLeader) => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(format!("couldn't propose {:?} before the deadline", data).into())
    }

    /// Waits until every node in `ids` has applied at least `count` entries.
    pub async fn wait_for_applied(&self, ids: &[u64], count: usize) -> Result<(), Box<dyn Error>> {
        let deadline = Instant::now() + DEADLINE;
        while Instant::now() < deadline {
            if ids.iter().all(|id| self.state_machines[id].len() >= count) {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let progress: Vec<(u64, usize)> = ids.iter().map(|id| (*id, self.state_machines[id].len())).collect();
        Err(format!("nodes didn't apply {} entries in time: {:?}", count, progress).into())
    }

    /// Every pair of nodes applied the same entries at the same indexes, and nobody skipped or
    /// repeated an index.
    pub fn assert_state_machine_safety(&self) {
        let histories: Vec<(u64, Vec<(u64, Bytes)>)> = self
            .state_machines
            .iter()
            .map(|(id, state_machine)| (*id, state_machine.applied()))
            .collect();

        for (id, history) in histories.iter() {
            let indexes: Vec<u64> = history.iter().map(|(index, _)| *index).collect();
            let contiguous: Vec<u64> = match indexes.first() {
                Some(first) => (*first..*first + indexes.len() as u64).collect(),
                None => vec![],
            };
            assert_eq!(indexes, contiguous, "node {} applied out of order", id);
        }

        for (id_a, history_a) in histories.iter() {
            for (id_b, history_b) in histories.iter() {
                for (index, data) in history_a.iter() {
                    if let Some((_, other)) = history_b.iter().find(|(other_index, _)| other_index == index) {
                        assert_eq!(data, other, "nodes {} and {} applied different entries at {}", id_a, id_b, index);
                    }
                }
            }
        }
    }

    fn observe_leader(&self, term: Term, node_id: NodeId) {
        let mut observed = self.observed_leaders.lock().unwrap();
        let first = *observed.entry(term).or_insert(node_id);
        assert_eq!(first, node_id, "two leaders in term {:?}", term);
    }
}

pub fn node_ids(ids: &[u64]) -> Vec<NodeId> {
    ids.iter().map(|id| NodeId::new(*id)).collect()
}
