use crate::actor::WeakActorClient;
use crate::commitlog::Index;
use crate::replica::election::state_change_listener::ElectionStateChangeNotifier;
use crate::replica::election::timers::{ElectionTimerHandle, HeartbeatTimerHandle};
use crate::replica::election::{state_change_listener, LeaderStateTracker, PeerState};
use crate::replica::{ElectionStateChangeListener, ElectionStateSnapshot, LeaderRedirectInfo, NodeId, Role, Term};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::time::Duration;

#[derive(Clone)]
pub(crate) struct ElectionConfig {
    pub my_node_id: NodeId,
    pub leader_heartbeat_duration: Duration,
    pub follower_min_timeout: Duration,
    pub follower_max_timeout: Duration,
}

pub(crate) enum CurrentLeader {
    Me,
    Other(LeaderRedirectInfo),
    Unknown,
}

/// ElectionState holds what's specific to our role: votes while campaigning, the known leader while
/// following, per-peer progress while leading, and the timers of each. It decides nothing about
/// terms or logs; the replica validates those before asking for a transition.
///
/// Each transition drops the previous role's timers, which stops their tasks.
pub(crate) struct ElectionState {
    role: RoleState,
    config: ElectionConfig,
    actor_client: WeakActorClient,
    notifier: ElectionStateChangeNotifier,
}

enum RoleState {
    Leader(LeaderStateTracker),
    Candidate {
        votes: HashSet<NodeId>,
        election_timer: ElectionTimerHandle,
    },
    Follower {
        leader: Option<LeaderRedirectInfo>,
        election_timer: ElectionTimerHandle,
    },
}

impl ElectionState {
    pub(crate) fn new_follower(
        config: ElectionConfig,
        actor_client: WeakActorClient,
    ) -> (Self, ElectionStateChangeListener) {
        let (notifier, listener) = state_change_listener::new(ElectionStateSnapshot::FollowerNoLeader);
        let election_timer = spawn_election_timer(&config, &actor_client);

        let election_state = ElectionState {
            role: RoleState::Follower {
                leader: None,
                election_timer,
            },
            config,
            actor_client,
            notifier,
        };

        (election_state, listener)
    }

    pub(crate) fn transition_to_follower(&mut self, leader: Option<LeaderRedirectInfo>) {
        let election_timer = spawn_election_timer(&self.config, &self.actor_client);
        self.set_role(RoleState::Follower { leader, election_timer });
    }

    /// Returns how many votes we hold, which is just our own.
    pub(crate) fn transition_to_candidate_and_vote_for_self(&mut self) -> usize {
        let election_timer = spawn_election_timer(&self.config, &self.actor_client);
        let mut votes = HashSet::new();
        votes.insert(self.config.my_node_id);

        self.set_role(RoleState::Candidate { votes, election_timer });
        1
    }

    pub(crate) fn transition_to_leader(
        &mut self,
        term: Term,
        peer_ids: HashSet<NodeId>,
        previous_log_entry_index: Option<Index>,
    ) {
        let peer_state: HashMap<NodeId, PeerState> = peer_ids
            .into_iter()
            .map(|peer_id| {
                // Fires right away, so each peer hears from the new leader without waiting a beat.
                let heartbeat_timer = HeartbeatTimerHandle::spawn_timer_task(
                    self.config.leader_heartbeat_duration,
                    self.actor_client.clone(),
                    peer_id,
                    term,
                );
                (peer_id, PeerState::new(heartbeat_timer, previous_log_entry_index))
            })
            .collect();

        self.set_role(RoleState::Leader(LeaderStateTracker::new(peer_state)));
    }

    fn set_role(&mut self, role: RoleState) {
        self.role = role;
        self.notifier.notify_new_state(self.snapshot());
    }

    fn snapshot(&self) -> ElectionStateSnapshot {
        match &self.role {
            RoleState::Leader(_) => ElectionStateSnapshot::Leader,
            RoleState::Candidate { .. } => ElectionStateSnapshot::Candidate,
            RoleState::Follower { leader: Some(leader), .. } => ElectionStateSnapshot::Follower(leader.clone()),
            RoleState::Follower { leader: None, .. } => ElectionStateSnapshot::FollowerNoLeader,
        }
    }

    pub(crate) fn role(&self) -> Role {
        match &self.role {
            RoleState::Leader(_) => Role::Leader,
            RoleState::Candidate { .. } => Role::Candidate,
            RoleState::Follower { .. } => Role::Follower,
        }
    }

    pub(crate) fn current_leader(&self) -> CurrentLeader {
        match &self.role {
            RoleState::Leader(_) => CurrentLeader::Me,
            RoleState::Follower { leader: Some(leader), .. } => CurrentLeader::Other(leader.clone()),
            RoleState::Follower { leader: None, .. } | RoleState::Candidate { .. } => CurrentLeader::Unknown,
        }
    }

    pub(crate) fn leader_id(&self) -> Option<NodeId> {
        match self.current_leader() {
            CurrentLeader::Me => Some(self.config.my_node_id),
            CurrentLeader::Other(leader) => Some(leader.node_id),
            CurrentLeader::Unknown => None,
        }
    }

    pub(crate) fn reset_timeout_if_follower(&self) {
        if let RoleState::Follower { election_timer, .. } = &self.role {
            election_timer.reset_timeout();
        }
    }

    /// A timeout event can be queued just before a reset lands, so the driver asks this before
    /// acting on one.
    pub(crate) fn election_timer_expired(&self) -> bool {
        match &self.role {
            RoleState::Leader(_) => false,
            RoleState::Candidate { election_timer, .. } | RoleState::Follower { election_timer, .. } => {
                election_timer.has_expired()
            }
        }
    }

    pub(crate) fn set_leader_if_unknown(&mut self, new_leader: &LeaderRedirectInfo) {
        if let RoleState::Follower { leader: leader @ None, .. } = &mut self.role {
            *leader = Some(new_leader.clone());
            self.notifier.notify_new_state(self.snapshot());
        }
    }

    /// Number of distinct votes after counting this one, or None if we've stopped campaigning.
    pub(crate) fn add_vote_if_candidate(&mut self, vote_from: NodeId) -> Option<usize> {
        match &mut self.role {
            RoleState::Candidate { votes, .. } => {
                votes.insert(vote_from);
                Some(votes.len())
            }
            _ => None,
        }
    }

    pub(crate) fn leader_state_mut(&mut self) -> Option<&mut LeaderStateTracker> {
        match &mut self.role {
            RoleState::Leader(tracker) => Some(tracker),
            _ => None,
        }
    }
}

fn spawn_election_timer(config: &ElectionConfig, actor_client: &WeakActorClient) -> ElectionTimerHandle {
    ElectionTimerHandle::spawn_timer_task(
        config.follower_min_timeout,
        config.follower_max_timeout,
        actor_client.clone(),
    )
}

impl fmt::Debug for ElectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.role {
            RoleState::Leader(_) => write!(f, "Leader"),
            RoleState::Candidate { votes, .. } => write!(f, "Candidate(votes={})", votes.len()),
            RoleState::Follower { leader: Some(leader), .. } => write!(f, "Follower(leader={:?})", leader.node_id),
            RoleState::Follower { leader: None, .. } => write!(f, "Follower(leader=None)"),
        }
    }
}
