use crate::replica::ElectionStateChangeListener;
use crate::replica::ElectionStateSnapshot;
use crate::replica::LeaderRedirectInfo;

/// Something this node observed about itself.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum NodeEvent {
    /// The node's role or known leader changed. Only the latest change is kept: a slow reader
    /// skips straight to the newest state instead of seeing every step.
    Election(ElectionEvent),
}

/// Where this node stands in the current term.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ElectionEvent {
    Leader,
    Candidate,
    Follower(LeaderRedirectInfo),
    FollowerNoLeader,
}

#[derive(Clone)]
pub struct EventListener {
    election_state_change_listener: ElectionStateChangeListener,
}

impl EventListener {
    pub(crate) fn new(election_state_change_listener: ElectionStateChangeListener) -> Self {
        EventListener {
            election_state_change_listener,
        }
    }

    /// Waits for the next change. None means the node has stopped.
    pub async fn next_event(&mut self) -> Option<NodeEvent> {
        self.election_state_change_listener
            .next()
            .await
            .map(|election_state| NodeEvent::Election(ElectionEvent::from(election_state)))
    }

    pub fn current_election_state(&self) -> ElectionEvent {
        ElectionEvent::from(self.election_state_change_listener.current())
    }
}

// ------- Conversions --------

impl From<ElectionStateSnapshot> for ElectionEvent {
    fn from(election_state: ElectionStateSnapshot) -> Self {
        match election_state {
            ElectionStateSnapshot::Leader => ElectionEvent::Leader,
            ElectionStateSnapshot::Candidate => ElectionEvent::Candidate,
            ElectionStateSnapshot::Follower(leader) => ElectionEvent::Follower(leader),
            ElectionStateSnapshot::FollowerNoLeader => ElectionEvent::FollowerNoLeader,
        }
    }
}
