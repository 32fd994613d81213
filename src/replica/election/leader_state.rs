use crate::commitlog::Index;
use crate::replica::election::timers::HeartbeatTimerHandle;
use crate::replica::NodeId;
use std::collections::HashMap;

pub(crate) struct LeaderStateTracker {
    peer_state: HashMap<NodeId, PeerState>,
}

impl LeaderStateTracker {
    pub(super) fn new(peer_state: HashMap<NodeId, PeerState>) -> Self {
        LeaderStateTracker { peer_state }
    }

    pub(crate) fn peer_state_mut(&mut self, peer_id: &NodeId) -> Option<&mut PeerState> {
        self.peer_state.get_mut(peer_id)
    }

    pub(crate) fn peers_iter(&self) -> impl Iterator<Item = &PeerState> {
        self.peer_state.values()
    }
}

pub(crate) struct PeerState {
    // Held to send heartbeats for this peer
    heartbeat_timer: HeartbeatTimerHandle,
    progress: PeerProgress,
}

/// Replication bookkeeping for a single peer. Split out from the timer so it can be driven
/// directly in unit tests.
#[derive(Debug)]
struct PeerProgress {
    // > index of the next log entry to send to that server
    // > (initialized to leader last log index + 1)
    next: Index,
    // > index of highest log entry known to be replicated on server
    // > (initialized to 0, increases monotonically)
    matched: Option<Index>,

    // SeqNo is a form of a logical clock that tracks a term leader's interactions with a peer. When
    // a node becomes leader, it initializes last sent/received to 0. Each time leader sends a
    // request, it increments the last sent SeqNo and ensures the response will be associated with
    // that SeqNo. If a leader receives a SeqNo from earlier than a previously received SeqNo, it
    // discards it.
    last_sent_seq_no: u64,
    last_received_seq_no: u64,
}

impl PeerState {
    pub(super) fn new(heartbeat_timer: HeartbeatTimerHandle, previous_log_entry_index: Option<Index>) -> Self {
        PeerState {
            heartbeat_timer,
            progress: PeerProgress::new(previous_log_entry_index),
        }
    }

    pub(crate) fn next_and_previous_log_index(&self) -> (Index, Option<Index>) {
        self.progress.next_and_previous_log_index()
    }

    pub(crate) fn matched(&self) -> Option<Index> {
        self.progress.matched
    }

    pub(crate) fn handle_append_entries_result(
        &mut self,
        logger: &slog::Logger,
        received_seq_no: u64,
        update: PeerStateUpdate,
    ) {
        self.progress.handle_append_entries_result(logger, received_seq_no, update)
    }

    /// At most one AppendEntries may be in flight per peer.
    pub(crate) fn has_outstanding_request(&self) -> bool {
        self.progress.has_outstanding_request()
    }

    pub(crate) fn next_seq_no(&mut self) -> u64 {
        self.progress.next_seq_no()
    }

    pub(crate) fn reset_heartbeat_timer(&self) {
        self.heartbeat_timer.reset_heartbeat_timer();
    }
}

impl PeerProgress {
    fn new(previous_log_entry_index: Option<Index>) -> Self {
        PeerProgress {
            next: previous_log_entry_index
                .map(|i| i.plus(1))
                .unwrap_or_else(Index::start_index),
            matched: None,
            last_sent_seq_no: 0,
            last_received_seq_no: 0,
        }
    }

    fn next_and_previous_log_index(&self) -> (Index, Option<Index>) {
        (self.next, self.next.checked_minus(1))
    }

    fn handle_append_entries_result(&mut self, logger: &slog::Logger, received_seq_no: u64, update: PeerStateUpdate) {
        if !self.ratchet_fwd_received_seq_no(received_seq_no) {
            slog::warn!(
                logger,
                "Dropping out of date seq-no({:?}): {:?}",
                received_seq_no,
                update
            );
            return;
        }

        match update {
            PeerStateUpdate::OtherError => { /* No action */ }
            PeerStateUpdate::Success {
                previous_log_entry,
                num_entries_replicated,
            } => {
                self.update_log(previous_log_entry, num_entries_replicated);
            }
            PeerStateUpdate::PeerLogBehind { last_log_index } => {
                self.rewind_log(logger, last_log_index);
            }
        }
    }

    fn update_log(&mut self, previous_log_entry: Option<Index>, num_entries_replicated: usize) {
        let new_matched = match (previous_log_entry, num_entries_replicated) {
            (None, 0) => return,
            (Some(prev), 0) => {
                // Heartbeat. The peer's log agrees with ours up to `prev`.
                if self.matched.map_or(true, |m| prev > m) {
                    self.matched.replace(prev);
                }
                return;
            }
            (None, n) => Index::new_usize(n),
            (Some(prev), n) => prev.plus(n as u64),
        };
        let new_next = new_matched.plus(1);

        // Panic here, because it means as leader, we either sent something wrong or are tracking state wrong.
        assert!(
            new_next > self.next,
            "Next can only ratchet forward. CurrentNext={:?}, NewNext={:?}",
            self.next,
            new_next
        );
        if let Some(matched) = self.matched {
            assert!(
                new_matched > matched,
                "Matched can only ratchet forward. CurrentMatched={:?}, NewMatched={:?}",
                matched,
                new_matched
            )
        }

        self.next = new_next;
        self.matched.replace(new_matched);
    }

    /// Moves `next` backwards after the peer rejected our previous entry. When the peer tells us
    /// its last index we can skip straight past the gap instead of stepping one entry at a time.
    /// Never rewinds at or below `matched`.
    fn rewind_log(&mut self, logger: &slog::Logger, peer_last_log_index: Option<Index>) {
        let one_back = match self.next.checked_minus(1) {
            Some(i) => i,
            None => {
                slog::warn!(logger, "Can't rewind peer log, already at beginning of log.");
                return;
            }
        };

        // Don't panic in here, because peer could return garbage data.
        let hinted = match peer_last_log_index {
            Some(peer_last) => match peer_last.as_u64().checked_add(1) {
                Some(after_peer_last) => std::cmp::min(one_back, Index::new(after_peer_last)),
                None => one_back,
            },
            None => Index::start_index(),
        };
        let floor = self
            .matched
            .map(|m| m.plus(1))
            .unwrap_or_else(Index::start_index);
        let new_next = std::cmp::max(hinted, floor);

        if new_next >= self.next {
            slog::warn!(
                logger,
                "Peer rejected entries at or below its matched index. Not mutating state. Next={:?}, Matched={:?}",
                self.next,
                self.matched
            );
            return;
        }

        self.next = new_next;
    }

    fn has_outstanding_request(&self) -> bool {
        self.last_received_seq_no < self.last_sent_seq_no
    }

    fn next_seq_no(&mut self) -> u64 {
        self.last_sent_seq_no += 1;
        self.last_sent_seq_no
    }

    /// returns true if the state was mutated.
    fn ratchet_fwd_received_seq_no(&mut self, received_seq_no: u64) -> bool {
        if self.last_received_seq_no < received_seq_no && received_seq_no <= self.last_sent_seq_no {
            self.last_received_seq_no = received_seq_no;
            true
        } else {
            false
        }
    }
}

#[derive(Debug)]
pub(crate) enum PeerStateUpdate {
    Success {
        previous_log_entry: Option<Index>,
        num_entries_replicated: usize,
    },
    PeerLogBehind {
        last_log_index: Option<Index>,
    },
    OtherError,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn idx(i: u64) -> Index {
        Index::new(i)
    }

    #[test]
    fn starts_after_leader_last_entry() {
        let progress = PeerProgress::new(Some(idx(7)));
        assert_eq!(progress.next_and_previous_log_index(), (idx(8), Some(idx(7))));
        assert_eq!(progress.matched, None);

        let progress = PeerProgress::new(None);
        assert_eq!(progress.next_and_previous_log_index(), (idx(1), None));
    }

    #[test]
    fn one_outstanding_request_at_a_time() {
        let logger = logger();
        let mut progress = PeerProgress::new(None);
        assert!(!progress.has_outstanding_request());

        let seq_no = progress.next_seq_no();
        assert!(progress.has_outstanding_request());

        progress.handle_append_entries_result(&logger, seq_no, PeerStateUpdate::OtherError);
        assert!(!progress.has_outstanding_request());
    }

    #[test]
    fn success_advances_next_and_matched() {
        let logger = logger();
        let mut progress = PeerProgress::new(Some(idx(2)));

        let seq_no = progress.next_seq_no();
        progress.handle_append_entries_result(
            &logger,
            seq_no,
            PeerStateUpdate::Success {
                previous_log_entry: Some(idx(2)),
                num_entries_replicated: 3,
            },
        );

        assert_eq!(progress.next, idx(6));
        assert_eq!(progress.matched, Some(idx(5)));
    }

    #[test]
    fn heartbeat_success_sets_matched_to_previous() {
        let logger = logger();
        let mut progress = PeerProgress::new(Some(idx(4)));

        let seq_no = progress.next_seq_no();
        progress.handle_append_entries_result(
            &logger,
            seq_no,
            PeerStateUpdate::Success {
                previous_log_entry: Some(idx(4)),
                num_entries_replicated: 0,
            },
        );

        assert_eq!(progress.next, idx(5));
        assert_eq!(progress.matched, Some(idx(4)));
    }

    #[test]
    fn stale_seq_no_is_dropped() {
        let logger = logger();
        let mut progress = PeerProgress::new(Some(idx(2)));

        let first = progress.next_seq_no();
        progress.handle_append_entries_result(&logger, first, PeerStateUpdate::OtherError);

        // Duplicate delivery of the same reply.
        progress.handle_append_entries_result(
            &logger,
            first,
            PeerStateUpdate::Success {
                previous_log_entry: Some(idx(2)),
                num_entries_replicated: 1,
            },
        );
        assert_eq!(progress.matched, None);

        // Reply to a request that was never sent.
        progress.handle_append_entries_result(&logger, 99, PeerStateUpdate::OtherError);
        assert_eq!(progress.last_received_seq_no, first);
    }

    #[test]
    fn rewind_uses_peer_last_index_hint() {
        let logger = logger();
        let mut progress = PeerProgress::new(Some(idx(10)));

        let seq_no = progress.next_seq_no();
        progress.handle_append_entries_result(
            &logger,
            seq_no,
            PeerStateUpdate::PeerLogBehind {
                last_log_index: Some(idx(3)),
            },
        );
        assert_eq!(progress.next, idx(4));

        // Hint beyond our position only steps back by one.
        let seq_no = progress.next_seq_no();
        progress.handle_append_entries_result(
            &logger,
            seq_no,
            PeerStateUpdate::PeerLogBehind {
                last_log_index: Some(idx(9)),
            },
        );
        assert_eq!(progress.next, idx(3));
    }

    #[test]
    fn rewind_ignores_hint_at_end_of_index_space() {
        let logger = logger();
        let mut progress = PeerProgress::new(Some(idx(10)));

        let seq_no = progress.next_seq_no();
        progress.handle_append_entries_result(
            &logger,
            seq_no,
            PeerStateUpdate::PeerLogBehind {
                last_log_index: Some(idx(u64::MAX)),
            },
        );
        assert_eq!(progress.next, idx(10));
    }

    #[test]
    fn rewind_on_empty_peer_log_goes_to_start() {
        let logger = logger();
        let mut progress = PeerProgress::new(Some(idx(10)));

        let seq_no = progress.next_seq_no();
        progress.handle_append_entries_result(&logger, seq_no, PeerStateUpdate::PeerLogBehind { last_log_index: None });
        assert_eq!(progress.next, idx(1));

        let seq_no = progress.next_seq_no();
        progress.handle_append_entries_result(&logger, seq_no, PeerStateUpdate::PeerLogBehind { last_log_index: None });
        assert_eq!(progress.next, idx(1));
    }

    #[test]
    fn rewind_never_goes_below_matched() {
        let logger = logger();
        let mut progress = PeerProgress::new(Some(idx(5)));

        let seq_no = progress.next_seq_no();
        progress.handle_append_entries_result(
            &logger,
            seq_no,
            PeerStateUpdate::Success {
                previous_log_entry: Some(idx(5)),
                num_entries_replicated: 0,
            },
        );
        assert_eq!(progress.matched, Some(idx(5)));

        let seq_no = progress.next_seq_no();
        progress.handle_append_entries_result(&logger, seq_no, PeerStateUpdate::PeerLogBehind { last_log_index: None });
        assert_eq!(progress.next, idx(6));
    }
}
