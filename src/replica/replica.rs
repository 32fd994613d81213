use crate::actor::WeakActorClient;
use crate::commitlog::{Index, Log, StorageError};
use crate::replica::election::{CurrentLeader, ElectionState, PeerStateUpdate};
use crate::replica::local_state::{PersistentLocalState, Term};
use crate::replica::peers::{ClusterTracker, NodeId};
use crate::replica::replica_api::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesLogEntry, AppendEntriesOutput, AppendEntriesReplyFromPeer,
    AppendEntriesReplyFromPeerDescriptor, AppendEntriesReplyFromPeerError, EnqueueForReplicationError,
    EnqueueForReplicationInput, EnqueueForReplicationOutput, HeartbeatTick, LeaderRedirectInfo, LogEntry,
    ReadLogError, ReplicaStatus, RequestVoteError, RequestVoteInput, RequestVoteOutput, RequestVoteReplyFromPeer,
    RequestVoteResult, Role, TermOutOfDateInfo,
};
use crate::replica::write_ahead_log::{WriteAheadLog, WriteAheadLogEntry};
use crate::server::RpcServerShutdownHandle;
use crate::transport::PeerTransport;
use bytes::Bytes;
use std::sync::Arc;
use std::{cmp, io};
use tokio::time::Duration;

pub(crate) struct ReplicaConfig<L>
where
    L: Log<WriteAheadLogEntry>,
{
    pub(crate) logger: slog::Logger,
    pub(crate) cluster_tracker: ClusterTracker,
    pub(crate) local_state: Box<dyn PersistentLocalState>,
    pub(crate) election_state: ElectionState,
    pub(crate) write_ahead_log: WriteAheadLog<L>,
    pub(crate) transport: Arc<dyn PeerTransport>,
    pub(crate) actor_client: WeakActorClient,
    // Bound on every outbound RPC.
    pub(crate) rpc_timeout: Duration,
    // How long a candidate waits before asking an unreachable peer for its vote again.
    pub(crate) request_vote_retry_backoff: Duration,
    pub(crate) max_entries_per_append: usize,
    // Dropped along with the replica, which stops the RPC server.
    pub(crate) server_shutdown_handle: Option<RpcServerShutdownHandle>,
}

/// Replica is the Raft state of a single node. It's only ever touched by the actor's event loop,
/// so none of its handlers are async; anything that waits (RPCs to peers) is spawned and comes
/// back later as an event.
pub(crate) struct Replica<L>
where
    L: Log<WriteAheadLogEntry>,
{
    logger: slog::Logger,
    my_node_id: NodeId,
    cluster_tracker: ClusterTracker,
    local_state: Box<dyn PersistentLocalState>,
    election_state: ElectionState,
    write_ahead_log: WriteAheadLog<L>,
    transport: Arc<dyn PeerTransport>,
    actor_client: WeakActorClient,
    rpc_timeout: Duration,
    request_vote_retry_backoff: Duration,
    max_entries_per_append: usize,
    // Set when local state can no longer be trusted. The actor stops once it's set.
    fatal_error: Option<StorageError>,
    _server_shutdown_handle: Option<RpcServerShutdownHandle>,
}

impl<L> Replica<L>
where
    L: Log<WriteAheadLogEntry> + 'static,
{
    pub(crate) fn new(config: ReplicaConfig<L>) -> Self {
        assert!(config.max_entries_per_append > 0, "max_entries_per_append must be positive");

        Replica {
            logger: config.logger,
            my_node_id: config.cluster_tracker.my_node_id(),
            cluster_tracker: config.cluster_tracker,
            local_state: config.local_state,
            election_state: config.election_state,
            write_ahead_log: config.write_ahead_log,
            transport: config.transport,
            actor_client: config.actor_client,
            rpc_timeout: config.rpc_timeout,
            request_vote_retry_backoff: config.request_vote_retry_backoff,
            max_entries_per_append: config.max_entries_per_append,
            fatal_error: None,
            _server_shutdown_handle: config.server_shutdown_handle,
        }
    }

    /// The error that made this replica unable to continue, if any.
    pub(crate) fn take_fatal_error(&mut self) -> Option<StorageError> {
        self.fatal_error.take()
    }

    pub(crate) fn handle_enqueue_for_replication(
        &mut self,
        input: EnqueueForReplicationInput,
    ) -> Result<EnqueueForReplicationOutput, EnqueueForReplicationError> {
        // Leader check
        match self.election_state.current_leader() {
            CurrentLeader::Me => { /* carry on */ }
            CurrentLeader::Other(leader) => return Err(EnqueueForReplicationError::LeaderRedirect(leader)),
            CurrentLeader::Unknown => return Err(EnqueueForReplicationError::NoLeader),
        }

        // > If command received from client: append entry to local log,
        // > respond after entry applied to state machine (§5.3)
        let term = self.local_state.current_term();
        let appended_index = self
            .append_and_sync(WriteAheadLogEntry {
                term,
                data: input.data.to_vec(),
            })
            .map_err(EnqueueForReplicationError::LocalStorageError)?;

        let peer_ids = self.cluster_tracker.peer_ids();
        if peer_ids.is_empty() {
            // We're the whole cluster; the entry is on a majority already.
            self.advance_commit_index(appended_index, term);
        }
        for peer_id in peer_ids {
            self.send_append_entries(peer_id, term);
        }

        Ok(EnqueueForReplicationOutput {
            enqueued_term: term,
            enqueued_index: appended_index,
        })
    }

    pub(crate) fn server_handle_request_vote(
        &mut self,
        input: RequestVoteInput,
    ) -> Result<RequestVoteOutput, RequestVoteError> {
        // Ensure candidate is known member.
        if !self.cluster_tracker.contains_member(&input.candidate_id) {
            return Err(RequestVoteError::CandidateNotInCluster);
        }

        // 1. Reply false if term < currentTerm (§5.1)
        let current_term = self.local_state.current_term();
        if input.candidate_term < current_term {
            slog::info!(self.logger, "Not granting vote. Client term is out of date.");
            return Err(RequestVoteError::RequestTermOutOfDate(TermOutOfDateInfo { current_term }));
        }

        // > If RPC request or response contains term T > currentTerm:
        // > set currentTerm = T, convert to follower (§5.1)
        let increased = self
            .local_state
            .store_term_if_increased(input.candidate_term)
            .map_err(RequestVoteError::ServerStorageError)?;
        if increased {
            self.election_state.transition_to_follower(None);
            slog::info!(
                self.logger,
                "Observed increased term in RequestVote call. Transitioning to follower. Election state: {:?}",
                self.election_state
            );
        }

        // 2. If votedFor is null or candidateId, and candidate’s log is at
        // least as up-to-date as receiver’s log, grant vote (§5.2, §5.4).
        let (_, opt_voted_for) = self.local_state.voted_for_current_term();
        let already_voted_for_candidate = match opt_voted_for {
            None => false,
            Some(voted_for) if voted_for == input.candidate_id => true,
            Some(voted_for) => {
                slog::info!(self.logger, "Not granting vote. We already voted for {:?}.", voted_for);
                return Ok(RequestVoteOutput { vote_granted: false });
            }
        };

        if !self.is_candidate_log_gte_mine(input.candidate_last_log_entry) {
            slog::info!(self.logger, "Not granting vote. Candidate log is out of date.");
            return Ok(RequestVoteOutput { vote_granted: false });
        }

        if !already_voted_for_candidate {
            let cas_success = self
                .local_state
                .store_vote_for_term_if_unvoted(input.candidate_term, input.candidate_id)
                .map_err(RequestVoteError::ServerStorageError)?;
            if !cas_success {
                slog::warn!(self.logger, "Not granting vote. Vote record changed underneath us.");
                return Ok(RequestVoteOutput { vote_granted: false });
            }
        }

        // A granted vote counts as hearing from a viable leader-to-be.
        self.election_state.reset_timeout_if_follower();
        slog::info!(self.logger, "Voting for {:?} in term {:?}.", input.candidate_id, input.candidate_term);

        Ok(RequestVoteOutput { vote_granted: true })
    }

    fn is_candidate_log_gte_mine(&self, candidate_last_entry: Option<(Term, Index)>) -> bool {
        // > Raft determines which of two logs is more up-to-date
        // > by comparing the index and term of the last entries in the
        // > logs. If the logs have last entries with different terms, then
        // > the log with the later term is more up-to-date. If the logs
        // > end with the same term, then whichever log is longer is
        // > more up-to-date.
        match (self.write_ahead_log.latest_entry(), candidate_last_entry) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(mine), Some(candidate)) => candidate >= mine,
        }
    }

    pub(crate) fn handle_request_vote_reply_from_peer(&mut self, reply: RequestVoteReplyFromPeer) {
        let logger = self.logger.new(slog::o!("Peer" => reply.peer_id.as_u64()));

        if let RequestVoteResult::StaleTerm { new_term } = &reply.result {
            slog::info!(logger, "Peer says our term {:?} is stale, it's at {:?}", reply.term, new_term);
            self.step_down_if_term_increased(*new_term, None);
            return;
        }

        let current_term = self.local_state.current_term();
        if current_term != reply.term {
            slog::info!(
                logger,
                "Received vote for outdated term {:?}, current term: {:?}.",
                reply.term,
                current_term,
            );
            return;
        }

        match reply.result {
            RequestVoteResult::VoteGranted => {
                let num_votes_received = match self.election_state.add_vote_if_candidate(reply.peer_id) {
                    Some(v) => v,
                    None => {
                        slog::debug!(
                            logger,
                            "Received vote for term {:?} after transitioning to election state: {:?}",
                            reply.term,
                            self.election_state,
                        );
                        return;
                    }
                };

                let num_voting_replicas = self.cluster_tracker.num_voting_replicas();
                slog::info!(
                    logger,
                    "Received {}/{} votes for term {:?}",
                    num_votes_received,
                    num_voting_replicas,
                    reply.term,
                );

                if num_votes_received >= Self::get_majority_vote_count(num_voting_replicas) {
                    self.transition_to_leader(reply.term);
                }
            }
            RequestVoteResult::VoteNotGranted => {
                slog::info!(logger, "Vote not granted for term {:?}", reply.term);
            }
            RequestVoteResult::RetryableFailure(reason) => {
                if self.election_state.role() == Role::Candidate {
                    slog::debug!(logger, "RequestVote failed, retrying: {}", reason);
                    self.spawn_request_vote(reply.peer_id, reply.term, Some(self.request_vote_retry_backoff));
                }
            }
            RequestVoteResult::StaleTerm { .. } => { /* Handled above */ }
        }
    }

    fn get_majority_vote_count(num_voting_replicas: usize) -> usize {
        (num_voting_replicas / 2) + 1
    }

    fn transition_to_leader(&mut self, term: Term) {
        let latest_index = self.write_ahead_log.latest_entry().map(|(_, index)| index);
        let peer_ids = self.cluster_tracker.peer_ids();
        let single_node = peer_ids.is_empty();

        // Each peer's heartbeat timer fires right away, which announces us.
        self.election_state.transition_to_leader(term, peer_ids, latest_index);
        slog::info!(self.logger, "Won election for term {:?}. Election state: {:?}", term, self.election_state);

        if single_node {
            if let Some(index) = latest_index {
                self.advance_commit_index(index, term);
            }
        }
    }

    pub(crate) fn handle_election_timeout(&mut self) {
        // The timer may have queued this just before something reset it.
        if !self.election_state.election_timer_expired() {
            slog::debug!(self.logger, "Ignoring election timeout, deadline was pushed back.");
            return;
        }

        // Write-ahead log style: Vote for self on local state before transitioning to candidate.
        let new_term = match self.local_state.increment_term_and_vote_for_self() {
            Ok(term) => term,
            Err(e) => {
                // The timer fires again; we try again then.
                slog::error!(self.logger, "Failed to persist new term, not starting election: {}", e);
                return;
            }
        };
        let num_votes = self.election_state.transition_to_candidate_and_vote_for_self();
        slog::info!(
            self.logger,
            "Election timeout. Started election for term {:?}. Election state: {:?}",
            new_term,
            self.election_state,
        );

        if num_votes >= Self::get_majority_vote_count(self.cluster_tracker.num_voting_replicas()) {
            self.transition_to_leader(new_term);
            return;
        }

        for peer_id in self.cluster_tracker.peer_ids() {
            self.spawn_request_vote(peer_id, new_term, None);
        }
    }

    fn spawn_request_vote(&self, peer_id: NodeId, term: Term, delay: Option<Duration>) {
        let input = RequestVoteInput {
            candidate_term: term,
            candidate_id: self.my_node_id,
            candidate_last_log_entry: self.write_ahead_log.latest_entry(),
        };
        let transport = self.transport.clone();
        let actor_client = self.actor_client.clone();
        let rpc_timeout = self.rpc_timeout;

        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let result = match tokio::time::timeout(rpc_timeout, transport.request_vote(peer_id, input)).await {
                Ok(Ok(result)) => result,
                Ok(Err(e)) => RequestVoteResult::RetryableFailure(e.to_string()),
                Err(_timeout) => RequestVoteResult::RetryableFailure("Timed out calling RequestVote".into()),
            };

            // Err means the node is shutting down.
            let _ = actor_client
                .notify_request_vote_reply_from_peer(RequestVoteReplyFromPeer { peer_id, term, result })
                .await;
        });
    }

    pub(crate) fn server_handle_append_entries(
        &mut self,
        input: AppendEntriesInput,
    ) -> Result<AppendEntriesOutput, AppendEntriesError> {
        // Ensure leader is known member.
        if !self.cluster_tracker.contains_member(&input.leader_id) {
            return Err(AppendEntriesError::ClientNotInCluster);
        }

        // 1. Reply false if term < currentTerm (§5.1)
        let current_term = self.local_state.current_term();
        if input.leader_term < current_term {
            return Err(AppendEntriesError::ClientTermOutOfDate(TermOutOfDateInfo { current_term }));
        }

        // > If RPC request or response contains term T > currentTerm:
        // > set currentTerm = T, convert to follower (§5.1)
        let leader = self.leader_redirect_info(input.leader_id);
        let increased = self
            .local_state
            .store_term_if_increased(input.leader_term)
            .map_err(AppendEntriesError::ServerStorageError)?;
        if increased {
            self.election_state.transition_to_follower(Some(leader));
        } else {
            match self.election_state.role() {
                Role::Follower => self.election_state.set_leader_if_unknown(&leader),
                // > If AppendEntries RPC received from new leader: convert to follower
                Role::Candidate => self.election_state.transition_to_follower(Some(leader)),
                Role::Leader => {
                    slog::error!(
                        self.logger,
                        "Two leaders in term {:?}: us and {:?}. Stepping down.",
                        current_term,
                        input.leader_id
                    );
                    self.election_state.transition_to_follower(Some(leader));
                }
            }
        }

        self.election_state.reset_timeout_if_follower();

        // 2. Reply false if [my] log doesn't contain an entry at [leader's]
        // prevLogIndex whose term matches [leader's] prevLogTerm (§5.3)
        if let Some((leader_prev_entry_term, leader_prev_entry_index)) = input.leader_previous_log_entry {
            let my_previous_entry = self
                .write_ahead_log
                .read(leader_prev_entry_index)
                .map_err(|e| AppendEntriesError::ServerStorageError(e.into()))?;
            if !matches!(my_previous_entry, Some(entry) if entry.term == leader_prev_entry_term) {
                return Err(AppendEntriesError::ServerMissingPreviousLogEntry {
                    last_log_index: self.write_ahead_log.latest_entry().map(|(_, index)| index),
                });
            }
        }

        // 3. If [my] existing entry conflicts with [leader's new entries]
        // (same index but different terms), delete [my] existing entry and
        // all that follow it (§5.3)
        // 4. Append any new entries not already in the log
        let num_new_entries = input.new_entries.len();
        let mut next_entry_index = match input.leader_previous_log_entry {
            None => Index::start_index(),
            Some((_, leader_prev_entry_index)) => leader_prev_entry_index.plus(1),
        };
        let mut appended_any = false;
        let leader_term = input.leader_term;
        for new_entry in input.new_entries {
            // The RPC layer refuses anything else.
            debug_assert!(
                new_entry.term.as_u64() != 0 && new_entry.term <= leader_term,
                "Entry term {:?} outside of leader term {:?}",
                new_entry.term,
                leader_term
            );

            let opt_existing_entry = self
                .write_ahead_log
                .read(next_entry_index)
                .map_err(|e| AppendEntriesError::ServerStorageError(e.into()))?;

            // 3. (if...)
            if let Some(existing_entry) = opt_existing_entry {
                if existing_entry.term == new_entry.term {
                    // 4. (no-op), e.g. a duplicated or re-sent request.
                    next_entry_index = next_entry_index.plus(1);
                    continue;
                }

                // 3. (delete)
                slog::info!(
                    self.logger,
                    "Log conflict at {:?} (mine term {:?}, leader's term {:?}). Truncating.",
                    next_entry_index,
                    existing_entry.term,
                    new_entry.term
                );
                self.write_ahead_log
                    .truncate(next_entry_index)
                    .map_err(|e| AppendEntriesError::ServerStorageError(e.into()))?;
            }

            // 4. (append)
            let appended_index = self
                .write_ahead_log
                .append(WriteAheadLogEntry {
                    term: new_entry.term,
                    data: new_entry.data.to_vec(),
                })
                .map_err(|e| AppendEntriesError::ServerStorageError(e.into()))?;
            assert_eq!(appended_index, next_entry_index, "Appended log entry to unexpected index.");

            appended_any = true;
            next_entry_index = next_entry_index.plus(1);
        }

        // Durable before we say yes.
        if appended_any {
            self.write_ahead_log
                .sync()
                .map_err(|e| AppendEntriesError::ServerStorageError(e.into()))?;
        }

        // 5. If leaderCommit > commitIndex, set commitIndex =
        // min(leaderCommit, index of last new entry)
        let last_index_in_request = match input.leader_previous_log_entry {
            None => Index::from_wire(num_new_entries as u64),
            Some((_, prev_index)) => Some(prev_index.plus(num_new_entries as u64)),
        };
        if let (Some(leader_commit_index), Some(last_index_in_request)) =
            (input.leader_commit_index, last_index_in_request)
        {
            self.write_ahead_log
                .ratchet_fwd_commit_index_if_greater(cmp::min(leader_commit_index, last_index_in_request));
        }

        // > If commitIndex > lastApplied: increment lastApplied, apply
        // > log[lastApplied] to state machine (§5.3)
        self.apply_committed_entries();

        Ok(AppendEntriesOutput {})
    }

    pub(crate) fn handle_append_entries_reply_from_peer(&mut self, reply: AppendEntriesReplyFromPeer) {
        let peer_id = reply.descriptor.peer_id;
        let term = reply.descriptor.term;
        let logger = self
            .logger
            .new(slog::o!("Peer" => peer_id.as_u64(), "SeqNo" => reply.descriptor.seq_no));
        slog::debug!(logger, "AE reply from peer result: {:?}", reply.result);

        // 1. Check for stale term rejection
        if let Err(AppendEntriesReplyFromPeerError::StaleTerm { new_term }) = &reply.result {
            slog::warn!(logger, "Rejected by peer because my term is stale.");
            if self.step_down_if_term_increased(*new_term, None) {
                return;
            }
        }

        if self.local_state.current_term() != term {
            slog::info!(
                logger,
                "Received AE reply for outdated term {:?}, but we're on term {:?}",
                term,
                self.local_state.current_term()
            );
            return;
        }

        let leader_state = match self.election_state.leader_state_mut() {
            Some(leader_state) => leader_state,
            None => {
                slog::info!(logger, "No longer leader");
                return;
            }
        };

        let peer_log_update = match reply.result {
            Err(AppendEntriesReplyFromPeerError::StaleTerm { .. }) => {
                slog::warn!(logger, "This should not happen (unless peer has bug). Treating non-incrementing StaleTerm err as generic failure.");
                PeerStateUpdate::OtherError
            }
            Err(AppendEntriesReplyFromPeerError::PeerMissingPreviousLogEntry { last_log_index }) => {
                slog::info!(logger, "Peer is missing previous log entry. Peer's last index: {:?}", last_log_index);
                PeerStateUpdate::PeerLogBehind { last_log_index }
            }
            Err(AppendEntriesReplyFromPeerError::RetryableFailure(err_msg)) => {
                slog::debug!(logger, "AE failure: {}", err_msg);
                PeerStateUpdate::OtherError
            }
            Ok(_) => PeerStateUpdate::Success {
                previous_log_entry: reply.descriptor.previous_log_entry_index,
                num_entries_replicated: reply.descriptor.num_log_entries,
            },
        };
        // Failures wait for the next heartbeat; otherwise an unreachable peer would spin.
        let made_progress = !matches!(peer_log_update, PeerStateUpdate::OtherError);

        // 2. Update peer log tracker
        let peer_state = match leader_state.peer_state_mut(&peer_id) {
            Some(peer_state) => peer_state,
            None => {
                slog::warn!(logger, "Peer {:?} not found while handling AE reply", peer_id);
                return;
            }
        };
        peer_state.handle_append_entries_result(&logger, reply.descriptor.seq_no, peer_log_update);
        let (next_index, _) = peer_state.next_and_previous_log_index();

        // 3. Check for majority replication and apply new commits.
        // > If there exists an N such that N > commitIndex, a majority
        // > of matchIndex[i] ≥ N, and log[N].term == currentTerm:
        // > set commitIndex = N (§5.3, §5.4).
        // See also:
        // > Figure 8: A time sequence showing why a leader cannot determine
        // > commitment using log entries from older terms.
        let peers_matched_index: Vec<_> = leader_state.peers_iter().map(|peer_state| peer_state.matched()).collect();
        if let Some(tentative_new_commit_index) = Self::get_cluster_commit_index(peers_matched_index) {
            self.advance_commit_index(tentative_new_commit_index, term);
        }

        // 4. Keep going while the peer is behind.
        // > If last log index ≥ nextIndex for a follower: send
        // > AppendEntries RPC with log entries starting at nextIndex
        let peer_is_behind = matches!(self.write_ahead_log.latest_entry(), Some((_, last)) if last >= next_index);
        if made_progress && peer_is_behind {
            self.send_append_entries(peer_id, term);
        }
    }

    fn get_cluster_commit_index(mut peers_matched_indexes: Vec<Option<Index>>) -> Option<Index> {
        peers_matched_indexes.sort_by_key(|matched| match matched {
            None => 0u64,
            Some(m) => m.as_u64(),
        });

        // Overview of why algo is correct:
        // We are always at the tail of the array, because our log is same/longest.
        // 1. add "me"
        //let cluster_size = peers_matched_indexes.len() + 1;
        // 2. calculate majority
        //let majority = (cluster_size / 2) + 1;
        // 3. subtract "me"
        //let num_peers_to_achieve_majority = majority - 1;
        // 4. take `i`th index from the right
        //let quorum_idx = peers_matched_indexes.len() - num_peers_to_achieve_majority;

        // Or just use this simplified equation which is harder to understand at a glance why it
        // works. When in doubt, just read the unit tests.
        let quorum_idx = peers_matched_indexes.len() / 2;

        peers_matched_indexes.remove(quorum_idx)
    }

    fn advance_commit_index(&mut self, tentative_new_commit_index: Index, term: Term) {
        match self
            .write_ahead_log
            .ratchet_fwd_commit_index_if_valid(tentative_new_commit_index, term)
        {
            Ok(true) => self.apply_committed_entries(),
            Ok(false) => {}
            Err(ioe) => slog::warn!(
                self.logger,
                "IO failure while confirming new commit index {:?}: {:?}",
                tentative_new_commit_index,
                ioe
            ),
        }
    }

    pub(crate) fn handle_heartbeat_tick(&mut self, tick: HeartbeatTick) {
        let current_term = self.local_state.current_term();
        if current_term != tick.term {
            slog::debug!(
                self.logger,
                "Received leader heartbeat for outdated term {:?}, current term: {:?}",
                tick.term,
                current_term
            );
            return;
        }

        self.send_append_entries(tick.peer_id, current_term);
    }

    fn send_append_entries(&mut self, peer_id: NodeId, current_term: Term) {
        match self.try_send_append_entries(peer_id, current_term) {
            Ok(_) => {}
            Err(SendAppendEntriesError::NoLongerLeader) => {
                slog::debug!(self.logger, "Wanted to send AE but no longer leader.")
            }
            Err(SendAppendEntriesError::PeerConcurrencyThrottle) => {
                slog::trace!(self.logger, "AE to peer {:?} already in flight", peer_id)
            }
            Err(SendAppendEntriesError::LeaderStateMissingPeer) => {
                slog::error!(self.logger, "Peer {:?} is missing in LeaderStateTracker.", peer_id)
            }
            Err(SendAppendEntriesError::DiskRead(index, ioe)) => {
                slog::error!(self.logger, "Failed to read log entry at index {:?}: {:?}", index, ioe);
            }
            Err(SendAppendEntriesError::UnexpectedMissingLogEntry(index)) => {
                slog::error!(
                    self.logger,
                    "LeaderStateTracker is tracking index {:?}, but entry is missing from log.",
                    index
                );
            }
        }
    }

    fn try_send_append_entries(&mut self, peer_id: NodeId, current_term: Term) -> Result<(), SendAppendEntriesError> {
        let leader_state = self
            .election_state
            .leader_state_mut()
            .ok_or(SendAppendEntriesError::NoLongerLeader)?;
        let peer_state = leader_state
            .peer_state_mut(&peer_id)
            .ok_or(SendAppendEntriesError::LeaderStateMissingPeer)?;

        // Simplicity vs throughput tradeoff. We're just going to allow 1 outstanding request per
        // peer; no pipelining. Entries are still batched.
        if peer_state.has_outstanding_request() {
            return Err(SendAppendEntriesError::PeerConcurrencyThrottle);
        }

        let (next_index, opt_previous_index) = peer_state.next_and_previous_log_index();
        let previous_log_entry = match opt_previous_index {
            None => None,
            Some(previous_index) => match self.write_ahead_log.read(previous_index) {
                Ok(Some(entry)) => Some((entry.term, previous_index)),
                Ok(None) => return Err(SendAppendEntriesError::UnexpectedMissingLogEntry(previous_index)),
                Err(e) => return Err(SendAppendEntriesError::DiskRead(previous_index, e)),
            },
        };

        let mut new_entries = Vec::new();
        let mut index = next_index;
        while new_entries.len() < self.max_entries_per_append {
            match self.write_ahead_log.read(index) {
                Ok(Some(entry)) => new_entries.push(AppendEntriesLogEntry {
                    term: entry.term,
                    data: Bytes::from(entry.data),
                }),
                Ok(None) => break,
                Err(e) => return Err(SendAppendEntriesError::DiskRead(index, e)),
            }
            index = index.plus(1);
        }

        let seq_no = peer_state.next_seq_no();
        peer_state.reset_heartbeat_timer();

        let descriptor = AppendEntriesReplyFromPeerDescriptor {
            peer_id,
            term: current_term,
            seq_no,
            previous_log_entry_index: opt_previous_index,
            num_log_entries: new_entries.len(),
        };
        let input = AppendEntriesInput {
            leader_term: current_term,
            leader_id: self.my_node_id,
            leader_previous_log_entry: previous_log_entry,
            leader_commit_index: self.write_ahead_log.commit_index(),
            new_entries,
        };

        tokio::spawn(Self::call_peer_append_entries(
            self.transport.clone(),
            self.rpc_timeout,
            self.actor_client.clone(),
            input,
            descriptor,
        ));

        Ok(())
    }

    async fn call_peer_append_entries(
        transport: Arc<dyn PeerTransport>,
        rpc_timeout: Duration,
        callback: WeakActorClient,
        input: AppendEntriesInput,
        descriptor: AppendEntriesReplyFromPeerDescriptor,
    ) {
        let rpc_reply = tokio::time::timeout(rpc_timeout, transport.append_entries(descriptor.peer_id, input)).await;

        let result = match rpc_reply {
            Ok(Ok(reply)) => reply,
            Ok(Err(e)) => Err(AppendEntriesReplyFromPeerError::RetryableFailure(e.to_string())),
            Err(_timeout) => Err(AppendEntriesReplyFromPeerError::RetryableFailure(
                "Timed out calling AppendEntries".into(),
            )),
        };

        let _ = callback
            .notify_append_entries_reply_from_peer(AppendEntriesReplyFromPeer { descriptor, result })
            .await;
    }

    pub(crate) fn status(&self) -> ReplicaStatus {
        ReplicaStatus {
            node_id: self.my_node_id,
            role: self.election_state.role(),
            term: self.local_state.current_term(),
            leader: self.election_state.leader_id(),
            commit_index: self.write_ahead_log.commit_index(),
            last_applied: self.write_ahead_log.last_applied_index(),
            last_log_entry: self.write_ahead_log.latest_entry(),
        }
    }

    pub(crate) fn read_log(&self) -> Result<Vec<LogEntry>, ReadLogError> {
        let last_index = match self.write_ahead_log.latest_entry() {
            None => return Ok(Vec::new()),
            Some((_, last_index)) => last_index,
        };

        let mut entries = Vec::with_capacity(last_index.as_u64() as usize);
        let mut index = Index::start_index();
        while index <= last_index {
            let entry = match self.write_ahead_log.read(index) {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    return Err(ReadLogError::LocalStorageError(StorageError::Io(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("no log entry for index {:?}", index),
                    ))))
                }
                Err(e) => return Err(ReadLogError::LocalStorageError(e.into())),
            };
            entries.push(LogEntry {
                index,
                term: entry.term,
                data: Bytes::from(entry.data),
            });
            index = index.plus(1);
        }

        Ok(entries)
    }

    fn append_and_sync(&mut self, entry: WriteAheadLogEntry) -> Result<Index, StorageError> {
        let index = self.write_ahead_log.append(entry)?;
        self.write_ahead_log.sync()?;
        Ok(index)
    }

    fn apply_committed_entries(&mut self) {
        if self.fatal_error.is_some() {
            return;
        }

        let local_state = &mut self.local_state;
        let result = self
            .write_ahead_log
            .apply_all_committed_entries(|applied| local_state.store_last_applied(applied));
        if let Err(e) = result {
            // Going on would apply entries a restart can't account for.
            slog::crit!(self.logger, "Can't track applied entries durably. Stopping: {}", e);
            self.fatal_error = Some(e);
        }
    }

    /// Returns true if `new_term` was higher than ours and we're now a follower in it.
    fn step_down_if_term_increased(&mut self, new_term: Term, new_leader: Option<LeaderRedirectInfo>) -> bool {
        match self.local_state.store_term_if_increased(new_term) {
            Ok(true) => {
                self.election_state.transition_to_follower(new_leader);
                slog::info!(
                    self.logger,
                    "Observed term {:?}. Transitioned to follower. Election state: {:?}",
                    new_term,
                    self.election_state
                );
                true
            }
            Ok(false) => false,
            Err(e) => {
                slog::error!(self.logger, "Failed to persist term {:?}: {}", new_term, e);
                false
            }
        }
    }

    fn leader_redirect_info(&self, node_id: NodeId) -> LeaderRedirectInfo {
        LeaderRedirectInfo {
            node_id,
            address: self.cluster_tracker.static_address(&node_id).map(str::to_string),
        }
    }
}

enum SendAppendEntriesError {
    NoLongerLeader,
    PeerConcurrencyThrottle,
    LeaderStateMissingPeer,
    DiskRead(Index, io::Error),
    UnexpectedMissingLogEntry(Index),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actor::{ActorClient, Event, ReplicaActor};
    use crate::commitlog::InMemoryLog;
    use crate::config::{ClusterMembership, MemberConfig};
    use crate::replica::election::ElectionConfig;
    use crate::replica::local_state::{LocalStateRecord, RecordStore};
    use crate::replica::write_ahead_log;
    use crate::replica::{NoOpStateMachine, VolatileLocalState};
    use crate::transport::{AppendEntriesReply, TransportError};
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio::sync::mpsc;

    type Repl = Replica<InMemoryLog<WriteAheadLogEntry>>;

    fn opt_index(v: u64) -> Option<Index> {
        Index::from_wire(v)
    }

    #[test]
    fn test_commit_checker_logic() {
        fn run(expected: u64, matches: Vec<u64>) {
            let matches = matches.into_iter().map(opt_index).collect();

            let expected = opt_index(expected);

            assert_eq!(expected, Repl::get_cluster_commit_index(matches));
        }

        // 3-cluster
        run(0, vec![0, 0]);
        run(9, vec![0, 9]);
        run(9, vec![8, 9]);

        // 4-cluster
        run(0, vec![0, 0, 0]);
        run(0, vec![0, 0, 9]);
        run(8, vec![0, 8, 9]);
        run(8, vec![7, 8, 9]);

        // 5-cluster
        run(0, vec![0, 0, 0, 0]);
        run(0, vec![0, 0, 0, 9]);
        run(8, vec![0, 0, 8, 9]);
        run(8, vec![0, 7, 8, 9]);
        run(8, vec![6, 7, 8, 9]);

        // 7-cluster
        run(0, vec![0, 0, 0, 0, 0, 0]);
        run(0, vec![0, 0, 0, 0, 8, 9]);
        run(7, vec![0, 0, 0, 7, 8, 9]);
        run(7, vec![4, 5, 6, 7, 8, 9]);

        // Ordering doesn't matter
        run(9, vec![9, 8]);
        run(8, vec![7, 9, 8]);
        run(8, vec![6, 0, 8, 9]);
    }

    // Peers never answer. These tests drive the handlers directly.
    struct SilentTransport;

    #[async_trait::async_trait]
    impl PeerTransport for SilentTransport {
        async fn request_vote(&self, _: NodeId, _: RequestVoteInput) -> Result<RequestVoteResult, TransportError> {
            std::future::pending().await
        }

        async fn append_entries(&self, _: NodeId, _: AppendEntriesInput) -> Result<AppendEntriesReply, TransportError> {
            std::future::pending().await
        }
    }

    // Must be called from within a runtime; election timers are spawned tasks. Timeouts are long
    // enough that they never fire during a test.
    fn new_replica(my_id: u64) -> (Repl, ActorClient) {
        let (replica, actor_client, _rx) =
            new_replica_with_state(my_id, Box::new(VolatileLocalState::new(NodeId::new(my_id))));
        (replica, actor_client)
    }

    fn new_replica_with_state(
        my_id: u64,
        local_state: Box<dyn PersistentLocalState>,
    ) -> (Repl, ActorClient, mpsc::Receiver<Event>) {
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let membership = ClusterMembership::new(vec![
            MemberConfig::with_address(1, "127.0.0.1", 7001),
            MemberConfig::with_address(2, "127.0.0.1", 7002),
            MemberConfig::without_address(3),
        ]);
        let cluster_tracker = ClusterTracker::new(NodeId::new(my_id), &membership).unwrap();
        let (actor_client, rx) = ActorClient::new(16);

        let (election_state, _listener) = ElectionState::new_follower(
            ElectionConfig {
                my_node_id: NodeId::new(my_id),
                leader_heartbeat_duration: Duration::from_secs(5),
                follower_min_timeout: Duration::from_secs(60),
                follower_max_timeout: Duration::from_secs(120),
            },
            actor_client.weak(),
        );
        let (write_ahead_log, _commit_stream) = write_ahead_log::wired(
            logger.clone(),
            InMemoryLog::create(),
            Box::new(NoOpStateMachine::new()),
            None,
            None,
        )
        .unwrap();

        let replica = Replica::new(ReplicaConfig {
            logger,
            cluster_tracker,
            local_state,
            election_state,
            write_ahead_log,
            transport: Arc::new(SilentTransport),
            actor_client: actor_client.weak(),
            rpc_timeout: Duration::from_millis(100),
            request_vote_retry_backoff: Duration::from_millis(100),
            max_entries_per_append: 64,
            server_shutdown_handle: None,
        });

        (replica, actor_client, rx)
    }

    // Fails every write once `failing` is set.
    struct FlakyRecordStore {
        inner: VolatileLocalState,
        failing: Arc<AtomicBool>,
    }

    impl RecordStore for FlakyRecordStore {
        fn record(&self) -> &LocalStateRecord {
            self.inner.record()
        }

        fn my_node_id(&self) -> NodeId {
            self.inner.my_node_id()
        }

        fn commit(&mut self, new_record: LocalStateRecord) -> Result<(), StorageError> {
            if self.failing.load(Ordering::SeqCst) {
                return Err(StorageError::Io(io::Error::new(io::ErrorKind::Other, "disk full")));
            }
            self.inner.commit(new_record)
        }
    }

    fn vote_request(candidate: u64, term: u64, last_entry: Option<(u64, u64)>) -> RequestVoteInput {
        RequestVoteInput {
            candidate_term: Term::new(term),
            candidate_id: NodeId::new(candidate),
            candidate_last_log_entry: last_entry.map(|(t, i)| (Term::new(t), Index::new(i))),
        }
    }

    fn append_request(
        leader: u64,
        term: u64,
        previous: Option<(u64, u64)>,
        commit: u64,
        entry_terms: &[u64],
    ) -> AppendEntriesInput {
        AppendEntriesInput {
            leader_term: Term::new(term),
            leader_id: NodeId::new(leader),
            leader_previous_log_entry: previous.map(|(t, i)| (Term::new(t), Index::new(i))),
            leader_commit_index: opt_index(commit),
            new_entries: entry_terms
                .iter()
                .map(|t| AppendEntriesLogEntry {
                    term: Term::new(*t),
                    data: Bytes::from(format!("t{}", t)),
                })
                .collect(),
        }
    }

    fn log_terms(replica: &Repl) -> Vec<u64> {
        replica
            .read_log()
            .unwrap()
            .into_iter()
            .map(|entry| entry.term.as_u64())
            .collect()
    }

    fn granted(result: Result<RequestVoteOutput, RequestVoteError>) -> bool {
        result.unwrap().vote_granted
    }

    #[tokio::test]
    async fn grants_one_vote_per_term() {
        let (mut replica, _client) = new_replica(1);

        assert!(granted(replica.server_handle_request_vote(vote_request(2, 1, None))));
        assert!(!granted(replica.server_handle_request_vote(vote_request(3, 1, None))));
        // Retried request from the same candidate.
        assert!(granted(replica.server_handle_request_vote(vote_request(2, 1, None))));
        // New term, new vote.
        assert!(granted(replica.server_handle_request_vote(vote_request(3, 2, None))));

        assert!(matches!(
            replica.server_handle_request_vote(vote_request(2, 1, None)),
            Err(RequestVoteError::RequestTermOutOfDate(_))
        ));
        assert!(matches!(
            replica.server_handle_request_vote(vote_request(9, 5, None)),
            Err(RequestVoteError::CandidateNotInCluster)
        ));
        assert_eq!(replica.status().term, Term::new(2));
    }

    #[tokio::test]
    async fn denies_vote_to_candidate_with_older_log() {
        let (mut replica, _client) = new_replica(1);
        replica
            .server_handle_append_entries(append_request(2, 2, None, 0, &[1, 2]))
            .unwrap();

        // Higher term still moves us forward, but the log check fails.
        assert!(!granted(replica.server_handle_request_vote(vote_request(3, 3, Some((1, 5))))));
        assert_eq!(replica.status().term, Term::new(3));

        // Same last term, shorter log.
        assert!(!granted(replica.server_handle_request_vote(vote_request(3, 4, Some((2, 1))))));
        // Same last term, same length.
        assert!(granted(replica.server_handle_request_vote(vote_request(3, 5, Some((2, 2))))));
    }

    #[tokio::test]
    async fn missing_previous_entry_is_rejected_with_last_index_hint() {
        let (mut replica, _client) = new_replica(1);

        match replica.server_handle_append_entries(append_request(2, 1, Some((1, 3)), 0, &[1])) {
            Err(AppendEntriesError::ServerMissingPreviousLogEntry { last_log_index }) => {
                assert_eq!(last_log_index, None)
            }
            other => panic!("Unexpected: {:?}", other),
        }

        replica
            .server_handle_append_entries(append_request(2, 1, None, 0, &[1, 1]))
            .unwrap();
        match replica.server_handle_append_entries(append_request(2, 1, Some((1, 5)), 0, &[1])) {
            Err(AppendEntriesError::ServerMissingPreviousLogEntry { last_log_index }) => {
                assert_eq!(last_log_index, opt_index(2))
            }
            other => panic!("Unexpected: {:?}", other),
        }
        assert_eq!(log_terms(&replica), vec![1, 1]);
    }

    #[tokio::test]
    async fn conflicting_suffix_is_replaced() {
        let (mut replica, _client) = new_replica(1);
        replica
            .server_handle_append_entries(append_request(2, 1, None, 0, &[1, 1, 1]))
            .unwrap();

        // New leader in term 2 only agrees on the first entry.
        replica
            .server_handle_append_entries(append_request(3, 2, Some((1, 1)), 0, &[2]))
            .unwrap();

        assert_eq!(log_terms(&replica), vec![1, 2]);
        assert_eq!(replica.status().leader, Some(NodeId::new(3)));
    }

    #[tokio::test]
    async fn duplicated_and_reordered_requests_are_idempotent() {
        let (mut replica, _client) = new_replica(1);
        let first = append_request(2, 1, None, 0, &[1, 1]);
        let second = append_request(2, 1, Some((1, 2)), 0, &[1]);

        replica.server_handle_append_entries(first.clone()).unwrap();
        replica.server_handle_append_entries(second.clone()).unwrap();
        // Late duplicates of both.
        replica.server_handle_append_entries(first).unwrap();
        replica.server_handle_append_entries(second).unwrap();

        assert_eq!(log_terms(&replica), vec![1, 1, 1]);
    }

    #[tokio::test]
    async fn follower_commit_is_bounded_by_request_and_never_regresses() {
        let (mut replica, _client) = new_replica(1);
        replica
            .server_handle_append_entries(append_request(2, 1, None, 0, &[1, 1, 1]))
            .unwrap();
        assert_eq!(replica.status().commit_index, None);

        // Heartbeat only vouches for entries up to its previous entry.
        replica
            .server_handle_append_entries(append_request(2, 1, Some((1, 1)), 3, &[]))
            .unwrap();
        assert_eq!(replica.status().commit_index, opt_index(1));

        replica
            .server_handle_append_entries(append_request(2, 1, Some((1, 3)), 3, &[]))
            .unwrap();
        let status = replica.status();
        assert_eq!(status.commit_index, opt_index(3));
        assert_eq!(status.last_applied, opt_index(3));

        // Reordered older heartbeat.
        replica
            .server_handle_append_entries(append_request(2, 1, Some((1, 1)), 1, &[]))
            .unwrap();
        assert_eq!(replica.status().commit_index, opt_index(3));
    }

    #[tokio::test]
    async fn stale_leader_is_rejected() {
        let (mut replica, _client) = new_replica(1);
        replica
            .server_handle_append_entries(append_request(2, 3, None, 0, &[]))
            .unwrap();

        match replica.server_handle_append_entries(append_request(3, 2, None, 0, &[2])) {
            Err(AppendEntriesError::ClientTermOutOfDate(info)) => assert_eq!(info.current_term, Term::new(3)),
            other => panic!("Unexpected: {:?}", other),
        }
        assert!(log_terms(&replica).is_empty());
    }

    #[tokio::test]
    async fn follower_redirects_proposals() {
        let (mut replica, _client) = new_replica(1);
        let propose = || EnqueueForReplicationInput {
            data: Bytes::from_static(b"x"),
        };

        assert!(matches!(
            replica.handle_enqueue_for_replication(propose()),
            Err(EnqueueForReplicationError::NoLeader)
        ));

        replica
            .server_handle_append_entries(append_request(2, 1, None, 0, &[]))
            .unwrap();
        match replica.handle_enqueue_for_replication(propose()) {
            Err(EnqueueForReplicationError::LeaderRedirect(info)) => {
                assert_eq!(info.node_id, NodeId::new(2));
                assert_eq!(info.address.as_deref(), Some("127.0.0.1:7002"));
            }
            other => panic!("Unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn appends_entries_from_the_leader_term() {
        let (mut replica, _client) = new_replica(1);

        replica
            .server_handle_append_entries(append_request(2, 3, None, 0, &[1, 3]))
            .unwrap();

        assert_eq!(log_terms(&replica), vec![1, 3]);
    }

    #[tokio::test]
    async fn failing_to_record_last_applied_stops_the_driver() {
        let failing = Arc::new(AtomicBool::new(false));
        let store = FlakyRecordStore {
            inner: VolatileLocalState::new(NodeId::new(1)),
            failing: failing.clone(),
        };
        let (mut replica, client, rx) = new_replica_with_state(1, Box::new(store));
        replica
            .server_handle_append_entries(append_request(2, 1, None, 0, &[1, 1, 1]))
            .unwrap();
        assert!(replica.take_fatal_error().is_none());

        failing.store(true, Ordering::SeqCst);
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let driver = tokio::spawn(ReplicaActor::new(logger, rx, replica).run_event_loop());

        // The entries are durable, so the request itself still succeeds.
        client
            .weak()
            .append_entries(append_request(2, 1, Some((1, 3)), 3, &[]))
            .await
            .unwrap();

        assert!(matches!(driver.await.unwrap(), Err(StorageError::Io(_))));
        assert!(client.status().await.is_err());
    }
}
