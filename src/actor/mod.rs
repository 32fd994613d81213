//! The single driver of a node. Every input (client proposals, inbound RPCs, RPC replies from
//! peers, timer ticks, queries, shutdown) becomes an `Event` on one bounded queue, and one task
//! applies them to the `Replica` one at a time.

use crate::commitlog::{Log, StorageError};
use crate::replica::{
    AppendEntriesError, AppendEntriesInput, AppendEntriesOutput, AppendEntriesReplyFromPeer,
    EnqueueForReplicationError, EnqueueForReplicationInput, EnqueueForReplicationOutput, HeartbeatTick, LogEntry,
    ReadLogError, Replica, ReplicaStatus, RequestVoteError, RequestVoteInput, RequestVoteOutput,
    RequestVoteReplyFromPeer, WriteAheadLogEntry,
};
use std::fmt::Debug;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug)]
pub(crate) enum Event {
    // Leader: append to local log, sync, replicate eagerly.
    // Candidate/Follower: reject with redirect info if we know the leader.
    EnqueueForReplication(
        EnqueueForReplicationInput,
        Callback<EnqueueForReplicationOutput, EnqueueForReplicationError>,
    ),

    // Any role: grant vote if applicable (persisted before replying). Higher term => follower.
    RequestVote(RequestVoteInput, Callback<RequestVoteOutput, RequestVoteError>),

    // Candidate: count vote, become leader on majority. Others: discard unless term is higher.
    RequestVoteReplyFromPeer(RequestVoteReplyFromPeer),

    // Any role: step down if applicable, reconcile log, sync, then reply. Resets election timer.
    AppendEntries(AppendEntriesInput, Callback<AppendEntriesOutput, AppendEntriesError>),

    // Leader: update peer progress, advance commit index, apply. Others: discard.
    AppendEntriesReplyFromPeer(AppendEntriesReplyFromPeer),

    // Leader: send AppendEntries to one peer. Others: discard.
    HeartbeatTick(HeartbeatTick),

    // Follower/Candidate: start a new election if the deadline really passed. Leader: discard.
    ElectionTimeout,

    Status(oneshot::Sender<ReplicaStatus>),
    ReadLog(Callback<Vec<LogEntry>, ReadLogError>),

    // Stop after the current event. The sender is notified once the replica has been dropped.
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug)]
pub(crate) struct Callback<O: Debug, E: Debug>(oneshot::Sender<Result<O, E>>);

impl<O: Debug, E: Debug> Callback<O, E> {
    pub(crate) fn send(self, message: Result<O, E>) {
        // Caller may have given up (e.g. RPC timeout). Nothing to do about it.
        let _ = self.0.send(message);
    }
}

#[derive(Debug, Clone, Copy, thiserror::Error)]
#[error("Replica actor has exited")]
pub(crate) struct ActorExited;

/// Strong handle on the driver's queue. The driver keeps running while at least one exists.
#[derive(Clone)]
pub(crate) struct ActorClient {
    sender: mpsc::Sender<Event>,
}

/// Handle that does not keep the driver alive. Timers, the RPC server and in-flight RPC tasks hold
/// these so that dropping the node's `ActorClient` is enough to stop everything.
#[derive(Clone)]
pub(crate) struct WeakActorClient {
    sender: mpsc::WeakSender<Event>,
}

impl ActorClient {
    pub(crate) fn new(buffer_size: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(buffer_size);
        (ActorClient { sender: tx }, rx)
    }

    pub(crate) fn weak(&self) -> WeakActorClient {
        WeakActorClient {
            sender: self.sender.downgrade(),
        }
    }

    pub(crate) async fn enqueue_for_replication(
        &self,
        input: EnqueueForReplicationInput,
    ) -> Result<EnqueueForReplicationOutput, EnqueueForReplicationError> {
        let (tx, rx) = oneshot::channel();
        send(&self.sender, Event::EnqueueForReplication(input, Callback(tx)))
            .await
            .map_err(|_| EnqueueForReplicationError::ActorExited)?;
        rx.await.unwrap_or(Err(EnqueueForReplicationError::ActorExited))
    }

    pub(crate) async fn status(&self) -> Result<ReplicaStatus, ActorExited> {
        let (tx, rx) = oneshot::channel();
        send(&self.sender, Event::Status(tx)).await?;
        rx.await.map_err(|_| ActorExited)
    }

    pub(crate) async fn read_log(&self) -> Result<Vec<LogEntry>, ReadLogError> {
        let (tx, rx) = oneshot::channel();
        send(&self.sender, Event::ReadLog(Callback(tx)))
            .await
            .map_err(|_| ReadLogError::ActorExited)?;
        rx.await.unwrap_or(Err(ReadLogError::ActorExited))
    }

    /// Returns once the driver has stopped. Idempotent: a second call sees `ActorExited`.
    pub(crate) async fn shutdown(&self) -> Result<(), ActorExited> {
        let (tx, rx) = oneshot::channel();
        send(&self.sender, Event::Shutdown(tx)).await?;
        rx.await.map_err(|_| ActorExited)
    }
}

impl WeakActorClient {
    fn upgrade(&self) -> Result<mpsc::Sender<Event>, ActorExited> {
        self.sender.upgrade().ok_or(ActorExited)
    }

    /// Same as the strong client's, for proposals that arrive over the network.
    pub(crate) async fn enqueue_for_replication(
        &self,
        input: EnqueueForReplicationInput,
    ) -> Result<EnqueueForReplicationOutput, EnqueueForReplicationError> {
        let sender = self.upgrade().map_err(|_| EnqueueForReplicationError::ActorExited)?;
        let (tx, rx) = oneshot::channel();
        send(&sender, Event::EnqueueForReplication(input, Callback(tx)))
            .await
            .map_err(|_| EnqueueForReplicationError::ActorExited)?;
        rx.await.unwrap_or(Err(EnqueueForReplicationError::ActorExited))
    }

    pub(crate) async fn request_vote(&self, input: RequestVoteInput) -> Result<RequestVoteOutput, RequestVoteError> {
        let sender = self.upgrade().map_err(|_| RequestVoteError::ActorExited)?;
        let (tx, rx) = oneshot::channel();
        send(&sender, Event::RequestVote(input, Callback(tx)))
            .await
            .map_err(|_| RequestVoteError::ActorExited)?;
        rx.await.unwrap_or(Err(RequestVoteError::ActorExited))
    }

    pub(crate) async fn append_entries(
        &self,
        input: AppendEntriesInput,
    ) -> Result<AppendEntriesOutput, AppendEntriesError> {
        let sender = self.upgrade().map_err(|_| AppendEntriesError::ActorExited)?;
        let (tx, rx) = oneshot::channel();
        send(&sender, Event::AppendEntries(input, Callback(tx)))
            .await
            .map_err(|_| AppendEntriesError::ActorExited)?;
        rx.await.unwrap_or(Err(AppendEntriesError::ActorExited))
    }

    pub(crate) async fn notify_request_vote_reply_from_peer(
        &self,
        reply: RequestVoteReplyFromPeer,
    ) -> Result<(), ActorExited> {
        send(&self.upgrade()?, Event::RequestVoteReplyFromPeer(reply)).await
    }

    pub(crate) async fn notify_append_entries_reply_from_peer(
        &self,
        reply: AppendEntriesReplyFromPeer,
    ) -> Result<(), ActorExited> {
        send(&self.upgrade()?, Event::AppendEntriesReplyFromPeer(reply)).await
    }

    pub(crate) async fn heartbeat_tick(&self, tick: HeartbeatTick) -> Result<(), ActorExited> {
        send(&self.upgrade()?, Event::HeartbeatTick(tick)).await
    }

    pub(crate) async fn election_timeout(&self) -> Result<(), ActorExited> {
        send(&self.upgrade()?, Event::ElectionTimeout).await
    }
}

async fn send(sender: &mpsc::Sender<Event>, event: Event) -> Result<(), ActorExited> {
    sender.send(event).await.map_err(|_| ActorExited)
}

/// ReplicaActor is replica logic in actor model.
pub(crate) struct ReplicaActor<L>
where
    L: Log<WriteAheadLogEntry>,
{
    logger: slog::Logger,
    receiver: mpsc::Receiver<Event>,
    replica: Replica<L>,
}

impl<L> ReplicaActor<L>
where
    L: Log<WriteAheadLogEntry> + 'static,
{
    pub(crate) fn new(logger: slog::Logger, receiver: mpsc::Receiver<Event>, replica: Replica<L>) -> Self {
        ReplicaActor {
            logger,
            receiver,
            replica,
        }
    }

    /// Runs until shutdown, until every strong client is gone, or until the replica hits a storage
    /// error it can't continue from. That last case is the only error.
    pub(crate) async fn run_event_loop(self) -> Result<(), StorageError> {
        let ReplicaActor {
            logger,
            mut receiver,
            mut replica,
        } = self;

        let (shutdown_ack, result) = loop {
            match receiver.recv().await {
                Some(Event::Shutdown(ack)) => break (Some(ack), Ok(())),
                Some(event) => {
                    Self::handle_event(&mut replica, event);
                    if let Some(e) = replica.take_fatal_error() {
                        break (None, Err(e));
                    }
                }
                None => break (None, Ok(())),
            }
        };

        match &result {
            Ok(()) => slog::info!(logger, "Replica event loop exiting"),
            Err(e) => slog::crit!(logger, "Replica event loop exiting on fatal storage error: {}", e),
        }
        // Dropping the replica stops its timers and the RPC server.
        drop(replica);
        receiver.close();
        if let Some(ack) = shutdown_ack {
            let _ = ack.send(());
        }

        result
    }

    // This must NOT be async. Any long running work must be spawned on another task and come back
    // as an event on this queue.
    fn handle_event(replica: &mut Replica<L>, event: Event) {
        match event {
            Event::EnqueueForReplication(input, callback) => {
                callback.send(replica.handle_enqueue_for_replication(input));
            }
            Event::RequestVote(input, callback) => {
                callback.send(replica.server_handle_request_vote(input));
            }
            Event::RequestVoteReplyFromPeer(reply) => {
                replica.handle_request_vote_reply_from_peer(reply);
            }
            Event::AppendEntries(input, callback) => {
                callback.send(replica.server_handle_append_entries(input));
            }
            Event::AppendEntriesReplyFromPeer(reply) => {
                replica.handle_append_entries_reply_from_peer(reply);
            }
            Event::HeartbeatTick(tick) => {
                replica.handle_heartbeat_tick(tick);
            }
            Event::ElectionTimeout => {
                replica.handle_election_timeout();
            }
            Event::Status(reply_to) => {
                let _ = reply_to.send(replica.status());
            }
            Event::ReadLog(callback) => {
                callback.send(replica.read_log());
            }
            Event::Shutdown(_) => unreachable!("Shutdown is handled by the event loop"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn weak_client_fails_once_strong_clients_are_gone() {
        let (client, mut rx) = ActorClient::new(4);
        let weak = client.weak();

        weak.election_timeout().await.unwrap();
        assert!(matches!(rx.recv().await, Some(Event::ElectionTimeout)));

        drop(client);
        assert!(weak.election_timeout().await.is_err());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn dropped_callback_surfaces_as_actor_exited() {
        let (client, mut rx) = ActorClient::new(4);

        let driver = tokio::spawn(async move {
            // Receive the request and drop it without answering.
            let _ = rx.recv().await;
        });

        let result = client.status().await;
        driver.await.unwrap();
        assert!(result.is_err());
    }
}
