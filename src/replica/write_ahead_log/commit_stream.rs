use crate::commitlog::Index;
use crate::replica::{StateMachineOutput, Term};
use bytes::Bytes;
use tokio::sync::mpsc;

pub(super) struct CommitStreamPublisher {
    sender: mpsc::UnboundedSender<CommittedEntry>,
    // Gets a copy of every entry if there's room. Never waited on.
    decision_sink: Option<mpsc::Sender<CommittedEntry>>,
}

/// CommitStream yields every entry in the order it was applied to the local state machine.
pub struct CommitStream {
    receiver: mpsc::UnboundedReceiver<CommittedEntry>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct CommittedEntry {
    pub term: Term,
    pub index: Index,
    pub data: Bytes,
    pub output: StateMachineOutput,
}

pub(super) fn new() -> (CommitStreamPublisher, CommitStream) {
    let (tx, rx) = mpsc::unbounded_channel();

    let applier_sender = CommitStreamPublisher {
        sender: tx,
        decision_sink: None,
    };
    let applier_receiver = CommitStream { receiver: rx };

    (applier_sender, applier_receiver)
}

impl CommitStreamPublisher {
    pub(super) fn with_decision_sink(mut self, decision_sink: Option<mpsc::Sender<CommittedEntry>>) -> Self {
        self.decision_sink = decision_sink;
        self
    }

    pub(super) fn notify_commit(&self, logger: &slog::Logger, committed_entry: CommittedEntry) {
        if let Some(sink) = &self.decision_sink {
            match sink.try_send(committed_entry.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(entry)) => {
                    slog::warn!(logger, "Decision backlog is full. Not reporting {:?}.", entry.index)
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }

        if let Err(_) = self.sender.send(committed_entry) {
            slog::debug!(logger, "CommitStream has disconnected.");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn committed(index: u64) -> CommittedEntry {
        CommittedEntry {
            term: Term::new(1),
            index: Index::new(index),
            data: Bytes::from(format!("e{}", index)),
            output: StateMachineOutput::NoData,
        }
    }

    #[tokio::test]
    async fn full_decision_sink_never_holds_up_the_stream() {
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        let (sink, mut decisions) = mpsc::channel(1);
        let (publisher, mut stream) = new();
        let publisher = publisher.with_decision_sink(Some(sink));

        publisher.notify_commit(&logger, committed(1));
        publisher.notify_commit(&logger, committed(2));

        assert_eq!(stream.next().await.unwrap().index, Index::new(1));
        assert_eq!(stream.next().await.unwrap().index, Index::new(2));
        // Only the first fit.
        assert_eq!(decisions.recv().await.unwrap().index, Index::new(1));
        assert!(decisions.try_recv().is_err());
    }
}

impl CommitStream {
    /// Returns None once the node has shut down and every applied entry was consumed.
    pub async fn next(&mut self) -> Option<CommittedEntry> {
        self.receiver.recv().await
    }
}
