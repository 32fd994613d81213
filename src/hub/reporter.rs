use crate::hub::HubClient;
use crate::replica::{CommittedEntry, NodeId};
use tokio::sync::mpsc;

const DECISION_BACKLOG: usize = 1024;

/// Starts a task that reports every entry sent to the returned sender to the hub, one at a time
/// and in order. Reports are best effort: failures are logged and the entry is not retried. The
/// task ends once the sender is dropped and the backlog is drained.
pub(crate) fn spawn_decision_reporter(
    logger: slog::Logger,
    hub_client: HubClient,
    node_id: NodeId,
) -> mpsc::Sender<CommittedEntry> {
    let (sender, mut receiver) = mpsc::channel::<CommittedEntry>(DECISION_BACKLOG);

    tokio::spawn(async move {
        while let Some(entry) = receiver.recv().await {
            match hub_client.report_decision(node_id, &entry).await {
                Ok(()) => slog::trace!(logger, "Reported decision {:?} to hub", entry.index),
                Err(e) => slog::warn!(logger, "Failed to report decision {:?} to hub: {}", entry.index, e),
            }
        }
        slog::debug!(logger, "Decision reporter exiting");
    });

    sender
}
