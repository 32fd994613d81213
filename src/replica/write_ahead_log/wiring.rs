use crate::commitlog;
use crate::commitlog::Index;
use crate::replica::write_ahead_log::{commit_stream, WriteAheadLog};
use crate::replica::{CommitStream, CommittedEntry, StateMachine, WriteAheadLogEntry};
use std::io;
use tokio::sync::mpsc;

pub(in super::super) fn wired<L>(
    logger: slog::Logger,
    log: L,
    state_machine: Box<dyn StateMachine>,
    last_applied_index: Option<Index>,
    decision_sink: Option<mpsc::Sender<CommittedEntry>>,
) -> Result<(WriteAheadLog<L>, CommitStream), io::Error>
where
    L: commitlog::Log<WriteAheadLogEntry>,
{
    let (publisher, stream) = commit_stream::new();
    let publisher = publisher.with_decision_sink(decision_sink);

    let wal = WriteAheadLog::new(logger, log, state_machine, publisher, last_applied_index)?;

    Ok((wal, stream))
}
