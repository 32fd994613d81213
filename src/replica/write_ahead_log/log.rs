use crate::commitlog;
use crate::commitlog::{Index, StorageError};
use crate::replica::local_state::Term;
use crate::replica::write_ahead_log::commit_stream::{CommitStreamPublisher, CommittedEntry};
use crate::replica::{LogEntry, StateMachine, WriteAheadLogEntry};
use bytes::Bytes;
use std::io;

/// WriteAheadLog is the replication-specific log facade.
///
/// Note: A log entry has 3 states (not modeled directly in code):
/// 1. Persisted - written to disk, not yet replicated to majority
/// 2. Committed - written to disk, replicated to majority
/// 3. Applied - a committed entry that has also been applied to the state machine
///
/// A log entry's state has no global truth. Each replica will have their own local view of what
/// state the log entry is in.
pub(crate) struct WriteAheadLog<L>
where
    L: commitlog::Log<WriteAheadLogEntry>,
{
    // Application's info/debug log.
    logger: slog::Logger,

    // This is the log that we're replicating.
    log: L,
    // Metadata about the highest log entry that we've locally written. It must be updated atomically.
    latest_entry_metadata: Option<(Term, Index)>,

    state_machine: Box<dyn StateMachine>,
    // Every applied entry is also published here, for observers.
    commit_stream: CommitStreamPublisher,
    // Index of highest log entry known to be committed. None if nothing is committed.
    commit_index: Option<Index>,
    // Index of highest log entry applied to state machine. None if nothing is applied.
    last_applied_index: Option<Index>,
}

impl<L> WriteAheadLog<L>
where
    L: commitlog::Log<WriteAheadLogEntry>,
{
    /// `last_applied_index` is the durable progress of the state machine. Entries up to it are
    /// known to be committed, so it's also the initial commit index.
    pub(super) fn new(
        logger: slog::Logger,
        log: L,
        state_machine: Box<dyn StateMachine>,
        commit_stream: CommitStreamPublisher,
        last_applied_index: Option<Index>,
    ) -> Result<Self, io::Error> {
        let latest_entry_metadata = match log.next_index().checked_minus(1) {
            None => None,
            Some(last_index) => match log.read(last_index)? {
                Some(entry) => Some((entry.term, last_index)),
                None => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("log reports last index {:?} but has no entry there", last_index),
                    ))
                }
            },
        };

        if let Some(applied) = last_applied_index {
            let has_entry = matches!(latest_entry_metadata, Some((_, last)) if last >= applied);
            if !has_entry {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!(
                        "last applied index {:?} is beyond the end of the log {:?}",
                        applied, latest_entry_metadata
                    ),
                ));
            }
        }

        Ok(WriteAheadLog {
            logger,
            log,
            latest_entry_metadata,
            state_machine,
            commit_stream,
            commit_index: last_applied_index,
            last_applied_index,
        })
    }

    pub(crate) fn latest_entry(&self) -> Option<(Term, Index)> {
        self.latest_entry_metadata
    }

    pub(crate) fn read(&self, index: Index) -> Result<Option<WriteAheadLogEntry>, io::Error> {
        self.log.read(index)
    }

    fn read_required(&self, index: Index) -> Result<WriteAheadLogEntry, io::Error> {
        match self.read(index)? {
            Some(entry) => Ok(entry),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no log entry for index {:?}", index),
            )),
        }
    }

    /// Remove anything starting at `index` and later. Committed entries are never removed.
    pub(crate) fn truncate(&mut self, index: Index) -> Result<(), io::Error> {
        if let Some(commit_index) = self.commit_index {
            assert!(
                index > commit_index,
                "Can't truncate committed entries. Truncate from {:?}, commit index {:?}",
                index,
                commit_index
            );
        }

        let mut new_latest_entry_metadata = None;
        if let Some(new_latest_entry_index) = index.checked_minus(1) {
            new_latest_entry_metadata = self
                .read(new_latest_entry_index)?
                .map(|latest_entry| (latest_entry.term, new_latest_entry_index));
        }

        // Only update state after log action completes.
        self.log.truncate(index)?;

        self.latest_entry_metadata = new_latest_entry_metadata;
        Ok(())
    }

    pub(crate) fn append(&mut self, entry: WriteAheadLogEntry) -> Result<Index, io::Error> {
        let appended_term = entry.term;
        let appended_index = self.log.append(entry)?;
        // Only update state after log action completes.
        self.latest_entry_metadata = Some((appended_term, appended_index));

        Ok(appended_index)
    }

    /// Make every appended entry durable.
    pub(crate) fn sync(&mut self) -> Result<(), io::Error> {
        self.log.sync()
    }

    pub(crate) fn commit_index(&self) -> Option<Index> {
        self.commit_index
    }

    pub(crate) fn last_applied_index(&self) -> Option<Index> {
        self.last_applied_index
    }

    /// Leader path. Returns true if the commit index moved.
    pub(crate) fn ratchet_fwd_commit_index_if_valid(
        &mut self,
        tentative_new_commit_index: Index,
        current_term: Term,
    ) -> Result<bool, io::Error> {
        // Only move forward. A majority can lag behind what we've already committed, e.g. when we
        // restarted with a higher commit index than peers have acknowledged this term.
        if let Some(current_commit_index) = self.commit_index {
            if tentative_new_commit_index <= current_commit_index {
                return Ok(false);
            }
        }

        // > If there exists an N such that N > commitIndex, a majority
        // > of matchIndex[i] ≥ N, and log[N].term == currentTerm:
        // > set commitIndex = N (§5.3, §5.4).
        let entry = self.read_required(tentative_new_commit_index)?;
        if entry.term != current_term {
            return Ok(false);
        }

        self.ratchet_fwd_commit_index_panicking(tentative_new_commit_index);

        Ok(true)
    }

    /// Follower path. Anything at or below the current commit index is ignored.
    pub(crate) fn ratchet_fwd_commit_index_if_greater(&mut self, new_commit_index: Index) {
        if matches!(self.commit_index, Some(ci) if ci >= new_commit_index) {
            return;
        }

        self.ratchet_fwd_commit_index_panicking(new_commit_index);
    }

    fn ratchet_fwd_commit_index_panicking(&mut self, new_commit_index: Index) {
        // Assert we only ratchet commit index forward.
        if let Some(current_commit_index) = self.commit_index {
            assert!(
                new_commit_index > current_commit_index,
                "Can't ratchet commit index backwards. Expected [input] {:?} > {:?} [current]",
                new_commit_index,
                current_commit_index,
            );
        }

        // Assert we only mark as committed if we have the entry locally.
        let latest_locally_written_index = match self.latest_entry_metadata {
            Some((_, index)) => index,
            None => panic!("Can't ratchet commit index forward if we don't have any local logs"),
        };
        assert!(
            latest_locally_written_index >= new_commit_index,
            "Can't ratchet commit index forwards past our local log. Expected [latest log] {:?} >= {:?} [input]",
            latest_locally_written_index,
            new_commit_index,
        );

        self.commit_index.replace(new_commit_index);
    }

    /// apply_all_committed_entries applies all committed but unapplied entries in order, calling
    /// `record_applied` after each one. A read failure stops the batch and it's retried next time,
    /// unless the log is corrupt. Corruption and `record_applied` failures are returned.
    pub(crate) fn apply_all_committed_entries<F>(&mut self, mut record_applied: F) -> Result<(), StorageError>
    where
        F: FnMut(Index) -> Result<(), StorageError>,
    {
        let commit_index = match self.commit_index {
            Some(ci) => ci,
            None => return Ok(()),
        };

        // Apply all committed indexes until applied catches up.
        //
        // This may be a long running loop, and starve the Replica event loop from handling
        // another event. It's mostly hit by followers catching up after a restart or partition.
        loop {
            let next_index = match self.last_applied_index {
                None => Index::start_index(),
                Some(applied) if applied < commit_index => applied.plus(1),
                Some(_) => return Ok(()),
            };

            let entry = match self.read_required(next_index) {
                Ok(entry) => entry,
                Err(e) => {
                    let e = StorageError::from(e);
                    if e.is_corrupt() {
                        return Err(e);
                    }
                    // The entry is durable already. We can wait to retry next time.
                    slog::error!(self.logger, "Failed to read entry {:?} for applying: {}", next_index, e);
                    return Ok(());
                }
            };

            let committed = self.apply_single_entry(next_index, entry);
            self.last_applied_index.replace(next_index);
            record_applied(next_index)?;
            self.commit_stream.notify_commit(&self.logger, committed);
        }
    }

    fn apply_single_entry(&mut self, index_to_apply: Index, entry: WriteAheadLogEntry) -> CommittedEntry {
        let log_entry = LogEntry {
            index: index_to_apply,
            term: entry.term,
            data: Bytes::from(entry.data),
        };

        let output = self.state_machine.apply(&log_entry);
        slog::debug!(self.logger, "Applied entry {:?}", index_to_apply);

        CommittedEntry {
            term: log_entry.term,
            index: log_entry.index,
            data: log_entry.data,
            output,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commitlog::{InMemoryLog, Log};
    use crate::replica::write_ahead_log::{commit_stream, CommitStream};
    use crate::replica::StateMachineOutput;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingStateMachine {
        applied: Arc<Mutex<Vec<u64>>>,
    }

    impl StateMachine for RecordingStateMachine {
        fn apply(&mut self, entry: &LogEntry) -> StateMachineOutput {
            self.applied.lock().unwrap().push(entry.index.as_u64());
            StateMachineOutput::Data(entry.data.clone())
        }
    }

    fn logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn entry(term: u64) -> WriteAheadLogEntry {
        WriteAheadLogEntry {
            term: Term::new(term),
            data: vec![term as u8],
        }
    }

    fn wal_with(
        entries: Vec<WriteAheadLogEntry>,
        last_applied: Option<Index>,
    ) -> (
        WriteAheadLog<InMemoryLog<WriteAheadLogEntry>>,
        RecordingStateMachine,
        CommitStream,
    ) {
        let mut log = InMemoryLog::create();
        for e in entries {
            log.append(e).unwrap();
        }
        let sm = RecordingStateMachine::default();
        let (publisher, stream) = commit_stream::new();
        let wal = WriteAheadLog::new(logger(), log, Box::new(sm.clone()), publisher, last_applied).unwrap();
        (wal, sm, stream)
    }

    #[tokio::test]
    async fn applies_committed_entries_in_order() {
        let (mut wal, sm, mut stream) = wal_with(vec![entry(1), entry(1), entry(2)], None);
        assert_eq!(wal.latest_entry(), Some((Term::new(2), Index::new(3))));

        // Entry 2 is from an older term; the leader can't commit it by counting replicas.
        assert!(!wal.ratchet_fwd_commit_index_if_valid(Index::new(2), Term::new(2)).unwrap());
        assert!(wal.ratchet_fwd_commit_index_if_valid(Index::new(3), Term::new(2)).unwrap());

        let mut recorded = Vec::new();
        wal.apply_all_committed_entries(|i| {
            recorded.push(i.as_u64());
            Ok(())
        })
        .unwrap();
        wal.apply_all_committed_entries(|i| {
            recorded.push(i.as_u64());
            Ok(())
        })
        .unwrap();
        assert_eq!(recorded, vec![1, 2, 3]);
        assert_eq!(wal.last_applied_index(), Some(Index::new(3)));
        assert_eq!(*sm.applied.lock().unwrap(), vec![1, 2, 3]);

        let first = stream.next().await.unwrap();
        assert_eq!(first.index, Index::new(1));
        assert_eq!(first.output, StateMachineOutput::Data(Bytes::from(vec![1u8])));
    }

    #[test]
    fn resumes_after_last_applied() {
        let (mut wal, sm, _stream) = wal_with(vec![entry(1), entry(1), entry(1)], Some(Index::new(2)));
        assert_eq!(wal.commit_index(), Some(Index::new(2)));

        // A stale leader commit doesn't move anything backwards.
        wal.ratchet_fwd_commit_index_if_greater(Index::new(1));
        assert_eq!(wal.commit_index(), Some(Index::new(2)));

        wal.ratchet_fwd_commit_index_if_greater(Index::new(3));
        wal.apply_all_committed_entries(|_| Ok(())).unwrap();
        assert_eq!(wal.last_applied_index(), Some(Index::new(3)));
        assert_eq!(*sm.applied.lock().unwrap(), vec![3]);
    }

    #[test]
    fn failed_record_stops_after_one_entry() {
        let (mut wal, sm, _stream) = wal_with(vec![entry(1), entry(1), entry(1)], None);
        wal.ratchet_fwd_commit_index_if_greater(Index::new(3));

        let result = wal.apply_all_committed_entries(|_| {
            Err(StorageError::Io(io::Error::new(io::ErrorKind::Other, "disk full")))
        });

        assert!(matches!(result, Err(StorageError::Io(_))));
        // Only the entry whose progress couldn't be recorded was applied.
        assert_eq!(*sm.applied.lock().unwrap(), vec![1]);
    }

    #[test]
    fn rejects_last_applied_past_log_end() {
        let log: InMemoryLog<WriteAheadLogEntry> = InMemoryLog::create();
        let (publisher, _stream) = commit_stream::new();
        let result = WriteAheadLog::new(
            logger(),
            log,
            Box::new(RecordingStateMachine::default()),
            publisher,
            Some(Index::new(1)),
        );
        assert!(result.is_err());
    }

    #[test]
    fn truncate_updates_latest_entry() {
        let (mut wal, _sm, _stream) = wal_with(vec![entry(1), entry(2), entry(3)], None);

        wal.truncate(Index::new(2)).unwrap();

        assert_eq!(wal.latest_entry(), Some((Term::new(1), Index::new(1))));
        assert_eq!(wal.append(entry(4)).unwrap(), Index::new(2));
        assert_eq!(wal.latest_entry(), Some((Term::new(4), Index::new(2))));
    }

    #[test]
    #[should_panic]
    fn truncate_committed_entry_panics() {
        let (mut wal, _sm, _stream) = wal_with(vec![entry(1), entry(1)], Some(Index::new(2)));
        let _ = wal.truncate(Index::new(2));
    }
}
