use crate::commitlog::{Index, IoWorker, StorageError};
use crate::replica::peers::NodeId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub struct Term(u64);

impl Term {
    pub fn new(term: u64) -> Self {
        Term(term)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub(crate) fn incr(&mut self) {
        self.0 += 1;
    }
}

impl fmt::Debug for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// PersistentLocalState is used whenever the algorithm requires that something is persisted to a
/// durable store to guarantee safety. Not everything that uses disk has to go through this, only
/// algorithm-correctness-critical ones.
///
/// Store methods are CAS like operations. Similar to most CAS method signatures, they return
/// true if we have mutated state. A store is durable before it returns, and a failed store leaves
/// the in-memory view unchanged.
pub(crate) trait PersistentLocalState: Send {
    /// Set current term to `new_term` atomically, iff it is larger than current term.
    fn store_term_if_increased(&mut self, new_term: Term) -> Result<bool, StorageError>;

    /// Store our vote for the latest term iff the latest term (internal state) is the same term as
    /// the one provided, and we have not stored a vote for the latest term.
    fn store_vote_for_term_if_unvoted(&mut self, expected_current_term: Term, vote: NodeId)
        -> Result<bool, StorageError>;

    /// Return the new term. Used when transitioning to candidate.
    fn increment_term_and_vote_for_self(&mut self) -> Result<Term, StorageError>;

    fn store_last_applied(&mut self, last_applied: Index) -> Result<(), StorageError>;

    fn current_term(&self) -> Term;
    fn voted_for_current_term(&self) -> (Term, Option<NodeId>);
    fn last_applied(&self) -> Option<Index>;
}

/// The full persisted record. Field names are the on-disk JSON keys.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct LocalStateRecord {
    current_term: u64,
    voted_for: Option<NodeId>,
    // 0 means nothing has been applied.
    last_applied: u64,
}

/// RecordStore is how a PersistentLocalState impl makes a record durable. Everything else is
/// shared.
pub(crate) trait RecordStore: Send {
    fn record(&self) -> &LocalStateRecord;
    fn my_node_id(&self) -> NodeId;

    /// Persist `new_record`, then make it the current record.
    fn commit(&mut self, new_record: LocalStateRecord) -> Result<(), StorageError>;
}

impl<S: RecordStore> PersistentLocalState for S {
    fn store_term_if_increased(&mut self, new_term: Term) -> Result<bool, StorageError> {
        if new_term.as_u64() <= self.record().current_term {
            return Ok(false);
        }

        self.commit(LocalStateRecord {
            current_term: new_term.as_u64(),
            voted_for: None,
            last_applied: self.record().last_applied,
        })?;
        Ok(true)
    }

    fn store_vote_for_term_if_unvoted(&mut self, expected_term: Term, vote: NodeId) -> Result<bool, StorageError> {
        let record = self.record();
        if expected_term.as_u64() != record.current_term || record.voted_for.is_some() {
            return Ok(false);
        }

        let mut new_record = record.clone();
        new_record.voted_for = Some(vote);
        self.commit(new_record)?;
        Ok(true)
    }

    fn increment_term_and_vote_for_self(&mut self) -> Result<Term, StorageError> {
        let mut new_term = Term::new(self.record().current_term);
        new_term.incr();

        self.commit(LocalStateRecord {
            current_term: new_term.as_u64(),
            voted_for: Some(self.my_node_id()),
            last_applied: self.record().last_applied,
        })?;
        Ok(new_term)
    }

    fn store_last_applied(&mut self, last_applied: Index) -> Result<(), StorageError> {
        if last_applied.as_u64() == self.record().last_applied {
            return Ok(());
        }

        let mut new_record = self.record().clone();
        new_record.last_applied = last_applied.as_u64();
        self.commit(new_record)
    }

    fn current_term(&self) -> Term {
        Term::new(self.record().current_term)
    }

    fn voted_for_current_term(&self) -> (Term, Option<NodeId>) {
        (self.current_term(), self.record().voted_for)
    }

    fn last_applied(&self) -> Option<Index> {
        Index::from_wire(self.record().last_applied)
    }
}

/// FileLocalState keeps the record as a small JSON document. Every change is written to a
/// temp file, fsynced, then renamed over the previous version. Writes run on the store's own IO
/// thread and fail with `TimedOut` after the storage timeout.
///
/// A timed out write may still land later. The in-memory record only follows successful writes,
/// so nothing acts on a record that wasn't acknowledged.
pub(crate) struct FileLocalState {
    path: PathBuf,
    my_node_id: NodeId,
    record: LocalStateRecord,
    worker: IoWorker,
}

impl FileLocalState {
    pub(crate) fn open(
        path: impl AsRef<Path>,
        my_node_id: NodeId,
        storage_timeout: Duration,
    ) -> Result<Self, StorageError> {
        let path = path.as_ref().to_path_buf();
        let record = match fs::read(&path) {
            Ok(bytes) => {
                let record: LocalStateRecord = serde_json::from_slice(&bytes)
                    .map_err(|e| StorageError::corrupt(&path, format!("unparseable metadata: {}", e)))?;
                if record.current_term == 0 && record.voted_for.is_some() {
                    return Err(StorageError::corrupt(&path, "vote recorded for term 0"));
                }
                record
            }
            Err(e) if e.kind() == ErrorKind::NotFound => LocalStateRecord::default(),
            Err(e) => return Err(StorageError::Io(e)),
        };

        let worker = IoWorker::spawn(&format!("metadata-io-{}", my_node_id), storage_timeout)?;
        Ok(FileLocalState {
            path,
            my_node_id,
            record,
            worker,
        })
    }
}

fn write_atomically(path: &Path, json: &[u8]) -> io::Result<()> {
    let temp_path = path.with_extension("tmp");
    let mut file = File::create(&temp_path)?;
    file.write_all(json)?;
    file.sync_all()?;
    fs::rename(&temp_path, path)
}

impl RecordStore for FileLocalState {
    fn record(&self) -> &LocalStateRecord {
        &self.record
    }

    fn my_node_id(&self) -> NodeId {
        self.my_node_id
    }

    fn commit(&mut self, new_record: LocalStateRecord) -> Result<(), StorageError> {
        let json = serde_json::to_vec_pretty(&new_record)
            .map_err(|e| StorageError::Io(io::Error::new(ErrorKind::InvalidData, e)))?;
        let path = self.path.clone();
        self.worker.run(move || write_atomically(&path, &json))?;
        self.record = new_record;
        Ok(())
    }
}

/// VolatileLocalState keeps the record in RAM. Only for tests and throwaway nodes.
pub(crate) struct VolatileLocalState {
    my_node_id: NodeId,
    record: LocalStateRecord,
}

impl VolatileLocalState {
    pub(crate) fn new(my_node_id: NodeId) -> Self {
        VolatileLocalState {
            my_node_id,
            record: LocalStateRecord::default(),
        }
    }
}

impl RecordStore for VolatileLocalState {
    fn record(&self) -> &LocalStateRecord {
        &self.record
    }

    fn my_node_id(&self) -> NodeId {
        self.my_node_id
    }

    fn commit(&mut self, new_record: LocalStateRecord) -> Result<(), StorageError> {
        self.record = new_record;
        Ok(())
    }
}
