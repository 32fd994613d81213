use std::convert::TryFrom;
use std::{fmt, io};

#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
struct U64NonZero(u64);

impl U64NonZero {
    fn new(val: u64) -> Self {
        assert_ne!(val, 0);
        U64NonZero(val)
    }
}

/// Index is an index of an entry in the log; i.e. a log entry's index.
#[derive(Copy, Clone, PartialOrd, PartialEq, Ord, Eq, Hash)]
pub struct Index(U64NonZero);

impl Index {
    pub fn new(index: u64) -> Self {
        Index(U64NonZero::new(index))
    }

    pub fn new_usize(index: usize) -> Self {
        Self::new(index as u64)
    }

    /// Wire formats use 0 for "no entry".
    pub fn from_wire(index: u64) -> Option<Self> {
        match index {
            0 => None,
            i => Some(Self::new(i)),
        }
    }

    pub fn start_index() -> Self {
        Self::new(1)
    }

    pub fn as_u64(&self) -> u64 {
        self.0 .0
    }

    pub fn plus(&self, delta: u64) -> Index {
        Index::new(self.as_u64() + delta)
    }

    pub fn checked_minus(&self, delta: u64) -> Option<Index> {
        self.as_u64().checked_sub(delta).and_then(Self::from_wire)
    }
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0 .0)
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0 .0)
    }
}

/// Log is an append only log intended for use as a replicated commit log.
///
/// Log indexes entries starting from 1. There will be no entry existing at index 0. The first
/// entry is written at index 1.
pub trait Log<E: Entry>: Send + 'static {
    /// append() appends a log entry to the log at the next log entry index, then returns
    /// the log entry index that was just used to append the entry. The entry is not guaranteed
    /// to be durable until `sync()` returns.
    fn append(&mut self, entry: E) -> Result<Index, io::Error>;

    /// Read log entry at specified index.
    fn read(&self, index: Index) -> Result<Option<E>, io::Error>;

    /// Removes anything starting at `index` and later. Durable once this returns.
    fn truncate(&mut self, index: Index) -> Result<(), io::Error>;

    /// next_index returns the next index that will be used to append an entry.
    fn next_index(&self) -> Index;

    /// Flush all appended entries to durable storage.
    fn sync(&mut self) -> Result<(), io::Error> {
        Ok(())
    }
}

/// Entry is anything the log can store. Decoding is fallible because bytes may come from disk.
pub trait Entry: Clone + Send + TryFrom<Vec<u8>, Error = EntryDecodeError> + Into<Vec<u8>> + 'static {}

#[derive(Debug, thiserror::Error)]
#[error("malformed log entry: {0}")]
pub struct EntryDecodeError(pub String);

impl From<EntryDecodeError> for io::Error {
    fn from(e: EntryDecodeError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, e)
    }
}
