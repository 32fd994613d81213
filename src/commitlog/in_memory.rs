use crate::commitlog::{Entry, Index, Log};
use std::io;
use std::marker::PhantomData;

/// InMemoryLog keeps the log in RAM. Nothing survives a restart, so it's only suitable for tests
/// and throwaway clusters. See storage.rs for the durable log.
pub struct InMemoryLog<E: Entry> {
    // We don't *need* to convert these to bytes. We could just hold the original entry in memory,
    // but we want to exercise the conversion logic.
    log: Vec<Vec<u8>>,
    _pd: PhantomData<E>,
}

impl<E: Entry> InMemoryLog<E> {
    pub fn create() -> Self {
        InMemoryLog {
            log: vec![],
            _pd: PhantomData::default(),
        }
    }

    fn vec_index(index: Index) -> usize {
        // Log API states that Index starts from 1.
        (index.as_u64() - 1) as usize
    }
}

impl<E: Entry> Log<E> for InMemoryLog<E> {
    fn append(&mut self, entry: E) -> Result<Index, io::Error> {
        self.log.push(entry.into());

        Ok(Index::new_usize(self.log.len()))
    }

    fn read(&self, index: Index) -> Result<Option<E>, io::Error> {
        let vec_index = Self::vec_index(index);
        match self.log.get(vec_index) {
            Some(bytes) => Ok(Some(E::try_from(bytes.clone())?)),
            None => Ok(None),
        }
    }

    fn truncate(&mut self, index: Index) -> Result<(), io::Error> {
        let vec_index = Self::vec_index(index);
        self.log.truncate(vec_index);
        Ok(())
    }

    fn next_index(&self) -> Index {
        Index::new_usize(self.log.len() + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replica::{Term, WriteAheadLogEntry};

    fn entry(term: u64, data: &str) -> WriteAheadLogEntry {
        WriteAheadLogEntry {
            term: Term::new(term),
            data: data.as_bytes().to_vec(),
        }
    }

    #[test]
    fn append_read_truncate() {
        let mut log = InMemoryLog::create();
        assert_eq!(log.next_index(), Index::start_index());

        assert_eq!(log.append(entry(1, "a")).unwrap(), Index::new(1));
        assert_eq!(log.append(entry(1, "b")).unwrap(), Index::new(2));
        assert_eq!(log.append(entry(2, "c")).unwrap(), Index::new(3));

        let read = log.read(Index::new(2)).unwrap().expect("entry 2");
        assert_eq!(read.term, Term::new(1));
        assert_eq!(read.data, b"b".to_vec());
        assert!(log.read(Index::new(4)).unwrap().is_none());

        log.truncate(Index::new(2)).unwrap();
        assert_eq!(log.next_index(), Index::new(2));
        assert!(log.read(Index::new(2)).unwrap().is_none());
        assert_eq!(log.append(entry(3, "d")).unwrap(), Index::new(2));
    }
}
