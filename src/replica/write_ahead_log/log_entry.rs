use crate::commitlog;
use crate::commitlog::EntryDecodeError;
use crate::replica::Term;
use std::convert::TryFrom;

/// Byte representation:
///
/// ```text
/// |                                         1                           |
/// | 0 | 1 | 2 | 3 | 4 | 5 | 6 | 7 | 8 | 9 | 0 | 1 | 2 | 3 | 4 | 5 | ... |
/// +---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+---+-...-+
/// |Vrs|     Term (8 bytes, LE)        |   Data (variable size)      ... |
/// +---+-------------------------------+-----------------------------...-+
/// ```
///
/// * `Vrs` - version of the serialized payload
/// * `Term` - leadership term when this entry was created, never 0
/// * `Data` - app specific data payload
///
/// Size/length of `Data` is not needed; the underlying commitlog frames each entry.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct WriteAheadLogEntry {
    pub term: Term,
    pub data: Vec<u8>,
}

const LOG_ENTRY_FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = 1 + 8;

impl commitlog::Entry for WriteAheadLogEntry {}

impl TryFrom<Vec<u8>> for WriteAheadLogEntry {
    type Error = EntryDecodeError;

    fn try_from(mut bytes: Vec<u8>) -> Result<Self, Self::Error> {
        if bytes.len() < HEADER_LEN {
            return Err(EntryDecodeError(format!(
                "expected at least {} bytes, found {}",
                HEADER_LEN,
                bytes.len()
            )));
        }
        if bytes[0] != LOG_ENTRY_FORMAT_VERSION {
            return Err(EntryDecodeError(format!("unknown format version {}", bytes[0])));
        }

        let mut term_bytes = [0u8; 8];
        term_bytes.copy_from_slice(&bytes[1..HEADER_LEN]);
        let term = u64::from_le_bytes(term_bytes);
        if term == 0 {
            return Err(EntryDecodeError("entry has term 0".into()));
        }

        let data = bytes.split_off(HEADER_LEN);
        Ok(WriteAheadLogEntry {
            term: Term::new(term),
            data,
        })
    }
}

impl From<WriteAheadLogEntry> for Vec<u8> {
    fn from(entry: WriteAheadLogEntry) -> Self {
        let mut bytes: Vec<u8> = Vec::with_capacity(HEADER_LEN + entry.data.len());
        bytes.push(LOG_ENTRY_FORMAT_VERSION);
        bytes.extend_from_slice(&entry.term.as_u64().to_le_bytes());
        bytes.extend_from_slice(&entry.data);

        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_layout() {
        let entry = WriteAheadLogEntry {
            term: Term::new(0x0102),
            data: b"hi".to_vec(),
        };

        let bytes: Vec<u8> = entry.clone().into();
        assert_eq!(bytes, vec![1, 0x02, 0x01, 0, 0, 0, 0, 0, 0, b'h', b'i']);
        assert_eq!(WriteAheadLogEntry::try_from(bytes).unwrap(), entry);
    }

    #[test]
    fn rejects_malformed_bytes() {
        assert!(WriteAheadLogEntry::try_from(vec![1, 2, 3]).is_err());
        assert!(WriteAheadLogEntry::try_from(vec![2, 1, 0, 0, 0, 0, 0, 0, 0]).is_err());
        assert!(WriteAheadLogEntry::try_from(vec![1, 0, 0, 0, 0, 0, 0, 0, 0]).is_err());
    }
}
