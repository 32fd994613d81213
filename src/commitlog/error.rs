use std::io;
use std::path::PathBuf;

/// Failures of the durable stores. `CorruptStorage` is never repaired automatically; it needs an
/// operator.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage IO failure: {0}")]
    Io(io::Error),

    #[error("corrupt storage in {path:?}: {reason}")]
    CorruptStorage { path: PathBuf, reason: String },
}

impl StorageError {
    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        StorageError::CorruptStorage {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// Carries this error through an `io::Error`. Converting back with `From` recovers it.
    pub(crate) fn into_io(self) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, self)
    }

    pub fn is_corrupt(&self) -> bool {
        matches!(self, StorageError::CorruptStorage { .. })
    }
}

impl From<io::Error> for StorageError {
    fn from(e: io::Error) -> Self {
        if !e.get_ref().map_or(false, |inner| inner.is::<StorageError>()) {
            return StorageError::Io(e);
        }

        match e.into_inner().map(|inner| inner.downcast::<StorageError>()) {
            Some(Ok(inner)) => *inner,
            // Unreachable after the check above.
            _ => StorageError::Io(io::Error::new(io::ErrorKind::Other, "unrecoverable storage error")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn corruption_survives_io_error_round_trip() {
        let io_error = StorageError::corrupt("/data/log", "checksum mismatch").into_io();
        assert_eq!(io_error.kind(), io::ErrorKind::InvalidData);

        match StorageError::from(io_error) {
            StorageError::CorruptStorage { path, reason } => {
                assert_eq!(path, PathBuf::from("/data/log"));
                assert_eq!(reason, "checksum mismatch");
            }
            e => panic!("Unexpected error: {:?}", e),
        }
    }

    #[test]
    fn plain_io_errors_stay_io() {
        let error = StorageError::from(io::Error::new(io::ErrorKind::TimedOut, "slow disk"));
        assert!(matches!(error, StorageError::Io(ref e) if e.kind() == io::ErrorKind::TimedOut));
    }
}
