//! This module is a replication-specific commit log that wraps the generic commit log. It knows
//! about terms, the commit index and applying entries; the commitlog mod only knows bytes.

mod commit_stream;
mod log;
mod log_entry;
mod wiring;

pub use commit_stream::CommitStream;
pub use commit_stream::CommittedEntry;
pub(crate) use log_entry::WriteAheadLogEntry;

pub(super) use log::WriteAheadLog;
pub(super) use wiring::wired;
