mod error;
mod in_memory;
mod io_worker;
mod log;
mod storage;

pub use error::StorageError;
pub use in_memory::InMemoryLog;
pub(crate) use io_worker::IoWorker;
pub use io_worker::DEFAULT_STORAGE_TIMEOUT;
pub use log::Entry;
pub use log::EntryDecodeError;
pub use log::Index;
pub use log::Log;
pub use storage::FileLog;
