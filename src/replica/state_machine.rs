use crate::replica::LogEntry;
use bytes::Bytes;

/// StateMachine is the application specific view of applying the replicated logs in sequential
/// consistent order.
pub trait StateMachine: Send + 'static {
    /// apply is called only when it's guaranteed that the provided entry has been committed (i.e.
    /// replicated to a majority). Because of this guarantee, you will never need to reverse an
    /// entry once you've been asked to apply it, so your impl of applying an entry need not be
    /// reversible. Entries arrive in strictly increasing index order, once per index, resuming
    /// after the last applied index when the node restarts.
    ///
    /// The last applied index is made durable right after each call. If the node crashes between
    /// `apply` returning and that write, the same entry is applied once more after the restart. If
    /// the write fails, the node stops. At most one entry can be seen twice this way, so an impl
    /// whose state lives outside the process should recognize an index it has already applied.
    ///
    /// Must be deterministic: every node applies the same entries and must reach the same state.
    fn apply(&mut self, entry: &LogEntry) -> StateMachineOutput;
}

#[derive(Clone, Debug, PartialEq)]
pub enum StateMachineOutput {
    Data(Bytes),
    NoData,
}

pub struct NoOpStateMachine {
    // nothing
}

impl NoOpStateMachine {
    pub fn new() -> Self {
        NoOpStateMachine {}
    }
}

impl StateMachine for NoOpStateMachine {
    fn apply(&mut self, _: &LogEntry) -> StateMachineOutput {
        StateMachineOutput::NoData
    }
}
