use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// A single slot shared between a timer handle and its task. The handle posts the next wake time,
/// the task takes it. Only the latest posted value survives.
pub(super) struct Mailbox<T> {
    slot: Arc<Mutex<Option<T>>>,
}

impl<T> Clone for Mailbox<T> {
    fn clone(&self) -> Self {
        Mailbox {
            slot: self.slot.clone(),
        }
    }
}

impl<T> Mailbox<T> {
    pub(super) fn new() -> Self {
        Mailbox {
            slot: Arc::new(Mutex::new(None)),
        }
    }

    pub(super) fn post(&self, value: T) {
        self.lock().replace(value);
    }

    pub(super) fn take(&self) -> Option<T> {
        self.lock().take()
    }

    fn lock(&self) -> MutexGuard<'_, Option<T>> {
        // Nothing panics while holding this lock, so poison carries no information.
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Owned by a timer handle. Dropping it tells the paired task to exit.
pub(super) struct DropGuard {
    dropped: Arc<AtomicBool>,
}

pub(super) struct DropCheck {
    dropped: Arc<AtomicBool>,
}

impl Drop for DropGuard {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::Release);
    }
}

impl DropCheck {
    pub(super) fn is_dropped(&self) -> bool {
        self.dropped.load(Ordering::Acquire)
    }
}

pub(super) fn drop_guard() -> (DropGuard, DropCheck) {
    let dropped = Arc::new(AtomicBool::new(false));

    (
        DropGuard {
            dropped: dropped.clone(),
        },
        DropCheck { dropped },
    )
}
