use std::sync::atomic::{AtomicUsize, Ordering};

use crate::objectmodel::header::MarkWord;

/// A stack-lock record. Holds the displaced header of the object it locks.
///
/// When a stack-locked object gets inflated the monitor starts out with an
/// anonymous owner and remembers the record in `stack_locker`; the thread
/// that owns the record can later claim the monitor.
#[derive(Default)]
pub struct BasicLock {
    metadata: AtomicUsize,
}

impl BasicLock {
    pub const fn new() -> Self {
        Self {
            metadata: AtomicUsize::new(0),
        }
    }

    pub fn displaced_header(&self) -> MarkWord {
        MarkWord::from_raw(self.metadata.load(Ordering::Relaxed))
    }

    pub fn set_displaced_header(&self, header: MarkWord) {
        self.metadata.store(header.raw(), Ordering::Relaxed);
    }
}
