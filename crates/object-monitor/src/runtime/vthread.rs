//! Hand-off of virtual threads that became runnable inside a monitor.
//!
//! A virtual thread that cannot enter a monitor (or that waits on one) does
//! not park its carrier. It returns a continuation to its scheduler and is
//! handed back through an [`Unblocker`] once a monitor exit or a notification
//! makes it worth re-dispatching.

use std::time::Duration;

use crate::{runtime::threads::ThreadRef, Runtime};

pub struct Unblocker<R: Runtime> {
    sender: flume::Sender<ThreadRef<R>>,
    receiver: flume::Receiver<ThreadRef<R>>,
}

impl<R: Runtime> Clone for Unblocker<R> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            receiver: self.receiver.clone(),
        }
    }
}

impl<R: Runtime> Unblocker<R> {
    pub fn new() -> Self {
        let (sender, receiver) = flume::unbounded();
        Self { sender, receiver }
    }

    pub fn push(&self, thread: ThreadRef<R>) {
        // Both ends live in `self`, so the channel cannot be disconnected.
        let _ = self.sender.send(thread);
    }

    /// Take every thread unblocked so far.
    pub fn drain(&self) -> Vec<ThreadRef<R>> {
        self.receiver.drain().collect()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<ThreadRef<R>> {
        self.receiver.recv_timeout(timeout).ok()
    }

    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }
}

impl<R: Runtime> Default for Unblocker<R> {
    fn default() -> Self {
        Self::new()
    }
}
