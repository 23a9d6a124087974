use crate::{runtime::threads::ThreadRef, Runtime};
use self::object_monitor::ObjectMonitor;

pub mod basic_lock;
pub mod lock_stack;
pub mod monitor_list;
pub mod object_monitor;
pub mod object_waiter;
pub mod spin_lock;

/// Conditions a caller of a monitor operation has to handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MonitorError {
    /// The calling thread does not own the monitor.
    #[error("current thread is not owner")]
    NotOwner,
    /// The wait was interrupted. Reported only once the monitor is owned again.
    #[error("wait interrupted")]
    Interrupted,
}

/// How a wait ended when it was not interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Notified,
    TimedOut,
}

/// RAII ownership of an inflated monitor.
///
/// Dropping the guard exits the monitor once. Nested guards on the same
/// monitor are reentrant.
pub struct ObjectMonitorGuard<'a, R: Runtime> {
    monitor: &'a ObjectMonitor<R>,
    thread: &'a ThreadRef<R>,
}

impl<'a, R: Runtime> ObjectMonitorGuard<'a, R> {
    /// Enter `monitor`. Returns `None` if the monitor is being deflated; the
    /// caller has to look up the object's current monitor and try again.
    pub fn lock(monitor: &'a ObjectMonitor<R>, thread: &'a ThreadRef<R>) -> Option<Self> {
        if monitor.enter(thread) {
            Some(Self { monitor, thread })
        } else {
            None
        }
    }

    pub fn monitor(&self) -> &'a ObjectMonitor<R> {
        self.monitor
    }

    /// Wait on the monitor for up to `millis` milliseconds, `0` meaning
    /// forever. Ownership and recursion depth are restored on return.
    pub fn wait(&self, millis: u64, interruptible: bool) -> Result<WaitOutcome, MonitorError> {
        self.monitor.wait(self.thread, millis, interruptible)
    }

    pub fn notify(&self) -> Result<(), MonitorError> {
        self.monitor.notify(self.thread)
    }

    pub fn notify_all(&self) -> Result<(), MonitorError> {
        self.monitor.notify_all(self.thread)
    }
}

impl<R: Runtime> Drop for ObjectMonitorGuard<'_, R> {
    fn drop(&mut self) {
        self.monitor.exit(self.thread);
    }
}
