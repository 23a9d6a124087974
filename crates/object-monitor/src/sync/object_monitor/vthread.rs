//! Monitor operations for virtual threads that yield instead of parking.
//!
//! A blocked virtual thread gets a [`MonitorContinuation`] back. Its
//! scheduler keeps the continuation while the thread is unmounted and calls
//! [`MonitorContinuation::resume`] once the thread was handed back through
//! [`Thread::unblock_virtual`], its wait deadline passed, it was interrupted,
//! or, for the responsible thread, its recheck interval elapsed. Resuming is
//! always safe: a thread that still cannot proceed gets a new continuation.

use std::{
    fmt,
    ptr::{self, NonNull},
    sync::atomic::{fence, Ordering},
    time::{Duration, Instant},
};

use super::{enter::TryLockResult, ContentionMark, ObjectMonitor, NO_OWNER};
use crate::{
    runtime::{
        options::monitorflags_max_recheck_interval,
        threads::{Thread, ThreadRef},
    },
    sync::{
        object_waiter::{ObjectWaiter, TStates},
        MonitorError, WaitOutcome,
    },
    Runtime,
};

pub enum VThreadEnter<R: Runtime> {
    Acquired,
    /// Yield to the scheduler and resume the continuation later.
    Blocked(MonitorContinuation<R>),
    /// The monitor is being deflated; retry with the object's new monitor.
    Deflating,
}

pub enum Resume<R: Runtime> {
    Entered,
    /// A wait finished and the monitor is owned again.
    Waited(Result<WaitOutcome, MonitorError>),
    Blocked(MonitorContinuation<R>),
}

/// State of a virtual thread suspended inside a monitor operation.
///
/// Holds the thread's waiter node, which stays linked on the monitor's
/// queues until the operation completes. A continuation must be resumed
/// until it completes; dropping one leaves the node queued and leaks it.
pub struct MonitorContinuation<R: Runtime> {
    monitor: NonNull<ObjectMonitor<R>>,
    node: NonNull<ObjectWaiter<R>>,
    deadline: Option<Instant>,
    recheck_interval: Option<Duration>,
}

// SAFETY: the node and the monitor are shared with other threads through
// atomics only; the continuation is just a handle to them.
unsafe impl<R: Runtime> Send for MonitorContinuation<R> {}

impl<R: Runtime> MonitorContinuation<R> {
    fn node(&self) -> &ObjectWaiter<R> {
        // SAFETY: the node is freed only when the operation completes, which
        // consumes the continuation.
        unsafe { self.node.as_ref() }
    }

    pub fn monitor(&self) -> &ObjectMonitor<R> {
        // SAFETY: a pending operation holds a contention or a waiter count,
        // both of which keep the monitor from being deflated.
        unsafe { self.monitor.as_ref() }
    }

    pub fn state(&self) -> TStates {
        self.node().tstate()
    }

    /// Recursion depth a pending wait restores.
    pub fn recursions(&self) -> isize {
        self.node().recursions.load(Ordering::Relaxed)
    }

    pub fn is_wait(&self) -> bool {
        self.node().is_wait()
    }

    /// Time at which a timed wait should be resumed regardless of
    /// notifications. Cleared once the thread is back on the entry path.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Set for the responsible thread, which must be resumed periodically to
    /// guard against a missed wakeup.
    pub fn recheck_interval(&self) -> Option<Duration> {
        self.recheck_interval
    }

    pub fn resume(self, vthread: &ThreadRef<R>) -> Resume<R> {
        let monitor = self.monitor;
        // SAFETY: see `monitor`.
        unsafe { monitor.as_ref() }.resume_operation(vthread, self)
    }
}

impl<R: Runtime> fmt::Debug for MonitorContinuation<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MonitorContinuation")
            .field("monitor", &self.monitor)
            .field("thread", &self.node().lock_id())
            .field("state", &self.state())
            .field("is_wait", &self.is_wait())
            .field("deadline", &self.deadline)
            .field("recheck_interval", &self.recheck_interval)
            .finish()
    }
}

impl<R: Runtime> fmt::Debug for VThreadEnter<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Acquired => f.write_str("Acquired"),
            Self::Blocked(cont) => f.debug_tuple("Blocked").field(cont).finish(),
            Self::Deflating => f.write_str("Deflating"),
        }
    }
}

impl<R: Runtime> fmt::Debug for Resume<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Entered => f.write_str("Entered"),
            Self::Waited(result) => f.debug_tuple("Waited").field(result).finish(),
            Self::Blocked(cont) => f.debug_tuple("Blocked").field(cont).finish(),
        }
    }
}

impl<R: Runtime> ObjectMonitor<R> {
    /// Enter without blocking the carrier. On [`VThreadEnter::Blocked`] the
    /// virtual thread is queued like any other entrant and is handed back
    /// through [`Thread::unblock_virtual`] when it is picked as successor.
    pub fn vthread_enter(&self, vthread: &ThreadRef<R>) -> VThreadEnter<R> {
        if self.spin_enter(vthread) {
            return VThreadEnter::Acquired;
        }

        let _mark = ContentionMark::new(self);
        if self.is_being_async_deflated() {
            return VThreadEnter::Deflating;
        }

        let node = ObjectWaiter::new_vthread(vthread.clone(), false, true);
        match self.vthread_monitor_enter(vthread, node) {
            Ok(_node) => VThreadEnter::Acquired,
            Err(node) => VThreadEnter::Blocked(MonitorContinuation {
                monitor: NonNull::from(self),
                node,
                deadline: None,
                recheck_interval: self.recheck_interval_for(vthread.lock_id(), None),
            }),
        }
    }

    /// Wait without blocking the carrier. The monitor is released before
    /// this returns; resume the continuation to complete the wait.
    pub fn vthread_wait(
        &self,
        vthread: &ThreadRef<R>,
        millis: u64,
        interruptible: bool,
    ) -> Result<MonitorContinuation<R>, MonitorError> {
        self.check_owner(vthread)?;

        if interruptible && vthread.tls().clear_interrupt() {
            return Err(MonitorError::Interrupted);
        }

        let node = NonNull::from(Box::leak(ObjectWaiter::new_vthread(
            vthread.clone(),
            true,
            interruptible,
        )));
        // SAFETY: freed when the wait completes.
        let node_ref = unsafe { node.as_ref() };
        node_ref.set_tstate(TStates::Wait);

        {
            let _guard = self.wait_set_lock.lock();
            self.add_waiter(node.as_ptr());
        }

        node_ref
            .recursions
            .store(self.recursions.swap(0, Ordering::Relaxed), Ordering::Relaxed);
        self.waiters.fetch_add(1, Ordering::SeqCst);
        self.exit(vthread);

        Ok(MonitorContinuation {
            monitor: NonNull::from(self),
            node,
            deadline: (millis != 0).then(|| Instant::now() + Duration::from_millis(millis)),
            recheck_interval: None,
        })
    }

    /// Continue a blocked enter or wait of `vthread`.
    pub fn resume_operation(&self, vthread: &ThreadRef<R>, cont: MonitorContinuation<R>) -> Resume<R> {
        assert!(
            ptr::eq(cont.monitor.as_ptr(), self),
            "continuation belongs to another monitor"
        );
        let node = cont.node;
        // SAFETY: see `MonitorContinuation::node`.
        let node_ref = unsafe { node.as_ref() };
        assert_eq!(node_ref.lock_id(), vthread.lock_id());

        if node_ref.is_wait() && !node_ref.at_reenter() {
            if node_ref.tstate() == TStates::Wait && !self.vthread_wait_over(vthread, &cont) {
                return Resume::Blocked(cont);
            }

            if !self.vthread_wait_reenter(vthread, node_ref) {
                // Timed out or interrupted: contend like a fresh entrant.
                // SAFETY: off the wait set and not yet on an entry queue.
                let boxed = unsafe { Box::from_raw(node.as_ptr()) };
                return match self.vthread_monitor_enter(vthread, boxed) {
                    Ok(node) => self.vthread_acquired(node),
                    // Off the wait set: only an exit or the recheck timer
                    // makes it runnable again.
                    Err(node) => Resume::Blocked(MonitorContinuation {
                        node,
                        deadline: None,
                        recheck_interval: self.recheck_interval_for(vthread.lock_id(), None),
                        ..cont
                    }),
                };
            }
        }

        let state = node_ref.tstate();
        assert!(
            matches!(state, TStates::Enter | TStates::Cxq),
            "unexpected waiter state {state:?}"
        );

        if self.try_lock(vthread) == TryLockResult::Success {
            return self.vthread_epilog(vthread, node);
        }

        self.clear_successor_if(vthread.lock_id());
        fence(Ordering::SeqCst);

        if self.try_lock(vthread) == TryLockResult::Success {
            return self.vthread_epilog(vthread, node);
        }

        let recheck_interval = self.recheck_interval_for(vthread.lock_id(), cont.recheck_interval);
        Resume::Blocked(MonitorContinuation {
            deadline: None,
            recheck_interval,
            ..cont
        })
    }

    /// Has a wait that is still on the wait set ended?
    fn vthread_wait_over(&self, vthread: &ThreadRef<R>, cont: &MonitorContinuation<R>) -> bool {
        let interrupted = cont.node().is_interruptible() && vthread.tls().is_interrupted();
        let expired = cont.deadline.map_or(false, |deadline| Instant::now() >= deadline);
        interrupted || expired
    }

    /// Leave the wait set if still on it. Returns whether the waiter was
    /// notified, in which case its node is already on the entry path.
    fn vthread_wait_reenter(&self, vthread: &ThreadRef<R>, node: &ObjectWaiter<R>) -> bool {
        if node.tstate() == TStates::Wait {
            let _guard = self.wait_set_lock.lock();
            if node.tstate() == TStates::Wait {
                self.dequeue_specific_waiter(node as *const _ as *mut _);
                node.set_tstate(TStates::Run);
            }
        }

        let was_notified = node.notified();
        if !was_notified && node.is_interruptible() && vthread.tls().clear_interrupt() {
            node.set_interrupted(true);
        }
        node.set_at_reenter();

        if was_notified {
            // Count as contending while on the entry path.
            self.add_to_contentions(1);
        }
        was_notified
    }

    /// Queue `node` on the cxq unless the monitor can be taken right away.
    /// `Ok` hands back an unlinked node and means the monitor is owned;
    /// `Err` means the node is queued and counts as a contention.
    fn vthread_monitor_enter(
        &self,
        current: &ThreadRef<R>,
        node: Box<ObjectWaiter<R>>,
    ) -> Result<Box<ObjectWaiter<R>>, NonNull<ObjectWaiter<R>>> {
        let id = current.lock_id();
        if self.try_lock(current) == TryLockResult::Success {
            return Ok(node);
        }

        let node = NonNull::from(Box::leak(node));
        // SAFETY: owned by us until published, then kept alive by the queue.
        let node_ref = unsafe { node.as_ref() };
        node_ref.set_tstate(TStates::Cxq);

        loop {
            let nxt = self.cxq.load(Ordering::Acquire);
            node_ref.set_next(nxt);
            if self
                .cxq
                .compare_exchange(nxt, node.as_ptr(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                if nxt.is_null() && self.entry_list.load(Ordering::Acquire).is_null() {
                    let _ = self.responsible.compare_exchange(
                        NO_OWNER,
                        id,
                        Ordering::SeqCst,
                        Ordering::SeqCst,
                    );
                }
                break;
            }

            if self.try_lock(current) == TryLockResult::Success {
                node_ref.set_tstate(TStates::Run);
                // SAFETY: never published.
                return Ok(unsafe { Box::from_raw(node.as_ptr()) });
            }
        }

        // An exit may have run before our push became visible.
        if self.try_lock(current) == TryLockResult::Success {
            self.unlink_after_acquire(current, node_ref);
            self.clear_successor_if(id);
            self.clear_responsible_if(id);
            // SAFETY: unlinked.
            return Ok(unsafe { Box::from_raw(node.as_ptr()) });
        }

        self.add_to_contentions(1);
        Err(node)
    }

    /// `vthread` acquired the monitor while its node was queued.
    fn vthread_epilog(&self, vthread: &ThreadRef<R>, node: NonNull<ObjectWaiter<R>>) -> Resume<R> {
        let id = vthread.lock_id();
        self.add_to_contentions(-1);
        self.clear_successor_if(id);
        // SAFETY: see `MonitorContinuation::node`.
        self.unlink_after_acquire(vthread, unsafe { node.as_ref() });
        self.clear_responsible_if(id);

        // SAFETY: unlinked above, and the continuation was consumed.
        self.vthread_acquired(unsafe { Box::from_raw(node.as_ptr()) })
    }

    fn vthread_acquired(&self, node: Box<ObjectWaiter<R>>) -> Resume<R> {
        debug_assert!(self.is_owner(node.thread()));
        if !node.is_wait() {
            return Resume::Entered;
        }

        self.recursions
            .store(node.recursions.load(Ordering::Relaxed), Ordering::Relaxed);
        self.waiters.fetch_sub(1, Ordering::SeqCst);

        let result = if node.notified() {
            Ok(WaitOutcome::Notified)
        } else if node.interrupted() {
            Err(MonitorError::Interrupted)
        } else {
            Ok(WaitOutcome::TimedOut)
        };
        Resume::Waited(result)
    }

    fn clear_responsible_if(&self, id: u64) {
        if self.responsible() == id {
            self.responsible.store(NO_OWNER, Ordering::Relaxed);
            fence(Ordering::SeqCst);
        }
    }

    /// The responsible thread backs off exponentially, everybody else waits
    /// to be unblocked.
    fn recheck_interval_for(&self, id: u64, previous: Option<Duration>) -> Option<Duration> {
        if self.responsible() != id {
            return None;
        }

        let max = Duration::from_millis(monitorflags_max_recheck_interval().max(1) as u64);
        Some(match previous {
            None => Duration::from_millis(1),
            Some(previous) => (previous * 8).min(max),
        })
    }
}
