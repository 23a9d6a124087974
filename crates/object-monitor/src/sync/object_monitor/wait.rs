use std::{
    hint::spin_loop,
    ptr::null_mut,
    sync::atomic::{fence, Ordering},
    time::{Duration, Instant},
};

use super::ObjectMonitor;
use crate::{
    runtime::threads::{state_scope, Thread, ThreadRef, ThreadState},
    sync::{
        object_waiter::{ObjectWaiter, TStates},
        MonitorError, WaitOutcome,
    },
    Runtime, ThreadOf,
};

impl<R: Runtime> ObjectMonitor<R> {
    /// Release the monitor and block until notified, interrupted (if
    /// `interruptible`) or until `millis` milliseconds passed. `0` waits
    /// forever.
    ///
    /// The monitor is owned again, at the original recursion depth, whenever
    /// this returns, except for the [`MonitorError::NotOwner`] case.
    pub fn wait(
        &self,
        current: &ThreadRef<R>,
        millis: u64,
        interruptible: bool,
    ) -> Result<WaitOutcome, MonitorError> {
        self.check_owner(current)?;

        let id = current.lock_id();
        let tls = current.tls();

        if interruptible && tls.clear_interrupt() {
            return Err(MonitorError::Interrupted);
        }

        tls.current_waiting_monitor
            .store(self as *const Self as usize, Ordering::Relaxed);

        let node = Box::into_raw(ObjectWaiter::new(current.clone()));
        // SAFETY: freed below, once it is off every queue.
        let node_ref = unsafe { &*node };
        node_ref.set_tstate(TStates::Wait);
        tls.park_event.reset();
        fence(Ordering::SeqCst);

        {
            let _guard = self.wait_set_lock.lock();
            self.add_waiter(node);
        }

        let save = self.recursions.swap(0, Ordering::Relaxed);
        self.waiters.fetch_add(1, Ordering::SeqCst);
        self.exit(current);
        debug_assert!(!self.is_owner(current));

        let deadline = (millis != 0).then(|| Instant::now() + Duration::from_millis(millis));
        let state = if deadline.is_some() {
            ThreadState::InTimedObjectWait
        } else {
            ThreadState::InObjectWait
        };

        state_scope(tls, state, || {
            while node_ref.tstate() == TStates::Wait {
                if interruptible && tls.is_interrupted() {
                    break;
                }

                match deadline {
                    None => tls.park_event.park(),
                    Some(deadline) => {
                        let now = Instant::now();
                        if now >= deadline {
                            break;
                        }
                        tls.park_event.park_for(deadline - now);
                    }
                }
            }
        });

        // Timed out or interrupted: take ourselves off the wait set unless a
        // notification moved us first.
        if node_ref.tstate() == TStates::Wait {
            let _guard = self.wait_set_lock.lock();
            if node_ref.tstate() == TStates::Wait {
                self.dequeue_specific_waiter(node);
                node_ref.set_tstate(TStates::Run);
            }
        }

        self.clear_successor_if(id);
        let was_notified = node_ref.notified();
        let notifier = node_ref.notifier_tid();
        fence(Ordering::SeqCst);

        if node_ref.tstate() == TStates::Run {
            // We hold `waiters`, so the monitor cannot be deflated and a
            // failed enter only means a deflater is backing out.
            while !self.enter(current) {
                spin_loop();
            }
        } else {
            debug_assert!(node_ref.is_active());
            self.reenter_i(current, node_ref);
            node_ref.wait_reenter_end();
        }

        debug_assert!(self.is_owner(current));
        debug_assert_eq!(node_ref.tstate(), TStates::Run);
        // SAFETY: off every queue.
        drop(unsafe { Box::from_raw(node) });

        tls.current_waiting_monitor.store(0, Ordering::Relaxed);
        self.recursions.store(save, Ordering::Relaxed);
        self.waiters.fetch_sub(1, Ordering::SeqCst);

        if was_notified {
            log::trace!(
                target: "monitorinflation",
                "wait: mid={:p}, thread={} notified by {}",
                self,
                id,
                notifier
            );
            return Ok(WaitOutcome::Notified);
        }

        if interruptible && tls.clear_interrupt() {
            return Err(MonitorError::Interrupted);
        }

        Ok(WaitOutcome::TimedOut)
    }

    /// Move the longest waiting thread, if any, onto the entry path.
    pub fn notify(&self, current: &ThreadOf<R>) -> Result<(), MonitorError> {
        self.check_owner(current)?;
        if self.wait_set.load(Ordering::Acquire).is_null() {
            return Ok(());
        }

        self.i_notify(current);
        Ok(())
    }

    /// Move every waiting thread onto the entry path, in wait order.
    pub fn notify_all(&self, current: &ThreadOf<R>) -> Result<(), MonitorError> {
        self.check_owner(current)?;

        let mut tally = 0;
        while !self.wait_set.load(Ordering::Acquire).is_null() {
            if self.i_notify(current) {
                tally += 1;
            }
        }

        if tally > 0 {
            log::trace!(target: "monitorinflation", "notify_all: mid={:p} moved {}", self, tally);
        }
        Ok(())
    }

    fn i_notify(&self, current: &ThreadOf<R>) -> bool {
        let _guard = self.wait_set_lock.lock();
        let iterator = self.dequeue_waiter();
        if iterator.is_null() {
            return false;
        }

        // SAFETY: a waiter frees its node only after it left every queue,
        // and it cannot leave the wait set while we hold the lock.
        let w = unsafe { &*iterator };
        debug_assert_eq!(w.tstate(), TStates::Wait);
        debug_assert!(!w.notified());
        w.set_notified(current.lock_id());

        if self.entry_list.load(Ordering::Acquire).is_null() {
            w.set_next(null_mut());
            w.set_prev(null_mut());
            w.set_tstate(TStates::Enter);
            self.entry_list.store(iterator, Ordering::Release);
        } else {
            w.set_tstate(TStates::Cxq);
            loop {
                let front = self.cxq.load(Ordering::Acquire);
                w.set_next(front);
                if self
                    .cxq
                    .compare_exchange(front, iterator, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break;
                }
            }
        }

        w.wait_reenter_begin();
        true
    }

    // The wait set is a circular doubly linked list. Callers of the three
    // functions below hold `wait_set_lock`.

    pub(crate) fn add_waiter(&self, node: *mut ObjectWaiter<R>) {
        debug_assert!(self.wait_set_lock.is_locked());
        // SAFETY: `node` and every node on the wait set are alive.
        unsafe {
            let head = self.wait_set.load(Ordering::Acquire);
            if head.is_null() {
                (*node).set_prev(node);
                (*node).set_next(node);
                self.wait_set.store(node, Ordering::Release);
            } else {
                let tail = (*head).prev();
                debug_assert_eq!((*tail).next(), head);
                (*tail).set_next(node);
                (*head).set_prev(node);
                (*node).set_next(head);
                (*node).set_prev(tail);
            }
        }
    }

    pub(crate) fn dequeue_waiter(&self) -> *mut ObjectWaiter<R> {
        let waiter = self.wait_set.load(Ordering::Acquire);
        if !waiter.is_null() {
            self.dequeue_specific_waiter(waiter);
        }
        waiter
    }

    pub(crate) fn dequeue_specific_waiter(&self, node: *mut ObjectWaiter<R>) {
        debug_assert!(self.wait_set_lock.is_locked());
        // SAFETY: `node` is on the wait set.
        unsafe {
            let next = (*node).next();
            if next == node {
                debug_assert_eq!((*node).prev(), node);
                self.wait_set.store(null_mut(), Ordering::Release);
            } else {
                let prev = (*node).prev();
                (*next).set_prev(prev);
                (*prev).set_next(next);
                if self.wait_set.load(Ordering::Acquire) == node {
                    self.wait_set.store(next, Ordering::Release);
                }
            }
            (*node).set_next(null_mut());
            (*node).set_prev(null_mut());
        }
    }
}
