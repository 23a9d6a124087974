use std::{
    ptr::null_mut,
    sync::atomic::{fence, Ordering},
};

use super::{ObjectMonitor, NO_OWNER};
use crate::{
    runtime::threads::Thread,
    sync::object_waiter::{ObjectWaiter, TStates},
    Runtime, ThreadOf,
};

impl<R: Runtime> ObjectMonitor<R> {
    /// Release one level of ownership. When the last level is released a
    /// successor is picked and woken, unless one is already awake.
    ///
    /// # Panics
    ///
    /// If `current` does not own the monitor.
    pub fn exit(&self, current: &ThreadOf<R>) {
        let id = current.lock_id();

        if !self.is_owner(current) {
            if self.owns_stack_locker(current) {
                // Transmute anonymous ownership from the stack lock into ours.
                self.set_owner_from_basic_lock(current);
                self.recursions.store(0, Ordering::Relaxed);
            } else {
                log::error!(
                    target: "monitorinflation",
                    "exit: thread {} is not the owner of {:?}",
                    id,
                    self
                );
                panic!("monitor exit by non-owner thread {id}");
            }
        }

        if self.recursions() != 0 {
            self.recursions.fetch_sub(1, Ordering::Relaxed);
            return;
        }

        self.previous_owner_tid.store(id, Ordering::Relaxed);
        if self.responsible() == id {
            self.responsible.store(NO_OWNER, Ordering::Relaxed);
        }

        self.release_and_wake(id);
    }

    /// Release the monitor regardless of its recursion depth. Returns the
    /// depth so it can be handed to [`reenter`](Self::reenter).
    pub fn complete_exit(&self, current: &ThreadOf<R>) -> isize {
        if !self.is_owner(current) && self.owns_stack_locker(current) {
            self.set_owner_from_basic_lock(current);
            self.recursions.store(0, Ordering::Relaxed);
        }
        assert!(self.is_owner(current), "complete_exit by non-owner");

        let save = self.recursions.swap(0, Ordering::Relaxed);
        self.exit(current);
        debug_assert!(!self.is_owner(current));
        save
    }

    /// Drop the owner field, which holds `owner`, and wake a successor if
    /// the queues are non-empty and nobody is already on the way.
    ///
    /// Also used by a deflater backing out: the tombstone is released like a
    /// regular owner so that nobody who queued meanwhile is stranded.
    pub(crate) fn release_and_wake(&self, owner: u64) {
        loop {
            self.release_clear_owner_raw(owner);
            // Publish the release before looking at the queues. Pairs with the
            // fence entrants run after clearing `succ`.
            fence(Ordering::SeqCst);

            if (self.entry_list.load(Ordering::Acquire).is_null()
                && self.cxq.load(Ordering::Acquire).is_null())
                || self.successor() != NO_OWNER
            {
                return;
            }

            // Somebody has to be woken. Only the thread that manages to
            // reacquire the lock may do it; if another thread got there first,
            // waking is now its job.
            if self.cas_owner(NO_OWNER, owner) != NO_OWNER {
                return;
            }

            let w = self.entry_list.load(Ordering::Acquire);
            if !w.is_null() {
                self.exit_epilog(owner, w);
                return;
            }

            let w = self.cxq.swap(null_mut(), Ordering::AcqRel);
            if w.is_null() {
                continue;
            }

            // Turn the detached cxq into the entry list, keeping its order.
            let mut q: *mut ObjectWaiter<R> = null_mut();
            let mut p = w;
            while !p.is_null() {
                // SAFETY: nodes on the queues stay alive until their thread
                // unlinks them while owning the monitor. We own it.
                let node = unsafe { &*p };
                assert_eq!(node.tstate(), TStates::Cxq);
                node.set_tstate(TStates::Enter);
                node.set_prev(q);
                q = p;
                p = node.next();
            }
            self.entry_list.store(w, Ordering::Release);

            if self.successor() != NO_OWNER {
                continue;
            }

            self.exit_epilog(owner, w);
            return;
        }
    }

    fn exit_epilog(&self, owner: u64, wakee: *mut ObjectWaiter<R>) {
        // SAFETY: `wakee` is on the entry list and we still own the monitor,
        // so it cannot be unlinked and freed before the release below.
        let wakee = unsafe { &*wakee };
        self.succ.store(wakee.lock_id(), Ordering::Relaxed);
        let thread = wakee.thread().clone();
        let is_vthread = wakee.is_vthread();

        // From here on `wakee` may be freed at any time.
        self.release_clear_owner_raw(owner);
        fence(Ordering::SeqCst);

        log::trace!(
            target: "monitorinflation",
            "exit: mid={:p} wakes thread {}",
            self,
            thread.lock_id()
        );
        if is_vthread {
            <ThreadOf<R> as Thread<R>>::unblock_virtual(&thread);
        } else {
            <ThreadOf<R> as Thread<R>>::unpark(&thread);
        }
    }
}
