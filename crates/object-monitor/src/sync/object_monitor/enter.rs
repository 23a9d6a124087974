use std::{
    hint::spin_loop,
    ptr::null_mut,
    sync::atomic::{fence, Ordering},
    time::Duration,
};

use super::{ContentionMark, ObjectMonitor, ANONYMOUS_OWNER, DEFLATER_MARKER, NO_OWNER};
use crate::{
    runtime::{
        options::{monitorflags_max_recheck_interval, SpinKnobs},
        threads::{state_scope, Thread, ThreadRef, ThreadState},
    },
    sync::object_waiter::{ObjectWaiter, TStates},
    Runtime, ThreadOf,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum TryLockResult {
    /// The monitor was free but another thread won the CAS.
    Interference,
    HasOwner,
    Success,
}

impl<R: Runtime> ObjectMonitor<R> {
    pub(crate) fn try_lock(&self, current: &ThreadOf<R>) -> TryLockResult {
        if self.owner_raw() != NO_OWNER {
            return TryLockResult::HasOwner;
        }

        if self.cas_owner(NO_OWNER, current.lock_id()) == NO_OWNER {
            debug_assert_eq!(self.recursions(), 0);
            TryLockResult::Success
        } else {
            TryLockResult::Interference
        }
    }

    /// Acquire the monitor with a single compare-and-swap, or enter it
    /// recursively if `current` already owns it. Never blocks.
    pub fn try_enter(&self, current: &ThreadOf<R>) -> bool {
        let id = current.lock_id();
        let prev = self.cas_owner(NO_OWNER, id);
        if prev == NO_OWNER {
            debug_assert_eq!(self.recursions(), 0);
            return true;
        }

        if prev == id {
            self.recursions.fetch_add(1, Ordering::Relaxed);
            return true;
        }

        false
    }

    /// Acquire the monitor, blocking if necessary.
    ///
    /// Returns `false` if the monitor is being deflated. The caller must then
    /// look up the object's current monitor and try again.
    #[must_use]
    pub fn enter(&self, current: &ThreadRef<R>) -> bool {
        if self.spin_enter(current) {
            return true;
        }

        debug_assert!(!self.is_owner(current));

        // Keeps `is_being_async_deflated` stable for the rest of enter.
        let mark = ContentionMark::new(self);
        if self.is_being_async_deflated() {
            return false;
        }

        self.enter_with_contention_mark(current, &mark);
        true
    }

    pub(crate) fn spin_enter(&self, current: &ThreadOf<R>) -> bool {
        if self.try_enter(current) {
            return true;
        }

        if self.is_being_async_deflated() {
            return false;
        }

        self.try_spin(current)
    }

    fn enter_with_contention_mark(&self, current: &ThreadRef<R>, _mark: &ContentionMark<'_, R>) {
        debug_assert!(!self.is_being_async_deflated());
        log::trace!(
            target: "monitorinflation",
            "enter: contended mid={:p}, thread={}",
            self,
            current.lock_id()
        );

        let tls = current.tls();
        tls.current_pending_monitor
            .store(self as *const Self as usize, Ordering::Relaxed);
        state_scope(tls, ThreadState::BlockedOnMonitorEnter, || self.enter_i(current));
        tls.current_pending_monitor.store(0, Ordering::Relaxed);

        debug_assert!(self.is_owner(current));
        debug_assert!(self.contentions() > 0);
    }

    fn enter_i(&self, current: &ThreadRef<R>) {
        let id = current.lock_id();

        if self.try_lock(current) == TryLockResult::Success {
            return;
        }

        if self.try_spin(current) {
            return;
        }

        // The spin failed: enqueue and park.
        let node = Box::into_raw(ObjectWaiter::new(current.clone()));
        // SAFETY: the node is freed at the end of this function, after it was
        // unlinked from every queue.
        let node_ref = unsafe { &*node };
        current.tls().park_event.reset();
        node_ref.set_tstate(TStates::Cxq);

        let mut nxt;
        loop {
            nxt = self.cxq.load(Ordering::Acquire);
            node_ref.set_next(nxt);
            if self
                .cxq
                .compare_exchange(nxt, node, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }

            // The cxq changed under us. The lock may have been released too.
            if self.try_lock(current) == TryLockResult::Success {
                // SAFETY: never published.
                drop(unsafe { Box::from_raw(node) });
                return;
            }
        }

        // Onset of contention: try to become the thread that guards against
        // stranding by parking with a timeout.
        if nxt.is_null() && self.entry_list.load(Ordering::Acquire).is_null() {
            let _ = self.responsible.compare_exchange(
                NO_OWNER,
                id,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }

        let max_recheck_interval = monitorflags_max_recheck_interval().max(1) as u64;
        let mut recheck_interval = 1u64;

        loop {
            if self.try_lock(current) == TryLockResult::Success {
                break;
            }
            debug_assert!(!self.is_owner(current));

            if self.responsible() == id {
                current
                    .tls()
                    .park_event
                    .park_for(Duration::from_millis(recheck_interval));
                recheck_interval = (recheck_interval * 8).min(max_recheck_interval);
            } else {
                current.tls().park_event.park();
            }

            if self.try_lock(current) == TryLockResult::Success {
                break;
            }

            // Futile wakeup.
            if self.try_spin(current) {
                break;
            }

            // We may have been made successor while spinning.
            self.clear_successor_if(id);
            // After clearing succ a thread must retry the owner before parking.
            fence(Ordering::SeqCst);
        }

        debug_assert!(self.is_owner(current));
        self.unlink_after_acquire(current, node_ref);
        self.clear_successor_if(id);
        if self.responsible() == id {
            self.responsible.store(NO_OWNER, Ordering::Relaxed);
            fence(Ordering::SeqCst);
        }

        // SAFETY: unlinked above.
        drop(unsafe { Box::from_raw(node) });
    }

    /// Re-acquire the monitor after a wait. The node is already on the entry
    /// path, put there by a notification.
    pub(crate) fn reenter_i(&self, current: &ThreadRef<R>, node: &ObjectWaiter<R>) {
        let id = current.lock_id();
        let tls = current.tls();

        loop {
            let state = node.tstate();
            assert!(
                matches!(state, TStates::Enter | TStates::Cxq),
                "unexpected waiter state {state:?}"
            );
            debug_assert!(!self.is_owner(current));

            if self.try_lock(current) == TryLockResult::Success {
                break;
            }

            if self.try_spin(current) {
                break;
            }

            state_scope(tls, ThreadState::BlockedOnMonitorEnter, || {
                tls.park_event.park()
            });

            if self.try_lock(current) == TryLockResult::Success {
                break;
            }

            self.clear_successor_if(id);
            fence(Ordering::SeqCst);
        }

        debug_assert!(self.is_owner(current));
        self.unlink_after_acquire(current, node);
        self.clear_successor_if(id);
        node.set_tstate(TStates::Run);
        fence(Ordering::SeqCst);
    }

    /// Remove the node of `current`, which just acquired the monitor, from
    /// the entry list or the cxq.
    pub(crate) fn unlink_after_acquire(&self, current: &ThreadOf<R>, node: &ObjectWaiter<R>) {
        debug_assert!(self.is_owner(current));
        debug_assert_eq!(node.lock_id(), current.lock_id());
        let node_ptr = node as *const ObjectWaiter<R> as *mut ObjectWaiter<R>;

        // SAFETY (all dereferences below): queued nodes stay alive until their
        // thread unlinks them, which requires owning the monitor. We do.
        if node.tstate() == TStates::Enter {
            let nxt = node.next();
            let prv = node.prev();
            if !nxt.is_null() {
                unsafe { (*nxt).set_prev(prv) };
            }
            if !prv.is_null() {
                unsafe { (*prv).set_next(nxt) };
            }
            if self.entry_list.load(Ordering::Acquire) == node_ptr {
                self.entry_list.store(nxt, Ordering::Release);
            }
        } else {
            assert_eq!(node.tstate(), TStates::Cxq);
            // Still on the cxq: the push raced an exiting owner. Dequeue from
            // the head with a CAS or from the interior with a scan.
            let mut v = self.cxq.load(Ordering::Acquire);
            assert!(!v.is_null());
            if v != node_ptr
                || self
                    .cxq
                    .compare_exchange(v, node.next(), Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
            {
                // Only a new arrival can make the CAS fail, so the node is
                // now in the interior.
                if v == node_ptr {
                    v = self.cxq.load(Ordering::Acquire);
                }
                let mut q: *mut ObjectWaiter<R> = null_mut();
                let mut p = v;
                while !p.is_null() && p != node_ptr {
                    q = p;
                    p = unsafe { (*p).next() };
                }
                assert_eq!(p, node_ptr, "node not found on cxq");
                assert!(!q.is_null());
                unsafe { (*q).set_next(node.next()) };
            }
        }

        node.set_prev(null_mut());
        node.set_next(null_mut());
        node.set_tstate(TStates::Run);
    }

    /// Adaptive spin. Returns `true` if the monitor was acquired.
    pub(crate) fn try_spin(&self, current: &ThreadOf<R>) -> bool {
        let knobs = SpinKnobs::current();
        let id = current.lock_id();

        if knobs.fixed != 0 {
            for _ in 0..knobs.fixed {
                if self.try_lock(current) == TryLockResult::Success {
                    return true;
                }
                spin_loop();
            }
            return false;
        }

        for _ in 0..=knobs.pre_spin {
            if self.try_lock(current) == TryLockResult::Success {
                self.spin_duration
                    .store(knobs.adjust_up(self.spin_duration()), Ordering::Relaxed);
                return true;
            }
            spin_loop();
        }

        let mut ctr = self.spin_duration();
        if ctr <= 0 {
            return false;
        }

        if self.successor() == NO_OWNER {
            self.succ.store(id, Ordering::Relaxed);
        }

        let mut prv = NO_OWNER;
        loop {
            ctr -= 1;
            if ctr < 0 {
                break;
            }

            if (ctr & 0xFF) == 0 {
                spin_loop();
            }

            let ox = self.owner_raw();
            if ox == NO_OWNER {
                if self.cas_owner(NO_OWNER, id) == NO_OWNER {
                    self.clear_successor_if(id);
                    self.spin_duration
                        .store(knobs.adjust_up(self.spin_duration()), Ordering::Relaxed);
                    return true;
                }
                // Lost the race for a free lock: odds are poor, stop spinning.
                break;
            }

            // Ownership changed hands.
            if ox != prv && prv != NO_OWNER {
                break;
            }
            prv = ox;

            if self.successor() == NO_OWNER {
                self.succ.store(id, Ordering::Relaxed);
            }
        }

        self.spin_duration
            .store(knobs.adjust_down(self.spin_duration()), Ordering::Relaxed);

        if self.successor() == id {
            self.succ.store(NO_OWNER, Ordering::Relaxed);
            // After clearing succ a thread must retry the owner before parking.
            fence(Ordering::SeqCst);
            if self.try_lock(current) == TryLockResult::Success {
                return true;
            }
        }

        false
    }

    /// Enter on behalf of `locking_thread`, which is either the caller or
    /// suspended. Only contends with deflation; returns `false` if the
    /// monitor is being deflated.
    #[must_use]
    pub fn enter_for(&self, locking_thread: &ThreadOf<R>) -> bool {
        // Block out deflation as soon as possible.
        let _mark = ContentionMark::new(self);
        if self.is_being_async_deflated() {
            return false;
        }

        let id = locking_thread.lock_id();
        loop {
            let prev = self.cas_owner(NO_OWNER, id);
            if prev == NO_OWNER {
                debug_assert_eq!(self.recursions(), 0);
                return true;
            }

            if prev == id {
                self.recursions.fetch_add(1, Ordering::Relaxed);
                return true;
            }

            if prev == ANONYMOUS_OWNER && self.owns_stack_locker(locking_thread) {
                debug_assert_eq!(self.recursions(), 0);
                self.set_owner_from_basic_lock(locking_thread);
                // The stack lock counts as the first level.
                self.recursions.store(1, Ordering::Relaxed);
                return true;
            }

            // A deflater backing out still holds the tombstone; our mark keeps
            // it from committing, so this is transient.
            if prev == DEFLATER_MARKER {
                spin_loop();
                continue;
            }

            panic!("failed to enter_for: thread={id}, observed owner {prev}");
        }
    }

    /// Re-acquire the monitor with a depth saved by
    /// [`complete_exit`](Self::complete_exit).
    #[must_use]
    pub fn reenter(&self, current: &ThreadRef<R>, recursions: isize) -> bool {
        assert!(!self.is_owner(current), "reenter already owner");
        if !self.enter(current) {
            return false;
        }

        assert_eq!(self.recursions(), 0, "reenter recursion");
        self.recursions.store(recursions, Ordering::Relaxed);
        true
    }
}
