use std::{
    ptr::null_mut,
    sync::atomic::{AtomicBool, AtomicIsize, AtomicPtr, AtomicU64, AtomicU8, Ordering},
};

use crate::{
    runtime::threads::{Thread, ThreadRef},
    Runtime,
};

/// Where a waiter currently is.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TStates {
    Undef = 0,
    Ready = 1,
    /// Not on any queue.
    Run = 2,
    /// On the wait set.
    Wait = 3,
    /// On the entry list.
    Enter = 4,
    /// On the contention queue.
    Cxq = 5,
}

impl From<u8> for TStates {
    fn from(value: u8) -> Self {
        match value {
            0 => Self::Undef,
            1 => Self::Ready,
            2 => Self::Run,
            3 => Self::Wait,
            4 => Self::Enter,
            5 => Self::Cxq,
            _ => unreachable!("invalid waiter state {value}"),
        }
    }
}

/// Proxy for a thread blocked on a monitor. Lives on the heap for exactly
/// one enter or wait cycle so that its address stays stable while linked.
pub struct ObjectWaiter<R: Runtime> {
    pub(crate) next: AtomicPtr<Self>,
    pub(crate) prev: AtomicPtr<Self>,
    thread: ThreadRef<R>,
    lock_id: u64,
    notifier_tid: AtomicU64,
    tstate: AtomicU8,
    notified: AtomicBool,
    /// Saved recursion depth of a cooperative wait.
    pub(crate) recursions: AtomicIsize,
    is_wait: bool,
    interruptible: bool,
    at_reenter: AtomicBool,
    interrupted: AtomicBool,
    active: AtomicBool,
    /// Blocked cooperatively; woken through the scheduler instead of a park.
    is_vthread: bool,
}

impl<R: Runtime> ObjectWaiter<R> {
    pub(crate) fn new(thread: ThreadRef<R>) -> Box<Self> {
        Self::build(thread, false, false, true)
    }

    pub(crate) fn new_vthread(thread: ThreadRef<R>, is_wait: bool, interruptible: bool) -> Box<Self> {
        Self::build(thread, true, is_wait, interruptible)
    }

    fn build(thread: ThreadRef<R>, is_vthread: bool, is_wait: bool, interruptible: bool) -> Box<Self> {
        let lock_id = thread.lock_id();
        Box::new(Self {
            next: AtomicPtr::new(null_mut()),
            prev: AtomicPtr::new(null_mut()),
            thread,
            lock_id,
            notifier_tid: AtomicU64::new(0),
            tstate: AtomicU8::new(TStates::Run as _),
            notified: AtomicBool::new(false),
            recursions: AtomicIsize::new(0),
            is_wait,
            interruptible,
            at_reenter: AtomicBool::new(false),
            interrupted: AtomicBool::new(false),
            active: AtomicBool::new(false),
            is_vthread,
        })
    }

    pub fn thread(&self) -> &ThreadRef<R> {
        &self.thread
    }

    pub fn lock_id(&self) -> u64 {
        self.lock_id
    }

    pub fn tstate(&self) -> TStates {
        TStates::from(self.tstate.load(Ordering::Acquire))
    }

    pub(crate) fn set_tstate(&self, state: TStates) {
        self.tstate.store(state as u8, Ordering::Release);
    }

    pub fn notified(&self) -> bool {
        self.notified.load(Ordering::Acquire)
    }

    pub(crate) fn set_notified(&self, notifier: u64) {
        self.notifier_tid.store(notifier, Ordering::Relaxed);
        self.notified.store(true, Ordering::Release);
    }

    /// Lock id of the thread that notified this waiter, `0` if none did.
    pub fn notifier_tid(&self) -> u64 {
        self.notifier_tid.load(Ordering::Relaxed)
    }

    pub fn is_wait(&self) -> bool {
        self.is_wait
    }

    pub fn is_interruptible(&self) -> bool {
        self.interruptible
    }

    pub fn is_vthread(&self) -> bool {
        self.is_vthread
    }

    pub fn at_reenter(&self) -> bool {
        self.at_reenter.load(Ordering::Relaxed)
    }

    pub(crate) fn set_at_reenter(&self) {
        self.at_reenter.store(true, Ordering::Relaxed);
    }

    pub fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Relaxed)
    }

    pub(crate) fn set_interrupted(&self, value: bool) {
        self.interrupted.store(value, Ordering::Relaxed);
    }

    pub(crate) fn next(&self) -> *mut Self {
        self.next.load(Ordering::Acquire)
    }

    pub(crate) fn set_next(&self, next: *mut Self) {
        self.next.store(next, Ordering::Release);
    }

    pub(crate) fn prev(&self) -> *mut Self {
        self.prev.load(Ordering::Acquire)
    }

    pub(crate) fn set_prev(&self, prev: *mut Self) {
        self.prev.store(prev, Ordering::Release);
    }

    /// A notified waiter moves onto the entry path and becomes an entrant.
    pub(crate) fn wait_reenter_begin(&self) {
        self.active.store(true, Ordering::Relaxed);
    }

    pub(crate) fn wait_reenter_end(&self) {
        self.active.store(false, Ordering::Relaxed);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }
}
