use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};

use crate::{sync::basic_lock::BasicLock, Runtime, ThreadOf};

/// Shared handle to a runtime thread. Waiter nodes keep one so that a thread
/// can always be woken, even after it gave up ownership of a monitor.
pub type ThreadRef<R> = Arc<ThreadOf<R>>;

pub trait Thread<R: Runtime>: 'static + Send + Sync + Sized {
    fn tls(&self) -> &TLSData;

    /// Identity stored in the owner field of monitors held by this thread.
    fn lock_id(&self) -> u64 {
        self.tls().lock_id()
    }

    /// Is this a lightweight execution context multiplexed on carrier threads?
    fn is_virtual(&self) -> bool {
        false
    }

    /// Does the fast-locking path of this thread hold `obj`?
    fn lock_stack_contains(&self, obj: &R::Object) -> bool {
        let _ = obj;
        false
    }

    /// Is `lock` a stack-lock record owned by this thread?
    fn is_lock_owned(&self, lock: *const BasicLock) -> bool {
        let _ = lock;
        false
    }

    /// Wake a platform thread (or a virtual thread pinned to its carrier)
    /// parked inside a monitor operation.
    fn unpark(thread: &Arc<Self>) {
        thread.tls().park_event.unpark();
    }

    /// Make a virtual thread that yielded inside a monitor operation
    /// runnable again. Runtimes with virtual threads hand it to their
    /// scheduler here.
    fn unblock_virtual(thread: &Arc<Self>) {
        Self::unpark(thread);
    }
}

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadState {
    /// Thread is running normally.
    Running = 0,
    /// Thread is parked trying to enter a contended monitor.
    BlockedOnMonitorEnter = 1,
    /// Thread is parked in an untimed `wait`.
    InObjectWait = 2,
    /// Thread is parked in a timed `wait`.
    InTimedObjectWait = 3,
}

impl From<u8> for ThreadState {
    fn from(value: u8) -> ThreadState {
        match value {
            0 => ThreadState::Running,
            1 => ThreadState::BlockedOnMonitorEnter,
            2 => ThreadState::InObjectWait,
            3 => ThreadState::InTimedObjectWait,
            _ => unreachable!(),
        }
    }
}

/// First lock id handed out. Smaller values of the owner word are reserved
/// for "unowned", "anonymous" and "deflating".
pub const FIRST_LOCK_ID: u64 = 3;

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(FIRST_LOCK_ID);

/// Per-thread state the monitor implementation relies on.
pub struct TLSData {
    lock_id: u64,
    pub park_event: ParkEvent,
    interrupted: AtomicBool,
    state: AtomicU8,
    /// Address of the monitor this thread is blocked entering, or 0.
    pub current_pending_monitor: AtomicUsize,
    /// Address of the monitor this thread is waiting on, or 0.
    pub current_waiting_monitor: AtomicUsize,
}

impl TLSData {
    pub fn new() -> Self {
        Self {
            lock_id: NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed),
            park_event: ParkEvent::new(),
            interrupted: AtomicBool::new(false),
            state: AtomicU8::new(ThreadState::Running as _),
            current_pending_monitor: AtomicUsize::new(0),
            current_waiting_monitor: AtomicUsize::new(0),
        }
    }

    pub fn lock_id(&self) -> u64 {
        self.lock_id
    }

    pub fn state(&self) -> ThreadState {
        ThreadState::from(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::Acquire)
    }

    /// Set the interrupt flag and wake the thread if it is parked.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
        self.park_event.unpark();
    }

    /// Clear the interrupt flag, returning its previous value.
    pub fn clear_interrupt(&self) -> bool {
        self.interrupted.swap(false, Ordering::AcqRel)
    }
}

impl Default for TLSData {
    fn default() -> Self {
        Self::new()
    }
}

/// Run `callback` with the thread observably in `state`.
pub fn state_scope<T>(tls: &TLSData, state: ThreadState, callback: impl FnOnce() -> T) -> T {
    let previous = tls.state();
    tls.set_state(state);
    let result = callback();
    tls.set_state(previous);
    result
}

/// A one-permit event, used to block threads inside monitor operations.
///
/// `unpark` before `park` is not lost: the permit is consumed by the next
/// `park`. Several `unpark`s collapse into one permit.
pub struct ParkEvent {
    permit: Mutex<bool>,
    cond: Condvar,
}

impl ParkEvent {
    pub const fn new() -> Self {
        Self {
            permit: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    pub fn park(&self) {
        let mut permit = self.permit.lock();
        while !*permit {
            self.cond.wait(&mut permit);
        }
        *permit = false;
    }

    /// Park for at most `timeout`. Returns `true` if a permit was consumed,
    /// `false` on timeout.
    pub fn park_for(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut permit = self.permit.lock();
        while !*permit {
            match deadline {
                Some(deadline) => {
                    if self.cond.wait_until(&mut permit, deadline).timed_out() {
                        break;
                    }
                }
                None => self.cond.wait(&mut permit),
            }
        }
        std::mem::replace(&mut *permit, false)
    }

    pub fn unpark(&self) {
        let mut permit = self.permit.lock();
        *permit = true;
        self.cond.notify_one();
    }

    /// Drop a pending permit.
    pub fn reset(&self) {
        *self.permit.lock() = false;
    }
}

impl Default for ParkEvent {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_ids_are_unique_and_reserved_values_skipped() {
        let a = TLSData::new();
        let b = TLSData::new();
        assert!(a.lock_id() >= FIRST_LOCK_ID);
        assert!(b.lock_id() >= FIRST_LOCK_ID);
        assert_ne!(a.lock_id(), b.lock_id());
    }

    #[test]
    fn permit_is_not_lost() {
        let event = ParkEvent::new();
        event.unpark();
        event.unpark();
        // both unparks collapse into one permit
        event.park();
        assert!(!event.park_for(Duration::from_millis(5)));
    }

    #[test]
    fn park_for_times_out_and_wakes() {
        let event = Arc::new(ParkEvent::new());
        let start = Instant::now();
        assert!(!event.park_for(Duration::from_millis(20)));
        assert!(start.elapsed() >= Duration::from_millis(20));

        let other = event.clone();
        let handle = std::thread::spawn(move || other.park_for(Duration::from_secs(10)));
        std::thread::sleep(Duration::from_millis(10));
        event.unpark();
        assert!(handle.join().unwrap());
    }

    #[test]
    fn interrupt_sets_flag_and_unparks() {
        let tls = TLSData::new();
        tls.interrupt();
        assert!(tls.is_interrupted());
        assert!(tls.park_event.park_for(Duration::from_millis(1)));
        assert!(tls.clear_interrupt());
        assert!(!tls.is_interrupted());
    }

    #[test]
    fn state_scope_restores_state() {
        let tls = TLSData::new();
        let seen = state_scope(&tls, ThreadState::InObjectWait, || tls.state());
        assert_eq!(seen, ThreadState::InObjectWait);
        assert_eq!(tls.state(), ThreadState::Running);
    }
}
