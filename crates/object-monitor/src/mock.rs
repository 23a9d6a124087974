//! Simple MockVM used in tests
//!
//! Objects carry a header word; threads carry a lock stack. [`Synchronizer`]
//! fast-locks objects through the lock stack and inflates them to
//! [`ObjectMonitor`]s on contention, recursion past the top of the stack, or
//! `wait`. [`MockScheduler`] runs virtual threads cooperatively on the calling
//! thread.

use std::{
    collections::HashSet,
    ptr::{null_mut, NonNull},
    sync::{
        atomic::{AtomicPtr, AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use parking_lot::{Mutex, MutexGuard};

use crate::{
    objectmodel::{
        header::MarkWord,
        reference::{ObjectRef, WeakMember},
    },
    runtime::{
        options::MetadataKind,
        threads::{TLSData, Thread, ThreadRef},
        vthread::Unblocker,
    },
    sync::{
        basic_lock::BasicLock,
        lock_stack::LockStack,
        monitor_list::{DeflationStats, MonitorList},
        object_monitor::{MonitorContinuation, ObjectMonitor, Resume, VThreadEnter},
        MonitorError, WaitOutcome,
    },
    Runtime,
};

pub struct MockVM;

impl Runtime for MockVM {
    type Thread = MockThread;
    type Object = MockObject;
    type WeakHandle = WeakMember<MockObjectData>;

    fn cas_mark(obj: &MockObject, expected: MarkWord, new: MarkWord) -> MarkWord {
        match obj
            .header
            .compare_exchange(expected.raw(), new.raw(), Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(prev) | Err(prev) => MarkWord::from_raw(prev),
        }
    }

    fn remove_from_monitor_table(obj: &MockObject, monitor: &ObjectMonitor<Self>) {
        let _ = obj.table_entry.compare_exchange(
            monitor as *const _ as *mut _,
            null_mut(),
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }
}

pub struct MockObjectData {
    header: AtomicUsize,
    /// The object's slot in the monitor side table.
    table_entry: AtomicPtr<ObjectMonitor<MockVM>>,
}

pub type MockObject = ObjectRef<MockObjectData>;

pub fn new_object() -> MockObject {
    ObjectRef::new(MockObjectData {
        header: AtomicUsize::new(MarkWord::prototype().raw()),
        table_entry: AtomicPtr::new(null_mut()),
    })
}

impl MockObjectData {
    pub fn mark(&self) -> MarkWord {
        MarkWord::from_raw(self.header.load(Ordering::SeqCst))
    }

    /// The monitor registered for this object in the side table, if any.
    pub fn table_monitor(&self) -> *const ObjectMonitor<MockVM> {
        self.table_entry.load(Ordering::SeqCst)
    }

    pub fn set_table_monitor(&self, monitor: *const ObjectMonitor<MockVM>) {
        self.table_entry.store(monitor as *mut _, Ordering::SeqCst);
    }
}

pub struct MockThread {
    tls: TLSData,
    lock_stack: Mutex<LockStack<MockObject>>,
    /// Addresses of the stack-lock records this thread owns.
    basic_locks: Mutex<Vec<usize>>,
    /// Set for virtual threads: where they go when unblocked.
    unblocker: Option<Unblocker<MockVM>>,
}

impl MockThread {
    pub fn new() -> ThreadRef<MockVM> {
        Self::build(None)
    }

    pub fn new_virtual(unblocker: Unblocker<MockVM>) -> ThreadRef<MockVM> {
        Self::build(Some(unblocker))
    }

    fn build(unblocker: Option<Unblocker<MockVM>>) -> ThreadRef<MockVM> {
        Arc::new(Self {
            tls: TLSData::new(),
            lock_stack: Mutex::new(LockStack::new()),
            basic_locks: Mutex::new(Vec::new()),
            unblocker,
        })
    }

    /// Interrupt `thread`. A virtual thread is also handed to its scheduler.
    pub fn interrupt(thread: &ThreadRef<MockVM>) {
        thread.tls.interrupt();
        if let Some(unblocker) = &thread.unblocker {
            unblocker.push(thread.clone());
        }
    }

    pub fn lock_stack(&self) -> MutexGuard<'_, LockStack<MockObject>> {
        self.lock_stack.lock()
    }

    pub fn own_basic_lock(&self, lock: &BasicLock) {
        self.basic_locks.lock().push(lock as *const _ as usize);
    }

    pub fn forget_basic_lock(&self, lock: &BasicLock) {
        let address = lock as *const _ as usize;
        self.basic_locks.lock().retain(|&a| a != address);
    }
}

impl Thread<MockVM> for MockThread {
    fn tls(&self) -> &TLSData {
        &self.tls
    }

    fn is_virtual(&self) -> bool {
        self.unblocker.is_some()
    }

    fn lock_stack_contains(&self, obj: &MockObject) -> bool {
        self.lock_stack.lock().contains(obj)
    }

    fn is_lock_owned(&self, lock: *const BasicLock) -> bool {
        self.basic_locks.lock().contains(&(lock as usize))
    }

    fn unblock_virtual(thread: &Arc<Self>) {
        match &thread.unblocker {
            Some(unblocker) => unblocker.push(thread.clone()),
            None => thread.tls.park_event.unpark(),
        }
    }
}

/// Object locking on top of fast locks and inflated monitors.
///
/// Deflated monitors are kept until the synchronizer is dropped, so a
/// monitor reference handed out by [`inflate`](Self::inflate) stays valid
/// for the synchronizer's lifetime. Objects must not be locked after their
/// synchronizer was dropped.
pub struct Synchronizer {
    in_use: MonitorList<MockVM>,
    graveyard: Mutex<Vec<NonNull<ObjectMonitor<MockVM>>>>,
}

// SAFETY: the graveyard only stores monitors for freeing them on drop.
unsafe impl Send for Synchronizer {}
unsafe impl Sync for Synchronizer {}

impl Synchronizer {
    pub fn new() -> Self {
        Self {
            in_use: MonitorList::new(),
            graveyard: Mutex::new(Vec::new()),
        }
    }

    pub fn in_use(&self) -> &MonitorList<MockVM> {
        &self.in_use
    }

    /// The monitor `obj` is currently inflated to, if any.
    pub fn monitor_of(&self, obj: &MockObject) -> Option<&ObjectMonitor<MockVM>> {
        let mark = obj.mark();
        // SAFETY: monitors outlive `self`'s borrow, see the type docs.
        mark.has_monitor()
            .then(|| unsafe { &*mark.monitor::<ObjectMonitor<MockVM>>() })
    }

    fn fast_lock(&self, obj: &MockObject, current: &MockThread) -> bool {
        let mut stack = current.lock_stack();
        if stack.try_recursive_enter(obj) {
            return true;
        }
        if stack.is_full() || stack.contains(obj) {
            return false;
        }

        let mark = obj.mark();
        if mark.is_neutral() && MockVM::cas_mark(obj, mark, mark.set_fast_locked()) == mark {
            stack.push(obj.clone());
            return true;
        }
        false
    }

    /// Inflate `obj`. If `current` holds it through its lock stack the
    /// monitor becomes owned by `current` right away.
    pub fn inflate(&self, obj: &MockObject, current: &MockThread) -> &ObjectMonitor<MockVM> {
        loop {
            if let Some(monitor) = self.monitor_of(obj) {
                if monitor.is_owner_anonymous() && current.lock_stack_contains(obj) {
                    monitor.set_owner_from_anonymous(current);
                    let removed = current.lock_stack().remove(obj);
                    monitor.set_recursions(removed as isize - 1);
                }
                return monitor;
            }

            let mark = obj.mark();
            if mark.has_monitor() {
                continue;
            }

            let monitor = Box::new(ObjectMonitor::with_metadata_kind(obj, MetadataKind::Header));
            if mark.is_fast_locked() {
                monitor.set_header(mark.set_unlocked());
                monitor.set_owner_anonymous();
            } else {
                monitor.set_header(mark);
            }

            let encoded = MarkWord::encode(&*monitor as *const ObjectMonitor<MockVM>);
            if MockVM::cas_mark(obj, mark, encoded) != mark {
                continue;
            }

            let monitor = self.in_use.add(monitor);
            log::trace!(target: "monitorinflation", "inflate: object={:?}, monitor={:p}", obj, monitor);
        }
    }

    pub fn enter(&self, obj: &MockObject, current: &ThreadRef<MockVM>) {
        if self.fast_lock(obj, current) {
            return;
        }

        while !self.inflate(obj, current).enter(current) {
            // Deflated under us; the next inflation installs a fresh monitor.
            std::hint::spin_loop();
        }
    }

    pub fn exit(&self, obj: &MockObject, current: &ThreadRef<MockVM>) {
        {
            let mut stack = current.lock_stack();
            if stack.try_recursive_exit(obj) {
                return;
            }
            if !stack.is_recursive(obj) {
                let mut mark = obj.mark();
                while mark.is_fast_locked() {
                    let old = mark;
                    mark = MockVM::cas_mark(obj, old, old.set_unlocked());
                    if mark == old {
                        assert_eq!(stack.remove(obj), 1);
                        return;
                    }
                }
            }
        }

        // Inflated, or recursive below the top of the lock stack.
        let monitor = self.inflate(obj, current);
        monitor.exit(current);
    }

    pub fn wait(
        &self,
        obj: &MockObject,
        current: &ThreadRef<MockVM>,
        millis: u64,
        interruptible: bool,
    ) -> Result<WaitOutcome, MonitorError> {
        if obj.mark().is_neutral() {
            return Err(MonitorError::NotOwner);
        }
        self.inflate(obj, current).wait(current, millis, interruptible)
    }

    pub fn notify(&self, obj: &MockObject, current: &ThreadRef<MockVM>) -> Result<(), MonitorError> {
        match self.notify_fast_path(obj, current) {
            Some(result) => result,
            None => self.inflate(obj, current).notify(current),
        }
    }

    pub fn notify_all(&self, obj: &MockObject, current: &ThreadRef<MockVM>) -> Result<(), MonitorError> {
        match self.notify_fast_path(obj, current) {
            Some(result) => result,
            None => self.inflate(obj, current).notify_all(current),
        }
    }

    fn notify_fast_path(&self, obj: &MockObject, current: &MockThread) -> Option<Result<(), MonitorError>> {
        let mark = obj.mark();
        if mark.is_neutral() {
            return Some(Err(MonitorError::NotOwner));
        }
        // Nobody can wait on an object that was never inflated.
        if mark.is_fast_locked() && current.lock_stack_contains(obj) {
            return Some(Ok(()));
        }
        None
    }

    pub fn vthread_enter(&self, obj: &MockObject, vthread: &ThreadRef<MockVM>) -> VThreadEnter<MockVM> {
        if self.fast_lock(obj, vthread) {
            return VThreadEnter::Acquired;
        }

        loop {
            match self.inflate(obj, vthread).vthread_enter(vthread) {
                VThreadEnter::Deflating => std::hint::spin_loop(),
                other => return other,
            }
        }
    }

    pub fn vthread_wait(
        &self,
        obj: &MockObject,
        vthread: &ThreadRef<MockVM>,
        millis: u64,
        interruptible: bool,
    ) -> Result<MonitorContinuation<MockVM>, MonitorError> {
        if obj.mark().is_neutral() {
            return Err(MonitorError::NotOwner);
        }
        self.inflate(obj, vthread)
            .vthread_wait(vthread, millis, interruptible)
    }

    /// Deflate idle monitors. Dead ones go to the graveyard.
    pub fn deflate_idle_monitors(&self) -> DeflationStats {
        let (stats, unlinked) = self.in_use.deflate_idle_monitors();
        self.graveyard.lock().extend(unlinked);
        stats
    }
}

impl Default for Synchronizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Synchronizer {
    fn drop(&mut self) {
        let dead = std::mem::take(self.graveyard.get_mut());
        // SAFETY: `&mut self` means nobody borrows a monitor anymore.
        unsafe { MonitorList::free_unlinked(dead) };
    }
}

struct Parked {
    thread: ThreadRef<MockVM>,
    cont: MonitorContinuation<MockVM>,
    since: Instant,
}

impl Parked {
    fn wakeup_time(&self) -> Option<Instant> {
        let recheck = self.cont.recheck_interval().map(|interval| self.since + interval);
        match (self.cont.deadline(), recheck) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// Runs virtual threads that yielded inside a monitor operation.
pub struct MockScheduler {
    unblocker: Unblocker<MockVM>,
    parked: Vec<Parked>,
    /// Lock ids handed back through the unblocker and not resumed yet.
    pending: HashSet<u64>,
}

impl MockScheduler {
    pub fn new() -> Self {
        Self {
            unblocker: Unblocker::new(),
            parked: Vec::new(),
            pending: HashSet::new(),
        }
    }

    pub fn spawn_virtual(&self) -> ThreadRef<MockVM> {
        MockThread::new_virtual(self.unblocker.clone())
    }

    /// Unmount `thread` until its continuation becomes due.
    pub fn park(&mut self, thread: ThreadRef<MockVM>, cont: MonitorContinuation<MockVM>) {
        self.parked.push(Parked {
            thread,
            cont,
            since: Instant::now(),
        });
    }

    pub fn parked(&self) -> usize {
        self.parked.len()
    }

    fn collect_unblocked(&mut self) {
        for thread in self.unblocker.drain() {
            self.pending.insert(thread.tls().lock_id());
        }
    }

    /// Resume the first parked thread that was unblocked or whose deadline or
    /// recheck time passed. Waits up to `timeout` for one to become due.
    pub fn dispatch(&mut self, timeout: Duration) -> Option<(ThreadRef<MockVM>, Resume<MockVM>)> {
        let give_up = Instant::now() + timeout;
        loop {
            self.collect_unblocked();
            let now = Instant::now();

            let due = self.parked.iter().position(|p| {
                self.pending.contains(&p.thread.tls().lock_id())
                    || p.wakeup_time().map_or(false, |at| now >= at)
            });
            if let Some(ix) = due {
                let Parked { thread, cont, .. } = self.parked.remove(ix);
                self.pending.remove(&thread.tls().lock_id());
                let resume = cont.resume(&thread);
                return Some((thread, resume));
            }

            if now >= give_up {
                return None;
            }

            let next = self
                .parked
                .iter()
                .filter_map(Parked::wakeup_time)
                .fold(give_up, Instant::min);
            if let Some(thread) = self.unblocker.recv_timeout(next.saturating_duration_since(now)) {
                self.pending.insert(thread.tls().lock_id());
            }
        }
    }
}

impl Default for MockScheduler {
    fn default() -> Self {
        Self::new()
    }
}
