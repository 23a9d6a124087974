//! The inflated monitor.
//!
//! An [`ObjectMonitor`] is attached to an object once its lock becomes
//! contended or somebody waits on it. The owner field is the lock itself;
//! every ownership transition is a compare-and-swap on it. Entrants that
//! cannot acquire the monitor push a waiter onto the lock-free contention
//! queue (`cxq`), from where the exiting owner moves them onto the entry list
//! and picks a successor to wake. Waiting threads live on a separate wait set
//! guarded by a spin lock.
//!
//! Idle monitors are reclaimed concurrently with lock traffic, see
//! [`MonitorList::deflate_idle_monitors`](crate::MonitorList::deflate_idle_monitors).

use std::{
    fmt,
    ptr::null_mut,
    sync::atomic::{AtomicI32, AtomicIsize, AtomicPtr, AtomicU64, AtomicUsize, Ordering},
};

use crossbeam_utils::CachePadded;

use crate::{
    objectmodel::{header::MarkWord, reference::WeakHandle},
    runtime::{
        options::{MetadataKind, SpinKnobs},
        threads::Thread,
    },
    sync::{basic_lock::BasicLock, object_waiter::ObjectWaiter, spin_lock::SpinLock, MonitorError},
    Runtime, ThreadOf,
};

mod deflate;
mod enter;
mod exit;
mod vthread;
mod wait;

pub use vthread::{MonitorContinuation, Resume, VThreadEnter};

pub const NO_OWNER: u64 = 0;
/// Ownership is recorded by the fast-locking path, not by this monitor.
pub const ANONYMOUS_OWNER: u64 = 1;
/// Tombstone installed by a deflater.
pub const DEFLATER_MARKER: u64 = 2;

/// Decoded value of the owner field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Owner {
    Unowned,
    Thread(u64),
    Anonymous,
    Deflating,
}

impl Owner {
    pub const fn from_raw(raw: u64) -> Self {
        match raw {
            NO_OWNER => Self::Unowned,
            ANONYMOUS_OWNER => Self::Anonymous,
            DEFLATER_MARKER => Self::Deflating,
            id => Self::Thread(id),
        }
    }

    pub const fn raw(self) -> u64 {
        match self {
            Self::Unowned => NO_OWNER,
            Self::Anonymous => ANONYMOUS_OWNER,
            Self::Deflating => DEFLATER_MARKER,
            Self::Thread(id) => id,
        }
    }

    pub fn of<R: Runtime>(thread: &ThreadOf<R>) -> Self {
        Self::Thread(thread.lock_id())
    }
}

pub struct ObjectMonitor<R: Runtime> {
    /// Displaced header of the object, or its identity hash when monitors
    /// are found through a side table. Which one is fixed at construction.
    metadata: AtomicUsize,
    metadata_kind: MetadataKind,
    /// Weak back-reference to the object.
    object: R::WeakHandle,
    /// Separate owner from the stable fields above since it is CASed by
    /// every entrant.
    owner: CachePadded<AtomicU64>,
    /// Lock id of the previous owner. Only written by `exit`.
    previous_owner_tid: AtomicU64,
    /// Stack-lock record of an anonymous owner, if any.
    stack_locker: AtomicPtr<BasicLock>,
    /// Link in the list of all in-use monitors.
    next_om: CachePadded<AtomicPtr<ObjectMonitor<R>>>,
    recursions: AtomicIsize,
    /// Doubly linked, curated by the owner.
    entry_list: AtomicPtr<ObjectWaiter<R>>,
    /// Singly linked, lock-free pushes by entrants.
    cxq: AtomicPtr<ObjectWaiter<R>>,
    /// Heir presumptive: already awake, no need to wake anybody else.
    succ: AtomicU64,
    /// Thread that parks with a timeout to guard against stranding.
    responsible: AtomicU64,
    spin_duration: AtomicIsize,
    /// Threads inside enter. Negative while the monitor is being deflated.
    contentions: CachePadded<AtomicI32>,
    /// Circular doubly linked list, guarded by `wait_set_lock`.
    wait_set: AtomicPtr<ObjectWaiter<R>>,
    waiters: AtomicI32,
    wait_set_lock: SpinLock,
}

impl<R: Runtime> ObjectMonitor<R> {
    pub fn new(obj: &R::Object) -> Self {
        Self::with_metadata_kind(obj, MetadataKind::current())
    }

    pub fn with_metadata_kind(obj: &R::Object, metadata_kind: MetadataKind) -> Self {
        // A header-mode monitor starts out with a neutral displaced header
        // until inflation records the real one.
        let metadata = match metadata_kind {
            MetadataKind::Header => MarkWord::prototype().raw(),
            MetadataKind::Hash => 0,
        };
        Self {
            metadata: AtomicUsize::new(metadata),
            metadata_kind,
            object: R::WeakHandle::new(obj),
            owner: CachePadded::new(AtomicU64::new(NO_OWNER)),
            previous_owner_tid: AtomicU64::new(0),
            stack_locker: AtomicPtr::new(null_mut()),
            next_om: CachePadded::new(AtomicPtr::new(null_mut())),
            recursions: AtomicIsize::new(0),
            entry_list: AtomicPtr::new(null_mut()),
            cxq: AtomicPtr::new(null_mut()),
            succ: AtomicU64::new(NO_OWNER),
            responsible: AtomicU64::new(NO_OWNER),
            spin_duration: AtomicIsize::new(SpinKnobs::current().limit),
            contentions: CachePadded::new(AtomicI32::new(0)),
            wait_set: AtomicPtr::new(null_mut()),
            waiters: AtomicI32::new(0),
            wait_set_lock: SpinLock::new(),
        }
    }

    /* owner */

    pub fn owner_raw(&self) -> u64 {
        self.owner.load(Ordering::Acquire)
    }

    pub fn owner(&self) -> Owner {
        Owner::from_raw(self.owner_raw())
    }

    /// Owned by a thread or anonymously. The tombstone does not count.
    pub fn has_owner(&self) -> bool {
        !matches!(self.owner(), Owner::Unowned | Owner::Deflating)
    }

    pub fn is_owner(&self, thread: &ThreadOf<R>) -> bool {
        self.owner_raw() == thread.lock_id()
    }

    pub fn is_owner_anonymous(&self) -> bool {
        self.owner_raw() == ANONYMOUS_OWNER
    }

    pub fn owner_is_deflater_marker(&self) -> bool {
        self.owner_raw() == DEFLATER_MARKER
    }

    pub fn is_being_async_deflated(&self) -> bool {
        self.contentions() < 0
    }

    pub(crate) fn cas_owner(&self, old: u64, new: u64) -> u64 {
        let prev = match self
            .owner
            .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
        {
            Ok(prev) | Err(prev) => prev,
        };
        if prev == old {
            log::trace!(
                target: "monitorinflation",
                "set_owner: mid={:p}, old={:?}, new={:?}",
                self,
                Owner::from_raw(old),
                Owner::from_raw(new)
            );
        }
        prev
    }

    /// Compare-and-swap the owner. Returns the previous owner, which equals
    /// `old` on success.
    pub fn try_set_owner_from(&self, old: Owner, new: Owner) -> Owner {
        Owner::from_raw(self.cas_owner(old.raw(), new.raw()))
    }

    /// Like [`try_set_owner_from`](Self::try_set_owner_from), but a mismatch
    /// is a fatal protocol violation.
    pub fn set_owner_from(&self, old: Owner, new: Owner) {
        let prev = self.try_set_owner_from(old, new);
        if prev != old {
            log::error!(target: "monitorinflation", "set_owner_from: owner mismatch on {:?}", self);
            panic!("owner mismatch: expected {old:?}, found {prev:?}");
        }
    }

    pub(crate) fn release_clear_owner_raw(&self, old: u64) {
        let prev = self.owner_raw();
        assert_eq!(prev, old, "owner mismatch on release");
        self.owner.store(NO_OWNER, Ordering::Release);
        log::trace!(
            target: "monitorinflation",
            "release_clear_owner: mid={:p}, old={:?}",
            self,
            Owner::from_raw(old)
        );
    }

    /// Drop ownership. Critical section writes become visible to whoever
    /// acquires next.
    pub fn release_clear_owner(&self, old: Owner) {
        self.release_clear_owner_raw(old.raw());
    }

    pub fn set_owner_anonymous(&self) {
        self.set_owner_from(Owner::Unowned, Owner::Anonymous);
    }

    pub fn set_owner_from_anonymous(&self, current: &ThreadOf<R>) {
        self.set_owner_from(Owner::Anonymous, Owner::of::<R>(current));
        self.stack_locker.store(null_mut(), Ordering::Relaxed);
    }

    /// Claim an anonymously owned monitor through the stack-lock record the
    /// caller holds.
    pub fn set_owner_from_basic_lock(&self, current: &ThreadOf<R>) {
        assert!(
            self.owns_stack_locker(current),
            "stack locker is not owned by the current thread"
        );
        self.set_owner_from_anonymous(current);
    }

    pub fn stack_locker(&self) -> *const BasicLock {
        self.stack_locker.load(Ordering::Relaxed)
    }

    pub fn set_stack_locker(&self, lock: *const BasicLock) {
        self.stack_locker.store(lock as *mut BasicLock, Ordering::Relaxed);
    }

    pub(crate) fn owns_stack_locker(&self, thread: &ThreadOf<R>) -> bool {
        let locker = self.stack_locker();
        self.is_owner_anonymous() && !locker.is_null() && thread.is_lock_owned(locker)
    }

    /// Does `current` own the monitor, directly or through the fast-locking
    /// path?
    pub fn is_entered(&self, current: &ThreadOf<R>) -> bool {
        if self.is_owner(current) {
            return true;
        }

        self.is_owner_anonymous()
            && (self.owns_stack_locker(current)
                || self
                    .object_peek()
                    .map_or(false, |obj| current.lock_stack_contains(&obj)))
    }

    /// Ok if `current` owns the monitor. Anonymous ownership through the
    /// caller's stack lock is turned into real ownership.
    pub fn check_owner(&self, current: &ThreadOf<R>) -> Result<(), MonitorError> {
        if self.is_owner(current) {
            return Ok(());
        }

        if self.owns_stack_locker(current) {
            self.set_owner_from_basic_lock(current);
            self.recursions.store(0, Ordering::Relaxed);
            return Ok(());
        }

        Err(MonitorError::NotOwner)
    }

    /* metadata */

    pub fn metadata_kind(&self) -> MetadataKind {
        self.metadata_kind
    }

    pub fn metadata(&self) -> usize {
        self.metadata.load(Ordering::Relaxed)
    }

    pub fn set_metadata(&self, value: usize) {
        self.metadata.store(value, Ordering::Relaxed);
    }

    pub fn header(&self) -> MarkWord {
        assert_eq!(self.metadata_kind, MetadataKind::Header, "monitor caches a hash");
        MarkWord::from_raw(self.metadata())
    }

    pub fn set_header(&self, header: MarkWord) {
        assert_eq!(self.metadata_kind, MetadataKind::Header, "monitor caches a hash");
        self.set_metadata(header.raw());
    }

    pub fn hash(&self) -> usize {
        assert_eq!(self.metadata_kind, MetadataKind::Hash, "monitor holds a header");
        self.metadata()
    }

    pub fn set_hash(&self, hash: usize) {
        assert_eq!(self.metadata_kind, MetadataKind::Hash, "monitor holds a header");
        self.set_metadata(hash);
    }

    /* object */

    pub fn object_peek(&self) -> Option<R::Object> {
        self.object.peek()
    }

    pub fn object_is_dead(&self) -> bool {
        self.object_peek().is_none()
    }

    pub fn object_is_cleared(&self) -> bool {
        self.object.is_null()
    }

    pub fn object_refers_to(&self, obj: &R::Object) -> bool {
        self.object.refers_to(obj)
    }

    pub fn release_object(&mut self) {
        self.object.release();
    }

    /* counters and hints */

    pub fn recursions(&self) -> isize {
        self.recursions.load(Ordering::Relaxed)
    }

    pub fn set_recursions(&self, value: isize) {
        debug_assert!(self.has_owner());
        self.recursions.store(value, Ordering::Relaxed);
    }

    pub fn contentions(&self) -> i32 {
        self.contentions.load(Ordering::SeqCst)
    }

    pub(crate) fn add_to_contentions(&self, value: i32) {
        self.contentions.fetch_add(value, Ordering::SeqCst);
    }

    pub fn waiters(&self) -> i32 {
        self.waiters.load(Ordering::SeqCst)
    }

    pub fn successor(&self) -> u64 {
        self.succ.load(Ordering::Relaxed)
    }

    pub(crate) fn clear_successor_if(&self, id: u64) {
        if self.succ.load(Ordering::Relaxed) == id {
            self.succ.store(NO_OWNER, Ordering::Relaxed);
        }
    }

    pub fn responsible(&self) -> u64 {
        self.responsible.load(Ordering::Relaxed)
    }

    pub fn previous_owner_tid(&self) -> u64 {
        self.previous_owner_tid.load(Ordering::Relaxed)
    }

    pub fn spin_duration(&self) -> isize {
        self.spin_duration.load(Ordering::Relaxed)
    }

    pub fn next_om(&self) -> *mut ObjectMonitor<R> {
        self.next_om.load(Ordering::Acquire)
    }

    pub(crate) fn set_next_om(&self, next: *mut ObjectMonitor<R>) {
        self.next_om.store(next, Ordering::Release);
    }

    /// Lock ids of the threads on the wait set, oldest first.
    pub fn waiting_threads(&self) -> Vec<u64> {
        let _guard = self.wait_set_lock.lock();
        let mut ids = Vec::new();
        let head = self.wait_set.load(Ordering::Acquire);
        let mut p = head;
        while !p.is_null() {
            // SAFETY: nodes are unlinked from the wait set only under the lock.
            let node = unsafe { &*p };
            ids.push(node.lock_id());
            p = node.next();
            if p == head {
                break;
            }
        }
        ids
    }
}

/// Counts a thread as contending for the duration of a monitor operation,
/// which keeps the monitor from being deflated.
pub struct ContentionMark<'a, R: Runtime> {
    monitor: &'a ObjectMonitor<R>,
}

impl<'a, R: Runtime> ContentionMark<'a, R> {
    pub fn new(monitor: &'a ObjectMonitor<R>) -> Self {
        monitor.add_to_contentions(1);
        Self { monitor }
    }
}

impl<R: Runtime> Drop for ContentionMark<'_, R> {
    fn drop(&mut self) {
        self.monitor.add_to_contentions(-1);
    }
}

impl<R: Runtime> fmt::Debug for ObjectMonitor<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjectMonitor")
            .field("address", &(self as *const Self))
            .field("metadata", &format_args!("{:#x}", self.metadata()))
            .field("metadata_kind", &self.metadata_kind)
            .field("object", &self.object_peek())
            .field("owner", &self.owner())
            .field("previous_owner_tid", &self.previous_owner_tid())
            .field("recursions", &self.recursions())
            .field("contentions", &self.contentions())
            .field("waiters", &self.waiters())
            .field("cxq", &self.cxq.load(Ordering::Relaxed))
            .field("entry_list", &self.entry_list.load(Ordering::Relaxed))
            .field("wait_set", &self.wait_set.load(Ordering::Relaxed))
            .field("succ", &self.successor())
            .field("responsible", &self.responsible())
            .field("spin_duration", &self.spin_duration())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mock::{new_object, MockThread, MockVM},
        sync::WaitOutcome,
    };

    type Monitor = ObjectMonitor<MockVM>;

    #[test]
    fn owner_encoding() {
        for owner in [Owner::Unowned, Owner::Anonymous, Owner::Deflating, Owner::Thread(42)] {
            assert_eq!(Owner::from_raw(owner.raw()), owner);
        }
        let thread = MockThread::new();
        assert_eq!(Owner::of::<MockVM>(&thread), Owner::Thread(thread.lock_id()));
    }

    #[test]
    fn reentrant_enter_and_exit() {
        let obj = new_object();
        let monitor = Monitor::new(&obj);
        let thread = MockThread::new();

        assert!(monitor.enter(&thread));
        assert!(monitor.try_enter(&thread));
        assert!(monitor.enter(&thread));
        assert_eq!(monitor.recursions(), 2);
        assert!(monitor.is_entered(&thread));

        monitor.exit(&thread);
        monitor.exit(&thread);
        assert!(monitor.is_owner(&thread));
        monitor.exit(&thread);
        assert!(!monitor.has_owner());
        assert_eq!(monitor.recursions(), 0);
        assert_eq!(monitor.previous_owner_tid(), thread.lock_id());
    }

    #[test]
    fn try_enter_fails_for_other_thread() {
        let obj = new_object();
        let monitor = Monitor::new(&obj);
        let a = MockThread::new();
        let b = MockThread::new();

        assert!(monitor.try_enter(&a));
        assert!(!monitor.try_enter(&b));
        assert_eq!(monitor.owner(), Owner::Thread(a.lock_id()));
        monitor.exit(&a);
        assert!(monitor.try_enter(&b));
        monitor.exit(&b);
    }

    #[test]
    #[should_panic(expected = "non-owner")]
    fn exit_by_non_owner_is_fatal() {
        let obj = new_object();
        let monitor = Monitor::new(&obj);
        let a = MockThread::new();
        let b = MockThread::new();

        assert!(monitor.enter(&a));
        monitor.exit(&b);
    }

    #[test]
    #[should_panic(expected = "owner mismatch")]
    fn guarded_owner_store_is_fatal_on_mismatch() {
        let obj = new_object();
        let monitor = Monitor::new(&obj);
        monitor.set_owner_from(Owner::Anonymous, Owner::Unowned);
    }

    #[test]
    fn operations_by_non_owner_report_not_owner() {
        let obj = new_object();
        let monitor = Monitor::new(&obj);
        let a = MockThread::new();
        let b = MockThread::new();

        assert_eq!(monitor.notify(&a), Err(MonitorError::NotOwner));
        assert!(monitor.enter(&a));
        assert_eq!(monitor.notify(&b), Err(MonitorError::NotOwner));
        assert_eq!(monitor.notify_all(&b), Err(MonitorError::NotOwner));
        assert_eq!(monitor.wait(&b, 1, true), Err(MonitorError::NotOwner));
        assert_eq!(monitor.notify(&a), Ok(()));
        monitor.exit(&a);
    }

    #[test]
    fn anonymous_owner_is_claimed_through_stack_lock() {
        let obj = new_object();
        let monitor = Monitor::new(&obj);
        let thread = MockThread::new();
        let lock = BasicLock::new();

        monitor.set_owner_anonymous();
        monitor.set_stack_locker(&lock);
        assert!(!monitor.is_entered(&thread));

        thread.own_basic_lock(&lock);
        assert!(monitor.is_entered(&thread));
        assert_eq!(monitor.check_owner(&thread), Ok(()));
        assert!(monitor.is_owner(&thread));
        assert!(monitor.stack_locker().is_null());

        monitor.exit(&thread);
        assert_eq!(monitor.owner(), Owner::Unowned);
        thread.forget_basic_lock(&lock);
    }

    #[test]
    fn exit_converts_anonymous_owner() {
        let obj = new_object();
        let monitor = Monitor::new(&obj);
        let thread = MockThread::new();
        let lock = BasicLock::new();

        monitor.set_owner_anonymous();
        monitor.set_stack_locker(&lock);
        thread.own_basic_lock(&lock);

        monitor.exit(&thread);
        assert_eq!(monitor.owner(), Owner::Unowned);
    }

    #[test]
    fn complete_exit_and_reenter_restore_depth() {
        let obj = new_object();
        let monitor = Monitor::new(&obj);
        let thread = MockThread::new();

        for _ in 0..4 {
            assert!(monitor.enter(&thread));
        }
        let depth = monitor.complete_exit(&thread);
        assert_eq!(depth, 3);
        assert!(!monitor.has_owner());

        assert!(monitor.reenter(&thread, depth));
        assert_eq!(monitor.recursions(), 3);
        for _ in 0..4 {
            monitor.exit(&thread);
        }
        assert!(!monitor.has_owner());
    }

    #[test]
    fn enter_for_counts_recursion_and_claims_stack_lock() {
        let obj = new_object();
        let monitor = Monitor::new(&obj);
        let thread = MockThread::new();

        assert!(monitor.enter_for(&thread));
        assert!(monitor.enter_for(&thread));
        assert_eq!(monitor.recursions(), 1);
        monitor.exit(&thread);
        monitor.exit(&thread);

        let lock = BasicLock::new();
        monitor.set_owner_anonymous();
        monitor.set_stack_locker(&lock);
        thread.own_basic_lock(&lock);
        assert!(monitor.enter_for(&thread));
        assert!(monitor.is_owner(&thread));
        assert_eq!(monitor.recursions(), 1);
        monitor.exit(&thread);
        monitor.exit(&thread);
        assert!(!monitor.has_owner());
    }

    #[test]
    fn timed_wait_without_notify_times_out() {
        let obj = new_object();
        let monitor = Monitor::new(&obj);
        let thread = MockThread::new();

        assert!(monitor.enter(&thread));
        assert!(monitor.enter(&thread));
        assert_eq!(monitor.wait(&thread, 10, true), Ok(WaitOutcome::TimedOut));
        assert!(monitor.is_owner(&thread));
        assert_eq!(monitor.recursions(), 1);
        assert_eq!(monitor.waiters(), 0);
        assert!(monitor.waiting_threads().is_empty());
        monitor.exit(&thread);
        monitor.exit(&thread);
    }

    #[test]
    fn pending_interrupt_fails_wait_before_releasing() {
        let obj = new_object();
        let monitor = Monitor::new(&obj);
        let thread = MockThread::new();

        assert!(monitor.enter(&thread));
        thread.tls().interrupt();
        assert_eq!(monitor.wait(&thread, 0, true), Err(MonitorError::Interrupted));
        assert!(monitor.is_owner(&thread));
        assert!(!thread.tls().is_interrupted());
        monitor.exit(&thread);
    }

    #[test]
    fn idle_monitor_deflates_and_restores_header() {
        let obj = new_object();
        let thread = MockThread::new();
        let monitor = Box::new(Monitor::with_metadata_kind(&obj, MetadataKind::Header));
        let neutral = obj.mark().copy_set_hash(0x55);
        monitor.set_header(neutral);
        let encoded = MarkWord::encode(&*monitor as *const Monitor);
        assert_eq!(MockVM::cas_mark(&obj, obj.mark(), encoded), MarkWord::prototype());

        assert!(monitor.enter(&thread));
        assert!(monitor.is_busy());
        assert!(!monitor.deflate_monitor());
        assert_eq!(obj.mark(), encoded);
        monitor.exit(&thread);

        assert!(!monitor.is_busy());
        assert!(monitor.deflate_monitor());
        assert!(monitor.is_being_async_deflated());
        assert!(monitor.owner_is_deflater_marker());
        assert_eq!(obj.mark(), neutral);

        // Entrants back off from a dead monitor.
        assert!(!monitor.enter(&thread));
        assert!(!monitor.enter_for(&thread));
        assert!(!monitor.try_enter(&thread));
        assert!(!monitor.deflate_monitor());
    }

    #[test]
    fn deflation_of_hash_monitor_clears_table_entry() {
        let obj = new_object();
        let monitor = Monitor::with_metadata_kind(&obj, MetadataKind::Hash);
        monitor.set_hash(1234);
        obj.set_table_monitor(&monitor);

        assert!(monitor.deflate_monitor());
        assert!(obj.table_monitor().is_null());
        assert_eq!(monitor.hash(), 1234);
    }

    #[test]
    fn monitor_of_dead_object_deflates() {
        let obj = new_object();
        let monitor = Monitor::new(&obj);
        assert!(monitor.object_refers_to(&obj));
        assert!(!monitor.object_refers_to(&new_object()));
        drop(obj);
        assert!(monitor.object_is_dead());
        assert!(!monitor.object_is_cleared());
        assert!(monitor.deflate_monitor());
    }

    #[test]
    fn busy_description_names_the_reason() {
        let obj = new_object();
        let monitor = Monitor::new(&obj);
        let thread = MockThread::new();

        assert!(monitor.enter(&thread));
        let description = monitor.is_busy_to_string();
        assert!(description.contains(&format!("owner={}", thread.lock_id())));
        assert!(description.contains("waiters=0"));
        monitor.exit(&thread);
        assert!(monitor.is_busy_to_string().contains("owner=0"));
    }
}
