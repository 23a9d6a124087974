//! Registry of in-use monitors.
//!
//! New monitors are pushed onto an intrusive singly linked list with a CAS on
//! the head. Only one thread at a time deflates and unlinks; it owns every
//! link except the head, which it shares with concurrent pushers.

use std::{
    marker::PhantomData,
    ptr::{null_mut, NonNull},
    sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};

use parking_lot::{Mutex, MutexGuard};

use crate::{sync::object_monitor::ObjectMonitor, Runtime};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeflationStats {
    pub scanned: usize,
    pub deflated: usize,
    pub unlinked: usize,
}

pub struct MonitorList<R: Runtime> {
    head: AtomicPtr<ObjectMonitor<R>>,
    count: AtomicUsize,
    max: AtomicUsize,
    unlink_lock: Mutex<()>,
}

// SAFETY: the list owns its monitors, which are `Sync`; links are atomics.
unsafe impl<R: Runtime> Send for MonitorList<R> {}
unsafe impl<R: Runtime> Sync for MonitorList<R> {}

impl<R: Runtime> MonitorList<R> {
    pub const fn new() -> Self {
        Self {
            head: AtomicPtr::new(null_mut()),
            count: AtomicUsize::new(0),
            max: AtomicUsize::new(0),
            unlink_lock: Mutex::new(()),
        }
    }

    /// Take ownership of `monitor`. The returned pointer stays valid until the
    /// monitor is deflated, unlinked and freed by the caller.
    pub fn add(&self, monitor: Box<ObjectMonitor<R>>) -> NonNull<ObjectMonitor<R>> {
        let m = NonNull::from(Box::leak(monitor));
        loop {
            let head = self.head.load(Ordering::Acquire);
            // SAFETY: not published yet.
            unsafe { m.as_ref() }.set_next_om(head);
            if self
                .head
                .compare_exchange(head, m.as_ptr(), Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        let count = self.count.fetch_add(1, Ordering::Relaxed) + 1;
        self.max.fetch_max(count, Ordering::Relaxed);
        m
    }

    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// High-water mark of [`len`](Self::len).
    pub fn max(&self) -> usize {
        self.max.load(Ordering::Relaxed)
    }

    pub fn iter(&self) -> Iter<'_, R> {
        Iter {
            current: self.head.load(Ordering::Acquire),
            _list: PhantomData,
        }
    }

    /// Try to deflate every monitor on the list, then unlink the ones that
    /// are dead. The unlinked monitors can still be referenced by threads
    /// that looked them up before deflation; free them with
    /// [`free_unlinked`](Self::free_unlinked) once those threads are known
    /// to be done.
    pub fn deflate_idle_monitors(&self) -> (DeflationStats, Vec<NonNull<ObjectMonitor<R>>>) {
        let guard = self.unlink_lock.lock();
        let mut stats = DeflationStats::default();

        for monitor in self.iter() {
            stats.scanned += 1;
            if monitor.deflate_monitor() {
                stats.deflated += 1;
            }
        }

        let unlinked = self.unlink_deflated_locked(&guard);
        stats.unlinked = unlinked.len();

        log::debug!(
            target: "monitorinflation",
            "deflate_idle_monitors: scanned={}, deflated={}, unlinked={}, in_use={}, max={}",
            stats.scanned,
            stats.deflated,
            stats.unlinked,
            self.len(),
            self.max()
        );
        (stats, unlinked)
    }

    /// Unlink every monitor that was deflated.
    pub fn unlink_deflated(&self) -> Vec<NonNull<ObjectMonitor<R>>> {
        let guard = self.unlink_lock.lock();
        self.unlink_deflated_locked(&guard)
    }

    fn unlink_deflated_locked(&self, _guard: &MutexGuard<'_, ()>) -> Vec<NonNull<ObjectMonitor<R>>> {
        let mut unlinked = Vec::new();
        let mut prev: *mut ObjectMonitor<R> = null_mut();
        let mut m = self.head.load(Ordering::Acquire);

        // SAFETY (all dereferences below): monitors on the list are freed only
        // after being unlinked, and only we unlink.
        while !m.is_null() {
            let monitor = unsafe { &*m };
            let next = monitor.next_om();

            if !monitor.is_being_async_deflated() {
                prev = m;
                m = next;
                continue;
            }

            if prev.is_null() {
                if self
                    .head
                    .compare_exchange(m, next, Ordering::AcqRel, Ordering::Acquire)
                    .is_err()
                {
                    // New monitors were pushed in front of us.
                    let mut p = self.head.load(Ordering::Acquire);
                    while unsafe { (*p).next_om() } != m {
                        p = unsafe { (*p).next_om() };
                    }
                    unsafe { (*p).set_next_om(next) };
                    prev = p;
                }
            } else {
                unsafe { (*prev).set_next_om(next) };
            }

            monitor.set_next_om(null_mut());
            self.count.fetch_sub(1, Ordering::Relaxed);
            unlinked.push(NonNull::from(monitor));
            m = next;
        }

        unlinked
    }

    /// Free monitors returned by [`unlink_deflated`](Self::unlink_deflated)
    /// or [`deflate_idle_monitors`](Self::deflate_idle_monitors).
    ///
    /// # Safety
    ///
    /// No thread may still hold a reference to any of the monitors, and each
    /// may be passed here only once.
    pub unsafe fn free_unlinked(monitors: Vec<NonNull<ObjectMonitor<R>>>) {
        for monitor in monitors {
            let mut monitor = Box::from_raw(monitor.as_ptr());
            debug_assert!(monitor.is_being_async_deflated());
            monitor.release_object();
        }
    }
}

impl<R: Runtime> Default for MonitorList<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: Runtime> Drop for MonitorList<R> {
    fn drop(&mut self) {
        let mut m = *self.head.get_mut();
        while !m.is_null() {
            // SAFETY: we own every monitor still on the list.
            let monitor = unsafe { Box::from_raw(m) };
            m = monitor.next_om();
        }
    }
}

pub struct Iter<'a, R: Runtime> {
    current: *mut ObjectMonitor<R>,
    _list: PhantomData<&'a MonitorList<R>>,
}

impl<'a, R: Runtime> Iterator for Iter<'a, R> {
    type Item = &'a ObjectMonitor<R>;

    fn next(&mut self) -> Option<Self::Item> {
        // SAFETY: monitors are freed only through `free_unlinked`, whose
        // caller guarantees nobody is iterating over them.
        let monitor = unsafe { self.current.as_ref()? };
        self.current = monitor.next_om();
        Some(monitor)
    }
}
