use std::sync::atomic::Ordering;

use super::{ObjectMonitor, DEFLATER_MARKER, NO_OWNER};
use crate::{objectmodel::header::MarkWord, runtime::options::MetadataKind, Runtime};

impl<R: Runtime> ObjectMonitor<R> {
    /// Is anybody using this monitor? Only an idle monitor may be deflated.
    pub fn is_busy(&self) -> bool {
        let owner = self.owner_raw();
        self.waiters() != 0
            || !self.cxq.load(Ordering::Acquire).is_null()
            || !self.entry_list.load(Ordering::Acquire).is_null()
            || self.contentions() > 0
            || (owner != NO_OWNER && owner != DEFLATER_MARKER)
    }

    /// Fields that make [`is_busy`](Self::is_busy) true, for diagnostics.
    pub fn is_busy_to_string(&self) -> String {
        let owner = self.owner_raw();
        let owner = if owner == DEFLATER_MARKER { NO_OWNER } else { owner };
        format!(
            "contentions={}, waiters={}, owner={}, cxq={:p}, entry_list={:p}",
            self.contentions().max(0),
            self.waiters(),
            owner,
            self.cxq.load(Ordering::Relaxed),
            self.entry_list.load(Ordering::Relaxed)
        )
    }

    /// Try to retire an idle monitor. Returns `true` if the monitor is now
    /// dead: the object no longer refers to it and no thread can acquire it.
    /// The caller unlinks it from the in-use list and frees it once no
    /// thread can still be looking at it.
    ///
    /// Deflation is gated twice. First `contentions` goes from `0` to a large
    /// negative value, which makes every entrant that shows up later back
    /// off. Then the tombstone replaces a null owner, which fails if a thread
    /// acquired the monitor without going through the contended path. A
    /// failure at either gate leaves the monitor as it was.
    ///
    /// Only the thread sweeping the in-use list may call this, under
    /// its unlink lock: while a deflation backs out the monitor looks
    /// deflated, and a concurrent unlink would retire a live monitor. Use
    /// [`MonitorList::deflate_idle_monitors`](crate::MonitorList::deflate_idle_monitors).
    pub(crate) fn deflate_monitor(&self) -> bool {
        if self.is_busy() {
            return false;
        }

        let obj = self.object_peek();

        if self
            .contentions
            .compare_exchange(0, i32::MIN, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }

        if self.cas_owner(NO_OWNER, DEFLATER_MARKER) != NO_OWNER {
            // A thread got the lock between the two gates.
            self.contentions.fetch_sub(i32::MIN, Ordering::SeqCst);
            return false;
        }

        // Waiters can sneak in through an owner that entered and waited
        // before the first gate closed.
        if self.waiters() != 0
            || !self.cxq.load(Ordering::Acquire).is_null()
            || !self.entry_list.load(Ordering::Acquire).is_null()
        {
            log::debug!(
                target: "monitorinflation",
                "deflate: mid={:p} backs out, {}",
                self,
                self.is_busy_to_string()
            );
            self.contentions.fetch_sub(i32::MIN, Ordering::SeqCst);
            self.release_and_wake(DEFLATER_MARKER);
            return false;
        }

        debug_assert_eq!(self.recursions(), 0);

        match obj {
            Some(obj) => self.install_displaced_markword_in_object(&obj),
            None => log::trace!(target: "monitorinflation", "deflate: mid={:p}, object is dead", self),
        }

        log::debug!(target: "monitorinflation", "deflated monitor {:p}", self);
        true
    }

    /// Detach the monitor from `obj` after a successful deflation.
    fn install_displaced_markword_in_object(&self, obj: &R::Object) {
        debug_assert!(self.is_being_async_deflated());

        match self.metadata_kind() {
            MetadataKind::Header => {
                let dmw = self.header();
                assert!(dmw.is_neutral(), "bad displaced header {dmw:?}");

                let expected = MarkWord::encode(self as *const Self);
                let res = R::cas_mark(obj, expected, dmw);
                if res != expected {
                    // Somebody else already restored the header.
                    log::info!(
                        target: "monitorinflation",
                        "install_displaced_markword_in_object: mid={:p}, mark={:?}",
                        self,
                        res
                    );
                }
            }
            MetadataKind::Hash => R::remove_from_monitor_table(obj, self),
        }
    }
}
