use std::fmt::Debug;

use crate::{
    objectmodel::{header::MarkWord, reference::WeakHandle},
    sync::object_monitor::ObjectMonitor,
};

pub mod options;
pub mod threads;
pub mod vthread;

/// The embedding runtime.
///
/// Monitors never touch the object model or the thread scheduler directly;
/// everything they need from the outside world goes through this trait and
/// through [`Thread`](threads::Thread).
pub trait Runtime: 'static + Sized + Send + Sync {
    type Thread: threads::Thread<Self>;
    /// A reference to a heap object. Equality must be identity.
    type Object: Clone + PartialEq + Debug + Send + Sync;
    /// Weak back-reference from a monitor to its object. Must not keep the
    /// object alive.
    type WeakHandle: WeakHandle<Self::Object>;

    /// Compare-and-swap the header word of `obj`. Returns the header value
    /// observed before the operation, which equals `expected` on success.
    fn cas_mark(obj: &Self::Object, expected: MarkWord, new: MarkWord) -> MarkWord;

    /// Drop the `obj -> monitor` association when monitors live in a side
    /// table instead of the object header. Only called when
    /// [`use_object_monitor_table`](options::monitorflags_use_object_monitor_table)
    /// was set for the monitor being deflated.
    fn remove_from_monitor_table(obj: &Self::Object, monitor: &ObjectMonitor<Self>) {
        let _ = obj;
        let _ = monitor;
    }
}
