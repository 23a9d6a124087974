//! Inflated object monitors.
//!
//! This crate implements the heavyweight lock that backs every contended
//! intrinsic lock of a managed object: reentrant mutual exclusion with
//! adaptive spinning, condition waits (`wait`/`notify`/`notify_all`),
//! cooperative entry for virtual threads, and concurrent deflation of idle
//! monitors.
//!
//! The embedding runtime plugs in through the [`Runtime`] and
//! [`Thread`](runtime::threads::Thread) traits. See [`mock`] for a small but
//! complete runtime used by the tests.

pub mod mock;
pub mod objectmodel;
pub mod runtime;
pub mod sync;
pub mod utils;

pub type ThreadOf<R> = <R as Runtime>::Thread;
pub type ObjectOf<R> = <R as Runtime>::Object;
pub type WeakHandleOf<R> = <R as Runtime>::WeakHandle;

pub use runtime::{threads::ThreadRef, Runtime};
pub use sync::{
    monitor_list::MonitorList, object_monitor::ObjectMonitor, MonitorError, WaitOutcome,
};
