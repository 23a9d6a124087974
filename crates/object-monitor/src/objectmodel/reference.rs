//! # Object references
//!
//! A monitor refers back to its object weakly: it must never keep the object
//! alive, and deflation reclaims monitors whose object has died.

use std::{
    fmt,
    mem::ManuallyDrop,
    ops::Deref,
    ptr::null_mut,
    sync::{
        atomic::{AtomicPtr, Ordering},
        Arc, Weak,
    },
};

/// Weak, peekable handle to an object supplied by the object model.
pub trait WeakHandle<O>: Send + Sync + Sized {
    fn new(obj: &O) -> Self;
    /// Has the handle been released?
    fn is_null(&self) -> bool;
    /// The object, if the handle was not released and the object is alive.
    fn peek(&self) -> Option<O>;
    fn refers_to(&self, obj: &O) -> bool;
    fn release(&mut self);
}

/// Shared reference to a heap object. Two references are equal iff they
/// point to the same object.
pub struct ObjectRef<T>(Arc<T>);

impl<T> ObjectRef<T> {
    pub fn new(value: T) -> Self {
        Self(Arc::new(value))
    }

    pub fn as_ptr(&self) -> *const T {
        Arc::as_ptr(&self.0)
    }

    pub fn downgrade(&self) -> Weak<T> {
        Arc::downgrade(&self.0)
    }
}

impl<T> Clone for ObjectRef<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> PartialEq for ObjectRef<T> {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl<T> Eq for ObjectRef<T> {}

impl<T> Deref for ObjectRef<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T> fmt::Debug for ObjectRef<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectRef({:p})", self.as_ptr())
    }
}

/// Weak member pointing at an [`ObjectRef`]'s object.
///
/// Stores the raw form of a [`Weak`] so that reads are a single atomic load.
pub struct WeakMember<T> {
    pointer: AtomicPtr<T>,
}

impl<T> WeakMember<T> {
    fn with_weak<U>(&self, f: impl FnOnce(&Weak<T>) -> U) -> Option<U> {
        let raw = self.pointer.load(Ordering::Acquire);
        if raw.is_null() {
            return None;
        }
        // SAFETY: `raw` came from `Weak::into_raw` and is only given back in
        // `release`, which takes `&mut self`.
        let weak = ManuallyDrop::new(unsafe { Weak::from_raw(raw as *const T) });
        Some(f(&weak))
    }
}

impl<T: Send + Sync> WeakHandle<ObjectRef<T>> for WeakMember<T> {
    fn new(obj: &ObjectRef<T>) -> Self {
        Self {
            pointer: AtomicPtr::new(Weak::into_raw(obj.downgrade()) as *mut T),
        }
    }

    fn is_null(&self) -> bool {
        self.pointer.load(Ordering::Relaxed).is_null()
    }

    fn peek(&self) -> Option<ObjectRef<T>> {
        self.with_weak(Weak::upgrade).flatten().map(ObjectRef)
    }

    fn refers_to(&self, obj: &ObjectRef<T>) -> bool {
        self.with_weak(|weak| weak.as_ptr() == obj.as_ptr())
            .unwrap_or(false)
    }

    fn release(&mut self) {
        let raw = std::mem::replace(self.pointer.get_mut(), null_mut());
        if !raw.is_null() {
            // SAFETY: see `with_weak`.
            drop(unsafe { Weak::from_raw(raw as *const T) });
        }
    }
}

impl<T> Drop for WeakMember<T> {
    fn drop(&mut self) {
        let raw = std::mem::replace(self.pointer.get_mut(), null_mut());
        if !raw.is_null() {
            // SAFETY: see `with_weak`.
            drop(unsafe { Weak::from_raw(raw as *const T) });
        }
    }
}
