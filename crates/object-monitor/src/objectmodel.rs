//! # Object model
//!
//! The monitor sees objects only through two narrow windows: the header word
//! ([`header::MarkWord`]), which an inflated object points at its monitor
//! with, and a weak back-reference ([`reference::WeakHandle`]) from the
//! monitor to its object.

pub mod header;
pub mod reference;
