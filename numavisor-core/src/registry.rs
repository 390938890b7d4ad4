//! Active-monitor registration table
//!
//! The NMI sample handler and the host page-fault handler both need to
//! reach the monitor without owning it. While monitoring runs, exactly one
//! `Monitor` is published here; teardown unpublishes the pointer, then
//! disables the sample source (whose `disable` contract guarantees no
//! handler is still running) before the allocation is reclaimed.

use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use alloc::boxed::Box;

use crate::monitor::Monitor;

static ACTIVE: AtomicPtr<Monitor> = AtomicPtr::new(ptr::null_mut());

pub(crate) fn is_active() -> bool {
    !ACTIVE.load(Ordering::Acquire).is_null()
}

/// Publish a freshly built monitor. Fails when one is already registered.
pub(crate) fn publish(monitor: Box<Monitor>) -> Result<(), Box<Monitor>> {
    let ptr = Box::into_raw(monitor);
    match ACTIVE.compare_exchange(
        ptr::null_mut(),
        ptr,
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        Ok(_) => Ok(()),
        Err(_) => Err(unsafe { Box::from_raw(ptr) }),
    }
}

/// Withdraw the registration and regain ownership.
pub(crate) fn unpublish() -> Option<Box<Monitor>> {
    let ptr = ACTIVE.swap(ptr::null_mut(), Ordering::AcqRel);
    if ptr.is_null() {
        None
    } else {
        // Sole owner again: the pointer was published exactly once and no
        // new reader can obtain it past the swap.
        Some(unsafe { Box::from_raw(ptr) })
    }
}

/// Run `f` against the active monitor, if any.
pub(crate) fn with_active<R>(f: impl FnOnce(&Monitor) -> R) -> Option<R> {
    let ptr = ACTIVE.load(Ordering::Acquire);
    if ptr.is_null() {
        return None;
    }
    // Valid for the duration of the call: reclamation happens only after
    // the sample source is quiesced and every per-CPU token reclaimed.
    Some(f(unsafe { &*ptr }))
}
