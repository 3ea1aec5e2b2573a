//! Thread-local runtime state
//!
//! Every OS thread that touches a fiber has:
//!
//! - a *current* fiber (whatever is executing right now),
//! - a *root* fiber standing for the thread's native stack, created lazily,
//! - optionally a *dispatch* fiber that scheduled fibers yield back to
//!   (the scheduler run loop on that thread),
//! - optionally the scheduler the thread works for.
//!
//! Fibers migrate between threads, so each accessor is `#[inline(never)]`:
//! a thread-local address must be recomputed after every context switch,
//! never cached across one.

use crate::fiber::Fiber;
use crate::scheduler::Driver;
use std::cell::{Cell, RefCell};
use std::ptr;
use std::sync::{Arc, Weak};

thread_local! {
    /// Fiber executing on this thread
    static CURRENT_FIBER: Cell<*const Fiber> = const { Cell::new(ptr::null()) };

    /// This thread's native-stack fiber
    static ROOT_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// Where dispatched fibers yield to
    static DISPATCH_FIBER: RefCell<Option<Arc<Fiber>>> = const { RefCell::new(None) };

    /// Scheduler this thread works for
    static CURRENT_SCHEDULER: RefCell<Option<Weak<dyn Driver>>> = const { RefCell::new(None) };
}

/// Make sure this thread has a root fiber and a current fiber
///
/// Called at every thread entry point of the runtime and lazily by
/// `Fiber::current()`.
#[inline(never)]
pub fn ensure_initialized_for_this_thread() {
    if !current_fiber_ptr().is_null() {
        return;
    }
    let root = Fiber::new_root();
    set_current_fiber(Arc::as_ptr(&root));
    ROOT_FIBER.with(|cell| *cell.borrow_mut() = Some(root));
}

#[inline(never)]
pub(crate) fn current_fiber_ptr() -> *const Fiber {
    CURRENT_FIBER.with(|cell| cell.get())
}

#[inline(never)]
pub(crate) fn set_current_fiber(fiber: *const Fiber) {
    CURRENT_FIBER.with(|cell| cell.set(fiber));
}

/// Clear the current pointer if it still names `fiber`
///
/// Used by the root fiber's destructor, which may run during thread
/// teardown.
pub(crate) fn clear_current_fiber_if(fiber: *const Fiber) {
    let _ = CURRENT_FIBER.try_with(|cell| {
        if cell.get() == fiber {
            cell.set(ptr::null());
        }
    });
}

/// This thread's root fiber
#[inline(never)]
pub(crate) fn root_fiber() -> Arc<Fiber> {
    ensure_initialized_for_this_thread();
    ROOT_FIBER.with(|cell| {
        let root = cell.borrow();
        match root.as_ref() {
            Some(root) => root.clone(),
            None => unreachable!("root fiber missing after initialization"),
        }
    })
}

#[inline(never)]
pub(crate) fn dispatch_fiber() -> Option<Arc<Fiber>> {
    DISPATCH_FIBER.with(|cell| cell.borrow().clone())
}

#[inline(never)]
pub(crate) fn set_dispatch_fiber(fiber: Option<Arc<Fiber>>) {
    DISPATCH_FIBER.with(|cell| *cell.borrow_mut() = fiber);
}

/// Scheduler bound to this thread, if it is still alive
#[inline(never)]
pub(crate) fn scheduler() -> Option<Arc<dyn Driver>> {
    CURRENT_SCHEDULER
        .try_with(|cell| cell.borrow().as_ref().and_then(Weak::upgrade))
        .ok()
        .flatten()
}

/// Weak handle of the bound scheduler without upgrading it
#[inline(never)]
pub(crate) fn scheduler_weak() -> Option<Weak<dyn Driver>> {
    CURRENT_SCHEDULER.with(|cell| cell.borrow().clone())
}

#[inline(never)]
pub(crate) fn set_scheduler(driver: Option<Weak<dyn Driver>>) {
    CURRENT_SCHEDULER.with(|cell| *cell.borrow_mut() = driver);
}
