//! Stackful fibers
//!
//! A `Fiber` owns an mmap'd stack, a saved register context and a body
//! closure. `resume()` switches from the calling context into the fiber;
//! the fiber runs until it calls `yield_now()` or its body returns, at
//! which point control comes back out of `resume()`.
//!
//! Every thread has a *root* fiber standing for its native stack. Fibers
//! created with `dispatched = true` yield to the thread's dispatch fiber
//! (the scheduler run loop); all others yield to the root fiber.
//!
//! Ownership: whoever calls `resume()` holds an `Arc<Fiber>` for the
//! duration of the call. The trampoline only borrows the fiber, so when the
//! body finishes nothing on the fiber's own stack keeps it alive and the
//! last owner (a task queue slot, an event registration) frees it.

use crate::arch::{self, Context};
use crate::memory::Stack;
use crate::tls;
use dfiber_core::constants::DEFAULT_STACK_SIZE;
use dfiber_core::{FiberId, FiberState, SchedResult};
use parking_lot::Mutex;
use std::any::Any;
use std::cell::UnsafeCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

/// Body of a fiber or a scheduled callback
pub type FiberBody = Box<dyn FnOnce() + Send + 'static>;

/// Number of live fibers, root fibers included
static FIBER_COUNT: AtomicU64 = AtomicU64::new(0);

pub struct Fiber {
    id: FiberId,
    state: AtomicU8,

    /// Set from `resume()` until the resumer regains control, i.e. until
    /// this fiber's registers have been saved after it yielded. A READY
    /// fiber with `on_cpu` set is still executing its final instructions
    /// on some thread and must not be resumed elsewhere yet.
    on_cpu: AtomicBool,

    /// Yields to the dispatch fiber instead of the root fiber
    dispatched: bool,

    context: UnsafeCell<Context>,

    /// `None` for root fibers
    stack: Option<Stack>,

    body: Mutex<Option<FiberBody>>,

    /// Panic payload caught in the trampoline, re-raised by `resume()`
    panic: Mutex<Option<Box<dyn Any + Send>>>,
}

// The context is only touched by the thread that is switching into or out
// of the fiber, and `on_cpu` keeps two threads from doing that at once.
unsafe impl Send for Fiber {}
unsafe impl Sync for Fiber {}

impl Fiber {
    /// Create a fiber that will run `body` on a fresh stack
    ///
    /// `stack_size == 0` selects the default (128 KB). The fiber starts
    /// READY; nothing runs until the first `resume()`.
    pub fn new<F>(body: F, stack_size: usize, dispatched: bool) -> SchedResult<Arc<Fiber>>
    where
        F: FnOnce() + Send + 'static,
    {
        Self::with_body(Box::new(body), stack_size, dispatched)
    }

    pub(crate) fn with_body(
        body: FiberBody,
        stack_size: usize,
        dispatched: bool,
    ) -> SchedResult<Arc<Fiber>> {
        let size = if stack_size == 0 { DEFAULT_STACK_SIZE } else { stack_size };
        let stack = Stack::new(size)?;

        let fiber = Arc::new(Fiber {
            id: FiberId::next(),
            state: AtomicU8::new(FiberState::Ready as u8),
            on_cpu: AtomicBool::new(false),
            dispatched,
            context: UnsafeCell::new(Context::default()),
            stack: Some(stack),
            body: Mutex::new(Some(body)),
            panic: Mutex::new(None),
        });
        fiber.init_context();
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);

        tracing::trace!(fiber = %fiber.id, size, dispatched, "fiber created");
        Ok(fiber)
    }

    /// Root fiber for the calling thread; see `tls::ensure_initialized_for_this_thread`
    pub(crate) fn new_root() -> Arc<Fiber> {
        FIBER_COUNT.fetch_add(1, Ordering::Relaxed);
        let fiber = Arc::new(Fiber {
            id: FiberId::next(),
            state: AtomicU8::new(FiberState::Running as u8),
            on_cpu: AtomicBool::new(false),
            dispatched: false,
            context: UnsafeCell::new(Context::default()),
            stack: None,
            body: Mutex::new(None),
            panic: Mutex::new(None),
        });
        tracing::trace!(fiber = %fiber.id, "root fiber created");
        fiber
    }

    fn init_context(self: &Arc<Self>) {
        let top = match self.stack.as_ref() {
            Some(stack) => stack.top(),
            None => unreachable!("root fibers have no entry point"),
        };
        // SAFETY: the fiber is not running (READY or TERM), so nobody else
        // reads or writes the context, and the stack lives as long as self.
        unsafe {
            arch::init_context(
                &mut *self.context.get(),
                top,
                fiber_entry,
                Arc::as_ptr(self) as usize,
            );
        }
    }

    #[inline]
    pub fn id(&self) -> FiberId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> FiberState {
        FiberState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn set_state(&self, state: FiberState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Participates in scheduler dispatch
    #[inline]
    pub fn is_dispatched(&self) -> bool {
        self.dispatched
    }

    /// Owns a stack (false for root fibers)
    #[inline]
    pub fn has_stack(&self) -> bool {
        self.stack.is_some()
    }

    /// Lowest usable stack address, for diagnostics
    pub fn stack_bottom(&self) -> Option<*const u8> {
        self.stack.as_ref().map(|s| s.bottom() as *const u8)
    }

    /// RUNNING, or READY but still switching out on some thread
    #[inline]
    pub fn is_busy(&self) -> bool {
        self.state() == FiberState::Running || self.on_cpu.load(Ordering::Acquire)
    }

    /// Fiber that `yield_now()` returns control to
    fn return_target(&self) -> Arc<Fiber> {
        if self.dispatched {
            if let Some(dispatch) = tls::dispatch_fiber() {
                return dispatch;
            }
        }
        tls::root_fiber()
    }

    /// Switch into this fiber until it yields or terminates
    ///
    /// # Panics
    ///
    /// If the fiber is not READY, if it is still switching out on another
    /// thread, or if the calling context is not the fiber it would yield
    /// back to. A panic raised by the body is re-raised here once the fiber
    /// has terminated.
    pub fn resume(self: &Arc<Self>) {
        let state = self.state();
        assert_eq!(
            state,
            FiberState::Ready,
            "resume() on fiber {} in state {}",
            self.id,
            state
        );
        assert!(self.has_stack(), "resume() on a root fiber");

        let from = self.return_target();
        assert!(
            ptr::eq(tls::current_fiber_ptr(), Arc::as_ptr(&from)),
            "fiber {} must be resumed from the fiber it yields to ({})",
            self.id,
            from.id
        );
        assert!(
            !self.on_cpu.swap(true, Ordering::AcqRel),
            "fiber {} resumed while still on another cpu",
            self.id
        );

        tls::set_current_fiber(Arc::as_ptr(self));
        self.set_state(FiberState::Running);

        // SAFETY: `from` is the running context and `self` is suspended
        // (READY and not on any cpu); both outlive the switch.
        unsafe { arch::switch_context(from.context.get(), self.context.get()) };

        // Back on `from`'s stack: self's registers are saved.
        self.on_cpu.store(false, Ordering::Release);

        if let Some(payload) = self.panic.lock().take() {
            panic::resume_unwind(payload);
        }
    }

    /// Give control back to the fiber this one yields to
    ///
    /// RUNNING becomes READY; a TERM fiber stays TERM.
    ///
    /// # Panics
    ///
    /// If this fiber is not the current one, is READY, or is a root fiber.
    pub fn yield_now(&self) {
        let state = self.state();
        assert!(
            matches!(state, FiberState::Running | FiberState::Term),
            "yield_now() on fiber {} in state {}",
            self.id,
            state
        );
        assert!(
            ptr::eq(tls::current_fiber_ptr(), self),
            "yield_now() on fiber {} which is not current",
            self.id
        );
        assert!(self.has_stack(), "yield_now() on a root fiber");

        // The target is kept alive by the thread-local slots; hold only its
        // context pointer so a terminated fiber leaves no count behind.
        let to = self.return_target();
        let to_ctx = to.context.get();
        tls::set_current_fiber(Arc::as_ptr(&to));
        drop(to);

        if state == FiberState::Running {
            self.set_state(FiberState::Ready);
        }

        // SAFETY: self is the running context; the target is suspended in
        // `resume()` on this thread.
        unsafe { arch::switch_context(self.context.get(), to_ctx) };
    }

    /// Recycle a terminated fiber's stack for a new body
    ///
    /// # Panics
    ///
    /// If the fiber has no stack or is not TERM.
    pub fn reset<F>(self: &Arc<Self>, body: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.reset_body(Box::new(body));
    }

    pub(crate) fn reset_body(self: &Arc<Self>, body: FiberBody) {
        assert!(self.has_stack(), "reset() on a root fiber");
        let state = self.state();
        assert_eq!(state, FiberState::Term, "reset() on fiber {} in state {}", self.id, state);
        debug_assert!(!self.on_cpu.load(Ordering::Acquire));

        *self.body.lock() = Some(body);
        self.init_context();
        self.set_state(FiberState::Ready);
    }

    /// Fiber executing on this thread, creating the root fiber on first use
    pub fn current() -> Arc<Fiber> {
        tls::ensure_initialized_for_this_thread();
        let ptr = tls::current_fiber_ptr();
        // SAFETY: the current fiber is owned by its resumer (or by the
        // thread-local root slot) for as long as it runs, and the pointer
        // was produced by Arc::as_ptr.
        unsafe {
            Arc::increment_strong_count(ptr);
            Arc::from_raw(ptr)
        }
    }

    /// Yield the current fiber
    pub fn yield_current() {
        let fiber = Fiber::current();
        fiber.yield_now();
    }

    /// Id of the fiber executing on this thread, without creating a root fiber
    pub fn current_id() -> Option<FiberId> {
        let ptr = tls::current_fiber_ptr();
        if ptr.is_null() {
            None
        } else {
            // SAFETY: see `current()`
            Some(unsafe { (*ptr).id })
        }
    }

    /// Number of live fibers in the process
    pub fn total() -> u64 {
        FIBER_COUNT.load(Ordering::Relaxed)
    }
}

/// Trampoline target: runs the body of the fiber in `arg` on its own stack
extern "C" fn fiber_entry(arg: usize) -> ! {
    let fiber = arg as *const Fiber;
    debug_assert!(ptr::eq(fiber, tls::current_fiber_ptr()));

    {
        // SAFETY: the resumer holds an Arc for the whole resume() call.
        let this = unsafe { &*fiber };
        let body = this.body.lock().take();
        if let Some(body) = body {
            if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(body)) {
                tracing::debug!(fiber = %this.id, "fiber body panicked");
                *this.panic.lock() = Some(payload);
            }
        }
        this.set_state(FiberState::Term);
    }

    // SAFETY: as above; nothing on this stack holds a count on the fiber.
    unsafe { (*fiber).yield_now() };

    // A TERM fiber is never resumed again without reset(), which rebuilds
    // the context from scratch.
    tracing::error!("terminated fiber was resumed");
    std::process::abort();
}

impl Drop for Fiber {
    fn drop(&mut self) {
        FIBER_COUNT.fetch_sub(1, Ordering::Relaxed);

        if self.stack.is_some() {
            let state = self.state();
            let never_started = state == FiberState::Ready && self.body.get_mut().is_some();
            if state != FiberState::Term && !never_started && !std::thread::panicking() {
                panic!("fiber {} dropped in state {} with a live stack", self.id, state);
            }
        } else {
            tls::clear_current_fiber_if(self as *const Fiber);
        }
        tracing::trace!(fiber = %self.id, "fiber dropped");
    }
}

impl fmt::Debug for Fiber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("dispatched", &self.dispatched)
            .field("stack", &self.stack)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    // Each test runs on its own thread, so every test gets a fresh root
    // fiber and no dispatch fiber.

    #[test]
    fn test_state_lifecycle() {
        let ran = Arc::new(AtomicBool::new(false));
        let r = ran.clone();
        let fiber = Fiber::new(move || r.store(true, Ordering::SeqCst), 0, false).unwrap();

        assert_eq!(fiber.state(), FiberState::Ready);
        fiber.resume();
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(fiber.state(), FiberState::Term);
        assert!(!fiber.is_busy());
    }

    #[test]
    fn test_yield_resumes_where_it_left_off() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let fiber = Fiber::new(
            move || {
                c.fetch_add(1, Ordering::SeqCst);
                Fiber::yield_current();
                c.fetch_add(1, Ordering::SeqCst);
                Fiber::yield_current();
                c.fetch_add(1, Ordering::SeqCst);
            },
            0,
            false,
        )
        .unwrap();

        fiber.resume();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(fiber.state(), FiberState::Ready);

        fiber.resume();
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        fiber.resume();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_current_inside_and_outside() {
        let root_id = Fiber::current().id();
        assert!(!Fiber::current().has_stack());

        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        let fiber = Fiber::new(move || *s.lock() = Fiber::current_id(), 0, false).unwrap();
        fiber.resume();

        assert_eq!(*seen.lock(), Some(fiber.id()));
        assert_eq!(Fiber::current_id(), Some(root_id));
    }

    #[test]
    fn test_reset_reuses_stack() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let fiber = Fiber::new(move || { c.fetch_add(1, Ordering::SeqCst); }, 64 * 1024, false)
            .unwrap();
        let bottom = fiber.stack_bottom();

        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);

        let c = counter.clone();
        fiber.reset(move || {
            c.fetch_add(10, Ordering::SeqCst);
            Fiber::yield_current();
            c.fetch_add(100, Ordering::SeqCst);
        });
        assert_eq!(fiber.state(), FiberState::Ready);
        assert_eq!(fiber.stack_bottom(), bottom);

        fiber.resume();
        fiber.resume();
        assert_eq!(counter.load(Ordering::SeqCst), 111);
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    fn test_body_panic_surfaces_in_resume() {
        let fiber = Fiber::new(|| panic!("boom"), 0, false).unwrap();
        let err = panic::catch_unwind(AssertUnwindSafe(|| fiber.resume())).unwrap_err();
        assert_eq!(err.downcast_ref::<&str>(), Some(&"boom"));
        assert_eq!(fiber.state(), FiberState::Term);

        // The stack is still usable afterwards
        fiber.reset(|| {});
        fiber.resume();
        assert_eq!(fiber.state(), FiberState::Term);
    }

    #[test]
    #[should_panic(expected = "resume() on fiber")]
    fn test_resume_terminated_fiber_panics() {
        let fiber = Fiber::new(|| {}, 0, false).unwrap();
        fiber.resume();
        fiber.resume();
    }

    #[test]
    #[should_panic(expected = "reset() on fiber")]
    fn test_reset_ready_fiber_panics() {
        let fiber = Fiber::new(|| {}, 0, false).unwrap();
        fiber.reset(|| {});
    }

    #[test]
    fn test_dropping_unstarted_fiber_is_fine() {
        let before = Fiber::current();
        let fiber = Fiber::new(|| {}, 0, true).unwrap();
        assert!(fiber.is_dispatched());
        drop(fiber);
        assert_eq!(Fiber::current().id(), before.id());
    }

    #[test]
    fn test_fibers_can_move_between_threads() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        let fiber = Fiber::new(
            move || {
                l.lock().push(std::thread::current().name().map(str::to_owned));
                Fiber::yield_current();
                l.lock().push(std::thread::current().name().map(str::to_owned));
            },
            0,
            false,
        )
        .unwrap();

        let f = fiber.clone();
        std::thread::Builder::new()
            .name("first".into())
            .spawn(move || f.resume())
            .unwrap()
            .join()
            .unwrap();
        let f = fiber.clone();
        std::thread::Builder::new()
            .name("second".into())
            .spawn(move || f.resume())
            .unwrap()
            .join()
            .unwrap();

        assert_eq!(fiber.state(), FiberState::Term);
        assert_eq!(
            *log.lock(),
            vec![Some("first".to_string()), Some("second".to_string())]
        );
    }
}
