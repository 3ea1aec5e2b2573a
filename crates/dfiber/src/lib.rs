//! # dfiber - stackful fibers over a thread pool
//!
//! Cooperative fibers multiplexed onto a small pool of OS threads, with an
//! epoll reactor that parks fibers on file descriptors and timers.
//!
//! ## Quick Start
//!
//! ```ignore
//! use dfiber::{Runtime, RuntimeConfig, spawn, sleep};
//! use std::time::Duration;
//!
//! fn main() {
//!     let mut runtime = Runtime::new(RuntimeConfig::new().threads(4)).unwrap();
//!
//!     runtime.block_on(|| {
//!         spawn(|| {
//!             println!("Hello from a fiber!");
//!             sleep(Duration::from_millis(10));
//!             println!("Back again!");
//!         })
//!         .unwrap();
//!     });
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      User Code                              │
//! │          spawn(), yield_now(), sleep(), wait()              │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      IOManager                              │
//! │        epoll interest table, timers, tickle pipe            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Scheduler                              │
//! │           shared FIFO, run loop, idle fibers                │
//! └─────────────────────────────────────────────────────────────┘
//!          │                   │                   │
//!          ▼                   ▼                   ▼
//!    ┌───────────┐      ┌───────────┐      ┌───────────┐
//!    │  Worker   │      │  Worker   │      │  Caller   │
//!    │  Thread   │      │  Thread   │      │ (optional)│
//!    └───────────┘      └───────────┘      └───────────┘
//!          │                   │                   │
//!          └───────────────────┼───────────────────┘
//!                              ▼
//!    ┌─────────────────────────────────────────────────────────┐
//!    │                      Fibers                             │
//!    │      mmap'd stacks, guard pages, naked-asm switch       │
//!    └─────────────────────────────────────────────────────────┘
//! ```

// Re-export core types
pub use dfiber_core::{ConfigError, Event, FiberId, FiberState, MemoryError, SchedError, SchedResult};

// Re-export env utilities
pub use dfiber_core::{env_get, env_get_bool, env_get_millis, env_get_opt, env_get_str, env_is_set};

// Re-export runtime types
pub use dfiber_runtime::{
    Clock, Driver, Fiber, FiberBody, IOManager, MonotonicClock, RuntimeConfig, Scheduler, Task,
    Timer, TimerCallback, TimerManager,
};

use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// Owns an `IOManager` and stops it when dropped
///
/// With `use_caller` (the default) the creating thread is one of the
/// workers: queued fibers that no spawned worker picks up run when the
/// runtime shuts down.
pub struct Runtime {
    iom: Arc<IOManager>,
    stopped: bool,
}

impl Runtime {
    /// Create and start a runtime
    pub fn new(config: RuntimeConfig) -> SchedResult<Self> {
        let iom = IOManager::new(config)?;
        Ok(Self { iom, stopped: false })
    }

    /// Runtime configured from `DFIBER_*` environment variables
    pub fn from_env() -> SchedResult<Self> {
        Self::new(RuntimeConfig::from_env())
    }

    /// The reactor behind this runtime
    pub fn io(&self) -> &Arc<IOManager> {
        &self.iom
    }

    /// Run `f` on the calling thread, then shut down
    ///
    /// Returns after every fiber, timer and event registered along the
    /// way has finished.
    pub fn block_on<F, T>(&mut self, f: F) -> T
    where
        F: FnOnce() -> T,
    {
        let result = f();
        self.shutdown();
        result
    }

    /// Spawn a fiber on this runtime
    pub fn spawn<F>(&self, f: F) -> SchedResult<FiberId>
    where
        F: FnOnce() + Send + 'static,
    {
        let fiber = Fiber::new(f, 0, true)?;
        let id = fiber.id();
        self.iom.schedule(fiber);
        Ok(id)
    }

    /// Drain and join the workers; idempotent
    pub fn shutdown(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.iom.stop();
            tracing::debug!("runtime shut down");
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Spawn a fiber on the scheduler the calling thread belongs to
///
/// # Errors
///
/// `SchedError::NoScheduler` if the thread is neither a worker nor the
/// creating thread of a use_caller runtime.
///
/// # Example
///
/// ```ignore
/// use dfiber::spawn;
///
/// spawn(|| {
///     for _ in 0..3 {
///         dfiber::yield_now();
///     }
/// })?;
/// ```
pub fn spawn<F>(f: F) -> SchedResult<FiberId>
where
    F: FnOnce() + Send + 'static,
{
    let driver = Scheduler::current().ok_or(SchedError::NoScheduler)?;
    let fiber = Fiber::new(f, 0, true)?;
    let id = fiber.id();
    driver.scheduler().schedule(fiber);
    Ok(id)
}

/// Requeue the current fiber behind everything already waiting
///
/// If called from outside a fiber, this yields the OS thread.
#[inline]
pub fn yield_now() {
    dfiber_runtime::yield_now()
}

/// Suspend the current fiber for `duration`
///
/// Falls back to `std::thread::sleep` outside a reactor worker.
pub fn sleep(duration: Duration) {
    match IOManager::current() {
        Some(iom) => iom.sleep(duration),
        None => std::thread::sleep(duration),
    }
}

/// Suspend the current fiber until `fd` is ready for `event`
pub fn wait(fd: RawFd, event: Event) -> SchedResult<()> {
    let iom = IOManager::current().ok_or(SchedError::NoScheduler)?;
    iom.wait(fd, event)
}

/// Id of the fiber executing on this thread
///
/// `None` if the thread has never touched a fiber.
#[inline]
pub fn current_id() -> Option<FiberId> {
    Fiber::current_id()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    fn config(name: &str) -> RuntimeConfig {
        RuntimeConfig::new().threads(2).use_caller(true).name(name)
    }

    #[test]
    fn test_block_on_runs_spawned_fibers() {
        let mut runtime = Runtime::new(config("block_on")).unwrap();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        let value = runtime.block_on(move || {
            for _ in 0..10 {
                let c = c.clone();
                spawn(move || {
                    yield_now();
                    c.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            }
            42
        });

        assert_eq!(value, 42);
        assert_eq!(count.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_spawn_without_scheduler() {
        assert!(matches!(spawn(|| {}), Err(SchedError::NoScheduler)));
    }

    #[test]
    fn test_sleep_inside_fiber() {
        let mut runtime = Runtime::new(config("sleepy")).unwrap();
        let elapsed = Arc::new(std::sync::Mutex::new(Duration::ZERO));

        let e = elapsed.clone();
        runtime
            .spawn(move || {
                let start = Instant::now();
                sleep(Duration::from_millis(30));
                *e.lock().unwrap() = start.elapsed();
            })
            .unwrap();
        runtime.shutdown();

        assert!(*elapsed.lock().unwrap() >= Duration::from_millis(30));
    }

    #[test]
    fn test_fiber_ids_are_unique() {
        let runtime = Runtime::new(config("ids")).unwrap();
        let a = runtime.spawn(|| {}).unwrap();
        let b = runtime.spawn(|| {}).unwrap();
        assert_ne!(a, b);
        // Drop shuts the runtime down
    }

    #[test]
    fn test_current_id_inside_fiber() {
        let mut runtime = Runtime::new(config("current")).unwrap();
        let seen = Arc::new(AtomicUsize::new(0));

        let s = seen.clone();
        let id = runtime
            .spawn(move || {
                let id = current_id().map(|id| id.as_u64()).unwrap_or(0);
                s.store(id as usize, Ordering::SeqCst);
            })
            .unwrap();
        runtime.shutdown();

        assert_eq!(seen.load(Ordering::SeqCst) as u64, id.as_u64());
    }
}
