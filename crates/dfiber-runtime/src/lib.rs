//! # dfiber-runtime
//!
//! Platform-specific runtime for the dfiber scheduler.
//!
//! This crate provides:
//! - Stackful fibers with mmap'd, guard-paged stacks
//! - Context switching (architecture-specific assembly)
//! - An ordered timer set with recurring and conditional timers
//! - A thread-pool scheduler with a shared FIFO task queue
//! - An epoll reactor (`IOManager`) layered on the scheduler

pub mod arch;
pub mod clock;
pub mod config;
pub mod fiber;
pub mod iomanager;
pub mod memory;
pub mod scheduler;
pub mod timer;
pub mod tls;
pub mod worker;

// Re-exports
pub use clock::{Clock, MonotonicClock};
pub use config::RuntimeConfig;
pub use fiber::{Fiber, FiberBody};
pub use iomanager::IOManager;
pub use memory::Stack;
pub use scheduler::{yield_now, Driver, Scheduler, Task};
pub use timer::{Timer, TimerCallback, TimerManager};
pub use worker::WorkerPool;

// Platform detection
cfg_if::cfg_if! {
    if #[cfg(not(target_os = "linux"))] {
        compile_error!("dfiber-runtime requires Linux (epoll)");
    }
}
