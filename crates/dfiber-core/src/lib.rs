//! # dfiber-core
//!
//! Core types for the dfiber runtime.
//!
//! This crate is platform-agnostic and contains no OS-specific code.
//! Fibers, the scheduler, timers and the epoll reactor live in
//! `dfiber-runtime`.
//!
//! ## Modules
//!
//! - `id` - Fiber identifier type
//! - `state` - Fiber lifecycle state
//! - `event` - I/O interest mask (READ / WRITE)
//! - `error` - Error types
//! - `env` - Environment variable utilities

pub mod id;
pub mod state;
pub mod event;
pub mod error;
pub mod env;

// Re-exports for convenience
pub use id::FiberId;
pub use state::FiberState;
pub use event::Event;
pub use error::{ConfigError, MemoryError, SchedError, SchedResult};
pub use env::{env_get, env_get_bool, env_get_millis, env_get_opt, env_get_str, env_is_set};

/// Constants for stack layout
pub mod constants {
    /// Default fiber stack size (128 KB)
    pub const DEFAULT_STACK_SIZE: usize = 128 * 1024;

    /// Smallest stack a fiber may be configured with
    pub const MIN_STACK_SIZE: usize = 16 * 1024;

    /// Guard page size below every fiber stack (4 KB)
    pub const GUARD_SIZE: usize = 4096;
}
