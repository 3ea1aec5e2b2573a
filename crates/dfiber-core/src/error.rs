//! Error types for the dfiber runtime
//!
//! Only recoverable failures are represented here. Broken caller contracts
//! (resuming a fiber that is not READY, registering the same event twice)
//! panic at the call site instead.

use std::io;
use thiserror::Error;

/// Result type for runtime operations
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors that can occur in runtime operations
#[derive(Debug, Error)]
pub enum SchedError {
    /// An OS call failed
    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// Fiber stack allocation failed
    #[error("memory error: {0}")]
    Memory(#[from] MemoryError),

    /// Configuration rejected by `validate()`
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Worker thread could not be spawned
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[source] io::Error),

    /// `start()` called twice
    #[error("scheduler already started")]
    AlreadyStarted,

    /// Operation needs a scheduler but none is bound to this thread
    #[error("no scheduler bound to the current thread")]
    NoScheduler,
}

impl SchedError {
    /// Wrap an OS error together with the name of the failing call
    pub fn os(op: &'static str, source: impl Into<io::Error>) -> Self {
        SchedError::Os {
            op,
            source: source.into(),
        }
    }

    /// Raw errno for `Os` errors
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            SchedError::Os { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }
}

/// Stack memory errors (errno attached)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MemoryError {
    /// mmap failed
    #[error("stack mmap failed (errno {0})")]
    AllocationFailed(i32),

    /// mprotect failed
    #[error("stack mprotect failed (errno {0})")]
    ProtectionFailed(i32),

    /// Requested size overflows the address space
    #[error("stack size {0} is too large")]
    TooLarge(usize),
}

/// Configuration error
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid config: {0}")]
    InvalidValue(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    // Same value on every Linux target
    const EBADF: i32 = 9;

    #[test]
    fn test_error_display() {
        let e = SchedError::os("epoll_ctl", io::Error::from_raw_os_error(EBADF));
        assert!(format!("{}", e).starts_with("epoll_ctl failed: "));
        assert_eq!(e.raw_os_error(), Some(EBADF));

        let e = SchedError::Memory(MemoryError::AllocationFailed(12));
        assert_eq!(format!("{}", e), "memory error: stack mmap failed (errno 12)");

        let e: SchedError = ConfigError::InvalidValue("threads must be > 0").into();
        assert_eq!(format!("{}", e), "invalid config: threads must be > 0");
    }

    #[test]
    fn test_error_conversion() {
        let mem_err = MemoryError::TooLarge(usize::MAX);
        let sched_err: SchedError = mem_err.into();
        assert!(matches!(sched_err, SchedError::Memory(MemoryError::TooLarge(_))));
        assert_eq!(sched_err.raw_os_error(), None);
    }
}
