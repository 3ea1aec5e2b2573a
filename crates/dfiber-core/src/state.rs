//! Fiber lifecycle state

use core::fmt;

/// State of a fiber
///
/// A fiber is created `Ready`, becomes `Running` while it owns the CPU and
/// drops back to `Ready` when it yields. Once its body returns it is `Term`
/// and may only be recycled with `reset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FiberState {
    /// Suspended, may be resumed
    Ready = 0,

    /// Currently executing on some thread
    Running = 1,

    /// Body has returned
    Term = 2,
}

impl FiberState {
    /// Check if `resume()` is allowed from this state
    #[inline]
    pub const fn is_resumable(&self) -> bool {
        matches!(self, FiberState::Ready)
    }

    /// Check if the fiber's body has finished
    #[inline]
    pub const fn is_terminated(&self) -> bool {
        matches!(self, FiberState::Term)
    }
}

impl From<u8> for FiberState {
    fn from(v: u8) -> Self {
        match v {
            0 => FiberState::Ready,
            1 => FiberState::Running,
            2 => FiberState::Term,
            _ => unreachable!("invalid fiber state {}", v),
        }
    }
}

impl From<FiberState> for u8 {
    fn from(state: FiberState) -> u8 {
        state as u8
    }
}

impl fmt::Display for FiberState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FiberState::Ready => "READY",
            FiberState::Running => "RUNNING",
            FiberState::Term => "TERM",
        };
        f.write_str(s)
    }
}
