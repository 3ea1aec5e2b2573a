//! Fiber stack memory
//!
//! Platform-specific implementations handle virtual memory allocation.
//! Each stack is its own mapping with a PROT_NONE guard page below the
//! usable region, so an overflow faults instead of scribbling over a
//! neighbouring allocation.

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        mod unix;
        pub use unix::page_size;
    } else {
        compile_error!("dfiber stacks require a unix target");
    }
}

use std::ptr::NonNull;

/// An owned, fixed-size fiber stack
///
/// Layout (stack grows down):
///
/// ```text
/// base                 base + GUARD            base + len
/// | guard (PROT_NONE) | usable (RW) ...........| <- top
/// ```
pub struct Stack {
    /// Start of the mapping (guard page)
    base: NonNull<u8>,

    /// Whole mapping, guard included
    len: usize,

    /// Guard size (one page)
    guard: usize,
}

// The mapping is plain memory owned by exactly one Fiber.
unsafe impl Send for Stack {}
unsafe impl Sync for Stack {}

impl Stack {
    /// Highest address of the stack; initial stack pointer
    #[inline]
    pub fn top(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.len) }
    }

    /// Lowest usable address (just above the guard page)
    #[inline]
    pub fn bottom(&self) -> *mut u8 {
        unsafe { self.base.as_ptr().add(self.guard) }
    }

    /// Usable size in bytes
    #[inline]
    pub fn size(&self) -> usize {
        self.len - self.guard
    }
}

impl std::fmt::Debug for Stack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stack")
            .field("bottom", &self.bottom())
            .field("top", &self.top())
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_rounds_to_pages() {
        let page = page_size();
        let stack = Stack::new(page + 1).unwrap();
        assert_eq!(stack.size(), 2 * page);
        assert_eq!(stack.top() as usize % page, 0);
        assert_eq!(stack.top() as usize - stack.bottom() as usize, stack.size());
    }

    #[test]
    fn test_stack_is_writable_end_to_end() {
        let stack = Stack::new(64 * 1024).unwrap();
        unsafe {
            stack.bottom().write(0xAB);
            stack.top().sub(1).write(0xCD);
            assert_eq!(stack.bottom().read(), 0xAB);
            assert_eq!(stack.top().sub(1).read(), 0xCD);
        }
    }

    #[test]
    fn test_stack_too_large() {
        let err = Stack::new(usize::MAX - 10).unwrap_err();
        assert!(matches!(err, dfiber_core::MemoryError::TooLarge(_)));
    }
}
