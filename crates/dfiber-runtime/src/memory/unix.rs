//! Unix stack implementation using mmap

use super::Stack;
use dfiber_core::error::MemoryError;
use nix::errno::Errno;
use std::ptr::NonNull;
use std::sync::OnceLock;

/// System page size, cached after the first call
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| {
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz > 0 {
            sz as usize
        } else {
            dfiber_core::constants::GUARD_SIZE
        }
    })
}

impl Stack {
    /// Map a new stack with at least `size` usable bytes
    ///
    /// The whole range is reserved PROT_NONE first; everything above the
    /// guard page is then made read/write. Physical pages are only touched
    /// on first use.
    pub fn new(size: usize) -> Result<Stack, MemoryError> {
        let page = page_size();
        let usable = size
            .max(1)
            .checked_add(page - 1)
            .map(|s| s & !(page - 1))
            .ok_or(MemoryError::TooLarge(size))?;
        let len = usable.checked_add(page).ok_or(MemoryError::TooLarge(size))?;

        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_NONE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed(Errno::last_raw()));
        }

        // Guard page at the bottom remains PROT_NONE
        let ret = unsafe {
            libc::mprotect(
                (base as *mut u8).add(page) as *mut libc::c_void,
                usable,
                libc::PROT_READ | libc::PROT_WRITE,
            )
        };
        if ret != 0 {
            let errno = Errno::last_raw();
            unsafe { libc::munmap(base, len) };
            return Err(MemoryError::ProtectionFailed(errno));
        }

        // mmap never returns null on success
        let base = NonNull::new(base as *mut u8).ok_or(MemoryError::AllocationFailed(0))?;
        Ok(Stack {
            base,
            len,
            guard: page,
        })
    }
}

impl Drop for Stack {
    fn drop(&mut self) {
        let ret = unsafe { libc::munmap(self.base.as_ptr() as *mut libc::c_void, self.len) };
        if ret != 0 {
            tracing::error!(
                base = ?self.base,
                len = self.len,
                errno = Errno::last_raw(),
                "munmap of fiber stack failed"
            );
        }
    }
}
