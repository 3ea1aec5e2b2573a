//! Architecture-specific context switching
//!
//! Each backend exposes the same three items:
//!
//! - `Context` - callee-saved register snapshot of a suspended fiber
//! - `init_context` - prepare a fresh context that enters `entry(arg)` on a new stack
//! - `switch_context` - save the running context and load another one
//!
//! Nothing above `fiber` touches these directly.

cfg_if::cfg_if! {
    if #[cfg(target_arch = "x86_64")] {
        mod x86_64;
        pub use self::x86_64::{init_context, switch_context, Context};
    } else if #[cfg(target_arch = "aarch64")] {
        mod aarch64;
        pub use self::aarch64::{init_context, switch_context, Context};
    } else {
        compile_error!("dfiber supports x86_64 and aarch64 only");
    }
}

/// Entry point a fresh context jumps into. Must never return.
pub type EntryFn = extern "C" fn(usize) -> !;
