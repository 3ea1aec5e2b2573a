//! AArch64 context switching (AAPCS64)
//!
//! Saves x19-x28, the frame pointer, the link register and the low halves
//! of v8-v15 (d8-d15), which is everything a callee must preserve.

use super::EntryFn;
use std::arch::naked_asm;

/// Field offsets are used by the assembly below; do not reorder.
#[repr(C)]
#[derive(Debug, Default)]
#[allow(dead_code)] // read and written by switch_context
pub struct Context {
    sp: u64,            // 0x00
    pc: u64,            // 0x08
    x19_x28: [u64; 10], // 0x10..0x60
    fp: u64,            // 0x60 (x29)
    lr: u64,            // 0x68 (x30)
    d8_d15: [u64; 8],   // 0x70..0xB0
}

/// Prepare `ctx` so that switching to it calls `entry(arg)` on the stack
/// ending at `stack_top`.
///
/// # Safety
///
/// `stack_top` must be the high end of a writable stack region that stays
/// mapped for as long as the context can run.
#[inline]
pub unsafe fn init_context(ctx: &mut Context, stack_top: *mut u8, entry: EntryFn, arg: usize) {
    let sp = (stack_top as usize) & !0xF;

    *ctx = Context::default();
    ctx.sp = sp as u64;
    ctx.pc = fiber_trampoline as usize as u64;
    ctx.x19_x28[0] = entry as usize as u64; // x19
    ctx.x19_x28[1] = arg as u64; // x20
}

#[unsafe(naked)]
unsafe extern "C" fn fiber_trampoline() {
    naked_asm!(
        "mov x0, x20",
        "blr x19",
        "brk #0",
    );
}

/// Save callee-saved registers into `old` and resume `new`
///
/// # Safety
///
/// Same contract as the x86_64 version.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_old: *mut Context, _new: *const Context) {
    naked_asm!(
        // Save into old (x0)
        "mov x9, sp",
        "str x9, [x0, #0x00]",
        "adr x10, 1f",
        "str x10, [x0, #0x08]",
        "stp x19, x20, [x0, #0x10]",
        "stp x21, x22, [x0, #0x20]",
        "stp x23, x24, [x0, #0x30]",
        "stp x25, x26, [x0, #0x40]",
        "stp x27, x28, [x0, #0x50]",
        "stp x29, x30, [x0, #0x60]",
        "stp d8, d9, [x0, #0x70]",
        "stp d10, d11, [x0, #0x80]",
        "stp d12, d13, [x0, #0x90]",
        "stp d14, d15, [x0, #0xA0]",
        // Load from new (x1)
        "ldr x9, [x1, #0x00]",
        "mov sp, x9",
        "ldr x10, [x1, #0x08]",
        "ldp x19, x20, [x1, #0x10]",
        "ldp x21, x22, [x1, #0x20]",
        "ldp x23, x24, [x1, #0x30]",
        "ldp x25, x26, [x1, #0x40]",
        "ldp x27, x28, [x1, #0x50]",
        "ldp x29, x30, [x1, #0x60]",
        "ldp d8, d9, [x1, #0x70]",
        "ldp d10, d11, [x1, #0x80]",
        "ldp d12, d13, [x1, #0x90]",
        "ldp d14, d15, [x1, #0xA0]",
        "br x10",
        // Resume point of a saved context
        "1:",
        "ret",
    );
}
