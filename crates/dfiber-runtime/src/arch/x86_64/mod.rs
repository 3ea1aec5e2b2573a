//! x86_64 context switching (System V AMD64)

use super::EntryFn;
use std::arch::naked_asm;

/// Callee-saved registers of a suspended fiber
///
/// Field offsets are used by the assembly below; do not reorder.
#[repr(C)]
#[derive(Debug, Default)]
#[allow(dead_code)] // read and written by switch_context
pub struct Context {
    rsp: u64, // 0x00
    rip: u64, // 0x08
    rbx: u64, // 0x10
    rbp: u64, // 0x18
    r12: u64, // 0x20
    r13: u64, // 0x28
    r14: u64, // 0x30
    r15: u64, // 0x38
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
    // 16-byte aligned here; the `call` in the trampoline pushes the return
    // address so `entry` starts with rsp % 16 == 8 as the ABI requires.
    let sp = (stack_top as usize) & !0xF;

    *ctx = Context::default();
    ctx.rsp = sp as u64;
    ctx.rip = fiber_trampoline as usize as u64;
    ctx.r12 = entry as usize as u64;
    ctx.r13 = arg as u64;
}

/// First code executed on a fresh stack
#[unsafe(naked)]
unsafe extern "C" fn fiber_trampoline() {
    naked_asm!(
        "mov rdi, r13",
        "call r12",
        // entry never returns
        "ud2",
    );
}

/// Save callee-saved registers into `old` and resume `new`
///
/// Returns when some other context switches back into `old`.
///
/// # Safety
///
/// Both pointers must be valid. `new` must hold a context produced by
/// `init_context` or by an earlier `switch_context` that has not been
/// resumed since.
#[unsafe(naked)]
pub unsafe extern "C" fn switch_context(_old: *mut Context, _new: *const Context) {
    naked_asm!(
        // Save into old (rdi)
        "mov [rdi + 0x00], rsp",
        "lea rax, [rip + 1f]",
        "mov [rdi + 0x08], rax",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], rbp",
        "mov [rdi + 0x20], r12",
        "mov [rdi + 0x28], r13",
        "mov [rdi + 0x30], r14",
        "mov [rdi + 0x38], r15",
        // Load from new (rsi)
        "mov rsp, [rsi + 0x00]",
        "mov rax, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov rbp, [rsi + 0x18]",
        "mov r12, [rsi + 0x20]",
        "mov r13, [rsi + 0x28]",
        "mov r14, [rsi + 0x30]",
        "mov r15, [rsi + 0x38]",
        "jmp rax",
        // Resume point of a saved context
        "1:",
        "ret",
    );
}
