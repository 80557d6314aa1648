use core::arch::naked_asm;

use crate::memory::VirtAddr;

/// Callee-saved register state of a suspended thread.
///
/// Only the registers the System V ABI requires a callee to preserve are
/// kept here; everything else is dead across the cooperative switch call.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Context {
    pub rsp: u64,
    pub rbp: u64,
    pub rbx: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    /// lands in rdi when the context is first entered
    pub arg: u64,
}

impl Context {
    /// Builds a context that enters `entry` on `stack_top` with `arg` in
    /// the first argument register.
    pub fn new(entry: VirtAddr, stack_top: VirtAddr, arg: usize) -> Self {
        // keep the entry stack 16-byte aligned as if a call was taken
        let rsp = (stack_top.into_raw() & !0xF) - 8;
        Self {
            rsp: rsp as u64,
            rip: entry.into_raw() as u64,
            arg: arg as u64,
            ..Self::default()
        }
    }
}

/// Saves the current callee-saved state into `from` and resumes `to`.
///
/// # Safety
/// `to` must be a context produced by [`Context::new`] or a prior switch,
/// and both pointers must remain valid for the duration of the call.
#[unsafe(naked)]
pub unsafe extern "C" fn switch(from: *mut Context, to: *const Context) {
    naked_asm!(
        // rdi = from, rsi = to
        "mov [rdi + 0x00], rsp",
        "mov [rdi + 0x08], rbp",
        "mov [rdi + 0x10], rbx",
        "mov [rdi + 0x18], r12",
        "mov [rdi + 0x20], r13",
        "mov [rdi + 0x28], r14",
        "mov [rdi + 0x30], r15",
        "lea rax, [rip + 2f]",
        "mov [rdi + 0x38], rax",
        "mov rsp, [rsi + 0x00]",
        "mov rbp, [rsi + 0x08]",
        "mov rbx, [rsi + 0x10]",
        "mov r12, [rsi + 0x18]",
        "mov r13, [rsi + 0x20]",
        "mov r14, [rsi + 0x28]",
        "mov r15, [rsi + 0x30]",
        "mov rax, [rsi + 0x38]",
        "mov rdi, [rsi + 0x40]",
        "jmp rax",
        "2:",
        "ret",
    )
}
