use crate::memory::VirtAddr;

/// Saved execution context of a suspended thread.
///
/// The hosted variant carries the fields so context construction can be
/// exercised, but [`switch`] itself is unreachable off hardware.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Context {
    pub stack_ptr: VirtAddr,
    pub instruction_ptr: VirtAddr,
    pub arg: usize,
}

impl Context {
    /// Builds a context that enters `entry` on `stack_top` with `arg` in
    /// the argument register.
    pub fn new(entry: VirtAddr, stack_top: VirtAddr, arg: usize) -> Self {
        Self {
            stack_ptr: stack_top,
            instruction_ptr: entry,
            arg,
        }
    }
}

/// Saves the current context into `from` and resumes `to`.
///
/// # Safety
/// `to` must be a context previously produced by [`Context::new`] or a
/// prior switch, and both pointers must stay valid for the switch.
pub unsafe fn switch(_from: *mut Context, _to: *const Context) {
    unreachable!("context switching is not available in a hosted build")
}
