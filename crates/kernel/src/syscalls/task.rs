use opal_abi::errors::ErrorStatus;

use crate::memory::VirtAddr;
use crate::task::{run, TaskCaps};
use crate::thread::{self, Thread};
use crate::{logging, scheduler};

use super::{calling_task, SyscallArgs};

/// Copies the caller's task id into the 8-byte user buffer at `args[0]`.
pub fn task_get_id(args: SyscallArgs) -> Result<usize, ErrorStatus> {
    let task = calling_task()?;
    let buffer = VirtAddr::from(args[0]);
    if buffer.is_null() || !buffer.is_aligned_to(core::mem::align_of::<u64>()) {
        return Err(ErrorStatus::InvalidPtr);
    }

    run::write_user(task.address_space(), buffer, &task.id().to_ne_bytes())
        .map_err(|_| ErrorStatus::InvalidPtr)?;
    Ok(0)
}

/// Creates a user thread in the calling task:
/// `args = [entry, stack_top, arg]`. Returns the new tid.
pub fn thread_create(args: SyscallArgs) -> Result<usize, ErrorStatus> {
    let task = calling_task()?;
    let entry = VirtAddr::from(args[0]);
    let stack_top = VirtAddr::from(args[1]);
    if entry.is_null() || stack_top.is_null() {
        return Err(ErrorStatus::InvalidPtr);
    }

    let thread = Thread::spawn_user(
        &task,
        entry,
        stack_top,
        args[2],
        "uthread".try_into().expect("name fits"),
    )
    .map_err(|_| ErrorStatus::LimitReached)?;
    let tid = thread.tid();
    scheduler::thread_ready(thread);
    Ok(tid as usize)
}

/// Exits the calling thread with `args[0]` as its exit value.
pub fn thread_exit(args: SyscallArgs) -> Result<usize, ErrorStatus> {
    thread::current::exit(args[0])
}

/// Switches the console over to the in-kernel debug log. Requires the
/// `DEBUG_CONSOLE` capability.
pub fn debug_enable_console(_args: SyscallArgs) -> Result<usize, ErrorStatus> {
    let task = calling_task()?;
    if !task.has_cap(TaskCaps::DEBUG_CONSOLE) {
        return Err(ErrorStatus::MissingPermissions);
    }
    logging::enable_debug_console();
    Ok(0)
}
