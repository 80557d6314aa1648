//! The semantic syscall surface.
//!
//! The architecture gateway decodes its trap frame into a number and six
//! raw arguments and calls [`dispatch`]; everything here is calling
//! convention independent. Handlers return `Result<usize, ErrorStatus>`
//! and [`dispatch`] packs that into the single return register: zero for
//! success-with-no-value, the error code otherwise.

mod ipc;
mod mem;
mod sync;
mod task;

use alloc::sync::Arc;

use opal_abi::errors::ErrorStatus;
use opal_abi::syscalls::Syscall;

use crate::task::Task;
use crate::thread;

/// Raw arguments as the gateway hands them over.
pub type SyscallArgs = [usize; 6];

/// The task of the calling thread.
fn calling_task() -> Result<Arc<Task>, ErrorStatus> {
    thread::current::current()
        .map(|thread| thread.task().clone())
        .ok_or(ErrorStatus::Generic)
}

/// Entry point from the architecture gateway.
pub fn dispatch(number: u16, args: SyscallArgs) -> usize {
    let result = match Syscall::try_from(number) {
        Ok(call) => handle(call, args),
        Err(_) => Err(ErrorStatus::InvalidSyscall),
    };

    match result {
        Ok(value) => value,
        Err(err) => encode_error(err),
    }
}

/// Errors travel as `usize::MAX - code` so small positive return values
/// stay unambiguous.
pub fn encode_error(err: ErrorStatus) -> usize {
    usize::MAX - u16::from(err) as usize
}

fn handle(call: Syscall, args: SyscallArgs) -> Result<usize, ErrorStatus> {
    // a kill may have raced us to the syscall boundary
    if let Some(current) = thread::current::current() {
        if current.terminate_requested() {
            return Err(ErrorStatus::Interrupted);
        }
    }

    match call {
        Syscall::TaskGetId => task::task_get_id(args),
        Syscall::ThreadCreate => task::thread_create(args),
        Syscall::ThreadExit => task::thread_exit(args),
        Syscall::AreaCreate => mem::area_create(args),
        Syscall::AreaResize => mem::area_resize(args),
        Syscall::AreaDestroy => mem::area_destroy(args),
        Syscall::FutexWait => sync::futex_wait(args),
        Syscall::FutexWake => sync::futex_wake(args),
        Syscall::IpcCall => ipc::ipc_call(args),
        Syscall::IpcAnswer => ipc::ipc_answer(args),
        Syscall::DebugEnableConsole => task::debug_enable_console(args),
    }
}
