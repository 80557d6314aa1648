use opal_abi::errors::ErrorStatus;

use crate::memory::VirtAddr;
use crate::sync::futex::{self, FutexError};

use super::{calling_task, SyscallArgs};

fn map_futex_error(err: FutexError) -> ErrorStatus {
    match err {
        FutexError::BadAddress => ErrorStatus::InvalidPtr,
        FutexError::Interrupted => ErrorStatus::Interrupted,
        FutexError::Timeout => ErrorStatus::Timeout,
    }
}

/// `args = [word_va, timeout_us]`; 0 waits without deadline.
pub fn futex_wait(args: SyscallArgs) -> Result<usize, ErrorStatus> {
    let task = calling_task()?;
    futex::down(&task, VirtAddr::from(args[0]), args[1] as u64).map_err(map_futex_error)?;
    Ok(0)
}

/// `args = [word_va]`.
pub fn futex_wake(args: SyscallArgs) -> Result<usize, ErrorStatus> {
    let task = calling_task()?;
    futex::up(&task, VirtAddr::from(args[0])).map_err(map_futex_error)?;
    Ok(0)
}
