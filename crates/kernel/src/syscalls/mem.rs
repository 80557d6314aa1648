use opal_abi::errors::ErrorStatus;
use opal_abi::process::RawAreaFlags;

use crate::memory::address_space::{AreaError, AreaFlags};
use crate::memory::backend::AreaBackend;
use crate::memory::VirtAddr;

use super::{calling_task, SyscallArgs};

fn area_flags_from_raw(raw: usize) -> Result<AreaFlags, ErrorStatus> {
    let raw = u32::try_from(raw).map_err(|_| ErrorStatus::InvalidArgument)?;
    let raw = RawAreaFlags::from_bits(raw).ok_or(ErrorStatus::InvalidArgument)?;
    AreaFlags::from_bits(raw.bits()).ok_or(ErrorStatus::InvalidArgument)
}

fn map_area_error(err: AreaError) -> ErrorStatus {
    match err {
        AreaError::BadAlignment | AreaError::Overlap => ErrorStatus::InvalidArgument,
        AreaError::NoSuchArea => ErrorStatus::InvalidArgument,
        AreaError::NoMemory => ErrorStatus::OutOfMemory,
        AreaError::AsidExhausted => ErrorStatus::LimitReached,
    }
}

/// `args = [base, size, raw_flags]`; creates an anonymous area.
pub fn area_create(args: SyscallArgs) -> Result<usize, ErrorStatus> {
    let task = calling_task()?;
    let base = VirtAddr::from(args[0]);
    let flags = area_flags_from_raw(args[2])?;

    let created = task
        .address_space()
        .area_create(flags, args[1], base, AreaBackend::Anonymous)
        .map_err(map_area_error)?;
    Ok(created.into_raw())
}

/// `args = [base, new_size]`.
pub fn area_resize(args: SyscallArgs) -> Result<usize, ErrorStatus> {
    let task = calling_task()?;
    task.address_space()
        .area_resize(VirtAddr::from(args[0]), args[1])
        .map_err(map_area_error)?;
    Ok(0)
}

/// `args = [base]`.
pub fn area_destroy(args: SyscallArgs) -> Result<usize, ErrorStatus> {
    let task = calling_task()?;
    task.address_space()
        .area_destroy(VirtAddr::from(args[0]))
        .map_err(map_area_error)?;
    Ok(0)
}
