use opal_abi::errors::ErrorStatus;
use opal_abi::process::RawIpcPayload;

use crate::ipc::{self, IpcError};
use crate::task::run;
use crate::memory::VirtAddr;

use super::{calling_task, SyscallArgs};

fn map_ipc_error(err: IpcError) -> ErrorStatus {
    match err {
        IpcError::BadPhone | IpcError::BadCall => ErrorStatus::InvalidArgument,
        IpcError::HungUp => ErrorStatus::HungUp,
        IpcError::Interrupted => ErrorStatus::Interrupted,
        IpcError::WouldBlock => ErrorStatus::WouldBlock,
    }
}

/// `args = [phone, method, a1, a2, a3, a4]`; returns the call id.
pub fn ipc_call(args: SyscallArgs) -> Result<usize, ErrorStatus> {
    let task = calling_task()?;
    let payload = RawIpcPayload {
        method: args[1],
        args: [args[2], args[3], args[4], args[5], 0],
    };
    let call_id = ipc::call(&task, args[0], payload).map_err(map_ipc_error)?;
    Ok(call_id as usize)
}

/// `args = [call_id, retval]` answers a taken call;
/// `args = [0, 0, out_call_va, timeout_us]` waits for the next call and
/// writes it to `out_call_va` as `{ id: u64, payload: RawIpcPayload }`.
pub fn ipc_answer(args: SyscallArgs) -> Result<usize, ErrorStatus> {
    let task = calling_task()?;

    if args[0] != 0 {
        ipc::answer_by_id(&task, args[0] as u64, args[1]).map_err(map_ipc_error)?;
        return Ok(0);
    }

    let out = VirtAddr::from(args[2]);
    if out.is_null() || !out.is_aligned_to(core::mem::align_of::<u64>()) {
        return Err(ErrorStatus::InvalidPtr);
    }

    let call = ipc::wait_call(&task, args[3] as u64).map_err(map_ipc_error)?;
    let mut buf = [0u8; 8 + core::mem::size_of::<RawIpcPayload>()];
    buf[..8].copy_from_slice(&call.id.to_ne_bytes());
    let payload_bytes: [u8; core::mem::size_of::<RawIpcPayload>()] =
        unsafe { core::mem::transmute(call.payload) };
    buf[8..].copy_from_slice(&payload_bytes);

    run::write_user(task.address_space(), out, &buf).map_err(|_| ErrorStatus::InvalidPtr)?;
    Ok(call.id as usize)
}
