//! Raw records handed to a task's first thread and to task-management
//! syscalls.

use bitflags::bitflags;

/// The maximum length of a task name in bytes.
pub const TASK_NAME_MAX: usize = 64;

/// Number of phone slots every task owns.
pub const MAX_PHONES: usize = 16;

bitflags! {
    /// Access flags of a userspace memory area as seen by syscalls.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RawAreaFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const CACHEABLE = 1 << 3;
    }
}

/// A single entry of the initial inbox: a named handle the loader passed
/// down to the new task.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct RawInboxEntry {
    /// NUL-padded entry name
    pub name: [u8; 32],
    /// handle value, meaning is private to the endpoint owner
    pub handle: u64,
}

impl RawInboxEntry {
    pub const fn zeroed() -> Self {
        Self {
            name: [0; 32],
            handle: 0,
        }
    }
}

/// The process control block placed in the address space of a freshly
/// spawned task, pointed to by its first thread's argument register.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct RawControlBlock {
    pub argc: usize,
    /// pointer to an array of `argc` NUL-terminated string pointers
    pub argv: usize,
    /// pointer to a NUL-terminated working-directory string
    pub cwd: usize,
    pub inbox_len: usize,
    /// pointer to an array of `inbox_len` [`RawInboxEntry`]
    pub inbox: usize,
}

impl RawControlBlock {
    pub const fn zeroed() -> Self {
        Self {
            argc: 0,
            argv: 0,
            cwd: 0,
            inbox_len: 0,
            inbox: 0,
        }
    }
}

/// One IPC call as transported over a phone: a small fixed payload,
/// mirrored back on answer with the return slots filled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct RawIpcPayload {
    pub method: usize,
    pub args: [usize; 5],
}

impl RawIpcPayload {
    pub const fn zeroed() -> Self {
        Self {
            method: 0,
            args: [0; 5],
        }
    }
}
