//! Types shared between the OpalOS kernel and userspace.
//!
//! Everything here is `#[repr(C)]` or a plain integer enum so that both
//! sides of the syscall boundary agree on the layout.
#![no_std]

pub mod errors;
pub mod process;
pub mod syscalls;
