//! The OpalOS kernel object core.
//!
//! This crate owns the lifetime, ownership and concurrency rules of the
//! kernel's executable objects: tasks, their threads and address spaces,
//! the wait-queue primitive everything blocks on, and the cross-CPU TLB
//! shootdown protocol the address spaces rely on. The boot loader, the
//! final kernel binary and its interrupt plumbing are external
//! collaborators: they hand over the memory map and CPU count through
//! [`init`] and route their timer/IPI/syscall entries into [`clock`],
//! [`memory::tlb`] and [`syscalls`].
#![no_std]

extern crate alloc;
#[cfg(test)]
extern crate std;

pub mod arch;
pub mod clock;
pub mod cpu;
pub mod ipc;
pub mod logging;
pub mod memory;
pub mod reaper;
pub mod scheduler;
pub mod sync;
pub mod syscalls;
pub mod task;
pub mod thread;
pub mod utils;

use alloc::sync::Arc;

pub use memory::{PhysAddr, VirtAddr};

/// What the boot collaborator must hand over.
pub struct BootInfo<'a> {
    /// usable physical memory regions as `(base, length)`
    pub memory_regions: &'a [(PhysAddr, usize)],
    /// offset of the window all physical memory is mapped through
    pub direct_map_offset: usize,
    /// CPUs that were started
    pub cpu_count: usize,
    /// where log lines go, if anywhere
    pub log_sink: Option<logging::LogSink>,
}

/// Brings the core up on the boot CPU and adopts the caller as the
/// kernel task's first thread. Returns that thread.
///
/// After this the caller may sleep, spawn threads and run programs; the
/// timer interrupt should be routed into [`clock::tick`] and the
/// shootdown IPI into [`memory::tlb::shootdown_ipi_recv`].
pub fn init(boot: &BootInfo) -> Arc<thread::Thread> {
    if let Some(sink) = boot.log_sink {
        logging::set_sink(sink);
    }

    memory::init_direct_map(boot.direct_map_offset);
    for &(base, length) in boot.memory_regions {
        memory::frame_allocator::register_zone(base, length)
            .expect("too many boot memory regions");
    }
    cpu::init(boot.cpu_count);

    let kernel_task = task::kernel_task();
    let boot_thread = thread::Thread::spawn_kernel(
        &kernel_task,
        idle_entry,
        0,
        "boot".try_into().expect("name fits"),
    )
    .expect("failed to adopt the boot thread");
    scheduler::adopt_boot_thread(boot_thread.clone());

    reaper::spawn(&kernel_task);

    info!("kernel core up: {} cpus, {} free frames",
        cpu::count(),
        memory::frame_allocator::free_frames());
    boot_thread
}

/// Entry of the adopted boot thread if it ever goes through the
/// trampoline; the boot context never does.
fn idle_entry(_: usize) -> ! {
    loop {
        arch::wait_for_interrupt();
    }
}
