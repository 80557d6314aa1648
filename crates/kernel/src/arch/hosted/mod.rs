//! Inert architecture stubs for hosted builds.
//!
//! The kernel core is a library; when it is compiled for a hosted target
//! (most importantly for its own unit tests) there is no interrupt
//! controller, no TLB and no privileged state to touch. These stubs keep
//! the same surface as the real backends while doing nothing, so the
//! generic code paths above them can be exercised directly.

use core::sync::atomic::{AtomicBool, Ordering};

pub mod context;
pub mod tlb;

static INTERRUPTS_ENABLED: AtomicBool = AtomicBool::new(true);

/// Disables "interrupts", returning whether they were enabled before.
pub fn interrupts_disable() -> bool {
    INTERRUPTS_ENABLED.swap(false, Ordering::SeqCst)
}

pub fn interrupts_enable() {
    INTERRUPTS_ENABLED.store(true, Ordering::SeqCst);
}

pub fn interrupts_enabled() -> bool {
    INTERRUPTS_ENABLED.load(Ordering::SeqCst)
}

/// Hosted builds are single-"CPU": everything runs as CPU 0.
pub fn cpu_id() -> usize {
    0
}

pub fn wait_for_interrupt() {
    core::hint::spin_loop();
}

pub fn halt() -> ! {
    panic!("halt() reached in a hosted build")
}

/// There is no userspace to drop into off hardware.
pub fn enter_userspace(
    _entry: crate::memory::VirtAddr,
    _stack_top: crate::memory::VirtAddr,
    _arg: usize,
) -> ! {
    unreachable!("enter_userspace in a hosted build")
}

/// Simulates the shootdown IPI by draining the target mailbox inline,
/// which preserves the protocol's completion semantics without a real
/// interrupt controller.
pub fn send_tlb_ipi(target_cpu: usize) {
    crate::memory::tlb::shootdown_ipi_recv_on(target_cpu);
}
