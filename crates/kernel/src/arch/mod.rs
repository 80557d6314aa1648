//! Architecture specific code: interrupt control, the TLB invalidation
//! primitives behind the shootdown protocol, context switching and the
//! per-CPU id register.
//!
//! Everything above this module goes through the re-exports below; the
//! generic core never reads an MMU or TLB register directly.
use cfg_if::cfg_if;

cfg_if! {
    if #[cfg(all(target_arch = "x86_64", target_os = "none"))] {
        pub mod x86_64;
        use x86_64 as imp;
    } else {
        // Hosted builds (unit tests, doc builds) get inert stubs with the
        // same surface.
        pub mod hosted;
        use hosted as imp;
    }
}

pub use imp::{
    cpu_id, enter_userspace, halt, interrupts_disable, interrupts_enable, interrupts_enabled,
    send_tlb_ipi, wait_for_interrupt,
};

pub mod context {
    pub use super::imp::context::{switch, Context};
}

pub mod tlb {
    pub use super::imp::tlb::{invalidate_all, invalidate_asid, invalidate_pages};
}

/// Runs `f` with local interrupts disabled, restoring the previous state
/// afterwards.
pub fn without_interrupts<R>(f: impl FnOnce() -> R) -> R {
    let was_enabled = interrupts_disable();
    let result = f();
    if was_enabled {
        interrupts_enable();
    }
    result
}
