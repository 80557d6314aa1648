//! Per-CPU state.
//!
//! The CPU set is built exactly once during bring-up, before the
//! scheduler starts; everything else reaches its own CPU through
//! [`current`] and its peers through [`all`].

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU32};

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Once;

use crate::arch;
use crate::clock::TimeoutQueue;
use crate::memory::tlb::TlbMailbox;
use crate::scheduler::RunQueues;
use crate::thread::Thread;
use crate::utils::locks::{IrqSpinLock, SpinLock};

pub struct Cpu {
    id: usize,
    pub runqueues: IrqSpinLock<RunQueues>,
    /// written only by this CPU's scheduler
    pub(crate) current: UnsafeCell<Option<Arc<Thread>>>,
    /// the thread whose switch-away has not been finished yet
    pub(crate) previous: UnsafeCell<Option<Arc<Thread>>>,
    pub tlb_mailbox: SpinLock<TlbMailbox>,
    pub tlb_pending: AtomicBool,
    pub timeouts: IrqSpinLock<TimeoutQueue>,
    pub need_resched: AtomicBool,
    /// timeslices the current thread has left
    pub(crate) slices_left: AtomicU32,
}

unsafe impl Send for Cpu {}
unsafe impl Sync for Cpu {}

impl Cpu {
    fn new(id: usize) -> Self {
        Self {
            id,
            runqueues: IrqSpinLock::new(RunQueues::new()),
            current: UnsafeCell::new(None),
            previous: UnsafeCell::new(None),
            tlb_mailbox: SpinLock::new(TlbMailbox::new()),
            tlb_pending: AtomicBool::new(false),
            timeouts: IrqSpinLock::new(TimeoutQueue::new()),
            need_resched: AtomicBool::new(false),
            slices_left: AtomicU32::new(0),
        }
    }

    pub const fn id(&self) -> usize {
        self.id
    }

    /// Snapshot of the ready-thread load, taken without the lock for
    /// placement heuristics only.
    pub fn load_estimate(&self) -> usize {
        self.runqueues.lock().load
    }
}

static CPUS: Once<Box<[Cpu]>> = Once::new();

/// Builds the CPU set. Called once by the boot collaborator with the
/// number of started CPUs.
pub fn init(count: usize) {
    assert!(count > 0, "at least one CPU must exist");
    CPUS.call_once(|| {
        let mut cpus = Vec::with_capacity(count);
        for id in 0..count {
            cpus.push(Cpu::new(id));
        }
        cpus.into_boxed_slice()
    });
}

pub fn is_initialized() -> bool {
    CPUS.get().is_some()
}

pub fn all() -> &'static [Cpu] {
    CPUS.get().expect("cpu::init() has not run")
}

pub fn count() -> usize {
    all().len()
}

/// The CPU executing the caller.
pub fn current() -> &'static Cpu {
    &all()[arch::cpu_id()]
}
