//! Cross-CPU TLB shootdown.
//!
//! An initiator posts invalidation messages into the bounded mailbox of
//! every other CPU, kicks them with an IPI and spins until each target
//! has drained its mailbox. A full mailbox degrades the whole batch to a
//! single *invalidate everything* message; losing precision is always
//! safe, keeping a stale translation never is.

use core::sync::atomic::Ordering;

use crate::arch;
use crate::cpu::{self, Cpu};
use crate::memory::address_space::Asid;
use crate::memory::VirtAddr;
use crate::utils::locks::SpinLock;

/// Messages one CPU can hold before the batch degrades to
/// [`TlbMessage::InvalidateAll`].
pub const TLB_MESSAGE_QUEUE_LEN: usize = 10;

pub type TlbMailbox = heapless::Deque<TlbMessage, TLB_MESSAGE_QUEUE_LEN>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlbMessage {
    /// Invalidate all entries.
    InvalidateAll,
    /// Invalidate all entries belonging to one address space.
    InvalidateAsid(Asid),
    /// Invalidate a page range belonging to one address space.
    InvalidatePages {
        asid: Asid,
        page: VirtAddr,
        count: usize,
    },
}

/// Serializes initiators; only one shootdown crosses CPUs at a time.
static SHOOTDOWN_LOCK: SpinLock<()> = SpinLock::new(());

/// Appends `msg` to `cpu`'s mailbox, degrading to a single
/// `InvalidateAll` on overflow. Caller holds [`SHOOTDOWN_LOCK`].
pub(crate) fn post_message(cpu: &Cpu, msg: TlbMessage) {
    let mut mailbox = cpu.tlb_mailbox.lock();
    if mailbox.push_back(msg).is_err() {
        mailbox.clear();
        // infallible, the queue holds far more than one message
        let _ = mailbox.push_back(TlbMessage::InvalidateAll);
    }
    cpu.tlb_pending.store(true, Ordering::Release);
}

fn apply(msg: TlbMessage) {
    match msg {
        TlbMessage::InvalidateAll => arch::tlb::invalidate_all(),
        TlbMessage::InvalidateAsid(asid) => arch::tlb::invalidate_asid(asid),
        TlbMessage::InvalidatePages { asid, page, count } => {
            arch::tlb::invalidate_pages(asid, page, count)
        }
    }
}

/// Drains the mailbox of `cpu` head to tail and acks.
fn drain(cpu: &Cpu) {
    loop {
        let msg = cpu.tlb_mailbox.lock().pop_front();
        match msg {
            Some(msg) => apply(msg),
            None => break,
        }
    }
    cpu.tlb_pending.store(false, Ordering::Release);
}

/// IPI entry: invoked on a target CPU when an initiator kicks it.
pub fn shootdown_ipi_recv() {
    drain(cpu::current());
}

/// Hosted variant of the IPI path, used by the stub interrupt "sender" to
/// drain a specific CPU's mailbox inline.
pub(crate) fn shootdown_ipi_recv_on(cpu_index: usize) {
    drain(&cpu::all()[cpu_index]);
}

/// Runs one shootdown to completion: posts `msg` to every other CPU,
/// applies it locally, and returns only after every target drained.
///
/// On a machine with a single CPU (or before the CPU set exists) this
/// degrades to a local invalidation under disabled interrupts.
pub fn shootdown(msg: TlbMessage) {
    let reenable = arch::interrupts_disable();

    if !cpu::is_initialized() {
        apply(msg);
        if reenable {
            arch::interrupts_enable();
        }
        return;
    }

    let guard = SHOOTDOWN_LOCK.lock();
    let this_cpu = arch::cpu_id();

    for cpu in cpu::all() {
        if cpu.id() != this_cpu {
            post_message(cpu, msg);
        }
    }
    for cpu in cpu::all() {
        if cpu.id() != this_cpu {
            arch::send_tlb_ipi(cpu.id());
        }
    }

    apply(msg);

    // no mapping may be observed stale once we return
    for cpu in cpu::all() {
        if cpu.id() != this_cpu {
            while cpu.tlb_pending.load(Ordering::Acquire) {
                core::hint::spin_loop();
            }
        }
    }

    drop(guard);
    if reenable {
        arch::interrupts_enable();
    }
}
