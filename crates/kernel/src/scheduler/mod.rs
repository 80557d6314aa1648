//! The per-CPU preemptive scheduler.
//!
//! Every CPU owns an array of FIFO runqueues, one per priority band; band
//! 0 is the most urgent. A thread burning through its quantum drops one
//! band on requeue, a thread returning from a long sleep climbs one. New
//! ready threads land on the least-loaded eligible CPU.

#[cfg(test)]
mod tests;

use core::sync::atomic::Ordering;

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use crate::cpu::{self, Cpu};
use crate::thread::{Thread, ThreadState};
use crate::utils::locks::IrqSpinLockGuard;
use crate::{arch, debug};

/// Number of priority bands per CPU.
pub const N_PRIO: usize = 16;
/// Band newly created threads start in.
pub const DEFAULT_BAND: u8 = (N_PRIO / 2) as u8;
/// Most threads an overloaded CPU hands away per balance pass.
pub const MIGRATION_CAP: usize = 4;
/// Load difference that triggers migration.
const BALANCE_THRESHOLD: usize = 2;

/// Timeslices a thread of `band` gets per quantum; urgent bands run
/// longer before they round-robin.
pub const fn quantum_slices(band: u8) -> u32 {
    (N_PRIO as u32) - (band as u32)
}

/// The ready FIFOs of one CPU.
pub struct RunQueues {
    queues: [VecDeque<Arc<Thread>>; N_PRIO],
    /// number of ready threads over all bands
    pub load: usize,
}

impl RunQueues {
    pub fn new() -> Self {
        Self {
            queues: core::array::from_fn(|_| VecDeque::new()),
            load: 0,
        }
    }

    pub fn push(&mut self, thread: Arc<Thread>, band: u8) {
        self.queues[band as usize].push_back(thread);
        self.load += 1;
    }

    /// Dequeues the head of the most urgent non-empty band.
    pub fn pop_highest(&mut self) -> Option<Arc<Thread>> {
        for queue in self.queues.iter_mut() {
            if let Some(thread) = queue.pop_front() {
                self.load -= 1;
                return Some(thread);
            }
        }
        None
    }

    /// Takes the tail of the least urgent non-empty band for migration,
    /// skipping threads that are wired or whose switch-away has not
    /// finished.
    pub fn steal_tail(&mut self) -> Option<(Arc<Thread>, u8)> {
        for (band, queue) in self.queues.iter_mut().enumerate().rev() {
            let candidate = queue
                .iter()
                .rposition(|t| t.wired_cpu().is_none() && !t.is_on_cpu());
            if let Some(pos) = candidate {
                let thread = queue.remove(pos).unwrap();
                self.load -= 1;
                return Some((thread, band as u8));
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.load == 0
    }

    pub fn band_len(&self, band: u8) -> usize {
        self.queues[band as usize].len()
    }
}

impl Default for RunQueues {
    fn default() -> Self {
        Self::new()
    }
}

/// The thread running on this CPU, if the scheduler is up.
pub fn current_thread() -> Option<Arc<Thread>> {
    if !cpu::is_initialized() {
        return None;
    }
    let cpu = cpu::current();
    unsafe { (*cpu.current.get()).clone() }
}

/// Whether the caller is a schedulable thread that may sleep.
pub fn can_block() -> bool {
    current_thread().is_some()
}

/// Picks the runqueue a ready thread should join: its wired CPU, or the
/// least loaded one.
fn select_cpu(thread: &Thread) -> &'static Cpu {
    if let Some(wired) = thread.wired_cpu() {
        return &cpu::all()[wired];
    }
    cpu::all()
        .iter()
        .min_by_key(|cpu| cpu.load_estimate())
        .expect("no CPUs registered")
}

/// Publishes a thread to the scheduler: *Entering* or woken threads
/// become *Ready* and join a runqueue tail.
///
/// A thread unblocking from a long sleep is promoted one band before it
/// is queued.
pub fn thread_ready(thread: Arc<Thread>) {
    debug_assert!(!thread.is_on_cpu());

    let mut band = thread.band();
    if thread.take_wake_bonus() {
        band = band.saturating_sub(1);
        thread.set_band(band);
    }

    *thread.state_lock() = ThreadState::Ready;

    let cpu = select_cpu(&thread);
    let mut queues = cpu.runqueues.lock();
    queues.push(thread, band);
}

/// Adopts the boot context of this CPU as `thread`, so the bring-up path
/// can sleep and spawn before the first real context switch. The thread's
/// saved context is overwritten at its first switch away.
pub fn adopt_boot_thread(thread: Arc<Thread>) {
    let cpu = cpu::current();
    *thread.state_lock() = ThreadState::Running;
    thread.set_on_cpu(true);
    cpu.slices_left
        .store(quantum_slices(thread.band()), Ordering::Relaxed);
    unsafe {
        *cpu.current.get() = Some(thread);
    }
}

/// Voluntarily gives up the CPU; a no-op until the scheduler runs.
pub fn yield_now() {
    if current_thread().is_none() {
        return;
    }
    arch::without_interrupts(schedule);
}

/// Parks the current thread after the wait queue marked it *Sleeping*.
/// Consumes a wakeup that raced the parking instead of switching.
pub(crate) fn park() {
    let reenable = arch::interrupts_disable();
    let thread = current_thread().expect("park() without a current thread");

    if thread.take_unparked() {
        *thread.state_lock() = ThreadState::Running;
    } else {
        schedule();
    }

    if reenable {
        arch::interrupts_enable();
    }
}

/// Leaves the CPU for good; the current thread must be *Exiting*.
pub(crate) fn switch_away_forever() -> ! {
    arch::interrupts_disable();
    let thread = current_thread().expect("no current thread");
    debug_assert!(thread.is_exiting());
    drop(thread);
    schedule();
    unreachable!("an exiting thread was scheduled again")
}

/// Completes the switch-away of the previously running thread. Runs at
/// the resume point of every thread, including the trampoline of fresh
/// ones.
pub fn finish_switch() {
    let cpu = cpu::current();
    let prev = unsafe { (*cpu.previous.get()).take() };
    if let Some(prev) = prev {
        prev.set_on_cpu(false);

        // a wake that raced the parking finishes here
        if prev.state() == ThreadState::Sleeping && prev.take_unparked() {
            thread_ready(prev);
        }
    }
}

/// Requeues `prev` according to why it left the CPU.
fn requeue_previous(queues: &mut IrqSpinLockGuard<'_, RunQueues>, prev: &Arc<Thread>) {
    let mut band = prev.band();
    if prev.take_quantum_expired() {
        // burned its whole quantum: one band down, bounded
        band = (band + 1).min((N_PRIO - 1) as u8);
        prev.set_band(band);
    }
    queues.push(prev.clone(), band);
}

/// The scheduling decision. Called with interrupts disabled; the caller
/// has already recorded why the current thread leaves the CPU in its
/// state.
fn schedule() {
    debug_assert!(!arch::interrupts_enabled());
    let cpu = cpu::current();
    let prev = unsafe { (*cpu.current.get()).clone() }.expect("schedule() without current");

    {
        let mut state = prev.state_lock();
        if *state == ThreadState::Running {
            *state = ThreadState::Ready;
        }
    }

    loop {
        let next = {
            let mut queues = cpu.runqueues.lock();
            if prev.state() == ThreadState::Ready {
                requeue_previous(&mut queues, &prev);
            }
            queues.pop_highest()
        };

        match next {
            Some(next) if Arc::ptr_eq(&next, &prev) => {
                // we are still the best choice; keep running
                *prev.state_lock() = ThreadState::Running;
                cpu.slices_left
                    .store(quantum_slices(prev.band()), Ordering::Relaxed);
                return;
            }
            Some(next) => {
                switch_to(cpu, &prev, &next);
                return;
            }
            None => {
                if idle_until_work(cpu, &prev) {
                    // the parked previous thread was woken while we idled
                    return;
                }
            }
        }
    }
}

/// Switches this CPU from `prev` to `next`. Returns when something
/// switches back to `prev`.
fn switch_to(cpu: &'static Cpu, prev: &Arc<Thread>, next: &Arc<Thread>) {
    {
        let mut state = next.state_lock();
        debug_assert_eq!(*state, ThreadState::Ready);
        *state = ThreadState::Running;
    }
    next.set_on_cpu(true);
    cpu.slices_left
        .store(quantum_slices(next.band()), Ordering::Relaxed);

    unsafe {
        *cpu.previous.get() = Some(prev.clone());
        *cpu.current.get() = Some(next.clone());
        arch::context::switch(prev.context_ptr(), next.context_ptr());
    }

    // somebody switched back to us
    finish_switch();
}

/// Idles on the leaving thread's stack until either that thread is woken
/// again (returns true) or another thread becomes ready (returns false).
fn idle_until_work(cpu: &'static Cpu, prev: &Arc<Thread>) -> bool {
    loop {
        if prev.state() == ThreadState::Sleeping && prev.take_unparked() {
            *prev.state_lock() = ThreadState::Running;
            cpu.slices_left
                .store(quantum_slices(prev.band()), Ordering::Relaxed);
            return true;
        }

        if !cpu.runqueues.lock().is_empty() {
            return false;
        }

        // sleep with interrupts open so the timer can feed us work
        arch::interrupts_enable();
        arch::wait_for_interrupt();
        arch::interrupts_disable();
    }
}

/// Per-tick quantum accounting, run from the clock with interrupts
/// disabled.
pub(crate) fn tick(cpu: &Cpu) {
    let current = unsafe { (*cpu.current.get()).clone() };
    let Some(current) = current else { return };

    let left = cpu.slices_left.load(Ordering::Relaxed);
    if left > 0 {
        cpu.slices_left.store(left - 1, Ordering::Relaxed);
        return;
    }

    current.set_quantum_expired();
    if current.preemption_disabled() {
        current.set_pending_preempt();
    } else {
        cpu.need_resched.store(true, Ordering::Release);
    }
}

/// Architecture interrupt-return hook: performs a pending preemption.
pub fn preempt_point() {
    if !cpu::is_initialized() {
        return;
    }
    let cpu = cpu::current();
    if cpu.need_resched.swap(false, Ordering::AcqRel) {
        yield_now();
    }
}

/// Hands surplus ready threads from this CPU to the least loaded one.
/// Called periodically (idle loop or balance timer).
pub fn balance_tick() {
    let me = cpu::current();
    let Some(target) = cpu::all()
        .iter()
        .filter(|c| c.id() != me.id())
        .min_by_key(|c| c.load_estimate())
    else {
        return;
    };

    migrate(me, target, MIGRATION_CAP);
}

/// Moves up to `cap` threads from the tails of `src`'s least urgent
/// bands to `dst`, as long as the imbalance persists. Queue pairs lock in
/// ascending CPU-id order.
pub fn migrate(src: &Cpu, dst: &Cpu, cap: usize) -> usize {
    if src.id() == dst.id() {
        return 0;
    }

    let mut moved = 0;
    for _ in 0..cap {
        let (first, second) = if src.id() < dst.id() {
            (src, dst)
        } else {
            (dst, src)
        };
        let first_guard = first.runqueues.lock();
        let second_guard = second.runqueues.lock();
        let (mut src_guard, mut dst_guard) = if src.id() < dst.id() {
            (first_guard, second_guard)
        } else {
            (second_guard, first_guard)
        };

        if src_guard.load < dst_guard.load + BALANCE_THRESHOLD {
            break;
        }
        let Some((thread, band)) = src_guard.steal_tail() else {
            break;
        };

        debug!(
            RunQueues,
            "migrating thread {} from cpu {} to cpu {}",
            thread.tid(),
            src.id(),
            dst.id()
        );
        dst_guard.push(thread, band);
        moved += 1;
    }
    moved
}
