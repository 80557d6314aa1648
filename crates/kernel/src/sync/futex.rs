//! Futexes: userspace-addressed wait queues.
//!
//! The key is a 4-byte word in the calling task's address space; the
//! contended path parks the thread on a per-task wait queue registered
//! under that address. Composable sleeps keep the userspace counter and
//! the kernel wait state consistent when a sleep fails: the debt left in
//! the queue eats the wakeup the counter already promised.

use core::sync::atomic::{AtomicI32, Ordering};

use alloc::sync::Arc;
use thiserror::Error;

use crate::memory::address_space::AreaFlags;
use crate::memory::paging::PAGE_SIZE;
use crate::memory::VirtAddr;
use crate::sync::waitq::{SleepFlags, SleepResult, WaitQueue};
use crate::task::Task;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum FutexError {
    #[error("unaligned or unmapped futex word")]
    BadAddress,
    #[error("interrupted by a termination request")]
    Interrupted,
    #[error("timed out")]
    Timeout,
}

/// Resolves the futex word at `va` through the direct map, faulting the
/// page in if necessary.
fn resolve_word(task: &Task, va: VirtAddr) -> Result<&'static AtomicI32, FutexError> {
    if !va.is_aligned_to(core::mem::align_of::<i32>()) {
        return Err(FutexError::BadAddress);
    }
    let frame = task
        .address_space()
        .require_frame(va, AreaFlags::READ | AreaFlags::WRITE)
        .ok_or(FutexError::BadAddress)?;

    let offset = va.into_raw() % PAGE_SIZE;
    let ptr = (frame.virt_addr() + offset).into_ptr::<AtomicI32>();
    Ok(unsafe { &*ptr })
}

/// The wait queue registered for `va`, created on first use.
pub fn queue_for(task: &Task, va: VirtAddr) -> Arc<WaitQueue> {
    let mut futexes = task.futexes.lock();
    futexes
        .entry(va)
        .or_insert_with(|| Arc::new(WaitQueue::new()))
        .clone()
}

/// `futex_down`: decrements the word; a negative result means contention
/// and the caller sleeps until a matching [`up`] arrives.
///
/// `usec == 0` waits without deadline.
pub fn down(task: &Task, va: VirtAddr, usec: u64) -> Result<(), FutexError> {
    let word = resolve_word(task, va)?;

    let prev = word.fetch_sub(1, Ordering::SeqCst);
    if prev > 0 {
        return Ok(());
    }

    let queue = queue_for(task, va);
    let mut flags = SleepFlags::INTERRUPTIBLE | SleepFlags::FUTEX;
    if usec > 0 {
        flags |= SleepFlags::NON_BLOCKING;
    }
    match queue.sleep_flags(usec, flags) {
        SleepResult::Ok => Ok(()),
        SleepResult::Timeout => Err(FutexError::Timeout),
        SleepResult::Interrupted => Err(FutexError::Interrupted),
    }
}

/// `futex_up`: increments the word and, when someone was recorded
/// waiting, delivers one wakeup (or repays one failed sleep's debt).
pub fn up(task: &Task, va: VirtAddr) -> Result<(), FutexError> {
    let word = resolve_word(task, va)?;

    let prev = word.fetch_add(1, Ordering::SeqCst);
    if prev < 0 {
        queue_for(task, va).wake_one();
    }
    Ok(())
}

/// Task-death path: close every registered queue (stranded sleepers are
/// being terminated anyway) and drop the registry.
pub fn cleanup(task: &Task) {
    let mut futexes = task.futexes.lock();
    for (_, queue) in futexes.iter() {
        queue.close();
    }
    futexes.clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::address_space::AreaFlags;
    use crate::memory::backend::AreaBackend;
    use crate::memory::test_support::init_test_memory;
    use crate::task::Task;

    const FUTEX_AREA: usize = 0x3000_0000;

    fn task_with_futex_area(name: &str) -> Arc<Task> {
        init_test_memory();
        let task = Task::create_kernel(name.try_into().unwrap()).unwrap();
        task.address_space()
            .area_create(
                AreaFlags::READ | AreaFlags::WRITE | AreaFlags::CACHEABLE,
                PAGE_SIZE,
                VirtAddr::from(FUTEX_AREA),
                AreaBackend::Anonymous,
            )
            .unwrap();
        task
    }

    fn word_value(task: &Task, va: VirtAddr) -> i32 {
        resolve_word(task, va).unwrap().load(Ordering::SeqCst)
    }

    fn set_word(task: &Task, va: VirtAddr, value: i32) {
        resolve_word(task, va).unwrap().store(value, Ordering::SeqCst);
    }

    #[test]
    fn uncontended_down_just_decrements() {
        let task = task_with_futex_area("futex-free");
        let va = VirtAddr::from(FUTEX_AREA + 0x10);
        set_word(&task, va, 1);

        down(&task, va, 0).unwrap();
        assert_eq!(word_value(&task, va), 0);
        assert_eq!(queue_for(&task, va).sleeper_count(), 0);
    }

    #[test]
    fn up_after_contention_prepays_the_sleeper() {
        let task = task_with_futex_area("futex-pair");
        let va = VirtAddr::from(FUTEX_AREA + 0x20);
        set_word(&task, va, 0);

        // the word going negative records one waiter...
        up(&task, va).unwrap();
        assert_eq!(word_value(&task, va), 1);
        // (word was 0, not negative: no wakeup was stored)
        assert_eq!(queue_for(&task, va).wakeup_balance(), 0);

        set_word(&task, va, -1);
        up(&task, va).unwrap();
        // ...and that wakeup is saved in the queue until the waiter arrives
        assert_eq!(queue_for(&task, va).wakeup_balance(), 1);

        // the contended down consumes it without blocking
        set_word(&task, va, 0);
        down(&task, va, 0).unwrap();
        assert_eq!(word_value(&task, va), -1);
        assert_eq!(queue_for(&task, va).wakeup_balance(), 0);
    }

    #[test]
    fn counter_and_wait_state_stay_in_step() {
        let task = task_with_futex_area("futex-invariant");
        let va = VirtAddr::from(FUTEX_AREA + 0x30);
        let queue = queue_for(&task, va);

        // store one wakeup, as if an earlier waiter had been posted for
        set_word(&task, va, -1);
        up(&task, va).unwrap();
        assert_eq!(word_value(&task, va), 0);
        assert_eq!(queue.wakeup_balance(), 1);

        // lock once uncontended, then hit contention: the stored wakeup
        // covers the contended down and nothing blocks or is left over
        set_word(&task, va, 1);
        down(&task, va, 0).unwrap();
        assert_eq!(word_value(&task, va), 0);

        down(&task, va, 0).unwrap();
        assert_eq!(word_value(&task, va), -1);
        assert_eq!(queue.wakeup_balance(), 0);
        assert_eq!(queue.sleeper_count(), 0);
    }

    #[test]
    fn misaligned_word_is_rejected() {
        let task = task_with_futex_area("futex-align");
        let va = VirtAddr::from(FUTEX_AREA + 0x13);
        assert_eq!(down(&task, va, 0).unwrap_err(), FutexError::BadAddress);
    }

    #[test]
    fn unmapped_word_is_rejected() {
        let task = task_with_futex_area("futex-unmapped");
        let va = VirtAddr::from(0x6666_0000);
        assert_eq!(up(&task, va).unwrap_err(), FutexError::BadAddress);
    }

    #[test]
    fn cleanup_closes_registered_queues() {
        let task = task_with_futex_area("futex-cleanup");
        let va = VirtAddr::from(FUTEX_AREA + 0x40);
        let queue = queue_for(&task, va);

        cleanup(&task);
        assert!(queue.is_closed());
        assert!(task.futexes.lock().is_empty());
    }
}
