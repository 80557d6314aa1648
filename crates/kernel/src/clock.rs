//! Boot-relative time and sleep deadlines.
//!
//! The timer interrupt of the boot CPU advances a single microsecond
//! counter; every CPU owns a deadline-ordered queue of pending sleep
//! timeouts which its own tick drains.

use core::sync::atomic::{AtomicU64, Ordering};

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

use crate::thread::Thread;
use crate::{cpu, scheduler};

static BOOT_TIME_US: AtomicU64 = AtomicU64::new(0);

/// Microseconds elapsed since boot.
#[inline(always)]
pub fn boot_time_us() -> u64 {
    BOOT_TIME_US.load(Ordering::Relaxed)
}

#[inline(always)]
pub fn deadline_in(usec: u64) -> u64 {
    boot_time_us() + usec
}

struct TimeoutEntry {
    thread: Arc<Thread>,
    /// which sleep of the thread this timeout belongs to
    sleep_seq: u64,
}

/// Deadline-ordered pending sleep timeouts of one CPU.
pub struct TimeoutQueue {
    entries: BTreeMap<(u64, u64), TimeoutEntry>,
    next_token: u64,
}

impl TimeoutQueue {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_token: 0,
        }
    }

    pub fn register(&mut self, deadline_us: u64, thread: Arc<Thread>, sleep_seq: u64) {
        let token = self.next_token;
        self.next_token += 1;
        self.entries
            .insert((deadline_us, token), TimeoutEntry { thread, sleep_seq });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Earliest registered deadline, if any.
    pub fn next_deadline(&self) -> Option<u64> {
        self.entries.keys().next().map(|&(deadline, _)| deadline)
    }

    /// Pops every entry due at `now`, returning them oldest first.
    fn take_due(&mut self, now: u64) -> alloc::vec::Vec<TimeoutEntry> {
        let mut due = alloc::vec::Vec::new();
        while let Some(&key) = self.entries.keys().next() {
            if key.0 > now {
                break;
            }
            due.push(self.entries.remove(&key).unwrap());
        }
        due
    }
}

/// Timer-tick entry, run on every CPU with interrupts disabled.
///
/// `us_elapsed` is the tick period; only the boot CPU advances the global
/// counter.
pub fn tick(us_elapsed: u64) {
    let cpu = cpu::current();
    if cpu.id() == 0 {
        BOOT_TIME_US.fetch_add(us_elapsed, Ordering::Relaxed);
    }
    let now = boot_time_us();

    let due = cpu.timeouts.lock().take_due(now);
    for entry in due {
        entry.thread.sleep_timeout_fired(entry.sleep_seq);
    }

    scheduler::tick(cpu);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_support::init_test_memory;
    use crate::task;
    use crate::thread::Thread;

    fn some_thread() -> Arc<Thread> {
        init_test_memory();
        let task = task::Task::create_kernel("clock-test".try_into().unwrap()).unwrap();
        Thread::spawn_kernel(&task, idle_entry, 0, "sleeper".try_into().unwrap()).unwrap()
    }

    fn idle_entry(_: usize) -> ! {
        unreachable!()
    }

    #[test]
    fn timeouts_fire_in_deadline_order() {
        let thread = some_thread();
        let mut queue = TimeoutQueue::new();

        queue.register(300, thread.clone(), 1);
        queue.register(100, thread.clone(), 2);
        queue.register(200, thread.clone(), 3);

        assert_eq!(queue.next_deadline(), Some(100));
        let due = queue.take_due(250);
        assert_eq!(
            due.iter().map(|e| e.sleep_seq).collect::<alloc::vec::Vec<_>>(),
            [2, 3]
        );
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next_deadline(), Some(300));
    }

    #[test]
    fn same_deadline_entries_all_fire() {
        let thread = some_thread();
        let mut queue = TimeoutQueue::new();

        queue.register(500, thread.clone(), 1);
        queue.register(500, thread.clone(), 2);

        let due = queue.take_due(500);
        assert_eq!(due.len(), 2);
        assert!(queue.is_empty());
    }
}
