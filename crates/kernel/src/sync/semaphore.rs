//! Counting semaphore: a wait queue seeded with the initial count.

use super::waitq::{SleepFlags, SleepResult, WaitQueue};

pub struct Semaphore {
    wq: WaitQueue,
}

impl Semaphore {
    pub const fn new(count: i32) -> Self {
        Self {
            wq: WaitQueue::with_count(count),
        }
    }

    /// Acquires one unit, sleeping until one is available.
    pub fn down(&self) {
        let rc = self.wq.sleep();
        debug_assert_eq!(rc, SleepResult::Ok);
    }

    /// Acquires one unit unless `usec` elapses first.
    pub fn down_timeout(&self, usec: u64) -> SleepResult {
        self.wq.sleep_timeout(usec)
    }

    /// Acquires one unit only if that needs no blocking.
    pub fn try_down(&self) -> bool {
        self.wq.sleep_flags(0, SleepFlags::NON_BLOCKING) == SleepResult::Ok
    }

    /// Releases one unit.
    pub fn up(&self) {
        self.wq.wake_one();
    }

    /// Units currently available without blocking.
    pub fn available(&self) -> i32 {
        self.wq.wakeup_balance().max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts_down_and_up() {
        let sem = Semaphore::new(2);
        assert!(sem.try_down());
        assert!(sem.try_down());
        assert!(!sem.try_down());

        sem.up();
        assert!(sem.try_down());
    }

    #[test]
    fn timeout_on_exhausted_semaphore() {
        let sem = Semaphore::new(0);
        assert_eq!(sem.down_timeout(0), SleepResult::Timeout);
    }
}
