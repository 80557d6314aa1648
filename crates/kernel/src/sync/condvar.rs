//! Condition variable over a wait queue and a sleeping mutex.

use super::mutex::{Mutex, MutexGuard};
use super::waitq::{SleepFlags, SleepResult, WaitQueue, NO_TIMEOUT};

pub struct CondVar {
    wq: WaitQueue,
}

impl CondVar {
    pub const fn new() -> Self {
        Self {
            wq: WaitQueue::new(),
        }
    }

    /// Releases `guard`'s mutex, sleeps until signalled, reacquires the
    /// mutex and hands the guard back.
    ///
    /// The mutex is released under the queue lock, so a signal arriving
    /// between the release and the enqueue cannot be lost.
    pub fn wait<'a, T: ?Sized>(&self, guard: MutexGuard<'a, T>) -> MutexGuard<'a, T> {
        let mutex: &'a Mutex<T> = guard.mutex();
        let rc = self
            .wq
            .sleep_flags_with(NO_TIMEOUT, SleepFlags::empty(), move || drop(guard));
        debug_assert_eq!(rc, SleepResult::Ok);

        mutex.raw_lock();
        MutexGuard::recreate(mutex)
    }

    /// Timed wait; `usec == 0` polls and reports `Timeout` right away.
    pub fn wait_timeout<'a, T: ?Sized>(
        &self,
        guard: MutexGuard<'a, T>,
        usec: u64,
    ) -> (MutexGuard<'a, T>, SleepResult) {
        let mutex: &'a Mutex<T> = guard.mutex();
        let rc = self
            .wq
            .sleep_flags_with(usec, SleepFlags::NON_BLOCKING, move || drop(guard));

        mutex.raw_lock();
        (MutexGuard::recreate(mutex), rc)
    }

    /// Wakes one waiter; nothing is saved when nobody waits.
    pub fn signal(&self) {
        self.wq.signal();
    }

    /// Wakes every waiter.
    pub fn broadcast(&self) {
        self.wq.wake_all();
    }
}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
}
