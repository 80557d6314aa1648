//! The wait queue.
//!
//! Threads wait for events first-come first-served. A positive
//! `wakeup_balance` stores wakeups that arrived with nobody waiting; a
//! negative balance is debt left behind by composable sleeps that failed
//! (see [`SleepFlags::FUTEX`]) and silently consumes the next wakeup.
//! Closing a queue wakes everyone and makes every later sleep succeed
//! immediately.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use bitflags::bitflags;

use crate::thread::{Thread, WakeCause};
use crate::utils::locks::{IrqSpinLock, IrqSpinLockGuard};
use crate::{clock, cpu, scheduler};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SleepFlags: u8 {
        /// A termination request aborts the sleep with
        /// [`SleepResult::Interrupted`].
        const INTERRUPTIBLE = 1 << 0;
        /// With a zero timeout, report [`SleepResult::Timeout`] instead
        /// of blocking.
        const NON_BLOCKING = 1 << 1;
        /// Composable sleep: leaving without a wakeup consumes the next
        /// one as debt. Reserved for the futex path.
        const FUTEX = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepResult {
    /// Woken by `wake_one`/`wake_all`/`signal`, a saved wakeup, or a
    /// closed queue.
    Ok,
    /// The deadline elapsed, or a non-blocking attempt found nothing.
    Timeout,
    /// A termination request aborted an interruptible sleep.
    Interrupted,
}

struct WaitQueueInner {
    sleepers: VecDeque<Arc<Thread>>,
    wakeup_balance: i32,
    closed: bool,
}

pub struct WaitQueue {
    inner: IrqSpinLock<WaitQueueInner>,
}

/// No deadline.
pub const NO_TIMEOUT: u64 = 0;

impl WaitQueue {
    pub const fn new() -> Self {
        Self {
            inner: IrqSpinLock::new(WaitQueueInner {
                sleepers: VecDeque::new(),
                wakeup_balance: 0,
                closed: false,
            }),
        }
    }

    /// A queue seeded with `count` stored wakeups (semaphore seed).
    pub const fn with_count(count: i32) -> Self {
        Self {
            inner: IrqSpinLock::new(WaitQueueInner {
                sleepers: VecDeque::new(),
                wakeup_balance: count,
                closed: false,
            }),
        }
    }

    pub fn sleep(&self) -> SleepResult {
        self.sleep_flags(NO_TIMEOUT, SleepFlags::empty())
    }

    pub fn sleep_timeout(&self, usec: u64) -> SleepResult {
        self.sleep_flags(usec, SleepFlags::NON_BLOCKING)
    }

    pub fn sleep_flags(&self, usec: u64, flags: SleepFlags) -> SleepResult {
        self.sleep_flags_with(usec, flags, || {})
    }

    /// Like [`sleep_flags`](Self::sleep_flags), additionally running
    /// `before_block` once under the queue lock, before any chance of
    /// blocking. The condition variable releases its mutex there so no
    /// wakeup can fall between the release and the enqueue.
    pub fn sleep_flags_with(
        &self,
        usec: u64,
        flags: SleepFlags,
        before_block: impl FnOnce(),
    ) -> SleepResult {
        let mut inner = self.inner.lock();
        before_block();

        if inner.closed {
            return SleepResult::Ok;
        }

        // a saved wakeup pays for this sleep
        if inner.wakeup_balance > 0 {
            inner.wakeup_balance -= 1;
            return SleepResult::Ok;
        }

        if flags.contains(SleepFlags::NON_BLOCKING) && usec == 0 {
            // even the immediate failure leaves debt behind for a
            // composable sleep; the counter already promised a wakeup
            if flags.contains(SleepFlags::FUTEX) {
                inner.wakeup_balance -= 1;
            }
            return SleepResult::Timeout;
        }

        let thread = scheduler::current_thread()
            .expect("blocking waitq sleep without a current thread");
        let interruptible = flags.contains(SleepFlags::INTERRUPTIBLE);

        let sleep_seq = thread.begin_sleep();
        inner.sleepers.push_back(thread.clone());

        if usec > 0 {
            cpu::current()
                .timeouts
                .lock()
                .register(clock::deadline_in(usec), thread.clone(), sleep_seq);
        }

        let rc = loop {
            if interruptible && thread.terminate_requested() {
                break SleepResult::Interrupted;
            }

            thread.enter_sleep_state();
            drop(inner);
            scheduler::park();

            // Always retake the lock so a waker still inside wake_one()
            // cannot outlive our return; only being unlinked proves the
            // wakeup happened.
            inner = self.inner.lock();

            if !thread.wq_linked() {
                break SleepResult::Ok;
            }
            if thread.take_sleep_timed_out() {
                break SleepResult::Timeout;
            }
            // spurious wake, go around
        };

        if thread.wq_linked() {
            Self::unlink(&mut inner, &thread);
        }

        if rc != SleepResult::Ok && flags.contains(SleepFlags::FUTEX) {
            inner.wakeup_balance -= 1;
        }

        rc
    }

    fn unlink(inner: &mut WaitQueueInner, thread: &Arc<Thread>) {
        if let Some(pos) = inner
            .sleepers
            .iter()
            .position(|t| Arc::ptr_eq(t, thread))
        {
            inner.sleepers.remove(pos);
        }
        thread.set_wq_unlinked();
    }

    /// Pops the head sleeper. Must be called with the lock held; the
    /// returned thread is woken after the guard is gone.
    fn pop_one(inner: &mut IrqSpinLockGuard<'_, WaitQueueInner>) -> Option<Arc<Thread>> {
        let thread = inner.sleepers.pop_front()?;
        thread.set_wq_unlinked();
        Some(thread)
    }

    /// Wakes one sleeper. With nobody sleeping the wakeup is saved for
    /// the next sleep; outstanding debt is repaid instead of waking
    /// anyone. No effect once the queue is closed.
    pub fn wake_one(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }

        if inner.wakeup_balance < 0 || inner.sleepers.is_empty() {
            inner.wakeup_balance += 1;
            return;
        }

        let thread = Self::pop_one(&mut inner);
        drop(inner);
        if let Some(thread) = thread {
            thread.try_wake(WakeCause::Event);
        }
    }

    /// Condvar-signal semantics: wakes one sleeper if there is one,
    /// otherwise does nothing at all.
    pub fn signal(&self) {
        let mut inner = self.inner.lock();
        let thread = Self::pop_one(&mut inner);
        drop(inner);
        if let Some(thread) = thread {
            thread.try_wake(WakeCause::Event);
        }
    }

    /// Wakes every sleeper and clears the balance.
    pub fn wake_all(&self) {
        let mut inner = self.inner.lock();
        inner.wakeup_balance = 0;
        let mut woken = VecDeque::new();
        while let Some(thread) = Self::pop_one(&mut inner) {
            woken.push_back(thread);
        }
        drop(inner);
        for thread in woken {
            thread.try_wake(WakeCause::Event);
        }
    }

    /// Wakes every sleeper and makes all future sleeps return
    /// immediately.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.wakeup_balance = 0;
        inner.closed = true;
        let mut woken = VecDeque::new();
        while let Some(thread) = Self::pop_one(&mut inner) {
            woken.push_back(thread);
        }
        drop(inner);
        for thread in woken {
            thread.try_wake(WakeCause::Event);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Current balance, for accounting checks.
    pub fn wakeup_balance(&self) -> i32 {
        self.inner.lock().wakeup_balance
    }

    pub fn sleeper_count(&self) -> usize {
        self.inner.lock().sleepers.len()
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for WaitQueue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("WaitQueue")
            .field("sleepers", &inner.sleepers.len())
            .field("wakeup_balance", &inner.wakeup_balance)
            .field("closed", &inner.closed)
            .finish()
    }
}
