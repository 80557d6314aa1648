//! Operations on the thread executing right now.

use alloc::sync::Arc;

use crate::sync::waitq::{SleepFlags, SleepResult, WaitQueue};
use crate::{reaper, scheduler};

use super::Thread;

/// The currently running thread, if the scheduler is up.
pub fn current() -> Option<Arc<Thread>> {
    scheduler::current_thread()
}

/// Gives up the CPU voluntarily; a no-op before the scheduler runs.
pub fn yield_now() {
    scheduler::yield_now();
}

/// Sleeps the current thread for at least `usec` microseconds.
pub fn sleep_us(usec: u64) {
    // a private queue nobody can wake: only the deadline ends the sleep
    let wq = WaitQueue::new();
    let rc = wq.sleep_flags(usec, SleepFlags::NON_BLOCKING);
    debug_assert_ne!(rc, SleepResult::Interrupted);
}

/// Terminates the current thread with `code`.
///
/// Joiners are released, the task drops its ownership link and the final
/// context is handed to the reaper, which frees it once the switch away
/// has completed. Never returns.
pub fn exit(code: usize) -> ! {
    let thread = current().expect("thread::current::exit() outside a thread");

    thread.finish_exit(code);
    thread.task().clone().release_thread(&thread);
    reaper::defer_thread(thread);

    scheduler::switch_away_forever()
}
