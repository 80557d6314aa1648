//! The reaper is the kernel's housekeeping thread.
//!
//! Exiting threads cannot free their own stack (they are still running on
//! it) and interrupt contexts cannot run destructors that sleep, so both
//! defer the work here. The reaper drains its queue, holding back any
//! thread whose switch-away has not completed yet, and sleeps when there
//! is nothing to bury.

use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::memory::paging::PageTableRoot;
use crate::sync::waitq::{SleepFlags, WaitQueue};
use crate::task::Task;
use crate::thread::Thread;
use crate::utils::locks::SpinLock;
use crate::{debug, scheduler};

enum Retired {
    Thread(Arc<Thread>),
    PageTable(PageTableRoot),
}

static QUEUE: SpinLock<Vec<Retired>> = SpinLock::new(Vec::new());
static REAPER_WQ: WaitQueue = WaitQueue::new();

/// Hands the final reference of an exiting thread to the reaper.
pub fn defer_thread(thread: Arc<Thread>) {
    QUEUE.lock().push(Retired::Thread(thread));
    REAPER_WQ.wake_one();
}

/// Defers freeing a page-table tree to thread context.
pub fn defer_page_table(table: PageTableRoot) {
    QUEUE.lock().push(Retired::PageTable(table));
    REAPER_WQ.wake_one();
}

fn bury(item: Retired) -> Option<Retired> {
    match item {
        Retired::Thread(thread) => {
            if thread.is_on_cpu() {
                // its CPU has not switched away yet; try again next round
                return Some(Retired::Thread(thread));
            }
            debug!(
                Thread,
                "reaping thread {} ({})",
                thread.tid(),
                thread.name()
            );
            drop(thread);
            None
        }
        Retired::PageTable(table) => {
            drop(table);
            None
        }
    }
}

/// Reaper main loop; runs forever as a kernel thread.
pub fn main(_: usize) -> ! {
    debug!(Thread, "reaper running");
    loop {
        let batch: Vec<Retired> = core::mem::take(&mut *QUEUE.lock());
        let mut kept = Vec::new();
        for item in batch {
            if let Some(back) = bury(item) {
                kept.push(back);
            }
        }

        let had_stragglers = !kept.is_empty();
        QUEUE.lock().append(&mut kept);

        if had_stragglers {
            // give the straggler's CPU a moment to finish switching
            crate::thread::current::yield_now();
        } else {
            let _ = REAPER_WQ.sleep_flags(100_000, SleepFlags::NON_BLOCKING);
        }
    }
}

/// Spawns the reaper into `kernel_task` and makes it runnable.
pub fn spawn(kernel_task: &Arc<Task>) {
    let thread = Thread::spawn_kernel(
        kernel_task,
        main,
        0,
        "reaper".try_into().expect("name fits"),
    )
    .expect("failed to spawn the reaper");
    scheduler::thread_ready(thread);
}
