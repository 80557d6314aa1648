//! Threads: the unit of execution the scheduler moves between CPUs.

use core::cell::UnsafeCell;
use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec;
use thiserror::Error;

use crate::arch;
use crate::memory::VirtAddr;
use crate::scheduler;
use crate::sync::waitq::{SleepResult, WaitQueue};
use crate::task::Task;
use crate::utils::locks::{SpinLock, SpinLockGuard};
use crate::utils::types::Name;
use crate::{clock, debug};

pub mod current;

/// Thread ID, unique for the lifetime of the system.
pub type Tid = u32;

pub const KERNEL_STACK_SIZE: usize = 4 * crate::memory::paging::PAGE_SIZE;

/// Sleeping at least this long earns a one-band priority bonus on wakeup.
pub const WAKE_BONUS_THRESHOLD_US: u64 = 50_000;

/// Not wired to any CPU.
const NO_WIRED_CPU: usize = usize::MAX;

static NEXT_TID: AtomicU32 = AtomicU32::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Created, not yet published to the scheduler.
    Entering,
    /// In some CPU's runqueue.
    Ready,
    /// On a CPU right now.
    Running,
    /// Linked into exactly one wait queue.
    Sleeping,
    /// Done; waiting to be joined or reaped.
    Exiting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeCause {
    /// A waker delivered the event (the thread is already unlinked).
    Event,
    /// Termination request or another reason to spin the sleep loop.
    Spurious,
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum ThreadError {
    #[error("task no longer accepts new threads")]
    TaskNotAccepting,
    #[error("out of kernel memory")]
    NoMemory,
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum JoinError {
    #[error("thread is detached")]
    Detached,
    #[error("thread already has a joiner")]
    AlreadyJoined,
}

/// What the thread runs once the scheduler first picks it.
#[derive(Clone, Copy)]
enum ThreadEntry {
    Kernel { entry: fn(usize) -> !, arg: usize },
    User { entry: VirtAddr, stack_top: VirtAddr, arg: usize },
}

pub struct Thread {
    tid: Tid,
    name: Name,
    task: Arc<Task>,

    /// owned kernel stack; freed when the last reference drops
    #[allow(dead_code)]
    kstack: Box<[u8]>,
    context: UnsafeCell<arch::context::Context>,
    entry: ThreadEntry,

    state: SpinLock<ThreadState>,
    /// true from the moment a CPU starts running us until the switch
    /// away has fully completed
    on_cpu: AtomicBool,
    /// a wakeup that arrived while we were still on our way to sleep
    unparked: AtomicBool,

    // wait-queue linkage, written under the owning queue's lock
    wq_linked: AtomicBool,
    sleep_seq: AtomicU64,
    sleep_timed_out: AtomicBool,
    sleep_started_us: AtomicU64,
    wake_bonus_pending: AtomicBool,

    // scheduling
    band: AtomicU8,
    quantum_expired: AtomicBool,
    preempt_disabled: AtomicU32,
    pending_preempt: AtomicBool,
    wired_cpu: AtomicUsize,

    terminate_requested: AtomicBool,

    // exit / join
    detached: AtomicBool,
    joiner_claimed: AtomicBool,
    exit_value: AtomicUsize,
    exit_wq: WaitQueue,
}

unsafe impl Send for Thread {}
unsafe impl Sync for Thread {}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("tid", &self.tid)
            .field("name", &self.name)
            .field("state", &*self.state.lock())
            .finish()
    }
}

extern "C" fn thread_trampoline(_: usize) -> ! {
    scheduler::finish_switch();
    let thread = scheduler::current_thread().expect("trampoline outside a thread");
    match thread.entry {
        ThreadEntry::Kernel { entry, arg } => entry(arg),
        ThreadEntry::User { entry, stack_top, arg } => {
            arch::enter_userspace(entry, stack_top, arg)
        }
    }
}

impl Thread {
    fn new(task: &Arc<Task>, entry: ThreadEntry, name: Name) -> Result<Arc<Self>, ThreadError> {
        if !task.accepts_new_threads() {
            return Err(ThreadError::TaskNotAccepting);
        }

        let kstack = vec![0u8; KERNEL_STACK_SIZE].into_boxed_slice();
        let stack_top = VirtAddr::from_ptr(kstack.as_ptr()) + KERNEL_STACK_SIZE;
        let context = arch::context::Context::new(
            VirtAddr::from(thread_trampoline as usize),
            stack_top,
            0,
        );

        let thread = Arc::new(Self {
            tid: NEXT_TID.fetch_add(1, Ordering::Relaxed),
            name,
            task: task.clone(),
            kstack,
            context: UnsafeCell::new(context),
            entry,
            state: SpinLock::new(ThreadState::Entering),
            on_cpu: AtomicBool::new(false),
            unparked: AtomicBool::new(false),
            wq_linked: AtomicBool::new(false),
            sleep_seq: AtomicU64::new(0),
            sleep_timed_out: AtomicBool::new(false),
            sleep_started_us: AtomicU64::new(0),
            wake_bonus_pending: AtomicBool::new(false),
            band: AtomicU8::new(scheduler::DEFAULT_BAND),
            quantum_expired: AtomicBool::new(false),
            preempt_disabled: AtomicU32::new(0),
            pending_preempt: AtomicBool::new(false),
            wired_cpu: AtomicUsize::new(NO_WIRED_CPU),
            terminate_requested: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            joiner_claimed: AtomicBool::new(false),
            exit_value: AtomicUsize::new(0),
            exit_wq: WaitQueue::new(),
        });

        task.attach_thread(thread.clone())
            .map_err(|_| ThreadError::TaskNotAccepting)?;

        debug!(
            Thread,
            "thread {} ({}) created in task {}",
            thread.tid,
            thread.name,
            task.id()
        );
        Ok(thread)
    }

    /// Creates a kernel thread in *Entering* state; publish it with
    /// [`scheduler::thread_ready`].
    pub fn spawn_kernel(
        task: &Arc<Task>,
        entry: fn(usize) -> !,
        arg: usize,
        name: Name,
    ) -> Result<Arc<Self>, ThreadError> {
        Self::new(task, ThreadEntry::Kernel { entry, arg }, name)
    }

    /// Creates a thread that drops to userspace at `entry` once first
    /// scheduled.
    pub fn spawn_user(
        task: &Arc<Task>,
        entry: VirtAddr,
        stack_top: VirtAddr,
        arg: usize,
        name: Name,
    ) -> Result<Arc<Self>, ThreadError> {
        Self::new(task, ThreadEntry::User { entry, stack_top, arg }, name)
    }

    pub const fn tid(&self) -> Tid {
        self.tid
    }

    pub fn name(&self) -> &Name {
        &self.name
    }

    pub const fn task(&self) -> &Arc<Task> {
        &self.task
    }

    pub fn state(&self) -> ThreadState {
        *self.state.lock()
    }

    pub(crate) fn state_lock(&self) -> SpinLockGuard<'_, ThreadState> {
        self.state.lock()
    }

    pub(crate) fn context_ptr(&self) -> *mut arch::context::Context {
        self.context.get()
    }

    pub fn band(&self) -> u8 {
        self.band.load(Ordering::Relaxed)
    }

    pub(crate) fn set_band(&self, band: u8) {
        self.band.store(band, Ordering::Relaxed);
    }

    /// Pins the thread to one CPU; ready threads only enter its queues.
    pub fn wire_to_cpu(&self, cpu: usize) {
        self.wired_cpu.store(cpu, Ordering::Relaxed);
    }

    pub fn wired_cpu(&self) -> Option<usize> {
        match self.wired_cpu.load(Ordering::Relaxed) {
            NO_WIRED_CPU => None,
            cpu => Some(cpu),
        }
    }

    // ---- wait-queue protocol -------------------------------------------

    /// Opens a sleep episode. Runs under the wait-queue lock.
    pub(crate) fn begin_sleep(&self) -> u64 {
        let seq = self.sleep_seq.fetch_add(1, Ordering::Relaxed) + 1;
        self.sleep_timed_out.store(false, Ordering::Relaxed);
        self.unparked.store(false, Ordering::Relaxed);
        self.wq_linked.store(true, Ordering::Relaxed);
        self.sleep_started_us
            .store(clock::boot_time_us(), Ordering::Relaxed);
        seq
    }

    /// Marks the thread Sleeping just before it parks. Runs under the
    /// wait-queue lock; the single Running -> Sleeping transition point.
    pub(crate) fn enter_sleep_state(&self) {
        *self.state.lock() = ThreadState::Sleeping;
    }

    pub(crate) fn wq_linked(&self) -> bool {
        self.wq_linked.load(Ordering::Relaxed)
    }

    pub(crate) fn set_wq_unlinked(&self) {
        self.wq_linked.store(false, Ordering::Relaxed);
    }

    pub(crate) fn take_sleep_timed_out(&self) -> bool {
        self.sleep_timed_out.swap(false, Ordering::Relaxed)
    }

    pub(crate) fn take_unparked(&self) -> bool {
        self.unparked.swap(false, Ordering::Acquire)
    }

    pub(crate) fn is_on_cpu(&self) -> bool {
        self.on_cpu.load(Ordering::Acquire)
    }

    pub(crate) fn set_on_cpu(&self, value: bool) {
        self.on_cpu.store(value, Ordering::Release);
    }

    /// Makes a sleeping thread runnable again.
    ///
    /// If the thread has not finished parking yet the wake is recorded as
    /// a pending unpark which either the park fast path or the switch-away
    /// completion consumes; the thread is never enqueued while another CPU
    /// may still be running it.
    pub fn try_wake(self: &Arc<Self>, _cause: WakeCause) {
        let mut state = self.state.lock();
        match *state {
            ThreadState::Sleeping if !self.is_on_cpu() => {
                *state = ThreadState::Ready;
                drop(state);

                let slept = clock::boot_time_us()
                    .saturating_sub(self.sleep_started_us.load(Ordering::Relaxed));
                if slept >= WAKE_BONUS_THRESHOLD_US {
                    self.wake_bonus_pending.store(true, Ordering::Relaxed);
                }
                scheduler::thread_ready(self.clone());
            }
            _ => {
                self.unparked.store(true, Ordering::Release);
            }
        }
    }

    /// Clock-tick side of `sleep_timeout`: wakes the thread with the
    /// timed-out flag if it is still in the same sleep episode.
    pub(crate) fn sleep_timeout_fired(self: &Arc<Self>, sleep_seq: u64) {
        if self.sleep_seq.load(Ordering::Relaxed) != sleep_seq {
            return;
        }
        self.sleep_timed_out.store(true, Ordering::Relaxed);
        self.try_wake(WakeCause::Spurious);
    }

    pub(crate) fn take_wake_bonus(&self) -> bool {
        self.wake_bonus_pending.swap(false, Ordering::Relaxed)
    }

    pub(crate) fn take_quantum_expired(&self) -> bool {
        self.quantum_expired.swap(false, Ordering::Relaxed)
    }

    pub(crate) fn set_quantum_expired(&self) {
        self.quantum_expired.store(true, Ordering::Relaxed);
    }

    // ---- preemption ----------------------------------------------------

    pub fn preempt_disable(&self) {
        self.preempt_disabled.fetch_add(1, Ordering::Relaxed);
    }

    /// Reenables preemption; a preemption the tick deferred while the
    /// counter was held fires here.
    pub fn preempt_enable(&self) {
        let prev = self.preempt_disabled.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "unbalanced preempt_enable");
        if prev == 1 && self.pending_preempt.swap(false, Ordering::Relaxed) {
            scheduler::yield_now();
        }
    }

    pub fn preemption_disabled(&self) -> bool {
        self.preempt_disabled.load(Ordering::Relaxed) > 0
    }

    pub(crate) fn set_pending_preempt(&self) {
        self.pending_preempt.store(true, Ordering::Relaxed);
    }

    // ---- termination / exit --------------------------------------------

    pub fn terminate_requested(&self) -> bool {
        self.terminate_requested.load(Ordering::Relaxed)
    }

    /// Asks the thread to terminate. An interruptible sleep in progress
    /// aborts with [`SleepResult::Interrupted`]; otherwise the thread
    /// observes the flag at its next syscall boundary.
    pub fn request_termination(self: &Arc<Self>) {
        self.terminate_requested.store(true, Ordering::Relaxed);
        self.try_wake(WakeCause::Spurious);
    }

    pub fn is_exiting(&self) -> bool {
        *self.state.lock() == ThreadState::Exiting
    }

    /// Publishes the exit value and flips the thread to *Exiting*,
    /// releasing every joiner (present and future).
    pub(crate) fn finish_exit(&self, code: usize) {
        self.exit_value.store(code, Ordering::Relaxed);
        *self.state.lock() = ThreadState::Exiting;
        self.exit_wq.close();
    }

    /// Waits for the thread to exit and returns its exit value. Exactly
    /// one joiner is allowed and detached threads cannot be joined.
    pub fn join(&self) -> Result<usize, JoinError> {
        if self.detached.load(Ordering::Acquire) {
            return Err(JoinError::Detached);
        }
        if self.joiner_claimed.swap(true, Ordering::AcqRel) {
            return Err(JoinError::AlreadyJoined);
        }

        let rc = self.exit_wq.sleep();
        debug_assert_eq!(rc, SleepResult::Ok);
        Ok(self.exit_value.load(Ordering::Relaxed))
    }

    /// Flags the thread for self-reaping; nobody may join it afterwards.
    pub fn detach(&self) -> Result<(), JoinError> {
        if self.joiner_claimed.load(Ordering::Acquire) {
            return Err(JoinError::AlreadyJoined);
        }
        self.detached.store(true, Ordering::Release);
        Ok(())
    }

    pub fn is_detached(&self) -> bool {
        self.detached.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::test_support::init_test_memory;
    use crate::task::Task;

    fn kernel_entry(_: usize) -> ! {
        unreachable!()
    }

    fn test_task(name: &str) -> Arc<Task> {
        init_test_memory();
        Task::create_kernel(name.try_into().unwrap()).unwrap()
    }

    #[test]
    fn spawn_links_thread_into_task() {
        let task = test_task("thr-spawn");
        let thread =
            Thread::spawn_kernel(&task, kernel_entry, 0, "worker".try_into().unwrap()).unwrap();

        assert_eq!(thread.state(), ThreadState::Entering);
        assert_eq!(task.thread_count(), 1);
        assert!(Arc::ptr_eq(thread.task(), &task));
    }

    #[test]
    fn spawn_refused_once_task_stops_accepting() {
        let task = test_task("thr-refuse");
        task.stop_accepting_threads();

        let err = Thread::spawn_kernel(&task, kernel_entry, 0, "late".try_into().unwrap());
        assert_eq!(err.unwrap_err(), ThreadError::TaskNotAccepting);
        assert_eq!(task.thread_count(), 0);
    }

    #[test]
    fn join_after_exit_returns_the_exit_value() {
        let task = test_task("thr-join");
        let thread =
            Thread::spawn_kernel(&task, kernel_entry, 0, "joinee".try_into().unwrap()).unwrap();

        thread.finish_exit(42);
        assert_eq!(thread.state(), ThreadState::Exiting);
        assert_eq!(thread.join(), Ok(42));
    }

    #[test]
    fn only_one_joiner_is_admitted() {
        let task = test_task("thr-joiners");
        let thread =
            Thread::spawn_kernel(&task, kernel_entry, 0, "popular".try_into().unwrap()).unwrap();
        thread.finish_exit(0);

        assert_eq!(thread.join(), Ok(0));
        assert_eq!(thread.join(), Err(JoinError::AlreadyJoined));
    }

    #[test]
    fn detached_thread_refuses_joiners() {
        let task = test_task("thr-detach");
        let thread =
            Thread::spawn_kernel(&task, kernel_entry, 0, "loner".try_into().unwrap()).unwrap();

        thread.detach().unwrap();
        assert_eq!(thread.join(), Err(JoinError::Detached));
    }

    #[test]
    fn termination_request_is_sticky() {
        let task = test_task("thr-term");
        let thread =
            Thread::spawn_kernel(&task, kernel_entry, 0, "victim".try_into().unwrap()).unwrap();

        assert!(!thread.terminate_requested());
        thread.request_termination();
        assert!(thread.terminate_requested());
    }

    #[test]
    fn tids_are_unique() {
        let task = test_task("thr-tids");
        let a = Thread::spawn_kernel(&task, kernel_entry, 0, "a".try_into().unwrap()).unwrap();
        let b = Thread::spawn_kernel(&task, kernel_entry, 0, "b".try_into().unwrap()).unwrap();
        assert_ne!(a.tid(), b.tid());
    }
}
