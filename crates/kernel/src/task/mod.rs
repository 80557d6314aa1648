//! Tasks: the owners of address spaces, threads, IPC endpoints and
//! futexes.

#[cfg(test)]
mod tests;

pub mod run;

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use alloc::boxed::Box;
use alloc::sync::Arc;
use alloc::vec::Vec;
use bitflags::bitflags;
use hashbrown::HashMap;
use lazy_static::lazy_static;
use thiserror::Error;

use crate::ipc::{self, Answerbox, Phone};
use crate::memory::address_space::AddressSpace;
use crate::memory::VirtAddr;
use crate::sync::waitq::WaitQueue;
use crate::thread::{Thread, ThreadError};
use crate::utils::locks::SpinLock;
use crate::utils::types::Name;
use crate::{debug, scheduler, sync};

pub use opal_abi::process::MAX_PHONES;

/// Task ID, assigned monotonically and never reused.
pub type TaskId = u64;

bitflags! {
    /// Capability bits gating privileged syscalls.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TaskCaps: u32 {
        /// May kill foreign tasks.
        const KILL = 1 << 0;
        /// May switch the console to the kernel debug log.
        const DEBUG_CONSOLE = 1 << 1;
        /// May open new phone connections.
        const IPC_CONNECT = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("no task with the given id")]
    InvalidId,
    #[error("out of memory")]
    NoMemory,
    #[error("thread creation failed: {0}")]
    Thread(#[from] ThreadError),
}

struct TaskThreads {
    threads: Vec<Arc<Thread>>,
    main_thread: Option<Arc<Thread>>,
    accept_new_threads: bool,
}

pub struct Task {
    id: TaskId,
    name: Name,
    address_space: Arc<AddressSpace>,

    threads: SpinLock<TaskThreads>,
    caps: SpinLock<TaskCaps>,

    pub(crate) answerbox: Answerbox,
    pub(crate) phones: [Phone; MAX_PHONES],
    pub(crate) active_calls: AtomicUsize,

    pub(crate) futexes: SpinLock<HashMap<VirtAddr, Arc<WaitQueue>>>,

    kill_pending: AtomicBool,
}

struct TaskIndex {
    map: HashMap<TaskId, Arc<Task>>,
    next_id: TaskId,
}

lazy_static! {
    /// The global id -> task index ("tasks lock" in the locking order).
    static ref TASKS: SpinLock<TaskIndex> = SpinLock::new(TaskIndex {
        map: HashMap::new(),
        next_id: 1,
    });
}

/// Looks up a live task by id.
pub fn find(id: TaskId) -> Option<Arc<Task>> {
    TASKS.lock().map.get(&id).cloned()
}

/// Number of live tasks.
pub fn count() -> usize {
    TASKS.lock().map.len()
}

impl Task {
    /// Creates a task owning `address_space` and publishes it in the id
    /// index.
    pub fn create(address_space: Arc<AddressSpace>, name: Name) -> Arc<Self> {
        let mut index = TASKS.lock();
        let id = index.next_id;
        index.next_id += 1;

        let task = Arc::new(Self {
            id,
            name,
            address_space,
            threads: SpinLock::new(TaskThreads {
                threads: Vec::new(),
                main_thread: None,
                accept_new_threads: true,
            }),
            caps: SpinLock::new(TaskCaps::empty()),
            answerbox: Answerbox::new(),
            phones: core::array::from_fn(|_| Phone::new()),
            active_calls: AtomicUsize::new(0),
            futexes: SpinLock::new(HashMap::new()),
            kill_pending: AtomicBool::new(false),
        });

        index.map.insert(id, task.clone());
        debug!(Task, "task {} ({}) created", id, task.name);
        task
    }

    /// Creates a fully capable task with a fresh empty address space, for
    /// kernel housekeeping threads.
    pub fn create_kernel(name: Name) -> Result<Arc<Self>, TaskError> {
        let address_space = AddressSpace::new().map_err(|_| TaskError::NoMemory)?;
        let task = Self::create(address_space, name);
        *task.caps.lock() = TaskCaps::all();
        Ok(task)
    }

    pub const fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &Name {
        &self.name
    }

    pub fn address_space(&self) -> &Arc<AddressSpace> {
        &self.address_space
    }

    pub fn has_cap(&self, cap: TaskCaps) -> bool {
        self.caps.lock().contains(cap)
    }

    pub fn grant_caps(&self, caps: TaskCaps) {
        *self.caps.lock() |= caps;
    }

    // ---- thread group --------------------------------------------------

    /// Links a freshly created thread into the group; the first one
    /// becomes the main thread.
    pub(crate) fn attach_thread(&self, thread: Arc<Thread>) -> Result<(), ()> {
        let mut group = self.threads.lock();
        if !group.accept_new_threads {
            return Err(());
        }
        if group.main_thread.is_none() {
            group.main_thread = Some(thread.clone());
        }
        group.threads.push(thread);
        Ok(())
    }

    /// Drops the ownership link to `thread` (exit or reap path).
    pub fn release_thread(&self, thread: &Arc<Thread>) {
        let mut group = self.threads.lock();
        group.threads.retain(|t| !Arc::ptr_eq(t, thread));
        if group
            .main_thread
            .as_ref()
            .is_some_and(|main| Arc::ptr_eq(main, thread))
        {
            group.main_thread = None;
        }
    }

    pub fn thread_count(&self) -> usize {
        self.threads.lock().threads.len()
    }

    pub fn main_thread(&self) -> Option<Arc<Thread>> {
        self.threads.lock().main_thread.clone()
    }

    pub fn threads_snapshot(&self) -> Vec<Arc<Thread>> {
        self.threads.lock().threads.clone()
    }

    pub fn stop_accepting_threads(&self) {
        self.threads.lock().accept_new_threads = false;
    }

    pub fn accepts_new_threads(&self) -> bool {
        self.threads.lock().accept_new_threads
    }

    pub fn is_kill_pending(&self) -> bool {
        self.kill_pending.load(Ordering::Acquire)
    }
}

impl core::fmt::Debug for Task {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("threads", &self.thread_count())
            .finish()
    }
}

/// Kills the task with `id`.
///
/// The task stops accepting threads, every thread except the caller's
/// gets a termination request (interrupting its sleeps), its IPC
/// endpoints are torn down, and a cleanup thread finishes the burial:
/// joining the stragglers, clearing futexes and dropping the index
/// reference. The task structure itself is freed with its last `Arc`,
/// after the address space reference goes away with it.
pub fn kill(id: TaskId) -> Result<(), TaskError> {
    let task = find(id).ok_or(TaskError::InvalidId)?;
    if task.kill_pending.swap(true, Ordering::AcqRel) {
        return Ok(());
    }

    debug!(Task, "killing task {} ({})", id, task.name());
    task.stop_accepting_threads();

    let current = crate::thread::current::current();
    for thread in task.threads_snapshot() {
        if current.as_ref().is_some_and(|c| Arc::ptr_eq(c, &thread)) {
            continue;
        }
        thread.request_termination();
    }

    ipc::hangup_all(&task);

    if scheduler::can_block() {
        let arg = Box::into_raw(Box::new(task.clone())) as usize;
        let cleaner = Thread::spawn_kernel(
            &kernel_task(),
            cleanup_main,
            arg,
            "cleanup".try_into().expect("name fits"),
        )?;
        scheduler::thread_ready(cleaner);
    } else {
        cleanup(&task);
    }
    Ok(())
}

fn cleanup_main(arg: usize) -> ! {
    let task: Arc<Task> = *unsafe { Box::from_raw(arg as *mut Arc<Task>) };
    cleanup(&task);
    crate::thread::current::exit(0)
}

/// The burial: joins every thread except the main one (the killer thread
/// owns that join), releases IPC and futex state and unpublishes the
/// task.
pub(crate) fn cleanup(task: &Arc<Task>) {
    loop {
        let victim = {
            let group = task.threads.lock();
            let main = group.main_thread.clone();
            group
                .threads
                .iter()
                .find(|t| {
                    !main.as_ref().is_some_and(|m| Arc::ptr_eq(m, t)) && !t.is_detached()
                })
                .cloned()
        };

        let Some(victim) = victim else { break };
        let _ = victim.join();
        task.release_thread(&victim);
    }

    ipc::cleanup(task);
    sync::futex::cleanup(task);

    TASKS.lock().map.remove(&task.id());
    debug!(Task, "task {} cleaned up", task.id());
}

lazy_static! {
    static ref KERNEL_TASK: Arc<Task> = {
        Task::create_kernel("kernel".try_into().expect("name fits"))
            .expect("failed to create the kernel task")
    };
}

/// The task kernel housekeeping threads belong to.
pub fn kernel_task() -> Arc<Task> {
    KERNEL_TASK.clone()
}
