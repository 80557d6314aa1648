//! Synchronization primitives.
//!
//! [`waitq::WaitQueue`] is the one blocking primitive; everything else in
//! this module is a thin composition of wait queues and counters and
//! never reaches into the queue's internals.

pub mod condvar;
pub mod futex;
pub mod mutex;
pub mod semaphore;
pub mod waitq;

pub use condvar::CondVar;
pub use mutex::{Mutex, MutexGuard};
pub use semaphore::Semaphore;
pub use waitq::{SleepFlags, SleepResult, WaitQueue};
