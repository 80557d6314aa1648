//! Sleeping mutex: a binary semaphore with an RAII guard.
//!
//! Unlike [`crate::utils::locks`] spinlocks, waiters give up the CPU, so
//! this is the lock for sections that may themselves sleep (the address
//! space lock most of all).

use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

use super::semaphore::Semaphore;
use super::waitq::SleepResult;

pub struct Mutex<T: ?Sized> {
    sem: Semaphore,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

pub struct MutexGuard<'a, T: ?Sized> {
    mutex: &'a Mutex<T>,
}

impl<T> Mutex<T> {
    pub const fn new(data: T) -> Self {
        Self {
            sem: Semaphore::new(1),
            data: UnsafeCell::new(data),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.sem.down();
        MutexGuard { mutex: self }
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.sem.try_down().then_some(MutexGuard { mutex: self })
    }

    pub fn lock_timeout(&self, usec: u64) -> Option<MutexGuard<'_, T>> {
        (self.sem.down_timeout(usec) == SleepResult::Ok).then_some(MutexGuard { mutex: self })
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub(super) fn raw_unlock(&self) {
        self.sem.up();
    }

    pub(super) fn raw_lock(&self) {
        self.sem.down();
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.mutex.raw_unlock();
    }
}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    pub(super) fn mutex(&self) -> &'a Mutex<T> {
        self.mutex
    }

    /// Rebuilds a guard for a mutex whose semaphore the caller has just
    /// reacquired (condvar wakeup path).
    pub(super) fn recreate(mutex: &'a Mutex<T>) -> Self {
        Self { mutex }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_excludes_and_releases() {
        let mutex = Mutex::new(5);
        {
            let mut guard = mutex.lock();
            *guard += 1;
            assert!(mutex.try_lock().is_none());
        }
        assert_eq!(*mutex.lock(), 6);
    }

    #[test]
    fn lock_timeout_fails_while_held() {
        let mutex = Mutex::new(());
        let _guard = mutex.lock();
        assert!(mutex.lock_timeout(0).is_none());
    }
}
