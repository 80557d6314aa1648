use core::{
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicBool, AtomicU32, Ordering},
};

use lock_api::{GuardSend, RawMutex, RawRwLock};
use spin::Lazy;

use crate::arch;

pub const SPIN_AMOUNT: u32 = 10_000;

#[inline(always)]
fn lock_loop<T>(this: &T, try_lock: impl Fn(&T) -> bool) {
    let mut spin_count = 0;
    while !try_lock(this) {
        core::hint::spin_loop();
        spin_count += 1;
        if spin_count > SPIN_AMOUNT {
            crate::thread::current::yield_now();
            spin_count = 0;
        }
    }
}

/// Raw pure-spin mutex, usable from interrupt context. Leaf locks
/// (runqueues, frame allocator, wait queues) are built on this.
pub struct RawSpinMutex(AtomicBool);

unsafe impl RawMutex for RawSpinMutex {
    const INIT: Self = Self(AtomicBool::new(false));
    type GuardMarker = GuardSend;

    fn lock(&self) {
        while !self.try_lock() {
            core::hint::spin_loop();
        }
    }

    #[inline(always)]
    fn try_lock(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline(always)]
    fn is_locked(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    unsafe fn unlock(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Raw mutex that spins for a while and then yields the CPU, for locks
/// that may be held across longer sections but never in interrupt context.
pub struct RawYieldMutex(AtomicBool);

unsafe impl RawMutex for RawYieldMutex {
    const INIT: Self = Self(AtomicBool::new(false));
    type GuardMarker = GuardSend;

    fn lock(&self) {
        lock_loop(self, Self::try_lock)
    }

    #[inline(always)]
    fn try_lock(&self) -> bool {
        self.0
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    #[inline(always)]
    fn is_locked(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    unsafe fn unlock(&self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct RawYieldRwLock(AtomicU32);
impl RawYieldRwLock {
    pub const WRITER_BIT: u32 = 1 << 31;
}

unsafe impl RawRwLock for RawYieldRwLock {
    const INIT: Self = Self(AtomicU32::new(0));
    type GuardMarker = GuardSend;

    fn lock_shared(&self) {
        lock_loop(self, Self::try_lock_shared)
    }

    fn lock_exclusive(&self) {
        lock_loop(self, Self::try_lock_exclusive)
    }

    fn try_lock_shared(&self) -> bool {
        let mut state = self.0.load(Ordering::Relaxed);
        loop {
            if state & Self::WRITER_BIT != 0 {
                return false;
            }

            match self.0.compare_exchange_weak(
                state,
                state + 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(s) => state = s,
            }
        }
    }

    fn try_lock_exclusive(&self) -> bool {
        self.0
            .compare_exchange(0, Self::WRITER_BIT, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    fn is_locked(&self) -> bool {
        self.0.load(Ordering::Relaxed) != 0
    }

    fn is_locked_exclusive(&self) -> bool {
        self.0.load(Ordering::Relaxed) & Self::WRITER_BIT != 0
    }

    unsafe fn unlock_shared(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    unsafe fn unlock_exclusive(&self) {
        self.0.store(0, Ordering::Release);
    }
}

pub type SpinLock<T> = lock_api::Mutex<RawSpinMutex, T>;
pub type SpinLockGuard<'a, T> = lock_api::MutexGuard<'a, RawSpinMutex, T>;

type MutexExt<T> = lock_api::Mutex<RawYieldMutex, T>;
pub type MutexGuard<'a, T> = lock_api::MutexGuard<'a, RawYieldMutex, T>;

type RwLockExt<T> = lock_api::RwLock<RawYieldRwLock, T>;
pub type RwLockReadGuard<'a, T> = lock_api::RwLockReadGuard<'a, RawYieldRwLock, T>;
pub type RwLockWriteGuard<'a, T> = lock_api::RwLockWriteGuard<'a, RawYieldRwLock, T>;

#[derive(Debug)]
#[repr(transparent)]
pub struct Mutex<T>(MutexExt<T>);

#[derive(Debug)]
#[repr(transparent)]
pub struct RwLock<T>(RwLockExt<T>);

#[derive(Debug)]
#[repr(transparent)]
pub struct LazyLock<T>(Lazy<T>);

impl<T> Mutex<T> {
    pub const fn new(inner: T) -> Self {
        Self(MutexExt::new(inner))
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.0.lock()
    }

    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.0.try_lock()
    }

    #[allow(unused)]
    pub fn get_mut(&mut self) -> &mut T {
        self.0.get_mut()
    }
}

impl<T> RwLock<T> {
    pub const fn new(inner: T) -> Self {
        Self(RwLockExt::new(inner))
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.0.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.0.write()
    }

    #[allow(unused)]
    pub fn get_mut(&mut self) -> &mut T {
        self.0.get_mut()
    }
}

impl<T> Deref for LazyLock<T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> LazyLock<T> {
    pub const fn new(f: fn() -> T) -> Self {
        Self(Lazy::new(f))
    }
}

/// A spinlock whose guard additionally keeps local interrupts disabled,
/// restoring the previous interrupt state on drop.
///
/// This is the lock used wherever interrupt handlers and threads touch the
/// same state (runqueues, wait queues, the shootdown mailboxes).
#[derive(Debug)]
pub struct IrqSpinLock<T> {
    inner: SpinLock<T>,
}

pub struct IrqSpinLockGuard<'a, T> {
    guard: Option<SpinLockGuard<'a, T>>,
    irq_was_enabled: bool,
}

impl<T> IrqSpinLock<T> {
    pub const fn new(inner: T) -> Self {
        Self {
            inner: SpinLock::new(inner),
        }
    }

    pub fn lock(&self) -> IrqSpinLockGuard<'_, T> {
        let irq_was_enabled = arch::interrupts_disable();
        IrqSpinLockGuard {
            guard: Some(self.inner.lock()),
            irq_was_enabled,
        }
    }

    #[allow(unused)]
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }
}

impl<T> Deref for IrqSpinLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &Self::Target {
        self.guard.as_ref().unwrap()
    }
}

impl<T> DerefMut for IrqSpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.guard.as_mut().unwrap()
    }
}

impl<T> Drop for IrqSpinLockGuard<'_, T> {
    fn drop(&mut self) {
        self.guard.take();
        if self.irq_was_enabled {
            arch::interrupts_enable();
        }
    }
}
