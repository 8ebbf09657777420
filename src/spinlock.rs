use core::cell::UnsafeCell;
use core::hint;
use core::ops::{Deref, DerefMut};
use core::ptr;
use core::sync::atomic::{AtomicPtr, Ordering};

use crate::proc::{Cpu, InterruptLock, current_cpu, lock_current_cpu};

/// A mutual exclusion primitive useful for protecting shared data.
/// It uses a spinlock to achieve mutual exclusion.
#[derive(Debug)]
pub struct SpinLock<T> {
    name: &'static str,
    cpu: AtomicPtr<Cpu>,
    data: UnsafeCell<T>,
}

/// A guard that releases the lock when dropped.
pub struct SpinLockGuard<'a, T: 'a> {
    lock: &'a SpinLock<T>,
    _intr_lock: InterruptLock,
}

impl<T> SpinLock<T> {
    pub const fn new(value: T, name: &'static str) -> Self {
        SpinLock {
            name,
            cpu: AtomicPtr::new(ptr::null_mut()),
            data: UnsafeCell::new(value),
        }
    }

    /// Returns true if the current CPU is holding the lock.
    /// # Safety: must be called with interrupts disabled.
    unsafe fn holding(&self) -> bool {
        self.cpu.load(Ordering::Relaxed) == unsafe { current_cpu() as *mut Cpu }
    }

    /// Acquires the lock, spinning until it is available.
    ///
    /// Returns a guard that releases the lock when dropped.
    ///
    /// Interrupts stay disabled on this CPU while the guard lives.
    pub fn lock(&self) -> SpinLockGuard<'_, T> {
        let intr_lock = lock_current_cpu();

        // Safety: interrupts are disabled
        unsafe {
            assert!(!self.holding(), "acquire spinlock {}", self.name);
        }

        loop {
            if self
                .cpu
                .compare_exchange(
                    ptr::null_mut(),
                    // Safety: interrupts are disabled
                    unsafe { current_cpu() as *mut Cpu },
                    Ordering::Acquire,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                break SpinLockGuard {
                    lock: self,
                    _intr_lock: intr_lock,
                };
            }

            hint::spin_loop()
        }
    }

    /// Releases the lock on the mutex.
    ///
    /// The interrupt lock held by the guard is released too, restoring
    /// the previous interrupt state.
    pub fn unlock(guard: SpinLockGuard<'_, T>) -> &'_ SpinLock<T> {
        guard.lock
    }

    /// Unlocks without a guard, manually releasing the `InterruptLock`.
    ///
    /// # Safety
    /// Used by `fork_ret` to unlock after returning from the scheduler.
    pub unsafe fn force_unlock(&self) {
        unsafe {
            assert!(self.holding(), "force_unlock: not locked {}", self.name);
            self.cpu.store(ptr::null_mut(), Ordering::Release);
            current_cpu().unlock();
        }
    }

    /// Consumes the mutex and returns the inner data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// Returns a mutable reference to the inner data.
    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    /// Returns a reference to the inner data from a shared reference to
    /// the mutex.
    ///
    /// # Safety
    /// The caller must ensure that the mutex is locked.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut_unchecked(&self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

/// Dropping the guard releases the lock and the interrupt lock.
impl<'a, T: 'a> Drop for SpinLockGuard<'a, T> {
    fn drop(&mut self) {
        assert!(
            // Safety: the guard carries an interrupt lock
            unsafe { self.lock.holding() },
            "release lock {}",
            self.lock.name
        );

        self.lock.cpu.store(ptr::null_mut(), Ordering::Release);
    }
}

impl<T> Deref for SpinLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for SpinLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

// Safety: Since the holder can call `into_inner`, if we are sharing a
// reference, the inner type must also be thread safe to Send.
unsafe impl<T> Sync for SpinLock<T> where T: Send {}

// Safety: SpinLock can be sent to another thread if T can be sent.
unsafe impl<T> Send for SpinLock<T> where T: Send {}

// Safety: Since the holder can call `Deref`, if we are sharing a
// reference, the inner type must also be thread safe to Sync.
unsafe impl<T> Sync for SpinLockGuard<'_, T> where T: Sync {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_unlock() {
        let lock = SpinLock::new(42, "test");
        {
            let guard = lock.lock();
            assert_eq!(*guard, 42);
        }
        // released after the guard drops
        let guard = lock.lock();
        assert_eq!(*guard, 42);
    }

    #[test]
    fn mutate_through_guard() {
        let lock = SpinLock::new(0, "test");
        {
            let mut guard = lock.lock();
            *guard = 99;
        }
        assert_eq!(*lock.lock(), 99);
    }

    #[test]
    fn unlock_returns_lock() {
        let lock = SpinLock::new((), "test");
        let guard = lock.lock();
        let same = SpinLock::unlock(guard);
        // reacquire through the returned reference
        drop(same.lock());
    }
}
