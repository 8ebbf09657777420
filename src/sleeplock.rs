use core::cell::UnsafeCell;

use crate::proc::{self, Channel, Pid};
use crate::spinlock::SpinLock;

/// Inner state of a SleepLock, guarded by a SpinLock.
#[derive(Debug)]
pub struct SleepLockInner {
    locked: bool,
    pid: Option<Pid>,
}

/// A lock that puts the caller to sleep while waiting. Unlike SpinLock,
/// interrupts remain enabled while holding it, so it is safe to hold
/// across long operations -- but only process context may take it.
#[derive(Debug)]
pub struct SleepLock<T> {
    _name: &'static str,
    /// only protects the lock state, not the data
    inner: SpinLock<SleepLockInner>,
    data: UnsafeCell<T>,
}

/// A guard that releases the SleepLock when dropped.
#[derive(Debug)]
pub struct SleepLockGuard<'a, T: 'a> {
    lock: &'a SleepLock<T>,
}

impl<T> SleepLock<T> {
    pub const fn new(value: T, name: &'static str) -> Self {
        SleepLock {
            _name: name,
            inner: SpinLock::new(
                SleepLockInner {
                    pid: None,
                    locked: false,
                },
                name,
            ),
            data: UnsafeCell::new(value),
        }
    }

    /// Returns true if the current process is holding the lock.
    pub fn holding(&self) -> bool {
        let inner = self.inner.lock();

        inner.locked
            && inner.pid.is_some()
            && inner.pid == proc::current_proc_opt().map(|proc| proc.inner.lock().pid)
    }

    /// Acquires the lock, sleeping until it is available.
    pub fn lock(&self) -> SleepLockGuard<'_, T> {
        let mut inner = self.inner.lock();

        while inner.locked {
            inner = proc::sleep(Channel::Lock(self as *const _ as usize), inner);
        }

        inner.locked = true;
        inner.pid = proc::current_proc_opt().map(|proc| proc.inner.lock().pid);

        SleepLockGuard { lock: self }
    }

    /// Consumes the lock and returns the inner data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// Returns a reference to the inner data from a shared reference to
    /// the lock.
    ///
    /// # Safety
    /// The caller must ensure that the lock is held.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn get_mut_unchecked(&self) -> &mut T {
        unsafe { &mut *self.data.get() }
    }
}

impl<'a, T: 'a> Drop for SleepLockGuard<'a, T> {
    fn drop(&mut self) {
        let mut inner = self.lock.inner.lock();
        inner.locked = false;
        inner.pid = None;
        drop(inner);

        proc::wakeup(Channel::Lock(self.lock as *const _ as usize));
    }
}

impl<T> core::ops::Deref for SleepLockGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> core::ops::DerefMut for SleepLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

unsafe impl<T> Sync for SleepLock<T> where T: Send {}
unsafe impl<T> Send for SleepLock<T> where T: Send {}
