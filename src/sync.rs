use core::{
  cell::UnsafeCell,
  hint,
  ops::{Deref, DerefMut},
  sync::atomic::{AtomicBool, Ordering},
};

/// Test-and-set spin lock guarding a `T`.
///
/// Critical sections must stay short (a few pointer splices). A contended
/// acquirer spins briefly, then yields its time slice.
pub(crate) struct SpinMutex<T> {
  locked: AtomicBool,
  value: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for SpinMutex<T> {}
unsafe impl<T: Send> Send for SpinMutex<T> {}

/// Spins before falling back to `yield_now`.
const SPIN_LIMIT: u32 = 64;

impl<T> SpinMutex<T> {
  pub(crate) const fn new(value: T) -> Self {
    Self {
      locked: AtomicBool::new(false),
      value: UnsafeCell::new(value),
    }
  }

  #[inline]
  pub(crate) fn lock(&self) -> SpinGuard<'_, T> {
    let mut spins = 0;
    while self
      .locked
      .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
      .is_err()
    {
      while self.locked.load(Ordering::Relaxed) {
        if spins < SPIN_LIMIT {
          spins += 1;
          hint::spin_loop();
        } else {
          std::thread::yield_now();
        }
      }
    }
    SpinGuard { lock: self }
  }
}

/// Releases the lock when dropped, on every exit path.
pub(crate) struct SpinGuard<'a, T> {
  lock: &'a SpinMutex<T>,
}

impl<T> Deref for SpinGuard<'_, T> {
  type Target = T;

  fn deref(&self) -> &T {
    // SAFETY: the guard proves exclusive ownership of the lock.
    unsafe { &*self.lock.value.get() }
  }
}

impl<T> DerefMut for SpinGuard<'_, T> {
  fn deref_mut(&mut self) -> &mut T {
    // SAFETY: the guard proves exclusive ownership of the lock.
    unsafe { &mut *self.lock.value.get() }
  }
}

impl<T> Drop for SpinGuard<'_, T> {
  #[inline]
  fn drop(&mut self) {
    self.lock.locked.store(false, Ordering::Release);
  }
}
