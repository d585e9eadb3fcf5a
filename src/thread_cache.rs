//! Per-thread free lists: the unsynchronized fast path.

use core::{cell::Cell, ptr::NonNull};
use std::cell::UnsafeCell;

use tracing::trace;

use crate::{
  CENTRAL_CACHE,
  central_cache::CentralCache,
  error::AllocError,
  free_list::FreeList,
  platform,
  size_class::{
    ALIGNMENT, FREE_LIST_SIZE, MAX_BYTES, batch_size, class_to_size, return_threshold,
    size_to_class,
  },
};

// =============================================================================
// Thread Cache
// =============================================================================

/// Free blocks owned by one thread, one list per size class.
///
/// Misses pull a batch from the central cache; a list that grows past its
/// budget gives three quarters of its blocks back.
pub struct ThreadCache {
  lists: [FreeList; FREE_LIST_SIZE],
  /// `None` means the process-wide central cache.
  central: Option<&'static CentralCache>,
}

impl ThreadCache {
  /// A cache over the process-wide hierarchy.
  pub const fn new() -> Self {
    Self {
      lists: [const { FreeList::new() }; FREE_LIST_SIZE],
      central: None,
    }
  }

  /// A cache over a caller-provided central cache.
  pub const fn with_central(central: &'static CentralCache) -> Self {
    Self {
      lists: [const { FreeList::new() }; FREE_LIST_SIZE],
      central: Some(central),
    }
  }

  #[inline]
  fn central(&self) -> &'static CentralCache {
    self.central.unwrap_or(&CENTRAL_CACHE)
  }

  /// Returns a block of at least `size` bytes, aligned to `ALIGNMENT`.
  ///
  /// `size == 0` is served as `ALIGNMENT`. Requests above `MAX_BYTES` bypass
  /// the pool and go to the system allocator.
  pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
    let size = if size == 0 { ALIGNMENT } else { size };
    if size > MAX_BYTES {
      return platform::system_alloc(size);
    }

    let class = size_to_class(size);
    if let Some(block) = self.lists[class].pop() {
      return Ok(block);
    }
    self.refill(class)
  }

  #[inline(never)]
  fn refill(&mut self, class: usize) -> Result<NonNull<u8>, AllocError> {
    let batch = batch_size(class_to_size(class));
    let mut chain = self.central().fetch_range(class, batch)?;
    let block = chain.pop().ok_or(AllocError::EmptyRefill { class })?;
    self.lists[class].append(chain);
    Ok(block)
  }

  /// Takes back a block obtained from `allocate(size)`.
  ///
  /// # Safety
  /// `ptr` must come from `allocate` on a cache sharing this central cache,
  /// with a `size` of the same class, and must not be used afterwards.
  pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) {
    if size > MAX_BYTES {
      unsafe { platform::system_free(ptr) };
      return;
    }

    let class = size_to_class(size);
    let list = &mut self.lists[class];
    unsafe { list.push(ptr) };

    if list.len() > return_threshold(class_to_size(class)) {
      self.shrink(class);
    }
  }

  /// Gives all but a quarter (at least one) of `class`'s blocks back.
  #[inline(never)]
  fn shrink(&mut self, class: usize) {
    let list = &mut self.lists[class];
    let keep = (list.len() / 4).max(1);
    let surplus = list.split_off(keep);
    // SAFETY: every block in the list belongs to `class` and is ours.
    unsafe { self.central().return_range(surplus, class) };
  }

  /// Blocks of `class` cached by this thread.
  pub fn cached(&self, class: usize) -> usize {
    self.lists.get(class).map_or(0, FreeList::len)
  }
}

impl Default for ThreadCache {
  fn default() -> Self {
    Self::new()
  }
}

impl Drop for ThreadCache {
  fn drop(&mut self) {
    let central = self.central();
    let mut flushed = 0;
    for (class, list) in self.lists.iter_mut().enumerate() {
      if list.is_empty() {
        continue;
      }
      let chain = core::mem::take(list);
      flushed += chain.len();
      // SAFETY: lists only ever hold blocks of their own class.
      unsafe { central.return_range(chain, class) };
    }
    if flushed > 0 {
      trace!(flushed, "thread cache flushed to central cache");
    }
  }
}

// =============================================================================
// TLS
// =============================================================================

thread_local! {
  static CACHE: UnsafeCell<ThreadCache> = const { UnsafeCell::new(ThreadCache::new()) };
  static IN_POOL: Cell<bool> = const { Cell::new(false) };
}

/// Runs `f` on this thread's cache.
///
/// Returns `None` when thread-local storage is gone (thread teardown) or when
/// called re-entrantly from inside the pool on this thread. The flag is raised
/// before the cache is first touched, so allocations made while registering
/// its destructor also see `None`.
pub(crate) fn with_thread_cache<R>(f: impl FnOnce(&mut ThreadCache) -> R) -> Option<R> {
  let entered = IN_POOL.try_with(|flag| !flag.replace(true)).ok()?;
  if !entered {
    return None;
  }
  let _entered = Entered;

  // SAFETY: only this thread reaches its cache, and the flag rules out a
  // second live borrow.
  CACHE.try_with(|cell| f(unsafe { &mut *cell.get() })).ok()
}

/// Lowers `IN_POOL` on every exit from `with_thread_cache`, unwinding included.
struct Entered;

impl Drop for Entered {
  fn drop(&mut self) {
    let _ = IN_POOL.try_with(|flag| flag.set(false));
  }
}
