#![allow(clippy::missing_safety_doc)]

//! Three-tier thread-caching memory pool.
//!
//! - Thread cache: per-thread free lists, no locks.
//! - Central cache: one spin-locked free list per size class, shared.
//! - Page cache: page-granular spans from anonymous mappings, split and
//!   coalesced under a single lock.
//!
//! Requests above `MAX_BYTES` bypass all three tiers and go to the system
//! allocator. The `tagged` layer adds a 16-byte header so callers can free
//! without remembering the size; `Pool` exposes it as a `GlobalAlloc`.
//!
//! ```
//! let block = tierpool::allocate(24).unwrap();
//! unsafe { tierpool::deallocate(block, 24) };
//!
//! let tagged = tierpool::tagged::allocate(100, true).unwrap();
//! unsafe { tierpool::tagged::free(tagged.as_ptr()) };
//! ```

use core::{
  alloc::{GlobalAlloc, Layout},
  ptr::{self, NonNull, null_mut},
};

pub mod central_cache;
pub mod error;
pub mod free_list;
pub mod page_cache;
mod platform;
pub mod size_class;
mod sync;
pub mod tagged;
pub mod thread_cache;

pub use central_cache::CentralCache;
pub use error::AllocError;
pub use free_list::FreeList;
pub use page_cache::{PageCache, PageStats};
pub use size_class::{ALIGNMENT, FREE_LIST_SIZE, MAX_BYTES, PAGE_SIZE, SPAN_PAGES};
pub use thread_cache::ThreadCache;

use size_class::size_to_class;
use thread_cache::with_thread_cache;

// =============================================================================
// Process-wide hierarchy
// =============================================================================

/// Every page the pool hands out comes from here.
pub(crate) static PAGE_CACHE: PageCache = PageCache::new();

/// Shared per-class lists over `PAGE_CACHE`. Thread caches default to it.
pub(crate) static CENTRAL_CACHE: CentralCache = CentralCache::new(&PAGE_CACHE);

// =============================================================================
// Size-based API
// =============================================================================

/// Allocates at least `size` bytes aligned to `ALIGNMENT`.
///
/// Uses this thread's cache; when it is unavailable (thread teardown) a
/// single block is taken from the central cache instead.
pub fn allocate(size: usize) -> Result<NonNull<u8>, AllocError> {
  with_thread_cache(|cache| cache.allocate(size)).unwrap_or_else(|| allocate_uncached(size))
}

/// Releases a block from `allocate`.
///
/// # Safety
/// `size` must map to the same size class as at allocation time; this is not
/// checked, and a mismatch corrupts the free lists.
pub unsafe fn deallocate(ptr: NonNull<u8>, size: usize) {
  let cached = with_thread_cache(|cache| unsafe { cache.deallocate(ptr, size) });
  if cached.is_none() {
    unsafe { deallocate_uncached(ptr, size) };
  }
}

#[inline(never)]
fn allocate_uncached(size: usize) -> Result<NonNull<u8>, AllocError> {
  let size = size.max(ALIGNMENT);
  if size > MAX_BYTES {
    return platform::system_alloc(size);
  }
  let class = size_to_class(size);
  CENTRAL_CACHE
    .fetch_range(class, 1)?
    .pop()
    .ok_or(AllocError::EmptyRefill { class })
}

#[inline(never)]
unsafe fn deallocate_uncached(ptr: NonNull<u8>, size: usize) {
  if size > MAX_BYTES {
    unsafe { platform::system_free(ptr) };
    return;
  }
  let mut single = FreeList::new();
  unsafe {
    single.push(ptr);
    CENTRAL_CACHE.return_range(single, size_to_class(size));
  }
}

/// Drops the process-wide page cache's bookkeeping. Mapped memory is kept
/// until process exit; spans handed out earlier are no longer recognised.
pub fn shutdown() {
  PAGE_CACHE.shutdown();
}

/// Bookkeeping snapshot of the process-wide page cache.
pub fn page_stats() -> PageStats {
  PAGE_CACHE.stats()
}

// =============================================================================
// GlobalAlloc
// =============================================================================

/// The pool as a global allocator, on top of the tagged layer.
///
/// ```ignore
/// #[global_allocator]
/// static GLOBAL: tierpool::Pool = tierpool::Pool;
/// ```
///
/// Layouts aligned above 16 bytes go to `posix_memalign`; `dealloc` tells the
/// two apart from the layout. Allocations made while the pool is running on
/// the same thread (its own bookkeeping) are served by the system allocator.
pub struct Pool;

unsafe impl GlobalAlloc for Pool {
  unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
    if layout.align() > tagged::HEADER_ALIGN {
      return platform::system_alloc_aligned(layout.size(), layout.align())
        .map_or(null_mut(), NonNull::as_ptr);
    }
    tagged::allocate_bytes(layout.size(), false).map_or(null_mut(), NonNull::as_ptr)
  }

  unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
    if layout.align() > tagged::HEADER_ALIGN {
      let ptr = unsafe { self.alloc(layout) };
      if !ptr.is_null() {
        unsafe { ptr::write_bytes(ptr, 0, layout.size()) };
      }
      return ptr;
    }
    tagged::allocate_bytes(layout.size(), true).map_or(null_mut(), NonNull::as_ptr)
  }

  unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
    if layout.align() > tagged::HEADER_ALIGN {
      if let Some(ptr) = NonNull::new(ptr) {
        unsafe { platform::system_free(ptr) };
      }
      return;
    }
    unsafe { tagged::free(ptr) };
  }

  unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
    if layout.align() <= tagged::HEADER_ALIGN && new_size <= unsafe { tagged::usable_size(ptr) } {
      return ptr;
    }

    let new_layout = unsafe { Layout::from_size_align_unchecked(new_size, layout.align()) };
    let new_ptr = unsafe { self.alloc(new_layout) };
    if !new_ptr.is_null() {
      unsafe {
        ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
        self.dealloc(ptr, layout);
      }
    }
    new_ptr
  }
}

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub(crate) const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}
