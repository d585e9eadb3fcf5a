//! Operating-system boundary: anonymous page mappings and the system allocator.

use core::ptr::{NonNull, null_mut};

use tracing::warn;

use crate::{error::AllocError, size_class::PAGE_SIZE};

/// Maps `pages` fresh, zero-filled, anonymous pages.
///
/// Mappings are never returned to the OS; they live until process exit.
/// Called under the page-cache lock, so it does not log.
pub(crate) fn map_pages(pages: usize) -> Result<NonNull<u8>, AllocError> {
  let size = pages
    .checked_mul(PAGE_SIZE)
    .ok_or(AllocError::MapFailed { pages })?;

  let ptr = unsafe {
    libc::mmap(
      null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    return Err(AllocError::MapFailed { pages });
  }
  NonNull::new(ptr as *mut u8).ok_or(AllocError::MapFailed { pages })
}

/// Large-object bypass: memory straight from the system allocator.
pub(crate) fn system_alloc(size: usize) -> Result<NonNull<u8>, AllocError> {
  let ptr = unsafe { libc::malloc(size) } as *mut u8;
  NonNull::new(ptr).ok_or_else(|| {
    warn!(size, "system allocator exhausted");
    AllocError::SystemExhausted { size }
  })
}

/// Releases memory obtained from `system_alloc` or `system_alloc_aligned`.
///
/// # Safety
/// `ptr` must come from one of those functions and not be freed twice.
pub(crate) unsafe fn system_free(ptr: NonNull<u8>) {
  unsafe { libc::free(ptr.as_ptr().cast()) };
}

/// System allocation with alignment above what the pool guarantees.
pub(crate) fn system_alloc_aligned(size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
  let align = align.max(core::mem::size_of::<*mut u8>());
  let mut out: *mut libc::c_void = null_mut();
  let rc = unsafe { libc::posix_memalign(&mut out, align, size.max(1)) };
  if rc != 0 {
    warn!(size, align, rc, "posix_memalign failed");
    return Err(AllocError::SystemExhausted { size });
  }
  NonNull::new(out as *mut u8).ok_or(AllocError::SystemExhausted { size })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn mapped_pages_are_zeroed_and_page_aligned() {
    let base = map_pages(2).unwrap();
    assert_eq!(base.as_ptr() as usize % PAGE_SIZE, 0);
    let bytes = unsafe { core::slice::from_raw_parts_mut(base.as_ptr(), 2 * PAGE_SIZE) };
    assert!(bytes.iter().all(|&b| b == 0));
    bytes[2 * PAGE_SIZE - 1] = 0xAB;
  }

  #[test]
  fn aligned_system_allocation() {
    let ptr = system_alloc_aligned(100, 256).unwrap();
    assert_eq!(ptr.as_ptr() as usize % 256, 0);
    unsafe { system_free(ptr) };
  }
}
