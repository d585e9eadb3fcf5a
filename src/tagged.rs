//! Size-free allocation API.
//!
//! Every allocation is preceded by a 16-byte `Header` recording its size class
//! (or the LARGE flag), the distance from the underlying block to the header,
//! and the requested byte count. `free` needs nothing but the pointer.
//!
//! ```text
//!  block start        header (16-aligned)     returned pointer
//!  |<---- back ---->|<------ 16 bytes ------>|<---- count bytes ---->|
//! ```

use core::{
  mem::{align_of, size_of},
  ptr::{self, NonNull},
};

#[cfg(feature = "debug-guard")]
use tracing::warn;

use crate::{
  align_up,
  error::AllocError,
  platform,
  size_class::{ALIGNMENT, FREE_LIST_SIZE, MAX_BYTES, class_to_size, size_to_class},
  thread_cache::with_thread_cache,
};

/// Laid out so that the free-list link written over a freed block's first
/// word lands on `user_size`, leaving the stamp readable.
#[repr(C, align(16))]
struct Header {
  /// Requested byte count. Only consulted for LARGE allocations.
  user_size: u64,
  size_class: u16,
  /// Bytes between the underlying block and this header.
  back: u8,
  flags: u8,
  /// `MAGIC` while live under `debug-guard`; unused otherwise.
  #[cfg_attr(not(feature = "debug-guard"), allow(dead_code))]
  stamp: u32,
}

pub(crate) const HEADER_SIZE: usize = size_of::<Header>();
pub(crate) const HEADER_ALIGN: usize = align_of::<Header>();

/// Block came from the system allocator, not from a size class.
const FLAG_LARGE: u8 = 1;

/// Extra bytes so a 16-aligned header always fits in a pooled block.
const POOL_SLACK: usize = HEADER_ALIGN.saturating_sub(ALIGNMENT);
/// Extra bytes so a 16-aligned header always fits in a system block.
const SYSTEM_SLACK: usize = HEADER_ALIGN - 1;

#[cfg(feature = "debug-guard")]
const MAGIC: u32 = 0x00C0_FFEE;
#[cfg(not(feature = "debug-guard"))]
const MAGIC: u32 = 0;

const _: () = assert!(HEADER_SIZE == 16);
const _: () = assert!(HEADER_ALIGN.is_power_of_two());
const _: () = assert!(FREE_LIST_SIZE - 1 <= u16::MAX as usize);
const _: () = assert!(HEADER_ALIGN <= u8::MAX as usize);

enum Origin {
  Pool { class: usize },
  System,
}

/// Allocates `count` bytes behind a header; `zero_fill` clears them.
///
/// Negative counts are rejected. The result is 16-byte aligned and is
/// released with `free`.
pub fn allocate(count: isize, zero_fill: bool) -> Result<NonNull<u8>, AllocError> {
  let user_size = usize::try_from(count).map_err(|_| AllocError::NegativeCount(count))?;
  allocate_bytes(user_size, zero_fill)
}

pub(crate) fn allocate_bytes(user_size: usize, zero_fill: bool) -> Result<NonNull<u8>, AllocError> {
  let total = HEADER_SIZE
    .checked_add(user_size)
    .and_then(|n| n.checked_add(POOL_SLACK))
    .ok_or(AllocError::SizeOverflow { size: user_size })?;

  let (raw, origin) = if total > MAX_BYTES {
    (system_block(total)?, Origin::System)
  } else {
    match with_thread_cache(|cache| cache.allocate(total)) {
      Some(block) => (
        block?,
        Origin::Pool {
          class: size_to_class(total),
        },
      ),
      // Re-entered from inside the pool, or thread teardown.
      None => (system_block(total)?, Origin::System),
    }
  };

  // SAFETY: `raw` holds at least `total` bytes plus the slack for its origin.
  Ok(unsafe { place_header(raw, origin, user_size, zero_fill) })
}

fn system_block(total: usize) -> Result<NonNull<u8>, AllocError> {
  let size = total
    .checked_add(SYSTEM_SLACK)
    .ok_or(AllocError::SizeOverflow { size: total })?;
  platform::system_alloc(size)
}

unsafe fn place_header(
  raw: NonNull<u8>,
  origin: Origin,
  user_size: usize,
  zero_fill: bool,
) -> NonNull<u8> {
  let start = raw.as_ptr() as usize;
  let back = align_up(start, HEADER_ALIGN) - start;
  let (size_class, flags) = match origin {
    Origin::Pool { class } => (class as u16, 0),
    Origin::System => (0, FLAG_LARGE),
  };

  unsafe {
    let header = raw.as_ptr().add(back).cast::<Header>();
    header.write(Header {
      user_size: user_size as u64,
      size_class,
      back: back as u8,
      flags,
      stamp: MAGIC,
    });
    let user = header.add(1).cast::<u8>();
    if zero_fill {
      ptr::write_bytes(user, 0, user_size);
    }
    NonNull::new_unchecked(user)
  }
}

/// Header of `user` and the start of the block it was placed in.
///
/// # Safety
/// `user` must have been returned by `place_header`.
unsafe fn locate(user: NonNull<u8>) -> (*mut Header, NonNull<u8>) {
  unsafe {
    let header = user.as_ptr().cast::<Header>().sub(1);
    let back = (*header).back as usize;
    (header, NonNull::new_unchecked(header.cast::<u8>().sub(back)))
  }
}

/// Releases memory from `allocate`. Null is a no-op.
///
/// # Safety
/// `ptr` must be null or come from `allocate` and not have been freed; its
/// header must be intact. Under `debug-guard`, pointers whose header stamp
/// does not match are logged and ignored instead.
pub unsafe fn free(ptr: *mut u8) {
  let Some(user) = NonNull::new(ptr) else {
    return;
  };

  unsafe {
    let (header, raw) = locate(user);

    #[cfg(feature = "debug-guard")]
    {
      if (*header).stamp != MAGIC {
        warn!(addr = ptr as usize, "discarding free of unknown or already freed pointer");
        return;
      }
      (*header).stamp = 0;
    }

    let Header { size_class, flags, .. } = header.read();

    if flags & FLAG_LARGE != 0 {
      platform::system_free(raw);
    } else {
      crate::deallocate(raw, class_to_size(size_class as usize));
    }
  }
}

/// Bytes usable behind `ptr` (at least what was requested). Zero for null.
///
/// # Safety
/// Same requirements as `free`, without consuming the allocation.
pub unsafe fn usable_size(ptr: *mut u8) -> usize {
  if ptr.is_null() {
    return 0;
  }
  let header = unsafe { ptr.cast::<Header>().sub(1).read() };
  if header.flags & FLAG_LARGE != 0 {
    header.user_size as usize
  } else {
    class_to_size(header.size_class as usize) - header.back as usize - HEADER_SIZE
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn header_of(ptr: NonNull<u8>) -> Header {
    unsafe { ptr.as_ptr().cast::<Header>().sub(1).read() }
  }

  #[test]
  fn pooled_allocation_records_class() {
    let ptr = allocate(100, false).unwrap();
    assert_eq!(ptr.as_ptr() as usize % 16, 0);
    let header = header_of(ptr);
    assert_eq!(header.flags, 0);
    assert_eq!(header.size_class as usize, size_to_class(HEADER_SIZE + 100));
    assert!(unsafe { usable_size(ptr.as_ptr()) } >= 100);
    unsafe { free(ptr.as_ptr()) };
  }

  #[test]
  fn misaligned_block_shifts_header() {
    let total = HEADER_SIZE + 64;
    let base = system_block(total + 8).unwrap();
    let raw = unsafe { NonNull::new_unchecked(base.as_ptr().add(8)) };
    assert_eq!(raw.as_ptr() as usize % HEADER_ALIGN, 8);

    let user = unsafe { place_header(raw, Origin::System, 64, true) };
    let header_addr = user.as_ptr() as usize - HEADER_SIZE;
    assert_eq!(header_addr % HEADER_ALIGN, 0);
    assert_eq!(header_addr - raw.as_ptr() as usize, 8);
    assert_eq!(header_of(user).back, 8);

    let (header, start) = unsafe { locate(user) };
    assert_eq!(header as usize, header_addr);
    assert_eq!(start, raw);
    assert!(unsafe { core::slice::from_raw_parts(user.as_ptr(), 64) }
      .iter()
      .all(|&b| b == 0));

    unsafe { platform::system_free(base) };
  }

  #[test]
  fn pooled_block_start_is_recovered() {
    for count in [0usize, 1, 15, 16, 17, 4000] {
      let total = HEADER_SIZE + count + POOL_SLACK;
      let class = size_to_class(total);
      let raw = crate::allocate(total).unwrap();

      let user = unsafe { place_header(raw, Origin::Pool { class }, count, false) };
      let header_addr = user.as_ptr() as usize - HEADER_SIZE;
      assert_eq!(header_addr % HEADER_ALIGN, 0);
      assert_eq!(
        header_of(user).back as usize,
        header_addr - raw.as_ptr() as usize
      );
      assert_eq!(unsafe { locate(user) }.1, raw);
      assert_eq!(header_of(user).size_class as usize, class);

      // `free` hands the recovered block back to the pool, so the next
      // request of the same class gets it again.
      unsafe { free(user.as_ptr()) };
      let again = crate::allocate(total).unwrap();
      assert_eq!(again, raw);
      unsafe { crate::deallocate(again, total) };
    }
  }

  #[test]
  fn large_allocation_is_flagged() {
    let count = MAX_BYTES as isize;
    let ptr = allocate(count, true).unwrap();
    let header = header_of(ptr);
    assert_eq!(header.flags & FLAG_LARGE, FLAG_LARGE);
    assert_eq!(header.user_size, MAX_BYTES as u64);
    let bytes = unsafe { core::slice::from_raw_parts_mut(ptr.as_ptr(), MAX_BYTES) };
    assert!(bytes.iter().all(|&b| b == 0));
    bytes[MAX_BYTES - 1] = 1;
    assert_eq!(unsafe { usable_size(ptr.as_ptr()) }, MAX_BYTES);
    unsafe { free(ptr.as_ptr()) };
  }

  #[test]
  fn largest_pooled_request() {
    let count = (MAX_BYTES - HEADER_SIZE) as isize;
    let ptr = allocate(count, false).unwrap();
    let header = header_of(ptr);
    assert_eq!(header.flags, 0);
    assert_eq!(header.size_class as usize, FREE_LIST_SIZE - 1);
    unsafe { free(ptr.as_ptr()) };
  }

  #[test]
  fn zero_fill_clears_recycled_block() {
    let dirty = allocate(64, false).unwrap();
    unsafe { ptr::write_bytes(dirty.as_ptr(), 0xAA, 64) };
    unsafe { free(dirty.as_ptr()) };

    let clean = allocate(64, true).unwrap();
    let bytes = unsafe { core::slice::from_raw_parts(clean.as_ptr(), 64) };
    assert!(bytes.iter().all(|&b| b == 0));
    unsafe { free(clean.as_ptr()) };
  }

  #[test]
  fn negative_count_rejected() {
    assert_eq!(allocate(-1, false), Err(AllocError::NegativeCount(-1)));
  }

  #[test]
  fn null_free_is_noop() {
    unsafe { free(ptr::null_mut()) };
    assert_eq!(unsafe { usable_size(ptr::null_mut()) }, 0);
  }

  #[cfg(feature = "debug-guard")]
  #[test]
  fn double_free_is_discarded() {
    let ptr = allocate(32, false).unwrap();
    unsafe { free(ptr.as_ptr()) };
    assert_eq!(header_of(ptr).stamp, 0);
    unsafe { free(ptr.as_ptr()) };
    let a = allocate(32, false).unwrap();
    let b = allocate(32, false).unwrap();
    assert_ne!(a, b);
    unsafe {
      free(a.as_ptr());
      free(b.as_ptr());
    }
  }
}
