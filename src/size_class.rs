//! Linear size classes: one class per `ALIGNMENT` multiple up to `MAX_BYTES`.
//!
//! Everything here is a `const fn` over integers. No state, no locking.

// =============================================================================
// Constants
// =============================================================================

/// Granularity of every pooled block, and the minimum alignment handed out.
pub const ALIGNMENT: usize = 16;

/// Largest request served by the pool. Anything above goes to the system allocator.
pub const MAX_BYTES: usize = 256 * 1024;

/// Number of size classes (and free lists per tier).
pub const FREE_LIST_SIZE: usize = MAX_BYTES / ALIGNMENT;

/// Page granularity of the page cache.
pub const PAGE_SIZE: usize = 4096;

/// Default span requested by the central cache on refill.
pub const SPAN_PAGES: usize = 8;

/// Per-class byte budget a thread cache may hold before returning blocks.
const THREAD_BUDGET_BYTES: usize = 64 * 1024;
const THREAD_MIN_BLOCKS: usize = 8;
const THREAD_MAX_BLOCKS: usize = 384;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(ALIGNMENT.is_power_of_two());
const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(MAX_BYTES % ALIGNMENT == 0);
const _: () = assert!(ALIGNMENT >= core::mem::size_of::<*mut u8>());
const _: () = assert!(PAGE_SIZE % ALIGNMENT == 0);
const _: () = assert!(class_to_size(FREE_LIST_SIZE - 1) == MAX_BYTES);

// =============================================================================
// Mapping
// =============================================================================

/// Rounds `bytes` up to the next multiple of `ALIGNMENT`.
#[inline(always)]
pub const fn round_up(bytes: usize) -> usize {
  crate::align_up(bytes, ALIGNMENT)
}

/// Class index for a request of `bytes`. Requests below `ALIGNMENT` share class 0.
///
/// Only meaningful for `bytes <= MAX_BYTES`; callers filter large requests first.
#[inline(always)]
pub const fn size_to_class(bytes: usize) -> usize {
  let bytes = if bytes < ALIGNMENT { ALIGNMENT } else { bytes };
  round_up(bytes) / ALIGNMENT - 1
}

/// Block size of `class` (inverse of `size_to_class` on rounded sizes).
#[inline(always)]
pub const fn class_to_size(class: usize) -> usize {
  (class + 1) * ALIGNMENT
}

/// Blocks moved per thread-cache refill, targeting about 4KB per batch.
#[inline]
pub const fn batch_size(block_size: usize) -> usize {
  match block_size {
    0..=32 => 128,
    33..=64 => 64,
    65..=128 => 32,
    129..=256 => 16,
    257..=512 => 8,
    513..=1024 => 4,
    _ => 2,
  }
}

/// Number of cached blocks above which a thread cache gives blocks back.
#[inline]
pub const fn return_threshold(block_size: usize) -> usize {
  let blocks = THREAD_BUDGET_BYTES / block_size;
  if blocks < THREAD_MIN_BLOCKS {
    THREAD_MIN_BLOCKS
  } else if blocks > THREAD_MAX_BLOCKS {
    THREAD_MAX_BLOCKS
  } else {
    blocks
  }
}

/// Pages requested from the page cache to refill a class of `block_size`.
///
/// Blocks that fit in a default span get exactly `SPAN_PAGES`; bigger ones get
/// just enough pages for a single block.
#[inline]
pub const fn span_pages(block_size: usize) -> usize {
  if block_size <= SPAN_PAGES * PAGE_SIZE {
    SPAN_PAGES
  } else {
    block_size.div_ceil(PAGE_SIZE)
  }
}
