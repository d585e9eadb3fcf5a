//! Free lists stored inside the free blocks themselves.
//!
//! While a block is free its first word holds the address of the next free
//! block of the same class. The word is only read through `FreeBlock` and only
//! while the block sits in a `FreeList`; callers never see this encoding.

use core::ptr::{NonNull, null_mut};

#[repr(C)]
pub(crate) struct FreeBlock {
  next: *mut FreeBlock,
}

/// Singly-linked chain of free blocks with its length.
///
/// Also used as the unit of batch transfer between tiers.
pub struct FreeList {
  head: *mut FreeBlock,
  len: usize,
}

// SAFETY: a list owns the blocks it links; moving it moves that ownership.
unsafe impl Send for FreeList {}

impl FreeList {
  pub const fn new() -> Self {
    Self {
      head: null_mut(),
      len: 0,
    }
  }

  #[inline]
  pub fn len(&self) -> usize {
    self.len
  }

  #[inline]
  pub fn is_empty(&self) -> bool {
    self.head.is_null()
  }

  /// Links `count` consecutive blocks of `block_size` bytes starting at `base`.
  ///
  /// # Safety
  /// `base` must point to at least `count * block_size` writable bytes, aligned
  /// for a pointer, and `block_size` must be a multiple of pointer alignment.
  pub(crate) unsafe fn carve(base: NonNull<u8>, block_size: usize, count: usize) -> Self {
    if count == 0 {
      return Self::new();
    }
    let start = base.as_ptr();
    for i in 0..count - 1 {
      unsafe {
        let block = start.add(i * block_size) as *mut FreeBlock;
        (*block).next = start.add((i + 1) * block_size) as *mut FreeBlock;
      }
    }
    unsafe { (*(start.add((count - 1) * block_size) as *mut FreeBlock)).next = null_mut() };
    Self {
      head: start as *mut FreeBlock,
      len: count,
    }
  }

  /// Pushes a block onto the front.
  ///
  /// # Safety
  /// `block` must be at least pointer-sized, pointer-aligned, unused by anyone
  /// else, and not already in any list.
  #[inline]
  pub(crate) unsafe fn push(&mut self, block: NonNull<u8>) {
    let block = block.as_ptr() as *mut FreeBlock;
    unsafe { (*block).next = self.head };
    self.head = block;
    self.len += 1;
  }

  #[inline]
  pub fn pop(&mut self) -> Option<NonNull<u8>> {
    let block = NonNull::new(self.head)?;
    // SAFETY: every linked node is a live free block owned by this list.
    self.head = unsafe { (*block.as_ptr()).next };
    self.len -= 1;
    Some(block.cast())
  }

  /// Keeps the first `at` blocks and returns the rest as a new list.
  pub(crate) fn split_off(&mut self, at: usize) -> FreeList {
    if at == 0 {
      return core::mem::replace(self, FreeList::new());
    }
    let mut tail = self.head;
    let mut kept = 1;
    // SAFETY: walks only linked nodes.
    unsafe {
      while kept < at && !tail.is_null() && !(*tail).next.is_null() {
        tail = (*tail).next;
        kept += 1;
      }
      if tail.is_null() {
        return FreeList::new();
      }
      let rest = (*tail).next;
      (*tail).next = null_mut();
      let rest_len = self.len.saturating_sub(kept);
      self.len = kept;
      FreeList {
        head: rest,
        len: if rest.is_null() { 0 } else { rest_len },
      }
    }
  }

  /// Removes up to `n` blocks from the front and returns them.
  pub(crate) fn take(&mut self, n: usize) -> FreeList {
    let rest = self.split_off(n);
    core::mem::replace(self, rest)
  }

  /// Splices `chain` onto the front of this list.
  ///
  /// Walks at most `chain.len()` links to find the chain's tail; the length is
  /// recounted along the way.
  pub(crate) fn append(&mut self, chain: FreeList) {
    if chain.is_empty() {
      return;
    }
    let mut tail = chain.head;
    let mut count = 1;
    // SAFETY: walks only linked nodes of `chain`, which we now own.
    unsafe {
      while count < chain.len && !(*tail).next.is_null() {
        tail = (*tail).next;
        count += 1;
      }
      (*tail).next = self.head;
    }
    self.head = chain.head;
    self.len += count;
  }
}

impl Default for FreeList {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const BLOCK: usize = 32;

  fn arena(blocks: usize) -> Vec<u64> {
    vec![0u64; blocks * BLOCK / 8]
  }

  fn carve(buf: &mut [u64], count: usize) -> FreeList {
    let base = NonNull::new(buf.as_mut_ptr() as *mut u8).unwrap();
    unsafe { FreeList::carve(base, BLOCK, count) }
  }

  fn addresses(list: &mut FreeList) -> Vec<usize> {
    let mut out = Vec::new();
    while let Some(block) = list.pop() {
      out.push(block.as_ptr() as usize);
    }
    out
  }

  #[test]
  fn carve_links_in_address_order() {
    let mut buf = arena(4);
    let base = buf.as_ptr() as usize;
    let mut list = carve(&mut buf, 4);
    assert_eq!(list.len(), 4);
    assert_eq!(
      addresses(&mut list),
      vec![base, base + BLOCK, base + 2 * BLOCK, base + 3 * BLOCK]
    );
    assert!(list.is_empty());
  }

  #[test]
  fn take_returns_front_and_keeps_rest() {
    let mut buf = arena(5);
    let base = buf.as_ptr() as usize;
    let mut list = carve(&mut buf, 5);
    let mut front = list.take(2);
    assert_eq!(front.len(), 2);
    assert_eq!(list.len(), 3);
    assert_eq!(addresses(&mut front), vec![base, base + BLOCK]);
    assert_eq!(list.pop().unwrap().as_ptr() as usize, base + 2 * BLOCK);
  }

  #[test]
  fn take_more_than_available() {
    let mut buf = arena(3);
    let mut list = carve(&mut buf, 3);
    let all = list.take(10);
    assert_eq!(all.len(), 3);
    assert!(list.is_empty());
    assert_eq!(list.len(), 0);
  }

  #[test]
  fn split_off_keeps_front() {
    let mut buf = arena(6);
    let mut list = carve(&mut buf, 6);
    let rest = list.split_off(1);
    assert_eq!(list.len(), 1);
    assert_eq!(rest.len(), 5);
  }

  #[test]
  fn append_splices_in_front() {
    let mut buf = arena(6);
    let base = buf.as_ptr() as usize;
    let mut list = carve(&mut buf, 6);
    let chain = list.take(2);
    list.append(chain);
    assert_eq!(list.len(), 6);
    assert_eq!(addresses(&mut list).first().copied(), Some(base));
  }

  #[test]
  fn push_pop_is_lifo() {
    let mut buf = arena(2);
    let base = buf.as_mut_ptr() as *mut u8;
    let mut list = FreeList::new();
    unsafe {
      list.push(NonNull::new(base).unwrap());
      list.push(NonNull::new(base.add(BLOCK)).unwrap());
    }
    assert_eq!(list.pop().unwrap().as_ptr(), base.wrapping_add(BLOCK));
    assert_eq!(list.pop().unwrap().as_ptr(), base);
    assert!(list.pop().is_none());
  }
}
