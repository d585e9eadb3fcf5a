//! Shared per-class free lists.
//!
//! One spin-locked list per size class; threads touching different classes
//! never contend. An empty class is refilled by slicing a span from the page
//! cache while the class lock is held. The page cache never calls back here,
//! so the nesting is acyclic. Nothing is logged while a class lock is held.

use core::sync::atomic::{AtomicUsize, Ordering};

use tracing::trace;

use crate::{
  error::AllocError,
  free_list::FreeList,
  page_cache::{PageCache, log_grant},
  size_class::{FREE_LIST_SIZE, PAGE_SIZE, class_to_size, span_pages},
  sync::SpinMutex,
};

pub struct CentralCache {
  lists: [SpinMutex<FreeList>; FREE_LIST_SIZE],
  pages: &'static PageCache,
  carved: AtomicUsize,
}

impl CentralCache {
  pub const fn new(pages: &'static PageCache) -> Self {
    Self {
      lists: [const { SpinMutex::new(FreeList::new()) }; FREE_LIST_SIZE],
      pages,
      carved: AtomicUsize::new(0),
    }
  }

  /// Hands out up to `batch` blocks of `class` as one chain.
  ///
  /// Returns fewer when the shared list is shorter, and an empty chain for an
  /// out-of-range class or a zero batch.
  pub fn fetch_range(&self, class: usize, batch: usize) -> Result<FreeList, AllocError> {
    if class >= FREE_LIST_SIZE || batch == 0 {
      return Ok(FreeList::new());
    }

    let mut list = self.lists[class].lock();
    if !list.is_empty() {
      return Ok(list.take(batch));
    }

    let block_size = class_to_size(class);
    let pages = span_pages(block_size);
    let grant = self.pages.grant_span(pages);
    let base = match &grant {
      Ok(granted) => granted.base,
      Err(err) => {
        let err = *err;
        drop(list);
        log_grant(pages, &grant);
        return Err(err);
      }
    };
    let blocks = pages * PAGE_SIZE / block_size;
    // SAFETY: the span is ours, page-aligned and `pages * PAGE_SIZE` bytes long.
    let mut fresh = unsafe { FreeList::carve(base, block_size, blocks) };
    self.carved.fetch_add(blocks, Ordering::Relaxed);

    let out = fresh.take(batch);
    list.append(fresh);
    drop(list);

    // Events go out with no lock held; the subscriber may use the pool.
    log_grant(pages, &grant);
    trace!(class, pages, blocks, "refilled class from page cache");
    Ok(out)
  }

  /// Splices a chain of blocks of `class` onto the front of the shared list.
  ///
  /// # Safety
  /// Every block in `chain` must belong to `class` and be owned by the caller.
  pub unsafe fn return_range(&self, chain: FreeList, class: usize) {
    if chain.is_empty() || class >= FREE_LIST_SIZE {
      return;
    }
    self.lists[class].lock().append(chain);
  }

  /// Blocks currently parked in the shared list of `class`.
  pub fn free_blocks(&self, class: usize) -> usize {
    self.lists.get(class).map_or(0, |list| list.lock().len())
  }

  /// Blocks sliced out of spans since creation, across all classes.
  pub fn blocks_carved(&self) -> usize {
    self.carved.load(Ordering::Relaxed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::size_class::{MAX_BYTES, SPAN_PAGES, size_to_class};

  fn isolated() -> &'static CentralCache {
    let pages: &'static PageCache = Box::leak(Box::new(PageCache::new()));
    Box::leak(Box::new(CentralCache::new(pages)))
  }

  fn drain(mut chain: FreeList) -> Vec<usize> {
    let mut out = Vec::new();
    while let Some(block) = chain.pop() {
      out.push(block.as_ptr() as usize);
    }
    out
  }

  #[test]
  fn refill_slices_default_span() {
    let central = isolated();
    let class = size_to_class(64);
    let chain = central.fetch_range(class, 10).unwrap();
    assert_eq!(chain.len(), 10);

    let total = SPAN_PAGES * PAGE_SIZE / 64;
    assert_eq!(central.blocks_carved(), total);
    assert_eq!(central.free_blocks(class), total - 10);
    assert_eq!(central.pages.stats().os_mappings, 1);

    let blocks = drain(chain);
    for pair in blocks.windows(2) {
      assert_eq!(pair[1] - pair[0], 64);
    }
  }

  #[test]
  fn serves_from_shared_list_before_page_cache() {
    let central = isolated();
    let class = size_to_class(128);
    let first = central.fetch_range(class, 4).unwrap();
    let second = central.fetch_range(class, 4).unwrap();
    assert_eq!(second.len(), 4);
    assert_eq!(central.pages.stats().os_mappings, 1);

    let a = drain(first);
    let b = drain(second);
    assert!(a.iter().all(|x| !b.contains(x)));
  }

  #[test]
  fn short_list_returns_fewer() {
    let central = isolated();
    let class = size_to_class(16 * 1024);
    // 8 pages hold two 16 KiB blocks.
    let first = central.fetch_range(class, 1).unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(central.free_blocks(class), 1);
    let second = central.fetch_range(class, 2).unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(central.free_blocks(class), 0);
  }

  #[test]
  fn largest_class_gets_exact_span() {
    let central = isolated();
    let class = size_to_class(MAX_BYTES);
    let chain = central.fetch_range(class, 2).unwrap();
    assert_eq!(chain.len(), 1);
    let stats = central.pages.stats();
    assert_eq!(stats.mapped_pages, MAX_BYTES / PAGE_SIZE);
    assert_eq!(central.free_blocks(class), 0);
  }

  #[test]
  fn invalid_requests_return_nothing() {
    let central = isolated();
    assert!(central.fetch_range(FREE_LIST_SIZE, 4).unwrap().is_empty());
    assert!(central.fetch_range(0, 0).unwrap().is_empty());
    assert_eq!(central.pages.stats().os_mappings, 0);
  }

  #[test]
  fn returned_blocks_are_served_first() {
    let central = isolated();
    let class = size_to_class(48);
    let mut chain = central.fetch_range(class, 3).unwrap();
    let first = chain.pop().unwrap();
    let before = central.free_blocks(class);

    unsafe { central.return_range(chain, class) };
    assert_eq!(central.free_blocks(class), before + 2);

    let mut again = central.fetch_range(class, 1).unwrap();
    let reused = again.pop().unwrap();
    assert_ne!(reused, first);
    assert_eq!(reused.as_ptr() as usize, first.as_ptr() as usize + 48);
  }
}
