//! Page-granular span allocator.
//!
//! Owns every page mapped from the OS. Spans are tracked in two indexes under
//! one lock:
//! - `spans`: base address -> span, for every span ever created (free or not).
//!   Ordered, so the address predecessor of a span is one range lookup away.
//! - `free`: page count -> base of the first free span of that size. Free spans
//!   of equal size form a singly-linked list through `Span::next`.
//!
//! A span is free exactly when it is reachable from its `free` bucket.

use core::{
  ptr::NonNull,
  sync::atomic::{AtomicUsize, Ordering},
};
use std::collections::BTreeMap;

use parking_lot::{Mutex, const_mutex};
use tracing::{debug, trace, warn};

use crate::{error::AllocError, platform, size_class::PAGE_SIZE};

#[derive(Debug, Clone, Copy)]
struct Span {
  base: usize,
  pages: usize,
  /// Next free span with the same page count. Meaningless while in use.
  next: Option<usize>,
}

impl Span {
  #[inline]
  fn end(&self) -> usize {
    self.base + self.pages * PAGE_SIZE
  }
}

struct SpanMaps {
  free: BTreeMap<usize, usize>,
  spans: BTreeMap<usize, Span>,
}

impl SpanMaps {
  const fn new() -> Self {
    Self {
      free: BTreeMap::new(),
      spans: BTreeMap::new(),
    }
  }

  /// Registers `span` (new or existing) and links it at the head of its bucket.
  fn push_free(&mut self, mut span: Span) {
    span.next = self.free.insert(span.pages, span.base);
    self.spans.insert(span.base, span);
  }

  /// Takes the smallest free span with at least `pages` pages, splitting off
  /// any surplus as a new free span. Returns the base of the taken span.
  fn take_free(&mut self, pages: usize) -> Option<usize> {
    let (&bucket, &head) = self.free.range(pages..).next()?;
    let span = self.spans.get_mut(&head)?;
    let next = span.next.take();
    let available = span.pages;
    span.pages = pages;

    match next {
      Some(next) => self.free.insert(bucket, next),
      None => self.free.remove(&bucket),
    };

    if available > pages {
      self.push_free(Span {
        base: head + pages * PAGE_SIZE,
        pages: available - pages,
        next: None,
      });
    }
    Some(head)
  }

  /// Unlinks the span at `base` from its free bucket.
  ///
  /// Returns false when the span is in use (not in any bucket). Linear in the
  /// bucket's length.
  fn unlink_free(&mut self, base: usize) -> bool {
    let Some(&Span { pages, next, .. }) = self.spans.get(&base) else {
      return false;
    };
    let Some(&head) = self.free.get(&pages) else {
      return false;
    };

    if head == base {
      match next {
        Some(next) => self.free.insert(pages, next),
        None => self.free.remove(&pages),
      };
      self.clear_next(base);
      return true;
    }

    let mut cursor = head;
    loop {
      let Some(after) = self.spans.get(&cursor).and_then(|s| s.next) else {
        return false;
      };
      if after == base {
        if let Some(prev) = self.spans.get_mut(&cursor) {
          prev.next = next;
        }
        self.clear_next(base);
        return true;
      }
      cursor = after;
    }
  }

  fn clear_next(&mut self, base: usize) {
    if let Some(span) = self.spans.get_mut(&base) {
      span.next = None;
    }
  }

  /// Merges the in-use span at `base` with any free address neighbors, then
  /// links the survivor into the free index. Returns the survivor and the
  /// number of merges.
  fn release(&mut self, mut base: usize) -> Option<(Span, usize)> {
    let mut merges = 0usize;
    loop {
      let &span = self.spans.get(&base)?;
      let mut merged = false;

      // span | successor -> span
      let successor = span.end();
      if self.spans.contains_key(&successor) && self.unlink_free(successor) {
        if let Some(absorbed) = self.spans.remove(&successor)
          && let Some(survivor) = self.spans.get_mut(&base)
        {
          survivor.pages += absorbed.pages;
          merged = true;
        }
      }

      // predecessor | span -> predecessor
      let predecessor = self
        .spans
        .range(..base)
        .next_back()
        .map(|(&prev_base, prev)| (prev_base, prev.end()));
      if let Some((prev_base, prev_end)) = predecessor
        && prev_end == base
        && self.unlink_free(prev_base)
      {
        if let Some(absorbed) = self.spans.remove(&base)
          && let Some(survivor) = self.spans.get_mut(&prev_base)
        {
          survivor.pages += absorbed.pages;
          base = prev_base;
          merged = true;
        }
      }

      if !merged {
        break;
      }
      merges += 1;
    }

    let &span = self.spans.get(&base)?;
    self.push_free(span);
    Some((span, merges))
  }
}

/// A span handed out by the page cache.
pub(crate) struct Grant {
  pub(crate) base: NonNull<u8>,
  /// Freshly mapped from the OS rather than reused.
  pub(crate) fresh: bool,
}

/// Logs the outcome of `PageCache::grant_span`.
///
/// Must run with no pool lock held: a subscriber may allocate or free through
/// the pool while handling the event.
pub(crate) fn log_grant(pages: usize, grant: &Result<Grant, AllocError>) {
  match grant {
    Ok(Grant { base, fresh: true }) => {
      trace!(pages, addr = base.as_ptr() as usize, "mapped pages from os")
    }
    Ok(_) => {}
    Err(err) => warn!(pages, %err, "page cache could not supply span"),
  }
}

/// Snapshot of page-cache bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageStats {
  /// Successful OS mapping requests.
  pub os_mappings: usize,
  /// Pages obtained from the OS in total.
  pub mapped_pages: usize,
  /// Spans currently tracked (free or in use).
  pub spans: usize,
  pub free_spans: usize,
  pub free_pages: usize,
}

/// Span allocator backed by anonymous OS mappings.
pub struct PageCache {
  maps: Mutex<SpanMaps>,
  os_mappings: AtomicUsize,
  mapped_pages: AtomicUsize,
}

impl PageCache {
  pub const fn new() -> Self {
    Self {
      maps: const_mutex(SpanMaps::new()),
      os_mappings: AtomicUsize::new(0),
      mapped_pages: AtomicUsize::new(0),
    }
  }

  /// Returns the base of `pages` contiguous, page-aligned pages.
  ///
  /// Reuses the smallest free span that fits, splitting off the remainder;
  /// otherwise maps exactly `pages` fresh pages.
  pub fn allocate_span(&self, pages: usize) -> Result<NonNull<u8>, AllocError> {
    let grant = self.grant_span(pages);
    log_grant(pages, &grant);
    grant.map(|grant| grant.base)
  }

  /// `allocate_span` without logging, for callers that hold a lock of their
  /// own. They report the grant with `log_grant` once it is released.
  pub(crate) fn grant_span(&self, pages: usize) -> Result<Grant, AllocError> {
    if pages == 0 {
      return Err(AllocError::ZeroPages);
    }
    let mut maps = self.maps.lock();

    if let Some(base) = maps.take_free(pages)
      && let Some(base) = NonNull::new(base as *mut u8)
    {
      return Ok(Grant { base, fresh: false });
    }

    let ptr = platform::map_pages(pages)?;
    maps.spans.insert(
      ptr.as_ptr() as usize,
      Span {
        base: ptr.as_ptr() as usize,
        pages,
        next: None,
      },
    );
    self.os_mappings.fetch_add(1, Ordering::Relaxed);
    self.mapped_pages.fetch_add(pages, Ordering::Relaxed);
    Ok(Grant {
      base: ptr,
      fresh: true,
    })
  }

  /// Returns the span based at `ptr` to the free index, coalescing with free
  /// neighbors on both sides until no merge is possible.
  ///
  /// The recorded extent of the span is authoritative; `pages` is the caller's
  /// view of it. Addresses this cache never handed out are ignored.
  pub fn deallocate_span(&self, ptr: NonNull<u8>, pages: usize) {
    let base = ptr.as_ptr() as usize;
    let released = {
      let mut maps = self.maps.lock();
      match maps.spans.get(&base) {
        None => return,
        Some(span) => debug_assert_eq!(span.pages, pages, "span size mismatch at {base:#x}"),
      }
      maps.release(base)
    };
    if let Some((span, merges)) = released
      && merges > 0
    {
      debug!(base = span.base, pages = span.pages, merges, "coalesced free span");
    }
  }

  /// Drops all span bookkeeping. Mapped pages stay mapped until process exit.
  pub fn shutdown(&self) {
    let spans = {
      let mut maps = self.maps.lock();
      let spans = maps.spans.len();
      maps.spans.clear();
      maps.free.clear();
      spans
    };
    debug!(spans, "page cache shutdown");
  }

  pub fn stats(&self) -> PageStats {
    let maps = self.maps.lock();
    let mut free_spans = 0;
    let mut free_pages = 0;
    for (&pages, &head) in &maps.free {
      let mut cursor = Some(head);
      while let Some(base) = cursor {
        free_spans += 1;
        free_pages += pages;
        cursor = maps.spans.get(&base).and_then(|s| s.next);
      }
    }
    PageStats {
      os_mappings: self.os_mappings.load(Ordering::Relaxed),
      mapped_pages: self.mapped_pages.load(Ordering::Relaxed),
      spans: maps.spans.len(),
      free_spans,
      free_pages,
    }
  }
}

impl Default for PageCache {
  fn default() -> Self {
    Self::new()
  }
}
