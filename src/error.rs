use thiserror::Error;

/// Failure of an allocation request at any tier.
///
/// All variants are `Copy` and carry only integers so that building one never
/// allocates.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
  /// The operating system refused an anonymous mapping.
  #[error("operating system refused to map {pages} pages")]
  MapFailed { pages: usize },

  /// The system allocator returned null on the bypass path.
  #[error("system allocator returned null for {size} bytes")]
  SystemExhausted { size: usize },

  #[error("span request for zero pages")]
  ZeroPages,

  #[error("negative allocation count {0}")]
  NegativeCount(isize),

  /// Header-inclusive size does not fit in `usize`.
  #[error("allocation of {size} bytes overflows with header")]
  SizeOverflow { size: usize },

  /// The central cache handed back an empty chain.
  #[error("central cache produced no block for class {class}")]
  EmptyRefill { class: usize },
}
