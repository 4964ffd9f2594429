//! Span-level free-object management for a size-class allocator.
//!
//! A span is a run of pages carved into equal-size objects. Its free objects
//! are tracked with 16-bit relative indices: a tiny cache in the span header
//! plus a chain of free "host" objects that store further indices inside their
//! own unused bytes. See [`span`] for the layout.
//!
//! Nothing here locks. Callers serialize access to a span (and to the sampled
//! span registry) with whatever lock already guards the page layer.

/// Invariant check. Panics in debug builds and with `debug-tripwire`,
/// compiled out otherwise.
macro_rules! check {
  ($($arg:tt)*) => {
    if cfg!(any(debug_assertions, feature = "debug-tripwire")) {
      assert!($($arg)*);
    }
  };
}

pub mod pagemap;
pub mod pages;
pub mod size_map;
pub mod span;
pub mod span_list;
pub mod stack_trace;
pub mod stats_counter;

pub use pagemap::{FlatPageMap, PageMap};
pub use pages::{Length, PageId};
#[cfg(unix)]
pub use pages::PageRegion;
pub use span::{CACHE_SIZE, LIST_END, Location, ObjIdx, Span};
pub use span_list::{SampledObjects, SpanArena, SpanId, SpanList};
pub use stack_trace::{MAX_STACK_DEPTH, StackTrace, allocated_bytes};
pub use stats_counter::StatsCounter;

// =============================================================================
// Constants
// =============================================================================

#[cfg(feature = "pages-256k")]
pub const PAGE_SHIFT: usize = 18;
#[cfg(all(feature = "pages-32k", not(feature = "pages-256k")))]
pub const PAGE_SHIFT: usize = 15;
#[cfg(not(any(feature = "pages-32k", feature = "pages-256k")))]
pub const PAGE_SHIFT: usize = 13;

pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Minimum object alignment, and the index step for small objects.
pub const ALIGNMENT_SHIFT: usize = 3;
pub const ALIGNMENT: usize = 1 << ALIGNMENT_SHIFT;

/// Largest object size whose spans are a single page.
pub const MULTI_PAGE_SIZE: usize = 256;

/// Index step for objects above `MULTI_PAGE_SIZE`.
pub const MULTI_PAGE_ALIGNMENT_SHIFT: usize = 6;
pub const MULTI_PAGE_ALIGNMENT: usize = 1 << MULTI_PAGE_ALIGNMENT_SHIFT;

// =============================================================================
// Compile-Time Assertions
// =============================================================================

const _: () = assert!(PAGE_SIZE.is_power_of_two());
const _: () = assert!(PAGE_SIZE >= MULTI_PAGE_SIZE);
const _: () = assert!(MULTI_PAGE_SIZE % MULTI_PAGE_ALIGNMENT == 0);
// Every small-object offset in a page must index below LIST_END.
const _: () = assert!(PAGE_SIZE / ALIGNMENT < LIST_END as usize);

// =============================================================================
// Utils
// =============================================================================

/// Rounds `x` up to the next multiple of alignment `align`. Alignment must be a power of 2.
#[inline(always)]
pub(crate) const fn align_up(x: usize, align: usize) -> usize {
  let mask = align - 1;
  (x + mask) & !mask
}
