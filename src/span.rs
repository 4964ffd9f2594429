//! Span header and its free-object bookkeeping.
//!
//! Free objects are named by `ObjIdx`: the object's offset from the span start
//! divided by a power of two (8 for objects up to `MULTI_PAGE_SIZE`, 64 above).
//! The divisors keep objects aligned on the divisor, keep every index inside 16
//! bits and keep every object start strictly below `LIST_END`.
//!
//! The free set lives in two places. A 4-entry cache sits in the header and is
//! served without touching object memory. The rest is a chain of free "host"
//! objects: slot 0 of a host links to the next host, slots `1..` hold more free
//! indices. Only the head host is partially filled (`embed_count` slots);
//! every host behind it is full.
//!
//! ```text
//!   header:  freelist   embed_count = 4   cache = [idx idx --- ---]  cache_size = 2
//!               |
//!               v
//!            [next|idx|idx|idx|idx|---|---|---]   head host (16-byte object)
//!               |
//!               v
//!            [END |idx|idx|idx|idx|idx|idx|idx]   full host
//! ```
//!
//! Object memory is handed in as a byte slice starting at the span's first
//! byte. Addresses are plain integers and are never dereferenced.

use core::mem::{offset_of, size_of};

use crate::{
  ALIGNMENT_SHIFT, MULTI_PAGE_ALIGNMENT_SHIFT, MULTI_PAGE_SIZE, PAGE_SIZE,
  pagemap::PageMap,
  pages::{Length, PageId},
  size_map,
  span_list::SpanLink,
  stack_trace::StackTrace,
};

/// Relative object index inside a span.
pub type ObjIdx = u16;

/// End of the host chain. Never a valid object index.
pub const LIST_END: ObjIdx = ObjIdx::MAX;

/// Inline cache entries in the span header.
pub const CACHE_SIZE: usize = 4;

const IDX_SIZE: usize = size_of::<ObjIdx>();

const _: () = assert!(CACHE_SIZE <= u8::MAX as usize);

/// Where the span's pages currently are.
#[repr(u8)]
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Location {
  InUse = 0,
  OnNormalFreelist = 1,
  OnReturnedFreelist = 2,
}

// =============================================================================
// Index regimes
// =============================================================================

trait Align {
  /// Single-page span; offsets come from the low address bits.
  const SMALL: bool;
  const SHIFT: usize;
}

enum Small {}
enum Large {}

impl Align for Small {
  const SMALL: bool = true;
  const SHIFT: usize = ALIGNMENT_SHIFT;
}

impl Align for Large {
  const SMALL: bool = false;
  const SHIFT: usize = MULTI_PAGE_ALIGNMENT_SHIFT;
}

#[inline(always)]
const fn is_small(size: usize) -> bool {
  size <= MULTI_PAGE_SIZE
}

/// Indices a host can carry besides its link slot.
#[inline(always)]
const fn max_embed(size: usize) -> usize {
  size / IDX_SIZE - 1
}

#[inline(always)]
fn slot_offset<A: Align>(host: ObjIdx, slot: usize) -> usize {
  ((host as usize) << A::SHIFT) + slot * IDX_SIZE
}

#[inline(always)]
fn load_slot<A: Align>(mem: &[u8], host: ObjIdx, slot: usize) -> ObjIdx {
  let at = slot_offset::<A>(host, slot);
  ObjIdx::from_ne_bytes([mem[at], mem[at + 1]])
}

#[inline(always)]
fn store_slot<A: Align>(mem: &mut [u8], host: ObjIdx, slot: usize, idx: ObjIdx) {
  let at = slot_offset::<A>(host, slot);
  mem[at..at + IDX_SIZE].copy_from_slice(&idx.to_ne_bytes());
}

// =============================================================================
// Span
// =============================================================================

/// Metadata for a run of pages holding objects of one size class.
#[repr(C)]
#[derive(Debug)]
pub struct Span {
  // === Push/pop hot path ===
  /// Free indices, top of stack at `cache_size - 1`.
  cache: [ObjIdx; CACHE_SIZE],
  cache_size: u8,
  /// Valid embedded indices in the head host.
  embed_count: u16,
  /// Head host of the chain, or `LIST_END`.
  freelist: ObjIdx,
  /// Live objects.
  allocated: u16,

  // === Everything else ===
  location: Location,
  sampled: bool,
  first_page: PageId,
  num_pages: Length,
  /// Page-weighted age of the span's free pages, merged on coalescing.
  freelist_added_time: u64,
  /// Owned while sampled, moved out on unsample.
  pub(crate) sampled_stack: Option<Box<StackTrace>>,
  /// Intrusive list pointers (sampled span registry).
  pub(crate) link: SpanLink,
}

// Push/pop touches only the first 16 bytes; the whole header fits 2 cache lines.
const SPAN_HOT_END: usize = offset_of!(Span, allocated) + size_of::<ObjIdx>();
const _: () = assert!(offset_of!(Span, cache) == 0);
const _: () = assert!(offset_of!(Span, cache_size) < SPAN_HOT_END);
const _: () = assert!(offset_of!(Span, embed_count) < SPAN_HOT_END);
const _: () = assert!(offset_of!(Span, freelist) < SPAN_HOT_END);
const _: () = assert!(SPAN_HOT_END <= 16);
const _: () = assert!(offset_of!(Span, location) >= SPAN_HOT_END);
const _: () = assert!(size_of::<Span>() <= 128);

impl Span {
  pub fn new(first_page: PageId, num_pages: Length) -> Self {
    Self {
      cache: [0; CACHE_SIZE],
      cache_size: 0,
      embed_count: 0,
      freelist: LIST_END,
      allocated: 0,
      location: Location::InUse,
      sampled: false,
      first_page,
      num_pages,
      freelist_added_time: 0,
      sampled_stack: None,
      link: SpanLink::default(),
    }
  }

  /// Resets a recycled header for a new page range.
  pub fn init(&mut self, first_page: PageId, num_pages: Length) {
    check!(
      !self.sampled && self.sampled_stack.is_none(),
      "init: span {:?} is still sampled",
      self.first_page
    );
    *self = Span::new(first_page, num_pages);
  }

  #[inline]
  pub fn first_page(&self) -> PageId {
    self.first_page
  }

  pub fn last_page(&self) -> PageId {
    self.first_page + self.num_pages - Length::new(1)
  }

  #[inline]
  pub fn num_pages(&self) -> Length {
    self.num_pages
  }

  #[inline]
  pub fn start_address(&self) -> usize {
    self.first_page.start_addr()
  }

  #[inline]
  pub fn bytes_in_span(&self) -> usize {
    self.num_pages.in_bytes()
  }

  pub fn contains(&self, addr: usize) -> bool {
    let page = PageId::containing(addr);
    self.first_page <= page && page <= self.last_page()
  }

  pub fn location(&self) -> Location {
    self.location
  }

  pub fn set_location(&mut self, location: Location) {
    self.location = location;
  }

  /// Live objects.
  #[inline]
  pub fn allocated(&self) -> usize {
    self.allocated as usize
  }

  /// No free object left to pop.
  #[inline]
  pub fn freelist_empty(&self) -> bool {
    self.cache_size == 0 && self.freelist == LIST_END
  }

  pub fn is_sampled(&self) -> bool {
    self.sampled
  }

  pub fn sampled_stack(&self) -> Option<&StackTrace> {
    self.sampled_stack.as_deref()
  }

  pub(crate) fn attach_stack(&mut self, stack: Box<StackTrace>) {
    check!(!self.sampled, "sample: span {:?} already sampled", self.first_page);
    self.sampled = true;
    self.sampled_stack = Some(stack);
  }

  pub(crate) fn detach_stack(&mut self) -> Option<Box<StackTrace>> {
    if !self.sampled {
      return None;
    }
    self.sampled = false;
    let stack = self.sampled_stack.take();
    check!(stack.is_some(), "unsample: span {:?} lost its stack", self.first_page);
    stack
  }

  pub fn freelist_added_time(&self) -> u64 {
    self.freelist_added_time
  }

  pub fn set_freelist_added_time(&mut self, time: u64) {
    self.freelist_added_time = time;
  }

  /// Merges `other`'s free-list age into this span, weighted by page count.
  pub fn average_freelist_added_time(&mut self, other: &Span) {
    // Floating point: the weighted sum can overflow u64.
    let mine = self.num_pages.raw_num() as f64;
    let theirs = other.num_pages.raw_num() as f64;
    self.freelist_added_time = ((self.freelist_added_time as f64 * mine
      + other.freelist_added_time as f64 * theirs)
      / (mine + theirs)) as u64;
  }

  /// Free object slots per live object.
  ///
  /// Free space in the span is charged evenly to the live objects pinning it,
  /// so the result counts objects, not bytes.
  pub fn fragmentation(&self, pagemap: &impl PageMap) -> f64 {
    let cl = pagemap.sizeclass(self.first_page);
    if cl == 0 {
      log::warn!("fragmentation: span {:?} has no size class", self.first_page);
      check!(cl != 0, "fragmentation: span {:?} has no size class", self.first_page);
      return 0.0;
    }

    let obj_size = size_map::class_to_size(cl);
    let span_objects = self.bytes_in_span() / obj_size;
    let live = self.allocated as usize;
    if live == 0 {
      log::warn!("fragmentation: span {:?} has no live objects", self.first_page);
      check!(live != 0, "fragmentation: span {:?} has no live objects", self.first_page);
      return 0.0;
    }

    span_objects.saturating_sub(live) as f64 / live as f64
  }

  // ===========================================================================
  // Object-index codec
  // ===========================================================================

  /// Index of the object starting at `addr`.
  #[inline]
  pub fn ptr_to_idx(&self, addr: usize, size: usize) -> ObjIdx {
    if is_small(size) {
      self.ptr_to_idx_sized::<Small>(addr)
    } else {
      self.ptr_to_idx_sized::<Large>(addr)
    }
  }

  /// Address of the object at `idx`.
  #[inline]
  pub fn idx_to_ptr(&self, idx: ObjIdx, size: usize) -> usize {
    if is_small(size) {
      self.idx_to_ptr_sized::<Small>(idx)
    } else {
      self.idx_to_ptr_sized::<Large>(idx)
    }
  }

  #[inline(always)]
  fn ptr_to_idx_sized<A: Align>(&self, addr: usize) -> ObjIdx {
    let off = if A::SMALL {
      // Small spans are one page: the low address bits are the offset, and
      // first_page (colder than cache/freelist) stays untouched.
      check!(
        PageId::containing(addr) == self.first_page,
        "ptr_to_idx: {:#x} outside span {:?}",
        addr,
        self.first_page
      );
      (addr & (PAGE_SIZE - 1)) >> A::SHIFT
    } else {
      check!(self.contains(addr), "ptr_to_idx: {:#x} outside span {:?}", addr, self.first_page);
      (addr - self.first_page.start_addr()) >> A::SHIFT
    };
    let idx = off as ObjIdx;
    check!(idx != LIST_END, "ptr_to_idx: {:#x} aliases LIST_END", addr);
    check!(idx as usize == off, "ptr_to_idx: offset {:#x} does not fit ObjIdx", off);
    idx
  }

  #[inline(always)]
  fn idx_to_ptr_sized<A: Align>(&self, idx: ObjIdx) -> usize {
    check!(idx != LIST_END, "idx_to_ptr: LIST_END is not an object");
    let addr = self.first_page.start_addr() + ((idx as usize) << A::SHIFT);
    check!(self.ptr_to_idx_sized::<A>(addr) == idx);
    addr
  }

  // ===========================================================================
  // Free list
  // ===========================================================================

  /// Pops one free object. `None` means the span is full.
  #[inline]
  pub fn freelist_pop(&mut self, mem: &[u8], size: usize) -> Option<usize> {
    if is_small(size) {
      self.freelist_pop_sized::<Small>(mem, size)
    } else {
      self.freelist_pop_sized::<Large>(mem, size)
    }
  }

  fn freelist_pop_sized<A: Align>(&mut self, mem: &[u8], size: usize) -> Option<usize> {
    let idx = if self.cache_size != 0 {
      self.cache_size -= 1;
      self.cache[self.cache_size as usize]
    } else if self.freelist != LIST_END {
      let host = self.freelist;
      if self.embed_count != 0 {
        let idx = load_slot::<A>(mem, host, self.embed_count as usize);
        self.embed_count -= 1;
        idx
      } else {
        // Host is drained: hand it out and move to the next (full) one.
        self.freelist = load_slot::<A>(mem, host, 0);
        self.embed_count = max_embed(size) as u16;
        host
      }
    } else {
      return None;
    };

    self.allocated += 1;
    Some(self.idx_to_ptr_sized::<A>(idx))
  }

  /// Pops up to `batch.len()` objects into `batch`, returning how many.
  ///
  /// Same objects, in the same order, as that many `freelist_pop` calls.
  pub fn freelist_pop_batch(&mut self, mem: &[u8], batch: &mut [usize], size: usize) -> usize {
    if is_small(size) {
      self.freelist_pop_batch_sized::<Small>(mem, batch, size)
    } else {
      self.freelist_pop_batch_sized::<Large>(mem, batch, size)
    }
  }

  fn freelist_pop_batch_sized<A: Align>(
    &mut self,
    mem: &[u8],
    batch: &mut [usize],
    size: usize,
  ) -> usize {
    let n = batch.len();
    let mut result = 0;

    // Pop from cache.
    let csize = self.cache_size as usize;
    let cache_reads = csize.min(n);
    while result < cache_reads {
      batch[result] = self.idx_to_ptr_sized::<A>(self.cache[csize - result - 1]);
      result += 1;
    }
    self.cache_size = (csize - result) as u8;

    while result < n {
      if self.freelist == LIST_END {
        break;
      }

      let host = self.freelist;
      let mut embed_count = self.embed_count as usize;
      let iter = embed_count.min(n - result);
      for i in 0..iter {
        batch[result + i] = self.idx_to_ptr_sized::<A>(load_slot::<A>(mem, host, embed_count - i));
      }
      embed_count -= iter;
      result += iter;

      if result == n {
        self.embed_count = embed_count as u16;
        break;
      }

      // The head host is empty, pop it.
      check!(embed_count == 0);
      batch[result] = self.idx_to_ptr_sized::<A>(host);
      result += 1;

      self.freelist = load_slot::<A>(mem, host, 0);
      self.embed_count = max_embed(size) as u16;
    }

    self.allocated += result as u16;
    result
  }

  /// Returns the object at `addr` to the free set.
  ///
  /// Returns `false` when this was the span's last live object: the span is
  /// now entirely free, the object is not recorded, and the span should go
  /// back to the page layer.
  #[inline]
  pub fn freelist_push(&mut self, mem: &mut [u8], addr: usize, size: usize) -> bool {
    check!(self.allocated > 0, "freelist_push: span {:?} has no live objects", self.first_page);
    if self.allocated == 1 {
      self.allocated = 0;
      return false;
    }
    self.allocated -= 1;

    if is_small(size) {
      self.freelist_push_sized::<Small>(mem, addr, size);
    } else {
      self.freelist_push_sized::<Large>(mem, addr, size);
    }
    true
  }

  fn freelist_push_sized<A: Align>(&mut self, mem: &mut [u8], addr: usize, size: usize) {
    let idx = self.ptr_to_idx_sized::<A>(addr);
    if self.cache_size as usize != CACHE_SIZE {
      // Have empty space in the cache, push there.
      self.cache[self.cache_size as usize] = idx;
      self.cache_size += 1;
    } else if self.freelist != LIST_END && self.embed_count as usize != max_embed(size) {
      // Embed into the head host.
      self.embed_count += 1;
      store_slot::<A>(mem, self.freelist, self.embed_count as usize, idx);
    } else {
      // The object becomes the new head host.
      store_slot::<A>(mem, idx, 0, self.freelist);
      self.freelist = idx;
      self.embed_count = 0;
    }
  }

  // ===========================================================================
  // Construction
  // ===========================================================================

  /// Lays out a free list holding all `count` objects of `size` bytes.
  ///
  /// The cache takes the lowest objects. Hosts are then taken from the low
  /// end of what remains and filled from the high end, so a fresh span is
  /// paged in gradually as it is used.
  pub fn build_freelist(&mut self, mem: &mut [u8], size: usize, count: usize) {
    if is_small(size) {
      self.build_freelist_sized::<Small>(mem, size, count);
    } else {
      self.build_freelist_sized::<Large>(mem, size, count);
    }
  }

  fn build_freelist_sized<A: Align>(&mut self, mem: &mut [u8], size: usize, count: usize) {
    self.allocated = 0;
    self.freelist = LIST_END;

    // Valid objects are {0, step, step * 2, ..., step * (count - 1)}.
    let step = size >> A::SHIFT;
    check!(
      step > 0 && step << A::SHIFT == size,
      "build_freelist: size {} is not a multiple of {}",
      size,
      1usize << A::SHIFT
    );
    check!(
      !A::SMALL || self.num_pages == Length::new(1),
      "build_freelist: small objects need a single-page span, got {:?}",
      self.num_pages
    );
    check!(
      count * size <= mem.len(),
      "build_freelist: {} objects of {} bytes overflow {} bytes",
      count,
      size,
      mem.len()
    );
    // Stronger than strictly needed: the end of the used range must also stay
    // clear of LIST_END, which rules out `idx_end` overflowing.
    check!(
      count * step < LIST_END as usize,
      "build_freelist: {} objects of step {} reach LIST_END",
      count,
      step
    );

    let mut idx = 0;
    let mut idx_end = count * step;

    // First, push as much as we can into the cache.
    let mut cache_size = 0;
    while idx < idx_end && cache_size < CACHE_SIZE {
      self.cache[cache_size] = idx as ObjIdx;
      cache_size += 1;
      idx += step;
    }
    self.cache_size = cache_size as u8;

    // Hosts from the front, embedded objects from the back.
    let max_embed = max_embed(size);
    let mut host: Option<ObjIdx> = None;
    let mut embed_count = 0;
    while idx < idx_end {
      match host {
        Some(head) if embed_count != max_embed => {
          embed_count += 1;
          idx_end -= step;
          store_slot::<A>(mem, head, embed_count, idx_end as ObjIdx);
        }
        _ => {
          // The head host is full, start a new one in front of it.
          let head = idx as ObjIdx;
          store_slot::<A>(mem, head, 0, self.freelist);
          self.freelist = head;
          host = Some(head);
          embed_count = 0;
          idx += step;
        }
      }
    }
    self.embed_count = embed_count as u16;
  }
}
