//! Span header storage, intrusive span lists and the sampled-span registry.
//!
//! Span headers live in a `SpanArena` and are named by `SpanId`. Lists thread
//! through the `SpanLink` embedded in each header, so insert and remove are
//! O(1) and a span can only be on one list at a time.

use core::ops::{Index, IndexMut};

use crate::{
  pages::{Length, PageId},
  span::Span,
  stack_trace::{StackTrace, allocated_bytes},
  stats_counter::StatsCounter,
};

/// Handle to a span header in a `SpanArena`.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SpanId(u32);

impl SpanId {
  #[inline]
  fn slot(self) -> usize {
    self.0 as usize
  }
}

/// Intrusive list pointers embedded in a span.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub(crate) struct SpanLink {
  prev: Option<SpanId>,
  next: Option<SpanId>,
  linked: bool,
}

// =============================================================================
// Arena
// =============================================================================

/// Slab of span headers. Freed headers are recycled by later allocations.
#[derive(Debug, Default)]
pub struct SpanArena {
  spans: Vec<Span>,
  free: Vec<SpanId>,
}

impl SpanArena {
  pub fn new() -> Self {
    Self::default()
  }

  /// A header for `num_pages` pages starting at `first_page`.
  pub fn alloc(&mut self, first_page: PageId, num_pages: Length) -> SpanId {
    if let Some(id) = self.free.pop() {
      self.spans[id.slot()].init(first_page, num_pages);
      return id;
    }
    let id = SpanId(self.spans.len() as u32);
    self.spans.push(Span::new(first_page, num_pages));
    id
  }

  /// Returns a header to the arena. The span must be off every list and
  /// unsampled.
  pub fn free(&mut self, id: SpanId) {
    let span = &self.spans[id.slot()];
    check!(!span.link.linked, "free: span {:?} is still on a list", span.first_page());
    check!(!span.is_sampled(), "free: span {:?} is still sampled", span.first_page());
    check!(!self.free.contains(&id), "free: {:?} freed twice", id);
    self.free.push(id);
  }

  /// Headers currently handed out.
  pub fn len(&self) -> usize {
    self.spans.len() - self.free.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Marks `id` sampled with `stack` and registers it in `sampled`.
  ///
  /// An already-sampled span is left alone and `stack` is handed back.
  pub fn sample(
    &mut self,
    id: SpanId,
    stack: Box<StackTrace>,
    sampled: &mut SampledObjects,
  ) -> Result<(), Box<StackTrace>> {
    if self[id].is_sampled() {
      return Err(stack);
    }

    // The cast matches `unsample`, so the pair nets to zero.
    let bytes = allocated_bytes(&stack, true) as i64;
    self[id].attach_stack(stack);
    sampled.spans.prepend(self, id);
    // Lossy is fine: registry writers hold the page layer lock.
    sampled.size.lossy_add(bytes);
    Ok(())
  }

  /// Clears sampling on `id` and gives its stack trace back to the caller.
  /// `None` if the span is not sampled.
  pub fn unsample(&mut self, id: SpanId, sampled: &mut SampledObjects) -> Option<Box<StackTrace>> {
    let stack = self[id].detach_stack()?;
    sampled.spans.remove(self, id);
    sampled.size.lossy_add(-(allocated_bytes(&stack, true) as i64));
    Some(stack)
  }
}

impl Index<SpanId> for SpanArena {
  type Output = Span;

  fn index(&self, id: SpanId) -> &Span {
    &self.spans[id.slot()]
  }
}

impl IndexMut<SpanId> for SpanArena {
  fn index_mut(&mut self, id: SpanId) -> &mut Span {
    &mut self.spans[id.slot()]
  }
}

// =============================================================================
// SpanList
// =============================================================================

/// Doubly-linked list of spans, threaded through their headers.
#[derive(Debug, Default)]
pub struct SpanList {
  head: Option<SpanId>,
  len: usize,
}

impl SpanList {
  pub const fn new() -> Self {
    Self { head: None, len: 0 }
  }

  pub fn is_empty(&self) -> bool {
    self.head.is_none()
  }

  pub fn len(&self) -> usize {
    self.len
  }

  pub fn first(&self) -> Option<SpanId> {
    self.head
  }

  /// Pushes `id` at the front.
  pub fn prepend(&mut self, arena: &mut SpanArena, id: SpanId) {
    check!(!arena[id].link.linked, "prepend: {:?} is already on a list", id);
    let old_head = self.head;
    arena[id].link = SpanLink {
      prev: None,
      next: old_head,
      linked: true,
    };
    if let Some(next) = old_head {
      arena[next].link.prev = Some(id);
    }
    self.head = Some(id);
    self.len += 1;
  }

  /// Unlinks `id`, which must be on this list.
  pub fn remove(&mut self, arena: &mut SpanArena, id: SpanId) {
    let link = arena[id].link;
    check!(link.linked, "remove: {:?} is not on a list", id);

    match link.prev {
      Some(prev) => arena[prev].link.next = link.next,
      None => {
        check!(self.head == Some(id), "remove: {:?} is not on this list", id);
        self.head = link.next;
      }
    }
    if let Some(next) = link.next {
      arena[next].link.prev = link.prev;
    }

    arena[id].link = SpanLink::default();
    self.len -= 1;
  }

  /// Front-to-back walk.
  pub fn iter<'a>(&self, arena: &'a SpanArena) -> Iter<'a> {
    Iter {
      arena,
      next: self.head,
    }
  }
}

pub struct Iter<'a> {
  arena: &'a SpanArena,
  next: Option<SpanId>,
}

impl Iterator for Iter<'_> {
  type Item = SpanId;

  fn next(&mut self) -> Option<SpanId> {
    let id = self.next?;
    self.next = self.arena[id].link.next;
    Some(id)
  }
}

// =============================================================================
// Sampled span registry
// =============================================================================

/// Every sampled span plus the estimated bytes they stand for.
#[derive(Debug, Default)]
pub struct SampledObjects {
  spans: SpanList,
  size: StatsCounter,
}

impl SampledObjects {
  pub const fn new() -> Self {
    Self {
      spans: SpanList::new(),
      size: StatsCounter::new(),
    }
  }

  pub fn spans(&self) -> &SpanList {
    &self.spans
  }

  pub fn len(&self) -> usize {
    self.spans.len()
  }

  pub fn is_empty(&self) -> bool {
    self.spans.is_empty()
  }

  /// Estimated sampled bytes.
  pub fn size(&self) -> &StatsCounter {
    &self.size
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn arena_with(n: usize) -> (SpanArena, Vec<SpanId>) {
    let mut arena = SpanArena::new();
    let ids = (0..n)
      .map(|i| arena.alloc(PageId::new(100 + i * 4), Length::new(2)))
      .collect();
    (arena, ids)
  }

  fn trace(requested: usize, allocated: usize) -> Box<StackTrace> {
    Box::new(StackTrace::new(requested, allocated, 2 << 20).with_frames(&[0x4000, 0x4100]))
  }

  #[test]
  fn arena_recycles_headers() {
    let (mut arena, ids) = arena_with(3);
    assert_eq!(arena.len(), 3);

    arena.free(ids[1]);
    assert_eq!(arena.len(), 2);

    let again = arena.alloc(PageId::new(900), Length::new(5));
    assert_eq!(again, ids[1]);
    assert_eq!(arena[again].first_page(), PageId::new(900));
    assert_eq!(arena[again].num_pages(), Length::new(5));
    assert_eq!(arena.len(), 3);
  }

  #[test]
  fn list_prepends_and_removes() {
    let (mut arena, ids) = arena_with(4);
    let mut list = SpanList::new();
    assert!(list.is_empty());

    for &id in &ids {
      list.prepend(&mut arena, id);
    }
    assert_eq!(list.len(), 4);
    assert_eq!(list.first(), Some(ids[3]));
    let order: Vec<_> = list.iter(&arena).collect();
    assert_eq!(order, vec![ids[3], ids[2], ids[1], ids[0]]);

    // Middle, head, tail.
    list.remove(&mut arena, ids[1]);
    list.remove(&mut arena, ids[3]);
    list.remove(&mut arena, ids[0]);
    let order: Vec<_> = list.iter(&arena).collect();
    assert_eq!(order, vec![ids[2]]);
    assert_eq!(list.len(), 1);

    list.remove(&mut arena, ids[2]);
    assert!(list.is_empty());
    assert_eq!(list.iter(&arena).count(), 0);

    // Removed spans can be listed again.
    list.prepend(&mut arena, ids[1]);
    assert_eq!(list.first(), Some(ids[1]));
  }

  #[test]
  fn sample_then_unsample_returns_the_same_trace() {
    let (mut arena, ids) = arena_with(2);
    let mut sampled = SampledObjects::new();

    let stack = trace(100, 112);
    let expected_bytes = allocated_bytes(&stack, true) as i64;
    let handle: *const StackTrace = &*stack;

    arena.sample(ids[0], stack, &mut sampled).unwrap();
    assert!(arena[ids[0]].is_sampled());
    assert_eq!(arena[ids[0]].sampled_stack().map(|s| s.allocated_size), Some(112));
    assert_eq!(sampled.len(), 1);
    assert_eq!(sampled.size().value(), expected_bytes);

    let back = arena.unsample(ids[0], &mut sampled).unwrap();
    assert!(core::ptr::eq(&*back, handle));
    assert!(!arena[ids[0]].is_sampled());
    assert!(arena[ids[0]].sampled_stack().is_none());
    assert!(sampled.is_empty());
    assert_eq!(sampled.size().value(), 0);
  }

  #[test]
  fn unsample_twice_is_a_no_op() {
    let (mut arena, ids) = arena_with(1);
    let mut sampled = SampledObjects::new();
    assert!(arena.unsample(ids[0], &mut sampled).is_none());

    arena.sample(ids[0], trace(10, 16), &mut sampled).unwrap();
    assert!(arena.unsample(ids[0], &mut sampled).is_some());
    assert!(arena.unsample(ids[0], &mut sampled).is_none());
    assert!(sampled.is_empty());
    assert_eq!(sampled.size().value(), 0);
  }

  #[test]
  fn sampling_a_sampled_span_hands_the_trace_back() {
    let (mut arena, ids) = arena_with(1);
    let mut sampled = SampledObjects::new();
    arena.sample(ids[0], trace(10, 16), &mut sampled).unwrap();
    let before = sampled.size().value();

    let rejected = arena.sample(ids[0], trace(20, 32), &mut sampled).unwrap_err();
    assert_eq!(rejected.requested_size, 20);
    assert_eq!(sampled.len(), 1);
    assert_eq!(sampled.size().value(), before);
    assert_eq!(arena[ids[0]].sampled_stack().map(|s| s.requested_size), Some(10));
  }

  #[test]
  fn registry_keeps_newest_first() {
    let (mut arena, ids) = arena_with(3);
    let mut sampled = SampledObjects::new();
    let mut total = 0;
    for (i, &id) in ids.iter().enumerate() {
      let stack = trace(8 * (i + 1), 16 * (i + 1));
      total += allocated_bytes(&stack, true) as i64;
      arena.sample(id, stack, &mut sampled).unwrap();
    }
    assert_eq!(sampled.size().value(), total);
    let order: Vec<_> = sampled.spans().iter(&arena).collect();
    assert_eq!(order, vec![ids[2], ids[1], ids[0]]);

    arena.unsample(ids[1], &mut sampled).unwrap();
    let order: Vec<_> = sampled.spans().iter(&arena).collect();
    assert_eq!(order, vec![ids[2], ids[0]]);

    arena.unsample(ids[2], &mut sampled).unwrap();
    arena.unsample(ids[0], &mut sampled).unwrap();
    assert_eq!(sampled.size().value(), 0);
    for id in ids {
      arena.free(id);
    }
    assert!(arena.is_empty());
  }
}
