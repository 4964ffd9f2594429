use std::collections::HashSet;

use rand::{Rng, SeedableRng, rngs::StdRng, seq::SliceRandom};
use spanfree::{
  FlatPageMap, Length, PAGE_SIZE, PageId, Span,
  size_map::{CLASSES_COUNT, class_to_pages, class_to_size, objects_per_span},
};

/// Span plus its backing bytes and a model of which objects are live.
struct Harness {
  span: Span,
  mem: Vec<u8>,
  size: usize,
  count: usize,
  live: HashSet<usize>,
}

impl Harness {
  fn new(cl: usize, first_page: usize) -> Self {
    let size = class_to_size(cl);
    let pages = class_to_pages(cl);
    let count = objects_per_span(cl);
    let mut span = Span::new(PageId::new(first_page), Length::new(pages));
    let mut mem = vec![0u8; pages * PAGE_SIZE];
    span.build_freelist(&mut mem, size, count);
    Self {
      span,
      mem,
      size,
      count,
      live: HashSet::new(),
    }
  }

  fn take(&mut self, addr: usize) {
    let off = addr - self.span.start_address();
    assert_eq!(off % self.size, 0, "misaligned object {:#x}", addr);
    assert!(off / self.size < self.count, "object {:#x} past the end", addr);
    assert!(self.live.insert(addr), "object {:#x} handed out twice", addr);
    // Live objects belong to the caller: scribble over them.
    self.mem[off..off + self.size].fill(0xA5);
  }

  fn pop(&mut self) -> bool {
    match self.span.freelist_pop(&self.mem, self.size) {
      Some(addr) => {
        self.take(addr);
        true
      }
      None => {
        assert_eq!(self.live.len(), self.count);
        false
      }
    }
  }

  fn pop_batch(&mut self, n: usize) {
    let mut batch = vec![0usize; n];
    let got = self.span.freelist_pop_batch(&self.mem, &mut batch, self.size);
    let free_before = self.count - self.live.len();
    assert_eq!(got, n.min(free_before));
    for &addr in &batch[..got] {
      self.take(addr);
    }
  }

  fn push(&mut self, addr: usize) {
    assert!(self.live.remove(&addr));
    let kept = self.span.freelist_push(&mut self.mem, addr, self.size);
    assert_eq!(kept, !self.live.is_empty());
    if !kept {
      // Last object back: the span is released and rebuilt from scratch.
      self.span.init(self.span.first_page(), self.span.num_pages());
      self.span.build_freelist(&mut self.mem, self.size, self.count);
    }
  }
}

#[test]
fn random_mix_conserves_objects() {
  let mut rng = StdRng::seed_from_u64(0x5EED);

  for cl in 1..CLASSES_COUNT {
    let mut h = Harness::new(cl, 64 + cl * 256);
    for _ in 0..2_000 {
      match rng.gen_range(0..10) {
        0..=3 => {
          h.pop();
        }
        4..=5 => {
          let n = rng.gen_range(1..=40);
          h.pop_batch(n);
        }
        _ => {
          let victim = h.live.iter().next().copied();
          if let Some(addr) = victim {
            h.push(addr);
          }
        }
      }
      assert_eq!(h.span.allocated(), h.live.len(), "class {}", cl);
    }
  }
}

#[test]
fn drain_refill_drain() {
  let mut rng = StdRng::seed_from_u64(7);

  for cl in [1, 2, 5, 12, 20, CLASSES_COUNT - 1] {
    let mut h = Harness::new(cl, 4096);
    while h.pop() {}
    assert!(h.span.freelist_empty());

    // Return all but one in random order, then take them all again.
    let mut objects: Vec<usize> = h.live.iter().copied().collect();
    objects.shuffle(&mut rng);
    for &addr in &objects[1..] {
      h.push(addr);
    }
    assert_eq!(h.span.allocated(), 1);

    h.pop_batch(h.count);
    assert_eq!(h.live.len(), h.count);
    assert!(h.span.freelist_empty());
  }
}

#[test]
fn fragmentation_tracks_live_objects() {
  let cl = 3;
  let mut h = Harness::new(cl, 77);
  let mut pagemap = FlatPageMap::new();
  pagemap.set_span(h.span.first_page(), h.span.num_pages(), cl);

  let mut previous = f64::INFINITY;
  for _ in 0..h.count {
    h.pop();
    let frag = h.span.fragmentation(&pagemap);
    assert!(frag >= 0.0);
    assert!(frag < previous);
    previous = frag;
  }
  assert_eq!(previous, 0.0);
}

#[cfg(unix)]
#[test]
fn spans_over_mapped_pages() {
  use spanfree::PageRegion;

  for cl in [1, 9, 16, 30] {
    let size = class_to_size(cl);
    let count = objects_per_span(cl);
    let mut region = PageRegion::new(Length::new(class_to_pages(cl))).unwrap();
    let mut span = Span::new(region.first_page(), region.num_pages());
    let mem = region.as_mut_slice();
    span.build_freelist(mem, size, count);

    let mut batch = vec![0usize; count];
    assert_eq!(span.freelist_pop_batch(mem, &mut batch, size), count);

    // Real addresses: every object lies inside the mapping.
    let base = mem.as_ptr() as usize;
    for &addr in &batch {
      assert!(span.contains(addr));
      assert!(addr >= base && addr + size <= base + mem.len());
    }

    for &addr in &batch[1..] {
      assert!(span.freelist_push(mem, addr, size));
    }
    assert!(!span.freelist_push(mem, batch[0], size));
    assert_eq!(span.allocated(), 0);
  }
}
