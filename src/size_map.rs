//! Size-class table: object size and span length per class.
//!
//! Class 0 is reserved for "no size class" (pages that are free or hold a
//! single large allocation). Everything is computed at compile time.

use crate::{
  MULTI_PAGE_ALIGNMENT, MULTI_PAGE_ALIGNMENT_SHIFT, MULTI_PAGE_SIZE, PAGE_SHIFT, PAGE_SIZE,
  align_up,
  span::LIST_END,
};

/// Number of linear size classes (16...128).
const CLASSES_LINEAR: usize = 8;
const CLASSES_LINEAR_STEP: usize = 16;

/// Classes per doubling in geometric progression
const CLASSES_PER_DOUBLING: usize = 4;

/// Largest size served from size classes.
pub const MAX_SIZE: usize = 256 << 10;

/// Upper bound on a multi-page span. Keeps every large-object index well
/// below `LIST_END`.
const MAX_SPAN_BYTES: usize = ((LIST_END as usize) << MULTI_PAGE_ALIGNMENT_SHIFT) / 2;

/// Sub-class multipliers for geometric range (scaled by 16 for integer math).
/// Each represents a fraction of the doubling: 1.0, 1.19, 1.44, 1.69
const GEO_MULTIPLIERS: [usize; 4] = [16, 19, 23, 27];

/// Layout of one size class.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct SizeClassInfo {
  /// Object size in bytes.
  pub size: usize,
  /// Pages per span.
  pub pages: usize,
}

impl SizeClassInfo {
  pub const fn objects_per_span(&self) -> usize {
    if self.size == 0 {
      0
    } else {
      (self.pages << PAGE_SHIFT) / self.size
    }
  }
}

/// Object size of class `cl >= 1`.
const fn raw_class_size(cl: usize) -> usize {
  let class = cl - 1;
  if class < CLASSES_LINEAR {
    return (class + 1) * CLASSES_LINEAR_STEP;
  }

  let geo_index = class - CLASSES_LINEAR + 1;
  let order = geo_index / CLASSES_PER_DOUBLING;
  let sub = geo_index % CLASSES_PER_DOUBLING;

  let base = 128 << order;
  let size = (base * GEO_MULTIPLIERS[sub]) / 16;
  // Multi-page objects are indexed in MULTI_PAGE_ALIGNMENT units.
  let size = if size > MULTI_PAGE_SIZE {
    align_up(size, MULTI_PAGE_ALIGNMENT)
  } else {
    align_up(size, CLASSES_LINEAR_STEP)
  };

  if size > MAX_SIZE { MAX_SIZE } else { size }
}

/// Returns the total number of size classes (including class 0). Computed at compile-time.
const fn count_size_classes() -> usize {
  let mut cl = 1;
  loop {
    if raw_class_size(cl) >= MAX_SIZE {
      return cl + 1;
    }
    cl += 1;
  }
}

/// Smallest span length whose tail waste is at most 1/8 of the span.
const fn class_pages(size: usize) -> usize {
  if size <= MULTI_PAGE_SIZE {
    return 1;
  }
  let mut pages = size.div_ceil(PAGE_SIZE);
  loop {
    let bytes = pages << PAGE_SHIFT;
    if (bytes % size) * 8 <= bytes || bytes + PAGE_SIZE > MAX_SPAN_BYTES {
      return pages;
    }
    pages += 1;
  }
}

/// Total number of size classes, class 0 included.
pub const CLASSES_COUNT: usize = count_size_classes();

const fn build_size_classes() -> [SizeClassInfo; CLASSES_COUNT] {
  let mut table = [SizeClassInfo { size: 0, pages: 0 }; CLASSES_COUNT];
  let mut cl = 1;
  while cl < CLASSES_COUNT {
    let size = raw_class_size(cl);
    table[cl] = SizeClassInfo {
      size,
      pages: class_pages(size),
    };
    cl += 1;
  }
  table
}

pub static SIZE_CLASSES: [SizeClassInfo; CLASSES_COUNT] = build_size_classes();

/// Every object boundary of every class indexes below `LIST_END` and lands on
/// its regime's alignment.
const fn layout_fits_obj_idx() -> bool {
  let table = build_size_classes();
  let mut cl = 1;
  while cl < CLASSES_COUNT {
    let info = table[cl];
    let shift = if info.size <= MULTI_PAGE_SIZE {
      crate::ALIGNMENT_SHIFT
    } else {
      MULTI_PAGE_ALIGNMENT_SHIFT
    };
    if info.size & ((1 << shift) - 1) != 0 {
      return false;
    }
    let step = info.size >> shift;
    if info.objects_per_span() * step >= LIST_END as usize {
      return false;
    }
    if info.size <= MULTI_PAGE_SIZE && info.pages != 1 {
      return false;
    }
    cl += 1;
  }
  true
}

const _: () = assert!(raw_class_size(1) == 16);
const _: () = assert!(raw_class_size(CLASSES_COUNT - 1) == MAX_SIZE);
const _: () = assert!(CLASSES_COUNT <= u8::MAX as usize);
const _: () = assert!(layout_fits_obj_idx());

/// Object size for class `cl`. Class 0 has size 0.
#[inline(always)]
pub fn class_to_size(cl: usize) -> usize {
  SIZE_CLASSES[cl].size
}

/// Span length in pages for class `cl`.
#[inline(always)]
pub fn class_to_pages(cl: usize) -> usize {
  SIZE_CLASSES[cl].pages
}

#[inline(always)]
pub fn objects_per_span(cl: usize) -> usize {
  SIZE_CLASSES[cl].objects_per_span()
}

/// Smallest class that fits `size` bytes, or `None` above `MAX_SIZE`.
pub fn size_to_class(size: usize) -> Option<usize> {
  if size > MAX_SIZE {
    return None;
  }

  // Linear range: ceil(size / 16)
  if size <= CLASSES_LINEAR * CLASSES_LINEAR_STEP {
    return Some(size.max(1).div_ceil(CLASSES_LINEAR_STEP));
  }

  Some(SIZE_CLASSES[1..].partition_point(|info| info.size < size) + 1)
}
