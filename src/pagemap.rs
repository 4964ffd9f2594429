//! Page → size-class lookup.

use std::collections::HashMap;

use crate::pages::{Length, PageId};

/// Maps a page to the size class of the span covering it.
pub trait PageMap {
  /// Size class of `page`, or 0 if the page is not part of a small-object span.
  fn sizeclass(&self, page: PageId) -> usize;
}

/// Hash-map pagemap. Every page of a registered span is recorded.
#[derive(Debug, Default)]
pub struct FlatPageMap {
  classes: HashMap<PageId, u8>,
}

impl FlatPageMap {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn set_span(&mut self, first_page: PageId, num_pages: Length, cl: usize) {
    check!(cl <= u8::MAX as usize, "size class {} out of range", cl);
    for i in 0..num_pages.raw_num() {
      self.classes.insert(first_page + Length::new(i), cl as u8);
    }
  }

  pub fn clear_span(&mut self, first_page: PageId, num_pages: Length) {
    for i in 0..num_pages.raw_num() {
      self.classes.remove(&(first_page + Length::new(i)));
    }
  }
}

impl PageMap for FlatPageMap {
  fn sizeclass(&self, page: PageId) -> usize {
    self.classes.get(&page).copied().unwrap_or(0) as usize
  }
}
