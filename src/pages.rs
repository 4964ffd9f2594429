//! Page identity and page-aligned backing memory.

use core::{
  fmt,
  ops::{Add, Sub},
};

use crate::{PAGE_SHIFT, PAGE_SIZE};

/// Page number: an address shifted right by `PAGE_SHIFT`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PageId(usize);

impl PageId {
  pub const fn new(index: usize) -> Self {
    Self(index)
  }

  /// The page holding `addr`.
  #[inline]
  pub const fn containing(addr: usize) -> Self {
    Self(addr >> PAGE_SHIFT)
  }

  #[inline]
  pub const fn index(self) -> usize {
    self.0
  }

  #[inline]
  pub const fn start_addr(self) -> usize {
    self.0 << PAGE_SHIFT
  }
}

impl fmt::Debug for PageId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "PageId({:#x})", self.start_addr())
  }
}

impl Add<Length> for PageId {
  type Output = PageId;

  fn add(self, rhs: Length) -> PageId {
    PageId(self.0 + rhs.0)
  }
}

impl Sub<Length> for PageId {
  type Output = PageId;

  fn sub(self, rhs: Length) -> PageId {
    PageId(self.0 - rhs.0)
  }
}

/// A number of pages.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Default)]
pub struct Length(usize);

impl Length {
  pub const fn new(pages: usize) -> Self {
    Self(pages)
  }

  #[inline]
  pub const fn raw_num(self) -> usize {
    self.0
  }

  #[inline]
  pub const fn in_bytes(self) -> usize {
    self.0 << PAGE_SHIFT
  }
}

impl Add for Length {
  type Output = Length;

  fn add(self, rhs: Length) -> Length {
    Length(self.0 + rhs.0)
  }
}

// =============================================================================
// Platform
// =============================================================================

#[cfg(unix)]
unsafe fn os_mmap(size: usize) -> *mut u8 {
  let ptr = unsafe {
    libc::mmap(
      core::ptr::null_mut(),
      size,
      libc::PROT_READ | libc::PROT_WRITE,
      libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
      -1,
      0,
    )
  };

  if ptr == libc::MAP_FAILED {
    core::ptr::null_mut()
  } else {
    ptr as *mut u8
  }
}

#[cfg(unix)]
unsafe fn os_munmap(ptr: *mut u8, size: usize) {
  unsafe { libc::munmap(ptr.cast(), size) };
}

/// A run of zeroed, page-aligned pages mapped straight from the OS.
///
/// Stands in for the page heap when spans need real memory behind them.
#[cfg(unix)]
pub struct PageRegion {
  /// Original mmap base (for munmap).
  raw: *mut u8,
  /// Total mmap size, including alignment slack.
  raw_len: usize,
  first_page: PageId,
  num_pages: Length,
}

// The region exclusively owns its mapping.
#[cfg(unix)]
unsafe impl Send for PageRegion {}

#[cfg(unix)]
impl PageRegion {
  /// Maps `num_pages` pages aligned on `PAGE_SIZE`. Returns `None` if the
  /// OS refuses the mapping.
  pub fn new(num_pages: Length) -> Option<Self> {
    // Over-allocate for alignment padding.
    let raw_len = num_pages.in_bytes() + PAGE_SIZE;
    let raw = unsafe { os_mmap(raw_len) };
    if raw.is_null() {
      log::warn!(
        "PageRegion: mmap of {} bytes failed ({:?} pages)",
        raw_len,
        num_pages
      );
      return None;
    }

    let aligned = crate::align_up(raw as usize, PAGE_SIZE);
    Some(Self {
      raw,
      raw_len,
      first_page: PageId::containing(aligned),
      num_pages,
    })
  }

  pub fn first_page(&self) -> PageId {
    self.first_page
  }

  pub fn num_pages(&self) -> Length {
    self.num_pages
  }

  /// The region's bytes, starting at `first_page().start_addr()`.
  pub fn as_mut_slice(&mut self) -> &mut [u8] {
    unsafe {
      core::slice::from_raw_parts_mut(
        self.first_page.start_addr() as *mut u8,
        self.num_pages.in_bytes(),
      )
    }
  }
}

#[cfg(unix)]
impl Drop for PageRegion {
  fn drop(&mut self) {
    unsafe { os_munmap(self.raw, self.raw_len) };
  }
}
