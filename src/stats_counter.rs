//! Counters for statistics that tolerate lost updates.

use core::sync::atomic::{AtomicI64, Ordering};

/// Aggregate statistic that tolerates racy updates.
///
/// Writers are expected to be serialized by an outer lock; readers may load at
/// any time. `lossy_add` is a separate relaxed load and store, so concurrent
/// unserialized adds can drop increments.
#[derive(Debug, Default)]
pub struct StatsCounter {
  value: AtomicI64,
}

impl StatsCounter {
  pub const fn new() -> Self {
    Self {
      value: AtomicI64::new(0),
    }
  }

  #[inline]
  pub fn lossy_add(&self, increment: i64) {
    let sum = self.value.load(Ordering::Relaxed).wrapping_add(increment);
    self.value.store(sum, Ordering::Relaxed);
  }

  #[inline]
  pub fn value(&self) -> i64 {
    self.value.load(Ordering::Relaxed)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn adds_and_subtracts() {
    static COUNTER: StatsCounter = StatsCounter::new();
    assert_eq!(COUNTER.value(), 0);
    COUNTER.lossy_add(4096);
    COUNTER.lossy_add(-96);
    assert_eq!(COUNTER.value(), 4000);
    COUNTER.lossy_add(-4000);
    assert_eq!(COUNTER.value(), 0);
  }
}
