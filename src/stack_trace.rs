//! Captured call stacks attached to sampled spans.

pub const MAX_STACK_DEPTH: usize = 64;

/// A sampled allocation: where it came from and what it stands for.
///
/// Capture happens elsewhere; spans only own and report these.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct StackTrace {
  /// Bytes the caller asked for.
  pub requested_size: usize,
  pub requested_alignment: usize,
  /// Bytes actually handed out (the class size).
  pub allocated_size: usize,
  /// Sampling weight: roughly the bytes allocated between two samples.
  pub weight: usize,
  pub depth: usize,
  pub stack: [usize; MAX_STACK_DEPTH],
}

impl StackTrace {
  pub fn new(requested_size: usize, allocated_size: usize, weight: usize) -> Self {
    Self {
      requested_size,
      requested_alignment: 0,
      allocated_size,
      weight,
      depth: 0,
      stack: [0; MAX_STACK_DEPTH],
    }
  }

  /// Copies up to `MAX_STACK_DEPTH` return addresses, innermost first.
  pub fn with_frames(mut self, frames: &[usize]) -> Self {
    let depth = frames.len().min(MAX_STACK_DEPTH);
    self.stack[..depth].copy_from_slice(&frames[..depth]);
    self.depth = depth;
    self
  }

  pub fn frames(&self) -> &[usize] {
    &self.stack[..self.depth]
  }
}

/// Bytes a sample accounts for. With `unsample`, scales the single object up
/// to the allocation volume the sample represents.
pub fn allocated_bytes(stack: &StackTrace, unsample: bool) -> f64 {
  if unsample {
    stack.weight as f64 * stack.allocated_size as f64 / stack.requested_size.wrapping_add(1) as f64
  } else {
    stack.allocated_size as f64
  }
}
