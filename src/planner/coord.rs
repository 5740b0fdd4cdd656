use serde::{Deserialize, Serialize};
use std::fmt;

/// Logical core position: `x` is the column, `y` is the row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CoreCoord {
  pub x: u32,
  pub y: u32,
}

impl CoreCoord {
  pub const fn new(x: u32, y: u32) -> Self {
    Self { x, y }
  }

  /// Number of cores in a grid of this extent.
  pub fn area(&self) -> u32 {
    self.x * self.y
  }
}

impl fmt::Display for CoreCoord {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "({}, {})", self.x, self.y)
  }
}

/// Inclusive rectangle of cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CoreRange {
  pub start: CoreCoord,
  pub end: CoreCoord,
}

impl CoreRange {
  pub fn new(start: CoreCoord, end: CoreCoord) -> Self {
    Self { start, end }
  }

  pub fn single(core: CoreCoord) -> Self {
    Self { start: core, end: core }
  }

  /// A range whose end lies before its start holds no cores.
  pub fn is_empty(&self) -> bool {
    self.end.x < self.start.x || self.end.y < self.start.y
  }

  pub fn num_cores(&self) -> u32 {
    if self.is_empty() {
      return 0;
    }
    (self.end.x - self.start.x + 1) * (self.end.y - self.start.y + 1)
  }

  pub fn contains(&self, core: CoreCoord) -> bool {
    !self.is_empty()
      && core.x >= self.start.x
      && core.x <= self.end.x
      && core.y >= self.start.y
      && core.y <= self.end.y
  }

  /// Cores in row-major order.
  pub fn cores(&self) -> Vec<CoreCoord> {
    if self.is_empty() {
      return Vec::new();
    }
    let mut cores = Vec::with_capacity(self.num_cores() as usize);
    for y in self.start.y..=self.end.y {
      for x in self.start.x..=self.end.x {
        cores.push(CoreCoord::new(x, y));
      }
    }
    cores
  }
}

impl fmt::Display for CoreRange {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "[{} - {}]", self.start, self.end)
  }
}

/// Disjoint union of core rectangles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreRangeSet {
  ranges: Vec<CoreRange>,
}

impl CoreRangeSet {
  pub fn new(ranges: Vec<CoreRange>) -> Self {
    Self {
      ranges: ranges.into_iter().filter(|r| !r.is_empty()).collect(),
    }
  }

  pub fn ranges(&self) -> &[CoreRange] {
    &self.ranges
  }

  pub fn is_empty(&self) -> bool {
    self.ranges.is_empty()
  }

  pub fn num_cores(&self) -> u32 {
    self.ranges.iter().map(CoreRange::num_cores).sum()
  }

  pub fn contains(&self, core: CoreCoord) -> bool {
    self.ranges.iter().any(|r| r.contains(core))
  }

  pub fn cores(&self) -> Vec<CoreCoord> {
    self.ranges.iter().flat_map(|r| r.cores()).collect()
  }
}

impl From<CoreRange> for CoreRangeSet {
  fn from(range: CoreRange) -> Self {
    CoreRangeSet::new(vec![range])
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn empty_range_has_no_cores() {
    let r = CoreRange::new(CoreCoord::new(1, 0), CoreCoord::new(0, 3));
    assert!(r.is_empty());
    assert_eq!(r.num_cores(), 0);
    assert!(r.cores().is_empty());
    assert!(CoreRangeSet::new(vec![r]).is_empty());
  }

  #[test]
  fn range_set_counts_and_contains() {
    let set = CoreRangeSet::new(vec![
      CoreRange::new(CoreCoord::new(0, 0), CoreCoord::new(1, 1)),
      CoreRange::single(CoreCoord::new(3, 2)),
    ]);
    assert_eq!(set.num_cores(), 5);
    assert!(set.contains(CoreCoord::new(1, 0)));
    assert!(set.contains(CoreCoord::new(3, 2)));
    assert!(!set.contains(CoreCoord::new(2, 2)));
  }
}
