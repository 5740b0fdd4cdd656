//! Output-tile partitioning for both matmul variants.
//!
//! The interleaved variants hand each core a contiguous run of output tiles
//! ([`split_work_to_cores`]). The blocked variant gives each core a fixed
//! `per_core_m x per_core_n` tile block ([`BlockPartition`]).

use super::coord::{CoreCoord, CoreRange, CoreRangeSet};
use super::shape::{MatmulShape, TilingOptions};
use crate::error::ConfigError;

/// Cores sharing one per-core work count.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreGroup {
  pub cores: CoreRangeSet,
  pub units_per_core: u32,
}

impl CoreGroup {
  fn empty() -> Self {
    Self {
      cores: CoreRangeSet::default(),
      units_per_core: 0,
    }
  }

  pub fn num_cores(&self) -> u32 {
    self.cores.num_cores()
  }
}

/// Contiguous run of work units owned by one core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkAssignment {
  pub core: CoreCoord,
  pub start: u32,
  pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkSplit {
  pub num_cores: u32,
  pub all_cores: CoreRangeSet,
  /// Cores taking the larger count.
  pub group_1: CoreGroup,
  /// Cores taking the smaller count; empty when the split is even.
  pub group_2: CoreGroup,
  grid_rows: u32,
}

impl WorkSplit {
  /// Per-core runs in enumeration order. Runs are adjacent and cover every unit.
  pub fn assignments(&self) -> Vec<WorkAssignment> {
    let g1 = self.group_1.num_cores();
    let mut start = 0;
    (0..self.num_cores)
      .map(|i| {
        let count = if i < g1 {
          self.group_1.units_per_core
        } else {
          self.group_2.units_per_core
        };
        let assignment = WorkAssignment {
          core: column_major_core(i, self.grid_rows),
          start,
          count,
        };
        start += count;
        assignment
      })
      .collect()
  }

  pub fn total_units(&self) -> u32 {
    self.group_1.num_cores() * self.group_1.units_per_core + self.group_2.num_cores() * self.group_2.units_per_core
  }
}

fn column_major_core(index: u32, rows: u32) -> CoreCoord {
  CoreCoord::new(index / rows, index % rows)
}

/// Ranges covering cores `first..first + count` enumerated column by column.
fn column_major_ranges(rows: u32, first: u32, count: u32) -> CoreRangeSet {
  let mut ranges = Vec::new();
  let end = first + count;
  let mut i = first;
  while i < end {
    let x = i / rows;
    let y = i % rows;
    if y == 0 && end - i >= rows {
      let full = (end - i) / rows;
      ranges.push(CoreRange::new(CoreCoord::new(x, 0), CoreCoord::new(x + full - 1, rows - 1)));
      i += full * rows;
    } else {
      let len = (rows - y).min(end - i);
      ranges.push(CoreRange::new(CoreCoord::new(x, y), CoreCoord::new(x, y + len - 1)));
      i += len;
    }
  }
  CoreRangeSet::new(ranges)
}

/// Spread `units` over at most `grid.x * grid.y` cores as evenly as possible.
///
/// The first `units % num_cores` cores take one extra unit. Cores are
/// enumerated column-major: core `i` sits at `(i / rows, i % rows)`.
pub fn split_work_to_cores(grid: CoreCoord, units: u32) -> Result<WorkSplit, ConfigError> {
  let max_cores = grid.area();
  if units < 1 || max_cores < 1 {
    return Err(ConfigError::EmptyWork { units, cores: max_cores });
  }

  let rows = grid.y;
  let num_cores = units.min(max_cores);
  let all_cores = column_major_ranges(rows, 0, num_cores);
  let floor = units / num_cores;
  let remainder = units % num_cores;

  let (group_1, group_2) = if remainder == 0 {
    (
      CoreGroup {
        cores: all_cores.clone(),
        units_per_core: floor,
      },
      CoreGroup::empty(),
    )
  } else {
    (
      CoreGroup {
        cores: column_major_ranges(rows, 0, remainder),
        units_per_core: floor + 1,
      },
      CoreGroup {
        cores: column_major_ranges(rows, remainder, num_cores - remainder),
        units_per_core: floor,
      },
    )
  };

  Ok(WorkSplit {
    num_cores,
    all_cores,
    group_1,
    group_2,
    grid_rows: rows,
  })
}

/// Per-core block shape of the 2-D blocked product.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockPartition {
  pub per_core_m: u32,
  pub per_core_n: u32,
  pub in0_block_w: u32,
  /// Reduction steps along K.
  pub num_blocks: u32,
  pub num_blocks_y: u32,
  pub num_blocks_x: u32,
}

impl BlockPartition {
  /// `used_grid` is `(columns, rows)`; Mt is split over rows and Nt over columns.
  pub fn new(shape: &MatmulShape, used_grid: CoreCoord, tiling: &TilingOptions) -> Result<Self, ConfigError> {
    let (cols, rows) = (used_grid.x, used_grid.y);
    if cols == 0 || rows == 0 {
      return Err(ConfigError::InvalidParameter(format!("used grid {} is empty", used_grid)));
    }
    if tiling.in0_block_w_div == 0 {
      return Err(ConfigError::InvalidParameter("in0_block_w_div must be at least 1".to_string()));
    }

    let (mt, nt, kt) = (shape.mt(), shape.nt(), shape.kt());
    if mt % rows != 0 {
      return Err(ConfigError::InexactBlockDivision { what: "Mt over grid rows", total: mt, parts: rows });
    }
    if nt % cols != 0 {
      return Err(ConfigError::InexactBlockDivision { what: "Nt over grid columns", total: nt, parts: cols });
    }
    let per_core_m = mt / rows;
    let per_core_n = nt / cols;

    let in0_block_w = tiling.in0_block_w.unwrap_or(kt / cols / tiling.in0_block_w_div);
    if in0_block_w == 0 || kt % in0_block_w != 0 {
      return Err(ConfigError::InvalidBlockWidth { in0_block_w, kt });
    }

    Ok(Self {
      per_core_m,
      per_core_n,
      in0_block_w,
      num_blocks: kt / in0_block_w,
      num_blocks_y: mt / per_core_m,
      num_blocks_x: nt / per_core_n,
    })
  }

  pub fn in0_block_tiles(&self) -> u32 {
    self.per_core_m * self.in0_block_w
  }

  pub fn in1_block_tiles(&self) -> u32 {
    self.per_core_n * self.in0_block_w
  }

  pub fn out_block_tiles(&self) -> u32 {
    self.per_core_m * self.per_core_n
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn even_split_leaves_group_2_empty() {
    let split = split_work_to_cores(CoreCoord::new(4, 2), 16).unwrap();
    assert_eq!(split.num_cores, 8);
    assert_eq!(split.group_1.units_per_core, 2);
    assert_eq!(split.group_1.num_cores(), 8);
    assert!(split.group_2.cores.is_empty());
  }

  #[test]
  fn uneven_split_gives_group_2_its_own_count() {
    let split = split_work_to_cores(CoreCoord::new(2, 3), 20).unwrap();
    assert_eq!(split.num_cores, 6);
    assert_eq!((split.group_1.num_cores(), split.group_1.units_per_core), (2, 4));
    assert_eq!((split.group_2.num_cores(), split.group_2.units_per_core), (4, 3));
    assert_eq!(split.total_units(), 20);
  }

  #[test]
  fn cores_are_column_major() {
    let split = split_work_to_cores(CoreCoord::new(3, 2), 5).unwrap();
    let cores: Vec<_> = split.assignments().iter().map(|a| a.core).collect();
    assert_eq!(
      cores,
      vec![
        CoreCoord::new(0, 0),
        CoreCoord::new(0, 1),
        CoreCoord::new(1, 0),
        CoreCoord::new(1, 1),
        CoreCoord::new(2, 0),
      ]
    );
    assert_eq!(split.all_cores.num_cores(), 5);
    assert!(split.all_cores.contains(CoreCoord::new(2, 0)));
    assert!(!split.all_cores.contains(CoreCoord::new(2, 1)));
  }

  #[test]
  fn fewer_units_than_cores() {
    let split = split_work_to_cores(CoreCoord::new(8, 8), 3).unwrap();
    assert_eq!(split.num_cores, 3);
    assert_eq!(split.group_1.units_per_core, 1);
  }

  #[test]
  fn empty_work_is_rejected() {
    assert!(matches!(split_work_to_cores(CoreCoord::new(2, 2), 0), Err(ConfigError::EmptyWork { .. })));
    assert!(matches!(split_work_to_cores(CoreCoord::new(0, 2), 4), Err(ConfigError::EmptyWork { .. })));
  }

  #[test]
  fn block_partition_on_8x8() {
    let shape = MatmulShape::new(3072, 3072, 3072);
    let p = BlockPartition::new(&shape, CoreCoord::new(8, 8), &TilingOptions::default()).unwrap();
    assert_eq!((p.per_core_m, p.per_core_n), (12, 12));
    assert_eq!(p.in0_block_w, 12);
    assert_eq!(p.num_blocks, 8);
    assert_eq!((p.num_blocks_y, p.num_blocks_x), (8, 8));
  }

  #[test]
  fn block_partition_on_2x2() {
    let shape = MatmulShape::new(3072, 3072, 3072);
    let p = BlockPartition::new(&shape, CoreCoord::new(2, 2), &TilingOptions::default()).unwrap();
    assert_eq!((p.per_core_m, p.per_core_n), (48, 48));
  }

  #[test]
  fn block_width_divisor_and_override() {
    let shape = MatmulShape::new(256, 256, 512);
    let tiling = TilingOptions {
      in0_block_w_div: 2,
      ..TilingOptions::default()
    };
    let p = BlockPartition::new(&shape, CoreCoord::new(2, 2), &tiling).unwrap();
    assert_eq!(p.in0_block_w, 4);
    assert_eq!(p.num_blocks, 4);

    let tiling = TilingOptions {
      in0_block_w: Some(3),
      ..TilingOptions::default()
    };
    assert_eq!(
      BlockPartition::new(&shape, CoreCoord::new(2, 2), &tiling).unwrap_err(),
      ConfigError::InvalidBlockWidth { in0_block_w: 3, kt: 16 }
    );
  }

  #[test]
  fn inexact_rows_are_rejected() {
    let shape = MatmulShape::new(96, 256, 256);
    assert!(matches!(
      BlockPartition::new(&shape, CoreCoord::new(2, 2), &TilingOptions::default()),
      Err(ConfigError::InexactBlockDivision { .. })
    ));
  }

  #[test]
  fn k_narrower_than_grid_has_no_block_width() {
    let shape = MatmulShape::new(128, 128, 32);
    assert!(matches!(
      BlockPartition::new(&shape, CoreCoord::new(4, 4), &TilingOptions::default()),
      Err(ConfigError::InvalidBlockWidth { in0_block_w: 0, .. })
    ));
  }
}
