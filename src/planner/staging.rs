use super::coord::CoreRangeSet;
use super::partition::BlockPartition;
use super::program::CircularBufferConfig;
use super::shape::DataFormat;
use crate::error::CapacityError;

pub const CB_IN0: u8 = 0;
pub const CB_IN1: u8 = 1;
pub const CB_OUT: u8 = 16;
/// Partial-sum buffer, aliased onto the output buffer space.
pub const CB_INTERM: u8 = 24;

/// Default L1 budget for staging buffers (1464 KiB).
pub const DEFAULT_L1_SIZE: u64 = 1_499_136;

/// Tiles per operand buffer in the interleaved variants.
const INTERLEAVED_CB_TILES: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CbSize {
  pub num_tiles: u32,
  pub bytes: u64,
}

impl CbSize {
  fn tiles(num_tiles: u32, tile_size: u32) -> Self {
    Self {
      num_tiles,
      bytes: num_tiles as u64 * tile_size as u64,
    }
  }
}

/// Circular buffer sizes of one core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StagingPlan {
  pub tile_size: u32,
  pub in0: CbSize,
  pub in1: CbSize,
  pub out: CbSize,
}

impl StagingPlan {
  /// Operand buffers hold two block slices, the output holds one whole block.
  pub fn blocked(partition: &BlockPartition, data_format: DataFormat) -> Self {
    let tile_size = data_format.tile_size();
    Self {
      tile_size,
      in0: CbSize::tiles(2 * partition.in0_block_tiles(), tile_size),
      in1: CbSize::tiles(2 * partition.in1_block_tiles(), tile_size),
      out: CbSize::tiles(partition.out_block_tiles(), tile_size),
    }
  }

  pub fn interleaved(data_format: DataFormat) -> Self {
    let tile_size = data_format.tile_size();
    let cb = CbSize::tiles(INTERLEAVED_CB_TILES, tile_size);
    Self {
      tile_size,
      in0: cb,
      in1: cb,
      out: cb,
    }
  }

  pub fn total_bytes(&self) -> u64 {
    self.in0.bytes + self.in1.bytes + self.out.bytes
  }

  pub fn check_capacity(&self, l1_size: u64) -> Result<(), CapacityError> {
    let required = self.total_bytes();
    if required > l1_size {
      return Err(CapacityError {
        required,
        available: l1_size,
      });
    }
    Ok(())
  }

  /// Buffer declarations over `cores`. The intermediate buffer shares the output space.
  pub fn circular_buffers(&self, cores: &CoreRangeSet, data_format: DataFormat, with_interm: bool) -> Vec<CircularBufferConfig> {
    let out_indices = if with_interm { vec![CB_OUT, CB_INTERM] } else { vec![CB_OUT] };
    vec![
      CircularBufferConfig::new(vec![CB_IN0], self.in0, self.tile_size, data_format, cores.clone()),
      CircularBufferConfig::new(vec![CB_IN1], self.in1, self.tile_size, data_format, cores.clone()),
      CircularBufferConfig::new(out_indices, self.out, self.tile_size, data_format, cores.clone()),
    ]
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::planner::coord::CoreCoord;
  use crate::planner::shape::{MatmulShape, TilingOptions};

  fn partition(size: u32, cols: u32, rows: u32) -> BlockPartition {
    BlockPartition::new(&MatmulShape::new(size, size, size), CoreCoord::new(cols, rows), &TilingOptions::default()).unwrap()
  }

  #[test]
  fn blocked_sizes_double_operands_only() {
    let plan = StagingPlan::blocked(&partition(3072, 8, 8), DataFormat::Float16B);
    assert_eq!(plan.in0.num_tiles, 2 * 12 * 12);
    assert_eq!(plan.in1.num_tiles, 2 * 12 * 12);
    assert_eq!(plan.out.num_tiles, 12 * 12);
    assert_eq!(plan.total_bytes(), (288 + 288 + 144) * 2048);
    assert!(plan.check_capacity(DEFAULT_L1_SIZE).is_ok());
  }

  #[test]
  fn oversized_blocks_overflow_l1() {
    let plan = StagingPlan::blocked(&partition(3072, 2, 2), DataFormat::Float16B);
    let err = plan.check_capacity(DEFAULT_L1_SIZE).unwrap_err();
    assert_eq!(err.available, DEFAULT_L1_SIZE);
    assert_eq!(err.required, (2 * 48 * 48 * 2 + 48 * 48) as u64 * 2048);
  }

  #[test]
  fn interleaved_buffers_hold_two_tiles() {
    let plan = StagingPlan::interleaved(DataFormat::Bfp8B);
    assert_eq!(plan.total_bytes(), 6 * 1088);
  }

  #[test]
  fn output_buffer_aliases_interm() {
    let plan = StagingPlan::blocked(&partition(256, 2, 2), DataFormat::Float32);
    let cores = CoreRangeSet::default();
    let cbs = plan.circular_buffers(&cores, DataFormat::Float32, true);
    assert_eq!(cbs[2].indices, vec![CB_OUT, CB_INTERM]);
    assert_eq!(cbs[2].total_size, plan.out.bytes);
  }
}
