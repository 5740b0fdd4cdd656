//! Flat argument lists handed to the reader, compute and writer tasks.
//!
//! Every struct serializes to the exact word order its task consumes, and
//! parses back from it on the device side. Stride formulas must line up
//! with the tiled DRAM layout: a mismatch gives wrong numbers, not a fault.

use super::coord::CoreCoord;
use super::partition::BlockPartition;
use super::shape::MatmulShape;
use super::topology::GridTopology;
use crate::arch::mesh::semaphore::SemaphorePair;
use crate::error::ConfigError;

/// DRAM base addresses of the three operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferAddresses {
  pub src0: u32,
  pub src1: u32,
  pub dst: u32,
}

/// The four per-program semaphores, one pair per multicast axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McastSemaphoreIds {
  pub in0: SemaphorePair,
  pub in1: SemaphorePair,
}

struct ArgCursor<'a> {
  args: &'a [u32],
  pos: usize,
}

impl<'a> ArgCursor<'a> {
  fn new(args: &'a [u32], task: &str, expected: usize) -> Result<Self, ConfigError> {
    if args.len() != expected {
      return Err(ConfigError::InvalidParameter(format!(
        "{} takes {} args, got {}",
        task,
        expected,
        args.len()
      )));
    }
    Ok(Self { args, pos: 0 })
  }

  fn next(&mut self) -> u32 {
    let v = self.args[self.pos];
    self.pos += 1;
    v
  }

  fn coord(&mut self) -> CoreCoord {
    let x = self.next();
    CoreCoord::new(x, self.next())
  }
}

/// Multicast parameters of one axis, from the point of view of one core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McastLink {
  /// Far corner of the destination rectangle (physical).
  pub dest_start: CoreCoord,
  /// Near corner of the destination rectangle (physical).
  pub dest_end: CoreCoord,
  pub num_dests: u32,
  /// Group sender (physical).
  pub sender: CoreCoord,
  pub semaphores: SemaphorePair,
}

impl McastLink {
  fn push(&self, out: &mut Vec<u32>) {
    out.extend_from_slice(&[
      self.dest_start.x,
      self.dest_start.y,
      self.dest_end.x,
      self.dest_end.y,
      self.num_dests,
      self.sender.x,
      self.sender.y,
      self.semaphores.sender,
      self.semaphores.receiver,
    ]);
  }

  fn read(cur: &mut ArgCursor<'_>) -> Self {
    Self {
      dest_start: cur.coord(),
      dest_end: cur.coord(),
      num_dests: cur.next(),
      sender: cur.coord(),
      semaphores: SemaphorePair {
        sender: cur.next(),
        receiver: cur.next(),
      },
    }
  }

  /// Physical cores covered by the destination rectangle.
  pub fn destinations(&self) -> Vec<CoreCoord> {
    if self.num_dests == 0 {
      return Vec::new();
    }
    let (x0, x1) = (self.dest_start.x.min(self.dest_end.x), self.dest_start.x.max(self.dest_end.x));
    let (y0, y1) = (self.dest_start.y.min(self.dest_end.y), self.dest_start.y.max(self.dest_end.y));
    let mut cores = Vec::new();
    for y in y0..=y1 {
      for x in x0..=x1 {
        cores.push(CoreCoord::new(x, y));
      }
    }
    cores
  }
}

/// Tile walk over one operand in DRAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OperandWalk {
  pub addr: u32,
  pub start_tile_id: u32,
  pub stride_w: u32,
  pub stride_h: u32,
  pub next_block_stride: u32,
  pub block_w: u32,
  pub block_h: u32,
  pub block_num_tiles: u32,
}

impl OperandWalk {
  fn push(&self, out: &mut Vec<u32>) {
    out.extend_from_slice(&[
      self.addr,
      self.start_tile_id,
      self.stride_w,
      self.stride_h,
      self.next_block_stride,
      self.block_w,
      self.block_h,
      self.block_num_tiles,
    ]);
  }

  fn read(cur: &mut ArgCursor<'_>) -> Self {
    Self {
      addr: cur.next(),
      start_tile_id: cur.next(),
      stride_w: cur.next(),
      stride_h: cur.next(),
      next_block_stride: cur.next(),
      block_w: cur.next(),
      block_h: cur.next(),
      block_num_tiles: cur.next(),
    }
  }

  /// Tile ids of reduction step `block`, row-major inside the block.
  pub fn block_tiles(&self, batch_offset: u32, block: u32) -> Vec<u32> {
    let base = batch_offset + self.start_tile_id + block * self.next_block_stride;
    let mut ids = Vec::with_capacity(self.block_num_tiles as usize);
    for h in 0..self.block_h {
      for w in 0..self.block_w {
        ids.push(base + h * self.stride_h + w * self.stride_w);
      }
    }
    ids
  }
}

/// Runtime args of the blocked reader (all four roles share the layout).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McastReaderArgs {
  pub in0: OperandWalk,
  pub in1: OperandWalk,
  pub num_blocks: u32,
  pub in0_mcast: McastLink,
  pub in1_mcast: McastLink,
  pub mt_kt: u32,
  pub kt_nt: u32,
  pub batch: u32,
  pub bcast_b: u32,
}

impl McastReaderArgs {
  pub const LEN: usize = 39;

  pub fn to_args(&self) -> Vec<u32> {
    let mut out = Vec::with_capacity(Self::LEN);
    self.in0.push(&mut out);
    self.in1.push(&mut out);
    out.push(self.num_blocks);
    self.in0_mcast.push(&mut out);
    self.in1_mcast.push(&mut out);
    out.extend_from_slice(&[self.mt_kt, self.kt_nt, self.batch, self.bcast_b]);
    out
  }

  pub fn from_args(args: &[u32]) -> Result<Self, ConfigError> {
    let mut cur = ArgCursor::new(args, "mcast reader", Self::LEN)?;
    Ok(Self {
      in0: OperandWalk::read(&mut cur),
      in1: OperandWalk::read(&mut cur),
      num_blocks: cur.next(),
      in0_mcast: McastLink::read(&mut cur),
      in1_mcast: McastLink::read(&mut cur),
      mt_kt: cur.next(),
      kt_nt: cur.next(),
      batch: cur.next(),
      bcast_b: cur.next(),
    })
  }
}

/// Runtime args of the sub-block ordered writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileLayoutWriterArgs {
  pub out_addr: u32,
  pub out_start_tile_id: u32,
  pub stride_w: u32,
  pub stride_h: u32,
  pub next_subblock_stride_w: u32,
  pub next_subblock_stride_h: u32,
  pub subblock_w: u32,
  pub subblock_h: u32,
  pub subblock_tiles: u32,
  pub num_subblocks_w: u32,
  pub num_subblocks_h: u32,
  pub mt_nt: u32,
  pub batch: u32,
}

impl TileLayoutWriterArgs {
  pub const LEN: usize = 13;

  pub fn to_args(&self) -> Vec<u32> {
    vec![
      self.out_addr,
      self.out_start_tile_id,
      self.stride_w,
      self.stride_h,
      self.next_subblock_stride_w,
      self.next_subblock_stride_h,
      self.subblock_w,
      self.subblock_h,
      self.subblock_tiles,
      self.num_subblocks_w,
      self.num_subblocks_h,
      self.mt_nt,
      self.batch,
    ]
  }

  pub fn from_args(args: &[u32]) -> Result<Self, ConfigError> {
    let mut cur = ArgCursor::new(args, "tile layout writer", Self::LEN)?;
    Ok(Self {
      out_addr: cur.next(),
      out_start_tile_id: cur.next(),
      stride_w: cur.next(),
      stride_h: cur.next(),
      next_subblock_stride_w: cur.next(),
      next_subblock_stride_h: cur.next(),
      subblock_w: cur.next(),
      subblock_h: cur.next(),
      subblock_tiles: cur.next(),
      num_subblocks_w: cur.next(),
      num_subblocks_h: cur.next(),
      mt_nt: cur.next(),
      batch: cur.next(),
    })
  }

  /// Output tile ids of sub-block `(sbh, sbw)`, row-major inside it.
  pub fn subblock_tiles(&self, batch_offset: u32, sbh: u32, sbw: u32) -> Vec<u32> {
    let base = batch_offset + self.out_start_tile_id + sbh * self.next_subblock_stride_h + sbw * self.next_subblock_stride_w;
    let mut ids = Vec::with_capacity(self.subblock_tiles as usize);
    for h in 0..self.subblock_h {
      for w in 0..self.subblock_w {
        ids.push(base + h * self.stride_h + w * self.stride_w);
      }
    }
    ids
  }
}

/// Compile-time args of the blocked compute task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LargeBlockComputeArgs {
  pub in0_block_w: u32,
  pub in0_num_subblocks: u32,
  pub in0_block_num_tiles: u32,
  pub in0_subblock_num_tiles: u32,
  pub in1_num_subblocks: u32,
  pub in1_block_num_tiles: u32,
  pub in1_per_core_w: u32,
  pub num_blocks: u32,
  pub out_subblock_h: u32,
  pub out_subblock_w: u32,
  pub out_subblock_num_tiles: u32,
  pub batch: u32,
}

impl LargeBlockComputeArgs {
  pub const LEN: usize = 12;

  pub fn to_args(&self) -> Vec<u32> {
    vec![
      self.in0_block_w,
      self.in0_num_subblocks,
      self.in0_block_num_tiles,
      self.in0_subblock_num_tiles,
      self.in1_num_subblocks,
      self.in1_block_num_tiles,
      self.in1_per_core_w,
      self.num_blocks,
      self.out_subblock_h,
      self.out_subblock_w,
      self.out_subblock_num_tiles,
      self.batch,
    ]
  }

  pub fn from_args(args: &[u32]) -> Result<Self, ConfigError> {
    let mut cur = ArgCursor::new(args, "large block compute", Self::LEN)?;
    Ok(Self {
      in0_block_w: cur.next(),
      in0_num_subblocks: cur.next(),
      in0_block_num_tiles: cur.next(),
      in0_subblock_num_tiles: cur.next(),
      in1_num_subblocks: cur.next(),
      in1_block_num_tiles: cur.next(),
      in1_per_core_w: cur.next(),
      num_blocks: cur.next(),
      out_subblock_h: cur.next(),
      out_subblock_w: cur.next(),
      out_subblock_num_tiles: cur.next(),
      batch: cur.next(),
    })
  }

  /// Rows of tiles in the in0 block.
  pub fn block_h(&self) -> u32 {
    self.in0_num_subblocks * self.out_subblock_h
  }
}

/// Runtime args of the interleaved reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterleavedReaderArgs {
  pub src0_addr: u32,
  pub src1_addr: u32,
  pub mt: u32,
  pub kt: u32,
  pub nt: u32,
  pub mt_kt: u32,
  pub kt_nt: u32,
  pub batch: u32,
  pub bcast_b: u32,
  pub output_tile_start_id: u32,
  pub num_output_tiles: u32,
  pub mt_nt: u32,
}

impl InterleavedReaderArgs {
  pub const LEN: usize = 12;

  pub fn to_args(&self) -> Vec<u32> {
    vec![
      self.src0_addr,
      self.src1_addr,
      self.mt,
      self.kt,
      self.nt,
      self.mt_kt,
      self.kt_nt,
      self.batch,
      self.bcast_b,
      self.output_tile_start_id,
      self.num_output_tiles,
      self.mt_nt,
    ]
  }

  pub fn from_args(args: &[u32]) -> Result<Self, ConfigError> {
    let mut cur = ArgCursor::new(args, "interleaved reader", Self::LEN)?;
    Ok(Self {
      src0_addr: cur.next(),
      src1_addr: cur.next(),
      mt: cur.next(),
      kt: cur.next(),
      nt: cur.next(),
      mt_kt: cur.next(),
      kt_nt: cur.next(),
      batch: cur.next(),
      bcast_b: cur.next(),
      output_tile_start_id: cur.next(),
      num_output_tiles: cur.next(),
      mt_nt: cur.next(),
    })
  }

  /// A and B tile ids feeding reduction step `kt` of output tile `out_tile`.
  pub fn operand_tiles(&self, out_tile: u32, kt: u32) -> (u32, u32) {
    let b = out_tile / self.mt_nt;
    let within = out_tile % self.mt_nt;
    let (m, n) = (within / self.nt, within % self.nt);
    let b_base = if self.bcast_b != 0 { 0 } else { b * self.kt_nt };
    (b * self.mt_kt + m * self.kt + kt, b_base + kt * self.nt + n)
  }
}

/// Runtime args of the interleaved writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterleavedWriterArgs {
  pub dst_addr: u32,
  pub num_tiles: u32,
  pub start_id: u32,
}

impl InterleavedWriterArgs {
  pub const LEN: usize = 3;

  pub fn to_args(&self) -> Vec<u32> {
    vec![self.dst_addr, self.num_tiles, self.start_id]
  }

  pub fn from_args(args: &[u32]) -> Result<Self, ConfigError> {
    let mut cur = ArgCursor::new(args, "interleaved writer", Self::LEN)?;
    Ok(Self {
      dst_addr: cur.next(),
      num_tiles: cur.next(),
      start_id: cur.next(),
    })
  }
}

/// Compile-time args of the tile-at-a-time compute task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileBmmComputeArgs {
  pub batch: u32,
  pub mt: u32,
  pub kt: u32,
  pub nt: u32,
}

impl TileBmmComputeArgs {
  pub const LEN: usize = 4;

  pub fn to_args(&self) -> Vec<u32> {
    vec![self.batch, self.mt, self.kt, self.nt]
  }

  pub fn from_args(args: &[u32]) -> Result<Self, ConfigError> {
    let mut cur = ArgCursor::new(args, "tile bmm compute", Self::LEN)?;
    Ok(Self {
      batch: cur.next(),
      mt: cur.next(),
      kt: cur.next(),
      nt: cur.next(),
    })
  }

  pub fn output_tiles(&self) -> u32 {
    self.batch * self.mt * self.nt
  }
}

/// Reader args for `core` of the blocked grid. `physical` maps logical to NoC coordinates.
pub fn mcast_reader_args(
  shape: &MatmulShape,
  partition: &BlockPartition,
  topology: &GridTopology,
  sems: &McastSemaphoreIds,
  addrs: &BufferAddresses,
  core: CoreCoord,
  physical: impl Fn(CoreCoord) -> CoreCoord,
) -> McastReaderArgs {
  let (kt, nt, mt) = (shape.kt(), shape.nt(), shape.mt());
  let (core_idx_x, core_idx_y) = topology.core_index(core);
  let b = topology.boundary(core);
  let w = partition.in0_block_w;

  McastReaderArgs {
    in0: OperandWalk {
      addr: addrs.src0,
      start_tile_id: kt * partition.per_core_m * core_idx_y,
      stride_w: 1,
      stride_h: kt,
      next_block_stride: w,
      block_w: w,
      block_h: partition.per_core_m,
      block_num_tiles: w * partition.per_core_m,
    },
    in1: OperandWalk {
      addr: addrs.src1,
      start_tile_id: partition.per_core_n * core_idx_x,
      stride_w: 1,
      stride_h: nt,
      next_block_stride: w * nt,
      block_w: partition.per_core_n,
      block_h: w,
      block_num_tiles: partition.per_core_n * w,
    },
    num_blocks: kt / w,
    in0_mcast: McastLink {
      dest_start: physical(b.right),
      dest_end: physical(b.left_plus_one),
      num_dests: topology.num_cores_c - 1,
      sender: physical(b.left),
      semaphores: sems.in0,
    },
    in1_mcast: McastLink {
      dest_start: physical(b.bottom),
      dest_end: physical(b.top_plus_one),
      num_dests: topology.num_cores_r - 1,
      sender: physical(b.top),
      semaphores: sems.in1,
    },
    mt_kt: mt * kt,
    kt_nt: kt * nt,
    batch: shape.batch,
    bcast_b: shape.bcast_batch as u32,
  }
}

pub fn tile_layout_writer_args(
  shape: &MatmulShape,
  partition: &BlockPartition,
  subblock: (u32, u32),
  topology: &GridTopology,
  dst_addr: u32,
  core: CoreCoord,
) -> TileLayoutWriterArgs {
  let (out_subblock_h, out_subblock_w) = subblock;
  let (core_idx_x, core_idx_y) = topology.core_index(core);
  let nt = shape.nt();

  TileLayoutWriterArgs {
    out_addr: dst_addr,
    out_start_tile_id: core_idx_x * partition.per_core_n + core_idx_y * partition.per_core_m * nt,
    stride_w: 1,
    stride_h: nt,
    next_subblock_stride_w: out_subblock_w,
    next_subblock_stride_h: out_subblock_h * nt,
    subblock_w: out_subblock_w,
    subblock_h: out_subblock_h,
    subblock_tiles: out_subblock_w * out_subblock_h,
    num_subblocks_w: partition.per_core_n / out_subblock_w,
    num_subblocks_h: partition.per_core_m / out_subblock_h,
    mt_nt: shape.mt() * nt,
    batch: shape.batch,
  }
}

pub fn large_block_compute_args(shape: &MatmulShape, partition: &BlockPartition, subblock: (u32, u32)) -> LargeBlockComputeArgs {
  let (out_subblock_h, out_subblock_w) = subblock;
  let in0_block_w = partition.in0_block_w;
  let in0_num_subblocks = partition.per_core_m / out_subblock_h;
  let in1_num_subblocks = partition.per_core_n / out_subblock_w;

  LargeBlockComputeArgs {
    in0_block_w,
    in0_num_subblocks,
    in0_block_num_tiles: out_subblock_h * in0_block_w * in0_num_subblocks,
    in0_subblock_num_tiles: out_subblock_h * in0_block_w,
    in1_num_subblocks,
    in1_block_num_tiles: out_subblock_w * in0_block_w * in1_num_subblocks,
    in1_per_core_w: out_subblock_w * in1_num_subblocks,
    num_blocks: partition.num_blocks,
    out_subblock_h,
    out_subblock_w,
    out_subblock_num_tiles: out_subblock_h * out_subblock_w,
    batch: shape.batch,
  }
}

pub fn interleaved_reader_args(shape: &MatmulShape, addrs: &BufferAddresses, start: u32, count: u32) -> InterleavedReaderArgs {
  let (mt, kt, nt) = (shape.mt(), shape.kt(), shape.nt());
  InterleavedReaderArgs {
    src0_addr: addrs.src0,
    src1_addr: addrs.src1,
    mt,
    kt,
    nt,
    mt_kt: mt * kt,
    kt_nt: kt * nt,
    batch: shape.batch,
    bcast_b: shape.bcast_batch as u32,
    output_tile_start_id: start,
    num_output_tiles: count,
    mt_nt: mt * nt,
  }
}

pub fn interleaved_writer_args(dst_addr: u32, start: u32, count: u32) -> InterleavedWriterArgs {
  InterleavedWriterArgs {
    dst_addr,
    num_tiles: count,
    start_id: start,
  }
}

/// One flattened batch of `num_tiles` output rows, each one tile wide.
pub fn tile_bmm_compute_args(shape: &MatmulShape, num_tiles: u32) -> TileBmmComputeArgs {
  TileBmmComputeArgs {
    batch: 1,
    mt: 1,
    kt: shape.kt(),
    nt: num_tiles,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::planner::shape::TilingOptions;

  const SEMS: McastSemaphoreIds = McastSemaphoreIds {
    in0: SemaphorePair { sender: 0, receiver: 1 },
    in1: SemaphorePair { sender: 2, receiver: 3 },
  };

  fn offset(c: CoreCoord) -> CoreCoord {
    CoreCoord::new(c.x + 1, c.y + 1)
  }

  #[test]
  fn reader_args_layout() {
    let shape = MatmulShape::new(256, 512, 256).with_batch(2, true);
    let grid = CoreCoord::new(4, 2);
    let partition = BlockPartition::new(&shape, grid, &TilingOptions::default()).unwrap();
    let topo = GridTopology::new(CoreCoord::new(8, 8), CoreCoord::default(), 2, 4).unwrap();
    let addrs = BufferAddresses { src0: 0x1000, src1: 0x2000, dst: 0x3000 };
    let args = mcast_reader_args(&shape, &partition, &topo, &SEMS, &addrs, CoreCoord::new(2, 1), offset);
    let words = args.to_args();
    assert_eq!(words.len(), McastReaderArgs::LEN);
    // per_core_m = 4, per_core_n = 4, in0_block_w = 8 / 4 = 2
    assert_eq!(&words[0..8], &[0x1000, 8 * 4 * 1, 1, 8, 2, 2, 4, 8]);
    assert_eq!(&words[8..16], &[0x2000, 4 * 2, 1, 16, 2 * 16, 4, 2, 8]);
    assert_eq!(words[16], 4);
    assert_eq!(&words[17..26], &[4, 2, 2, 2, 3, 1, 2, 0, 1]);
    assert_eq!(&words[26..35], &[3, 2, 3, 2, 1, 3, 1, 2, 3]);
    assert_eq!(&words[35..39], &[8 * 8, 8 * 16, 2, 1]);
    assert_eq!(McastReaderArgs::from_args(&words).unwrap(), args);
  }

  #[test]
  fn writer_args_layout() {
    let shape = MatmulShape::new(256, 512, 256);
    let partition = BlockPartition::new(&shape, CoreCoord::new(4, 2), &TilingOptions::default()).unwrap();
    let topo = GridTopology::new(CoreCoord::new(8, 8), CoreCoord::default(), 2, 4).unwrap();
    let args = tile_layout_writer_args(&shape, &partition, (4, 2), &topo, 0x3000, CoreCoord::new(3, 1));
    assert_eq!(args.to_args(), vec![0x3000, 3 * 4 + 1 * 4 * 16, 1, 16, 2, 4 * 16, 2, 4, 8, 2, 1, 8 * 16, 1]);
  }

  #[test]
  fn compute_args_layout() {
    let shape = MatmulShape::new(512, 512, 512);
    let partition = BlockPartition::new(&shape, CoreCoord::new(1, 1), &TilingOptions::default()).unwrap();
    let args = large_block_compute_args(&shape, &partition, (4, 2));
    assert_eq!(args.to_args(), vec![16, 4, 256, 64, 8, 256, 16, 1, 4, 2, 8, 1]);
    assert_eq!(args.block_h(), 16);
  }

  #[test]
  fn interleaved_reader_maps_output_to_operands() {
    let shape = MatmulShape::new(64, 96, 128).with_batch(2, false);
    let args = interleaved_reader_args(&shape, &BufferAddresses::default(), 0, 12);
    // tile 8 is batch 1, row 0, col 2
    assert_eq!(args.operand_tiles(8, 3), (8 + 3, 12 + 3 * 3 + 2));
    let bcast = interleaved_reader_args(&shape.with_batch(2, true), &BufferAddresses::default(), 0, 12);
    assert_eq!(bcast.operand_tiles(8, 3).1, 3 * 3 + 2);
  }

  #[test]
  fn short_arg_list_is_rejected() {
    assert!(McastReaderArgs::from_args(&[0; 38]).is_err());
    assert!(InterleavedWriterArgs::from_args(&[0; 4]).is_err());
  }

  #[test]
  fn mcast_destinations_span_rectangle() {
    let link = McastLink {
      dest_start: CoreCoord::new(4, 2),
      dest_end: CoreCoord::new(2, 2),
      num_dests: 3,
      sender: CoreCoord::new(1, 2),
      semaphores: SemaphorePair { sender: 0, receiver: 1 },
    };
    assert_eq!(link.destinations(), vec![CoreCoord::new(2, 2), CoreCoord::new(3, 2), CoreCoord::new(4, 2)]);
  }
}
