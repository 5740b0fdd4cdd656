// Compute tasks: tile multiply-accumulate from the operand buffers into the output buffer

use sim::utils::errors::SimulationError;

use super::dram::Tile;
use super::task::{cb_fault, CoreCtx, TaskPoll};
use crate::planner::args::{LargeBlockComputeArgs, TileBmmComputeArgs};
use crate::planner::shape::{TILE_HEIGHT, TILE_HW, TILE_WIDTH};
use crate::planner::staging::{CB_IN0, CB_IN1, CB_OUT};
use crate::simulator::sim::CoreAction;

/// `acc += a * b` on row-major 32x32 tiles.
pub fn tile_matmul_acc(acc: &mut [f32], a: &[f32], b: &[f32]) {
  let (h, w) = (TILE_HEIGHT as usize, TILE_WIDTH as usize);
  for r in 0..h {
    let a_row = &a[r * w..(r + 1) * w];
    let acc_row = &mut acc[r * w..(r + 1) * w];
    for (k, &av) in a_row.iter().enumerate() {
      if av == 0.0 {
        continue;
      }
      let b_row = &b[k * w..(k + 1) * w];
      for (c, &bv) in b_row.iter().enumerate() {
        acc_row[c] += av * bv;
      }
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockPhase {
  Accumulate,
  /// Packing sub-block `n` of the finished output block.
  Pack(u32),
}

/// Blocked compute: accumulates every reduction step of a batch, then packs
/// the per-core output block sub-block by sub-block.
#[derive(Debug, Clone)]
pub struct LargeBlockCompute {
  args: LargeBlockComputeArgs,
  batch: u32,
  block: u32,
  phase: BlockPhase,
  /// Multiply of the front blocks issued; they pop once it retires.
  pending: bool,
  acc: Vec<Tile>,
}

impl LargeBlockCompute {
  pub fn new(args: LargeBlockComputeArgs) -> Self {
    let tiles = (args.block_h() * args.in1_per_core_w) as usize;
    Self {
      args,
      batch: 0,
      block: 0,
      phase: BlockPhase::Accumulate,
      pending: false,
      acc: vec![vec![0.0; TILE_HW]; tiles],
    }
  }

  fn poll(&mut self, ctx: &mut CoreCtx<'_>) -> Result<TaskPoll, SimulationError> {
    if self.batch == self.args.batch {
      return Ok(TaskPoll::Done);
    }
    let a = &self.args;
    let (block_h, block_w, inner) = (a.block_h(), a.in1_per_core_w, a.in0_block_w);
    match self.phase {
      BlockPhase::Accumulate if self.pending => {
        ctx.cb(CB_IN0)?.pop_front(a.in0_block_num_tiles);
        ctx.cb(CB_IN1)?.pop_front(a.in1_block_num_tiles);
        self.pending = false;
        self.block += 1;
        if self.block == a.num_blocks {
          self.block = 0;
          self.phase = BlockPhase::Pack(0);
        }
        Ok(TaskPoll::Progress)
      },
      BlockPhase::Accumulate => {
        if !ctx.cb(CB_IN0)?.wait_front(a.in0_block_num_tiles) || !ctx.cb(CB_IN1)?.wait_front(a.in1_block_num_tiles) {
          return Ok(TaskPoll::Blocked);
        }
        let (in0, in1): (Vec<&Tile>, Vec<&Tile>) = match (ctx.cbs.get(CB_IN0), ctx.cbs.get(CB_IN1)) {
          (Some(c0), Some(c1)) => (
            c0.front(a.in0_block_num_tiles).collect(),
            c1.front(a.in1_block_num_tiles).collect(),
          ),
          _ => return Err(ctx.fail("operand buffers missing".to_string())),
        };
        for m in 0..block_h {
          for n in 0..block_w {
            let acc = &mut self.acc[(m * block_w + n) as usize];
            for k in 0..inner {
              tile_matmul_acc(acc, in0[(m * inner + k) as usize], in1[(k * block_w + n) as usize]);
            }
          }
        }
        let mults = (block_h * block_w * inner) as u64;
        ctx.stats.tiles_multiplied += mults;
        self.pending = true;
        Ok(TaskPoll::Busy(ctx.timing.math_cycles_per_tile * mults as f64))
      },
      BlockPhase::Pack(sb) => {
        let (sh, sw) = (a.out_subblock_h, a.out_subblock_w);
        if !ctx.cb(CB_OUT)?.reserve_back(a.out_subblock_num_tiles) {
          return Ok(TaskPoll::Blocked);
        }
        let (sbh, sbw) = (sb / a.in1_num_subblocks, sb % a.in1_num_subblocks);
        let mut tiles = Vec::with_capacity(a.out_subblock_num_tiles as usize);
        for h in 0..sh {
          for w in 0..sw {
            let idx = ((sbh * sh + h) * block_w + sbw * sw + w) as usize;
            tiles.push(std::mem::replace(&mut self.acc[idx], vec![0.0; TILE_HW]));
          }
        }
        let out = ctx.cb(CB_OUT)?;
        let r = out.write(tiles).and_then(|_| out.push_back(a.out_subblock_num_tiles));
        cb_fault(ctx, r)?;
        let next = sb + 1;
        if next == a.in0_num_subblocks * a.in1_num_subblocks {
          ctx.record(CoreAction::PackBlock, format!("batch={}", self.batch));
          self.batch += 1;
          self.phase = BlockPhase::Accumulate;
        } else {
          self.phase = BlockPhase::Pack(next);
        }
        Ok(TaskPoll::Progress)
      },
    }
  }
}

/// Tile-at-a-time compute: Kt multiply-accumulates per output tile.
#[derive(Debug, Clone)]
pub struct TileBmmCompute {
  args: TileBmmComputeArgs,
  tile: u32,
  kt: u32,
  pending: bool,
  acc: Tile,
}

impl TileBmmCompute {
  pub fn new(args: TileBmmComputeArgs) -> Self {
    Self {
      args,
      tile: 0,
      kt: 0,
      pending: false,
      acc: vec![0.0; TILE_HW],
    }
  }

  fn poll(&mut self, ctx: &mut CoreCtx<'_>) -> Result<TaskPoll, SimulationError> {
    if self.tile == self.args.output_tiles() || self.args.kt == 0 {
      return Ok(TaskPoll::Done);
    }
    if self.pending {
      ctx.cb(CB_IN0)?.pop_front(1);
      ctx.cb(CB_IN1)?.pop_front(1);
      self.pending = false;
      self.kt += 1;
      return Ok(TaskPoll::Progress);
    }
    if self.kt == self.args.kt {
      if !ctx.cb(CB_OUT)?.reserve_back(1) {
        return Ok(TaskPoll::Blocked);
      }
      let tile = std::mem::replace(&mut self.acc, vec![0.0; TILE_HW]);
      let out = ctx.cb(CB_OUT)?;
      let r = out.write(vec![tile]).and_then(|_| out.push_back(1));
      cb_fault(ctx, r)?;
      self.kt = 0;
      self.tile += 1;
      return Ok(TaskPoll::Progress);
    }
    if !ctx.cb(CB_IN0)?.wait_front(1) || !ctx.cb(CB_IN1)?.wait_front(1) {
      return Ok(TaskPoll::Blocked);
    }
    let (a, b) = match (ctx.cbs.get(CB_IN0), ctx.cbs.get(CB_IN1)) {
      (Some(a), Some(b)) => (a.front(1).next(), b.front(1).next()),
      _ => (None, None),
    };
    match (a, b) {
      (Some(a), Some(b)) => tile_matmul_acc(&mut self.acc, a, b),
      _ => return Err(ctx.fail("operand buffers empty after wait".to_string())),
    }
    ctx.stats.tiles_multiplied += 1;
    self.pending = true;
    Ok(TaskPoll::Busy(ctx.timing.math_cycles_per_tile))
  }
}

#[derive(Debug, Clone)]
pub enum ComputeTask {
  LargeBlock(LargeBlockCompute),
  TileBmm(TileBmmCompute),
}

impl ComputeTask {
  pub fn poll(&mut self, ctx: &mut CoreCtx<'_>) -> Result<TaskPoll, SimulationError> {
    match self {
      ComputeTask::LargeBlock(c) => c.poll(ctx),
      ComputeTask::TileBmm(c) => c.poll(ctx),
    }
  }

  pub fn status(&self) -> String {
    match self {
      ComputeTask::LargeBlock(c) => format!("batch={} block={} {:?}", c.batch, c.block, c.phase),
      ComputeTask::TileBmm(c) => format!("tile={} kt={}", c.tile, c.kt),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn tile_product_matches_naive() {
    let a: Vec<f32> = (0..TILE_HW).map(|i| (i % 7) as f32 - 3.0).collect();
    let b: Vec<f32> = (0..TILE_HW).map(|i| (i % 5) as f32 * 0.5).collect();
    let mut acc = vec![1.0; TILE_HW];
    tile_matmul_acc(&mut acc, &a, &b);
    let w = TILE_WIDTH as usize;
    for (r, c) in [(0, 0), (5, 31), (31, 17)] {
      let mut want = 1.0;
      for k in 0..w {
        want += a[r * w + k] * b[k * w + c];
      }
      assert!((acc[r * w + c] - want).abs() < 1e-4);
    }
  }
}
