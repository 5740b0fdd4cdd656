// Writer tasks: drain the output buffer into DRAM

use sim::utils::errors::SimulationError;

use super::task::{CoreCtx, TaskPoll};
use crate::planner::args::{InterleavedWriterArgs, TileLayoutWriterArgs};
use crate::planner::staging::CB_OUT;

/// Writes each packed sub-block to its place in the tiled output.
#[derive(Debug, Clone)]
pub struct TileLayoutWriter {
  args: TileLayoutWriterArgs,
  batch: u32,
  subblock: u32,
  pending: bool,
}

impl TileLayoutWriter {
  pub fn new(args: TileLayoutWriterArgs) -> Self {
    Self {
      args,
      batch: 0,
      subblock: 0,
      pending: false,
    }
  }

  fn poll(&mut self, ctx: &mut CoreCtx<'_>) -> Result<TaskPoll, SimulationError> {
    let a = &self.args;
    let per_batch = a.num_subblocks_h * a.num_subblocks_w;
    if self.batch == a.batch || per_batch == 0 {
      return Ok(TaskPoll::Done);
    }
    if self.pending {
      self.pending = false;
      self.subblock += 1;
      if self.subblock == per_batch {
        self.subblock = 0;
        self.batch += 1;
      }
      return Ok(TaskPoll::Progress);
    }
    if !ctx.cb(CB_OUT)?.wait_front(a.subblock_tiles) {
      return Ok(TaskPoll::Blocked);
    }
    let tiles = ctx.cb(CB_OUT)?.pop_front(a.subblock_tiles);
    let (sbh, sbw) = (self.subblock / a.num_subblocks_w, self.subblock % a.num_subblocks_w);
    let ids = a.subblock_tiles(self.batch * a.mt_nt, sbh, sbw);
    ctx.write_tiles(a.out_addr, &ids, tiles)?;
    self.pending = true;
    Ok(TaskPoll::Busy(ctx.timing.dram_cycles_per_tile * ids.len() as f64))
  }
}

/// Writes a contiguous run of output tiles, one at a time.
#[derive(Debug, Clone)]
pub struct InterleavedWriter {
  args: InterleavedWriterArgs,
  written: u32,
}

impl InterleavedWriter {
  pub fn new(args: InterleavedWriterArgs) -> Self {
    Self { args, written: 0 }
  }

  fn poll(&mut self, ctx: &mut CoreCtx<'_>) -> Result<TaskPoll, SimulationError> {
    if self.written == self.args.num_tiles {
      return Ok(TaskPoll::Done);
    }
    if !ctx.cb(CB_OUT)?.wait_front(1) {
      return Ok(TaskPoll::Blocked);
    }
    let tiles = ctx.cb(CB_OUT)?.pop_front(1);
    ctx.write_tiles(self.args.dst_addr, &[self.args.start_id + self.written], tiles)?;
    self.written += 1;
    Ok(TaskPoll::Busy(ctx.timing.dram_cycles_per_tile))
  }
}

#[derive(Debug, Clone)]
pub enum WriterTask {
  TileLayout(TileLayoutWriter),
  Interleaved(InterleavedWriter),
}

impl WriterTask {
  pub fn poll(&mut self, ctx: &mut CoreCtx<'_>) -> Result<TaskPoll, SimulationError> {
    match self {
      WriterTask::TileLayout(w) => w.poll(ctx),
      WriterTask::Interleaved(w) => w.poll(ctx),
    }
  }

  pub fn status(&self) -> String {
    match self {
      WriterTask::TileLayout(w) => format!("batch={} subblock={}", w.batch, w.subblock),
      WriterTask::Interleaved(w) => format!("written={}/{}", w.written, w.args.num_tiles),
    }
  }
}
