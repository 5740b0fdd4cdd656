// Reader tasks: DRAM into the operand circular buffers, multicasting blocks along rows and columns

use serde::{Deserialize, Serialize};
use sim::utils::errors::SimulationError;

use super::dram::Tile;
use super::noc::{mcast_port, ready_port, NocPacket};
use super::task::{cb_fault, CoreCtx, TaskPoll};
use crate::planner::args::{InterleavedReaderArgs, McastLink, McastReaderArgs, OperandWalk};
use crate::planner::program::SEMAPHORE_VALID;
use crate::planner::staging::{CB_IN0, CB_IN1};
use crate::planner::{McastAxis, McastRole};
use crate::simulator::sim::CoreAction;

/// Where one axis of the blocked reader stands in the multicast handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum McastPhase {
  Idle,
  /// Block read from DRAM into the local reservation.
  SenderStaging,
  /// Counting receivers that reserved space for the block.
  SenderWaitingReceiversReady,
  Broadcasting,
  /// Ready signalled; waiting for the sender's VALID.
  ReceiverAwaitingData,
  ReceiversConsuming,
}

#[derive(Debug, Clone)]
struct McastChannel {
  axis: McastAxis,
  role: McastRole,
  walk: OperandWalk,
  link: McastLink,
  cb: u8,
  phase: McastPhase,
  /// A semaphore wait is in flight and already counted.
  waiting: bool,
}

impl McastChannel {
  fn new(axis: McastAxis, role: McastRole, walk: OperandWalk, link: McastLink, cb: u8) -> Self {
    Self {
      axis,
      role,
      walk,
      link,
      cb,
      phase: McastPhase::Idle,
      waiting: false,
    }
  }

  /// Advance one reduction step. `Done` means this step's block is pushed.
  fn poll(&mut self, ctx: &mut CoreCtx<'_>, batch_offset: u32, block: u32, step: u32) -> Result<TaskPoll, SimulationError> {
    let n = self.walk.block_num_tiles;
    match (self.role, self.phase) {
      (McastRole::Sender, McastPhase::Idle) => {
        if !ctx.cb(self.cb)?.reserve_back(n) {
          return Ok(TaskPoll::Blocked);
        }
        let ids = self.walk.block_tiles(batch_offset, block);
        let tiles = ctx.read_tiles(self.walk.addr, &ids)?;
        let r = ctx.cb(self.cb)?.write(tiles);
        cb_fault(ctx, r)?;
        self.phase = McastPhase::SenderStaging;
        Ok(TaskPoll::Busy(ctx.timing.dram_cycles_per_tile * n as f64))
      },
      (McastRole::Sender, McastPhase::SenderStaging) => {
        if self.link.num_dests == 0 {
          return self.complete(ctx, step);
        }
        self.phase = McastPhase::SenderWaitingReceiversReady;
        Ok(TaskPoll::Progress)
      },
      (McastRole::Sender, McastPhase::SenderWaitingReceiversReady) => {
        let (pair, num_dests) = (self.link.semaphores, self.link.num_dests);
        let ready = ctx.handshake(|sems| sems.take_ready(pair, num_dests))?;
        if !self.count_wait(ctx, ready) {
          return Ok(TaskPoll::Blocked);
        }
        let tiles: Vec<Tile> = ctx.cb(self.cb)?.staged().cloned().collect();
        let port = mcast_port(self.axis);
        ctx.send(
          &NocPacket::McastData {
            axis: self.axis,
            cb: self.cb,
            step,
            tiles,
          },
          port,
        )?;
        ctx.send(
          &NocPacket::SemaphoreSet {
            semaphore: self.link.semaphores.receiver,
            value: SEMAPHORE_VALID,
            landed: Some(self.cb),
          },
          port,
        )?;
        ctx.record(
          CoreAction::McastSend,
          format!("{} step={} tiles={} dests={}", self.axis, step, n, self.link.num_dests),
        );
        self.phase = McastPhase::Broadcasting;
        Ok(TaskPoll::Busy(ctx.timing.noc_cycles_per_tile * n as f64))
      },
      (McastRole::Sender, McastPhase::Broadcasting) => self.complete(ctx, step),
      (McastRole::Receiver, McastPhase::Idle) => {
        if !ctx.cb(self.cb)?.reserve_back(n) {
          return Ok(TaskPoll::Blocked);
        }
        let pair = self.link.semaphores;
        ctx.handshake(|sems| sems.arm_receiver(pair))?;
        let from = ctx.core;
        ctx.send(
          &NocPacket::SemaphoreInc {
            semaphore: pair.sender,
            from,
          },
          ready_port(self.axis),
        )?;
        ctx.record(CoreAction::ReceiverReady, format!("{} step={}", self.axis, step));
        self.phase = McastPhase::ReceiverAwaitingData;
        Ok(TaskPoll::Progress)
      },
      (McastRole::Receiver, McastPhase::ReceiverAwaitingData) => {
        let pair = self.link.semaphores;
        let valid = ctx.handshake(|sems| sems.take_valid(pair))?;
        if !self.count_wait(ctx, valid) {
          return Ok(TaskPoll::Blocked);
        }
        self.phase = McastPhase::ReceiversConsuming;
        Ok(TaskPoll::Progress)
      },
      (McastRole::Receiver, McastPhase::ReceiversConsuming) => self.complete(ctx, step),
      (role, phase) => Err(ctx.fail(format!("{} reader is a {:?} in phase {:?}", self.axis, role, phase))),
    }
  }

  fn complete(&mut self, ctx: &mut CoreCtx<'_>, step: u32) -> Result<TaskPoll, SimulationError> {
    let r = ctx.cb(self.cb)?.push_back(self.walk.block_num_tiles);
    cb_fault(ctx, r)?;
    ctx.record(CoreAction::PushBlock, format!("{} step={}", self.axis, step));
    self.phase = McastPhase::Idle;
    Ok(TaskPoll::Done)
  }

  /// Count one wait per handshake, and whether it blocked at least once.
  fn count_wait(&mut self, ctx: &mut CoreCtx<'_>, ready: bool) -> bool {
    if !self.waiting {
      ctx.stats.semaphore_waits += 1;
      if !ready {
        ctx.stats.blocked_waits += 1;
      }
    }
    self.waiting = !ready;
    ready
  }
}

/// Blocked reader: per reduction step, in0 then in1, each either read and multicast or received.
#[derive(Debug, Clone)]
pub struct McastReader {
  args: McastReaderArgs,
  channels: [McastChannel; 2],
  current: usize,
  batch: u32,
  block: u32,
}

impl McastReader {
  pub fn new(args: McastReaderArgs, in0_sender: bool, in1_sender: bool) -> Self {
    let role = |sender: bool| if sender { McastRole::Sender } else { McastRole::Receiver };
    Self {
      channels: [
        McastChannel::new(McastAxis::In0, role(in0_sender), args.in0, args.in0_mcast, CB_IN0),
        McastChannel::new(McastAxis::In1, role(in1_sender), args.in1, args.in1_mcast, CB_IN1),
      ],
      args,
      current: 0,
      batch: 0,
      block: 0,
    }
  }

  pub fn args(&self) -> &McastReaderArgs {
    &self.args
  }

  pub fn role(&self, axis: McastAxis) -> McastRole {
    match axis {
      McastAxis::In0 => self.channels[0].role,
      McastAxis::In1 => self.channels[1].role,
    }
  }

  fn poll(&mut self, ctx: &mut CoreCtx<'_>) -> Result<TaskPoll, SimulationError> {
    if self.batch == self.args.batch || self.args.num_blocks == 0 {
      return Ok(TaskPoll::Done);
    }
    let step = self.batch * self.args.num_blocks + self.block;
    let offset = match self.current {
      0 => self.batch * self.args.mt_kt,
      _ if self.args.bcast_b != 0 => 0,
      _ => self.batch * self.args.kt_nt,
    };
    match self.channels[self.current].poll(ctx, offset, self.block, step)? {
      TaskPoll::Done => {
        self.current += 1;
        if self.current == self.channels.len() {
          self.current = 0;
          self.block += 1;
          if self.block == self.args.num_blocks {
            self.block = 0;
            self.batch += 1;
          }
        }
        Ok(TaskPoll::Progress)
      },
      other => Ok(other),
    }
  }

  fn status(&self) -> String {
    let ch = &self.channels[self.current];
    format!(
      "batch={} block={} {} {:?}",
      self.batch, self.block, ch.axis, ch.phase
    )
  }
}

/// Tile-at-a-time reader: for each output tile, Kt pairs of A and B tiles.
#[derive(Debug, Clone)]
pub struct InterleavedReader {
  args: InterleavedReaderArgs,
  tile: u32,
  kt: u32,
  /// 0 reads A, 1 reads B.
  operand: u8,
  pending: bool,
}

impl InterleavedReader {
  pub fn new(args: InterleavedReaderArgs) -> Self {
    Self {
      args,
      tile: 0,
      kt: 0,
      operand: 0,
      pending: false,
    }
  }

  fn poll(&mut self, ctx: &mut CoreCtx<'_>) -> Result<TaskPoll, SimulationError> {
    if self.tile == self.args.num_output_tiles || self.args.kt == 0 {
      return Ok(TaskPoll::Done);
    }
    let cb = if self.operand == 0 { CB_IN0 } else { CB_IN1 };
    if self.pending {
      let r = ctx.cb(cb)?.push_back(1);
      cb_fault(ctx, r)?;
      self.pending = false;
      self.operand ^= 1;
      if self.operand == 0 {
        self.kt += 1;
        if self.kt == self.args.kt {
          self.kt = 0;
          self.tile += 1;
        }
      }
      return Ok(TaskPoll::Progress);
    }
    if !ctx.cb(cb)?.reserve_back(1) {
      return Ok(TaskPoll::Blocked);
    }
    let (a, b) = self.args.operand_tiles(self.args.output_tile_start_id + self.tile, self.kt);
    let (addr, id) = if self.operand == 0 {
      (self.args.src0_addr, a)
    } else {
      (self.args.src1_addr, b)
    };
    let tiles = ctx.read_tiles(addr, &[id])?;
    let r = ctx.cb(cb)?.write(tiles);
    cb_fault(ctx, r)?;
    self.pending = true;
    Ok(TaskPoll::Busy(ctx.timing.dram_cycles_per_tile))
  }
}

#[derive(Debug, Clone)]
pub enum ReaderTask {
  Mcast(McastReader),
  Interleaved(InterleavedReader),
}

impl ReaderTask {
  pub fn poll(&mut self, ctx: &mut CoreCtx<'_>) -> Result<TaskPoll, SimulationError> {
    match self {
      ReaderTask::Mcast(r) => r.poll(ctx),
      ReaderTask::Interleaved(r) => r.poll(ctx),
    }
  }

  pub fn status(&self) -> String {
    match self {
      ReaderTask::Mcast(r) => r.status(),
      ReaderTask::Interleaved(r) => format!("tile={} kt={}", r.tile, r.kt),
    }
  }
}
