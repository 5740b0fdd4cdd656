// Task plumbing shared by the reader, compute and writer state machines

use serde::{Deserialize, Serialize};
use sim::models::{ModelMessage, ModelRecord};
use sim::utils::errors::SimulationError;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use super::cb::{CbTable, CircularBuffer};
use super::dram::{SharedDram, Tile};
use super::noc::NocPacket;
use super::semaphore::SemaphoreTable;
use crate::planner::CoreCoord;
use crate::simulator::sim::CoreAction;

/// Outcome of one poll of a task.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TaskPoll {
  /// State advanced; poll again.
  Progress,
  /// Occupied for this many cycles before the next poll.
  Busy(f64),
  /// Waiting on a circular buffer or semaphore.
  Blocked,
  Done,
}

/// Cycle costs of the simulated mesh.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeshTiming {
  pub dram_cycles_per_tile: f64,
  pub noc_cycles_per_tile: f64,
  /// Cycles per tile multiply at the program's math fidelity.
  pub math_cycles_per_tile: f64,
}

impl Default for MeshTiming {
  fn default() -> Self {
    Self {
      dram_cycles_per_tile: 8.0,
      noc_cycles_per_tile: 2.0,
      math_cycles_per_tile: 64.0,
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoreStats {
  pub core: CoreCoord,
  /// Semaphore waits entered by the reader.
  pub semaphore_waits: u64,
  /// Waits whose first check failed and suspended the reader.
  pub blocked_waits: u64,
  pub packets_sent: u64,
  pub tiles_read: u64,
  pub tiles_written: u64,
  pub tiles_multiplied: u64,
  pub finish_time: Option<f64>,
  pub status: String,
}

impl CoreStats {
  pub fn is_done(&self) -> bool {
    self.finish_time.is_some()
  }
}

/// State published by every core model for the driver's watchdog.
#[derive(Debug, Default)]
pub struct MeshState {
  pub cores: BTreeMap<CoreCoord, CoreStats>,
  pub faults: Vec<(CoreCoord, String)>,
}

impl MeshState {
  pub fn done_count(&self) -> usize {
    self.cores.values().filter(|s| s.is_done()).count()
  }

  pub fn stalled(&self) -> Vec<&CoreStats> {
    self.cores.values().filter(|s| !s.is_done()).collect()
  }
}

pub type SharedMeshState = Arc<Mutex<MeshState>>;

/// Borrowed view of one core handed to its tasks while they are polled.
pub struct CoreCtx<'a> {
  pub core: CoreCoord,
  pub now: f64,
  pub timing: &'a MeshTiming,
  pub cbs: &'a mut CbTable,
  pub sems: &'a mut SemaphoreTable,
  pub dram: &'a SharedDram,
  pub stats: &'a mut CoreStats,
  pub outbox: &'a mut Vec<ModelMessage>,
  pub records: &'a mut Vec<ModelRecord>,
  pub fault: &'a mut Option<String>,
}

impl<'a> CoreCtx<'a> {
  pub fn record(&mut self, action: CoreAction, subject: String) {
    self.records.push(ModelRecord {
      time: self.now,
      action: action.as_str().to_string(),
      subject,
    });
  }

  /// Latch a fault detail and abort the simulation step.
  pub fn fail(&mut self, detail: String) -> SimulationError {
    *self.fault = Some(detail);
    SimulationError::InvalidModelState
  }

  pub fn cb(&mut self, index: u8) -> Result<&mut CircularBuffer, SimulationError> {
    match self.cbs.get_mut(index) {
      Some(cb) => Ok(cb),
      None => {
        *self.fault = Some(format!("no circular buffer {}", index));
        Err(SimulationError::InvalidModelState)
      },
    }
  }

  /// Run a semaphore handshake step; a missing semaphore is a fault.
  pub fn handshake<T>(&mut self, step: impl FnOnce(&mut SemaphoreTable) -> Result<T, u32>) -> Result<T, SimulationError> {
    step(&mut *self.sems).map_err(|id| self.fail(format!("no semaphore {}", id)))
  }

  pub fn send(&mut self, packet: &NocPacket, port: &str) -> Result<(), SimulationError> {
    let msg = packet.to_message(port)?;
    self.outbox.push(msg);
    self.stats.packets_sent += 1;
    Ok(())
  }

  pub fn read_tiles(&mut self, addr: u32, ids: &[u32]) -> Result<Vec<Tile>, SimulationError> {
    let dram = self.dram;
    let result: Result<Vec<Tile>, _> = match dram.lock() {
      Ok(dram) => ids.iter().map(|&id| dram.read_page(addr as u64, id as u64)).collect(),
      Err(_) => return Err(self.fail("dram lock poisoned".to_string())),
    };
    match result {
      Ok(tiles) => {
        self.stats.tiles_read += ids.len() as u64;
        Ok(tiles)
      },
      Err(e) => Err(self.fail(format!("dram read: {}", e))),
    }
  }

  pub fn write_tiles(&mut self, addr: u32, ids: &[u32], tiles: Vec<Tile>) -> Result<(), SimulationError> {
    let dram = self.dram;
    let result = match dram.lock() {
      Ok(mut dram) => ids
        .iter()
        .zip(tiles)
        .try_for_each(|(&id, tile)| dram.write_page(addr as u64, id as u64, tile)),
      Err(_) => return Err(self.fail("dram lock poisoned".to_string())),
    };
    match result {
      Ok(()) => {
        self.stats.tiles_written += ids.len() as u64;
        Ok(())
      },
      Err(e) => Err(self.fail(format!("dram write: {}", e))),
    }
  }
}

/// Lift a circular buffer misuse into a latched fault.
pub fn cb_fault<T>(ctx: &mut CoreCtx<'_>, r: Result<T, String>) -> Result<T, SimulationError> {
  r.map_err(|detail| ctx.fail(detail))
}
