use log::{debug, info, warn};
use std::fs::File;
use std::io::{self, BufWriter};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use super::config::DeviceSection;
use super::sim::{launch_core, run_until, RunEnd, Watchdog};
use super::utils::report::{collect_records, log_records, RunReport};
use crate::arch::mesh::dram::{BulkMemory, DramBuffer, SharedDram};
use crate::arch::mesh::worker::Core;
use crate::arch::mesh::{create_simulation, MeshSimulation, MeshState, MeshTiming};
use crate::error::DeviceError;
use crate::planner::program::Program;
use crate::planner::CoreCoord;

/// What the planner and runner need from a device.
pub trait Device {
  /// Logical worker grid, (columns, rows).
  fn grid_size(&self) -> CoreCoord;

  /// Bytes of L1 available for staging buffers on each core.
  fn l1_size(&self) -> u64;

  /// NoC coordinate of a logical worker core.
  fn worker_core_from_logical_core(&self, logical: CoreCoord) -> CoreCoord;

  fn allocate_buffer(&mut self, size: u64, page_size: u64) -> Result<DramBuffer, DeviceError>;

  fn deallocate_buffer(&mut self, buffer: &DramBuffer) -> Result<(), DeviceError>;

  /// Upload tiled host data, one tile per page.
  fn write_buffer(&mut self, buffer: &DramBuffer, data: &[f32]) -> Result<(), DeviceError>;

  fn read_buffer(&self, buffer: &DramBuffer) -> Result<Vec<f32>, DeviceError>;

  /// Launch `program` on every core it uses and wait for all of them to finish.
  fn enqueue_program(&mut self, program: &Program) -> Result<RunReport, DeviceError>;
}

/// Discrete-event model of a grid of worker cores sharing one DRAM.
pub struct SimDevice {
  grid: CoreCoord,
  l1_size: u64,
  noc_origin: CoreCoord,
  timing: MeshTiming,
  max_steps: u64,
  dram: SharedDram,
  trace: Option<BufWriter<File>>,
}

impl SimDevice {
  pub fn new(config: &DeviceSection) -> Self {
    Self {
      grid: config.grid(),
      l1_size: config.l1_size,
      noc_origin: config.noc_origin(),
      timing: MeshTiming {
        dram_cycles_per_tile: config.dram_cycles_per_tile,
        noc_cycles_per_tile: config.noc_cycles_per_tile,
        ..MeshTiming::default()
      },
      max_steps: config.max_steps,
      dram: Arc::new(Mutex::new(BulkMemory::new())),
      trace: None,
    }
  }

  /// Write every delivered message to `path` as JSON lines.
  pub fn with_trace_file(mut self, path: &Path) -> io::Result<Self> {
    self.trace = Some(BufWriter::new(File::create(path)?));
    Ok(self)
  }

  pub fn with_max_steps(mut self, max_steps: u64) -> Self {
    self.max_steps = max_steps;
    self
  }

  pub fn dram(&self) -> &SharedDram {
    &self.dram
  }

  pub fn timing(&self) -> MeshTiming {
    self.timing
  }

  fn with_dram<T>(&self, f: impl FnOnce(&mut BulkMemory) -> Result<T, DeviceError>) -> Result<T, DeviceError> {
    let mut dram = self
      .dram
      .lock()
      .map_err(|_| DeviceError::Simulation("DRAM lock poisoned".to_string()))?;
    f(&mut dram)
  }
}

impl Default for SimDevice {
  fn default() -> Self {
    Self::new(&DeviceSection::default())
  }
}

fn hang(time: f64, state: &MeshState) -> DeviceError {
  let stalled = state.stalled();
  let detail = stalled
    .iter()
    .map(|s| format!("{}: {}", Core::model_id(s.core), s.status))
    .collect::<Vec<_>>()
    .join("; ");
  DeviceError::Hang {
    time,
    stalled: stalled.len(),
    detail,
  }
}

fn first_fault(state: &MeshState) -> Option<DeviceError> {
  state.faults.first().map(|(core, detail)| DeviceError::Protocol {
    core: Core::model_id(*core),
    detail: detail.clone(),
  })
}

impl Device for SimDevice {
  fn grid_size(&self) -> CoreCoord {
    self.grid
  }

  fn l1_size(&self) -> u64 {
    self.l1_size
  }

  fn worker_core_from_logical_core(&self, logical: CoreCoord) -> CoreCoord {
    CoreCoord::new(logical.x + self.noc_origin.x, logical.y + self.noc_origin.y)
  }

  fn allocate_buffer(&mut self, size: u64, page_size: u64) -> Result<DramBuffer, DeviceError> {
    let buffer = self.with_dram(|dram| dram.allocate(size, page_size))?;
    debug!("allocated {} bytes at {:#x}", size, buffer.address);
    Ok(buffer)
  }

  fn deallocate_buffer(&mut self, buffer: &DramBuffer) -> Result<(), DeviceError> {
    self.with_dram(|dram| dram.deallocate(buffer.address))
  }

  fn write_buffer(&mut self, buffer: &DramBuffer, data: &[f32]) -> Result<(), DeviceError> {
    self.with_dram(|dram| dram.write_buffer(buffer.address, data))
  }

  fn read_buffer(&self, buffer: &DramBuffer) -> Result<Vec<f32>, DeviceError> {
    self.with_dram(|dram| dram.read_buffer(buffer.address))
  }

  fn enqueue_program(&mut self, program: &Program) -> Result<RunReport, DeviceError> {
    let start = Instant::now();
    let MeshSimulation {
      mut simulation,
      cores,
      state,
    } = create_simulation(program, &self.dram, self.timing, self.noc_origin)?;

    for &core in &cores {
      launch_core(&mut simulation, &Core::model_id(core));
    }

    let total = cores.len();
    let watchdog = Watchdog {
      max_steps: self.max_steps,
    };
    let done_state = state.clone();
    let run = run_until(&mut simulation, &mut self.trace, watchdog, || {
      done_state.lock().map(|s| s.done_count() == total).unwrap_or(false)
    });

    let state = state
      .lock()
      .map_err(|_| DeviceError::Simulation("mesh state lock poisoned".to_string()))?;
    let summary = match run {
      Ok(summary) => summary,
      Err(e) => return Err(first_fault(&state).unwrap_or_else(|| DeviceError::Simulation(e.to_string()))),
    };
    if let Some(fault) = first_fault(&state) {
      return Err(fault);
    }
    match summary.end {
      RunEnd::Completed => {},
      RunEnd::Quiescent | RunEnd::StepLimit => {
        let err = hang(simulation.get_global_time(), &state);
        warn!("watchdog ({:?}) after {} steps: {}", summary.end, summary.steps, err);
        return Err(err);
      },
    }

    let cores_stats: Vec<_> = state.cores.values().cloned().collect();
    drop(state);
    let cycles = cores_stats
      .iter()
      .filter_map(|s| s.finish_time)
      .fold(0.0, f64::max);
    let events = collect_records(&mut simulation);
    log_records(&events);
    info!(
      "program on {} core(s) finished at cycle {} ({} steps, {} messages) in {:.2?}",
      total,
      cycles,
      summary.steps,
      summary.delivered,
      start.elapsed()
    );

    Ok(RunReport {
      cycles,
      steps: summary.steps,
      packets: summary.delivered,
      cores: cores_stats,
      events,
      program_cache_hit: false,
    })
  }
}
