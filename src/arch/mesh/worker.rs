use sim::models::model_trait::{DevsModel, Reportable, ReportableModel, SerializableModel};
use sim::models::{ModelMessage, ModelRecord};
use sim::simulator::Services;
use sim::utils::errors::SimulationError;
use std::f64::INFINITY;

use super::cb::CbTable;
use super::compute::ComputeTask;
use super::dram::SharedDram;
use super::noc::{NocPacket, PORT_LAUNCH, PORT_NOC_IN};
use super::reader::ReaderTask;
use super::semaphore::SemaphoreTable;
use super::task::{CoreCtx, CoreStats, MeshTiming, SharedMeshState, TaskPoll};
use super::writer::WriterTask;
use crate::core_record;
use crate::planner::CoreCoord;
use crate::simulator::sim::CoreAction;

const READER: usize = 0;
const COMPUTE: usize = 1;
const WRITER: usize = 2;

/// The three tasks a program places on one core.
#[derive(Debug, Clone)]
pub struct CoreTasks {
  pub reader: ReaderTask,
  pub compute: ComputeTask,
  pub writer: WriterTask,
}

/// One worker core: reader, compute and writer tasks sharing local circular
/// buffers and semaphores, talking to other cores only through NoC packets.
#[derive(Debug, Clone)]
pub struct Core {
  core: CoreCoord,
  timing: MeshTiming,
  tasks: CoreTasks,
  /// Remaining busy cycles per task; `None` when the task can be polled.
  timers: [Option<f64>; 3],
  done: [bool; 3],
  cbs: CbTable,
  sems: SemaphoreTable,
  dram: SharedDram,
  state: SharedMeshState,
  stats: CoreStats,
  launched: bool,
  /// A packet arrived since the last poll.
  wake: bool,
  finished: bool,
  fault: Option<String>,
  records: Vec<ModelRecord>,
}

impl Core {
  pub fn new(
    core: CoreCoord,
    tasks: CoreTasks,
    cbs: CbTable,
    sems: SemaphoreTable,
    timing: MeshTiming,
    dram: SharedDram,
    state: SharedMeshState,
  ) -> Self {
    let mut c = Self {
      core,
      timing,
      tasks,
      timers: [None; 3],
      done: [false; 3],
      cbs,
      sems,
      dram,
      state,
      stats: CoreStats {
        core,
        ..CoreStats::default()
      },
      launched: false,
      wake: false,
      finished: false,
      fault: None,
      records: Vec::new(),
    };
    c.publish();
    c
  }

  pub fn model_id(core: CoreCoord) -> String {
    format!("core_{}_{}", core.x, core.y)
  }

  fn status_line(&self) -> String {
    let task = |i: usize, s: String| {
      if self.done[i] {
        "done".to_string()
      } else if self.timers[i].is_some() {
        format!("busy {}", s)
      } else {
        s
      }
    };
    format!(
      "reader[{}] compute[{}] writer[{}] {}",
      task(READER, self.tasks.reader.status()),
      task(COMPUTE, self.tasks.compute.status()),
      task(WRITER, self.tasks.writer.status()),
      self.cbs.summary()
    )
  }

  /// Copy stats into the shared mesh state for the driver.
  fn publish(&mut self) {
    self.stats.status = self.status_line();
    if let Ok(mut state) = self.state.lock() {
      state.cores.insert(self.core, self.stats.clone());
    }
  }

  fn raise(&mut self, detail: String) -> SimulationError {
    if let Ok(mut state) = self.state.lock() {
      state.faults.push((self.core, detail.clone()));
    }
    self.fault = Some(detail);
    SimulationError::InvalidModelState
  }

  fn apply_packet(&mut self, packet: NocPacket, services: &mut Services) -> Result<(), SimulationError> {
    match packet {
      NocPacket::McastData { axis, cb, step, tiles } => {
        let n = tiles.len();
        let landed = match self.cbs.get_mut(cb) {
          Some(buf) if n > 0 && buf.unfilled() as usize >= n => buf.write(tiles).is_ok(),
          _ => false,
        };
        if !landed {
          return Err(self.raise(format!("{} step {} data arrived without {} reserved tiles", axis, step, n)));
        }
        core_record!(self, services, CoreAction::McastRecv, format!("{} step={} tiles={}", axis, step, n));
      },
      NocPacket::SemaphoreSet { semaphore, value, landed } => {
        if let Some(cb) = landed {
          let filled = self.cbs.get(cb).is_some_and(|b| b.reserved() > 0 && b.unfilled() == 0);
          if !filled {
            return Err(self.raise(format!("semaphore {} set before cb{} data landed", semaphore, cb)));
          }
        }
        match self.sems.get_mut(semaphore) {
          Some(sem) => sem.set(value),
          None => return Err(self.raise(format!("set of unknown semaphore {}", semaphore))),
        }
        core_record!(self, services, CoreAction::SemSet, format!("id={} value={}", semaphore, value));
      },
      NocPacket::SemaphoreInc { semaphore, from } => {
        match self.sems.get_mut(semaphore) {
          Some(sem) => sem.signal(),
          None => return Err(self.raise(format!("increment of unknown semaphore {}", semaphore))),
        }
        core_record!(self, services, CoreAction::SemInc, format!("id={} from={}", semaphore, from));
      },
    }
    Ok(())
  }
}

impl DevsModel for Core {
  fn events_ext(&mut self, incoming_message: &ModelMessage, services: &mut Services) -> Result<(), SimulationError> {
    match incoming_message.port_name.as_str() {
      PORT_LAUNCH => {
        self.launched = true;
        core_record!(self, services, CoreAction::Launch, format!("core={}", self.core));
      },
      PORT_NOC_IN => {
        let packet = match NocPacket::decode(&incoming_message.content) {
          Ok(p) => p,
          Err(e) => {
            self.raise("undecodable NoC packet".to_string());
            return Err(e);
          },
        };
        self.apply_packet(packet, services)?;
      },
      other => return Err(self.raise(format!("message on unknown port {}", other))),
    }
    self.wake = true;
    Ok(())
  }

  fn events_int(&mut self, services: &mut Services) -> Result<Vec<ModelMessage>, SimulationError> {
    let now = services.global_time();
    let mut outbox = Vec::new();
    for timer in self.timers.iter_mut() {
      if timer.is_some_and(|r| r <= 0.0) {
        *timer = None;
      }
    }

    loop {
      let mut progressed = false;
      for i in [READER, COMPUTE, WRITER] {
        if self.done[i] || self.timers[i].is_some() {
          continue;
        }
        let mut ctx = CoreCtx {
          core: self.core,
          now,
          timing: &self.timing,
          cbs: &mut self.cbs,
          sems: &mut self.sems,
          dram: &self.dram,
          stats: &mut self.stats,
          outbox: &mut outbox,
          records: &mut self.records,
          fault: &mut self.fault,
        };
        let poll = match i {
          READER => self.tasks.reader.poll(&mut ctx),
          COMPUTE => self.tasks.compute.poll(&mut ctx),
          _ => self.tasks.writer.poll(&mut ctx),
        };
        match poll {
          Ok(TaskPoll::Progress) => progressed = true,
          Ok(TaskPoll::Busy(cycles)) => {
            self.timers[i] = Some(cycles.ceil().max(1.0));
            progressed = true;
          },
          Ok(TaskPoll::Blocked) => {},
          Ok(TaskPoll::Done) => {
            self.done[i] = true;
            progressed = true;
          },
          Err(e) => {
            let detail = self.fault.clone().unwrap_or_else(|| "invalid model state".to_string());
            self.raise(detail);
            return Err(e);
          },
        }
      }
      if !progressed {
        break;
      }
    }

    self.wake = false;
    if !self.finished && self.done.iter().all(|&d| d) {
      self.finished = true;
      self.stats.finish_time = Some(now);
      core_record!(self, services, CoreAction::Done, format!("core={}", self.core));
    }
    self.publish();
    Ok(outbox)
  }

  fn time_advance(&mut self, time_delta: f64) {
    for timer in self.timers.iter_mut().flatten() {
      *timer -= time_delta;
    }
  }

  fn until_next_event(&self) -> f64 {
    if self.finished || !self.launched {
      return INFINITY;
    }
    if self.wake {
      return 0.0;
    }
    self
      .timers
      .iter()
      .flatten()
      .fold(INFINITY, |min, &r| f64::min(min, r.max(0.0)))
  }
}

impl Reportable for Core {
  fn status(&self) -> String {
    self.status_line()
  }

  fn records(&self) -> &Vec<ModelRecord> {
    &self.records
  }
}

impl ReportableModel for Core {}

impl SerializableModel for Core {
  fn get_type(&self) -> &'static str {
    "Core"
  }
}
