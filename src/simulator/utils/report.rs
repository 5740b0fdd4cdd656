use log::debug;
use serde::{Deserialize, Serialize};
use sim::models::{Model, Reportable};
use sim::simulator::Simulation;

use crate::arch::mesh::CoreStats;

/// One model record, tagged with the model that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoreEvent {
  pub core: String,
  pub time: f64,
  pub action: String,
  pub subject: String,
}

/// What one program launch did on the device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
  /// Cycle at which the last core finished.
  pub cycles: f64,
  pub steps: u64,
  /// NoC and launch messages delivered.
  pub packets: u64,
  pub cores: Vec<CoreStats>,
  pub events: Vec<CoreEvent>,
  pub program_cache_hit: bool,
}

impl RunReport {
  pub fn semaphore_waits(&self) -> u64 {
    self.cores.iter().map(|c| c.semaphore_waits).sum()
  }

  pub fn blocked_waits(&self) -> u64 {
    self.cores.iter().map(|c| c.blocked_waits).sum()
  }

  pub fn tiles_multiplied(&self) -> u64 {
    self.cores.iter().map(|c| c.tiles_multiplied).sum()
  }

  /// Records of one model, in the order they were produced.
  pub fn events_of(&self, core: &str) -> Vec<&CoreEvent> {
    self.events.iter().filter(|e| e.core == core).collect()
  }
}

/// Gather every model's records, ordered by time and then by model.
pub fn collect_records(simulation: &mut Simulation) -> Vec<CoreEvent> {
  let mut events = Vec::new();
  for model in simulation.models().iter() {
    events.extend(model_records(model));
  }
  // stable: keeps each model's own order at equal times
  events.sort_by(|a, b| a.time.total_cmp(&b.time));
  events
}

fn model_records(model: &Model) -> Vec<CoreEvent> {
  model
    .records()
    .iter()
    .map(|record| CoreEvent {
      core: model.id().to_string(),
      time: record.time,
      action: record.action.clone(),
      subject: record.subject.clone(),
    })
    .collect()
}

pub fn log_records(events: &[CoreEvent]) {
  debug!("--- Simulation Records ---");
  for event in events {
    debug!("[{}] Time {:.1}: {} {}", event.core, event.time, event.action, event.subject);
  }
  debug!("--- End Records ---");
}
