use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::planner::program::{SemaphoreConfig, SEMAPHORE_INVALID, SEMAPHORE_VALID};
use crate::planner::CoreCoord;

/// L1 semaphore owned by one core. Other cores only bump or set its value over the NoC.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Semaphore {
  id: u32,
  value: u32,
}

impl Semaphore {
  pub fn new(id: u32, initial: u32) -> Self {
    Self { id, value: initial }
  }

  pub fn id(&self) -> u32 {
    self.id
  }

  pub fn value(&self) -> u32 {
    self.value
  }

  pub fn reset(&mut self) {
    self.value = SEMAPHORE_INVALID;
  }

  pub fn set(&mut self, value: u32) {
    self.value = value;
  }

  /// Remote increment.
  pub fn signal(&mut self) {
    self.value += 1;
  }

  /// Non-blocking threshold check; the caller suspends while it is false.
  pub fn wait_at_least(&self, n: u32) -> bool {
    self.value >= n
  }
}

/// Sender/receiver semaphore ids of one multicast axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemaphorePair {
  /// Counts receivers ready for the next block. Lives on the sender.
  pub sender: u32,
  /// Flips to VALID once the block landed. Lives on each receiver.
  pub receiver: u32,
}

/// Semaphores of one core, freshly initialised for each program launch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SemaphoreTable {
  sems: BTreeMap<u32, Semaphore>,
}

impl SemaphoreTable {
  pub fn for_core(configs: &[SemaphoreConfig], core: CoreCoord) -> Self {
    let sems = configs
      .iter()
      .filter(|c| c.core_ranges.contains(core))
      .map(|c| (c.id, Semaphore::new(c.id, c.initial_value)))
      .collect();
    Self { sems }
  }

  pub fn get(&self, id: u32) -> Option<&Semaphore> {
    self.sems.get(&id)
  }

  pub fn get_mut(&mut self, id: u32) -> Option<&mut Semaphore> {
    self.sems.get_mut(&id)
  }

  pub fn len(&self) -> usize {
    self.sems.len()
  }

  pub fn is_empty(&self) -> bool {
    self.sems.is_empty()
  }

  /// Missing ids come back as the error.
  fn slot(&mut self, id: u32) -> Result<&mut Semaphore, u32> {
    self.sems.get_mut(&id).ok_or(id)
  }

  /// Receiver: drop the VALID flag of the previous step before signalling ready.
  pub fn arm_receiver(&mut self, pair: SemaphorePair) -> Result<(), u32> {
    self.slot(pair.receiver).map(|s| s.set(SEMAPHORE_INVALID))
  }

  /// Sender: true once `num_receivers` signalled ready, consuming the count.
  pub fn take_ready(&mut self, pair: SemaphorePair, num_receivers: u32) -> Result<bool, u32> {
    let sem = self.slot(pair.sender)?;
    let ready = sem.wait_at_least(num_receivers);
    if ready {
      sem.reset();
    }
    Ok(ready)
  }

  /// Receiver: true once the sender's VALID landed, consuming the flag.
  pub fn take_valid(&mut self, pair: SemaphorePair) -> Result<bool, u32> {
    let sem = self.slot(pair.receiver)?;
    let valid = sem.wait_at_least(SEMAPHORE_VALID);
    if valid {
      sem.reset();
    }
    Ok(valid)
  }
}
