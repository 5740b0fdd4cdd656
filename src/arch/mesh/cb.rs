// Circular buffers in core L1: producer reserves and pushes, consumer waits and pops

use std::collections::{BTreeMap, VecDeque};

use super::dram::Tile;
use crate::planner::program::CircularBufferConfig;
use crate::planner::CoreCoord;

#[derive(Debug, Clone)]
pub struct CircularBuffer {
  index: u8,
  capacity: u32,
  /// Pushed tiles visible to the consumer.
  pages: VecDeque<Tile>,
  /// Tiles written into the reserved region but not yet pushed.
  staged: VecDeque<Tile>,
  reserved: u32,
}

impl CircularBuffer {
  pub fn new(index: u8, capacity: u32) -> Self {
    Self {
      index,
      capacity,
      pages: VecDeque::new(),
      staged: VecDeque::new(),
      reserved: 0,
    }
  }

  pub fn index(&self) -> u8 {
    self.index
  }

  pub fn capacity(&self) -> u32 {
    self.capacity
  }

  /// Claim `n` more free slots. False when they are not free yet.
  pub fn reserve_back(&mut self, n: u32) -> bool {
    if n > self.capacity {
      return false;
    }
    if self.pages.len() as u32 + self.reserved + n > self.capacity {
      return false;
    }
    self.reserved += n;
    true
  }

  /// Reserved slots not yet filled.
  pub fn unfilled(&self) -> u32 {
    self.reserved - self.staged.len() as u32
  }

  pub fn reserved(&self) -> u32 {
    self.reserved
  }

  /// Fill reserved slots. Errors when the tiles overrun the reservation.
  pub fn write(&mut self, tiles: Vec<Tile>) -> Result<(), String> {
    if tiles.len() as u32 > self.unfilled() {
      return Err(format!(
        "cb{}: {} tiles written into {} unfilled reserved slots",
        self.index,
        tiles.len(),
        self.unfilled()
      ));
    }
    self.staged.extend(tiles);
    Ok(())
  }

  pub fn staged(&self) -> impl Iterator<Item = &Tile> {
    self.staged.iter()
  }

  /// Publish `n` filled slots to the consumer.
  pub fn push_back(&mut self, n: u32) -> Result<(), String> {
    if (self.staged.len() as u32) < n {
      return Err(format!(
        "cb{}: push of {} tiles with only {} filled",
        self.index,
        n,
        self.staged.len()
      ));
    }
    self.pages.extend(self.staged.drain(..n as usize));
    self.reserved -= n;
    Ok(())
  }

  pub fn wait_front(&self, n: u32) -> bool {
    self.pages.len() as u32 >= n
  }

  pub fn front(&self, n: u32) -> impl Iterator<Item = &Tile> {
    self.pages.iter().take(n as usize)
  }

  pub fn pop_front(&mut self, n: u32) -> Vec<Tile> {
    let n = (n as usize).min(self.pages.len());
    self.pages.drain(..n).collect()
  }

  pub fn occupancy(&self) -> u32 {
    self.pages.len() as u32
  }
}

/// Circular buffers of one core keyed by index. Aliased indices share the first index's buffer.
#[derive(Debug, Clone, Default)]
pub struct CbTable {
  buffers: BTreeMap<u8, CircularBuffer>,
}

impl CbTable {
  pub fn for_core(configs: &[CircularBufferConfig], core: CoreCoord) -> Self {
    let buffers = configs
      .iter()
      .filter(|c| c.core_ranges.contains(core))
      .filter_map(|c| c.indices.first().map(|&i| (i, CircularBuffer::new(i, c.num_tiles))))
      .collect();
    Self { buffers }
  }

  pub fn get(&self, index: u8) -> Option<&CircularBuffer> {
    self.buffers.get(&index)
  }

  pub fn get_mut(&mut self, index: u8) -> Option<&mut CircularBuffer> {
    self.buffers.get_mut(&index)
  }

  pub fn summary(&self) -> String {
    self
      .buffers
      .values()
      .map(|cb| format!("cb{}={}/{}+{}", cb.index, cb.occupancy(), cb.capacity, cb.reserved))
      .collect::<Vec<_>>()
      .join(" ")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn tile(v: f32) -> Tile {
    vec![v; 4]
  }

  #[test]
  fn reserve_respects_capacity() {
    let mut cb = CircularBuffer::new(0, 4);
    assert!(cb.reserve_back(2));
    assert!(cb.reserve_back(2));
    assert!(!cb.reserve_back(1));
    cb.write(vec![tile(1.0), tile(2.0)]).unwrap();
    cb.push_back(2).unwrap();
    // pushed tiles still occupy slots until popped
    assert!(!cb.reserve_back(1));
    assert_eq!(cb.pop_front(2).len(), 2);
    assert!(cb.reserve_back(2));
  }

  #[test]
  fn fifo_order_is_kept() {
    let mut cb = CircularBuffer::new(16, 8);
    assert!(cb.reserve_back(3));
    cb.write(vec![tile(1.0), tile(2.0), tile(3.0)]).unwrap();
    cb.push_back(3).unwrap();
    assert!(cb.wait_front(3));
    assert!(!cb.wait_front(4));
    let popped = cb.pop_front(2);
    assert_eq!(popped[0][0], 1.0);
    assert_eq!(popped[1][0], 2.0);
    assert_eq!(cb.front(1).next().map(|t| t[0]), Some(3.0));
  }

  #[test]
  fn overruns_are_rejected() {
    let mut cb = CircularBuffer::new(1, 4);
    assert!(cb.reserve_back(1));
    assert!(cb.write(vec![tile(0.0), tile(0.0)]).is_err());
    assert!(cb.push_back(1).is_err());
    assert_eq!(cb.unfilled(), 1);
  }
}
