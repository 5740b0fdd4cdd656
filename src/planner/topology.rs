use serde::{Deserialize, Serialize};
use std::fmt;

use super::coord::{CoreCoord, CoreRange};
use super::program::{NocId, TaskArtifact};
use crate::error::ConfigError;

/// Operand broadcast axis. in0 (A blocks) travels along rows, in1 (B blocks) down columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum McastAxis {
  In0,
  In1,
}

impl fmt::Display for McastAxis {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      McastAxis::In0 => f.write_str("in0"),
      McastAxis::In1 => f.write_str("in1"),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum McastRole {
  Sender,
  Receiver,
}

/// Role of a core in its row (in0) group and in its column (in1) group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CoreRole {
  pub in0: McastRole,
  pub in1: McastRole,
}

impl CoreRole {
  pub fn new(is_row_sender: bool, is_col_sender: bool) -> Self {
    let role = |sender| if sender { McastRole::Sender } else { McastRole::Receiver };
    Self {
      in0: role(is_row_sender),
      in1: role(is_col_sender),
    }
  }

  pub fn is_row_sender(&self) -> bool {
    self.in0 == McastRole::Sender
  }

  pub fn is_col_sender(&self) -> bool {
    self.in1 == McastRole::Sender
  }

  pub fn on(&self, axis: McastAxis) -> McastRole {
    match axis {
      McastAxis::In0 => self.in0,
      McastAxis::In1 => self.in1,
    }
  }

  pub fn reader_artifact(&self) -> TaskArtifact {
    match (self.is_row_sender(), self.is_col_sender()) {
      (true, true) => TaskArtifact::ReaderIn0SenderIn1Sender,
      (true, false) => TaskArtifact::ReaderIn0SenderIn1Receiver,
      (false, true) => TaskArtifact::ReaderIn0ReceiverIn1Sender,
      (false, false) => TaskArtifact::ReaderIn0ReceiverIn1Receiver,
    }
  }

  /// Left column writes out on NoC 1, everyone else on NoC 0.
  pub fn writer_artifact(&self) -> TaskArtifact {
    if self.is_row_sender() {
      TaskArtifact::WriterTileLayout(NocId::Noc1)
    } else {
      TaskArtifact::WriterTileLayout(NocId::Noc0)
    }
  }
}

/// One broadcast source and the cores it feeds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct McastGroup {
  pub axis: McastAxis,
  pub sender: CoreCoord,
  pub receivers: Vec<CoreCoord>,
}

/// Logical cores bounding the row and column groups of one core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McastBoundary {
  pub left: CoreCoord,
  pub left_plus_one: CoreCoord,
  pub right: CoreCoord,
  pub top: CoreCoord,
  pub top_plus_one: CoreCoord,
  pub bottom: CoreCoord,
}

/// Extent `(columns, rows)` of the grid needed for a block grid.
///
/// A single block still occupies one core.
pub fn get_core_range(num_blocks_rows: u32, num_blocks_cols: u32, max_rows: u32, max_cols: u32) -> Result<CoreCoord, ConfigError> {
  if num_blocks_rows > max_rows || num_blocks_cols > max_cols {
    return Err(ConfigError::GridCapacityExceeded {
      needed_x: num_blocks_cols,
      needed_y: num_blocks_rows,
      grid_x: max_cols,
      grid_y: max_rows,
    });
  }
  Ok(CoreCoord::new(num_blocks_cols.max(1), num_blocks_rows.max(1)))
}

/// Used sub-grid of the blocked variant and the role of each core in it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GridTopology {
  pub start: CoreCoord,
  pub num_cores_c: u32,
  pub num_cores_r: u32,
  pub all_cores: CoreRange,
  pub left_column: CoreRange,
  pub all_except_left_column: CoreRange,
  pub in0_sender_in1_sender: CoreRange,
  pub in0_sender_in1_receiver: CoreRange,
  pub in0_receiver_in1_sender: CoreRange,
  pub in0_receiver_in1_receiver: CoreRange,
}

impl GridTopology {
  pub fn new(device_grid: CoreCoord, start: CoreCoord, num_blocks_y: u32, num_blocks_x: u32) -> Result<Self, ConfigError> {
    let avail_cols = device_grid.x.saturating_sub(start.x);
    let avail_rows = device_grid.y.saturating_sub(start.y);
    let extent = get_core_range(num_blocks_y, num_blocks_x, avail_rows, avail_cols)?;
    if extent.area() == 0 {
      return Err(ConfigError::GridCapacityExceeded {
        needed_x: extent.x,
        needed_y: extent.y,
        grid_x: avail_cols,
        grid_y: avail_rows,
      });
    }
    let (c, r) = (extent.x, extent.y);
    let (sx, sy) = (start.x, start.y);
    let at = CoreCoord::new;

    Ok(Self {
      start,
      num_cores_c: c,
      num_cores_r: r,
      all_cores: CoreRange::new(at(sx, sy), at(sx + c - 1, sy + r - 1)),
      left_column: CoreRange::new(at(sx, sy), at(sx, sy + r - 1)),
      all_except_left_column: CoreRange::new(at(sx + 1, sy), at(sx + c - 1, sy + r - 1)),
      in0_sender_in1_sender: CoreRange::single(at(sx, sy)),
      in0_sender_in1_receiver: CoreRange::new(at(sx, sy + 1), at(sx, sy + r - 1)),
      in0_receiver_in1_sender: CoreRange::new(at(sx + 1, sy), at(sx + c - 1, sy)),
      in0_receiver_in1_receiver: CoreRange::new(at(sx + 1, sy + 1), at(sx + c - 1, sy + r - 1)),
    })
  }

  /// Used cores, row by row.
  pub fn cores(&self) -> Vec<CoreCoord> {
    self.all_cores.cores()
  }

  pub fn contains(&self, core: CoreCoord) -> bool {
    self.all_cores.contains(core)
  }

  /// Position of a used core relative to the start of the grid.
  pub fn core_index(&self, core: CoreCoord) -> (u32, u32) {
    (core.x - self.start.x, core.y - self.start.y)
  }

  pub fn role(&self, core: CoreCoord) -> CoreRole {
    CoreRole::new(core.x == self.start.x, core.y == self.start.y)
  }

  /// The role ranges with the reader artifact each one runs.
  pub fn reader_ranges(&self) -> [(CoreRange, TaskArtifact); 4] {
    [
      (self.in0_sender_in1_sender, TaskArtifact::ReaderIn0SenderIn1Sender),
      (self.in0_sender_in1_receiver, TaskArtifact::ReaderIn0SenderIn1Receiver),
      (self.in0_receiver_in1_sender, TaskArtifact::ReaderIn0ReceiverIn1Sender),
      (self.in0_receiver_in1_receiver, TaskArtifact::ReaderIn0ReceiverIn1Receiver),
    ]
  }

  pub fn boundary(&self, core: CoreCoord) -> McastBoundary {
    let (sx, sy) = (self.start.x, self.start.y);
    McastBoundary {
      left: CoreCoord::new(sx, core.y),
      left_plus_one: CoreCoord::new(sx + 1, core.y),
      right: CoreCoord::new(sx + self.num_cores_c - 1, core.y),
      top: CoreCoord::new(core.x, sy),
      top_plus_one: CoreCoord::new(core.x, sy + 1),
      bottom: CoreCoord::new(core.x, sy + self.num_cores_r - 1),
    }
  }

  /// Row group `y` broadcasting in0.
  pub fn row_group(&self, y: u32) -> McastGroup {
    let sender = CoreCoord::new(self.start.x, y);
    McastGroup {
      axis: McastAxis::In0,
      sender,
      receivers: (1..self.num_cores_c).map(|i| CoreCoord::new(sender.x + i, y)).collect(),
    }
  }

  /// Column group `x` broadcasting in1.
  pub fn col_group(&self, x: u32) -> McastGroup {
    let sender = CoreCoord::new(x, self.start.y);
    McastGroup {
      axis: McastAxis::In1,
      sender,
      receivers: (1..self.num_cores_r).map(|i| CoreCoord::new(x, sender.y + i)).collect(),
    }
  }

  pub fn groups(&self) -> Vec<McastGroup> {
    let rows = (0..self.num_cores_r).map(|i| self.row_group(self.start.y + i));
    let cols = (0..self.num_cores_c).map(|i| self.col_group(self.start.x + i));
    rows.chain(cols).collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn single_block_uses_one_core() {
    assert_eq!(get_core_range(1, 1, 8, 8).unwrap(), CoreCoord::new(1, 1));
    assert_eq!(get_core_range(2, 4, 8, 8).unwrap(), CoreCoord::new(4, 2));
    assert!(matches!(get_core_range(9, 1, 8, 8), Err(ConfigError::GridCapacityExceeded { .. })));
  }

  #[test]
  fn one_by_one_is_sender_on_both_axes() {
    let topo = GridTopology::new(CoreCoord::new(8, 8), CoreCoord::default(), 1, 1).unwrap();
    assert_eq!(topo.cores(), vec![CoreCoord::new(0, 0)]);
    let role = topo.role(CoreCoord::new(0, 0));
    assert!(role.is_row_sender() && role.is_col_sender());
    assert_eq!(role.reader_artifact(), TaskArtifact::ReaderIn0SenderIn1Sender);
    assert!(topo.row_group(0).receivers.is_empty());
    assert!(topo.col_group(0).receivers.is_empty());
    assert!(topo.all_except_left_column.is_empty());
    assert!(topo.in0_receiver_in1_receiver.is_empty());
  }

  #[test]
  fn role_ranges_partition_the_grid() {
    let topo = GridTopology::new(CoreCoord::new(8, 8), CoreCoord::new(1, 2), 3, 4).unwrap();
    for core in topo.cores() {
      let owners: Vec<_> = topo
        .reader_ranges()
        .iter()
        .filter(|(range, _)| range.contains(core))
        .map(|(_, artifact)| *artifact)
        .collect();
      assert_eq!(owners, vec![topo.role(core).reader_artifact()], "core {}", core);
      assert_ne!(topo.left_column.contains(core), topo.all_except_left_column.contains(core));
    }
    assert_eq!(topo.all_cores.num_cores(), 12);
  }

  #[test]
  fn groups_have_one_sender_each() {
    let topo = GridTopology::new(CoreCoord::new(8, 8), CoreCoord::default(), 2, 4).unwrap();
    let row = topo.row_group(1);
    assert_eq!(row.sender, CoreCoord::new(0, 1));
    assert_eq!(row.receivers.len(), 3);
    let col = topo.col_group(3);
    assert_eq!(col.sender, CoreCoord::new(3, 0));
    assert_eq!(col.receivers, vec![CoreCoord::new(3, 1)]);
    assert_eq!(topo.groups().len(), 6);
  }

  #[test]
  fn boundary_cores() {
    let topo = GridTopology::new(CoreCoord::new(8, 8), CoreCoord::default(), 4, 4).unwrap();
    let b = topo.boundary(CoreCoord::new(2, 3));
    assert_eq!(b.left, CoreCoord::new(0, 3));
    assert_eq!(b.left_plus_one, CoreCoord::new(1, 3));
    assert_eq!(b.right, CoreCoord::new(3, 3));
    assert_eq!(b.top, CoreCoord::new(2, 0));
    assert_eq!(b.top_plus_one, CoreCoord::new(2, 1));
    assert_eq!(b.bottom, CoreCoord::new(2, 3));
  }

  #[test]
  fn start_offset_counts_against_capacity() {
    assert!(GridTopology::new(CoreCoord::new(8, 8), CoreCoord::new(6, 0), 2, 3).is_err());
    assert!(GridTopology::new(CoreCoord::new(8, 8), CoreCoord::new(5, 0), 2, 3).is_ok());
  }
}
