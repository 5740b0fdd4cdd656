//! Error taxonomy for planning and running a tiled matmul.

use thiserror::Error;

/// Invalid shape, grid or tiling parameters. Raised while building a
/// program, before any data moves.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
  /// A matrix dimension is not a multiple of the 32x32 tile.
  #[error("dimension {name}={value} is not a multiple of {tile}")]
  NotTileAligned { name: &'static str, value: u32, tile: u32 },

  #[error("inner dimensions differ: a is {a_cols} wide, b is {b_rows} tall")]
  InnerDimMismatch { a_cols: u32, b_rows: u32 },

  /// Host buffer length does not match the declared shape.
  #[error("buffer {name} holds {actual} elements, expected {expected}")]
  BufferSizeMismatch { name: &'static str, expected: usize, actual: usize },

  #[error("nothing to split: {units} units over {cores} cores")]
  EmptyWork { units: u32, cores: u32 },

  /// Tile count does not divide evenly into per-core blocks.
  #[error("{what}: {total} tiles do not divide into {parts} parts")]
  InexactBlockDivision { what: &'static str, total: u32, parts: u32 },

  #[error("grid {needed_x}x{needed_y} does not fit device grid {grid_x}x{grid_y}")]
  GridCapacityExceeded { needed_x: u32, needed_y: u32, grid_x: u32, grid_y: u32 },

  #[error("in0_block_w={in0_block_w} is invalid for Kt={kt}")]
  InvalidBlockWidth { in0_block_w: u32, kt: u32 },

  #[error("invalid parameter: {0}")]
  InvalidParameter(String),
}

/// Staging buffers do not fit in a core's L1.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("staging buffers need {required} bytes of L1, only {available} available")]
pub struct CapacityError {
  pub required: u64,
  pub available: u64,
}

/// Faults raised by a device while executing a program.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DeviceError {
  /// The watchdog saw no forward progress before every core finished.
  #[error("device hang at t={time}: {stalled} core(s) stalled ({detail})")]
  Hang { time: f64, stalled: usize, detail: String },

  /// A core observed traffic that breaks the multicast handshake.
  #[error("protocol fault on {core}: {detail}")]
  Protocol { core: String, detail: String },

  #[error("no buffer allocated at address {0:#x}")]
  UnknownBuffer(u64),

  #[error("page {page} out of bounds for buffer at {address:#x} ({pages} pages)")]
  OutOfBounds { address: u64, page: u64, pages: u64 },

  #[error("simulation error: {0}")]
  Simulation(String),
}

/// Top-level fault returned by the matmul entry points.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum Fault {
  #[error("configuration error: {0}")]
  Configuration(#[from] ConfigError),

  #[error("capacity error: {0}")]
  Capacity(#[from] CapacityError),

  /// Deadlock or protocol violation detected while the program ran.
  #[error("device error: {0}")]
  Device(#[from] DeviceError),
}

impl Fault {
  pub fn is_configuration(&self) -> bool {
    matches!(self, Fault::Configuration(_))
  }

  pub fn is_capacity(&self) -> bool {
    matches!(self, Fault::Capacity(_))
  }

  pub fn is_hang(&self) -> bool {
    matches!(self, Fault::Device(DeviceError::Hang { .. }))
  }
}

pub type Result<T> = std::result::Result<T, Fault>;
