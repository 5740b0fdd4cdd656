//! Row-major <-> tiled layout conversion for host matrices.
//!
//! Tiled layout stores 32x32 tiles row-major over tile coordinates, each tile
//! row-major inside. Batched matrices are stacked one after another.

use crate::error::ConfigError;
use crate::planner::shape::{TILE_HEIGHT, TILE_HW, TILE_WIDTH};

fn check(len: usize, rows: u32, cols: u32, batch: u32) -> Result<(), ConfigError> {
  for (name, value, tile) in [("rows", rows, TILE_HEIGHT), ("cols", cols, TILE_WIDTH)] {
    if value == 0 || value % tile != 0 {
      return Err(ConfigError::NotTileAligned { name, value, tile });
    }
  }
  let expected = batch as usize * rows as usize * cols as usize;
  if len != expected {
    return Err(ConfigError::BufferSizeMismatch {
      name: "matrix",
      expected,
      actual: len,
    });
  }
  Ok(())
}

/// Offset of element `(r, c)` of a `rows x cols` matrix in tiled layout.
fn tiled_index(r: usize, c: usize, cols: usize) -> usize {
  let th = TILE_HEIGHT as usize;
  let tw = TILE_WIDTH as usize;
  let tile = (r / th) * (cols / tw) + c / tw;
  tile * TILE_HW + (r % th) * tw + c % tw
}

/// Convert `batch` row-major `rows x cols` matrices to tiled layout.
pub fn tilize(data: &[f32], rows: u32, cols: u32, batch: u32) -> Result<Vec<f32>, ConfigError> {
  check(data.len(), rows, cols, batch)?;
  let (rows, cols) = (rows as usize, cols as usize);
  let mut out = vec![0.0; data.len()];
  for (src, dst) in data.chunks(rows * cols).zip(out.chunks_mut(rows * cols)) {
    for r in 0..rows {
      for c in 0..cols {
        dst[tiled_index(r, c, cols)] = src[r * cols + c];
      }
    }
  }
  Ok(out)
}

/// Inverse of [`tilize`].
pub fn untilize(data: &[f32], rows: u32, cols: u32, batch: u32) -> Result<Vec<f32>, ConfigError> {
  check(data.len(), rows, cols, batch)?;
  let (rows, cols) = (rows as usize, cols as usize);
  let mut out = vec![0.0; data.len()];
  for (src, dst) in data.chunks(rows * cols).zip(out.chunks_mut(rows * cols)) {
    for r in 0..rows {
      for c in 0..cols {
        dst[r * cols + c] = src[tiled_index(r, c, cols)];
      }
    }
  }
  Ok(out)
}

/// `batch` stacked `rows x cols` matrices held in tiled layout.
#[derive(Debug, Clone, PartialEq)]
pub struct TiledMatrix {
  pub rows: u32,
  pub cols: u32,
  pub batch: u32,
  pub data: Vec<f32>,
}

impl TiledMatrix {
  pub fn from_row_major(data: &[f32], rows: u32, cols: u32, batch: u32) -> Result<Self, ConfigError> {
    Ok(Self {
      rows,
      cols,
      batch,
      data: tilize(data, rows, cols, batch)?,
    })
  }

  pub fn zeros(rows: u32, cols: u32, batch: u32) -> Self {
    Self {
      rows,
      cols,
      batch,
      data: vec![0.0; batch as usize * rows as usize * cols as usize],
    }
  }

  pub fn to_row_major(&self) -> Result<Vec<f32>, ConfigError> {
    untilize(&self.data, self.rows, self.cols, self.batch)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn second_tile_starts_after_first() {
    let data: Vec<f32> = (0..32 * 64).map(|i| i as f32).collect();
    let tiled = tilize(&data, 32, 64, 1).unwrap();
    // row 0 of the right-hand tile
    assert_eq!(tiled[TILE_HW], 32.0);
    // row 1 of the left-hand tile
    assert_eq!(tiled[32], 64.0);
    assert_eq!(untilize(&tiled, 32, 64, 1).unwrap(), data);
  }

  #[test]
  fn unaligned_matrix_is_rejected() {
    let data = vec![0.0; 30 * 32];
    assert!(matches!(
      tilize(&data, 30, 32, 1),
      Err(ConfigError::NotTileAligned { name: "rows", .. })
    ));
  }
}
