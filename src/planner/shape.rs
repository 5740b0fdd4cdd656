use half::bf16;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::coord::CoreCoord;
use crate::error::ConfigError;

pub const TILE_HEIGHT: u32 = 32;
pub const TILE_WIDTH: u32 = 32;
pub const TILE_HW: usize = (TILE_HEIGHT * TILE_WIDTH) as usize;

/// Elements sharing one exponent in the block-float formats.
const BFP_GROUP: usize = 16;

/// Element format of a tile in DRAM and in the staging buffers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataFormat {
  Float32,
  #[serde(rename = "Float16_b")]
  Float16B,
  #[serde(rename = "Bfp8_b")]
  Bfp8B,
  #[serde(rename = "Bfp4_b")]
  Bfp4B,
}

impl DataFormat {
  /// Bytes of one 32x32 tile, which is also the DRAM page size.
  pub fn tile_size(&self) -> u32 {
    match self {
      DataFormat::Float32 => 4096,
      DataFormat::Float16B => 2048,
      // mantissas plus one shared exponent byte per 16 elements
      DataFormat::Bfp8B => 1024 + 64,
      DataFormat::Bfp4B => 512 + 64,
    }
  }

  /// Round values in place to what this format can hold.
  pub fn quantize(&self, values: &mut [f32]) {
    match self {
      DataFormat::Float32 => {},
      DataFormat::Float16B => values.iter_mut().for_each(|v| *v = bf16::from_f32(*v).to_f32()),
      DataFormat::Bfp8B => quantize_block_float(values, 7),
      DataFormat::Bfp4B => quantize_block_float(values, 3),
    }
  }

  /// Relative error bound used when comparing against a full precision product.
  pub fn relative_tolerance(&self) -> f32 {
    match self {
      DataFormat::Float32 => 1e-4,
      DataFormat::Float16B => 1.6e-2,
      DataFormat::Bfp8B => 3e-2,
      DataFormat::Bfp4B => 0.25,
    }
  }

  /// Minimum Pearson correlation expected for a correct result.
  pub fn pcc_threshold(&self) -> f64 {
    match self {
      DataFormat::Float32 | DataFormat::Float16B => 0.999,
      DataFormat::Bfp8B => 0.99,
      DataFormat::Bfp4B => 0.9,
    }
  }
}

fn quantize_block_float(values: &mut [f32], mantissa_bits: i32) {
  let max_mag = ((1 << mantissa_bits) - 1) as f32;
  for group in values.chunks_mut(BFP_GROUP) {
    let max_abs = group.iter().fold(0f32, |m, v| m.max(v.abs()));
    if max_abs == 0.0 || !max_abs.is_finite() {
      continue;
    }
    let shared_exp = max_abs.log2().floor() as i32;
    let step = 2f32.powi(shared_exp - mantissa_bits + 1);
    for v in group.iter_mut() {
      let mag = (v.abs() / step).round().min(max_mag);
      *v = mag.copysign(*v) * step;
    }
  }
}

impl fmt::Display for DataFormat {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      DataFormat::Float32 => "Float32",
      DataFormat::Float16B => "Float16_b",
      DataFormat::Bfp8B => "Bfp8_b",
      DataFormat::Bfp4B => "Bfp4_b",
    };
    f.write_str(name)
  }
}

impl FromStr for DataFormat {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "float32" | "fp32" => Ok(DataFormat::Float32),
      "float16_b" | "bfloat16" | "bf16" => Ok(DataFormat::Float16B),
      "bfp8_b" | "bfp8" => Ok(DataFormat::Bfp8B),
      "bfp4_b" | "bfp4" => Ok(DataFormat::Bfp4B),
      other => Err(ConfigError::InvalidParameter(format!("unknown data format: {}", other))),
    }
  }
}

/// Precision mode of the matrix engine. Only affects simulated cycle cost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MathFidelity {
  LoFi,
  HiFi2,
  HiFi3,
  HiFi4,
}

impl MathFidelity {
  pub fn cycles_per_tile(&self) -> u64 {
    match self {
      MathFidelity::LoFi => 16,
      MathFidelity::HiFi2 => 32,
      MathFidelity::HiFi3 => 48,
      MathFidelity::HiFi4 => 64,
    }
  }
}

impl FromStr for MathFidelity {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().as_str() {
      "lofi" => Ok(MathFidelity::LoFi),
      "hifi2" => Ok(MathFidelity::HiFi2),
      "hifi3" => Ok(MathFidelity::HiFi3),
      "hifi4" => Ok(MathFidelity::HiFi4),
      other => Err(ConfigError::InvalidParameter(format!("unknown math fidelity: {}", other))),
    }
  }
}

/// How output tiles are spread over the grid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatmulVariant {
  /// Interleaved tile-at-a-time product on one core.
  SingleCore,
  /// Interleaved output tiles split over the whole grid, no operand reuse.
  MultiCore,
  /// 2-D blocked product with row/column multicast of operand blocks.
  MultiCoreReuseMcast,
}

impl fmt::Display for MatmulVariant {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      MatmulVariant::SingleCore => "single_core",
      MatmulVariant::MultiCore => "multi_core",
      MatmulVariant::MultiCoreReuseMcast => "multi_core_reuse_mcast",
    };
    f.write_str(name)
  }
}

impl FromStr for MatmulVariant {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_lowercase().replace('-', "_").as_str() {
      "single_core" | "single" => Ok(MatmulVariant::SingleCore),
      "multi_core" | "multi" => Ok(MatmulVariant::MultiCore),
      "multi_core_reuse_mcast" | "mcast" => Ok(MatmulVariant::MultiCoreReuseMcast),
      other => Err(ConfigError::InvalidParameter(format!("unknown matmul variant: {}", other))),
    }
  }
}

fn tile_count(batches: u32, rows: u32, cols: u32) -> Option<u32> {
  batches.checked_mul(rows)?.checked_mul(cols)
}

/// C[b] = A[b] * B[b] with A: M x K, B: K x N. With `bcast_batch` one B serves every batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatmulShape {
  pub m: u32,
  pub n: u32,
  pub k: u32,
  pub batch: u32,
  pub bcast_batch: bool,
}

impl MatmulShape {
  pub fn new(m: u32, n: u32, k: u32) -> Self {
    Self { m, n, k, batch: 1, bcast_batch: false }
  }

  pub fn with_batch(mut self, batch: u32, bcast_batch: bool) -> Self {
    self.batch = batch;
    self.bcast_batch = bcast_batch;
    self
  }

  /// Shape of `a (a_rows x a_cols) * b (b_rows x b_cols)`.
  pub fn from_operands(a_rows: u32, a_cols: u32, b_rows: u32, b_cols: u32) -> Result<Self, ConfigError> {
    if a_cols != b_rows {
      return Err(ConfigError::InnerDimMismatch { a_cols, b_rows });
    }
    Ok(Self::new(a_rows, b_cols, a_cols))
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    for (name, value, tile) in [("M", self.m, TILE_HEIGHT), ("N", self.n, TILE_WIDTH), ("K", self.k, TILE_WIDTH)] {
      if value == 0 || value % tile != 0 {
        return Err(ConfigError::NotTileAligned { name, value, tile });
      }
    }
    if self.batch == 0 {
      return Err(ConfigError::InvalidParameter("batch must be at least 1".to_string()));
    }
    let (mt, nt, kt) = (self.mt(), self.nt(), self.kt());
    for (name, batches, rows, cols) in [("A", self.batch, mt, kt), ("B", self.b_batches(), kt, nt), ("C", self.batch, mt, nt)] {
      let fits = tile_count(batches, rows, cols)
        .and_then(|tiles| (tiles as usize).checked_mul(TILE_HW))
        .is_some();
      if !fits {
        return Err(ConfigError::InvalidParameter(format!(
          "{} of {}x{}x{} batch {} exceeds 32-bit tile indexing",
          name, self.m, self.n, self.k, self.batch
        )));
      }
    }
    Ok(())
  }

  pub fn mt(&self) -> u32 {
    self.m / TILE_HEIGHT
  }

  pub fn nt(&self) -> u32 {
    self.n / TILE_WIDTH
  }

  pub fn kt(&self) -> u32 {
    self.k / TILE_WIDTH
  }

  /// Tile and element counts below assume [`MatmulShape::validate`] passed.
  pub fn a_tiles(&self) -> u32 {
    self.batch * self.mt() * self.kt()
  }

  pub fn b_tiles(&self) -> u32 {
    self.b_batches() * self.kt() * self.nt()
  }

  pub fn c_tiles(&self) -> u32 {
    self.batch * self.mt() * self.nt()
  }

  /// Number of distinct B matrices stored in DRAM.
  pub fn b_batches(&self) -> u32 {
    if self.bcast_batch {
      1
    } else {
      self.batch
    }
  }

  pub fn a_len(&self) -> usize {
    self.a_tiles() as usize * TILE_HW
  }

  pub fn b_len(&self) -> usize {
    self.b_tiles() as usize * TILE_HW
  }

  pub fn c_len(&self) -> usize {
    self.c_tiles() as usize * TILE_HW
  }

  /// Check host buffer lengths against the shape.
  pub fn check_buffers(&self, a: usize, b: usize, out: usize) -> Result<(), ConfigError> {
    for (name, expected, actual) in [("a", self.a_len(), a), ("b", self.b_len(), b), ("out", self.c_len(), out)] {
      if expected != actual {
        return Err(ConfigError::BufferSizeMismatch { name, expected, actual });
      }
    }
    Ok(())
  }
}

/// Knobs for the blocked variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TilingOptions {
  /// Divides the default `Kt / grid_cols` block width.
  pub in0_block_w_div: u32,
  /// Explicit block width, overriding the derived one.
  pub in0_block_w: Option<u32>,
  /// Restrict sub-blocks to a single row of tiles.
  pub out_sharded: bool,
  /// Fp32 accumulation halves the destination register budget.
  pub fp32_dest_acc_en: bool,
}

impl Default for TilingOptions {
  fn default() -> Self {
    Self {
      in0_block_w_div: 1,
      in0_block_w: None,
      out_sharded: false,
      fp32_dest_acc_en: false,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MatmulParams {
  pub shape: MatmulShape,
  pub data_format: DataFormat,
  pub math_fidelity: MathFidelity,
  pub variant: MatmulVariant,
  /// Used grid extent (columns, rows). `None` takes the whole device grid.
  pub grid: Option<CoreCoord>,
  pub tiling: TilingOptions,
}

impl MatmulParams {
  pub fn new(shape: MatmulShape) -> Self {
    Self {
      shape,
      data_format: DataFormat::Float16B,
      math_fidelity: MathFidelity::HiFi4,
      variant: MatmulVariant::MultiCoreReuseMcast,
      grid: None,
      tiling: TilingOptions::default(),
    }
  }

  pub fn with_variant(mut self, variant: MatmulVariant) -> Self {
    self.variant = variant;
    self
  }

  pub fn with_grid(mut self, cols: u32, rows: u32) -> Self {
    self.grid = Some(CoreCoord::new(cols, rows));
    self
  }

  pub fn with_format(mut self, data_format: DataFormat) -> Self {
    self.data_format = data_format;
    self
  }

  pub fn with_fidelity(mut self, math_fidelity: MathFidelity) -> Self {
    self.math_fidelity = math_fidelity;
    self
  }

  pub fn with_tiling(mut self, tiling: TilingOptions) -> Self {
    self.tiling = tiling;
    self
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn tile_sizes_match_formats() {
    assert_eq!(DataFormat::Float32.tile_size(), 4096);
    assert_eq!(DataFormat::Float16B.tile_size(), 2048);
    assert_eq!(DataFormat::Bfp8B.tile_size(), 1088);
    assert_eq!(DataFormat::Bfp4B.tile_size(), 576);
  }

  #[test]
  fn shape_rejects_unaligned_dims() {
    let err = MatmulShape::new(3000, 3072, 3072).validate().unwrap_err();
    assert_eq!(err, ConfigError::NotTileAligned { name: "M", value: 3000, tile: 32 });
    assert!(MatmulShape::new(64, 64, 0).validate().is_err());
    assert!(MatmulShape::new(64, 64, 64).with_batch(0, false).validate().is_err());
  }

  #[test]
  fn tile_counts_past_u32_are_rejected() {
    let huge = 1 << 21;
    let err = MatmulShape::new(huge, huge, huge).validate().unwrap_err();
    assert!(matches!(err, ConfigError::InvalidParameter(_)), "{:?}", err);
    assert!(MatmulShape::new(1024, 1024, 1024).with_batch(1 << 22, false).validate().is_err());
    assert!(MatmulShape::new(1024, 1024, 1024).with_batch(1 << 12, true).validate().is_ok());
  }

  #[test]
  fn operands_must_agree_on_k() {
    assert_eq!(
      MatmulShape::from_operands(64, 96, 64, 32).unwrap_err(),
      ConfigError::InnerDimMismatch { a_cols: 96, b_rows: 64 }
    );
    assert_eq!(MatmulShape::from_operands(64, 96, 96, 32).unwrap(), MatmulShape::new(64, 32, 96));
  }

  #[test]
  fn bcast_batch_stores_one_b() {
    let shape = MatmulShape::new(64, 96, 128).with_batch(3, true);
    assert_eq!(shape.a_tiles(), 3 * 2 * 4);
    assert_eq!(shape.b_tiles(), 4 * 3);
    assert_eq!(shape.c_tiles(), 3 * 2 * 3);
    assert!(shape.check_buffers(shape.a_len(), shape.b_len(), shape.c_len()).is_ok());
    assert!(shape.check_buffers(shape.a_len(), shape.b_len() * 3, shape.c_len()).is_err());
  }

  #[test]
  fn bf16_rounding_keeps_eight_bits() {
    let mut v = [1.0 + 1.0 / 512.0, 0.5, -3.0];
    DataFormat::Float16B.quantize(&mut v);
    assert_eq!(v, [1.0, 0.5, -3.0]);
  }

  #[test]
  fn block_float_shares_exponent() {
    let mut v = [0.0f32; 16];
    v[0] = 1.0;
    v[1] = 1.0 / 256.0;
    v[2] = -0.75;
    DataFormat::Bfp8B.quantize(&mut v);
    // step is 2^-6 when the largest value is 1.0
    assert_eq!(v[0], 1.0);
    assert_eq!(v[1], 0.0);
    assert_eq!(v[2], -0.75);
  }

  #[test]
  fn formats_parse_from_names() {
    assert_eq!("Float16_b".parse::<DataFormat>().unwrap(), DataFormat::Float16B);
    assert_eq!("bfp8".parse::<DataFormat>().unwrap(), DataFormat::Bfp8B);
    assert_eq!("HiFi2".parse::<MathFidelity>().unwrap(), MathFidelity::HiFi2);
    assert_eq!("mcast".parse::<MatmulVariant>().unwrap(), MatmulVariant::MultiCoreReuseMcast);
    assert!("fp64".parse::<DataFormat>().is_err());
  }
}
