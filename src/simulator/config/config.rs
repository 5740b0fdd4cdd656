use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

use crate::error::ConfigError;
use crate::planner::shape::{DataFormat, MathFidelity, MatmulParams, MatmulShape, MatmulVariant, TilingOptions};
use crate::planner::CoreCoord;

const DEFAULT_CONFIG: &str = include_str!("default.toml");
const ENV_PREFIX: &str = "GRIDMM";

/// Simulated device section
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DeviceSection {
  pub grid_rows: u32,
  pub grid_cols: u32,
  pub l1_size: u64,
  #[serde(default)]
  pub noc_origin_x: u32,
  #[serde(default)]
  pub noc_origin_y: u32,
  pub dram_cycles_per_tile: f64,
  pub noc_cycles_per_tile: f64,
  /// Watchdog bound on simulation steps.
  pub max_steps: u64,
}

impl DeviceSection {
  pub fn grid(&self) -> CoreCoord {
    CoreCoord::new(self.grid_cols, self.grid_rows)
  }

  pub fn noc_origin(&self) -> CoreCoord {
    CoreCoord::new(self.noc_origin_x, self.noc_origin_y)
  }
}

impl Default for DeviceSection {
  fn default() -> Self {
    Self {
      grid_rows: 8,
      grid_cols: 8,
      l1_size: crate::planner::staging::DEFAULT_L1_SIZE,
      noc_origin_x: 1,
      noc_origin_y: 1,
      dram_cycles_per_tile: 8.0,
      noc_cycles_per_tile: 2.0,
      max_steps: 2_000_000,
    }
  }
}

/// Matmul problem section. Zero grid extents mean the whole device grid.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MatmulSection {
  pub m: u32,
  pub n: u32,
  pub k: u32,
  #[serde(default = "default_batch")]
  pub batch: u32,
  #[serde(default)]
  pub bcast_batch: bool,
  pub data_format: String,
  pub math_fidelity: String,
  pub variant: String,
  #[serde(default)]
  pub grid_rows: u32,
  #[serde(default)]
  pub grid_cols: u32,
  #[serde(default = "default_batch")]
  pub in0_block_w_div: u32,
  #[serde(default)]
  pub in0_block_w: u32,
  #[serde(default)]
  pub out_sharded: bool,
  #[serde(default)]
  pub fp32_dest_acc_en: bool,
  #[serde(default = "default_batch")]
  pub repeat: u32,
  #[serde(default = "default_seed")]
  pub seed: u64,
}

fn default_batch() -> u32 {
  1
}

fn default_seed() -> u64 {
  123
}

impl MatmulSection {
  pub fn to_params(&self) -> Result<MatmulParams, ConfigError> {
    let shape = MatmulShape::new(self.m, self.n, self.k).with_batch(self.batch, self.bcast_batch);
    shape.validate()?;
    let mut params = MatmulParams::new(shape)
      .with_format(self.data_format.parse::<DataFormat>()?)
      .with_fidelity(self.math_fidelity.parse::<MathFidelity>()?)
      .with_variant(self.variant.parse::<MatmulVariant>()?)
      .with_tiling(TilingOptions {
        in0_block_w_div: self.in0_block_w_div,
        in0_block_w: (self.in0_block_w > 0).then_some(self.in0_block_w),
        out_sharded: self.out_sharded,
        fp32_dest_acc_en: self.fp32_dest_acc_en,
      });
    if self.grid_rows > 0 && self.grid_cols > 0 {
      params = params.with_grid(self.grid_cols, self.grid_rows);
    }
    Ok(params)
  }
}

impl Default for MatmulSection {
  fn default() -> Self {
    Self {
      m: 256,
      n: 256,
      k: 256,
      batch: 1,
      bcast_batch: false,
      data_format: DataFormat::Float16B.to_string(),
      math_fidelity: "HiFi4".to_string(),
      variant: MatmulVariant::MultiCoreReuseMcast.to_string(),
      grid_rows: 0,
      grid_cols: 0,
      in0_block_w_div: 1,
      in0_block_w: 0,
      out_sharded: false,
      fp32_dest_acc_en: false,
      repeat: 1,
      seed: default_seed(),
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct SimulationSection {
  #[serde(default)]
  pub quiet: bool,
  #[serde(default)]
  pub trace_file: String,
}

/// Unified application config
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct AppConfig {
  #[serde(default)]
  pub device: DeviceSection,
  #[serde(default)]
  pub matmul: MatmulSection,
  #[serde(default)]
  pub simulation: SimulationSection,
}

/// Load the built-in default.toml
pub fn load_default_config() -> io::Result<AppConfig> {
  toml::from_str::<AppConfig>(DEFAULT_CONFIG)
    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("failed to parse built-in config: {}", e)))
}

/// Load a complete config from a TOML file
pub fn load_config_file(path: &Path) -> io::Result<AppConfig> {
  let content = fs::read_to_string(path)
    .map_err(|e| io::Error::new(io::ErrorKind::NotFound, format!("cannot read config file {:?}: {}", path, e)))?;

  toml::from_str::<AppConfig>(&content)
    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("failed to parse TOML config: {}", e)))
}

/// Defaults, then the optional user file, then `GRIDMM__SECTION__KEY` variables.
pub fn load_layered_config(user_file: Option<&Path>) -> io::Result<AppConfig> {
  let mut builder =
    ::config::Config::builder().add_source(::config::File::from_str(DEFAULT_CONFIG, ::config::FileFormat::Toml));
  if let Some(path) = user_file {
    if !path.exists() {
      return Err(io::Error::new(
        io::ErrorKind::NotFound,
        format!("config file {:?} does not exist", path),
      ));
    }
    builder = builder.add_source(::config::File::from(path).format(::config::FileFormat::Toml));
  }
  builder
    .add_source(
      ::config::Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("__")
        .separator("__")
        .try_parsing(true),
    )
    .build()
    .and_then(|c| c.try_deserialize::<AppConfig>())
    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, format!("failed to load config: {}", e)))
}

/// Command line values that take precedence over every config source
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
  pub m: Option<u32>,
  pub n: Option<u32>,
  pub k: Option<u32>,
  pub batch: Option<u32>,
  pub bcast_batch: bool,
  pub grid: Option<(u32, u32)>,
  pub variant: Option<String>,
  pub data_format: Option<String>,
  pub math_fidelity: Option<String>,
  pub repeat: Option<u32>,
  pub seed: Option<u64>,
  pub quiet: bool,
  pub trace_file: Option<String>,
}

/// Apply CLI parameters on top of the loaded config
pub fn apply_cli_overrides(config: &mut AppConfig, cli: &CliOverrides) {
  let mm = &mut config.matmul;
  if let Some(m) = cli.m {
    mm.m = m;
  }
  if let Some(n) = cli.n {
    mm.n = n;
  }
  if let Some(k) = cli.k {
    mm.k = k;
  }
  if let Some(batch) = cli.batch {
    mm.batch = batch;
  }
  if cli.bcast_batch {
    mm.bcast_batch = true;
  }
  if let Some((rows, cols)) = cli.grid {
    mm.grid_rows = rows;
    mm.grid_cols = cols;
  }
  if let Some(v) = &cli.variant {
    mm.variant = v.clone();
  }
  if let Some(f) = &cli.data_format {
    mm.data_format = f.clone();
  }
  if let Some(f) = &cli.math_fidelity {
    mm.math_fidelity = f.clone();
  }
  if let Some(r) = cli.repeat {
    mm.repeat = r;
  }
  if let Some(s) = cli.seed {
    mm.seed = s;
  }
  if cli.quiet {
    config.simulation.quiet = true;
  }
  if let Some(file) = &cli.trace_file {
    config.simulation.trace_file = file.clone();
  }
}

fn invalid(msg: String) -> io::Error {
  io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Validate the merged config
pub fn validate_config(config: &AppConfig) -> io::Result<()> {
  let dev = &config.device;
  if dev.grid_rows == 0 || dev.grid_cols == 0 {
    return Err(invalid(format!("device grid {}x{} is empty", dev.grid_rows, dev.grid_cols)));
  }
  if dev.l1_size == 0 {
    return Err(invalid("l1_size cannot be zero".to_string()));
  }
  if dev.max_steps == 0 {
    return Err(invalid("max_steps cannot be zero".to_string()));
  }
  if dev.dram_cycles_per_tile < 0.0 || dev.noc_cycles_per_tile < 0.0 {
    return Err(invalid("cycle costs cannot be negative".to_string()));
  }

  let mm = &config.matmul;
  if (mm.grid_rows == 0) != (mm.grid_cols == 0) {
    return Err(invalid(format!(
      "matmul grid {}x{} must set both extents or neither",
      mm.grid_rows, mm.grid_cols
    )));
  }
  if mm.grid_rows > dev.grid_rows || mm.grid_cols > dev.grid_cols {
    return Err(invalid(format!(
      "matmul grid {}x{} exceeds device grid {}x{}",
      mm.grid_rows, mm.grid_cols, dev.grid_rows, dev.grid_cols
    )));
  }
  if mm.repeat == 0 {
    return Err(invalid("repeat must be at least 1".to_string()));
  }
  mm.to_params().map_err(|e| invalid(e.to_string()))?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn builtin_defaults_parse_and_validate() {
    let config = load_default_config().unwrap();
    assert_eq!(config.device, DeviceSection::default());
    assert_eq!(config.matmul, MatmulSection::default());
    validate_config(&config).unwrap();
    let params = config.matmul.to_params().unwrap();
    assert_eq!(params.variant, MatmulVariant::MultiCoreReuseMcast);
    assert_eq!(params.grid, None);
  }

  #[test]
  fn cli_overrides_win() {
    let mut config = AppConfig::default();
    apply_cli_overrides(
      &mut config,
      &CliOverrides {
        m: Some(512),
        grid: Some((2, 4)),
        variant: Some("single".to_string()),
        quiet: true,
        ..CliOverrides::default()
      },
    );
    assert_eq!(config.matmul.m, 512);
    assert_eq!((config.matmul.grid_rows, config.matmul.grid_cols), (2, 4));
    assert!(config.simulation.quiet);
    let params = config.matmul.to_params().unwrap();
    assert_eq!(params.grid, Some(CoreCoord::new(4, 2)));
    assert_eq!(params.variant, MatmulVariant::SingleCore);
  }

  #[test]
  fn oversized_grid_is_rejected() {
    let mut config = AppConfig::default();
    config.matmul.grid_rows = 16;
    config.matmul.grid_cols = 16;
    assert!(validate_config(&config).is_err());
    config.matmul.grid_cols = 0;
    assert!(validate_config(&config).is_err());
  }

  #[test]
  fn unknown_format_is_rejected() {
    let mut config = AppConfig::default();
    config.matmul.data_format = "Float8".to_string();
    assert!(validate_config(&config).is_err());
  }
}
