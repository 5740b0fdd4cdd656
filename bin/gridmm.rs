use clap::Parser;
use gridmm::host::{allclose, pcc, random_vector, reference_matmul, TiledMatrix};
use gridmm::simulator::config::{
  apply_cli_overrides, load_layered_config, validate_config, AppConfig, CliOverrides,
};
use gridmm::simulator::utils::log::init_log_with;
use gridmm::{MatmulRunner, SimDevice};
use log::{error, info};
use std::io::{self, Error, ErrorKind};
use std::path::{Path, PathBuf};

/// gridmm - tiled matmul planner on a simulated multi-core grid
#[derive(Parser, Debug)]
#[command(name = "gridmm")]
#[command(version = "0.1.0")]
#[command(about = "Plan and run a tiled matmul on a simulated core grid", long_about = None)]
struct Args {
  /// Rows of A and C
  #[arg(short, long)]
  m: Option<u32>,

  /// Columns of B and C
  #[arg(short, long)]
  n: Option<u32>,

  /// Inner dimension
  #[arg(short, long)]
  k: Option<u32>,

  #[arg(long)]
  batch: Option<u32>,

  /// Share one B across every batch
  #[arg(long)]
  bcast_batch: bool,

  /// Used grid as ROWSxCOLS, e.g. 4x4
  #[arg(short, long, value_name = "ROWSxCOLS", value_parser = parse_grid)]
  grid: Option<(u32, u32)>,

  /// single_core, multi_core or multi_core_reuse_mcast
  #[arg(long)]
  variant: Option<String>,

  /// Float32, Float16_b, Bfp8_b or Bfp4_b
  #[arg(long)]
  format: Option<String>,

  /// LoFi, HiFi2, HiFi3 or HiFi4
  #[arg(long)]
  fidelity: Option<String>,

  /// Run the same matmul this many times, replaying the cached program
  #[arg(short, long)]
  repeat: Option<u32>,

  #[arg(long)]
  seed: Option<u64>,

  /// TOML file layered over the built-in defaults
  #[arg(short, long, value_name = "FILE")]
  config: Option<PathBuf>,

  /// Output trace file path
  #[arg(long, value_name = "FILE")]
  trace_file: Option<String>,

  /// Quiet mode (warnings and errors only)
  #[arg(short, long)]
  quiet: bool,
}

fn parse_grid(s: &str) -> Result<(u32, u32), String> {
  let (rows, cols) = s
    .split_once(['x', 'X'])
    .ok_or_else(|| format!("expected ROWSxCOLS, got {}", s))?;
  let rows = rows.trim().parse::<u32>().map_err(|e| e.to_string())?;
  let cols = cols.trim().parse::<u32>().map_err(|e| e.to_string())?;
  Ok((rows, cols))
}

fn run(config: &AppConfig) -> io::Result<()> {
  let params = config
    .matmul
    .to_params()
    .map_err(|e| Error::new(ErrorKind::InvalidInput, e.to_string()))?;
  let shape = params.shape;
  let seed = config.matmul.seed;

  let a = random_vector(shape.a_len(), 1.0, seed, 0.0);
  let b = random_vector(shape.b_len(), 1.0, seed.wrapping_add(12399), 0.0);
  let tiled = |data: &[f32], rows, cols, batch| {
    TiledMatrix::from_row_major(data, rows, cols, batch).map_err(|e| Error::new(ErrorKind::InvalidInput, e.to_string()))
  };
  let a_tiled = tiled(&a, shape.m, shape.k, shape.batch)?;
  let b_tiled = tiled(&b, shape.k, shape.n, shape.b_batches())?;

  let mut device = SimDevice::new(&config.device);
  if !config.simulation.trace_file.is_empty() {
    device = device.with_trace_file(Path::new(&config.simulation.trace_file))?;
  }
  let mut runner = MatmulRunner::new(device);
  let (out, reports) = runner
    .run_matmul_matrices(&a_tiled, &b_tiled, &params, config.matmul.repeat)
    .map_err(|e| Error::new(ErrorKind::Other, e.to_string()))?;

  let result = out.to_row_major().map_err(|e| Error::new(ErrorKind::Other, e.to_string()))?;
  let mut a_q = a;
  let mut b_q = b;
  params.data_format.quantize(&mut a_q);
  params.data_format.quantize(&mut b_q);
  let golden = reference_matmul(&a_q, &b_q, &shape);
  let correlation = pcc(&golden, &result);
  let close = allclose(&golden, &result, params.data_format.relative_tolerance(), 1e-2);

  for (i, report) in reports.iter().enumerate() {
    info!(
      "run {}: {} cycles, {} messages, {} semaphore waits ({} blocked), cache hit {}",
      i + 1,
      report.cycles,
      report.packets,
      report.semaphore_waits(),
      report.blocked_waits(),
      report.program_cache_hit
    );
  }
  info!("PCC {:.6} (threshold {}), allclose {}", correlation, params.data_format.pcc_threshold(), close);
  println!(
    "{} {}x{}x{} batch {}: pcc={:.6} cycles={}",
    params.variant,
    shape.m,
    shape.n,
    shape.k,
    shape.batch,
    correlation,
    reports.last().map(|r| r.cycles).unwrap_or(0.0)
  );

  if correlation < params.data_format.pcc_threshold() {
    error!("output does not match the reference product");
    return Err(Error::new(ErrorKind::Other, format!("PCC {:.6} below threshold", correlation)));
  }
  Ok(())
}

fn main() -> io::Result<()> {
  let args = Args::parse();

  let mut config = load_layered_config(args.config.as_deref())?;
  apply_cli_overrides(
    &mut config,
    &CliOverrides {
      m: args.m,
      n: args.n,
      k: args.k,
      batch: args.batch,
      bcast_batch: args.bcast_batch,
      grid: args.grid,
      variant: args.variant,
      data_format: args.format,
      math_fidelity: args.fidelity,
      repeat: args.repeat,
      seed: args.seed,
      quiet: args.quiet,
      trace_file: args.trace_file,
    },
  );
  validate_config(&config)?;
  init_log_with(config.simulation.quiet);

  run(&config)
}
