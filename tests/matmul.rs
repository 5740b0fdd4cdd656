//! End-to-end runs on the simulated grid.

use gridmm::host::{allclose, pcc, random_vector, reference_matmul, tilize, untilize, TiledMatrix};
use gridmm::planner::args::{BufferAddresses, McastReaderArgs};
use gridmm::planner::program::{build_program, KernelKind};
use gridmm::planner::{CoreCoord, DataFormat, MathFidelity, MatmulParams, MatmulShape, MatmulVariant};
use gridmm::simulator::config::DeviceSection;
use gridmm::simulator::utils::log::init_log;
use gridmm::{ConfigError, Device, DeviceError, Fault, MatmulRunner, RunReport, SimDevice};

struct Inputs {
  a: Vec<f32>,
  b: Vec<f32>,
  a_tiled: Vec<f32>,
  b_tiled: Vec<f32>,
}

fn inputs(shape: &MatmulShape, format: DataFormat) -> Inputs {
  let mut a = random_vector(shape.a_len(), 1.0, 123, 0.0);
  let mut b = random_vector(shape.b_len(), 1.0, 12522, 0.0);
  format.quantize(&mut a);
  format.quantize(&mut b);
  let a_tiled = tilize(&a, shape.m, shape.k, shape.batch).unwrap();
  let b_tiled = tilize(&b, shape.k, shape.n, shape.b_batches()).unwrap();
  Inputs { a, b, a_tiled, b_tiled }
}

/// Run `params` and check the result against the reference product.
fn run_and_check(runner: &mut MatmulRunner, params: &MatmulParams) -> RunReport {
  let shape = params.shape;
  let input = inputs(&shape, params.data_format);
  let mut out = vec![0.0; shape.c_len()];
  let report = runner
    .run_matmul(&input.a_tiled, &input.b_tiled, &mut out, params)
    .unwrap();

  let result = untilize(&out, shape.m, shape.n, shape.batch).unwrap();
  let golden = reference_matmul(&input.a, &input.b, &shape);
  let correlation = pcc(&golden, &result);
  assert!(
    correlation >= params.data_format.pcc_threshold(),
    "pcc {} for {:?}",
    correlation,
    params
  );
  assert!(allclose(&golden, &result, params.data_format.relative_tolerance(), 1e-2));
  report
}

fn runner() -> MatmulRunner {
  init_log();
  MatmulRunner::default()
}

macro_rules! test_case {
  ($name:ident, $params:expr) => {
    #[test]
    fn $name() {
      let mut runner = runner();
      let report = run_and_check(&mut runner, &$params);
      assert!(report.cycles > 0.0);
      assert!(report.cores.iter().all(|c| c.is_done()));
    }
  };
  ($name:ident, $params:expr, smoke) => {
    #[test]
    #[cfg(feature = "smoke-tests")]
    fn $name() {
      let mut runner = runner();
      let report = run_and_check(&mut runner, &$params);
      assert!(report.cores.iter().all(|c| c.is_done()));
    }
  };
}

fn square(dim: u32) -> MatmulParams {
  MatmulParams::new(MatmulShape::new(dim, dim, dim))
}

test_case!(single_core_256, square(256).with_variant(MatmulVariant::SingleCore));
test_case!(multi_core_256, square(256).with_variant(MatmulVariant::MultiCore).with_grid(4, 4));
test_case!(multi_core_uneven_split, square(256).with_variant(MatmulVariant::MultiCore).with_grid(3, 3));
test_case!(mcast_256_on_1x1, square(256).with_grid(1, 1));
test_case!(mcast_256_on_2x2, square(256).with_grid(2, 2));
test_case!(mcast_256_on_4x4, square(256).with_grid(4, 4));
test_case!(mcast_wide_on_4x2, MatmulParams::new(MatmulShape::new(256, 512, 256)).with_grid(4, 2));
test_case!(
  mcast_batched,
  MatmulParams::new(MatmulShape::new(128, 128, 128).with_batch(2, false)).with_grid(2, 2)
);
test_case!(
  mcast_bcast_batch,
  MatmulParams::new(MatmulShape::new(128, 128, 128).with_batch(3, true)).with_grid(2, 2)
);
test_case!(
  interleaved_bcast_batch,
  MatmulParams::new(MatmulShape::new(64, 96, 128).with_batch(2, true)).with_variant(MatmulVariant::MultiCore)
);
test_case!(
  mcast_narrow_blocks,
  MatmulParams::new(MatmulShape::new(256, 256, 256))
    .with_grid(2, 2)
    .with_tiling(gridmm::TilingOptions {
      in0_block_w_div: 2,
      ..Default::default()
    })
);
test_case!(mcast_float32, square(128).with_grid(2, 2).with_format(DataFormat::Float32));
test_case!(mcast_256_full_grid, square(256), smoke);
test_case!(
  mcast_bfp8_lofi,
  square(256).with_format(DataFormat::Bfp8B).with_fidelity(MathFidelity::LoFi),
  smoke
);

#[test]
fn one_by_one_grid_never_waits_on_semaphores() {
  let mut runner = runner();
  let report = run_and_check(&mut runner, &square(128).with_grid(1, 1));
  assert_eq!(report.semaphore_waits(), 0);
  assert_eq!(report.cores.len(), 1);
}

#[test]
fn larger_grid_counts_semaphore_waits() {
  let mut runner = runner();
  let report = run_and_check(&mut runner, &square(128).with_grid(2, 2));
  // every core waits once per step on each axis, as sender or receiver
  let steps = 2;
  assert_eq!(report.semaphore_waits(), 4 * 2 * steps);
}

#[test]
fn lower_fidelity_runs_faster() {
  let mut runner = runner();
  let hifi = run_and_check(&mut runner, &square(128).with_grid(2, 2));
  let lofi = run_and_check(&mut runner, &square(128).with_grid(2, 2).with_fidelity(MathFidelity::LoFi));
  assert!(lofi.cycles < hifi.cycles);
}

#[test]
fn repeat_hits_program_cache() {
  let mut runner = runner();
  let params = square(128).with_grid(2, 2);
  let shape = params.shape;
  let input = inputs(&shape, params.data_format);
  let mut out = vec![0.0; shape.c_len()];
  let reports = runner
    .run_matmul_repeat(&input.a_tiled, &input.b_tiled, &mut out, &params, 3)
    .unwrap();
  assert_eq!(reports.len(), 3);
  assert!(!reports[0].program_cache_hit);
  assert!(reports[1..].iter().all(|r| r.program_cache_hit));
  assert_eq!(runner.cache().len(), 1);
  assert_eq!((runner.cache().hits(), runner.cache().misses()), (2, 1));
  {
    let dram = runner.device().dram().lock().unwrap();
    // A, B and C, once for all three runs
    assert_eq!(dram.allocations(), 3);
    assert_eq!(dram.num_buffers(), 0);
  }

  let golden = reference_matmul(&input.a, &input.b, &shape);
  let result = untilize(&out, shape.m, shape.n, 1).unwrap();
  assert!(pcc(&golden, &result) >= 0.999);
}

#[test]
fn replay_yields_identical_event_order() {
  let mut runner = runner();
  let params = square(128).with_grid(2, 2);
  let first = run_and_check(&mut runner, &params);
  let second = run_and_check(&mut runner, &params);
  assert!(second.program_cache_hit);
  assert_eq!(first.cycles, second.cycles);
  assert_eq!(first.events, second.events);
}

#[test]
fn buffers_are_released_after_each_run() {
  let mut runner = runner();
  let free = runner.device().dram().lock().unwrap().free_bytes();
  for _ in 0..3 {
    run_and_check(&mut runner, &square(64).with_grid(2, 2));
    let dram = runner.device().dram().lock().unwrap();
    assert_eq!(dram.num_buffers(), 0);
    assert_eq!(dram.free_bytes(), free);
  }
}

/// Index of the first record of `core` with `action` and a subject starting with `prefix`.
fn position(report: &RunReport, core: &str, action: &str, prefix: &str) -> usize {
  report
    .events_of(core)
    .iter()
    .position(|e| e.action == action && (e.subject == prefix || e.subject.starts_with(&format!("{} ", prefix))))
    .unwrap_or_else(|| panic!("{} has no {} {}", core, action, prefix))
}

#[test]
fn receivers_consume_only_after_data_is_valid() {
  let mut runner = runner();
  // Kt = 8 over 4 columns: in0_block_w = 2, four steps
  let report = run_and_check(&mut runner, &square(256).with_grid(4, 4));
  for x in 0..4 {
    for y in 0..4 {
      let core = format!("core_{}_{}", x, y);
      for (axis, receiver) in [("in0", x > 0), ("in1", y > 0)] {
        if !receiver {
          continue;
        }
        for step in 0..4 {
          let tag = format!("{} step={}", axis, step);
          let ready = position(&report, &core, "receiver_ready", &tag);
          let landed = position(&report, &core, "mcast_recv", &tag);
          let pushed = position(&report, &core, "push_block", &tag);
          assert!(ready < landed && landed < pushed, "{} {}", core, tag);
        }
      }
    }
  }
}

#[test]
fn senders_broadcast_only_after_every_receiver_is_ready() {
  let mut runner = runner();
  let report = run_and_check(&mut runner, &square(256).with_grid(4, 2));
  // semaphore ids: in0 sender 0, in0 receiver 1, in1 sender 2, in1 receiver 3
  for (core, axis, sem, dests) in [("core_0_0", "in0", 0, 3), ("core_0_1", "in0", 0, 3), ("core_2_0", "in1", 2, 1)] {
    let mut ready = 0;
    let mut sends = 0;
    for event in report.events_of(core) {
      if event.action == "sem_inc" && event.subject.starts_with(&format!("id={} ", sem)) {
        ready += 1;
      }
      if event.action == "mcast_send" && event.subject.starts_with(&format!("{} ", axis)) {
        sends += 1;
        assert_eq!(ready, sends * dests, "{} send {}", core, sends);
      }
    }
    assert!(sends > 0);
  }
}

#[test]
fn stalled_receiver_is_reported_as_hang() {
  init_log();
  let mut device = SimDevice::new(&DeviceSection::default());
  let params = square(128).with_grid(2, 2);
  let shape = params.shape;
  let page = params.data_format.tile_size() as u64;
  let mut addrs = [0u32; 3];
  for (addr, tiles) in addrs.iter_mut().zip([shape.a_tiles(), shape.b_tiles(), shape.c_tiles()]) {
    *addr = device.allocate_buffer(tiles as u64 * page, page).unwrap().address as u32;
  }
  let addrs = BufferAddresses {
    src0: addrs[0],
    src1: addrs[1],
    dst: addrs[2],
  };
  let mut program = build_program(&params, &device, addrs).unwrap();

  // the interior core expects one more block than its senders will ever send
  let victim = CoreCoord::new(1, 1);
  let kernel = program
    .kernels
    .iter_mut()
    .find(|k| k.artifact.kind() == KernelKind::Reader && k.runtime_args.contains_key(&victim))
    .unwrap();
  let args = kernel.runtime_args.get_mut(&victim).unwrap();
  let mut reader = McastReaderArgs::from_args(args).unwrap();
  reader.num_blocks += 1;
  *args = reader.to_args();

  match device.enqueue_program(&program) {
    Err(DeviceError::Hang { stalled, detail, .. }) => {
      assert_eq!(stalled, 1);
      assert!(detail.contains("core_1_1"), "{}", detail);
    },
    other => panic!("expected a hang, got {:?}", other.map(|r| r.cycles)),
  }
}

#[test]
fn step_limit_trips_watchdog() {
  init_log();
  let mut runner = MatmulRunner::new(SimDevice::default().with_max_steps(5));
  let params = square(128).with_grid(2, 2);
  let input = inputs(&params.shape, params.data_format);
  let mut out = vec![0.0; params.shape.c_len()];
  let err = runner
    .run_matmul(&input.a_tiled, &input.b_tiled, &mut out, &params)
    .unwrap_err();
  assert!(err.is_hang(), "{}", err);
  assert_eq!(runner.device().dram().lock().unwrap().num_buffers(), 0);
}

#[test]
fn mismatched_host_buffer_is_rejected() {
  let mut runner = runner();
  let params = square(64);
  let mut out = vec![0.0; params.shape.c_len()];
  let err = runner
    .run_matmul(&[0.0; 10], &vec![0.0; params.shape.b_len()], &mut out, &params)
    .unwrap_err();
  assert!(err.is_configuration());
}

#[test]
fn matrices_define_the_shape() {
  let mut runner = runner();
  let shape = MatmulShape::new(64, 96, 128).with_batch(2, true);
  let input = inputs(&shape, DataFormat::Float16B);
  let a = TiledMatrix::from_row_major(&input.a, 64, 128, 2).unwrap();
  let b = TiledMatrix::from_row_major(&input.b, 128, 96, 1).unwrap();
  // the shape carried by the params is replaced by the operands' one
  let params = square(32).with_grid(1, 1);
  let (out, reports) = runner.run_matmul_matrices(&a, &b, &params, 2).unwrap();
  assert_eq!((out.rows, out.cols, out.batch), (64, 96, 2));
  assert_eq!(reports.len(), 2);
  let golden = reference_matmul(&input.a, &input.b, &shape);
  assert!(pcc(&golden, &out.to_row_major().unwrap()) >= 0.999);
}

#[test]
fn mismatched_inner_dimension_is_rejected() {
  let mut runner = runner();
  let a = TiledMatrix::zeros(64, 96, 1);
  let b = TiledMatrix::zeros(64, 64, 1);
  let err = runner.run_matmul_matrices(&a, &b, &square(64), 1).unwrap_err();
  assert!(
    matches!(err, Fault::Configuration(ConfigError::InnerDimMismatch { a_cols: 96, b_rows: 64 })),
    "{}",
    err
  );

  let b = TiledMatrix::zeros(96, 64, 3);
  let a = TiledMatrix::zeros(64, 96, 2);
  assert!(runner.run_matmul_matrices(&a, &b, &square(64), 1).unwrap_err().is_configuration());
  assert_eq!(runner.device().dram().lock().unwrap().allocations(), 0);
}
