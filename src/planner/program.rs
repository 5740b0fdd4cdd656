//! Program assembly: kernels, circular buffers, semaphores and per-core
//! runtime args for one matmul, plus the shape-keyed program cache.

use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::Instant;

use super::args::{
  interleaved_reader_args, interleaved_writer_args, large_block_compute_args, mcast_reader_args, tile_bmm_compute_args,
  tile_layout_writer_args, BufferAddresses, InterleavedReaderArgs, InterleavedWriterArgs, McastReaderArgs,
  McastSemaphoreIds, TileLayoutWriterArgs,
};
use super::coord::{CoreCoord, CoreRangeSet};
use super::partition::{split_work_to_cores, BlockPartition};
use super::shape::{DataFormat, MathFidelity, MatmulParams, MatmulShape, MatmulVariant, TilingOptions};
use super::staging::{CbSize, StagingPlan};
use super::subblock::get_subblock_sizes;
use super::topology::GridTopology;
use crate::arch::mesh::semaphore::SemaphorePair;
use crate::error::{ConfigError, Result};
use crate::simulator::device::Device;

pub const SEMAPHORE_INVALID: u32 = 0;
pub const SEMAPHORE_VALID: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NocId {
  Noc0,
  Noc1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KernelKind {
  Reader,
  Writer,
  Compute,
}

/// Identifier of the task code a kernel runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskArtifact {
  ReaderIn0SenderIn1Sender,
  ReaderIn0SenderIn1Receiver,
  ReaderIn0ReceiverIn1Sender,
  ReaderIn0ReceiverIn1Receiver,
  WriterTileLayout(NocId),
  ComputeLargeBlock,
  ReaderInterleaved,
  WriterInterleaved,
  ComputeTileBmm,
}

impl TaskArtifact {
  pub fn name(&self) -> &'static str {
    match self {
      TaskArtifact::ReaderIn0SenderIn1Sender => "reader_bmm_tile_layout_in0_sender_in1_sender",
      TaskArtifact::ReaderIn0SenderIn1Receiver => "reader_bmm_tile_layout_in0_sender_in1_receiver",
      TaskArtifact::ReaderIn0ReceiverIn1Sender => "reader_bmm_tile_layout_in0_receiver_in1_sender",
      TaskArtifact::ReaderIn0ReceiverIn1Receiver => "reader_bmm_tile_layout_in0_receiver_in1_receiver",
      TaskArtifact::WriterTileLayout(NocId::Noc0) => "writer_bmm_tile_layout_noc0",
      TaskArtifact::WriterTileLayout(NocId::Noc1) => "writer_bmm_tile_layout_noc1",
      TaskArtifact::ComputeLargeBlock => "bmm_large_block_zm",
      TaskArtifact::ReaderInterleaved => "reader_bmm_8bank_output_tiles_partitioned",
      TaskArtifact::WriterInterleaved => "writer_unary_interleaved_start_id",
      TaskArtifact::ComputeTileBmm => "bmm",
    }
  }

  pub fn kind(&self) -> KernelKind {
    match self {
      TaskArtifact::ReaderIn0SenderIn1Sender
      | TaskArtifact::ReaderIn0SenderIn1Receiver
      | TaskArtifact::ReaderIn0ReceiverIn1Sender
      | TaskArtifact::ReaderIn0ReceiverIn1Receiver
      | TaskArtifact::ReaderInterleaved => KernelKind::Reader,
      TaskArtifact::WriterTileLayout(_) | TaskArtifact::WriterInterleaved => KernelKind::Writer,
      TaskArtifact::ComputeLargeBlock | TaskArtifact::ComputeTileBmm => KernelKind::Compute,
    }
  }

  /// Sender flags `(in0, in1)` of a blocked reader.
  pub fn mcast_roles(&self) -> Option<(bool, bool)> {
    match self {
      TaskArtifact::ReaderIn0SenderIn1Sender => Some((true, true)),
      TaskArtifact::ReaderIn0SenderIn1Receiver => Some((true, false)),
      TaskArtifact::ReaderIn0ReceiverIn1Sender => Some((false, true)),
      TaskArtifact::ReaderIn0ReceiverIn1Receiver => Some((false, false)),
      _ => None,
    }
  }
}

impl fmt::Display for TaskArtifact {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.name())
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct KernelSpec {
  pub artifact: TaskArtifact,
  pub core_ranges: CoreRangeSet,
  pub noc: Option<NocId>,
  pub math_fidelity: Option<MathFidelity>,
  pub compile_args: Vec<u32>,
  pub runtime_args: BTreeMap<CoreCoord, Vec<u32>>,
}

impl KernelSpec {
  fn data_movement(artifact: TaskArtifact, core_ranges: CoreRangeSet, noc: NocId, compile_args: Vec<u32>) -> Self {
    Self {
      artifact,
      core_ranges,
      noc: Some(noc),
      math_fidelity: None,
      compile_args,
      runtime_args: BTreeMap::new(),
    }
  }

  fn compute(artifact: TaskArtifact, core_ranges: CoreRangeSet, math_fidelity: MathFidelity, compile_args: Vec<u32>) -> Self {
    Self {
      artifact,
      core_ranges,
      noc: None,
      math_fidelity: Some(math_fidelity),
      compile_args,
      runtime_args: BTreeMap::new(),
    }
  }
}

/// L1 circular buffer; several indices may alias one space.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircularBufferConfig {
  pub indices: Vec<u8>,
  pub total_size: u64,
  pub num_tiles: u32,
  pub page_size: u32,
  pub data_format: DataFormat,
  pub core_ranges: CoreRangeSet,
}

impl CircularBufferConfig {
  pub fn new(indices: Vec<u8>, size: CbSize, page_size: u32, data_format: DataFormat, core_ranges: CoreRangeSet) -> Self {
    Self {
      indices,
      total_size: size.bytes,
      num_tiles: size.num_tiles,
      page_size,
      data_format,
      core_ranges,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SemaphoreConfig {
  pub id: u32,
  pub core_ranges: CoreRangeSet,
  pub initial_value: u32,
}

/// Everything that decides a program's layout. Buffer addresses are not part of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramKey {
  pub shape: MatmulShape,
  pub data_format: DataFormat,
  pub math_fidelity: MathFidelity,
  pub variant: MatmulVariant,
  pub grid: CoreCoord,
  pub tiling: TilingOptions,
}

impl ProgramKey {
  /// `device_grid` fills in an unset used grid.
  pub fn new(params: &MatmulParams, device_grid: CoreCoord) -> Self {
    let grid = match params.variant {
      MatmulVariant::SingleCore => CoreCoord::new(1, 1),
      _ => params.grid.unwrap_or(device_grid),
    };
    Self {
      shape: params.shape,
      data_format: params.data_format,
      math_fidelity: params.math_fidelity,
      variant: params.variant,
      grid,
      tiling: params.tiling,
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Program {
  pub key: ProgramKey,
  pub kernels: Vec<KernelSpec>,
  pub circular_buffers: Vec<CircularBufferConfig>,
  pub semaphores: Vec<SemaphoreConfig>,
  pub cores: CoreRangeSet,
  pub addresses: BufferAddresses,
}

impl Program {
  fn new(key: ProgramKey, cores: CoreRangeSet, addresses: BufferAddresses) -> Self {
    Self {
      key,
      kernels: Vec::new(),
      circular_buffers: Vec::new(),
      semaphores: Vec::new(),
      cores,
      addresses,
    }
  }

  fn add_kernel(&mut self, kernel: KernelSpec) {
    if !kernel.core_ranges.is_empty() {
      self.kernels.push(kernel);
    }
  }

  fn add_semaphore(&mut self, core_ranges: CoreRangeSet, initial_value: u32) -> u32 {
    let id = self.semaphores.len() as u32;
    self.semaphores.push(SemaphoreConfig { id, core_ranges, initial_value });
    id
  }

  fn set_runtime_args(&mut self, artifact: TaskArtifact, core: CoreCoord, args: Vec<u32>) -> std::result::Result<(), ConfigError> {
    let kernel = self
      .kernels
      .iter_mut()
      .find(|k| k.artifact == artifact && k.core_ranges.contains(core))
      .ok_or_else(|| ConfigError::InvalidParameter(format!("no {} kernel on core {}", artifact, core)))?;
    kernel.runtime_args.insert(core, args);
    Ok(())
  }

  /// Kernels placed on `core`, in declaration order.
  pub fn kernels_on(&self, core: CoreCoord) -> Vec<&KernelSpec> {
    self.kernels.iter().filter(|k| k.core_ranges.contains(core)).collect()
  }

  /// Point the runtime args at new DRAM buffers, as a cache hit requires.
  pub fn bind_buffers(&mut self, addrs: BufferAddresses) -> std::result::Result<(), ConfigError> {
    for kernel in self.kernels.iter_mut() {
      for args in kernel.runtime_args.values_mut() {
        match kernel.artifact {
          TaskArtifact::ReaderIn0SenderIn1Sender
          | TaskArtifact::ReaderIn0SenderIn1Receiver
          | TaskArtifact::ReaderIn0ReceiverIn1Sender
          | TaskArtifact::ReaderIn0ReceiverIn1Receiver => {
            let mut a = McastReaderArgs::from_args(args)?;
            a.in0.addr = addrs.src0;
            a.in1.addr = addrs.src1;
            *args = a.to_args();
          },
          TaskArtifact::WriterTileLayout(_) => {
            let mut a = TileLayoutWriterArgs::from_args(args)?;
            a.out_addr = addrs.dst;
            *args = a.to_args();
          },
          TaskArtifact::ReaderInterleaved => {
            let mut a = InterleavedReaderArgs::from_args(args)?;
            a.src0_addr = addrs.src0;
            a.src1_addr = addrs.src1;
            *args = a.to_args();
          },
          TaskArtifact::WriterInterleaved => {
            let mut a = InterleavedWriterArgs::from_args(args)?;
            a.dst_addr = addrs.dst;
            *args = a.to_args();
          },
          TaskArtifact::ComputeLargeBlock | TaskArtifact::ComputeTileBmm => {},
        }
      }
    }
    self.addresses = addrs;
    Ok(())
  }
}

/// Build the program for `params` against `device`, reading and writing the buffers at `addrs`.
pub fn build_program(params: &MatmulParams, device: &dyn Device, addrs: BufferAddresses) -> Result<Program> {
  params.shape.validate()?;
  let key = ProgramKey::new(params, device.grid_size());
  let device_grid = device.grid_size();
  if key.grid.x > device_grid.x || key.grid.y > device_grid.y {
    return Err(
      ConfigError::GridCapacityExceeded {
        needed_x: key.grid.x,
        needed_y: key.grid.y,
        grid_x: device_grid.x,
        grid_y: device_grid.y,
      }
      .into(),
    );
  }

  let t0 = Instant::now();
  let program = match key.variant {
    MatmulVariant::SingleCore | MatmulVariant::MultiCore => build_interleaved(key, device, addrs)?,
    MatmulVariant::MultiCoreReuseMcast => build_reuse_mcast(key, device, addrs)?,
  };
  debug!(
    "built {} program on {} cores in {:.3} ms",
    key.variant,
    program.cores.num_cores(),
    t0.elapsed().as_secs_f64() * 1e3
  );
  Ok(program)
}

fn build_interleaved(key: ProgramKey, device: &dyn Device, addrs: BufferAddresses) -> Result<Program> {
  let shape = &key.shape;
  let split = split_work_to_cores(key.grid, shape.c_tiles())?;
  if !split.group_2.cores.is_empty() {
    debug!(
      "output tiles split unevenly: {} cores x {} tiles, {} cores x {} tiles",
      split.group_1.num_cores(),
      split.group_1.units_per_core,
      split.group_2.num_cores(),
      split.group_2.units_per_core
    );
  }

  let staging = StagingPlan::interleaved(key.data_format);
  staging.check_capacity(device.l1_size())?;

  let mut program = Program::new(key, split.all_cores.clone(), addrs);
  program.circular_buffers = staging.circular_buffers(&split.all_cores, key.data_format, false);

  program.add_kernel(KernelSpec::data_movement(
    TaskArtifact::ReaderInterleaved,
    split.all_cores.clone(),
    NocId::Noc1,
    vec![1, 1],
  ));
  program.add_kernel(KernelSpec::data_movement(
    TaskArtifact::WriterInterleaved,
    split.all_cores.clone(),
    NocId::Noc0,
    vec![super::staging::CB_OUT as u32, 1],
  ));
  for group in [&split.group_1, &split.group_2] {
    program.add_kernel(KernelSpec::compute(
      TaskArtifact::ComputeTileBmm,
      group.cores.clone(),
      key.math_fidelity,
      tile_bmm_compute_args(shape, group.units_per_core).to_args(),
    ));
  }

  for a in split.assignments() {
    program.set_runtime_args(
      TaskArtifact::ReaderInterleaved,
      a.core,
      interleaved_reader_args(shape, &addrs, a.start, a.count).to_args(),
    )?;
    program.set_runtime_args(
      TaskArtifact::WriterInterleaved,
      a.core,
      interleaved_writer_args(addrs.dst, a.start, a.count).to_args(),
    )?;
  }
  Ok(program)
}

fn build_reuse_mcast(key: ProgramKey, device: &dyn Device, addrs: BufferAddresses) -> Result<Program> {
  let shape = &key.shape;
  let partition = BlockPartition::new(shape, key.grid, &key.tiling)?;
  let subblock = get_subblock_sizes(
    partition.per_core_m,
    partition.per_core_n,
    key.tiling.out_sharded,
    key.tiling.fp32_dest_acc_en,
  );
  info!(
    "-- Core Sizing -- in0_block_w={} -- per_core_M={} -- per_core_N={} -- out_subblock_h={} -- out_subblock_w={} --",
    partition.in0_block_w, partition.per_core_m, partition.per_core_n, subblock.0, subblock.1
  );

  let topology = GridTopology::new(
    device.grid_size(),
    CoreCoord::default(),
    partition.num_blocks_y,
    partition.num_blocks_x,
  )?;

  let staging = StagingPlan::blocked(&partition, key.data_format);
  staging.check_capacity(device.l1_size())?;
  debug!(
    "staging: in0 {} B, in1 {} B, out {} B of {} B L1",
    staging.in0.bytes,
    staging.in1.bytes,
    staging.out.bytes,
    device.l1_size()
  );

  let all_cores = CoreRangeSet::from(topology.all_cores);
  let mut program = Program::new(key, all_cores.clone(), addrs);
  program.circular_buffers = staging.circular_buffers(&all_cores, key.data_format, true);

  for (range, artifact) in topology.reader_ranges() {
    let noc = match artifact.mcast_roles() {
      Some((true, _)) => NocId::Noc0,
      _ => NocId::Noc1,
    };
    program.add_kernel(KernelSpec::data_movement(artifact, range.into(), noc, vec![1, 1]));
  }
  program.add_kernel(KernelSpec::data_movement(
    TaskArtifact::WriterTileLayout(NocId::Noc0),
    topology.all_except_left_column.into(),
    NocId::Noc0,
    vec![1],
  ));
  program.add_kernel(KernelSpec::data_movement(
    TaskArtifact::WriterTileLayout(NocId::Noc1),
    topology.left_column.into(),
    NocId::Noc1,
    vec![1],
  ));
  program.add_kernel(KernelSpec::compute(
    TaskArtifact::ComputeLargeBlock,
    all_cores.clone(),
    key.math_fidelity,
    large_block_compute_args(shape, &partition, subblock).to_args(),
  ));

  let mut pair = || SemaphorePair {
    sender: program.add_semaphore(all_cores.clone(), SEMAPHORE_INVALID),
    receiver: program.add_semaphore(all_cores.clone(), SEMAPHORE_INVALID),
  };
  let sems = McastSemaphoreIds { in0: pair(), in1: pair() };
  for group in topology.groups() {
    debug!(
      "{} group: sender {} -> {} receiver(s)",
      group.axis,
      group.sender,
      group.receivers.len()
    );
  }

  for core in topology.cores() {
    let role = topology.role(core);
    let reader = mcast_reader_args(shape, &partition, &topology, &sems, &addrs, core, |c| {
      device.worker_core_from_logical_core(c)
    });
    let writer = tile_layout_writer_args(shape, &partition, subblock, &topology, addrs.dst, core);
    debug!("core {} role {:?}: reader {:?}", core, role, reader.to_args());
    program.set_runtime_args(role.reader_artifact(), core, reader.to_args())?;
    program.set_runtime_args(role.writer_artifact(), core, writer.to_args())?;
  }
  Ok(program)
}

/// Built programs keyed by layout. Only cache hits skip planning.
#[derive(Debug, Default)]
pub struct ProgramCache {
  programs: HashMap<ProgramKey, Program>,
  hits: u64,
  misses: u64,
}

impl ProgramCache {
  pub fn new() -> Self {
    Self::default()
  }

  /// Cached program for `key`, building it on a miss. The flag is true on a hit.
  pub fn get_or_build(&mut self, key: ProgramKey, build: impl FnOnce() -> Result<Program>) -> Result<(&mut Program, bool)> {
    match self.programs.entry(key) {
      Entry::Occupied(e) => {
        self.hits += 1;
        Ok((e.into_mut(), true))
      },
      Entry::Vacant(e) => {
        let program = build()?;
        self.misses += 1;
        Ok((e.insert(program), false))
      },
    }
  }

  pub fn len(&self) -> usize {
    self.programs.len()
  }

  pub fn is_empty(&self) -> bool {
    self.programs.is_empty()
  }

  pub fn hits(&self) -> u64 {
    self.hits
  }

  pub fn misses(&self) -> u64 {
    self.misses
  }
}
