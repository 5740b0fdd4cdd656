use sim::models::Model;
use sim::simulator::{Connector, Simulation};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use super::cb::CbTable;
use super::compute::{ComputeTask, LargeBlockCompute, TileBmmCompute};
use super::dram::SharedDram;
use super::noc::{mcast_port, ready_port, PORT_NOC_IN};
use super::reader::{InterleavedReader, McastReader, ReaderTask};
use super::semaphore::SemaphoreTable;
use super::task::{MeshState, MeshTiming, SharedMeshState};
use super::worker::{Core, CoreTasks};
use super::writer::{InterleavedWriter, TileLayoutWriter, WriterTask};
use crate::error::{ConfigError, DeviceError};
use crate::planner::args::{
  InterleavedReaderArgs, InterleavedWriterArgs, LargeBlockComputeArgs, McastLink, McastReaderArgs, TileBmmComputeArgs,
  TileLayoutWriterArgs,
};
use crate::planner::program::{KernelKind, KernelSpec, Program, TaskArtifact};
use crate::planner::{CoreCoord, McastAxis, McastRole};

/// A program laid out as one DEVS model per core, ready to launch.
pub struct MeshSimulation {
  pub simulation: Simulation,
  pub cores: Vec<CoreCoord>,
  pub state: SharedMeshState,
}

fn protocol(core: CoreCoord, detail: impl Into<String>) -> DeviceError {
  DeviceError::Protocol {
    core: Core::model_id(core),
    detail: detail.into(),
  }
}

fn args_error(core: CoreCoord) -> impl Fn(ConfigError) -> DeviceError {
  move |e| protocol(core, e.to_string())
}

fn kernel_of<'a>(program: &'a Program, core: CoreCoord, kind: KernelKind) -> Result<&'a KernelSpec, DeviceError> {
  let mut found = program.kernels_on(core).into_iter().filter(|k| k.artifact.kind() == kind);
  match (found.next(), found.next()) {
    (Some(k), None) => Ok(k),
    (None, _) => Err(protocol(core, format!("no {:?} kernel", kind))),
    (Some(_), Some(_)) => Err(protocol(core, format!("more than one {:?} kernel", kind))),
  }
}

fn runtime_args(kernel: &KernelSpec, core: CoreCoord) -> Result<&[u32], DeviceError> {
  kernel
    .runtime_args
    .get(&core)
    .map(Vec::as_slice)
    .ok_or_else(|| protocol(core, format!("{} has no runtime args", kernel.artifact)))
}

fn build_tasks(program: &Program, core: CoreCoord) -> Result<(CoreTasks, Option<McastReaderArgs>), DeviceError> {
  let reader_kernel = kernel_of(program, core, KernelKind::Reader)?;
  let compute_kernel = kernel_of(program, core, KernelKind::Compute)?;
  let writer_kernel = kernel_of(program, core, KernelKind::Writer)?;

  let (reader, mcast) = match reader_kernel.artifact.mcast_roles() {
    Some((in0_sender, in1_sender)) => {
      let args = McastReaderArgs::from_args(runtime_args(reader_kernel, core)?).map_err(args_error(core))?;
      (ReaderTask::Mcast(McastReader::new(args, in0_sender, in1_sender)), Some(args))
    },
    None => {
      let args = InterleavedReaderArgs::from_args(runtime_args(reader_kernel, core)?).map_err(args_error(core))?;
      (ReaderTask::Interleaved(InterleavedReader::new(args)), None)
    },
  };

  let compute = match compute_kernel.artifact {
    TaskArtifact::ComputeLargeBlock => ComputeTask::LargeBlock(LargeBlockCompute::new(
      LargeBlockComputeArgs::from_args(&compute_kernel.compile_args).map_err(args_error(core))?,
    )),
    _ => ComputeTask::TileBmm(TileBmmCompute::new(
      TileBmmComputeArgs::from_args(&compute_kernel.compile_args).map_err(args_error(core))?,
    )),
  };

  let writer = match writer_kernel.artifact {
    TaskArtifact::WriterTileLayout(_) => WriterTask::TileLayout(TileLayoutWriter::new(
      TileLayoutWriterArgs::from_args(runtime_args(writer_kernel, core)?).map_err(args_error(core))?,
    )),
    _ => WriterTask::Interleaved(InterleavedWriter::new(
      InterleavedWriterArgs::from_args(runtime_args(writer_kernel, core)?).map_err(args_error(core))?,
    )),
  };

  Ok((CoreTasks { reader, compute, writer }, mcast))
}

/// NoC routes of one core's reader: data fans out from a sender, ready signals flow back to it.
fn mcast_connectors(
  core: CoreCoord,
  axis: McastAxis,
  role: McastRole,
  link: &McastLink,
  used: &BTreeSet<CoreCoord>,
  to_logical: &impl Fn(CoreCoord) -> Option<CoreCoord>,
) -> Result<Vec<Connector>, DeviceError> {
  let source = Core::model_id(core);
  let route = |target: CoreCoord, port: &str| {
    let target_id = Core::model_id(target);
    Connector::new(
      format!("{}:{}->{}", source, port, target_id),
      source.clone(),
      target_id,
      port.to_string(),
      PORT_NOC_IN.to_string(),
    )
  };
  let logical = |physical: CoreCoord| {
    to_logical(physical)
      .filter(|c| used.contains(c))
      .ok_or_else(|| protocol(core, format!("{} multicast peer {} is not a program core", axis, physical)))
  };

  match role {
    McastRole::Sender => {
      let dests = link.destinations();
      if dests.len() as u32 != link.num_dests {
        return Err(protocol(
          core,
          format!("{} rectangle covers {} cores, expected {}", axis, dests.len(), link.num_dests),
        ));
      }
      dests
        .into_iter()
        .map(|d| logical(d).map(|target| route(target, mcast_port(axis))))
        .collect()
    },
    McastRole::Receiver => {
      let sender = logical(link.sender)?;
      Ok(vec![route(sender, ready_port(axis))])
    },
  }
}

/// Lay `program` out on the mesh. Physical NoC coordinates are logical plus `noc_origin`.
pub fn create_simulation(
  program: &Program,
  dram: &SharedDram,
  timing: MeshTiming,
  noc_origin: CoreCoord,
) -> Result<MeshSimulation, DeviceError> {
  let state: SharedMeshState = Arc::new(Mutex::new(MeshState::default()));
  let cores = program.cores.cores();
  let used: BTreeSet<CoreCoord> = cores.iter().copied().collect();
  let to_logical = |p: CoreCoord| {
    let x = p.x.checked_sub(noc_origin.x)?;
    let y = p.y.checked_sub(noc_origin.y)?;
    Some(CoreCoord::new(x, y))
  };

  let mut models = Vec::with_capacity(cores.len());
  let mut connectors = Vec::new();
  for &core in &cores {
    let (tasks, mcast) = build_tasks(program, core)?;
    if let Some(args) = mcast {
      for (axis, link) in [(McastAxis::In0, &args.in0_mcast), (McastAxis::In1, &args.in1_mcast)] {
        let role = match &tasks.reader {
          ReaderTask::Mcast(r) => r.role(axis),
          ReaderTask::Interleaved(_) => McastRole::Sender,
        };
        connectors.extend(mcast_connectors(core, axis, role, link, &used, &to_logical)?);
      }
    }

    let fidelity = kernel_of(program, core, KernelKind::Compute)?
      .math_fidelity
      .unwrap_or(program.key.math_fidelity);
    let core_timing = MeshTiming {
      math_cycles_per_tile: fidelity.cycles_per_tile() as f64,
      ..timing
    };
    let model = Core::new(
      core,
      tasks,
      CbTable::for_core(&program.circular_buffers, core),
      SemaphoreTable::for_core(&program.semaphores, core),
      core_timing,
      dram.clone(),
      state.clone(),
    );
    models.push(Model::new(Core::model_id(core), Box::new(model)));
  }

  Ok(MeshSimulation {
    simulation: Simulation::post(models, connectors),
    cores,
    state,
  })
}
