use log::{debug, info, warn};
use std::time::Instant;

use super::device::{Device, SimDevice};
use super::utils::report::RunReport;
use crate::arch::mesh::dram::DramBuffer;
use crate::error::{ConfigError, DeviceError, Result};
use crate::host::layout::TiledMatrix;
use crate::planner::args::BufferAddresses;
use crate::planner::program::{build_program, ProgramCache, ProgramKey};
use crate::planner::shape::{MatmulParams, MatmulShape};

/// Runs matmuls on a device, keeping built programs for replay.
pub struct MatmulRunner<D: Device = SimDevice> {
  device: D,
  cache: ProgramCache,
}

fn device_address(buffer: &DramBuffer) -> std::result::Result<u32, ConfigError> {
  u32::try_from(buffer.address)
    .map_err(|_| ConfigError::InvalidParameter(format!("buffer address {:#x} exceeds 32 bits", buffer.address)))
}

impl<D: Device> MatmulRunner<D> {
  pub fn new(device: D) -> Self {
    Self {
      device,
      cache: ProgramCache::new(),
    }
  }

  pub fn device(&self) -> &D {
    &self.device
  }

  pub fn device_mut(&mut self) -> &mut D {
    &mut self.device
  }

  pub fn cache(&self) -> &ProgramCache {
    &self.cache
  }

  /// C = A * B with every operand in tiled layout. Inputs are rounded to
  /// `params.data_format` before upload, and so is the result.
  pub fn run_matmul(&mut self, a: &[f32], b: &[f32], out: &mut [f32], params: &MatmulParams) -> Result<RunReport> {
    let mut reports = self.run_matmul_repeat(a, b, out, params, 1)?;
    reports
      .pop()
      .ok_or_else(|| DeviceError::Simulation("run produced no report".to_string()).into())
  }

  /// C = A * B on tiled host matrices. The shape comes from the operands,
  /// replacing `params.shape`. A single B matrix is broadcast over A's batches.
  pub fn run_matmul_matrices(
    &mut self,
    a: &TiledMatrix,
    b: &TiledMatrix,
    params: &MatmulParams,
    repeat: u32,
  ) -> Result<(TiledMatrix, Vec<RunReport>)> {
    let shape = MatmulShape::from_operands(a.rows, a.cols, b.rows, b.cols)?;
    let bcast_batch = match b.batch {
      n if n == a.batch => false,
      1 => true,
      n => {
        return Err(ConfigError::InvalidParameter(format!("B holds {} batches, A holds {}", n, a.batch)).into());
      },
    };
    let params = MatmulParams {
      shape: shape.with_batch(a.batch, bcast_batch),
      ..*params
    };
    params.shape.validate()?;
    let mut out = TiledMatrix::zeros(shape.m, shape.n, a.batch);
    let reports = self.run_matmul_repeat(&a.data, &b.data, &mut out.data, &params, repeat)?;
    Ok((out, reports))
  }

  /// Upload the operands once and enqueue the same matmul `repeat` times.
  /// Every run after the first replays the cached program.
  pub fn run_matmul_repeat(
    &mut self,
    a: &[f32],
    b: &[f32],
    out: &mut [f32],
    params: &MatmulParams,
    repeat: u32,
  ) -> Result<Vec<RunReport>> {
    if repeat == 0 {
      return Err(ConfigError::InvalidParameter("repeat must be at least 1".to_string()).into());
    }
    let shape = params.shape;
    shape.validate()?;
    shape.check_buffers(a.len(), b.len(), out.len())?;

    let format = params.data_format;
    let page_size = format.tile_size() as u64;
    let sizes = [shape.a_tiles(), shape.b_tiles(), shape.c_tiles()];
    let mut buffers = Vec::with_capacity(sizes.len());
    for tiles in sizes {
      match self.device.allocate_buffer(tiles as u64 * page_size, page_size) {
        Ok(buffer) => buffers.push(buffer),
        Err(e) => {
          self.release(&buffers);
          return Err(e.into());
        },
      }
    }

    let result = self.run_on_buffers(a, b, out, params, &buffers, repeat);
    self.release(&buffers);
    result
  }

  fn run_on_buffers(
    &mut self,
    a: &[f32],
    b: &[f32],
    out: &mut [f32],
    params: &MatmulParams,
    buffers: &[DramBuffer],
    repeat: u32,
  ) -> Result<Vec<RunReport>> {
    let (src0, src1, dst) = match buffers {
      [src0, src1, dst] => (src0, src1, dst),
      _ => return Err(DeviceError::Simulation(format!("expected 3 buffers, got {}", buffers.len())).into()),
    };
    let format = params.data_format;
    for (buffer, data) in [(src0, a), (src1, b)] {
      let mut values = data.to_vec();
      format.quantize(&mut values);
      self.device.write_buffer(buffer, &values)?;
    }

    let addrs = BufferAddresses {
      src0: device_address(src0)?,
      src1: device_address(src1)?,
      dst: device_address(dst)?,
    };
    let key = ProgramKey::new(params, self.device.grid_size());
    let mut reports = Vec::with_capacity(repeat as usize);
    for i in 0..repeat {
      let device = &self.device;
      let start = Instant::now();
      let (program, hit) = self
        .cache
        .get_or_build(key, || build_program(params, device, addrs))?;
      if hit {
        program.bind_buffers(addrs)?;
        debug!("program cache hit for {:?}", key.shape);
      } else {
        info!("built {} program in {:.2?}", key.variant, start.elapsed());
      }

      let mut report = self.device.enqueue_program(program)?;
      report.program_cache_hit = hit;
      debug!("run {}/{}: {} cycles, cache hit {}", i + 1, repeat, report.cycles, hit);
      reports.push(report);
    }

    let mut values = self.device.read_buffer(dst)?;
    if values.len() < out.len() {
      return Err(DeviceError::OutOfBounds {
        address: dst.address,
        page: values.len() as u64,
        pages: dst.num_pages(),
      }
      .into());
    }
    values.truncate(out.len());
    format.quantize(&mut values);
    out.copy_from_slice(&values);
    if let Some(last) = reports.last() {
      info!(
        "matmul {}x{}x{} batch {} on {}: {} cycles, {} semaphore waits",
        params.shape.m,
        params.shape.n,
        params.shape.k,
        params.shape.batch,
        key.grid,
        last.cycles,
        last.semaphore_waits()
      );
    }
    Ok(reports)
  }

  fn release(&mut self, buffers: &[DramBuffer]) {
    for buffer in buffers {
      if let Err(e) = self.device.deallocate_buffer(buffer) {
        warn!("failed to free buffer at {:#x}: {}", buffer.address, e);
      }
    }
  }
}

impl Default for MatmulRunner<SimDevice> {
  fn default() -> Self {
    Self::new(SimDevice::default())
  }
}
