// Bulk memory: paged DRAM buffers shared by every core

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::error::DeviceError;
use crate::planner::shape::TILE_HW;

pub type Tile = Vec<f32>;

/// First byte handed out by the allocator.
const DRAM_BASE: u64 = 0x1000;
const DRAM_ALIGN: u64 = 32;
/// Addresses travel in 32-bit runtime args.
const DRAM_LIMIT: u64 = u32::MAX as u64;

/// Handle of one allocated buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DramBuffer {
  pub address: u64,
  pub size: u64,
  pub page_size: u64,
}

impl DramBuffer {
  pub fn num_pages(&self) -> u64 {
    self.size / self.page_size
  }
}

#[derive(Debug)]
struct Region {
  /// Address space held, `size` rounded up to the allocation alignment.
  span: u64,
  num_pages: u64,
  /// Pages never written read back as zeros.
  pages: BTreeMap<u64, Tile>,
}

/// DRAM holding one f32 tile per page. Page bytes only drive addressing.
#[derive(Debug)]
pub struct BulkMemory {
  regions: BTreeMap<u64, Region>,
  /// Free address ranges, start to length, never adjacent.
  free: BTreeMap<u64, u64>,
  allocations: u64,
}

pub type SharedDram = Arc<Mutex<BulkMemory>>;

impl Default for BulkMemory {
  fn default() -> Self {
    Self::new()
  }
}

impl BulkMemory {
  pub fn new() -> Self {
    Self {
      regions: BTreeMap::new(),
      free: BTreeMap::from([(DRAM_BASE, DRAM_LIMIT - DRAM_BASE)]),
      allocations: 0,
    }
  }

  /// First-fit allocation out of the free ranges.
  pub fn allocate(&mut self, size: u64, page_size: u64) -> Result<DramBuffer, DeviceError> {
    if page_size == 0 || size % page_size != 0 {
      return Err(DeviceError::Simulation(format!(
        "buffer size {} is not a whole number of {} byte pages",
        size, page_size
      )));
    }
    let span = size.div_ceil(DRAM_ALIGN).max(1) * DRAM_ALIGN;
    let (address, len) = self
      .free
      .iter()
      .find(|(_, &len)| len >= span)
      .map(|(&start, &len)| (start, len))
      .ok_or_else(|| DeviceError::Simulation(format!("DRAM exhausted allocating {} bytes", size)))?;
    self.free.remove(&address);
    if len > span {
      self.free.insert(address + span, len - span);
    }
    self.regions.insert(
      address,
      Region {
        span,
        num_pages: size / page_size,
        pages: BTreeMap::new(),
      },
    );
    self.allocations += 1;
    Ok(DramBuffer { address, size, page_size })
  }

  /// Return a buffer's range to the free list, merging it with free neighbours.
  pub fn deallocate(&mut self, address: u64) -> Result<(), DeviceError> {
    let region = self.regions.remove(&address).ok_or(DeviceError::UnknownBuffer(address))?;
    let (mut start, mut len) = (address, region.span);
    if let Some((&prev, &prev_len)) = self.free.range(..start).next_back() {
      if prev + prev_len == start {
        self.free.remove(&prev);
        start = prev;
        len += prev_len;
      }
    }
    if let Some(next_len) = self.free.remove(&(start + len)) {
      len += next_len;
    }
    self.free.insert(start, len);
    Ok(())
  }

  fn region(&self, address: u64) -> Result<&Region, DeviceError> {
    self.regions.get(&address).ok_or(DeviceError::UnknownBuffer(address))
  }

  fn region_mut(&mut self, address: u64) -> Result<&mut Region, DeviceError> {
    self.regions.get_mut(&address).ok_or(DeviceError::UnknownBuffer(address))
  }

  pub fn read_page(&self, address: u64, page: u64) -> Result<Tile, DeviceError> {
    let region = self.region(address)?;
    if page >= region.num_pages {
      return Err(DeviceError::OutOfBounds {
        address,
        page,
        pages: region.num_pages,
      });
    }
    Ok(region.pages.get(&page).cloned().unwrap_or_else(|| vec![0.0; TILE_HW]))
  }

  pub fn write_page(&mut self, address: u64, page: u64, tile: Tile) -> Result<(), DeviceError> {
    let region = self.region_mut(address)?;
    if page >= region.num_pages {
      return Err(DeviceError::OutOfBounds {
        address,
        page,
        pages: region.num_pages,
      });
    }
    region.pages.insert(page, tile);
    Ok(())
  }

  /// Fill a buffer from tiled host data, one tile per page.
  pub fn write_buffer(&mut self, address: u64, data: &[f32]) -> Result<(), DeviceError> {
    let region = self.region_mut(address)?;
    let used = data.len().div_ceil(TILE_HW) as u64;
    if used > region.num_pages {
      return Err(DeviceError::OutOfBounds {
        address,
        page: used,
        pages: region.num_pages,
      });
    }
    for (page, chunk) in (0u64..).zip(data.chunks(TILE_HW)) {
      let tile = region.pages.entry(page).or_insert_with(|| vec![0.0; TILE_HW]);
      tile[..chunk.len()].copy_from_slice(chunk);
    }
    Ok(())
  }

  pub fn read_buffer(&self, address: u64) -> Result<Vec<f32>, DeviceError> {
    let region = self.region(address)?;
    let mut data = vec![0.0; region.num_pages as usize * TILE_HW];
    for (&page, tile) in &region.pages {
      let at = page as usize * TILE_HW;
      data[at..at + TILE_HW].copy_from_slice(tile);
    }
    Ok(data)
  }

  pub fn num_buffers(&self) -> usize {
    self.regions.len()
  }

  /// Successful allocations since creation.
  pub fn allocations(&self) -> u64 {
    self.allocations
  }

  pub fn free_bytes(&self) -> u64 {
    self.free.values().sum()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn allocations_do_not_overlap() {
    let mut dram = BulkMemory::new();
    let a = dram.allocate(4 * 2048, 2048).unwrap();
    let b = dram.allocate(2 * 1088, 1088).unwrap();
    assert!(b.address >= a.address + a.size);
    assert_eq!(b.address % DRAM_ALIGN, 0);
    assert_eq!(a.num_pages(), 4);
  }

  #[test]
  fn pages_round_trip_through_buffers() {
    let mut dram = BulkMemory::new();
    let buf = dram.allocate(2 * 2048, 2048).unwrap();
    let data: Vec<f32> = (0..2 * TILE_HW).map(|i| i as f32).collect();
    dram.write_buffer(buf.address, &data).unwrap();
    assert_eq!(dram.read_page(buf.address, 1).unwrap()[0], TILE_HW as f32);
    dram.write_page(buf.address, 0, vec![7.0; TILE_HW]).unwrap();
    assert_eq!(dram.read_buffer(buf.address).unwrap()[TILE_HW - 1], 7.0);
  }

  #[test]
  fn freed_space_is_reused() {
    let mut dram = BulkMemory::new();
    let total = dram.free_bytes();
    let gib = 1 << 30;
    for _ in 0..8 {
      let buf = dram.allocate(gib, 2048).unwrap();
      assert_eq!(buf.address, DRAM_BASE);
      dram.deallocate(buf.address).unwrap();
    }
    assert_eq!(dram.free_bytes(), total);
    assert_eq!(dram.allocations(), 8);
  }

  #[test]
  fn neighbours_coalesce_on_free() {
    let mut dram = BulkMemory::new();
    let a = dram.allocate(4096, 2048).unwrap();
    let b = dram.allocate(4096, 2048).unwrap();
    let c = dram.allocate(4096, 2048).unwrap();
    dram.deallocate(a.address).unwrap();
    dram.deallocate(c.address).unwrap();
    // the hole left by `a` is too small
    let big = dram.allocate(8192, 2048).unwrap();
    assert_eq!(big.address, c.address);
    dram.deallocate(big.address).unwrap();
    dram.deallocate(b.address).unwrap();
    assert_eq!(dram.free.len(), 1);
    assert_eq!(dram.allocate(12288, 2048).unwrap().address, a.address);
  }

  #[test]
  fn bad_accesses_fault() {
    let mut dram = BulkMemory::new();
    let buf = dram.allocate(2048, 2048).unwrap();
    assert!(matches!(dram.read_page(buf.address, 1), Err(DeviceError::OutOfBounds { .. })));
    assert!(matches!(dram.read_page(0xdead, 0), Err(DeviceError::UnknownBuffer(0xdead))));
    dram.deallocate(buf.address).unwrap();
    assert!(dram.deallocate(buf.address).is_err());
  }
}
