/// Output sub-block candidates `(h, w)`, largest and most rectangular first.
pub const SUBBLOCK_HW_CHOICES: [(u32, u32); 20] = [
  (4, 2),
  (2, 4),
  (8, 1),
  (1, 8),
  (7, 1),
  (1, 7),
  (3, 2),
  (2, 3),
  (6, 1),
  (1, 6),
  (5, 1),
  (1, 5),
  (2, 2),
  (4, 1),
  (1, 4),
  (3, 1),
  (1, 3),
  (2, 1),
  (1, 2),
  (1, 1),
];

/// Destination register budget in tiles when accumulating in fp32.
const FP32_DEST_TILES: u32 = 4;

/// First candidate dividing an `m_tiles x n_tiles` block.
///
/// With `out_sharded` only single-row sub-blocks whose width divides
/// `n_tiles` qualify. With `fp32_dest_acc_en` sub-blocks larger than the
/// fp32 destination budget are skipped. `(1, 1)` always qualifies.
pub fn get_subblock_sizes(m_tiles: u32, n_tiles: u32, out_sharded: bool, fp32_dest_acc_en: bool) -> (u32, u32) {
  for &(h, w) in SUBBLOCK_HW_CHOICES.iter() {
    if fp32_dest_acc_en && h * w > FP32_DEST_TILES {
      continue;
    }
    if out_sharded && (n_tiles % w != 0 || h != 1) {
      continue;
    }
    if m_tiles % h == 0 && n_tiles % w == 0 {
      return (h, w);
    }
  }
  (1, 1)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn square_16_picks_4x2() {
    assert_eq!(get_subblock_sizes(16, 16, false, false), (4, 2));
  }

  #[test]
  fn order_breaks_ties() {
    assert_eq!(get_subblock_sizes(2, 4, false, false), (2, 4));
    assert_eq!(get_subblock_sizes(8, 1, false, false), (8, 1));
    assert_eq!(get_subblock_sizes(12, 12, false, false), (4, 2));
    assert_eq!(get_subblock_sizes(9, 9, false, false), (3, 1));
    assert_eq!(get_subblock_sizes(7, 13, false, false), (7, 1));
    assert_eq!(get_subblock_sizes(11, 13, false, false), (1, 1));
  }

  #[test]
  fn fp32_accumulation_caps_area() {
    assert_eq!(get_subblock_sizes(16, 16, false, true), (2, 2));
    assert_eq!(get_subblock_sizes(8, 1, false, true), (4, 1));
  }

  #[test]
  fn sharded_output_uses_single_rows() {
    assert_eq!(get_subblock_sizes(16, 16, true, false), (1, 8));
    assert_eq!(get_subblock_sizes(4, 6, true, false), (1, 6));
    assert_eq!(get_subblock_sizes(4, 6, true, true), (1, 3));
  }
}
