//! Property tests for work splitting and sub-block selection.

use gridmm::planner::subblock::SUBBLOCK_HW_CHOICES;
use gridmm::planner::{get_subblock_sizes, split_work_to_cores, CoreCoord};
use proptest::prelude::*;

fn grid() -> impl Strategy<Value = CoreCoord> {
  (1u32..=8, 1u32..=8).prop_map(|(x, y)| CoreCoord::new(x, y))
}

proptest! {
  #[test]
  fn split_counts_sum_to_total(grid in grid(), units in 1u32..=5000) {
    let split = split_work_to_cores(grid, units).unwrap();
    let cores = grid.area();
    let floor = units / cores.min(units);
    let ceil = units.div_ceil(cores.min(units));

    let assignments = split.assignments();
    prop_assert_eq!(assignments.iter().map(|a| a.count).sum::<u32>(), units);
    prop_assert_eq!(split.total_units(), units);
    for a in &assignments {
      prop_assert!(a.count == floor || a.count == ceil);
    }

    let (g1, g2) = (split.group_1.num_cores(), split.group_2.num_cores());
    prop_assert_eq!(g1 + g2, cores.min(units));
    prop_assert_eq!(split.num_cores, cores.min(units));
    prop_assert_eq!(g1 * split.group_1.units_per_core + g2 * split.group_2.units_per_core, units);
    prop_assert_eq!(split.group_1.units_per_core, ceil);
    if g2 > 0 {
      prop_assert_eq!(split.group_2.units_per_core, floor);
    }
  }

  #[test]
  fn split_runs_are_adjacent_and_distinct(grid in grid(), units in 1u32..=600) {
    let split = split_work_to_cores(grid, units).unwrap();
    let mut next = 0;
    let mut seen = std::collections::BTreeSet::new();
    for a in split.assignments() {
      prop_assert_eq!(a.start, next);
      prop_assert!(a.core.x < grid.x && a.core.y < grid.y);
      prop_assert!(seen.insert(a.core));
      prop_assert!(split.all_cores.contains(a.core));
      next += a.count;
    }
    prop_assert_eq!(next, units);
  }

  #[test]
  fn subblock_divides_block(m in 1u32..=64, n in 1u32..=64, sharded in any::<bool>(), fp32 in any::<bool>()) {
    let (h, w) = get_subblock_sizes(m, n, sharded, fp32);
    prop_assert_eq!(m % h, 0);
    prop_assert_eq!(n % w, 0);
    prop_assert!(h * w <= 8);
    if fp32 {
      prop_assert!(h * w <= 4);
    }
    if sharded {
      prop_assert_eq!(h, 1);
    }
  }

  #[test]
  fn subblock_is_first_dividing_candidate(m in 1u32..=64, n in 1u32..=64) {
    let picked = get_subblock_sizes(m, n, false, false);
    let first = SUBBLOCK_HW_CHOICES
      .iter()
      .copied()
      .find(|&(h, w)| m % h == 0 && n % w == 0);
    prop_assert_eq!(Some(picked), first);
  }
}

#[test]
fn empty_split_is_rejected() {
  assert!(split_work_to_cores(CoreCoord::new(8, 8), 0).is_err());
  assert!(split_work_to_cores(CoreCoord::new(0, 8), 10).is_err());
}

#[test]
fn sixteen_square_picks_four_by_two() {
  assert_eq!(get_subblock_sizes(16, 16, false, false), (4, 2));
}
