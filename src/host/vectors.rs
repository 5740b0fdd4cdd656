//! Test vectors and reference results.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::planner::shape::MatmulShape;

/// `len` values uniform in `[offset, offset + max)`, reproducible from `seed`.
pub fn random_vector(len: usize, max: f32, seed: u64, offset: f32) -> Vec<f32> {
  let mut rng = StdRng::seed_from_u64(seed);
  (0..len).map(|_| rng.random::<f32>() * max + offset).collect()
}

/// Row-major product of `shape`, accumulated in f64.
///
/// `a` holds `batch` M x K matrices and `b` holds one K x N matrix per batch,
/// or a single one when the batch is broadcast.
pub fn reference_matmul(a: &[f32], b: &[f32], shape: &MatmulShape) -> Vec<f32> {
  let (m, n, k) = (shape.m as usize, shape.n as usize, shape.k as usize);
  let mut out = vec![0.0; shape.batch as usize * m * n];
  for batch in 0..shape.batch as usize {
    let a = &a[batch * m * k..(batch + 1) * m * k];
    let b_batch = if shape.bcast_batch { 0 } else { batch };
    let b = &b[b_batch * k * n..(b_batch + 1) * k * n];
    let c = &mut out[batch * m * n..(batch + 1) * m * n];
    for i in 0..m {
      for j in 0..n {
        let acc: f64 = (0..k).map(|x| a[i * k + x] as f64 * b[x * n + j] as f64).sum();
        c[i * n + j] = acc as f32;
      }
    }
  }
  out
}

/// Pearson correlation between two result vectors.
pub fn pcc(expected: &[f32], actual: &[f32]) -> f64 {
  if expected.len() != actual.len() || expected.is_empty() {
    return 0.0;
  }
  if expected == actual {
    return 1.0;
  }
  let n = expected.len() as f64;
  let mean_e = expected.iter().map(|&v| v as f64).sum::<f64>() / n;
  let mean_a = actual.iter().map(|&v| v as f64).sum::<f64>() / n;
  let (mut cov, mut var_e, mut var_a) = (0.0, 0.0, 0.0);
  for (&e, &a) in expected.iter().zip(actual) {
    let de = e as f64 - mean_e;
    let da = a as f64 - mean_a;
    cov += de * da;
    var_e += de * de;
    var_a += da * da;
  }
  if var_e == 0.0 || var_a == 0.0 {
    return 0.0;
  }
  cov / (var_e.sqrt() * var_a.sqrt())
}

/// Element-wise `|a - e| <= atol + rtol * |e|`.
pub fn allclose(expected: &[f32], actual: &[f32], rtol: f32, atol: f32) -> bool {
  expected.len() == actual.len()
    && expected
      .iter()
      .zip(actual)
      .all(|(&e, &a)| (a - e).abs() <= atol + rtol * e.abs())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn random_vectors_are_reproducible() {
    let a = random_vector(64, 1.0, 123, 0.0);
    assert_eq!(a, random_vector(64, 1.0, 123, 0.0));
    assert_ne!(a, random_vector(64, 1.0, 12522, 0.0));
    assert!(a.iter().all(|&v| (0.0..1.0).contains(&v)));
  }

  #[test]
  fn broadcast_batch_reuses_b() {
    let shape = MatmulShape::new(1, 1, 2).with_batch(2, true);
    let out = reference_matmul(&[1.0, 2.0, 3.0, 4.0], &[10.0, 100.0], &shape);
    assert_eq!(out, vec![210.0, 430.0]);
  }

  #[test]
  fn pcc_of_scaled_copy_is_one() {
    let e = [1.0, 2.0, 3.0, 4.0];
    let a = [2.0, 4.0, 6.0, 8.0];
    assert!((pcc(&e, &a) - 1.0).abs() < 1e-12);
    assert!(pcc(&e, &[4.0, 3.0, 2.0, 1.0]) < 0.0);
  }
}
