//! Symmetric (sign-flip) bootstrap of a sum of score contributions.
//!
//! Each replicate multiplies every contribution by an independent Rademacher
//! sign and re-sums. Seeds for the replicates are drawn up front from the
//! caller's generator, so the replicate sequence does not depend on how rayon
//! schedules the work.

use std::fmt;
use std::str::FromStr;

use ndarray::{Array1, ArrayView1};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use rayon::prelude::*;

/// Minimum number of replicates per parallel task.
const MIN_CHUNK_SIZE: usize = 32;

/// What a single sign flip applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlipScheme {
    /// One sign per unit, shared by all of its periods.
    #[default]
    Unit,
    /// One sign per unit-period observation.
    Observation,
}

impl fmt::Display for FlipScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlipScheme::Unit => f.write_str("unit"),
            FlipScheme::Observation => f.write_str("observation"),
        }
    }
}

impl FromStr for FlipScheme {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "unit" => Ok(FlipScheme::Unit),
            "observation" => Ok(FlipScheme::Observation),
            other => Err(format!(
                "unknown flip scheme '{other}' (expected unit or observation)"
            )),
        }
    }
}

/// `n_boot` replicates of `sum_i v_i h_i` with `v_i` uniform on {-1, +1}.
pub fn sign_flip_replicates<R: RngCore>(
    contributions: ArrayView1<f64>,
    n_boot: usize,
    rng: &mut R,
) -> Array1<f64> {
    let seeds: Vec<u64> = (0..n_boot).map(|_| rng.next_u64()).collect();
    let replicates: Vec<f64> = seeds
        .par_iter()
        .with_min_len(MIN_CHUNK_SIZE)
        .map(|&seed| {
            let mut replicate_rng = StdRng::seed_from_u64(seed);
            contributions
                .iter()
                .map(|&h| if replicate_rng.gen_bool(0.5) { h } else { -h })
                .sum::<f64>()
        })
        .collect();
    Array1::from_vec(replicates)
}

/// Unbiased (n - 1) sample variance.
pub fn sample_variance(values: ArrayView1<f64>) -> f64 {
    let n = values.len();
    if n < 2 {
        return f64::NAN;
    }
    let mean = values.sum() / n as f64;
    values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1) as f64
}
