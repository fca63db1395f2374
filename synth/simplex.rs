//! # Weight Simplex Solver
//!
//! For one target unit, finds the donor weights `w` minimizing
//! `||e_i - E w||^2` subject to `sum(w) = 1`, where `e_i` is the unit's
//! residualized outcome series and the columns of `E` are the residualized
//! series of its donors.
//!
//! The affine problem is solved in closed form from the normal equations with a
//! Lagrange multiplier for the sum constraint. A symmetric eigendecomposition of
//! `E'E` both applies the inverse and measures its conditioning, so a system that
//! is singular to machine precision is reported instead of regularized.
//!
//! Collinear donors are screened with a Gram-Schmidt pass before the solve; the
//! estimator drops them from the basis for the current iteration only.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use ndarray_linalg::{Eigh, UPLO};
use thiserror::Error;

use crate::model::WeightConstraint;

/// Reciprocal condition number of `E'E` below which it is treated as singular.
pub const SINGULAR_RCOND: f64 = 1e-12;

/// Relative residual norm below which a donor counts as a combination of earlier donors.
pub const COLLINEAR_TOLERANCE: f64 = 1e-6;

const MAX_PROJECTED_GRADIENT_ITERATIONS: usize = 20_000;
const PROJECTED_GRADIENT_STEP_TOLERANCE: f64 = 1e-13;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum WeightError {
    #[error(
        "Donor Gram matrix is singular to machine precision (reciprocal condition number {rcond:.3e}); donors are collinear."
    )]
    Singular { rcond: f64 },

    #[error("No donor units are available to build a synthetic counterfactual.")]
    NoDonors,
}

/// Weights over the full donor set, with zeros for screened-out donors.
#[derive(Debug, Clone)]
pub struct SimplexSolution {
    pub weights: Array1<f64>,
    /// Positions (within the donor columns) that were dropped as collinear.
    pub excluded: Vec<usize>,
}

/// Gathers the donor columns of `unit` from a `T x N` residual matrix.
///
/// Returns the `T x k` donor matrix and the unit index of each column. With
/// `held_out`, that unit is skipped as well (the leave-two-out slicing).
pub fn donor_columns(
    residuals: ArrayView2<f64>,
    unit: usize,
    held_out: Option<usize>,
) -> (Array2<f64>, Vec<usize>) {
    let donors: Vec<usize> = (0..residuals.ncols())
        .filter(|&j| j != unit && Some(j) != held_out)
        .collect();
    (residuals.select(Axis(1), &donors), donors)
}

/// Closed-form least squares on the affine simplex `sum(w) = 1`.
///
/// Fails with [`WeightError::Singular`] when `E'E` is numerically singular.
pub fn solve_affine_weights(
    target: ArrayView1<f64>,
    donors: ArrayView2<f64>,
) -> Result<Array1<f64>, WeightError> {
    let k = donors.ncols();
    match k {
        0 => return Err(WeightError::NoDonors),
        1 => return Ok(Array1::ones(1)),
        _ => {}
    }

    let gram = donors.t().dot(&donors);
    let cross = donors.t().dot(&target);

    let (eigenvalues, eigenvectors) = gram
        .eigh(UPLO::Lower)
        .map_err(|_| WeightError::Singular { rcond: f64::NAN })?;
    let largest = eigenvalues.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let smallest = eigenvalues.iter().cloned().fold(f64::INFINITY, f64::min);
    let rcond = if largest > 0.0 { smallest / largest } else { 0.0 };
    if !rcond.is_finite() || rcond < SINGULAR_RCOND {
        return Err(WeightError::Singular { rcond });
    }

    let apply_inverse = |v: &Array1<f64>| -> Array1<f64> {
        let projected = eigenvectors.t().dot(v) / &eigenvalues;
        eigenvectors.dot(&projected)
    };
    let unconstrained = apply_inverse(&cross);
    let direction = apply_inverse(&Array1::ones(k));
    let multiplier = (1.0 - unconstrained.sum()) / direction.sum();
    let mut weights = unconstrained;
    weights.scaled_add(multiplier, &direction);

    // Round-off in the solve can leave the sum a few ulps off one.
    let drift = 1.0 - weights.sum();
    weights.mapv_inplace(|w| w + drift / k as f64);
    Ok(weights)
}

/// Least squares on the probability simplex (`w >= 0`, `sum(w) = 1`) by projected gradient.
///
/// Starts from `warm_start` when given, so the returned row never fits worse than it.
pub fn solve_nonnegative_weights(
    target: ArrayView1<f64>,
    donors: ArrayView2<f64>,
    warm_start: Option<ArrayView1<f64>>,
) -> Result<Array1<f64>, WeightError> {
    let k = donors.ncols();
    match k {
        0 => return Err(WeightError::NoDonors),
        1 => return Ok(Array1::ones(1)),
        _ => {}
    }

    let gram = donors.t().dot(&donors);
    let cross = donors.t().dot(&target);
    let mut weights = match warm_start {
        Some(w) if w.len() == k => project_onto_simplex(w),
        _ => Array1::from_elem(k, 1.0 / k as f64),
    };

    let (eigenvalues, _) = gram
        .eigh(UPLO::Lower)
        .map_err(|_| WeightError::Singular { rcond: f64::NAN })?;
    let lipschitz = eigenvalues.iter().cloned().fold(0.0_f64, f64::max);
    if lipschitz <= 0.0 {
        return Ok(weights);
    }
    let step = 1.0 / lipschitz;

    for _ in 0..MAX_PROJECTED_GRADIENT_ITERATIONS {
        let gradient = gram.dot(&weights) - &cross;
        let mut candidate = weights.clone();
        candidate.scaled_add(-step, &gradient);
        let candidate = project_onto_simplex(candidate.view());
        let change = candidate
            .iter()
            .zip(weights.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0_f64, f64::max);
        weights = candidate;
        if change < PROJECTED_GRADIENT_STEP_TOLERANCE {
            break;
        }
    }
    Ok(weights)
}

/// Euclidean projection onto `{w : w >= 0, sum(w) = 1}`.
pub fn project_onto_simplex(v: ArrayView1<f64>) -> Array1<f64> {
    let mut sorted = v.to_vec();
    sorted.sort_by(|a, b| b.total_cmp(a));
    let mut cumulative = 0.0;
    let mut threshold = 0.0;
    for (j, &u) in sorted.iter().enumerate() {
        cumulative += u;
        let candidate = (cumulative - 1.0) / (j + 1) as f64;
        if u - candidate > 0.0 {
            threshold = candidate;
        }
    }
    v.mapv(|x| (x - threshold).max(0.0))
}

/// Positions of donors whose residual series is (numerically) a linear
/// combination of earlier donors, by modified Gram-Schmidt in column order.
///
/// At least one donor is always kept.
pub fn collinear_donors(donors: ArrayView2<f64>) -> Vec<usize> {
    let k = donors.ncols();
    let max_norm = donors
        .axis_iter(Axis(1))
        .map(|c| c.dot(&c).sqrt())
        .fold(0.0_f64, f64::max);
    if k == 0 {
        return Vec::new();
    }
    if max_norm == 0.0 {
        return (1..k).collect();
    }
    let threshold = COLLINEAR_TOLERANCE * max_norm;

    let mut basis: Vec<Array1<f64>> = Vec::new();
    let mut excluded = Vec::new();
    for (j, column) in donors.axis_iter(Axis(1)).enumerate() {
        let mut residual = column.to_owned();
        for q in &basis {
            let coefficient = q.dot(&residual);
            residual.scaled_add(-coefficient, q);
        }
        let norm = residual.dot(&residual).sqrt();
        if norm <= threshold {
            excluded.push(j);
        } else {
            basis.push(residual / norm);
        }
    }
    excluded
}

/// Solves one weight row, dropping collinear donors first in affine mode.
///
/// `warm_start` is the unit's previous row over the same donor columns.
pub fn solve_row(
    target: ArrayView1<f64>,
    donors: ArrayView2<f64>,
    constraint: WeightConstraint,
    warm_start: Option<ArrayView1<f64>>,
) -> Result<SimplexSolution, WeightError> {
    let k = donors.ncols();
    if k == 0 {
        return Err(WeightError::NoDonors);
    }
    match constraint {
        WeightConstraint::Nonnegative => Ok(SimplexSolution {
            weights: solve_nonnegative_weights(target, donors, warm_start)?,
            excluded: Vec::new(),
        }),
        WeightConstraint::Affine => {
            let excluded = collinear_donors(donors);
            if excluded.is_empty() {
                return Ok(SimplexSolution {
                    weights: solve_affine_weights(target, donors)?,
                    excluded,
                });
            }
            let kept: Vec<usize> = (0..k).filter(|j| !excluded.contains(j)).collect();
            let reduced = solve_affine_weights(target, donors.select(Axis(1), &kept).view())?;
            let mut weights = Array1::zeros(k);
            for (&position, &w) in kept.iter().zip(reduced.iter()) {
                weights[position] = w;
            }
            Ok(SimplexSolution { weights, excluded })
        }
    }
}

/// Mean squared error of the synthetic fit `e_i - E w` over the rows of `target`.
pub fn fit_mse(target: ArrayView1<f64>, donors: ArrayView2<f64>, weights: ArrayView1<f64>) -> f64 {
    let residual = &target - &donors.dot(&weights);
    residual.dot(&residual) / target.len().max(1) as f64
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn random_matrix(rows: usize, cols: usize, rng: &mut StdRng) -> Array2<f64> {
        Array2::from_shape_fn((rows, cols), |_| rng.gen_range(-1.0..1.0))
    }

    #[test]
    fn affine_weights_sum_to_one() {
        let mut rng = StdRng::seed_from_u64(7);
        let donors = random_matrix(40, 6, &mut rng);
        let target = Array1::from_shape_fn(40, |_| rng.gen_range(-1.0..1.0));
        let w = solve_affine_weights(target.view(), donors.view()).unwrap();
        assert_abs_diff_eq!(w.sum(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn affine_weights_recover_an_exact_combination() {
        let mut rng = StdRng::seed_from_u64(11);
        let donors = random_matrix(30, 4, &mut rng);
        let truth = array![0.7, -0.4, 0.2, 0.5];
        let target = donors.dot(&truth);
        let w = solve_affine_weights(target.view(), donors.view()).unwrap();
        for (a, b) in w.iter().zip(truth.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-9);
        }
    }

    #[test]
    fn affine_solution_satisfies_the_stationarity_conditions() {
        let mut rng = StdRng::seed_from_u64(3);
        let donors = random_matrix(25, 5, &mut rng);
        let target = Array1::from_shape_fn(25, |_| rng.gen_range(-2.0..2.0));
        let w = solve_affine_weights(target.view(), donors.view()).unwrap();
        // E'(e - Ew) must be a constant vector (the multiplier).
        let gradient = donors.t().dot(&(&target - &donors.dot(&w)));
        for g in gradient.iter() {
            assert_abs_diff_eq!(*g, gradient[0], epsilon = 1e-9);
        }
    }

    #[test]
    fn identical_donors_are_singular() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut donors = random_matrix(20, 3, &mut rng);
        let copy = donors.column(0).to_owned();
        donors.column_mut(2).assign(&copy);
        let target = Array1::from_shape_fn(20, |_| rng.gen_range(-1.0..1.0));
        let err = solve_affine_weights(target.view(), donors.view()).unwrap_err();
        assert!(matches!(err, WeightError::Singular { .. }));
    }

    #[test]
    fn single_donor_takes_all_weight() {
        let donors = array![[1.0], [2.0], [3.0]];
        let target = array![0.0, 0.0, 1.0];
        assert_eq!(solve_affine_weights(target.view(), donors.view()).unwrap(), array![1.0]);
    }

    #[test]
    fn no_donors_is_an_error() {
        let donors = Array2::<f64>::zeros((3, 0));
        let target = array![0.0, 0.0, 1.0];
        assert_eq!(
            solve_row(target.view(), donors.view(), WeightConstraint::Affine, None).unwrap_err(),
            WeightError::NoDonors
        );
    }

    #[test]
    fn collinear_donor_is_excluded_and_gets_zero_weight() {
        let mut rng = StdRng::seed_from_u64(17);
        let mut donors = random_matrix(30, 4, &mut rng);
        let combo = &donors.column(0) * 2.0 - &donors.column(1);
        donors.column_mut(3).assign(&combo);
        assert_eq!(collinear_donors(donors.view()), vec![3]);

        let target = Array1::from_shape_fn(30, |_| rng.gen_range(-1.0..1.0));
        let solution =
            solve_row(target.view(), donors.view(), WeightConstraint::Affine, None).unwrap();
        assert_eq!(solution.excluded, vec![3]);
        assert_eq!(solution.weights[3], 0.0);
        assert_abs_diff_eq!(solution.weights.sum(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn more_donors_than_periods_keeps_a_full_rank_subset() {
        let mut rng = StdRng::seed_from_u64(23);
        let donors = random_matrix(4, 7, &mut rng);
        let excluded = collinear_donors(donors.view());
        assert_eq!(excluded, vec![4, 5, 6]);
        let target = Array1::from_shape_fn(4, |_| rng.gen_range(-1.0..1.0));
        let solution =
            solve_row(target.view(), donors.view(), WeightConstraint::Affine, None).unwrap();
        assert_abs_diff_eq!(solution.weights.sum(), 1.0, epsilon = 1e-10);
    }

    #[test]
    fn simplex_projection_is_feasible_and_idempotent() {
        let p = project_onto_simplex(array![0.9, 0.6, -0.3, 0.1].view());
        assert_abs_diff_eq!(p.sum(), 1.0, epsilon = 1e-12);
        assert!(p.iter().all(|&x| x >= 0.0));
        assert_abs_diff_eq!(p[0], 0.65, epsilon = 1e-12);
        assert_abs_diff_eq!(p[1], 0.35, epsilon = 1e-12);
        let again = project_onto_simplex(p.view());
        for (a, b) in again.iter().zip(p.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-12);
        }
    }

    #[test]
    fn nonnegative_weights_recover_a_convex_combination() {
        let mut rng = StdRng::seed_from_u64(29);
        let donors = random_matrix(40, 5, &mut rng);
        let truth = array![0.5, 0.0, 0.3, 0.2, 0.0];
        let target = donors.dot(&truth);
        let w = solve_nonnegative_weights(target.view(), donors.view(), None).unwrap();
        assert!(w.iter().all(|&x| x >= 0.0));
        assert_abs_diff_eq!(w.sum(), 1.0, epsilon = 1e-12);
        for (a, b) in w.iter().zip(truth.iter()) {
            assert_abs_diff_eq!(*a, *b, epsilon = 1e-6);
        }
    }

    #[test]
    fn nonnegative_solve_never_fits_worse_than_its_warm_start() {
        let mut rng = StdRng::seed_from_u64(31);
        let donors = random_matrix(20, 6, &mut rng);
        let target = Array1::from_shape_fn(20, |_| rng.gen_range(-1.0..1.0));
        let start = Array1::from_elem(6, 1.0 / 6.0);
        let w = solve_nonnegative_weights(target.view(), donors.view(), Some(start.view())).unwrap();
        assert!(
            fit_mse(target.view(), donors.view(), w.view())
                <= fit_mse(target.view(), donors.view(), start.view()) + 1e-15
        );
    }

    #[test]
    fn leave_two_out_skips_both_units() {
        let residuals = Array2::from_shape_fn((3, 5), |(t, j)| (10 * j + t) as f64);
        let (matrix, donors) = donor_columns(residuals.view(), 1, Some(3));
        assert_eq!(donors, vec![0, 2, 4]);
        assert_eq!(matrix.column(1), residuals.column(2));
        let (_, all) = donor_columns(residuals.view(), 1, None);
        assert_eq!(all, vec![0, 2, 3, 4]);
    }
}
