//! # Restricted Derivative and Bootstrap Wald Test
//!
//! At a restricted solution `(b_r, W_r)` the test statistic is the derivative
//! of the objective in the direction the restriction constrains,
//!
//! `s = g'(b_r)' G^{-1} grad J(b_r)`,
//!
//! where `G` is the Hessian of `J` in `b` with `W_r` held fixed. The gradient is
//! a sum of per-unit score contributions, so `s = sum_i h_i` with
//! `h_i = g'(b_r)' G^{-1} S_i`. Under the null the contributions are centred at
//! zero, and their sampling variance is estimated by a sign-flip bootstrap that
//! keeps `W_r` fixed rather than re-solving the restricted problem per replicate.

use std::fmt;

use ndarray::{Array1, Array2};
use ndarray_linalg::Solve;
use rand::RngCore;
use thiserror::Error;

use crate::estimate::EstimationError;
use crate::model::EstimatorResult;
use crate::objective::QuadraticObjective;
use crate::panel::Panel;

use super::bootstrap::{FlipScheme, sample_variance, sign_flip_replicates};
use super::histogram::Histogram;

/// Largest `|g(b_r)|` accepted at the restricted solution.
pub const RESTRICTION_TOLERANCE: f64 = 1e-6;

#[derive(Error, Debug)]
pub enum WaldError {
    #[error("The estimate carries no restriction; run the estimator with a restriction first.")]
    MissingRestriction,

    #[error(
        "The restricted estimate violates its restriction: |g(b)| = {value:.3e} exceeds {tolerance:.1e}."
    )]
    RestrictionViolated { value: f64, tolerance: f64 },

    #[error(
        "The bootstrap variance ({variance:.3e} from {replicates} replicates) is zero or not finite; the test is undefined."
    )]
    DegenerateBootstrap { variance: f64, replicates: usize },

    #[error("{0}")]
    Estimation(#[from] EstimationError),
}

/// Bootstrap settings of the test.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaldConfig {
    pub n_boot: usize,
    pub scheme: FlipScheme,
}

impl Default for WaldConfig {
    fn default() -> Self {
        Self {
            n_boot: 999,
            scheme: FlipScheme::Unit,
        }
    }
}

/// Outcome of one Wald test.
#[derive(Debug, Clone)]
pub struct WaldTestResult {
    pub restriction: String,
    /// The restricted directional derivative `s`.
    pub derivative: f64,
    /// Bootstrap variance of `s` under the null.
    pub variance: f64,
    pub statistic: f64,
    pub p_value: f64,
    /// Wald statistic of every replicate, `s*^2 / variance`.
    pub bootstrap_distribution: Array1<f64>,
    /// The replicate derivatives `s*` themselves.
    pub derivative_replicates: Array1<f64>,
    pub scheme: FlipScheme,
    /// `J(b_r, W_r) - J(b_0, W_0)` when the unrestricted fit was supplied.
    pub objective_gap: Option<f64>,
}

impl WaldTestResult {
    pub fn n_boot(&self) -> usize {
        self.bootstrap_distribution.len()
    }

    /// Distribution plot of the replicate statistics with the observed one marked.
    pub fn histogram(&self, bins: usize) -> Histogram {
        Histogram::new(
            self.bootstrap_distribution.as_slice().unwrap_or(&[]),
            self.statistic,
            bins,
        )
    }
}

impl fmt::Display for WaldTestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Bootstrap Wald test of {}", self.restriction)?;
        writeln!(f, "  derivative     {:>14.6e}", self.derivative)?;
        writeln!(f, "  variance       {:>14.6e}", self.variance)?;
        writeln!(f, "  statistic      {:>14.6}", self.statistic)?;
        writeln!(f, "  p-value        {:>14.4}", self.p_value)?;
        writeln!(
            f,
            "  replicates     {:>14} ({} sign flips)",
            self.n_boot(),
            self.scheme
        )?;
        if let Some(gap) = self.objective_gap {
            writeln!(f, "  objective gap  {:>14.6e}", gap)?;
        }
        Ok(())
    }
}

/// Tests the restriction carried by `restricted` on `panel`.
///
/// `unrestricted`, when given, only contributes the reported objective gap.
pub fn wald_test<R: RngCore>(
    panel: &Panel,
    restricted: &EstimatorResult,
    unrestricted: Option<&EstimatorResult>,
    config: &WaldConfig,
    rng: &mut R,
) -> Result<WaldTestResult, WaldError> {
    let restriction = restricted
        .restriction
        .as_ref()
        .ok_or(WaldError::MissingRestriction)?;
    if restricted.units.as_slice() != panel.units()
        || restricted.coefficients.len() != panel.num_regressors()
    {
        return Err(EstimationError::InvalidInput(
            "the restricted estimate was not fitted on this panel".to_string(),
        )
        .into());
    }
    let b = &restricted.coefficients;
    let violation = restriction.value(b);
    if violation.is_nan() || violation.abs() > RESTRICTION_TOLERANCE {
        return Err(WaldError::RestrictionViolated {
            value: violation.abs(),
            tolerance: RESTRICTION_TOLERANCE,
        });
    }

    let objective =
        QuadraticObjective::new(panel, &restricted.weights, restricted.unit_weights.view());
    let normal = restriction.gradient(b);
    let direction = objective
        .hessian()
        .to_owned()
        .solve(&normal)
        .map_err(EstimationError::from)?;
    let derivative = direction.dot(&objective.gradient(b.view()));

    let contributions = match config.scheme {
        FlipScheme::Unit => objective.unit_scores(b.view()).dot(&direction),
        FlipScheme::Observation => {
            let scores = objective.observation_scores(b.view());
            let (n, t, k) = scores.dim();
            let flat: Array2<f64> = scores.into_shape_with_order((n * t, k)).map_err(|e| {
                EstimationError::InvalidInput(format!("score reshape failed: {e}"))
            })?;
            flat.dot(&direction)
        }
    };

    if config.n_boot < 2 {
        return Err(WaldError::DegenerateBootstrap {
            variance: f64::NAN,
            replicates: config.n_boot,
        });
    }
    let derivative_replicates = sign_flip_replicates(contributions.view(), config.n_boot, rng);
    let variance = sample_variance(derivative_replicates.view());
    if !variance.is_finite() || variance <= 0.0 {
        return Err(WaldError::DegenerateBootstrap {
            variance,
            replicates: config.n_boot,
        });
    }

    let statistic = derivative * derivative / variance;
    let bootstrap_distribution = derivative_replicates.mapv(|s| s * s / variance);
    let extreme = derivative_replicates
        .iter()
        .filter(|s| s.abs() >= derivative.abs())
        .count();
    let p_value = extreme as f64 / config.n_boot as f64;
    let objective_gap = unrestricted.map(|fit| restricted.objective - fit.objective);

    log::info!(
        "Wald test of {}: statistic {:.4}, p-value {:.4} ({} replicates)",
        restriction.label(),
        statistic,
        p_value,
        config.n_boot
    );

    Ok(WaldTestResult {
        restriction: restriction.label().to_string(),
        derivative,
        variance,
        statistic,
        p_value,
        bootstrap_distribution,
        derivative_replicates,
        scheme: config.scheme,
        objective_gap,
    })
}
