//! # Alternating Estimator
//!
//! Block-coordinate descent on the joint objective `J(b, W)`: a coefficient
//! step minimizes over `b` with `W` fixed (through the [`Minimizer`] oracle),
//! then a weight step re-solves every row of `W` with `b` fixed. The run stops
//! once the largest absolute change in `b` and `W` over one coefficient/weight
//! pair drops below the configured tolerance, or the iteration cap is hit.
//!
//! Three variants re-weight the units of the objective differently:
//!
//! - `onestep`: every unit counts equally.
//! - `twostep.aggte`: after a one-step fit, each unit is weighted by the inverse
//!   of its mean squared synthetic residual and the alternation is re-run.
//! - `twostep.indiv`: after a one-step fit, a coefficient vector is fitted per
//!   unit, each unit's error variance is estimated out of sample from
//!   leave-two-out synthetic fits cross-fitted over period folds, and the
//!   inverse-variance average of the unit coefficients seeds a final
//!   re-weighted alternation.

use std::fmt;
use std::str::FromStr;

use ndarray::{Array1, Array2, ArrayView1, Axis};
use ndarray_linalg::error::LinalgError;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{
    EstimatorConfig, EstimatorDiagnostics, EstimatorResult, IndividualStage, SingularExclusion,
    Termination, WeightMatrix,
};
use crate::objective::QuadraticObjective;
use crate::optimizer::{BfgsMinimizer, Minimizer, Minimum, Restriction};
use crate::panel::{Panel, PanelError};
use crate::simplex::{WeightError, donor_columns, fit_mse, solve_row};

/// Unit variances below this fraction of their mean are raised to it before inversion.
const VARIANCE_FLOOR_RATIO: f64 = 1e-8;

/// Period folds used to score each unit's out-of-sample error in `twostep.indiv`.
const CROSS_FIT_FOLDS: usize = 2;

/// Which variant of the estimator to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum EstimationMethod {
    #[default]
    #[serde(rename = "onestep")]
    OneStep,
    #[serde(rename = "twostep.aggte")]
    TwoStepAggregate,
    #[serde(rename = "twostep.indiv")]
    TwoStepIndividual,
}

impl EstimationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            EstimationMethod::OneStep => "onestep",
            EstimationMethod::TwoStepAggregate => "twostep.aggte",
            EstimationMethod::TwoStepIndividual => "twostep.indiv",
        }
    }
}

impl fmt::Display for EstimationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EstimationMethod {
    type Err = EstimationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "onestep" => Ok(EstimationMethod::OneStep),
            "twostep.aggte" => Ok(EstimationMethod::TwoStepAggregate),
            "twostep.indiv" => Ok(EstimationMethod::TwoStepIndividual),
            other => Err(EstimationError::InvalidInput(format!(
                "unknown estimation method '{other}' (expected onestep, twostep.aggte or twostep.indiv)"
            ))),
        }
    }
}

#[derive(Error, Debug)]
pub enum EstimationError {
    #[error("Malformed panel: {0}")]
    MalformedPanel(#[from] PanelError),

    #[error("The weight system for unit '{unit}' could not be solved: {source}")]
    SingularWeightSystem {
        unit: String,
        #[source]
        source: WeightError,
    },

    #[error(
        "The coefficient optimizer did not converge in the {stage} stage at iteration {iteration}."
    )]
    OptimizerDiverged { iteration: usize, stage: &'static str },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Linear system solve failed: {0}")]
    LinearSystemSolveFailed(#[from] LinalgError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AlternationState {
    Initializing,
    CoefficientStep,
    WeightStep,
    Converged,
    MaxIterExceeded,
}

/// The end point of one alternating run.
struct Alternation {
    coefficients: Array1<f64>,
    weights: WeightMatrix,
    termination: Termination,
    iterations: usize,
    delta: f64,
    objective: f64,
    final_step_converged: bool,
}

/// Configured estimator over one panel.
pub struct Estimator<'a> {
    panel: &'a Panel,
    config: EstimatorConfig,
    initial_weights: Option<WeightMatrix>,
    restriction: Option<Restriction>,
    minimizer: Box<dyn Minimizer + 'a>,
}

/// Runs the configured method from `initial_coefficients` with uniform starting weights.
pub fn estimate(
    panel: &Panel,
    initial_coefficients: ArrayView1<f64>,
    config: &EstimatorConfig,
) -> Result<EstimatorResult, EstimationError> {
    Estimator::new(panel, config.clone()).run(initial_coefficients)
}

impl<'a> Estimator<'a> {
    pub fn new(panel: &'a Panel, config: EstimatorConfig) -> Self {
        let minimizer = BfgsMinimizer::new(
            config.optimizer_tolerance,
            config.optimizer_max_iterations,
            config.constraint_tolerance,
        );
        Self {
            panel,
            config,
            initial_weights: None,
            restriction: None,
            minimizer: Box::new(minimizer),
        }
    }

    pub fn with_initial_weights(mut self, weights: WeightMatrix) -> Self {
        self.initial_weights = Some(weights);
        self
    }

    /// Enforces `g(b) = 0` in every coefficient step.
    pub fn with_restriction(mut self, restriction: Restriction) -> Self {
        self.restriction = Some(restriction);
        self
    }

    pub fn with_minimizer(mut self, minimizer: impl Minimizer + 'a) -> Self {
        self.minimizer = Box::new(minimizer);
        self
    }

    pub fn run(
        &self,
        initial_coefficients: ArrayView1<f64>,
    ) -> Result<EstimatorResult, EstimationError> {
        self.validate(initial_coefficients)?;
        let n = self.panel.num_units();
        let weights = self
            .initial_weights
            .clone()
            .unwrap_or_else(|| WeightMatrix::uniform(n));
        let coefficients = initial_coefficients.to_owned();

        log::info!(
            "Estimating {} coefficient(s) on {} units x {} periods with method {}",
            self.panel.num_regressors(),
            n,
            self.panel.num_periods(),
            self.config.method
        );
        if let Some(restriction) = &self.restriction {
            log::info!("Restricted estimation under {}", restriction.label());
        }

        let mut diagnostics = EstimatorDiagnostics::default();
        match self.config.method {
            EstimationMethod::OneStep => self.one_step(coefficients, weights, &mut diagnostics),
            EstimationMethod::TwoStepAggregate => {
                self.two_step_aggregate(coefficients, weights, &mut diagnostics)
            }
            EstimationMethod::TwoStepIndividual => {
                self.two_step_individual(coefficients, weights, &mut diagnostics)
            }
        }
    }

    fn validate(&self, initial_coefficients: ArrayView1<f64>) -> Result<(), EstimationError> {
        let k = self.panel.num_regressors();
        let n = self.panel.num_units();
        if initial_coefficients.len() != k {
            return Err(EstimationError::InvalidInput(format!(
                "initial coefficients have length {} but the panel has {} independent variables",
                initial_coefficients.len(),
                k
            )));
        }
        if initial_coefficients.iter().any(|b| !b.is_finite()) {
            return Err(EstimationError::InvalidInput(
                "initial coefficients must be finite".to_string(),
            ));
        }
        if let Some(weights) = &self.initial_weights {
            if weights.num_units() != n {
                return Err(EstimationError::InvalidInput(format!(
                    "initial weights cover {} units but the panel has {}",
                    weights.num_units(),
                    n
                )));
            }
        }
        if self.config.method == EstimationMethod::TwoStepIndividual && n < 3 {
            return Err(EstimationError::InvalidInput(format!(
                "twostep.indiv needs at least 3 units for leave-two-out fits, got {n}"
            )));
        }
        if self.config.tolerance.is_nan()
            || self.config.tolerance <= 0.0
            || self.config.max_iterations == 0
        {
            return Err(EstimationError::InvalidInput(
                "tolerance must be positive and max_iterations at least 1".to_string(),
            ));
        }
        if let Some(restriction) = &self.restriction {
            let b0 = initial_coefficients.to_owned();
            let gradient = restriction.gradient(&b0);
            if gradient.len() != k || !restriction.value(&b0).is_finite() {
                return Err(EstimationError::InvalidInput(format!(
                    "restriction {} does not evaluate to a finite value with a length-{} gradient",
                    restriction.label(),
                    k
                )));
            }
        }
        Ok(())
    }

    fn one_step(
        &self,
        coefficients: Array1<f64>,
        weights: WeightMatrix,
        diagnostics: &mut EstimatorDiagnostics,
    ) -> Result<EstimatorResult, EstimationError> {
        let unit_weights = Array1::ones(self.panel.num_units());
        let run = self.alternate(
            coefficients,
            weights,
            unit_weights.view(),
            "onestep",
            diagnostics,
        )?;
        Ok(self.finish(run, unit_weights, None, diagnostics))
    }

    fn two_step_aggregate(
        &self,
        coefficients: Array1<f64>,
        weights: WeightMatrix,
        diagnostics: &mut EstimatorDiagnostics,
    ) -> Result<EstimatorResult, EstimationError> {
        let equal = Array1::ones(self.panel.num_units());
        let first = self.alternate(coefficients, weights, equal.view(), "first", diagnostics)?;
        let variances = QuadraticObjective::new(self.panel, &first.weights, equal.view())
            .unit_variances(first.coefficients.view());
        let unit_weights = inverse_variance_weights(variances.view());
        log::info!(
            "First stage done after {} iterations; re-weighting units by inverse residual variance",
            first.iterations
        );

        let second = self.alternate(
            first.coefficients,
            first.weights,
            unit_weights.view(),
            "reweighted",
            diagnostics,
        )?;
        Ok(self.finish(second, unit_weights, None, diagnostics))
    }

    fn two_step_individual(
        &self,
        coefficients: Array1<f64>,
        weights: WeightMatrix,
        diagnostics: &mut EstimatorDiagnostics,
    ) -> Result<EstimatorResult, EstimationError> {
        let n = self.panel.num_units();
        let k = self.panel.num_regressors();
        let equal = Array1::ones(n);
        let first = self.alternate(coefficients, weights, equal.view(), "first", diagnostics)?;
        let first_objective = QuadraticObjective::new(self.panel, &first.weights, equal.view());

        let fits: Vec<Minimum> = (0..n)
            .into_par_iter()
            .map(|i| {
                let objective = first_objective.unit_cost_and_gradient(i, &first.coefficients);
                self.minimizer
                    .minimize(objective, first.coefficients.clone(), None)
            })
            .collect();

        let mut unit_coefficients = Array2::zeros((n, k));
        for (i, fit) in fits.into_iter().enumerate() {
            if !fit.converged {
                diagnostics.optimizer_failures += 1;
                if self.config.fatal_divergence {
                    return Err(EstimationError::OptimizerDiverged {
                        iteration: first.iterations,
                        stage: "individual",
                    });
                }
                log::warn!(
                    "Per-unit coefficient fit for unit '{}' did not converge",
                    self.panel.units()[i]
                );
            }
            unit_coefficients.row_mut(i).assign(&fit.minimizer);
        }

        let unit_variances = Array1::from_vec(
            (0..n)
                .into_par_iter()
                .map(|i| self.cross_fitted_variance(i, &unit_coefficients, &first_objective))
                .collect(),
        );
        let unit_weights = inverse_variance_weights(unit_variances.view());
        let aggregate = unit_weights.dot(&unit_coefficients) / n as f64;
        log::info!(
            "Aggregated {} unit coefficient vectors into [{}]",
            n,
            aggregate
                .iter()
                .map(|b| format!("{b:.6}"))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let last = self.alternate(
            aggregate.clone(),
            first.weights,
            unit_weights.view(),
            "final",
            diagnostics,
        )?;
        let stage = IndividualStage {
            unit_coefficients,
            unit_variances,
            aggregate,
        };
        Ok(self.finish(last, unit_weights, Some(stage), diagnostics))
    }

    /// Out-of-sample synthetic error of `unit`.
    ///
    /// Periods are split into [`CROSS_FIT_FOLDS`] folds. For each fold the unit's
    /// coefficients are refitted on the remaining periods, then for every held-out
    /// donor the leave-two-out weights are fitted on those same periods and the
    /// squared prediction error is measured on the fold. Falls back to the
    /// in-sample variance when no fold produces a fit.
    fn cross_fitted_variance(
        &self,
        unit: usize,
        unit_coefficients: &Array2<f64>,
        objective: &QuadraticObjective,
    ) -> f64 {
        let n = self.panel.num_units();
        let b = unit_coefficients.row(unit).to_owned();
        let mut total = 0.0;
        let mut count = 0usize;
        for fold in 0..CROSS_FIT_FOLDS {
            let (test, train): (Vec<usize>, Vec<usize>) =
                (0..self.panel.num_periods()).partition(|s| s % CROSS_FIT_FOLDS == fold);
            if test.is_empty() || train.is_empty() {
                continue;
            }
            let fit = self.minimizer.minimize(
                objective.unit_cost_and_gradient_over(unit, &train, &b),
                b.clone(),
                None,
            );
            if !fit.converged {
                log::debug!("Fold {fold} coefficient fit of unit {unit} did not converge");
            }
            let residuals = self.panel.residualize(fit.minimizer.view());
            let train_residuals = residuals.select(Axis(0), &train);
            let test_residuals = residuals.select(Axis(0), &test);
            for held_out in (0..n).filter(|&j| j != unit) {
                let (donors, _) = donor_columns(train_residuals.view(), unit, Some(held_out));
                match solve_row(
                    train_residuals.column(unit),
                    donors.view(),
                    self.config.weight_constraint,
                    None,
                ) {
                    Ok(solution) => {
                        let (test_donors, _) =
                            donor_columns(test_residuals.view(), unit, Some(held_out));
                        total += fit_mse(
                            test_residuals.column(unit),
                            test_donors.view(),
                            solution.weights.view(),
                        );
                        count += 1;
                    }
                    Err(e) => log::debug!(
                        "Skipping fold {} fit of unit {} without unit {}: {}",
                        fold,
                        unit,
                        held_out,
                        e
                    ),
                }
            }
        }
        if count > 0 {
            total / count as f64
        } else {
            2.0 * objective.unit_value(unit, b.view())
        }
    }

    fn alternate(
        &self,
        coefficients: Array1<f64>,
        weights: WeightMatrix,
        unit_weights: ArrayView1<f64>,
        stage: &'static str,
        diagnostics: &mut EstimatorDiagnostics,
    ) -> Result<Alternation, EstimationError> {
        let mut state = AlternationState::Initializing;
        let mut b = coefficients;
        let mut w = weights;
        let mut previous_b = b.clone();
        let mut previous_w = w.clone();
        let mut iteration = 0;
        let mut delta = f64::INFINITY;
        let mut objective = f64::NAN;
        let mut final_step_converged = true;
        diagnostics.objective_trace.clear();

        let termination = loop {
            state = match state {
                AlternationState::Initializing => {
                    log::debug!("[{stage}] starting alternation");
                    AlternationState::CoefficientStep
                }
                AlternationState::CoefficientStep => {
                    iteration += 1;
                    previous_b = b.clone();
                    previous_w = w.clone();
                    let step = self.coefficient_step(&b, &w, unit_weights);
                    final_step_converged = step.converged;
                    if !step.converged {
                        diagnostics.optimizer_failures += 1;
                        if self.config.fatal_divergence {
                            return Err(EstimationError::OptimizerDiverged { iteration, stage });
                        }
                        log::warn!(
                            "[{stage}] coefficient step did not converge at iteration {iteration}"
                        );
                    }
                    b = step.minimizer;
                    AlternationState::WeightStep
                }
                AlternationState::WeightStep => {
                    self.weight_step(&b, &mut w, iteration, diagnostics)?;
                    let coefficient_change = b
                        .iter()
                        .zip(previous_b.iter())
                        .map(|(x, y)| (x - y).abs())
                        .fold(0.0_f64, f64::max);
                    delta = coefficient_change.max(w.max_abs_diff(&previous_w));
                    objective = QuadraticObjective::new(self.panel, &w, unit_weights).value(b.view());
                    diagnostics.objective_trace.push(objective);
                    log::debug!(
                        "[{stage}] iteration {iteration}: objective {objective:.10e}, change {delta:.3e}"
                    );
                    if delta < self.config.tolerance {
                        AlternationState::Converged
                    } else if iteration >= self.config.max_iterations {
                        AlternationState::MaxIterExceeded
                    } else {
                        AlternationState::CoefficientStep
                    }
                }
                AlternationState::Converged => break Termination::Converged,
                AlternationState::MaxIterExceeded => break Termination::MaxIterationsExceeded,
            };
        };

        match termination {
            Termination::Converged => log::info!(
                "[{stage}] converged after {iteration} iterations (change {delta:.3e})"
            ),
            Termination::MaxIterationsExceeded => log::warn!(
                "[{stage}] stopped at the iteration cap of {} with change {:.3e}; returning the last iterate",
                self.config.max_iterations,
                delta
            ),
        }

        Ok(Alternation {
            coefficients: b,
            weights: w,
            termination,
            iterations: iteration,
            delta,
            objective,
            final_step_converged,
        })
    }

    fn coefficient_step(
        &self,
        b: &Array1<f64>,
        w: &WeightMatrix,
        unit_weights: ArrayView1<f64>,
    ) -> Minimum {
        let objective = QuadraticObjective::new(self.panel, w, unit_weights);
        self.minimizer.minimize(
            objective.cost_and_gradient(b),
            b.clone(),
            self.restriction.as_ref(),
        )
    }

    /// Re-solves every weight row at the current coefficients.
    fn weight_step(
        &self,
        b: &Array1<f64>,
        w: &mut WeightMatrix,
        iteration: usize,
        diagnostics: &mut EstimatorDiagnostics,
    ) -> Result<(), EstimationError> {
        let residuals = self.panel.residualize(b.view());
        let current = &*w;
        let solutions: Vec<_> = (0..self.panel.num_units())
            .into_par_iter()
            .map(|i| {
                let (donors, donor_units) = donor_columns(residuals.view(), i, None);
                solve_row(
                    residuals.column(i),
                    donors.view(),
                    self.config.weight_constraint,
                    Some(current.row(i)),
                )
                .map(|solution| (solution, donor_units))
            })
            .collect();

        for (i, solution) in solutions.into_iter().enumerate() {
            let (solution, donor_units) =
                solution.map_err(|source| EstimationError::SingularWeightSystem {
                    unit: self.panel.units()[i].clone(),
                    source,
                })?;
            if !solution.excluded.is_empty() {
                let excluded_donors: Vec<usize> =
                    solution.excluded.iter().map(|&p| donor_units[p]).collect();
                log::warn!(
                    "Iteration {}: unit '{}' has collinear donors {:?}; excluding them for this iteration",
                    iteration,
                    self.panel.units()[i],
                    excluded_donors
                        .iter()
                        .map(|&j| self.panel.units()[j].as_str())
                        .collect::<Vec<_>>()
                );
                diagnostics.singular_exclusions.push(SingularExclusion {
                    iteration,
                    unit: i,
                    excluded_donors,
                });
            }
            w.set_row(i, solution.weights.view());
        }
        Ok(())
    }

    fn finish(
        &self,
        run: Alternation,
        unit_weights: Array1<f64>,
        individual_stage: Option<IndividualStage>,
        diagnostics: &mut EstimatorDiagnostics,
    ) -> EstimatorResult {
        let converged = run.termination == Termination::Converged && run.final_step_converged;
        log::info!(
            "Estimate ({}): [{}], converged = {}",
            self.config.method,
            run.coefficients
                .iter()
                .map(|b| format!("{b:.6}"))
                .collect::<Vec<_>>()
                .join(", "),
            converged
        );
        EstimatorResult {
            method: self.config.method,
            coefficients: run.coefficients,
            coefficient_names: self.panel.regressor_names().to_vec(),
            weights: run.weights,
            unit_weights,
            units: self.panel.units().to_vec(),
            num_periods: self.panel.num_periods(),
            converged,
            termination: run.termination,
            iterations: run.iterations,
            delta: run.delta,
            objective: run.objective,
            restriction: self.restriction.clone(),
            individual_stage,
            diagnostics: std::mem::take(diagnostics),
        }
    }
}

/// `1 / sigma_i^2`, floored and normalized to mean one.
fn inverse_variance_weights(variances: ArrayView1<f64>) -> Array1<f64> {
    let n = variances.len();
    let mean = variances.sum() / n.max(1) as f64;
    if !mean.is_finite() || mean <= 0.0 {
        log::warn!("Unit variances are degenerate (mean {mean:.3e}); keeping equal unit weights");
        return Array1::ones(n);
    }
    let floor = VARIANCE_FLOOR_RATIO * mean;
    let floored = variances.iter().filter(|&&v| v.is_nan() || v < floor).count();
    if floored > 0 {
        log::warn!("{floored} unit variance(s) raised to the floor {floor:.3e}");
    }
    let inverse = variances.mapv(|v| 1.0 / if v >= floor { v } else { floor });
    let scale = n as f64 / inverse.sum();
    inverse * scale
}
