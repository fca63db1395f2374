use crate::estimate::EstimationMethod;
use crate::optimizer::Restriction;
use itertools::Itertools;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{BufWriter, Write};
use thiserror::Error;

// --- Public Data Structures ---
// The configuration and report structs define the human-readable TOML format
// used by the command-line tool.

/// Feasible set for one row of the synthetic weight matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WeightConstraint {
    /// Weights sum to one and may be negative.
    #[default]
    Affine,
    /// Weights sum to one and are nonnegative (the probability simplex).
    Nonnegative,
}

/// Tuning parameters of the alternating estimator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimatorConfig {
    pub method: EstimationMethod,
    /// Convergence threshold on the largest absolute change in `b` and `W`
    /// between consecutive iterations.
    pub tolerance: f64,
    pub max_iterations: usize,
    /// Gradient-norm tolerance handed to the nonlinear optimizer.
    pub optimizer_tolerance: f64,
    pub optimizer_max_iterations: usize,
    /// Largest admissible `|g(b)|` at a restricted solution.
    pub constraint_tolerance: f64,
    pub weight_constraint: WeightConstraint,
    /// Turn optimizer non-convergence into a hard error instead of a diagnostic.
    pub fatal_divergence: bool,
}

impl Default for EstimatorConfig {
    fn default() -> Self {
        Self {
            method: EstimationMethod::OneStep,
            tolerance: 1e-6,
            max_iterations: 1000,
            optimizer_tolerance: 1e-10,
            optimizer_max_iterations: 500,
            constraint_tolerance: 1e-6,
            weight_constraint: WeightConstraint::Affine,
            fatal_divergence: false,
        }
    }
}

impl EstimatorConfig {
    pub fn with_method(mut self, method: EstimationMethod) -> Self {
        self.method = method;
        self
    }

    /// Saves the configuration to a human-readable TOML file.
    pub fn save(&self, path: &str) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    /// Loads a configuration from a TOML file. Missing keys take their defaults.
    pub fn load(path: &str) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let config = toml::from_str(&toml_string)?;
        Ok(config)
    }
}

/// Custom error type for configuration files, reports and weight matrices.
#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Failed to read or write file: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Failed to parse TOML file: {0}")]
    TomlParseError(#[from] toml::de::Error),
    #[error("Failed to serialize to TOML format: {0}")]
    TomlSerializeError(#[from] toml::ser::Error),
    #[error("Invalid synthetic weight matrix: {0}")]
    InvalidWeights(String),
}

/// Tolerance on the sum-to-one constraint of every weight row.
pub const ROW_SUM_TOLERANCE: f64 = 1e-8;

/// Synthetic weights in compact donor layout.
///
/// Row `i` holds the weights unit `i` places on every other unit, in unit order
/// with `i` itself skipped, so the shape is `[N, N-1]`. Each row sums to one.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightMatrix {
    compact: Array2<f64>,
}

impl WeightMatrix {
    /// Every unit weights each of its `N-1` donors by `1/(N-1)`.
    pub fn uniform(num_units: usize) -> Self {
        let donors = num_units.saturating_sub(1).max(1);
        Self {
            compact: Array2::from_elem((num_units, donors), 1.0 / donors as f64),
        }
    }

    /// Validates a user-supplied `[N, N-1]` matrix.
    pub fn from_compact(compact: Array2<f64>) -> Result<Self, ModelError> {
        let (rows, cols) = compact.dim();
        if rows < 2 || cols + 1 != rows {
            return Err(ModelError::InvalidWeights(format!(
                "expected shape [N, N-1], got [{rows}, {cols}]"
            )));
        }
        for (i, row) in compact.outer_iter().enumerate() {
            if row.iter().any(|w| !w.is_finite()) {
                return Err(ModelError::InvalidWeights(format!(
                    "row {i} contains non-finite weights"
                )));
            }
            let sum = row.sum();
            if (sum - 1.0).abs() > ROW_SUM_TOLERANCE {
                return Err(ModelError::InvalidWeights(format!(
                    "row {i} sums to {sum:.12}, not 1"
                )));
            }
        }
        Ok(Self { compact })
    }

    /// Donor unit indices of `unit`, in the column order of its compact row.
    pub fn donors(unit: usize, num_units: usize) -> impl Iterator<Item = usize> {
        (0..num_units).filter(move |&j| j != unit)
    }

    pub fn num_units(&self) -> usize {
        self.compact.nrows()
    }

    pub fn compact(&self) -> ArrayView2<'_, f64> {
        self.compact.view()
    }

    pub fn row(&self, unit: usize) -> ArrayView1<'_, f64> {
        self.compact.row(unit)
    }

    pub(crate) fn set_row(&mut self, unit: usize, weights: ArrayView1<f64>) {
        self.compact.row_mut(unit).assign(&weights);
    }

    /// Weight unit `unit` places on unit `donor` (zero on itself).
    pub fn donor_weight(&self, unit: usize, donor: usize) -> f64 {
        match donor.cmp(&unit) {
            std::cmp::Ordering::Less => self.compact[[unit, donor]],
            std::cmp::Ordering::Equal => 0.0,
            std::cmp::Ordering::Greater => self.compact[[unit, donor - 1]],
        }
    }

    /// Full `[N, N]` matrix with a zero diagonal.
    pub fn to_dense(&self) -> Array2<f64> {
        let n = self.num_units();
        Array2::from_shape_fn((n, n), |(i, j)| self.donor_weight(i, j))
    }

    pub fn row_sums(&self) -> Array1<f64> {
        self.compact.sum_axis(ndarray::Axis(1))
    }

    pub fn max_abs_diff(&self, other: &WeightMatrix) -> f64 {
        self.compact
            .iter()
            .zip(other.compact.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0_f64, f64::max)
    }
}

/// How an alternating run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    Converged,
    MaxIterationsExceeded,
}

/// A weight row solved with collinear donors dropped from the basis.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingularExclusion {
    pub iteration: usize,
    pub unit: usize,
    pub excluded_donors: Vec<usize>,
}

/// Non-fatal conditions met while estimating.
#[derive(Debug, Clone, Default)]
pub struct EstimatorDiagnostics {
    /// Objective after every completed coefficient/weight pair of the final run.
    pub objective_trace: Vec<f64>,
    pub optimizer_failures: usize,
    pub singular_exclusions: Vec<SingularExclusion>,
}

/// First stage of the individual two-step estimator.
#[derive(Debug, Clone)]
pub struct IndividualStage {
    /// One coefficient vector per unit. Shape: [num_units, num_regressors].
    pub unit_coefficients: Array2<f64>,
    /// Leave-two-out error variance of each unit's synthetic fit.
    pub unit_variances: Array1<f64>,
    /// Inverse-variance weighted average of the unit coefficients.
    pub aggregate: Array1<f64>,
}

/// Point estimate returned by the alternating estimator.
#[derive(Debug, Clone)]
pub struct EstimatorResult {
    pub method: EstimationMethod,
    pub coefficients: Array1<f64>,
    pub coefficient_names: Vec<String>,
    pub weights: WeightMatrix,
    /// Per-unit objective weights of the final run (all ones for `onestep`).
    pub unit_weights: Array1<f64>,
    pub units: Vec<String>,
    pub num_periods: usize,
    pub converged: bool,
    pub termination: Termination,
    pub iterations: usize,
    /// Largest absolute change in `b` or `W` during the last iteration.
    pub delta: f64,
    pub objective: f64,
    pub restriction: Option<Restriction>,
    pub individual_stage: Option<IndividualStage>,
    pub diagnostics: EstimatorDiagnostics,
}

impl EstimatorResult {
    pub fn coefficient(&self, name: &str) -> Option<f64> {
        self.coefficient_names
            .iter()
            .position(|n| n == name)
            .map(|k| self.coefficients[k])
    }

    /// Serializable snapshot of the estimate.
    pub fn report(&self) -> EstimateReport {
        EstimateReport {
            method: self.method.to_string(),
            converged: self.converged,
            iterations: self.iterations,
            delta: self.delta,
            objective: self.objective,
            restriction: self.restriction.as_ref().map(|r| r.label().to_string()),
            optimizer_failures: self.diagnostics.optimizer_failures,
            singular_exclusions: self.diagnostics.singular_exclusions.len(),
            units: self.units.clone(),
            unit_weights: self.unit_weights.to_vec(),
            weights: self
                .weights
                .to_dense()
                .outer_iter()
                .map(|row| row.to_vec())
                .collect(),
            coefficients: self
                .coefficient_names
                .iter()
                .zip(self.coefficients.iter())
                .map(|(name, &estimate)| NamedCoefficient {
                    name: name.clone(),
                    estimate,
                })
                .collect(),
        }
    }
}

impl fmt::Display for EstimatorResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Generalized synthetic control estimate ({})", self.method)?;
        writeln!(
            f,
            "  panel: {} units x {} periods",
            self.units.len(),
            self.num_periods
        )?;
        if let Some(restriction) = &self.restriction {
            writeln!(f, "  restriction: {}", restriction.label())?;
        }
        writeln!(f, "  {:<20} {:>14}", "coefficient", "estimate")?;
        for (name, value) in self.coefficient_names.iter().zip(self.coefficients.iter()) {
            writeln!(f, "  {:<20} {:>14.6}", name, value)?;
        }
        let status = match (self.converged, self.termination) {
            (true, _) => "converged".to_string(),
            (false, Termination::MaxIterationsExceeded) => {
                "NOT converged (iteration cap reached)".to_string()
            }
            (false, Termination::Converged) => format!(
                "NOT converged ({} optimizer failures)",
                self.diagnostics.optimizer_failures
            ),
        };
        writeln!(
            f,
            "  {} after {} iterations, last change {:.3e}, objective {:.6e}",
            status, self.iterations, self.delta, self.objective
        )?;
        if !self.diagnostics.singular_exclusions.is_empty() {
            let rows = self
                .diagnostics
                .singular_exclusions
                .iter()
                .map(|e| self.units[e.unit].as_str())
                .unique()
                .join(", ");
            writeln!(f, "  collinear donors were excluded for units: {rows}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedCoefficient {
    pub name: String,
    pub estimate: f64,
}

/// The TOML artifact written by `gsc estimate --output`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimateReport {
    pub method: String,
    pub converged: bool,
    pub iterations: usize,
    pub delta: f64,
    pub objective: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restriction: Option<String>,
    pub optimizer_failures: usize,
    pub singular_exclusions: usize,
    pub units: Vec<String>,
    pub unit_weights: Vec<f64>,
    /// Dense `[N, N]` synthetic weights, one row per unit.
    pub weights: Vec<Vec<f64>>,
    pub coefficients: Vec<NamedCoefficient>,
}

impl EstimateReport {
    pub fn save(&self, path: &str) -> Result<(), ModelError> {
        let toml_string = toml::to_string_pretty(self)?;
        let mut file = BufWriter::new(fs::File::create(path)?);
        file.write_all(toml_string.as_bytes())?;
        Ok(())
    }

    pub fn load(path: &str) -> Result<Self, ModelError> {
        let toml_string = fs::read_to_string(path)?;
        let report = toml::from_str(&toml_string)?;
        Ok(report)
    }
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use tempfile::tempdir;

    #[test]
    fn uniform_rows_sum_to_one() {
        let w = WeightMatrix::uniform(5);
        assert_eq!(w.compact().dim(), (5, 4));
        for sum in w.row_sums() {
            assert_abs_diff_eq!(sum, 1.0, epsilon = 1e-15);
        }
    }

    #[test]
    fn dense_view_skips_the_diagonal() {
        let w = WeightMatrix::from_compact(array![[0.25, 0.75], [1.5, -0.5], [0.0, 1.0]]).unwrap();
        let dense = w.to_dense();
        assert_eq!(
            dense,
            array![[0.0, 0.25, 0.75], [1.5, 0.0, -0.5], [0.0, 1.0, 0.0]]
        );
        assert_eq!(WeightMatrix::donors(1, 3).collect::<Vec<_>>(), vec![0, 2]);
    }

    #[test]
    fn rows_off_the_affine_constraint_are_rejected() {
        let err = WeightMatrix::from_compact(array![[0.5, 0.4], [0.5, 0.5], [0.5, 0.5]])
            .unwrap_err();
        assert!(matches!(err, ModelError::InvalidWeights(_)));
        let err = WeightMatrix::from_compact(Array2::from_elem((3, 3), 1.0 / 3.0)).unwrap_err();
        assert!(matches!(err, ModelError::InvalidWeights(_)));
    }

    #[test]
    fn config_round_trips_through_toml_with_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gsc.toml");
        let path = path.to_str().unwrap();

        let config = EstimatorConfig::default()
            .with_method(EstimationMethod::TwoStepIndividual);
        config.save(path).unwrap();
        let loaded = EstimatorConfig::load(path).unwrap();
        assert_eq!(loaded, config);

        fs::write(path, "method = \"twostep.aggte\"\nweight_constraint = \"nonnegative\"\n")
            .unwrap();
        let partial = EstimatorConfig::load(path).unwrap();
        assert_eq!(partial.method, EstimationMethod::TwoStepAggregate);
        assert_eq!(partial.weight_constraint, WeightConstraint::Nonnegative);
        assert_eq!(partial.max_iterations, EstimatorConfig::default().max_iterations);
    }

    #[test]
    fn report_round_trips_through_toml() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("estimate.toml");
        let path = path.to_str().unwrap();
        let report = EstimateReport {
            method: "onestep".to_string(),
            converged: true,
            iterations: 12,
            delta: 3.0e-7,
            objective: 0.125,
            restriction: Some("d1 + d2 = 3".to_string()),
            optimizer_failures: 0,
            singular_exclusions: 0,
            units: vec!["a".into(), "b".into()],
            unit_weights: vec![1.0, 1.0],
            weights: vec![vec![0.0, 1.0], vec![1.0, 0.0]],
            coefficients: vec![NamedCoefficient {
                name: "d1".into(),
                estimate: 1.25,
            }],
        };
        report.save(path).unwrap();
        assert_eq!(EstimateReport::load(path).unwrap(), report);
    }
}
