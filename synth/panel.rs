//! # Panel Data Table
//!
//! This module is the exclusive entry point for user-provided panel data. It
//! accepts a long-format table (one row per unit and time period), validates it
//! against the declared column layout, and reshapes it into the dense `ndarray`
//! structures consumed by the estimator.
//!
//! - Balanced Panels Only: every unit must be observed in every period that any
//!   other unit reports. Gaps are rejected, never silently dropped.
//! - Fixed Ordering: units and periods are ordered with natural ordering of
//!   their labels (`"2" < "10"`). The unit order defines the row and column
//!   indexing of the synthetic weight matrix.
//! - User-Centric Errors: failures are assumed to be input errors and the
//!   `PanelError` enum describes exactly which row or column is at fault.

use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, Axis};
use polars::prelude::*;
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::Path;
use thiserror::Error;

/// Smallest panel the estimator can work with: every unit needs at least one donor.
pub const MINIMUM_UNITS: usize = 2;
pub const MINIMUM_PERIODS: usize = 2;

/// A single long-format row of the panel.
#[derive(Debug, Clone, PartialEq)]
pub struct PanelObservation {
    pub unit: String,
    pub time: String,
    pub outcome: f64,
    pub treatments: Vec<f64>,
    pub covariates: Vec<f64>,
}

/// Names the columns of a long-format table that make up the panel.
///
/// The independent variables of the model are the treatments followed by the
/// covariates, in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PanelSpec {
    pub unit_column: String,
    pub time_column: String,
    pub outcome: String,
    pub treatments: Vec<String>,
    pub covariates: Vec<String>,
}

impl PanelSpec {
    pub fn new(
        unit_column: impl Into<String>,
        time_column: impl Into<String>,
        outcome: impl Into<String>,
    ) -> Self {
        Self {
            unit_column: unit_column.into(),
            time_column: time_column.into(),
            outcome: outcome.into(),
            treatments: Vec::new(),
            covariates: Vec::new(),
        }
    }

    pub fn with_treatments<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.treatments = names.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_covariates<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.covariates = names.into_iter().map(Into::into).collect();
        self
    }

    /// Treatments followed by covariates.
    pub fn independent_variables(&self) -> Vec<String> {
        self.treatments
            .iter()
            .chain(self.covariates.iter())
            .cloned()
            .collect()
    }

    fn validate(&self) -> Result<(), PanelError> {
        if self.treatments.is_empty() && self.covariates.is_empty() {
            return Err(PanelError::NoRegressors);
        }
        let mut seen = HashSet::new();
        let all_columns = [&self.unit_column, &self.time_column, &self.outcome]
            .into_iter()
            .chain(self.treatments.iter())
            .chain(self.covariates.iter());
        for name in all_columns {
            if !seen.insert(name.as_str()) {
                return Err(PanelError::DuplicateColumn(name.clone()));
            }
        }
        Ok(())
    }
}

/// A comprehensive error type for all panel loading and validation failures.
#[derive(Error, Debug)]
pub enum PanelError {
    #[error("Error from the underlying Polars DataFrame library: {0}")]
    PolarsError(#[from] PolarsError),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error(
        "The required column '{0}' was not found in the input table. Please check spelling and case."
    )]
    ColumnNotFound(String),
    #[error(
        "The required column '{column_name}' could not be converted to the expected type '{expected_type}'. It contains non-numeric data. (Found type: {found_type})"
    )]
    ColumnWrongType {
        column_name: String,
        expected_type: &'static str,
        found_type: String,
    },
    #[error(
        "Missing or null values were found in the required column '{0}'. The estimator requires complete data with no missing values."
    )]
    MissingValuesFound(String),
    #[error(
        "Non-finite values (NaN or Infinity) were found in column '{0}'. The estimator requires all data to be finite."
    )]
    NonFiniteValuesFound(String),
    #[error("Column '{0}' is declared more than once in the panel layout.")]
    DuplicateColumn(String),
    #[error("At least one treatment or covariate column must be declared.")]
    NoRegressors,
    #[error("Unit '{unit}' is observed more than once at time '{time}'.")]
    DuplicateObservation { unit: String, time: String },
    #[error(
        "The panel is unbalanced: unit '{unit}' has no observation at time '{time}', which other units report. Unbalanced panels are not supported."
    )]
    MissingObservation { unit: String, time: String },
    #[error(
        "Observation for unit '{unit}' at time '{time}' carries {found} {kind} values, but {expected} were declared."
    )]
    RegressorLengthMismatch {
        unit: String,
        time: String,
        kind: &'static str,
        found: usize,
        expected: usize,
    },
    #[error("The panel contains {found} units, but at least {required} are required.")]
    TooFewUnits { found: usize, required: usize },
    #[error("The panel contains {found} time periods, but at least {required} are required.")]
    TooFewPeriods { found: usize, required: usize },
}

/// Validated, balanced panel in dense form.
#[derive(Debug, Clone)]
pub struct Panel {
    units: Vec<String>,
    times: Vec<String>,
    outcome_name: String,
    regressor_names: Vec<String>,
    num_treatments: usize,
    /// Shape: [num_periods, num_units].
    outcomes: Array2<f64>,
    /// Shape: [num_units, num_periods, num_regressors].
    regressors: Array3<f64>,
}

impl Panel {
    /// Builds a panel from in-memory long-format rows.
    pub fn from_observations(
        spec: &PanelSpec,
        observations: Vec<PanelObservation>,
    ) -> Result<Self, PanelError> {
        spec.validate()?;
        let num_treatments = spec.treatments.len();
        let num_covariates = spec.covariates.len();

        let mut rows = Vec::with_capacity(observations.len());
        for obs in observations {
            if obs.treatments.len() != num_treatments {
                return Err(PanelError::RegressorLengthMismatch {
                    unit: obs.unit,
                    time: obs.time,
                    kind: "treatment",
                    found: obs.treatments.len(),
                    expected: num_treatments,
                });
            }
            if obs.covariates.len() != num_covariates {
                return Err(PanelError::RegressorLengthMismatch {
                    unit: obs.unit,
                    time: obs.time,
                    kind: "covariate",
                    found: obs.covariates.len(),
                    expected: num_covariates,
                });
            }
            if !obs.outcome.is_finite() {
                return Err(PanelError::NonFiniteValuesFound(spec.outcome.clone()));
            }
            let mut regressors = obs.treatments;
            regressors.extend(obs.covariates);
            let names = spec.treatments.iter().chain(spec.covariates.iter());
            for (value, name) in regressors.iter().zip(names) {
                if !value.is_finite() {
                    return Err(PanelError::NonFiniteValuesFound(name.clone()));
                }
            }
            rows.push(internal::Row {
                unit: obs.unit,
                time: obs.time,
                outcome: obs.outcome,
                regressors,
            });
        }

        internal::assemble(spec, num_treatments, rows)
    }

    /// Builds a panel from a polars `DataFrame` holding the long-format table.
    pub fn from_dataframe(df: &DataFrame, spec: &PanelSpec) -> Result<Self, PanelError> {
        spec.validate()?;
        let columns: HashSet<String> = df
            .get_column_names()
            .into_iter()
            .map(|s| s.to_string())
            .collect();
        let required = [&spec.unit_column, &spec.time_column, &spec.outcome]
            .into_iter()
            .chain(spec.treatments.iter())
            .chain(spec.covariates.iter());
        for name in required {
            if !columns.contains(name) {
                return Err(PanelError::ColumnNotFound(name.clone()));
            }
        }

        let units = internal::extract_label_column(df, &spec.unit_column)?;
        let times = internal::extract_label_column(df, &spec.time_column)?;
        let outcome = internal::extract_numeric_column(df, &spec.outcome)?;
        let regressor_columns = spec
            .independent_variables()
            .iter()
            .map(|name| internal::extract_numeric_column(df, name))
            .collect::<Result<Vec<_>, _>>()?;

        let rows = units
            .into_iter()
            .zip(times)
            .enumerate()
            .map(|(row, (unit, time))| internal::Row {
                unit,
                time,
                outcome: outcome[row],
                regressors: regressor_columns.iter().map(|col| col[row]).collect(),
            })
            .collect();

        internal::assemble(spec, spec.treatments.len(), rows)
    }

    pub fn units(&self) -> &[String] {
        &self.units
    }

    pub fn times(&self) -> &[String] {
        &self.times
    }

    pub fn num_units(&self) -> usize {
        self.units.len()
    }

    pub fn num_periods(&self) -> usize {
        self.times.len()
    }

    pub fn num_regressors(&self) -> usize {
        self.regressor_names.len()
    }

    pub fn num_treatments(&self) -> usize {
        self.num_treatments
    }

    pub fn outcome_name(&self) -> &str {
        &self.outcome_name
    }

    /// Treatments followed by covariates.
    pub fn regressor_names(&self) -> &[String] {
        &self.regressor_names
    }

    pub fn unit_index(&self, label: &str) -> Option<usize> {
        self.units.iter().position(|u| u == label)
    }

    /// The T-length outcome series of one unit, in time order.
    pub fn outcome(&self, unit: usize) -> ArrayView1<'_, f64> {
        self.outcomes.column(unit)
    }

    /// The T x k regressor matrix of one unit, in time order.
    pub fn regressors(&self, unit: usize) -> ArrayView2<'_, f64> {
        self.regressors.index_axis(Axis(0), unit)
    }

    /// All outcomes. Shape: [num_periods, num_units].
    pub fn outcomes(&self) -> ArrayView2<'_, f64> {
        self.outcomes.view()
    }

    /// Residualized outcomes `Y_i - D_i b` for every unit. Shape: [num_periods, num_units].
    pub fn residualize(&self, coefficients: ArrayView1<f64>) -> Array2<f64> {
        let mut residuals = self.outcomes.clone();
        for (unit, mut column) in residuals.axis_iter_mut(Axis(1)).enumerate() {
            let fitted: Array1<f64> = self.regressors(unit).dot(&coefficients);
            column -= &fitted;
        }
        residuals
    }

    /// Long-format rows in unit-major, time-minor order.
    pub fn observations(&self) -> Vec<PanelObservation> {
        let mut rows = Vec::with_capacity(self.num_units() * self.num_periods());
        for (i, unit) in self.units.iter().enumerate() {
            let regressors = self.regressors(i);
            for (t, time) in self.times.iter().enumerate() {
                let values = regressors.row(t);
                rows.push(PanelObservation {
                    unit: unit.clone(),
                    time: time.clone(),
                    outcome: self.outcomes[[t, i]],
                    treatments: values.iter().take(self.num_treatments).copied().collect(),
                    covariates: values.iter().skip(self.num_treatments).copied().collect(),
                });
            }
        }
        rows
    }
}

/// Loads a long-format panel from a delimited text file. Files ending in `.tsv`
/// are read as tab-separated, everything else as comma-separated.
pub fn load_panel(path: &Path, spec: &PanelSpec) -> Result<Panel, PanelError> {
    let separator = match path.extension().and_then(|ext| ext.to_str()) {
        Some("tsv") => b'\t',
        _ => b',',
    };
    log::info!("Loading panel from '{}'", path.display());

    let df = CsvReader::new(File::open(path)?)
        .with_options(
            CsvReadOptions::default()
                .with_has_header(true)
                .with_parse_options(CsvParseOptions::default().with_separator(separator)),
        )
        .finish()?;

    let panel = Panel::from_dataframe(&df, spec)?;
    log::info!(
        "Loaded balanced panel: {} units x {} periods, {} regressors",
        panel.num_units(),
        panel.num_periods(),
        panel.num_regressors()
    );
    Ok(panel)
}

/// Internal module for shared reshaping and extraction logic.
mod internal {
    use super::*;

    pub(super) struct Row {
        pub unit: String,
        pub time: String,
        pub outcome: f64,
        pub regressors: Vec<f64>,
    }

    pub(super) fn extract_numeric_column(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<f64>, PanelError> {
        let series = df.column(column_name)?;
        if series.null_count() > 0 {
            return Err(PanelError::MissingValuesFound(column_name.to_string()));
        }

        let casted = match series.cast(&DataType::Float64) {
            Ok(casted) => casted,
            Err(_) => {
                return Err(PanelError::ColumnWrongType {
                    column_name: column_name.to_string(),
                    expected_type: "f64 (numeric)",
                    found_type: format!("{:?}", series.dtype()),
                });
            }
        };

        // A non-strict cast turns unparsable strings into nulls.
        if casted.null_count() > 0 {
            return Err(PanelError::ColumnWrongType {
                column_name: column_name.to_string(),
                expected_type: "f64 (numeric)",
                found_type: format!("{:?}", series.dtype()),
            });
        }

        let chunked = casted.f64()?.rechunk();
        let values: Vec<f64> = chunked.into_no_null_iter().collect();
        if values.iter().any(|v| !v.is_finite()) {
            return Err(PanelError::NonFiniteValuesFound(column_name.to_string()));
        }
        Ok(values)
    }

    pub(super) fn extract_label_column(
        df: &DataFrame,
        column_name: &str,
    ) -> Result<Vec<String>, PanelError> {
        let series = df.column(column_name)?;
        if series.null_count() > 0 {
            return Err(PanelError::MissingValuesFound(column_name.to_string()));
        }
        let casted = series.cast(&DataType::String)?;
        let labels = casted
            .as_materialized_series()
            .str()?
            .into_no_null_iter()
            .map(|s| s.to_string())
            .collect();
        Ok(labels)
    }

    /// Natural order, with plain string order breaking natural ties such as `1` vs `01`.
    pub(super) fn natural_order(a: &String, b: &String) -> Ordering {
        natord::compare(a, b).then_with(|| a.cmp(b))
    }

    /// Reshapes validated rows into the dense unit x time layout, rejecting
    /// duplicated keys and unbalanced coverage.
    pub(super) fn assemble(
        spec: &PanelSpec,
        num_treatments: usize,
        rows: Vec<Row>,
    ) -> Result<Panel, PanelError> {
        let mut units: Vec<String> = rows
            .iter()
            .map(|r| r.unit.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let mut times: Vec<String> = rows
            .iter()
            .map(|r| r.time.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        units.sort_by(natural_order);
        times.sort_by(natural_order);

        if units.len() < MINIMUM_UNITS {
            return Err(PanelError::TooFewUnits {
                found: units.len(),
                required: MINIMUM_UNITS,
            });
        }
        if times.len() < MINIMUM_PERIODS {
            return Err(PanelError::TooFewPeriods {
                found: times.len(),
                required: MINIMUM_PERIODS,
            });
        }

        let unit_lookup: HashMap<&str, usize> = units
            .iter()
            .enumerate()
            .map(|(i, u)| (u.as_str(), i))
            .collect();
        let time_lookup: HashMap<&str, usize> = times
            .iter()
            .enumerate()
            .map(|(t, s)| (s.as_str(), t))
            .collect();

        let num_units = units.len();
        let num_periods = times.len();
        let num_regressors = spec.treatments.len() + spec.covariates.len();
        let mut outcomes = Array2::<f64>::zeros((num_periods, num_units));
        let mut regressors = Array3::<f64>::zeros((num_units, num_periods, num_regressors));
        let mut filled = Array2::<bool>::from_elem((num_periods, num_units), false);

        for row in &rows {
            let i = unit_lookup[row.unit.as_str()];
            let t = time_lookup[row.time.as_str()];
            if filled[[t, i]] {
                return Err(PanelError::DuplicateObservation {
                    unit: row.unit.clone(),
                    time: row.time.clone(),
                });
            }
            filled[[t, i]] = true;
            outcomes[[t, i]] = row.outcome;
            for (k, value) in row.regressors.iter().enumerate() {
                regressors[[i, t, k]] = *value;
            }
        }

        for (i, unit) in units.iter().enumerate() {
            for (t, time) in times.iter().enumerate() {
                if !filled[[t, i]] {
                    return Err(PanelError::MissingObservation {
                        unit: unit.clone(),
                        time: time.clone(),
                    });
                }
            }
        }

        Ok(Panel {
            units,
            times,
            outcome_name: spec.outcome.clone(),
            regressor_names: spec.independent_variables(),
            num_treatments,
            outcomes,
            regressors,
        })
    }
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;
    use std::io::{self, Write};
    use tempfile::NamedTempFile;

    fn spec() -> PanelSpec {
        PanelSpec::new("unit", "time", "y")
            .with_treatments(["d"])
            .with_covariates(["x"])
    }

    fn observation(unit: &str, time: &str, y: f64, d: f64, x: f64) -> PanelObservation {
        PanelObservation {
            unit: unit.to_string(),
            time: time.to_string(),
            outcome: y,
            treatments: vec![d],
            covariates: vec![x],
        }
    }

    fn balanced_rows() -> Vec<PanelObservation> {
        let mut rows = Vec::new();
        for (u, unit) in ["a", "b", "c"].iter().enumerate() {
            for t in 1..=3 {
                let base = (u * 10 + t) as f64;
                rows.push(observation(unit, &t.to_string(), base, base * 0.5, -base));
            }
        }
        rows
    }

    fn create_test_csv(content: &str, suffix: &str) -> io::Result<NamedTempFile> {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile()?;
        writeln!(file, "{}", content)?;
        file.flush()?;
        Ok(file)
    }

    #[test]
    fn balanced_rows_reshape_in_time_order() {
        let mut rows = balanced_rows();
        rows.reverse();
        let panel = Panel::from_observations(&spec(), rows).unwrap();
        assert_eq!(panel.units(), &["a", "b", "c"]);
        assert_eq!(panel.times(), &["1", "2", "3"]);
        assert_eq!(panel.regressor_names(), &["d", "x"]);
        assert_eq!(panel.num_treatments(), 1);

        let y_b = panel.outcome(1);
        assert_eq!(y_b.to_vec(), vec![11.0, 12.0, 13.0]);
        let d_c = panel.regressors(2);
        assert_eq!(d_c.shape(), &[3, 2]);
        assert_abs_diff_eq!(d_c[[0, 0]], 10.5);
        assert_abs_diff_eq!(d_c[[2, 1]], -23.0);
    }

    #[test]
    fn time_labels_use_natural_order() {
        let mut rows = Vec::new();
        for unit in ["u1", "u2"] {
            for t in ["2", "10", "1"] {
                rows.push(observation(unit, t, 1.0, 0.0, 0.0));
            }
        }
        let panel = Panel::from_observations(&spec(), rows).unwrap();
        assert_eq!(panel.times(), &["1", "2", "10"]);
    }

    #[test]
    fn equal_natural_labels_still_order_deterministically() {
        let a = "01".to_string();
        let b = "1".to_string();
        assert_ne!(internal::natural_order(&a, &b), Ordering::Equal);
        assert_eq!(
            internal::natural_order(&a, &b),
            internal::natural_order(&b, &a).reverse()
        );

        let build = |units: [&str; 3]| {
            let mut rows = Vec::new();
            for unit in units {
                for t in ["1", "2"] {
                    rows.push(observation(unit, t, 1.0, 0.5, 0.0));
                }
            }
            Panel::from_observations(&spec(), rows).unwrap()
        };
        let forward = build(["01", "1", "2"]);
        let backward = build(["2", "1", "01"]);
        assert_eq!(forward.units(), backward.units());
        assert_eq!(forward.units()[2], "2");
    }

    #[test]
    fn duplicate_key_is_rejected() {
        let mut rows = balanced_rows();
        rows.push(observation("b", "2", 0.0, 0.0, 0.0));
        match Panel::from_observations(&spec(), rows).unwrap_err() {
            PanelError::DuplicateObservation { unit, time } => {
                assert_eq!(unit, "b");
                assert_eq!(time, "2");
            }
            other => panic!("Expected DuplicateObservation, got {:?}", other),
        }
    }

    #[test]
    fn unbalanced_panel_is_rejected() {
        let rows: Vec<_> = balanced_rows()
            .into_iter()
            .filter(|r| !(r.unit == "c" && r.time == "3"))
            .collect();
        match Panel::from_observations(&spec(), rows).unwrap_err() {
            PanelError::MissingObservation { unit, time } => {
                assert_eq!(unit, "c");
                assert_eq!(time, "3");
            }
            other => panic!("Expected MissingObservation, got {:?}", other),
        }
    }

    #[test]
    fn non_finite_regressor_is_rejected() {
        let mut rows = balanced_rows();
        rows[4].covariates[0] = f64::NAN;
        match Panel::from_observations(&spec(), rows).unwrap_err() {
            PanelError::NonFiniteValuesFound(col) => assert_eq!(col, "x"),
            other => panic!("Expected NonFiniteValuesFound(x), got {:?}", other),
        }
    }

    #[test]
    fn residualize_subtracts_fitted_regressors() {
        let panel = Panel::from_observations(&spec(), balanced_rows()).unwrap();
        let residuals = panel.residualize(array![2.0, 0.0].view());
        // y = base, d = base / 2, so y - 2 d vanishes everywhere.
        assert!(residuals.iter().all(|r| r.abs() < 1e-12));
    }

    #[test]
    fn observations_round_trip_through_the_dense_layout() {
        let panel = Panel::from_observations(&spec(), balanced_rows()).unwrap();
        let rebuilt = Panel::from_observations(&spec(), panel.observations()).unwrap();
        assert_eq!(rebuilt.outcomes(), panel.outcomes());
        assert_eq!(rebuilt.regressors(1), panel.regressors(1));
    }

    #[test]
    fn dataframe_with_integer_ids_loads() {
        let df = df!(
            "unit" => &[1i64, 1, 2, 2, 3, 3],
            "time" => &[2000i64, 2001, 2000, 2001, 2000, 2001],
            "y" => &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            "d" => &[0.1, 0.2, 0.3, 0.4, 0.5, 0.6],
            "x" => &[1.0, 1.0, 0.0, 0.0, 1.0, 1.0]
        )
        .unwrap();
        let panel = Panel::from_dataframe(&df, &spec()).unwrap();
        assert_eq!(panel.num_units(), 3);
        assert_eq!(panel.num_periods(), 2);
        assert_eq!(panel.unit_index("2"), Some(1));
        assert_abs_diff_eq!(panel.outcome(2)[1], 6.0);
    }

    #[test]
    fn dataframe_missing_column_is_reported() {
        let df = df!(
            "unit" => &["a", "a", "b", "b"],
            "time" => &["1", "2", "1", "2"],
            "y" => &[1.0, 2.0, 3.0, 4.0],
            "d" => &[0.1, 0.2, 0.3, 0.4]
        )
        .unwrap();
        match Panel::from_dataframe(&df, &spec()).unwrap_err() {
            PanelError::ColumnNotFound(col) => assert_eq!(col, "x"),
            other => panic!("Expected ColumnNotFound(x), got {:?}", other),
        }
    }

    #[test]
    fn csv_with_non_numeric_treatment_is_rejected() {
        let content = "unit,time,y,d,x\na,1,1.0,0.5,1\na,2,2.0,high,1\nb,1,3.0,0.5,0\nb,2,4.0,0.7,0";
        let file = create_test_csv(content, ".csv").unwrap();
        match load_panel(file.path(), &spec()).unwrap_err() {
            PanelError::ColumnWrongType { column_name, .. } => assert_eq!(column_name, "d"),
            other => panic!("Expected ColumnWrongType(d), got {:?}", other),
        }
    }

    #[test]
    fn tsv_file_loads_with_tab_separator() {
        let content = "unit\ttime\ty\td\tx\na\t1\t1.0\t0.5\t1\na\t2\t2.0\t0.6\t1\nb\t1\t3.0\t0.5\t0\nb\t2\t4.0\t0.7\t0";
        let file = create_test_csv(content, ".tsv").unwrap();
        let panel = load_panel(file.path(), &spec()).unwrap();
        assert_eq!(panel.units(), &["a", "b"]);
        assert_abs_diff_eq!(panel.regressors(1)[[1, 0]], 0.7);
    }
}
