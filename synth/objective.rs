//! # Coefficient Step Objective
//!
//! With the weight matrix held fixed, every unit's synthetic residual is linear
//! in `b`:
//!
//! `u_i(b) = (Y_i - sum_j w_ij Y_j) - (D_i - sum_j w_ij D_j) b = y~_i - D~_i b`
//!
//! so the aggregate objective
//!
//! `J(b) = (1 / 2NT) sum_i c_i ||u_i(b)||^2`
//!
//! is an exact quadratic. This module builds the synthetically differenced panel
//! once per weight matrix, precomputes `G = sum_i c_i D~_i'D~_i / NT` and
//! `h = sum_i c_i D~_i'y~_i / NT`, and hands the optimizer an objective measured
//! relative to an anchor point so line searches near the optimum do not lose
//! precision to cancellation.

use std::sync::Arc;

use ndarray::{Array1, Array2, Array3, ArrayView1, ArrayView2, Axis};

use crate::model::WeightMatrix;
use crate::optimizer::CostAndGradient;
use crate::panel::Panel;

/// The panel after subtracting each unit's synthetic counterfactual.
#[derive(Debug, Clone)]
pub struct SyntheticDifference {
    /// Shape: [num_periods, num_units].
    outcomes: Array2<f64>,
    /// Shape: [num_units, num_periods, num_regressors].
    regressors: Array3<f64>,
}

impl SyntheticDifference {
    pub fn new(panel: &Panel, weights: &WeightMatrix) -> Self {
        let n = panel.num_units();
        let mut outcomes = panel.outcomes().to_owned();
        let mut regressors = Array3::zeros((n, panel.num_periods(), panel.num_regressors()));
        for i in 0..n {
            let mut d = regressors.index_axis_mut(Axis(0), i);
            d.assign(&panel.regressors(i));
            let mut y = outcomes.column_mut(i);
            for (w, j) in weights.row(i).iter().zip(WeightMatrix::donors(i, n)) {
                if *w == 0.0 {
                    continue;
                }
                y.scaled_add(-*w, &panel.outcome(j));
                d.scaled_add(-*w, &panel.regressors(j));
            }
        }
        Self {
            outcomes,
            regressors,
        }
    }

    pub fn num_units(&self) -> usize {
        self.regressors.len_of(Axis(0))
    }

    pub fn num_periods(&self) -> usize {
        self.outcomes.nrows()
    }

    pub fn outcome(&self, unit: usize) -> ArrayView1<'_, f64> {
        self.outcomes.column(unit)
    }

    pub fn regressors(&self, unit: usize) -> ArrayView2<'_, f64> {
        self.regressors.index_axis(Axis(0), unit)
    }

    /// `y~_i - D~_i b`.
    pub fn residual(&self, unit: usize, b: ArrayView1<f64>) -> Array1<f64> {
        &self.outcome(unit) - &self.regressors(unit).dot(&b)
    }
}

/// `J(b)` for a fixed weight matrix and fixed unit weights `c`.
#[derive(Debug, Clone)]
pub struct QuadraticObjective {
    difference: SyntheticDifference,
    unit_weights: Array1<f64>,
    gram: Array2<f64>,
    cross: Array1<f64>,
    scale: f64,
}

impl QuadraticObjective {
    pub fn new(panel: &Panel, weights: &WeightMatrix, unit_weights: ArrayView1<f64>) -> Self {
        let difference = SyntheticDifference::new(panel, weights);
        let k = panel.num_regressors();
        let scale = 1.0 / (panel.num_units() * panel.num_periods()) as f64;
        let mut gram = Array2::zeros((k, k));
        let mut cross = Array1::zeros(k);
        for (i, &c) in unit_weights.iter().enumerate() {
            let d = difference.regressors(i);
            gram.scaled_add(c * scale, &d.t().dot(&d));
            cross.scaled_add(c * scale, &d.t().dot(&difference.outcome(i)));
        }
        Self {
            difference,
            unit_weights: unit_weights.to_owned(),
            gram,
            cross,
            scale,
        }
    }

    pub fn difference(&self) -> &SyntheticDifference {
        &self.difference
    }

    /// `J(b)`, summed directly over the residuals.
    pub fn value(&self, b: ArrayView1<f64>) -> f64 {
        let total: f64 = self
            .unit_weights
            .iter()
            .enumerate()
            .map(|(i, &c)| {
                let u = self.difference.residual(i, b);
                c * u.dot(&u)
            })
            .sum();
        0.5 * self.scale * total
    }

    /// `G b - h`.
    pub fn gradient(&self, b: ArrayView1<f64>) -> Array1<f64> {
        self.gram.dot(&b) - &self.cross
    }

    /// `G`, constant in `b`.
    pub fn hessian(&self) -> ArrayView2<'_, f64> {
        self.gram.view()
    }

    /// `J(b) - J(anchor)` and its gradient, for the optimizer.
    pub fn cost_and_gradient(&self, anchor: &Array1<f64>) -> CostAndGradient {
        anchored_quadratic(
            self.gram.clone(),
            self.gradient(anchor.view()),
            anchor.clone(),
        )
    }

    /// Synthetic residuals `u_i(b)`. Shape: [num_periods, num_units].
    pub fn residuals(&self, b: ArrayView1<f64>) -> Array2<f64> {
        let n = self.difference.num_units();
        let mut residuals = Array2::zeros((self.difference.num_periods(), n));
        for (i, mut column) in residuals.axis_iter_mut(Axis(1)).enumerate() {
            column.assign(&self.difference.residual(i, b));
        }
        residuals
    }

    /// Mean squared synthetic residual of each unit.
    pub fn unit_variances(&self, b: ArrayView1<f64>) -> Array1<f64> {
        let t = self.difference.num_periods() as f64;
        Array1::from_iter((0..self.difference.num_units()).map(|i| {
            let u = self.difference.residual(i, b);
            u.dot(&u) / t
        }))
    }

    /// Per-unit contributions `S_i = -(c_i / NT) D~_i'u_i` to the gradient.
    /// Shape: [num_units, num_regressors]; the rows sum to `G b - h`.
    pub fn unit_scores(&self, b: ArrayView1<f64>) -> Array2<f64> {
        let n = self.difference.num_units();
        let mut scores = Array2::zeros((n, self.gram.nrows()));
        for (i, mut row) in scores.outer_iter_mut().enumerate() {
            let u = self.difference.residual(i, b);
            let s = self.difference.regressors(i).t().dot(&u);
            row.assign(&(s * (-self.unit_weights[i] * self.scale)));
        }
        scores
    }

    /// Per-period contributions to the gradient. Shape: [num_units, num_periods, num_regressors].
    pub fn observation_scores(&self, b: ArrayView1<f64>) -> Array3<f64> {
        let (n, t, k) = self.difference.regressors.dim();
        let mut scores = Array3::zeros((n, t, k));
        for i in 0..n {
            let u = self.difference.residual(i, b);
            let factor = -self.unit_weights[i] * self.scale;
            let d = self.difference.regressors(i);
            let mut block = scores.index_axis_mut(Axis(0), i);
            for (s, mut row) in block.outer_iter_mut().enumerate() {
                row.assign(&(&d.row(s) * (factor * u[s])));
            }
        }
        scores
    }

    /// `J_i(b) = (1 / 2T) ||u_i(b)||^2`, one unit on its own synthetic difference.
    pub fn unit_value(&self, unit: usize, b: ArrayView1<f64>) -> f64 {
        let u = self.difference.residual(unit, b);
        0.5 * u.dot(&u) / self.difference.num_periods() as f64
    }

    /// `J_i(b) - J_i(anchor)` and its gradient, for the per-unit coefficient fits.
    pub fn unit_cost_and_gradient(&self, unit: usize, anchor: &Array1<f64>) -> CostAndGradient {
        let periods: Vec<usize> = (0..self.difference.num_periods()).collect();
        self.unit_cost_and_gradient_over(unit, &periods, anchor)
    }

    /// As [`Self::unit_cost_and_gradient`], with `J_i` averaged over `periods` only.
    pub fn unit_cost_and_gradient_over(
        &self,
        unit: usize,
        periods: &[usize],
        anchor: &Array1<f64>,
    ) -> CostAndGradient {
        let t = periods.len().max(1) as f64;
        let d = self.difference.regressors(unit).select(Axis(0), periods);
        let u = self
            .difference
            .residual(unit, anchor.view())
            .select(Axis(0), periods);
        let gram = d.t().dot(&d) / t;
        let gradient = -d.t().dot(&u) / t;
        anchored_quadratic(gram, gradient, anchor.clone())
    }
}

fn anchored_quadratic(
    gram: Array2<f64>,
    anchor_gradient: Array1<f64>,
    anchor: Array1<f64>,
) -> CostAndGradient {
    Arc::new(move |b: &Array1<f64>| {
        let step = b - &anchor;
        let curvature = gram.dot(&step);
        let value = 0.5 * step.dot(&curvature) + anchor_gradient.dot(&step);
        (value, curvature + &anchor_gradient)
    })
}
