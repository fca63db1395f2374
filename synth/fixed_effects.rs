//! Two-way fixed-effects ("within") regression on a balanced panel.
//!
//! Unit and period effects are absorbed by double demeaning,
//! `x~_it = x_it - x_i. - x_.t + x_..`, followed by OLS on the demeaned data.
//! The fit supplies starting values for the alternating estimator and is the
//! naive benchmark it is compared against.

use ndarray::{Array1, Array2, Array3, Axis};
use ndarray_linalg::Solve;

use crate::estimate::EstimationError;
use crate::panel::Panel;

/// Result of a two-way fixed-effects regression.
#[derive(Debug, Clone)]
pub struct FixedEffectsFit {
    pub coefficients: Array1<f64>,
    pub coefficient_names: Vec<String>,
    pub r_squared_within: f64,
}

fn demean_two_way(values: &Array2<f64>) -> Array2<f64> {
    // values: [num_units, num_periods]
    let unit_means = values.mean_axis(Axis(1)).unwrap_or_default();
    let period_means = values.mean_axis(Axis(0)).unwrap_or_default();
    let grand_mean = values.mean().unwrap_or(0.0);
    Array2::from_shape_fn(values.dim(), |(i, t)| {
        values[[i, t]] - unit_means[i] - period_means[t] + grand_mean
    })
}

/// Fits `Y_it = alpha_i + xi_t + b'X_it + e_it` by the within transformation.
pub fn two_way_fixed_effects(panel: &Panel) -> Result<FixedEffectsFit, EstimationError> {
    let (n, t, k) = (
        panel.num_units(),
        panel.num_periods(),
        panel.num_regressors(),
    );
    let y = demean_two_way(&panel.outcomes().t().to_owned());
    let mut x = Array3::zeros((n, t, k));
    for m in 0..k {
        let column = Array2::from_shape_fn((n, t), |(i, s)| panel.regressors(i)[[s, m]]);
        x.index_axis_mut(Axis(2), m).assign(&demean_two_way(&column));
    }

    let design = x
        .into_shape_with_order((n * t, k))
        .map_err(|e| EstimationError::InvalidInput(format!("design reshape failed: {e}")))?;
    let response = y
        .into_shape_with_order(n * t)
        .map_err(|e| EstimationError::InvalidInput(format!("response reshape failed: {e}")))?;

    let xtx = design.t().dot(&design);
    let xty = design.t().dot(&response);
    let coefficients = xtx.solve(&xty)?;

    let residuals = &response - &design.dot(&coefficients);
    let rss = residuals.dot(&residuals);
    let tss = response.dot(&response);
    let r_squared_within = if tss > 0.0 { 1.0 - rss / tss } else { 0.0 };

    log::info!(
        "Two-way fixed effects: [{}] (within R^2 {:.4})",
        coefficients
            .iter()
            .map(|b| format!("{b:.6}"))
            .collect::<Vec<_>>()
            .join(", "),
        r_squared_within
    );

    Ok(FixedEffectsFit {
        coefficients,
        coefficient_names: panel.regressor_names().to_vec(),
        r_squared_within,
    })
}
