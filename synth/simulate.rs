//! Synthetic panels from an interactive fixed-effects factor model.
//!
//! Outcomes follow `Y_it = b'D_it + xi_t + lambda_i'f_t + eps_it`, and each
//! treatment is itself driven by the same factors,
//! `D_itm = 1 + kappa lambda_i'f_t + nu_itm`, so a regression that ignores the
//! factor structure is confounded. All randomness comes from the generator the
//! caller passes in.

use ndarray::{Array1, Array2};
use rand::Rng;
use rand_distr::StandardNormal;
use thiserror::Error;

use crate::panel::{Panel, PanelError, PanelObservation, PanelSpec};

#[derive(Error, Debug)]
pub enum SimulationError {
    #[error("Invalid simulation parameter: {0}")]
    InvalidParameter(String),

    #[error("Simulated data did not form a valid panel: {0}")]
    Panel(#[from] PanelError),
}

/// Parameters of the factor-model data generator.
#[derive(Debug, Clone, PartialEq)]
pub struct FactorModelDesign {
    pub num_units: usize,
    pub num_periods: usize,
    /// True treatment coefficients, one per treatment.
    pub coefficients: Vec<f64>,
    pub num_factors: usize,
    /// Loadings are drawn from `U(0, loading_scale)`.
    pub loading_scale: f64,
    /// Standard deviation of the common factors.
    pub factor_strength: f64,
    /// How strongly the treatments load on the factors (kappa).
    pub treatment_confounding: f64,
    /// Standard deviation of the additive time effects.
    pub time_effect_scale: f64,
    pub noise_scale: f64,
    /// Ratio of the last unit's noise standard deviation to the first's.
    pub heteroskedasticity: f64,
}

impl Default for FactorModelDesign {
    fn default() -> Self {
        Self {
            num_units: 15,
            num_periods: 50,
            coefficients: vec![1.0, 2.0],
            num_factors: 1,
            loading_scale: 2.0,
            factor_strength: 2.0,
            treatment_confounding: 1.0,
            time_effect_scale: 1.0,
            noise_scale: 1.0,
            heteroskedasticity: 1.0,
        }
    }
}

/// A generated panel together with the latent quantities behind it.
#[derive(Debug, Clone)]
pub struct SimulatedPanel {
    pub panel: Panel,
    /// Shape: [num_units, num_factors].
    pub loadings: Array2<f64>,
    /// Shape: [num_periods, num_factors].
    pub factors: Array2<f64>,
    pub time_effects: Array1<f64>,
    pub true_coefficients: Array1<f64>,
}

impl FactorModelDesign {
    /// Removes the omitted factor structure entirely (all loadings zero).
    pub fn without_factors(mut self) -> Self {
        self.loading_scale = 0.0;
        self
    }

    pub fn treatment_names(&self) -> Vec<String> {
        (1..=self.coefficients.len()).map(|m| format!("d{m}")).collect()
    }

    fn validate(&self) -> Result<(), SimulationError> {
        if self.coefficients.is_empty() {
            return Err(SimulationError::InvalidParameter(
                "at least one treatment coefficient is required".to_string(),
            ));
        }
        let scales = [
            ("loading_scale", self.loading_scale),
            ("factor_strength", self.factor_strength),
            ("time_effect_scale", self.time_effect_scale),
            ("noise_scale", self.noise_scale),
        ];
        for (name, value) in scales {
            if !value.is_finite() || value < 0.0 {
                return Err(SimulationError::InvalidParameter(format!(
                    "{name} must be finite and non-negative, got {value}"
                )));
            }
        }
        if !self.heteroskedasticity.is_finite() || self.heteroskedasticity <= 0.0 {
            return Err(SimulationError::InvalidParameter(format!(
                "heteroskedasticity must be positive, got {}",
                self.heteroskedasticity
            )));
        }
        Ok(())
    }

    /// Draws one panel.
    pub fn simulate<R: Rng>(&self, rng: &mut R) -> Result<SimulatedPanel, SimulationError> {
        self.validate()?;
        let (n, t, f) = (self.num_units, self.num_periods, self.num_factors);

        let loadings = Array2::from_shape_fn((n, f), |_| {
            self.loading_scale * rng.gen_range(0.0..1.0)
        });
        let factors = Array2::from_shape_fn((t, f), |_| {
            self.factor_strength * rng.sample::<f64, _>(StandardNormal)
        });
        let time_effects = Array1::from_shape_fn(t, |_| {
            self.time_effect_scale * rng.sample::<f64, _>(StandardNormal)
        });
        let true_coefficients = Array1::from_vec(self.coefficients.clone());
        let common = loadings.dot(&factors.t());

        let mut observations = Vec::with_capacity(n * t);
        for i in 0..n {
            let spread = if n > 1 {
                i as f64 / (n - 1) as f64
            } else {
                0.0
            };
            let unit_noise = self.noise_scale * (1.0 + (self.heteroskedasticity - 1.0) * spread);
            for s in 0..t {
                let shock = common[[i, s]];
                let treatments: Vec<f64> = self
                    .coefficients
                    .iter()
                    .map(|_| {
                        1.0 + self.treatment_confounding * shock
                            + rng.sample::<f64, _>(StandardNormal)
                    })
                    .collect();
                let signal: f64 = treatments
                    .iter()
                    .zip(self.coefficients.iter())
                    .map(|(d, b)| d * b)
                    .sum();
                let outcome = signal
                    + time_effects[s]
                    + shock
                    + unit_noise * rng.sample::<f64, _>(StandardNormal);
                observations.push(PanelObservation {
                    unit: format!("unit{}", i + 1),
                    time: format!("{}", s + 1),
                    outcome,
                    treatments,
                    covariates: Vec::new(),
                });
            }
        }

        let spec = PanelSpec::new("unit", "time", "y").with_treatments(self.treatment_names());
        let panel = Panel::from_observations(&spec, observations)?;
        log::debug!(
            "Simulated a {} x {} panel with {} factor(s)",
            n,
            t,
            f
        );
        Ok(SimulatedPanel {
            panel,
            loadings,
            factors,
            time_effects,
            true_coefficients,
        })
    }
}
