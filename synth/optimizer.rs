//! # Nonlinear Optimizer Oracle
//!
//! The coefficient step of the estimator never minimizes anything itself: it
//! hands an objective and its gradient to a [`Minimizer`], optionally together
//! with a single equality [`Restriction`] `g(b) = 0`. Any optimization library
//! can be plugged in behind this trait.
//!
//! The default [`BfgsMinimizer`] drives the `wolfe_bfgs` solver. Equality
//! restrictions are handled with an augmented Lagrangian: each outer round runs
//! BFGS on `J(b) + mu g(b) + (rho / 2) g(b)^2`, then updates the multiplier `mu`
//! and, when the violation stalls, the penalty `rho`. A closing Newton
//! projection along `g'(b)` puts the reported point on the constraint surface.

use ndarray::Array1;
use std::fmt;
use std::sync::{Arc, Mutex};
use wolfe_bfgs::{Bfgs, BfgsSolution};

/// An objective returning its value and gradient at a point.
pub type CostAndGradient = Arc<dyn Fn(&Array1<f64>) -> (f64, Array1<f64>) + Send + Sync>;

type ScalarFn = Arc<dyn Fn(&Array1<f64>) -> f64 + Send + Sync>;
type VectorFn = Arc<dyn Fn(&Array1<f64>) -> Array1<f64> + Send + Sync>;

/// A single equality restriction `g(b) = 0` with its analytic gradient.
#[derive(Clone)]
pub struct Restriction {
    label: String,
    function: ScalarFn,
    gradient: VectorFn,
}

impl Restriction {
    pub fn new<G, D>(label: impl Into<String>, function: G, gradient: D) -> Self
    where
        G: Fn(&Array1<f64>) -> f64 + Send + Sync + 'static,
        D: Fn(&Array1<f64>) -> Array1<f64> + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            function: Arc::new(function),
            gradient: Arc::new(gradient),
        }
    }

    /// The linear restriction `a'b = c`.
    pub fn linear(coefficients: Array1<f64>, value: f64) -> Self {
        let label = format!(
            "{} = {}",
            coefficients
                .iter()
                .enumerate()
                .filter(|(_, a)| **a != 0.0)
                .map(|(k, a)| format!("{a}*b[{k}]"))
                .collect::<Vec<_>>()
                .join(" + "),
            value
        );
        let gradient = coefficients.clone();
        Self::new(
            label,
            move |b: &Array1<f64>| coefficients.dot(b) - value,
            move |_: &Array1<f64>| gradient.clone(),
        )
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn value(&self, b: &Array1<f64>) -> f64 {
        (self.function)(b)
    }

    pub fn gradient(&self, b: &Array1<f64>) -> Array1<f64> {
        (self.gradient)(b)
    }

    /// Moves `b` onto `g(b) = 0` with Newton steps along the restriction normal.
    pub fn project(&self, mut b: Array1<f64>) -> Array1<f64> {
        for _ in 0..MAX_PROJECTION_STEPS {
            let violation = self.value(&b);
            if violation.abs() <= PROJECTION_TOLERANCE {
                break;
            }
            let normal = self.gradient(&b);
            let norm_sq = normal.dot(&normal);
            if norm_sq <= 0.0 || !norm_sq.is_finite() {
                break;
            }
            b.scaled_add(-violation / norm_sq, &normal);
        }
        b
    }
}

impl fmt::Debug for Restriction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Restriction")
            .field("label", &self.label)
            .finish()
    }
}

const MAX_PROJECTION_STEPS: usize = 50;
const PROJECTION_TOLERANCE: f64 = 1e-13;

/// What the oracle reports back.
#[derive(Debug, Clone)]
pub struct Minimum {
    pub minimizer: Array1<f64>,
    pub converged: bool,
    pub iterations: usize,
}

/// The nonlinear-optimizer contract consumed by the coefficient step.
pub trait Minimizer: Send + Sync {
    /// Minimizes `objective` from `initial_point`, subject to `constraint` when given.
    /// A point that fails to improve on the start is reported with `converged = false`
    /// and the start returned unchanged.
    fn minimize(
        &self,
        objective: CostAndGradient,
        initial_point: Array1<f64>,
        constraint: Option<&Restriction>,
    ) -> Minimum;
}

/// BFGS with strong-Wolfe line search, wrapped in an augmented Lagrangian for
/// equality restrictions.
#[derive(Debug, Clone)]
pub struct BfgsMinimizer {
    pub tolerance: f64,
    pub max_iterations: usize,
    pub constraint_tolerance: f64,
    pub max_penalty_rounds: usize,
}

impl Default for BfgsMinimizer {
    fn default() -> Self {
        Self {
            tolerance: 1e-10,
            max_iterations: 500,
            constraint_tolerance: 1e-6,
            max_penalty_rounds: 60,
        }
    }
}

const INITIAL_PENALTY: f64 = 1.0;
const MAX_PENALTY: f64 = 1e8;
/// Gradient norm, relative to the starting one, at which a stalled line search still counts as converged.
const STALLED_GRADIENT_RATIO: f64 = 1e-6;

#[derive(Debug, Clone)]
struct Incumbent {
    point: Array1<f64>,
    value: f64,
    gradient_norm: f64,
    evaluations: usize,
}

impl BfgsMinimizer {
    pub fn new(tolerance: f64, max_iterations: usize, constraint_tolerance: f64) -> Self {
        Self {
            tolerance,
            max_iterations,
            constraint_tolerance,
            ..Self::default()
        }
    }

    fn run_bfgs(&self, objective: CostAndGradient, initial_point: Array1<f64>) -> Minimum {
        let (initial_cost, initial_grad) = objective(&initial_point);
        if !initial_cost.is_finite() {
            log::warn!("Objective is not finite at the starting point; skipping BFGS");
            return Minimum {
                minimizer: initial_point,
                converged: false,
                iterations: 0,
            };
        }
        let initial_norm = initial_grad.dot(&initial_grad).sqrt();
        if initial_norm <= self.tolerance {
            return Minimum {
                minimizer: initial_point,
                converged: true,
                iterations: 0,
            };
        }

        // The line search can give up once decreases fall below floating-point
        // resolution; the best evaluated point is kept so that case is recoverable.
        let incumbent = Arc::new(Mutex::new(Incumbent {
            point: initial_point.clone(),
            value: initial_cost,
            gradient_norm: initial_norm,
            evaluations: 0,
        }));
        let tracker = Arc::clone(&incumbent);
        let cost_and_grad = move |b: &Array1<f64>| -> (f64, Array1<f64>) {
            let (cost, grad) = objective(b);
            if let Ok(mut best) = tracker.lock() {
                best.evaluations += 1;
                if cost.is_finite() && cost < best.value {
                    best.point = b.clone();
                    best.value = cost;
                    best.gradient_norm = grad.dot(&grad).sqrt();
                }
            }
            (cost, grad)
        };

        let outcome = Bfgs::new(initial_point.clone(), cost_and_grad)
            .with_tolerance(self.tolerance)
            .with_max_iterations(self.max_iterations)
            .run();
        let best = match incumbent.lock() {
            Ok(best) => best.clone(),
            Err(_) => Incumbent {
                point: initial_point,
                value: initial_cost,
                gradient_norm: initial_norm,
                evaluations: 0,
            },
        };

        match outcome {
            Ok(BfgsSolution {
                final_point,
                final_value,
                iterations,
                ..
            }) if final_value.is_finite() && final_value <= initial_cost => Minimum {
                minimizer: final_point,
                converged: true,
                iterations,
            },
            Ok(solution) => {
                log::warn!(
                    "BFGS finished at a worse point ({:.6e} > {:.6e}); keeping the best evaluated point",
                    solution.final_value,
                    initial_cost
                );
                Minimum {
                    minimizer: best.point,
                    converged: false,
                    iterations: solution.iterations,
                }
            }
            Err(e) => {
                let stalled_at_minimum =
                    best.gradient_norm <= STALLED_GRADIENT_RATIO * initial_norm.max(1.0);
                if stalled_at_minimum {
                    log::debug!(
                        "BFGS stopped early at gradient norm {:.3e}; accepting the best point",
                        best.gradient_norm
                    );
                } else {
                    log::warn!(
                        "BFGS failed to converge (gradient norm {:.3e}): {:?}",
                        best.gradient_norm,
                        e
                    );
                }
                Minimum {
                    minimizer: best.point,
                    converged: stalled_at_minimum,
                    iterations: best.evaluations,
                }
            }
        }
    }

    fn augmented_lagrangian(
        &self,
        objective: CostAndGradient,
        initial_point: Array1<f64>,
        restriction: &Restriction,
    ) -> Minimum {
        let mut point = initial_point;
        let mut multiplier = 0.0;
        let mut penalty = INITIAL_PENALTY;
        let mut previous_violation = restriction.value(&point).abs();
        let mut inner_converged = true;
        let mut iterations = 0;
        let target = self.constraint_tolerance * 1e-3;

        for round in 0..self.max_penalty_rounds {
            let inner = {
                let objective = objective.clone();
                let restriction = restriction.clone();
                let (mu, rho) = (multiplier, penalty);
                let merit: CostAndGradient = Arc::new(move |b: &Array1<f64>| {
                    let (cost, mut grad) = objective(b);
                    let g = restriction.value(b);
                    grad.scaled_add(mu + rho * g, &restriction.gradient(b));
                    (cost + mu * g + 0.5 * rho * g * g, grad)
                });
                self.run_bfgs(merit, point.clone())
            };
            point = inner.minimizer;
            inner_converged = inner.converged;
            iterations += inner.iterations;

            let violation = restriction.value(&point);
            log::debug!(
                "Augmented Lagrangian round {}: |g(b)| = {:.3e}, mu = {:.4e}, rho = {:.1e}",
                round,
                violation.abs(),
                multiplier,
                penalty
            );
            if violation.abs() <= target && inner_converged {
                break;
            }
            multiplier += penalty * violation;
            if violation.abs() > 0.25 * previous_violation {
                penalty = (penalty * 10.0).min(MAX_PENALTY);
            }
            previous_violation = violation.abs();
        }

        let point = restriction.project(point);
        let violation = restriction.value(&point).abs();
        if violation > self.constraint_tolerance {
            log::warn!(
                "Restricted minimization ended with |g(b)| = {:.3e} above tolerance {:.1e}",
                violation,
                self.constraint_tolerance
            );
        }
        Minimum {
            converged: inner_converged && violation <= self.constraint_tolerance,
            minimizer: point,
            iterations,
        }
    }
}

impl Minimizer for BfgsMinimizer {
    fn minimize(
        &self,
        objective: CostAndGradient,
        initial_point: Array1<f64>,
        constraint: Option<&Restriction>,
    ) -> Minimum {
        match constraint {
            None => self.run_bfgs(objective, initial_point),
            Some(restriction) => self.augmented_lagrangian(objective, initial_point, restriction),
        }
    }
}

// --- Unit Tests ---
#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};

    /// `0.5 (b - c)' A (b - c)` with a fixed positive-definite `A`.
    fn quadratic(center: Array1<f64>) -> CostAndGradient {
        let a: Array2<f64> = array![[2.0, 0.5], [0.5, 1.0]];
        Arc::new(move |b: &Array1<f64>| {
            let d = b - &center;
            let ad = a.dot(&d);
            (0.5 * d.dot(&ad), ad)
        })
    }

    #[test]
    fn unconstrained_quadratic_reaches_its_center() {
        let minimizer = BfgsMinimizer::default();
        let result = minimizer.minimize(quadratic(array![1.0, -2.0]), array![5.0, 5.0], None);
        assert!(result.converged);
        assert_abs_diff_eq!(result.minimizer[0], 1.0, epsilon = 1e-7);
        assert_abs_diff_eq!(result.minimizer[1], -2.0, epsilon = 1e-7);
    }

    #[test]
    fn stationary_start_is_returned_untouched() {
        let minimizer = BfgsMinimizer::default();
        let start = array![1.0, -2.0];
        let result = minimizer.minimize(quadratic(start.clone()), start.clone(), None);
        assert!(result.converged);
        assert_eq!(result.iterations, 0);
        assert_eq!(result.minimizer, start);
    }

    #[test]
    fn linear_restriction_is_satisfied_at_the_solution() {
        let minimizer = BfgsMinimizer::default();
        let restriction = Restriction::linear(array![1.0, 1.0], 0.0);
        let result = minimizer.minimize(
            quadratic(array![1.0, 2.0]),
            array![0.0, 0.0],
            Some(&restriction),
        );
        assert!(result.converged);
        assert!(restriction.value(&result.minimizer).abs() < 1e-6);
        let expected = {
            let c = array![1.0, 2.0];
            let n = array![1.0, 1.0];
            // b = c - A^{-1} n (n'c / n'A^{-1}n)
            let det: f64 = 2.0 * 1.0 - 0.5 * 0.5;
            let a_inv: Array2<f64> = array![[1.0, -0.5], [-0.5, 2.0]] / det;
            let a_inv_n = a_inv.dot(&n);
            let scale = n.dot(&c) / n.dot(&a_inv_n);
            &c - &(a_inv_n * scale)
        };
        assert_abs_diff_eq!(result.minimizer[0], expected[0], epsilon = 1e-5);
        assert_abs_diff_eq!(result.minimizer[1], expected[1], epsilon = 1e-5);
    }

    #[test]
    fn nonlinear_restriction_lands_on_the_circle() {
        let minimizer = BfgsMinimizer::default();
        let circle = Restriction::new(
            "b1^2 + b2^2 = 1",
            |b: &Array1<f64>| b[0] * b[0] + b[1] * b[1] - 1.0,
            |b: &Array1<f64>| array![2.0 * b[0], 2.0 * b[1]],
        );
        let result = minimizer.minimize(quadratic(array![3.0, 0.0]), array![0.5, 0.5], Some(&circle));
        assert!(circle.value(&result.minimizer).abs() < 1e-6);
        assert!(result.minimizer[0] > 0.0);
    }

    #[test]
    fn projection_moves_onto_the_surface() {
        let r = Restriction::linear(array![2.0, -1.0], 4.0);
        let b = r.project(array![0.0, 0.0]);
        assert_abs_diff_eq!(r.value(&b), 0.0, epsilon = 1e-12);
        assert_eq!(format!("{:?}", r), "Restriction { label: \"2*b[0] + -1*b[1] = 4\" }");
    }
}
