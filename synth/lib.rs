#![deny(dead_code)]
#![deny(unused_imports)]

pub mod estimate;
pub mod fixed_effects;
pub mod model;
pub mod objective;
pub mod optimizer;
pub mod panel;
pub mod simplex;
pub mod simulate;

#[path = "../inference/lib.rs"]
pub mod inference;

pub use estimate::{EstimationError, EstimationMethod, Estimator, estimate};
pub use model::{EstimatorConfig, EstimatorResult, WeightConstraint, WeightMatrix};
pub use optimizer::{BfgsMinimizer, Minimizer, Restriction};
pub use panel::{Panel, PanelError, PanelObservation, PanelSpec};
