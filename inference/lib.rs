// Hypothesis testing on top of a restricted synthetic-control fit.

pub mod bootstrap;
pub mod histogram;
pub mod wald;

pub use wald::{WaldConfig, WaldError, WaldTestResult, wald_test};
