//! Ensemble reconciliation: merges per-model site forecasts into one
//! forecast per site, and sums sites into the national aggregate.

pub mod ensemble;
pub mod national;

pub use ensemble::{EnsembleReconciler, ReconcileMode};
pub use national::{national_sum, NATIONAL_MODEL_SET};
