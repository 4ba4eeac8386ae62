//! Per-site merging of model outputs.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::debug;

use pvcast_core::{
    model_set_id, HorizonSpec, InitTime, PvcastConfig, ReconcilePolicy, ReconciledForecast,
    ReconciledPoint, SiteForecast, SiteId,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileMode {
    /// First model in precedence order with a value wins.
    Precedence,
    /// Weighted mean over every model with a value.
    WeightedAverage,
}

/// Merges the forecasts of several models for one site.
///
/// `order` ranks models by configured name. It decides the winner under
/// `Precedence`, and under `WeightedAverage` it fixes the summation order
/// and which probabilistic model supplies quantiles.
#[derive(Debug, Clone)]
pub struct EnsembleReconciler {
    mode: ReconcileMode,
    order: Vec<String>,
    weights: BTreeMap<String, f64>,
}

impl EnsembleReconciler {
    pub fn precedence(order: Vec<String>) -> Self {
        Self {
            mode: ReconcileMode::Precedence,
            order,
            weights: BTreeMap::new(),
        }
    }

    pub fn weighted_average(order: Vec<String>, weights: BTreeMap<String, f64>) -> Self {
        Self {
            mode: ReconcileMode::WeightedAverage,
            order,
            weights,
        }
    }

    pub fn from_config(config: &PvcastConfig) -> Self {
        let order = config.precedence_order();
        match config.reconcile {
            ReconcilePolicy::Precedence { .. } => Self::precedence(order),
            ReconcilePolicy::WeightedAverage => Self::weighted_average(
                order,
                config
                    .models
                    .iter()
                    .map(|m| (m.name.clone(), m.weight))
                    .collect(),
            ),
        }
    }

    pub fn mode(&self) -> ReconcileMode {
        self.mode
    }

    /// Position of `name` in the precedence order; unlisted models rank
    /// after every listed one.
    fn rank(&self, name: &str) -> usize {
        self.order
            .iter()
            .position(|n| n == name)
            .unwrap_or(self.order.len())
    }

    fn weight(&self, name: &str) -> f64 {
        self.weights.get(name).copied().unwrap_or(1.0)
    }

    /// Merge `forecasts` (one per model, all for `site_id`) over `horizons`.
    /// A horizon no model covers is left without a value.
    pub fn reconcile(
        &self,
        site_id: SiteId,
        init_time: InitTime,
        horizons: HorizonSpec,
        forecasts: &[SiteForecast],
    ) -> ReconciledForecast {
        let mut ranked: Vec<&SiteForecast> = forecasts.iter().collect();
        ranked.sort_by(|a, b| {
            self.rank(&a.model.name)
                .cmp(&self.rank(&b.model.name))
                .then_with(|| a.model.name.cmp(&b.model.name))
        });

        let points: Vec<ReconciledPoint> = (0..horizons.count)
            .map(|h| {
                let present: Vec<&SiteForecast> =
                    ranked.iter().copied().filter(|f| f.point(h).is_some()).collect();
                let (value, quantiles) = match self.mode {
                    ReconcileMode::Precedence => match present.first().and_then(|f| f.point(h)) {
                        Some(point) => (Some(point.value), point.quantiles.clone()),
                        None => (None, None),
                    },
                    ReconcileMode::WeightedAverage => (
                        self.weighted_mean(&present, h),
                        present
                            .iter()
                            .find_map(|f| f.point(h).and_then(|p| p.quantiles.clone())),
                    ),
                };
                ReconciledPoint {
                    horizon: h,
                    valid_time: horizons.valid_time(init_time, h),
                    value,
                    quantiles,
                }
            })
            .collect();

        let contributing_models: Vec<_> = ranked.iter().map(|f| f.model.clone()).collect();
        let reconciled = ReconciledForecast {
            site_id,
            init_time,
            horizons,
            model_set: model_set_id(&contributing_models),
            contributing_models,
            points,
        };
        let missing = reconciled.missing_horizons();
        if !missing.is_empty() {
            debug!("Site {}: no model covers horizons {:?}", site_id, missing);
        }
        reconciled
    }

    fn weighted_mean(&self, present: &[&SiteForecast], h: usize) -> Option<f64> {
        let values: Vec<(f64, f64)> = present
            .iter()
            .filter_map(|f| f.point(h).map(|p| (self.weight(&f.model.name), p.value)))
            .collect();
        if values.is_empty() {
            return None;
        }

        let total: f64 = values.iter().map(|(w, _)| w).sum();
        if total > 0.0 {
            Some(values.iter().map(|(w, v)| w * v).sum::<f64>() / total)
        } else {
            // every present model weighted zero: fall back to the plain mean
            Some(values.iter().map(|(_, v)| v).sum::<f64>() / values.len() as f64)
        }
    }
}
