//! Forecast values exchanged between inference, reconciliation and the store.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::site::{HorizonSpec, InitTime, SiteId};

/// Quantile outputs keyed by percentile (10, 50, 90, ...).
pub type Quantiles = BTreeMap<u8, f64>;

/// Model identifier + version, as resolved against the model cache.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModelKey {
    pub id: String,
    pub version: String,
}

impl ModelKey {
    pub fn new(id: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            version: version.into(),
        }
    }
}

impl std::fmt::Display for ModelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id, self.version)
    }
}

/// Which model actually produced a forecast.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ModelTag {
    /// Configured model name (the name used by the reconciliation policy).
    pub name: String,
    /// The model that ran.
    pub key: ModelKey,
    /// Set when `key` is the default model standing in for this one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_for: Option<ModelKey>,
}

impl std::fmt::Display for ModelTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.fallback_for {
            Some(requested) => write!(f, "{}:{}[fallback:{}]", self.name, self.key, requested),
            None => write!(f, "{}:{}", self.name, self.key),
        }
    }
}

/// Identifier of a set of contributing models, stable under reordering.
pub fn model_set_id(models: &[ModelTag]) -> String {
    let mut parts: Vec<String> = models.iter().map(|m| m.to_string()).collect();
    parts.sort();
    parts.dedup();
    parts.join("+")
}

/// One horizon of a single model's output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastPoint {
    /// Point estimate in MW.
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantiles: Option<Quantiles>,
}

/// Output of one model for one site. `points[h]` is horizon `h`, so horizons
/// are contiguous and increasing from the init time by construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteForecast {
    pub site_id: SiteId,
    pub init_time: InitTime,
    pub model: ModelTag,
    points: Vec<ForecastPoint>,
}

impl SiteForecast {
    /// Build a forecast, rejecting non-finite values.
    pub fn new(
        site_id: SiteId,
        init_time: InitTime,
        model: ModelTag,
        points: Vec<ForecastPoint>,
    ) -> Result<Self> {
        for (h, p) in points.iter().enumerate() {
            let finite_quantiles = p
                .quantiles
                .as_ref()
                .map_or(true, |q| q.values().all(|v| v.is_finite()));
            if !p.value.is_finite() || !finite_quantiles {
                return Err(Error::Inference(format!(
                    "non-finite output for site {} at horizon {} from {}",
                    site_id, h, model
                )));
            }
        }
        Ok(Self {
            site_id,
            init_time,
            model,
            points,
        })
    }

    pub fn points(&self) -> &[ForecastPoint] {
        &self.points
    }

    pub fn horizon_count(&self) -> usize {
        self.points.len()
    }

    pub fn point(&self, horizon: usize) -> Option<&ForecastPoint> {
        self.points.get(horizon)
    }

    pub fn is_probabilistic(&self) -> bool {
        self.points.iter().any(|p| p.quantiles.is_some())
    }
}

/// One reconciled horizon. `value == None` means no contributing model
/// produced a value; it is never defaulted to zero.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciledPoint {
    pub horizon: usize,
    pub valid_time: DateTime<Utc>,
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantiles: Option<Quantiles>,
}

/// The merged forecast for one site and init time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconciledForecast {
    pub site_id: SiteId,
    pub init_time: InitTime,
    pub horizons: HorizonSpec,
    pub contributing_models: Vec<ModelTag>,
    pub model_set: String,
    pub points: Vec<ReconciledPoint>,
}

impl ReconciledForecast {
    /// Horizons with no value from any contributing model.
    pub fn missing_horizons(&self) -> Vec<usize> {
        self.points
            .iter()
            .filter(|p| p.value.is_none())
            .map(|p| p.horizon)
            .collect()
    }

    pub fn has_any_value(&self) -> bool {
        self.points.iter().any(|p| p.value.is_some())
    }

    pub fn value(&self, horizon: usize) -> Option<f64> {
        self.points.get(horizon).and_then(|p| p.value)
    }
}
