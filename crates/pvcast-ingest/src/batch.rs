//! Model-ready batches: one tensor per variable, rows in a stable site order.

use std::collections::BTreeMap;

use chrono::Duration;
use ndarray::{Array2, Axis};
use serde::{Deserialize, Serialize};

use pvcast_core::{HorizonSpec, InitTime, Site, SiteId};

/// What a model needs from the assembled inputs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputSchema {
    /// NWP sources the model consumes.
    #[serde(default)]
    pub sources: Vec<String>,
    /// Sources that must be present for the model to run at a site.
    #[serde(default)]
    pub required_sources: Vec<String>,
    /// Whether the model reads recent generation history.
    #[serde(default)]
    pub uses_history: bool,
}

impl InputSchema {
    /// A subset of sources is sufficient when every required source is in it
    /// and, if the model consumes any source, at least one of them is.
    pub fn is_satisfied_by(&self, available: impl Fn(&str) -> bool) -> bool {
        let required_ok = self.required_sources.iter().all(|s| available(s));
        let any_ok = self.sources.is_empty() || self.sources.iter().any(|s| available(s));
        required_ok && any_ok
    }
}

/// One NWP source's contribution to a batch.
#[derive(Debug, Clone)]
pub struct NwpBatch {
    pub source_id: String,
    /// Variable name → (site, horizon). Rows of unavailable sites are zero.
    pub variables: BTreeMap<String, Array2<f32>>,
    /// Per-site availability within the staleness tolerance.
    pub available: Vec<bool>,
    /// Oldest data age among available sites.
    pub data_age: Duration,
}

impl NwpBatch {
    pub fn available_count(&self) -> usize {
        self.available.iter().filter(|a| **a).count()
    }
}

/// Capacity-normalised recent generation, shape (site, step), oldest first.
/// Points with no reading hold 0 and are false in `observed`.
#[derive(Debug, Clone)]
pub struct HistoryBatch {
    pub values: Array2<f32>,
    pub observed: Array2<bool>,
    /// Sites with at least one observed point.
    pub available: Vec<bool>,
}

impl HistoryBatch {
    /// Keep only rows `indices`, in that order.
    pub fn select(&self, indices: &[usize]) -> Self {
        Self {
            values: self.values.select(Axis(0), indices),
            observed: self.observed.select(Axis(0), indices),
            available: indices.iter().map(|i| self.available[*i]).collect(),
        }
    }

    /// Most recent observed value of `row`.
    pub fn latest(&self, row: usize) -> Option<f32> {
        let observed = self.observed.row(row);
        (0..observed.len())
            .rev()
            .find(|c| observed[*c])
            .map(|c| self.values[[row, c]])
    }
}

/// Inputs for every requested site at one init time. Row `i` of every tensor
/// belongs to `sites[i]`, and that ordering is preserved through inference,
/// reconciliation and writing.
#[derive(Debug, Clone)]
pub struct ModelBatch {
    pub init_time: InitTime,
    pub horizons: HorizonSpec,
    pub sites: Vec<Site>,
    pub nwp: BTreeMap<String, NwpBatch>,
    pub history: Option<HistoryBatch>,
}

impl ModelBatch {
    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    pub fn site_ids(&self) -> Vec<SiteId> {
        self.sites.iter().map(|s| s.id).collect()
    }

    /// Whether `source` has usable data for the site at row `index`.
    pub fn source_available(&self, source: &str, index: usize) -> bool {
        self.nwp
            .get(source)
            .and_then(|b| b.available.get(index).copied())
            .unwrap_or(false)
    }

    pub fn available_sources(&self, index: usize) -> Vec<&str> {
        self.nwp
            .keys()
            .filter(|s| self.source_available(s, index))
            .map(|s| s.as_str())
            .collect()
    }
}
