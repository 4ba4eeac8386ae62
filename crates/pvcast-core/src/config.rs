//! Pipeline configuration: sources, models, reconciliation and run limits.
//!
//! Loaded from a JSON file, then overridden from the environment, then
//! validated. Every threshold the pipeline uses lives here rather than in code.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::forecast::ModelKey;

pub const DEFAULT_BATCH_SIZE: usize = 10;
pub const DEFAULT_STEP_MINUTES: u32 = 30;
pub const DEFAULT_HARD_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_STALENESS_TOLERANCE_MINUTES: i64 = 180;

/// Upper bounds enforced by `validate`.
pub const MAX_HARD_TIMEOUT_SECS: u64 = 24 * 60 * 60;
pub const MAX_STALENESS_TOLERANCE_MINUTES: i64 = 7 * 24 * 60;
pub const MAX_WORKERS: usize = 256;
pub const MAX_STEP_MINUTES: u32 = 24 * 60;

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PvcastConfig {
    /// SQLite forecast store file.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Local model cache, laid out as `<id>/<version>/model.json`.
    #[serde(default = "default_model_cache_dir")]
    pub model_cache_dir: PathBuf,
    /// Mirror the hub downloader copies from on cache miss.
    #[serde(default)]
    pub model_hub_dir: Option<PathBuf>,
    /// JSON list of sites.
    #[serde(default)]
    pub sites_file: Option<PathBuf>,
    /// Directory holding `<source>.json` NWP extracts.
    #[serde(default)]
    pub nwp_dir: Option<PathBuf>,
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    pub models: Vec<ModelConfig>,
    /// Used in place of any model whose weights cannot be found.
    #[serde(default)]
    pub default_model: Option<ModelKey>,
    #[serde(default)]
    pub reconcile: ReconcilePolicy,
    #[serde(default)]
    pub national: NationalConfig,
    /// Run models flagged `extra` as well as the primary ones.
    #[serde(default)]
    pub run_extra_models: bool,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/forecasts.db")
}

fn default_model_cache_dir() -> PathBuf {
    PathBuf::from("data/models")
}

/// Limits and knobs for a single run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Sites per inference chunk.
    pub max_batch_size: usize,
    /// Concurrent source fetches / inference chunks.
    pub max_workers: usize,
    /// Init time granularity and horizon step.
    pub step_minutes: u32,
    pub hard_timeout_secs: u64,
    /// Horizons whose sun elevation is below this are forced to zero.
    /// `None` disables the sundown mask.
    pub min_sun_elevation_deg: Option<f64>,
    /// Recent generation window fed to models that use history.
    pub history_window_minutes: Option<u32>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_batch_size: DEFAULT_BATCH_SIZE,
            max_workers: default_workers(),
            step_minutes: DEFAULT_STEP_MINUTES,
            hard_timeout_secs: DEFAULT_HARD_TIMEOUT_SECS,
            min_sun_elevation_deg: Some(0.0),
            history_window_minutes: None,
        }
    }
}

/// One less than the core count, at least one.
fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get().saturating_sub(1).max(1))
        .unwrap_or(1)
}

/// An NWP provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub id: String,
    /// Maximum age of the data relative to the init time.
    #[serde(default = "default_staleness")]
    pub staleness_tolerance_minutes: i64,
}

fn default_staleness() -> i64 {
    DEFAULT_STALENESS_TOLERANCE_MINUTES
}

/// A model to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Name forecasts are tagged with; must be unique.
    pub name: String,
    pub id: String,
    pub version: String,
    /// Overrides the required-source list declared by the model artifact.
    #[serde(default)]
    pub required_sources: Option<Vec<String>>,
    /// Weight under `weighted_average` reconciliation.
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Only run when `run_extra_models` is set.
    #[serde(default)]
    pub extra: bool,
    /// Expected hex SHA-256 of `model.json`.
    #[serde(default)]
    pub sha256: Option<String>,
}

fn default_weight() -> f64 {
    1.0
}

impl ModelConfig {
    pub fn key(&self) -> ModelKey {
        ModelKey::new(&self.id, &self.version)
    }
}

/// How multiple model outputs are merged per site and horizon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ReconcilePolicy {
    /// First model in `order` with a value wins. Empty `order` means
    /// configuration order.
    Precedence {
        #[serde(default)]
        order: Vec<String>,
    },
    /// Weighted mean of all present values, weights from `ModelConfig`.
    WeightedAverage,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        Self::Precedence { order: Vec::new() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NationalConfig {
    /// Write the sum over sites as site 0.
    pub enabled: bool,
}

impl Default for NationalConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl PvcastConfig {
    /// Load from a JSON file, apply environment overrides and validate.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let mut config = Self::from_json(&text)?;
        config.apply_env_overrides();
        config.validate()?;
        info!(
            "Loaded config from {}: {} models, {} sources",
            path.display(),
            config.models.len(),
            config.sources.len()
        );
        Ok(config)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Config(format!("invalid config: {}", e)))
    }

    /// Environment variables take precedence over the file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(path) = std::env::var("PVCAST_DB_PATH") {
            self.db_path = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("PVCAST_MODEL_CACHE") {
            self.model_cache_dir = PathBuf::from(path);
        }
        if let Ok(flag) = std::env::var("PVCAST_RUN_EXTRA_MODELS") {
            self.run_extra_models = flag.eq_ignore_ascii_case("true");
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.models.is_empty() {
            return Err(Error::Config("no models configured".into()));
        }

        let mut names = HashSet::new();
        for model in &self.models {
            if !names.insert(model.name.as_str()) {
                return Err(Error::Config(format!(
                    "model names must be unique, '{}' appears twice",
                    model.name
                )));
            }
            if !model.weight.is_finite() || model.weight < 0.0 {
                return Err(Error::Config(format!(
                    "model '{}' has invalid weight {}",
                    model.name, model.weight
                )));
            }
        }

        if let ReconcilePolicy::Precedence { order } = &self.reconcile {
            if let Some(unknown) = order.iter().find(|n| !names.contains(n.as_str())) {
                return Err(Error::Config(format!(
                    "precedence lists unknown model '{}'",
                    unknown
                )));
            }
        }

        let mut source_ids = HashSet::new();
        for source in &self.sources {
            if !source_ids.insert(source.id.as_str()) {
                return Err(Error::Config(format!("duplicate source '{}'", source.id)));
            }
            if !(0..=MAX_STALENESS_TOLERANCE_MINUTES).contains(&source.staleness_tolerance_minutes) {
                return Err(Error::Config(format!(
                    "source '{}' staleness tolerance {} min is outside 0..={}",
                    source.id, source.staleness_tolerance_minutes, MAX_STALENESS_TOLERANCE_MINUTES
                )));
            }
        }

        if self.run.max_batch_size == 0 {
            return Err(Error::Config("max_batch_size must be at least 1".into()));
        }
        if !(1..=MAX_WORKERS).contains(&self.run.max_workers) {
            return Err(Error::Config(format!(
                "max_workers {} is outside 1..={}",
                self.run.max_workers, MAX_WORKERS
            )));
        }
        if !(1..=MAX_STEP_MINUTES).contains(&self.run.step_minutes) {
            return Err(Error::Config(format!(
                "step_minutes {} is outside 1..={}",
                self.run.step_minutes, MAX_STEP_MINUTES
            )));
        }
        if !(1..=MAX_HARD_TIMEOUT_SECS).contains(&self.run.hard_timeout_secs) {
            return Err(Error::Config(format!(
                "hard_timeout_secs {} is outside 1..={}",
                self.run.hard_timeout_secs, MAX_HARD_TIMEOUT_SECS
            )));
        }
        Ok(())
    }

    /// Models selected for this run (primary ones, plus extras if enabled).
    pub fn active_models(&self) -> Vec<&ModelConfig> {
        self.models
            .iter()
            .filter(|m| !m.extra || self.run_extra_models)
            .collect()
    }

    /// Full precedence order: the configured list, then the remaining models
    /// in configuration order.
    pub fn precedence_order(&self) -> Vec<String> {
        let mut order: Vec<String> = match &self.reconcile {
            ReconcilePolicy::Precedence { order } => order.clone(),
            ReconcilePolicy::WeightedAverage => Vec::new(),
        };
        for model in &self.models {
            if !order.contains(&model.name) {
                order.push(model.name.clone());
            }
        }
        order
    }
}
