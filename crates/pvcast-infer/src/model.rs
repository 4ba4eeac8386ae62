//! Model schemas, per-chunk model inputs and the `ForecastModel` trait.
//!
//! Models emit capacity-normalised power with shape (site, horizon, output),
//! where `output` is 1 for point models or one column per quantile.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use ndarray::{s, Array2, Array3, Axis};
use serde::{Deserialize, Serialize};

use pvcast_core::{Error, Result, SiteId};
use pvcast_ingest::{HistoryBatch, InputSchema, ModelBatch};

/// Shape of a model's output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputSchema {
    /// Number of horizons produced, starting one step after the init time.
    pub horizons: usize,
    /// Percentiles of the output columns; `None` for point models.
    #[serde(default)]
    pub quantiles: Option<Vec<u8>>,
}

impl OutputSchema {
    pub fn output_width(&self) -> usize {
        self.quantiles.as_ref().map_or(1, |q| q.len())
    }

    /// Column holding the point estimate (the median for quantile models).
    pub fn point_column(&self) -> usize {
        self.quantiles
            .as_ref()
            .and_then(|q| q.iter().position(|p| *p == 50))
            .unwrap_or(0)
    }

    fn validate(&self) -> Result<()> {
        if self.horizons == 0 {
            return Err(Error::ModelUnavailable("model declares zero horizons".into()));
        }
        if let Some(q) = &self.quantiles {
            let increasing = q.windows(2).all(|w| w[0] < w[1]);
            if q.is_empty() || !increasing || !q.contains(&50) || q.iter().any(|p| *p >= 100) {
                return Err(Error::ModelUnavailable(format!(
                    "quantiles {:?} must be increasing percentiles including 50",
                    q
                )));
            }
        }
        Ok(())
    }
}

/// Everything the pipeline needs to know about a model before running it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSchema {
    #[serde(default)]
    pub inputs: InputSchema,
    pub outputs: OutputSchema,
}

/// The rows of a batch a single inference chunk sees.
#[derive(Debug, Clone)]
pub struct ModelInput {
    pub site_ids: Vec<SiteId>,
    pub horizons: usize,
    /// Source → variable → (site, horizon). Only sources the model consumes
    /// and the batch carries are present.
    pub nwp: BTreeMap<String, BTreeMap<String, Array2<f32>>>,
    /// Source → per-site availability.
    pub source_mask: BTreeMap<String, Vec<bool>>,
    pub history: Option<HistoryBatch>,
}

impl ModelInput {
    /// Select rows `indices` of `batch`, truncated to the model's horizons.
    pub fn gather(batch: &ModelBatch, indices: &[usize], schema: &ModelSchema) -> Result<Self> {
        let horizons = schema.outputs.horizons;
        if horizons > batch.horizons.count {
            return Err(Error::Inference(format!(
                "model needs {} horizons, batch has {}",
                horizons, batch.horizons.count
            )));
        }
        if let Some(bad) = indices.iter().find(|i| **i >= batch.len()) {
            return Err(Error::Inference(format!("row {} outside batch", bad)));
        }

        let mut nwp = BTreeMap::new();
        let mut source_mask = BTreeMap::new();
        for source in &schema.inputs.sources {
            let Some(nwp_batch) = batch.nwp.get(source) else {
                continue;
            };
            let mut variables = BTreeMap::new();
            for (name, tensor) in &nwp_batch.variables {
                let rows = tensor.select(Axis(0), indices);
                variables.insert(name.clone(), rows.slice(s![.., ..horizons]).to_owned());
            }
            nwp.insert(source.clone(), variables);
            source_mask.insert(
                source.clone(),
                indices.iter().map(|i| nwp_batch.available[*i]).collect(),
            );
        }

        let history = match (&batch.history, schema.inputs.uses_history) {
            (Some(h), true) => Some(h.select(indices)),
            _ => None,
        };

        Ok(Self {
            site_ids: indices.iter().map(|i| batch.sites[*i].id).collect(),
            horizons,
            nwp,
            source_mask,
            history,
        })
    }

    pub fn len(&self) -> usize {
        self.site_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.site_ids.is_empty()
    }

    /// Most recent observed generation of `row`, 0 when there is none.
    pub fn latest_history(&self, row: usize) -> f32 {
        self.history
            .as_ref()
            .and_then(|h| h.latest(row))
            .unwrap_or(0.0)
    }

    pub fn is_available(&self, source: &str, row: usize) -> bool {
        self.source_mask
            .get(source)
            .and_then(|m| m.get(row).copied())
            .unwrap_or(false)
    }
}

/// A loaded, ready-to-run forecasting model.
pub trait ForecastModel: Send + Sync {
    /// Normalised output of shape (site, horizon, output width).
    fn forward(&self, input: &ModelInput) -> Result<Array3<f32>>;
}

/// Parameters of the built-in linear model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinearParams {
    #[serde(default)]
    pub intercept: f32,
    /// Source → variable → coefficient.
    #[serde(default)]
    pub coefficients: BTreeMap<String, BTreeMap<String, f32>>,
    /// Applied to the most recent normalised generation value.
    #[serde(default)]
    pub history_coefficient: f32,
    /// Offsets added to the point estimate per quantile column.
    #[serde(default)]
    pub quantile_offsets: Vec<f32>,
}

/// Linear regression over NWP covariates. Each site is computed on its own
/// with a fixed summation order, so output does not depend on chunking.
pub struct LinearModel {
    schema: ModelSchema,
    params: LinearParams,
}

impl LinearModel {
    pub fn new(schema: ModelSchema, params: LinearParams) -> Result<Self> {
        if schema.outputs.quantiles.is_some()
            && params.quantile_offsets.len() != schema.outputs.output_width()
        {
            return Err(Error::ModelUnavailable(format!(
                "{} quantile offsets for {} quantiles",
                params.quantile_offsets.len(),
                schema.outputs.output_width()
            )));
        }
        Ok(Self { schema, params })
    }
}

impl ForecastModel for LinearModel {
    fn forward(&self, input: &ModelInput) -> Result<Array3<f32>> {
        let width = self.schema.outputs.output_width();
        let mut out = Array3::zeros((input.len(), input.horizons, width));

        for row in 0..input.len() {
            let recent = input.latest_history(row);

            for h in 0..input.horizons {
                let mut y = self.params.intercept + self.params.history_coefficient * recent;
                for (source, coefficients) in &self.params.coefficients {
                    if !input.is_available(source, row) {
                        continue;
                    }
                    let variables = &input.nwp[source];
                    for (variable, coefficient) in coefficients {
                        let tensor = variables.get(variable).ok_or_else(|| {
                            Error::Inference(format!("{} lacks variable {}", source, variable))
                        })?;
                        y += coefficient * tensor[[row, h]];
                    }
                }

                if self.schema.outputs.quantiles.is_some() {
                    for (q, offset) in self.params.quantile_offsets.iter().enumerate() {
                        out[[row, h, q]] = y + offset;
                    }
                } else {
                    out[[row, h, 0]] = y;
                }
            }
        }
        Ok(out)
    }
}

/// On-disk `model.json`.
#[derive(Debug, Deserialize)]
struct ModelArtifact {
    schema: ModelSchema,
    #[serde(flatten)]
    kind: ArtifactKind,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ArtifactKind {
    Linear(LinearParams),
    Onnx { file: String },
}

/// Build a model from the bytes of `dir/model.json`.
pub fn load_artifact(dir: &Path, bytes: &[u8]) -> Result<(ModelSchema, Arc<dyn ForecastModel>)> {
    let artifact: ModelArtifact = serde_json::from_slice(bytes).map_err(|e| {
        Error::ModelUnavailable(format!("{}: invalid model.json: {}", dir.display(), e))
    })?;
    artifact.schema.outputs.validate()?;

    let model: Arc<dyn ForecastModel> = match artifact.kind {
        ArtifactKind::Linear(params) => {
            Arc::new(LinearModel::new(artifact.schema.clone(), params)?)
        }
        ArtifactKind::Onnx { file } => load_onnx(&dir.join(file), &artifact.schema)?,
    };
    Ok((artifact.schema, model))
}

#[cfg(feature = "onnx")]
fn load_onnx(path: &Path, schema: &ModelSchema) -> Result<Arc<dyn ForecastModel>> {
    Ok(Arc::new(crate::onnx_model::OnnxModel::load(path, schema.clone())?))
}

#[cfg(not(feature = "onnx"))]
fn load_onnx(path: &Path, _schema: &ModelSchema) -> Result<Arc<dyn ForecastModel>> {
    Err(Error::ModelUnavailable(format!(
        "{} is an ONNX model but the onnx feature is disabled",
        path.display()
    )))
}
