//! Batched inference with chunk isolation.
//!
//! Eligible sites are split into chunks of at most `max_batch_size`, run on
//! the blocking pool with at most `max_workers` in flight. A failed chunk
//! only fails its own sites; results land by row index, so completion order
//! never affects the output.

use std::collections::BTreeMap;
use std::sync::Arc;

use ndarray::{Array3, ArrayView1, Axis};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use pvcast_core::{Error, ForecastPoint, ModelTag, Quantiles, Result, RunConfig, SiteForecast};
use pvcast_ingest::ModelBatch;

use crate::model::{ModelInput, OutputSchema};
use crate::registry::ModelHandle;

/// Output of one model over a batch, aligned with `batch.sites`.
#[derive(Debug)]
pub struct ModelRun {
    pub model: ModelTag,
    /// `Some` for sites the model forecast successfully.
    pub forecasts: Vec<Option<SiteForecast>>,
    /// Row index → reason, for eligible sites that failed.
    pub errors: BTreeMap<usize, String>,
}

impl ModelRun {
    pub fn succeeded(&self) -> usize {
        self.forecasts.iter().filter(|f| f.is_some()).count()
    }
}

/// Runs model forward passes over assembled batches.
#[derive(Debug, Clone)]
pub struct InferenceRunner {
    max_batch_size: usize,
    max_workers: usize,
    min_sun_elevation_deg: Option<f64>,
}

impl InferenceRunner {
    pub fn new(max_batch_size: usize, max_workers: usize) -> Self {
        Self {
            max_batch_size: max_batch_size.max(1),
            max_workers: max_workers.clamp(1, Semaphore::MAX_PERMITS),
            min_sun_elevation_deg: Some(0.0),
        }
    }

    pub fn from_config(config: &RunConfig) -> Self {
        Self::new(config.max_batch_size, config.max_workers)
            .with_sundown_mask(config.min_sun_elevation_deg)
    }

    /// Zero out horizons where the sun is below `elevation` degrees.
    pub fn with_sundown_mask(mut self, elevation: Option<f64>) -> Self {
        self.min_sun_elevation_deg = elevation;
        self
    }

    /// Run `handle` over the rows of `batch` flagged in `eligible`.
    pub async fn run(
        &self,
        handle: &ModelHandle,
        batch: &Arc<ModelBatch>,
        eligible: &[bool],
    ) -> ModelRun {
        let rows: Vec<usize> = (0..batch.len())
            .filter(|i| eligible.get(*i).copied().unwrap_or(false))
            .collect();
        let chunks: Vec<Vec<usize>> = rows
            .chunks(self.max_batch_size)
            .map(|c| c.to_vec())
            .collect();

        info!(
            "Running {} over {} sites in {} chunks",
            handle.tag(),
            rows.len(),
            chunks.len()
        );

        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut tasks = JoinSet::new();
        for (chunk_index, chunk) in chunks.iter().enumerate() {
            let handle = handle.clone();
            let batch = batch.clone();
            let chunk = chunk.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let output = tokio::task::spawn_blocking(move || run_chunk(&handle, &batch, &chunk))
                    .await
                    .unwrap_or_else(|e| Err(Error::Inference(format!("chunk task failed: {}", e))));
                (chunk_index, output)
            });
        }

        let mut outputs: Vec<Option<Result<Array3<f32>>>> = chunks.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((chunk_index, output)) => outputs[chunk_index] = Some(output),
                Err(e) => warn!("Inference chunk aborted: {}", e),
            }
        }

        let tag = handle.tag();
        let mut run = ModelRun {
            model: tag.clone(),
            forecasts: vec![None; batch.len()],
            errors: BTreeMap::new(),
        };

        for (chunk, output) in chunks.iter().zip(outputs) {
            let output = match output {
                Some(Ok(output)) => output,
                Some(Err(e)) => {
                    warn!("{}: chunk of {} sites failed: {}", tag, chunk.len(), e);
                    for row in chunk {
                        run.errors.insert(*row, e.to_string());
                    }
                    continue;
                }
                None => {
                    for row in chunk {
                        run.errors.insert(*row, "inference chunk aborted".into());
                    }
                    continue;
                }
            };

            for (r, row) in chunk.iter().enumerate() {
                let site_output = output.index_axis(Axis(0), r);
                match self.to_site_forecast(&tag, &handle.schema.outputs, batch, *row, site_output)
                {
                    Ok(forecast) => run.forecasts[*row] = Some(forecast),
                    Err(e) => {
                        warn!("{}", e);
                        run.errors.insert(*row, e.to_string());
                    }
                }
            }
        }

        info!(
            "{}: {} sites forecast, {} failed",
            tag,
            run.succeeded(),
            run.errors.len()
        );
        run
    }

    /// Validate one site's normalised output and convert it to MW: clip at
    /// zero, scale by capacity, apply the sundown mask.
    fn to_site_forecast(
        &self,
        tag: &ModelTag,
        outputs: &OutputSchema,
        batch: &ModelBatch,
        row: usize,
        site_output: ndarray::ArrayView2<f32>,
    ) -> Result<SiteForecast> {
        let site = &batch.sites[row];
        if site_output.iter().any(|v| !v.is_finite()) {
            return Err(Error::Inference(format!(
                "{} produced non-finite output for site {}",
                tag, site.id
            )));
        }

        let point_column = outputs.point_column();
        let to_mw = |normalised: f32, sun_down: bool| -> f64 {
            if sun_down {
                0.0
            } else {
                normalised.max(0.0) as f64 * site.capacity_mw
            }
        };

        let points = site_output
            .outer_iter()
            .enumerate()
            .map(|(h, columns): (usize, ArrayView1<f32>)| {
                let valid_time = batch.horizons.valid_time(batch.init_time, h);
                let sun_down = self
                    .min_sun_elevation_deg
                    .map_or(false, |min| site.solar_elevation_deg(valid_time) < min);
                let quantiles = outputs.quantiles.as_ref().map(|levels| {
                    levels
                        .iter()
                        .zip(columns.iter())
                        .map(|(level, v)| (*level, to_mw(*v, sun_down)))
                        .collect::<Quantiles>()
                });
                ForecastPoint {
                    value: to_mw(columns[point_column], sun_down),
                    quantiles,
                }
            })
            .collect();

        SiteForecast::new(site.id, batch.init_time, tag.clone(), points)
    }
}

fn run_chunk(handle: &ModelHandle, batch: &ModelBatch, rows: &[usize]) -> Result<Array3<f32>> {
    let input = ModelInput::gather(batch, rows, &handle.schema)?;
    let output = handle.forward(&input)?;
    let expected = (
        rows.len(),
        handle.schema.outputs.horizons,
        handle.schema.outputs.output_width(),
    );
    if output.dim() != expected {
        return Err(Error::Inference(format!(
            "output shape {:?}, expected {:?}",
            output.dim(),
            expected
        )));
    }
    debug!("{}: chunk of {} sites done", handle.key, rows.len());
    Ok(output)
}
