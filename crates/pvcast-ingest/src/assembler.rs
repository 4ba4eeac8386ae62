//! Input assembly: fetch every NWP source concurrently, drop stale or
//! malformed data per site, and decide which models can run where.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Duration;
use ndarray::{Array2, Axis};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use pvcast_core::{Error, HorizonSpec, InitTime, Result, Site, SiteCoords, SiteStatus};

use crate::batch::{HistoryBatch, InputSchema, ModelBatch, NwpBatch};
use crate::source::{GenerationSource, NwpFetch, NwpSource};

struct RegisteredSource {
    source: Arc<dyn NwpSource>,
    tolerance: Duration,
}

/// A model the batch is being assembled for.
#[derive(Debug, Clone)]
pub struct TargetModel {
    pub name: String,
    pub schema: InputSchema,
}

/// Result of assembling inputs for one run.
#[derive(Debug)]
pub struct Assembly {
    pub batch: ModelBatch,
    /// `Ok` or `SkippedMissingInput`, aligned with `batch.sites`.
    pub site_status: Vec<SiteStatus>,
    /// Model name → per-site flag: the model's schema is satisfied there.
    pub eligible: BTreeMap<String, Vec<bool>>,
    /// Sources with no usable data at all, with the reason.
    pub unavailable_sources: BTreeMap<String, String>,
}

/// Gathers NWP covariates, site metadata and optional history into a batch.
pub struct InputAssembler {
    sources: Vec<RegisteredSource>,
    generation: Option<(Arc<dyn GenerationSource>, Duration)>,
    max_workers: usize,
}

impl InputAssembler {
    pub fn new(max_workers: usize) -> Self {
        Self {
            sources: Vec::new(),
            generation: None,
            max_workers: max_workers.clamp(1, Semaphore::MAX_PERMITS),
        }
    }

    /// Register an NWP source with its staleness tolerance. Negative
    /// tolerances count as zero; out-of-range ones never go stale.
    pub fn with_source(mut self, source: Arc<dyn NwpSource>, tolerance_minutes: i64) -> Self {
        let tolerance = Duration::try_minutes(tolerance_minutes.max(0)).unwrap_or(Duration::MAX);
        self.sources.push(RegisteredSource { source, tolerance });
        self
    }

    /// Enable history features over `window`.
    pub fn with_generation(mut self, source: Arc<dyn GenerationSource>, window: Duration) -> Self {
        self.generation = Some((source, window));
        self
    }

    pub async fn assemble(
        &self,
        sites: &[Site],
        init_time: InitTime,
        horizons: HorizonSpec,
        targets: &[TargetModel],
    ) -> Assembly {
        let coords: Arc<Vec<SiteCoords>> = Arc::new(sites.iter().map(Site::coords).collect());
        let mut unavailable_sources = BTreeMap::new();
        let mut nwp = BTreeMap::new();

        for (source_id, fetched) in self.fetch_all(coords, init_time, horizons).await {
            let tolerance = self
                .sources
                .iter()
                .find(|r| r.source.id() == source_id)
                .map(|r| r.tolerance)
                .unwrap_or_else(Duration::zero);
            let batch = fetched.and_then(|fetch| {
                to_nwp_batch(&source_id, fetch, sites.len(), init_time, horizons, tolerance)
            });
            match batch {
                Ok(batch) => {
                    info!(
                        "Source {}: {}/{} sites usable, data age {} min",
                        source_id,
                        batch.available_count(),
                        sites.len(),
                        batch.data_age.num_minutes()
                    );
                    nwp.insert(source_id, batch);
                }
                Err(e) => {
                    warn!("Source {} unavailable: {}", source_id, e);
                    unavailable_sources.insert(source_id, e.to_string());
                }
            }
        }

        let history = match &self.generation {
            Some((source, window)) => {
                self.fetch_history(source.clone(), *window, sites, init_time, horizons)
                    .await
            }
            None => None,
        };

        let batch = ModelBatch {
            init_time,
            horizons,
            sites: sites.to_vec(),
            nwp,
            history,
        };

        let mut eligible = BTreeMap::new();
        for target in targets {
            let flags: Vec<bool> = (0..batch.len())
                .map(|i| target.schema.is_satisfied_by(|s| batch.source_available(s, i)))
                .collect();
            eligible.insert(target.name.clone(), flags);
        }

        let site_status: Vec<SiteStatus> = (0..batch.len())
            .map(|i| {
                if eligible.values().any(|flags| flags[i]) {
                    SiteStatus::Ok
                } else {
                    SiteStatus::SkippedMissingInput
                }
            })
            .collect();

        let skipped = site_status.iter().filter(|s| !s.is_ok()).count();
        if skipped > 0 {
            warn!("{} of {} sites lack sufficient input for any model", skipped, batch.len());
        }

        Assembly {
            batch,
            site_status,
            eligible,
            unavailable_sources,
        }
    }

    /// Fetch all sources, at most `max_workers` at a time. Results come back
    /// in registration order.
    async fn fetch_all(
        &self,
        coords: Arc<Vec<SiteCoords>>,
        init_time: InitTime,
        horizons: HorizonSpec,
    ) -> Vec<(String, Result<NwpFetch>)> {
        let semaphore = Arc::new(Semaphore::new(self.max_workers));
        let mut tasks = JoinSet::new();

        for (index, registered) in self.sources.iter().enumerate() {
            let source = registered.source.clone();
            let coords = coords.clone();
            let semaphore = semaphore.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await;
                let fetched = tokio::task::spawn_blocking(move || {
                    source.fetch(&coords, init_time, horizons)
                })
                .await
                .unwrap_or_else(|e| Err(Error::Internal(format!("fetch task failed: {}", e))));
                (index, fetched)
            });
        }

        let mut results: Vec<Option<Result<NwpFetch>>> =
            (0..self.sources.len()).map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, fetched)) => results[index] = Some(fetched),
                Err(e) => warn!("Source fetch task aborted: {}", e),
            }
        }

        self.sources
            .iter()
            .zip(results)
            .map(|(registered, fetched)| {
                let fetched = fetched.unwrap_or_else(|| {
                    Err(Error::InputUnavailable("fetch task did not complete".into()))
                });
                (registered.source.id().to_string(), fetched)
            })
            .collect()
    }

    async fn fetch_history(
        &self,
        source: Arc<dyn GenerationSource>,
        window: Duration,
        sites: &[Site],
        init_time: InitTime,
        horizons: HorizonSpec,
    ) -> Option<HistoryBatch> {
        let sites = sites.to_vec();
        let joined = tokio::task::spawn_blocking(move || {
            build_history(source.as_ref(), &sites, init_time, horizons, window)
        })
        .await;
        match joined {
            Ok(history) => Some(history),
            Err(e) => {
                warn!("Generation history unavailable: {}", e);
                None
            }
        }
    }
}

/// Validate one source's fetch and turn it into per-variable tensors.
fn to_nwp_batch(
    source_id: &str,
    fetch: NwpFetch,
    n_sites: usize,
    init_time: InitTime,
    horizons: HorizonSpec,
    tolerance: Duration,
) -> Result<NwpBatch> {
    let expected = (n_sites, horizons.count, fetch.variables.len());
    if fetch.values.dim() != expected || fetch.issued_at.len() != n_sites {
        return Err(Error::InputUnavailable(format!(
            "{} returned shape {:?}, expected {:?}",
            source_id,
            fetch.values.dim(),
            expected
        )));
    }

    let t0 = init_time.timestamp();
    let mut available = vec![false; n_sites];
    let mut data_age = Duration::zero();
    let mut stale = 0;

    for (i, issued) in fetch.issued_at.iter().enumerate() {
        let Some(issued) = issued else { continue };
        let age = t0 - *issued;
        if age > tolerance {
            stale += 1;
            continue;
        }
        let row = fetch.values.index_axis(Axis(0), i);
        if row.iter().all(|v| v.is_finite()) {
            available[i] = true;
            data_age = data_age.max(age);
        }
    }

    if stale > 0 {
        warn!(
            "Source {}: {} sites older than tolerance of {} min",
            source_id,
            stale,
            tolerance.num_minutes()
        );
    }
    if !available.iter().any(|a| *a) {
        return Err(Error::InputUnavailable(format!(
            "{} has no site within tolerance",
            source_id
        )));
    }

    let mut variables = BTreeMap::new();
    for (v, name) in fetch.variables.iter().enumerate() {
        let mut tensor: Array2<f32> = fetch.values.index_axis(Axis(2), v).to_owned();
        for (i, ok) in available.iter().enumerate() {
            if !ok {
                tensor.row_mut(i).fill(0.0);
            }
        }
        variables.insert(name.clone(), tensor);
    }

    Ok(NwpBatch {
        source_id: source_id.to_string(),
        variables,
        available,
        data_age,
    })
}

/// One column per step ending at the init time, normalised by capacity.
fn build_history(
    source: &dyn GenerationSource,
    sites: &[Site],
    init_time: InitTime,
    horizons: HorizonSpec,
    window: Duration,
) -> HistoryBatch {
    let step = Duration::minutes(horizons.step_minutes as i64);
    let steps = (window.num_minutes() / step.num_minutes()).max(1) as usize;
    let end = init_time.timestamp();
    let mut values = Array2::zeros((sites.len(), steps));
    let mut observed = Array2::from_elem((sites.len(), steps), false);

    for (i, site) in sites.iter().enumerate() {
        let readings = match source.get_recent_generation(site, end, window) {
            Ok(r) => r,
            Err(e) => {
                debug!("No generation history for site {}: {}", site.id, e);
                continue;
            }
        };
        for reading in readings {
            let offset = end - reading.time;
            if offset < Duration::zero() || offset.num_minutes() % step.num_minutes() != 0 {
                continue;
            }
            let back = (offset.num_minutes() / step.num_minutes()) as usize;
            if back >= steps || !reading.mw.is_finite() || site.capacity_mw <= 0.0 {
                continue;
            }
            values[[i, steps - 1 - back]] = (reading.mw / site.capacity_mw) as f32;
            observed[[i, steps - 1 - back]] = true;
        }
    }

    let available = observed.rows().into_iter().map(|r| r.iter().any(|o| *o)).collect();
    HistoryBatch {
        values,
        observed,
        available,
    }
}
