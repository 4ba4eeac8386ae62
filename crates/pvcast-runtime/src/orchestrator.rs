//! Run orchestrator: drives one forecast run through its stages.
//!
//! Stages run one after another; concurrency lives inside assembly and
//! inference. Per-site problems become site outcomes. Only configuration
//! errors, an empty site selection, no resolvable model, or the hard timeout
//! fail the run, and every run ends with a report.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::time::timeout_at;
use tracing::{error, info, warn};
use uuid::Uuid;

use pvcast_core::config::DEFAULT_STALENESS_TOLERANCE_MINUTES;
use pvcast_core::{
    validate_sites, Error, HorizonSpec, InitTime, PvcastConfig, ReconciledForecast, Result, Site,
    SiteForecast, SiteId, SiteStatus, StatusCounts,
};
use pvcast_infer::{DirectoryHub, InferenceRunner, ModelHandle, ModelRegistry, ModelRun};
use pvcast_ingest::{Assembly, GenerationSource, InputAssembler, ModelBatch, NwpSource, TargetModel};
use pvcast_reconcile::{national_sum, EnsembleReconciler};
use pvcast_store::{ForecastStore, ForecastWriter};

use crate::types::*;

/// History window when models use recent generation and none is configured.
const DEFAULT_HISTORY_WINDOW_MINUTES: u32 = 60;

/// Coordinates registry, assembler, runner, reconciler and writer for runs
/// over a fixed fleet.
pub struct RunOrchestrator {
    config: PvcastConfig,
    sites: Vec<Site>,
    registry: Arc<ModelRegistry>,
    assembler: InputAssembler,
    runner: InferenceRunner,
    reconciler: EnsembleReconciler,
    writer: ForecastWriter,
}

impl RunOrchestrator {
    /// Build the pipeline described by `config`. NWP sources are added with
    /// [`with_source`](Self::with_source).
    pub fn from_config(config: PvcastConfig, sites: Vec<Site>, store: Arc<dyn ForecastStore>) -> Self {
        let mut registry = ModelRegistry::new(&config.model_cache_dir)
            .with_default_model(config.default_model.clone());
        if let Some(hub_dir) = &config.model_hub_dir {
            registry = registry.with_hub(Arc::new(DirectoryHub::new(hub_dir, &config.model_cache_dir)));
        }
        for model in &config.models {
            if let Some(sha256) = &model.sha256 {
                registry = registry.with_checksum(model.key(), sha256.clone());
            }
        }

        Self {
            registry: Arc::new(registry),
            assembler: InputAssembler::new(config.run.max_workers),
            runner: InferenceRunner::from_config(&config.run),
            reconciler: EnsembleReconciler::from_config(&config),
            writer: ForecastWriter::new(store),
            sites,
            config,
        }
    }

    /// Share a registry (and its loaded models) with other orchestrators.
    pub fn with_registry(mut self, registry: Arc<ModelRegistry>) -> Self {
        self.registry = registry;
        self
    }

    /// Register an NWP source; its staleness tolerance comes from the
    /// matching `sources` entry in the configuration.
    pub fn with_source(mut self, source: Arc<dyn NwpSource>) -> Self {
        let tolerance = match self.config.sources.iter().find(|s| s.id == source.id()) {
            Some(s) => s.staleness_tolerance_minutes,
            None => {
                warn!(
                    "Source {} has no configuration, using {} min staleness tolerance",
                    source.id(),
                    DEFAULT_STALENESS_TOLERANCE_MINUTES
                );
                DEFAULT_STALENESS_TOLERANCE_MINUTES
            }
        };
        self.assembler = self.assembler.with_source(source, tolerance);
        self
    }

    pub fn with_generation(mut self, source: Arc<dyn GenerationSource>) -> Self {
        let window = self
            .config
            .run
            .history_window_minutes
            .unwrap_or(DEFAULT_HISTORY_WINDOW_MINUTES);
        self.assembler = self
            .assembler
            .with_generation(source, chrono::Duration::minutes(window as i64));
        self
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    /// Execute one run. Never fails; the outcome is in the report.
    pub async fn run(&self, request: RunRequest) -> RunReport {
        let mut run = RunTracker::new();
        let timeout = Duration::from_secs(self.config.run.hard_timeout_secs);
        info!("Run {} pending", run.report.run_id);

        if let Err(e) = self.config.validate().and_then(|_| validate_sites(&self.sites)) {
            return run.fail(e);
        }
        let Some(deadline) = tokio::time::Instant::now().checked_add(timeout) else {
            return run.fail(Error::Config(format!(
                "hard timeout of {}s is out of range",
                timeout.as_secs()
            )));
        };
        let requested = request.init_time.unwrap_or_else(Utc::now);
        let init_time = match InitTime::floored(requested, self.config.run.step_minutes) {
            Ok(t) => t,
            Err(e) => return run.fail(e),
        };
        run.report.init_time = Some(init_time.timestamp());

        let sites = self.select_sites(request.site_ids.as_deref());
        if sites.is_empty() {
            return run.fail(Error::Config("no sites selected".into()));
        }
        run.report.sites = sites.iter().map(|s| SiteOutcome::new(s.id)).collect();

        run.enter(RunState::Assembling);
        let (handles, assembly) = match timeout_at(deadline, self.assemble(&sites, init_time)).await {
            Ok(Ok(prepared)) => prepared,
            Ok(Err(e)) => return run.fail(e),
            Err(_) => return run.time_out(timeout),
        };
        run.report.models = handles.iter().map(|h| h.tag().to_string()).collect();

        let Assembly {
            batch,
            site_status,
            eligible,
            unavailable_sources,
        } = assembly;
        run.report.unavailable_sources = unavailable_sources;
        for (i, status) in site_status.iter().enumerate() {
            if *status == SiteStatus::SkippedMissingInput {
                let available = batch.available_sources(i);
                run.settle(
                    i,
                    *status,
                    Some(format!("no model has its inputs; available sources {:?}", available)),
                );
            }
        }

        run.enter(RunState::Inferring);
        let batch = Arc::new(batch);
        let runs = match timeout_at(deadline, self.infer(&handles, &batch, &eligible)).await {
            Ok(runs) => runs,
            Err(_) => return run.time_out(timeout),
        };

        run.enter(RunState::Reconciling);
        let (rows, forecasts) = self.reconcile(&mut run, &batch, &site_status, &runs);

        if request.dry_run {
            run.keep_unwritten(rows, forecasts);
            return run.finish(RunState::Completed);
        }

        run.enter(RunState::Writing);
        if self.write(&mut run, rows, forecasts, deadline).await {
            return run.time_out(timeout);
        }
        run.finish(RunState::Completed)
    }

    fn select_sites(&self, ids: Option<&[SiteId]>) -> Vec<Site> {
        let Some(ids) = ids else {
            return self.sites.clone();
        };
        for id in ids {
            if !self.sites.iter().any(|s| s.id == *id) {
                warn!("Site {} is not in the fleet, ignored", id);
            }
        }
        self.sites
            .iter()
            .filter(|s| ids.contains(&s.id))
            .cloned()
            .collect()
    }

    /// Resolve the active models, then assemble inputs against their schemas.
    async fn assemble(
        &self,
        sites: &[Site],
        init_time: InitTime,
    ) -> Result<(Vec<ModelHandle>, Assembly)> {
        let models = self.config.active_models();
        if models.is_empty() {
            return Err(Error::Config(
                "no active models; every model is extra and run_extra_models is off".into(),
            ));
        }

        let mut handles = Vec::with_capacity(models.len());
        for model in models {
            match self.registry.resolve(&model.name, &model.key()).await {
                Ok(handle) => handles.push(match &model.required_sources {
                    Some(required) => handle.with_required_sources(required.clone()),
                    None => handle,
                }),
                Err(e) => warn!("Model {} skipped: {}", model.name, e),
            }
        }
        if handles.is_empty() {
            return Err(Error::ModelUnavailable(
                "none of the configured models could be resolved".into(),
            ));
        }

        let count = handles
            .iter()
            .map(|h| h.schema.outputs.horizons)
            .max()
            .unwrap_or(0);
        let horizons = HorizonSpec::new(self.config.run.step_minutes, count);
        let targets: Vec<TargetModel> = handles
            .iter()
            .map(|h| TargetModel {
                name: h.name.clone(),
                schema: h.schema.inputs.clone(),
            })
            .collect();

        let assembly = self
            .assembler
            .assemble(sites, init_time, horizons, &targets)
            .await;
        Ok((handles, assembly))
    }

    async fn infer(
        &self,
        handles: &[ModelHandle],
        batch: &Arc<ModelBatch>,
        eligible: &BTreeMap<String, Vec<bool>>,
    ) -> Vec<ModelRun> {
        let mut runs = Vec::with_capacity(handles.len());
        for handle in handles {
            let flags = eligible.get(&handle.name).cloned().unwrap_or_default();
            runs.push(self.runner.run(handle, batch, &flags).await);
        }
        runs
    }

    /// Merge model outputs per site. Returns the batch row of each forecast
    /// (`None` for the national aggregate) alongside the forecasts.
    fn reconcile(
        &self,
        run: &mut RunTracker,
        batch: &ModelBatch,
        site_status: &[SiteStatus],
        runs: &[ModelRun],
    ) -> (Vec<Option<usize>>, Vec<ReconciledForecast>) {
        let mut rows = Vec::new();
        let mut forecasts = Vec::new();

        for (i, site) in batch.sites.iter().enumerate() {
            if site_status[i] != SiteStatus::Ok {
                continue;
            }
            let site_forecasts: Vec<SiteForecast> =
                runs.iter().filter_map(|r| r.forecasts[i].clone()).collect();
            if site_forecasts.is_empty() {
                let reasons: Vec<String> = runs
                    .iter()
                    .filter_map(|r| r.errors.get(&i).map(|e| format!("{}: {}", r.model.name, e)))
                    .collect();
                run.settle(i, SiteStatus::ModelError, Some(reasons.join("; ")));
                continue;
            }

            let reconciled =
                self.reconciler
                    .reconcile(site.id, batch.init_time, batch.horizons, &site_forecasts);
            if !reconciled.has_any_value() {
                run.settle(
                    i,
                    SiteStatus::ModelError,
                    Some("no model produced a value".into()),
                );
                continue;
            }

            let missing = reconciled.missing_horizons();
            if !missing.is_empty() {
                warn!("Site {}: no value for horizons {:?}", site.id, missing);
            }
            let outcome = &mut run.report.sites[i];
            outcome.model_set = Some(reconciled.model_set.clone());
            outcome.models = reconciled
                .contributing_models
                .iter()
                .map(|m| m.to_string())
                .collect();
            outcome.missing_horizons = missing;

            rows.push(Some(i));
            forecasts.push(reconciled);
        }

        if self.config.national.enabled {
            if let Some(national) = national_sum(batch.init_time, batch.horizons, &forecasts) {
                rows.push(None);
                forecasts.push(national);
            }
        }
        info!("Reconciled {} forecasts", forecasts.len());
        (rows, forecasts)
    }

    /// Write on the blocking pool. Returns true when the deadline passed
    /// before every forecast was written.
    async fn write(
        &self,
        run: &mut RunTracker,
        rows: Vec<Option<usize>>,
        forecasts: Vec<ReconciledForecast>,
        deadline: tokio::time::Instant,
    ) -> bool {
        let cancel = Arc::new(AtomicBool::new(false));
        let writer = self.writer.clone();
        let flag = cancel.clone();
        let mut task = tokio::task::spawn_blocking(move || writer.write(&forecasts, &flag));

        let mut timed_out = false;
        let joined = tokio::select! {
            joined = &mut task => joined,
            _ = tokio::time::sleep_until(deadline) => {
                warn!("Hard timeout while writing, cancelling remaining sites");
                cancel.store(true, Ordering::SeqCst);
                timed_out = true;
                task.await
            }
        };

        let statuses = match joined {
            Ok(statuses) => statuses,
            Err(e) => {
                error!("Writer task failed: {}", e);
                vec![SiteStatus::WriteError; rows.len()]
            }
        };
        for (row, status) in rows.iter().zip(statuses) {
            match row {
                Some(i) => {
                    let detail = (status == SiteStatus::WriteError)
                        .then(|| "forecast store rejected the write".to_string());
                    run.settle(*i, status, detail);
                }
                None => run.report.national = Some(status),
            }
        }
        timed_out
    }
}

/// Accumulates the report while a run progresses.
struct RunTracker {
    started: Instant,
    report: RunReport,
}

impl RunTracker {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            report: RunReport {
                run_id: Uuid::new_v4().to_string(),
                init_time: None,
                state: RunState::Pending,
                failure: None,
                states: vec![RunState::Pending],
                models: Vec::new(),
                unavailable_sources: BTreeMap::new(),
                sites: Vec::new(),
                counts: StatusCounts::default(),
                national: None,
                dry_run: false,
                forecasts: Vec::new(),
                duration_ms: 0,
            },
        }
    }

    fn enter(&mut self, state: RunState) {
        info!("Run {}: {:?}", self.report.run_id, state);
        self.report.state = state;
        self.report.states.push(state);
    }

    fn settle(&mut self, index: usize, status: SiteStatus, detail: Option<String>) {
        let outcome = &mut self.report.sites[index];
        outcome.status = status;
        if detail.is_some() {
            outcome.detail = detail;
        }
    }

    /// Dry run: reconciled sites count as ok and the forecasts go into the
    /// report instead of the store.
    fn keep_unwritten(&mut self, rows: Vec<Option<usize>>, forecasts: Vec<ReconciledForecast>) {
        info!(
            "Run {}: dry run, {} forecasts not written",
            self.report.run_id,
            forecasts.len()
        );
        for row in rows {
            match row {
                Some(i) => self.settle(i, SiteStatus::Ok, None),
                None => self.report.national = Some(SiteStatus::Ok),
            }
        }
        self.report.dry_run = true;
        self.report.forecasts = forecasts;
    }

    fn fail(mut self, reason: impl std::fmt::Display) -> RunReport {
        error!("Run {} failed: {}", self.report.run_id, reason);
        self.report.failure = Some(reason.to_string());
        self.finish(RunState::Failed)
    }

    /// Sites not settled yet keep their initial `Aborted` status.
    fn time_out(self, timeout: Duration) -> RunReport {
        self.fail(format!("hard timeout of {}s exceeded", timeout.as_secs()))
    }

    fn finish(mut self, state: RunState) -> RunReport {
        self.enter(state);
        self.report.counts = StatusCounts::tally(self.report.sites.iter().map(|s| &s.status));
        self.report.duration_ms = self.started.elapsed().as_millis() as u64;
        let c = &self.report.counts;
        info!(
            "Run {} {:?} in {}ms: ok={}, skipped={}, model_error={}, write_error={}, aborted={}",
            self.report.run_id,
            state,
            self.report.duration_ms,
            c.ok,
            c.skipped_missing_input,
            c.model_error,
            c.write_error,
            c.aborted
        );
        self.report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    use chrono::{DateTime, TimeZone};
    use ndarray::Array3;
    use parking_lot::Mutex;
    use pvcast_core::{ModelKey, SiteCoords};
    use pvcast_infer::model_dir;
    use pvcast_ingest::NwpFetch;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 21, 11, 10, 0).unwrap()
    }

    fn sites() -> Vec<Site> {
        (1..=2)
            .map(|id| Site {
                id,
                latitude: 51.0 + id as f64 * 0.2,
                longitude: -1.5,
                capacity_mw: 5.0,
                tilt_deg: 30.0,
                orientation_deg: 180.0,
            })
            .collect()
    }

    fn write_model(cache: &Path, key: &ModelKey, variable: &str) {
        let dir = model_dir(cache, key);
        std::fs::create_dir_all(&dir).unwrap();
        let artifact = serde_json::json!({
            "kind": "linear",
            "schema": {
                "inputs": {"sources": ["ukv"], "required_sources": ["ukv"]},
                "outputs": {"horizons": 4, "quantiles": [10, 50, 90]}
            },
            "intercept": 0.1,
            "coefficients": {"ukv": {variable: 0.001}},
            "quantile_offsets": [-0.05, 0.0, 0.05]
        });
        std::fs::write(dir.join("model.json"), artifact.to_string()).unwrap();
    }

    fn config(cache: &Path, extra: serde_json::Value) -> PvcastConfig {
        let mut base = serde_json::json!({
            "model_cache_dir": cache,
            "run": {"max_batch_size": 1, "max_workers": 2},
            "sources": [{"id": "ukv", "staleness_tolerance_minutes": 180}],
            "models": [{"name": "pvnet", "id": "ocf/pvnet", "version": "v1"}]
        });
        if let (Some(base), Some(extra)) = (base.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
        PvcastConfig::from_json(&base.to_string()).unwrap()
    }

    struct FakeSource {
        delay: Duration,
    }

    impl NwpSource for FakeSource {
        fn id(&self) -> &str {
            "ukv"
        }

        fn fetch(
            &self,
            sites: &[SiteCoords],
            init_time: InitTime,
            horizons: HorizonSpec,
        ) -> Result<NwpFetch> {
            std::thread::sleep(self.delay);
            Ok(NwpFetch {
                variables: vec!["dswrf".into()],
                values: Array3::from_elem((sites.len(), horizons.count, 1), 400.0),
                issued_at: vec![Some(init_time.timestamp() - chrono::Duration::hours(2)); sites.len()],
            })
        }
    }

    #[derive(Default)]
    struct MemoryStore {
        written: Mutex<Vec<ReconciledForecast>>,
    }

    impl ForecastStore for MemoryStore {
        fn upsert_site(&self, forecast: &ReconciledForecast) -> Result<usize> {
            self.written.lock().push(forecast.clone());
            Ok(forecast.points.len())
        }
    }

    fn orchestrator(config: PvcastConfig, store: Arc<MemoryStore>) -> RunOrchestrator {
        RunOrchestrator::from_config(config, sites(), store).with_source(Arc::new(FakeSource {
            delay: Duration::ZERO,
        }))
    }

    fn request() -> RunRequest {
        RunRequest {
            init_time: Some(t0()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_run_completes_with_national_aggregate() {
        let cache = tempfile::tempdir().unwrap();
        write_model(cache.path(), &ModelKey::new("ocf/pvnet", "v1"), "dswrf");
        let store = Arc::new(MemoryStore::default());

        let report = orchestrator(config(cache.path(), serde_json::json!({})), store.clone())
            .run(request())
            .await;

        assert_eq!(report.state, RunState::Completed);
        assert_eq!(
            report.states,
            vec![
                RunState::Pending,
                RunState::Assembling,
                RunState::Inferring,
                RunState::Reconciling,
                RunState::Writing,
                RunState::Completed
            ]
        );
        assert_eq!(report.exit_code(), 0);
        assert_eq!(report.counts.ok, 2);
        assert_eq!(report.national, Some(SiteStatus::Ok));
        assert_eq!(
            report.init_time,
            Some(Utc.with_ymd_and_hms(2024, 6, 21, 11, 0, 0).unwrap())
        );

        let written = store.written.lock();
        assert_eq!(written.len(), 3);
        let national = written.iter().find(|f| f.site_id == 0).unwrap();
        let site_sum: f64 = written
            .iter()
            .filter(|f| f.site_id != 0)
            .map(|f| f.value(0).unwrap())
            .sum();
        assert_eq!(national.value(0), Some(site_sum));
        assert_eq!(written[0].points.len(), 4);
    }

    #[tokio::test]
    async fn test_site_selection() {
        let cache = tempfile::tempdir().unwrap();
        write_model(cache.path(), &ModelKey::new("ocf/pvnet", "v1"), "dswrf");
        let store = Arc::new(MemoryStore::default());
        let orchestrator = orchestrator(
            config(cache.path(), serde_json::json!({"national": {"enabled": false}})),
            store.clone(),
        );

        let report = orchestrator
            .run(RunRequest {
                init_time: Some(t0()),
                site_ids: Some(vec![2]),
                ..Default::default()
            })
            .await;
        assert_eq!(report.sites.len(), 1);
        assert_eq!(report.outcome(2).unwrap().status, SiteStatus::Ok);
        assert!(report.national.is_none());

        let report = orchestrator
            .run(RunRequest {
                init_time: Some(t0()),
                site_ids: Some(vec![99]),
                ..Default::default()
            })
            .await;
        assert_eq!(report.state, RunState::Failed);
        assert_eq!(report.states, vec![RunState::Pending, RunState::Failed]);
        assert_eq!(report.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_unresolvable_models_fail_run() {
        let cache = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::default());
        let report = orchestrator(config(cache.path(), serde_json::json!({})), store.clone())
            .run(request())
            .await;

        assert_eq!(report.state, RunState::Failed);
        assert!(report.failure.as_deref().unwrap().contains("resolved"));
        assert!(store.written.lock().is_empty());
    }

    #[tokio::test]
    async fn test_fallback_model_is_reported() {
        let cache = tempfile::tempdir().unwrap();
        write_model(cache.path(), &ModelKey::new("ocf/default", "v0"), "dswrf");
        let store = Arc::new(MemoryStore::default());
        let config = config(
            cache.path(),
            serde_json::json!({"default_model": {"id": "ocf/default", "version": "v0"}}),
        );

        let report = orchestrator(config, store.clone()).run(request()).await;
        assert_eq!(report.state, RunState::Completed);
        let outcome = report.outcome(1).unwrap();
        assert!(outcome.models[0].contains("fallback:ocf/pvnet@v1"));
        assert!(outcome.model_set.as_deref().unwrap().contains("ocf/default@v0"));
    }

    #[tokio::test]
    async fn test_model_errors_do_not_fail_run() {
        let cache = tempfile::tempdir().unwrap();
        // The model reads a variable the source does not provide.
        write_model(cache.path(), &ModelKey::new("ocf/pvnet", "v1"), "t2m");
        let store = Arc::new(MemoryStore::default());

        let report = orchestrator(config(cache.path(), serde_json::json!({})), store.clone())
            .run(request())
            .await;
        assert_eq!(report.state, RunState::Completed);
        assert_eq!(report.counts.model_error, 2);
        assert!(report.outcome(1).unwrap().detail.as_deref().unwrap().contains("t2m"));
        assert!(report.national.is_none());
        assert!(store.written.lock().is_empty());
    }

    #[tokio::test]
    async fn test_extra_models_only_run_when_enabled() {
        let cache = tempfile::tempdir().unwrap();
        write_model(cache.path(), &ModelKey::new("ocf/pvnet", "v1"), "dswrf");
        let store = Arc::new(MemoryStore::default());
        let extra_only = serde_json::json!({
            "models": [{"name": "pvnet", "id": "ocf/pvnet", "version": "v1", "extra": true}]
        });

        let report = orchestrator(config(cache.path(), extra_only.clone()), store.clone())
            .run(request())
            .await;
        assert_eq!(report.state, RunState::Failed);

        let mut enabled = config(cache.path(), extra_only);
        enabled.run_extra_models = true;
        let report = orchestrator(enabled, store).run(request()).await;
        assert_eq!(report.state, RunState::Completed);
    }

    #[tokio::test]
    async fn test_hard_timeout_aborts_sites() {
        let cache = tempfile::tempdir().unwrap();
        write_model(cache.path(), &ModelKey::new("ocf/pvnet", "v1"), "dswrf");
        let store = Arc::new(MemoryStore::default());
        let mut config = config(cache.path(), serde_json::json!({}));
        config.run.hard_timeout_secs = 1;

        let report = RunOrchestrator::from_config(config, sites(), store.clone())
            .with_source(Arc::new(FakeSource {
                delay: Duration::from_millis(1500),
            }))
            .run(request())
            .await;

        assert_eq!(report.state, RunState::Failed);
        assert!(report.failure.as_deref().unwrap().contains("timeout"));
        assert_eq!(report.counts.aborted, 2);
        assert!(store.written.lock().is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_skips_write() {
        let cache = tempfile::tempdir().unwrap();
        write_model(cache.path(), &ModelKey::new("ocf/pvnet", "v1"), "dswrf");
        let store = Arc::new(MemoryStore::default());

        let report = orchestrator(config(cache.path(), serde_json::json!({})), store.clone())
            .run(RunRequest {
                init_time: Some(t0()),
                dry_run: true,
                ..Default::default()
            })
            .await;

        assert_eq!(report.state, RunState::Completed);
        assert!(!report.states.contains(&RunState::Writing));
        assert!(report.dry_run);
        assert_eq!(report.counts.ok, 2);
        assert_eq!(report.national, Some(SiteStatus::Ok));
        assert_eq!(report.forecasts.len(), 3);
        assert_eq!(report.forecasts[2].site_id, 0);
        assert_eq!(report.forecasts[0].points.len(), 4);
        assert!(store.written.lock().is_empty());

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["dryRun"], true);
        assert_eq!(json["forecasts"].as_array().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_out_of_range_limits_fail_run() {
        let cache = tempfile::tempdir().unwrap();
        write_model(cache.path(), &ModelKey::new("ocf/pvnet", "v1"), "dswrf");

        let mut long_timeout = config(cache.path(), serde_json::json!({}));
        long_timeout.run.hard_timeout_secs = u64::MAX;
        let report = orchestrator(long_timeout, Arc::new(MemoryStore::default()))
            .run(request())
            .await;
        assert_eq!(report.state, RunState::Failed);
        assert!(report.failure.as_deref().unwrap().contains("hard_timeout_secs"));

        let huge_tolerance = config(
            cache.path(),
            serde_json::json!({
                "sources": [{"id": "ukv", "staleness_tolerance_minutes": i64::MAX}]
            }),
        );
        let report = orchestrator(huge_tolerance, Arc::new(MemoryStore::default()))
            .run(request())
            .await;
        assert_eq!(report.state, RunState::Failed);
        assert!(report.failure.as_deref().unwrap().contains("staleness"));

        let mut many_workers = config(cache.path(), serde_json::json!({}));
        many_workers.run.max_workers = usize::MAX;
        let report = orchestrator(many_workers, Arc::new(MemoryStore::default()))
            .run(request())
            .await;
        assert_eq!(report.state, RunState::Failed);
        assert!(report.failure.as_deref().unwrap().contains("max_workers"));
    }
}
