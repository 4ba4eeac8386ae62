//! Full pipeline over file-backed NWP sources, a model cache and SQLite.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use tempfile::TempDir;

use pvcast_core::{InitTime, ModelKey, PvcastConfig, Site, SiteStatus};
use pvcast_infer::model_dir;
use pvcast_ingest::JsonNwpSource;
use pvcast_runtime::{RunOrchestrator, RunRequest, RunState};
use pvcast_store::SqliteStore;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 21, 10, 0, 0).unwrap()
}

fn sites() -> Vec<Site> {
    [(1, 50.9, -1.4), (2, 52.2, 0.1), (3, 53.4, -2.2)]
        .into_iter()
        .map(|(id, latitude, longitude)| Site {
            id,
            latitude,
            longitude,
            capacity_mw: 2.0 * id as f64,
            tilt_deg: 35.0,
            orientation_deg: 180.0,
        })
        .collect()
}

/// Write `<dir>/<source>.json` covering sites 1-3; `stale_site` gets data
/// issued a day before the init time.
fn write_source(dir: &Path, source: &str, variable: &str, stale_site: Option<u32>) {
    let mut entries = serde_json::Map::new();
    for id in 1..=3u32 {
        let issued = if Some(id) == stale_site {
            t0() - Duration::hours(24)
        } else {
            t0() - Duration::hours(3)
        };
        let values: Vec<Vec<f32>> = (0..6).map(|h| vec![100.0 * id as f32 + 10.0 * h as f32]).collect();
        entries.insert(
            id.to_string(),
            serde_json::json!({"issued_at": issued, "values": values}),
        );
    }
    let file = serde_json::json!({"variables": [variable], "sites": entries});
    std::fs::write(dir.join(format!("{}.json", source)), file.to_string()).unwrap();
}

fn write_model(cache: &Path) {
    let dir = model_dir(cache, &ModelKey::new("ocf/pvnet_uk", "v3"));
    std::fs::create_dir_all(&dir).unwrap();
    let artifact = serde_json::json!({
        "kind": "linear",
        "schema": {
            "inputs": {"sources": ["ukv", "ecmwf"], "required_sources": ["ukv"]},
            "outputs": {"horizons": 6, "quantiles": [10, 50, 90]}
        },
        "intercept": 0.05,
        "coefficients": {
            "ukv": {"dswrf": 0.0008},
            "ecmwf": {"ssrd": 0.0004}
        },
        "quantile_offsets": [-0.03, 0.0, 0.03]
    });
    std::fs::write(dir.join("model.json"), artifact.to_string()).unwrap();
}

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        let nwp = dir.path().join("nwp");
        std::fs::create_dir_all(&nwp).unwrap();
        write_source(&nwp, "ukv", "dswrf", None);
        write_source(&nwp, "ecmwf", "ssrd", Some(2));
        write_model(&dir.path().join("models"));
        Self { dir }
    }

    fn config(&self, required: &[&str]) -> PvcastConfig {
        let json = serde_json::json!({
            "db_path": self.dir.path().join("forecasts.db"),
            "model_cache_dir": self.dir.path().join("models"),
            "nwp_dir": self.dir.path().join("nwp"),
            "run": {"max_batch_size": 2, "max_workers": 2},
            "sources": [
                {"id": "ukv", "staleness_tolerance_minutes": 360},
                {"id": "ecmwf", "staleness_tolerance_minutes": 720}
            ],
            "models": [{
                "name": "pvnet",
                "id": "ocf/pvnet_uk",
                "version": "v3",
                "required_sources": required
            }]
        });
        PvcastConfig::from_json(&json.to_string()).unwrap()
    }

    fn orchestrator(&self, config: PvcastConfig, store: Arc<SqliteStore>) -> RunOrchestrator {
        let nwp = self.dir.path().join("nwp");
        RunOrchestrator::from_config(config, sites(), store)
            .with_source(Arc::new(JsonNwpSource::new("ukv", &nwp)))
            .with_source(Arc::new(JsonNwpSource::new("ecmwf", &nwp)))
    }
}

fn request() -> RunRequest {
    RunRequest {
        init_time: Some(t0()),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_stale_source_skips_site_when_required() {
    let fixture = Fixture::new();
    let config = fixture.config(&["ukv", "ecmwf"]);
    let store = Arc::new(SqliteStore::open(&config.db_path).unwrap());

    let report = fixture.orchestrator(config, store.clone()).run(request()).await;

    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.outcome(1).unwrap().status, SiteStatus::Ok);
    assert_eq!(report.outcome(2).unwrap().status, SiteStatus::SkippedMissingInput);
    assert_eq!(report.outcome(3).unwrap().status, SiteStatus::Ok);
    assert_eq!(report.counts.ok, 2);
    assert_eq!(report.counts.skipped_missing_input, 1);

    let init_time = InitTime::floored(t0(), 30).unwrap();
    let model_set = report.outcome(1).unwrap().model_set.clone().unwrap();
    assert!(store.model_sets(2, init_time).unwrap().is_empty());
    let rows = store.get_forecast(1, &model_set, init_time).unwrap();
    assert_eq!(rows.len(), 6);
    assert_eq!(rows[0].valid_time, t0() + Duration::minutes(30));
    assert!(rows.iter().all(|r| r.value.is_some() && r.quantiles.is_some()));

    // sites 1 and 3 plus the national aggregate
    assert_eq!(store.count_rows().unwrap(), 18);
}

#[tokio::test]
async fn test_stale_source_tolerated_when_optional() {
    let fixture = Fixture::new();
    let config = fixture.config(&["ukv"]);
    let store = Arc::new(SqliteStore::open(&config.db_path).unwrap());

    let report = fixture.orchestrator(config, store.clone()).run(request()).await;

    assert_eq!(report.state, RunState::Completed);
    assert_eq!(report.counts.ok, 3);
    assert_eq!(report.national, Some(SiteStatus::Ok));

    // Site 2 runs on ukv alone, so it gets no ecmwf contribution.
    let init_time = InitTime::floored(t0(), 30).unwrap();
    let model_set = report.outcome(2).unwrap().model_set.clone().unwrap();
    let site2 = store.get_forecast(2, &model_set, init_time).unwrap();
    let expected = (0.05 + 0.0008 * 200.0) * 4.0;
    assert!((site2[0].value.unwrap() - expected).abs() < 1e-4);
}

#[tokio::test]
async fn test_rerun_is_idempotent() {
    let fixture = Fixture::new();
    let config = fixture.config(&["ukv"]);
    let store = Arc::new(SqliteStore::open(&config.db_path).unwrap());
    let orchestrator = fixture.orchestrator(config, store.clone());

    let first = orchestrator.run(request()).await;
    let rows_after_first = store.count_rows().unwrap();
    let init_time = InitTime::floored(t0(), 30).unwrap();
    let model_set = first.outcome(3).unwrap().model_set.clone().unwrap();
    let before = store.get_forecast(3, &model_set, init_time).unwrap();

    let second = orchestrator.run(request()).await;
    assert_eq!(second.state, RunState::Completed);
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(store.count_rows().unwrap(), rows_after_first);
    assert_eq!(store.get_forecast(3, &model_set, init_time).unwrap(), before);
    // the model was loaded once and reused
    assert_eq!(orchestrator.registry().load_count(), 1);
}
