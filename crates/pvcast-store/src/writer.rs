//! Forecast writer with per-site failure isolation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{info, warn};

use pvcast_core::{Error, ReconciledForecast, Result, SiteStatus};

use crate::sqlite::SqliteStore;

/// Destination of reconciled forecasts.
pub trait ForecastStore: Send + Sync {
    /// Atomically replace the stored forecast for the forecast's key.
    fn upsert_site(&self, forecast: &ReconciledForecast) -> Result<usize>;
}

impl ForecastStore for SqliteStore {
    fn upsert_site(&self, forecast: &ReconciledForecast) -> Result<usize> {
        self.upsert_forecast(forecast)
    }
}

/// Writes reconciled forecasts site by site.
#[derive(Clone)]
pub struct ForecastWriter {
    store: Arc<dyn ForecastStore>,
}

impl ForecastWriter {
    pub fn new(store: Arc<dyn ForecastStore>) -> Self {
        Self { store }
    }

    /// Write each forecast and return one status per forecast, in order.
    ///
    /// A failing site is reported as `WriteError` and does not stop the
    /// others. `cancel` is checked between sites; once set, the remaining
    /// sites are reported `Aborted` without being touched.
    pub fn write(&self, forecasts: &[ReconciledForecast], cancel: &AtomicBool) -> Vec<SiteStatus> {
        let mut statuses = Vec::with_capacity(forecasts.len());
        let mut rows = 0;

        for forecast in forecasts {
            if cancel.load(Ordering::SeqCst) {
                statuses.push(SiteStatus::Aborted);
                continue;
            }
            match self.store.upsert_site(forecast) {
                Ok(n) => {
                    rows += n;
                    statuses.push(SiteStatus::Ok);
                }
                Err(e) => {
                    let e = match e {
                        Error::Write(_) => e,
                        other => Error::Write(other.to_string()),
                    };
                    warn!("Site {}: {}", forecast.site_id, e);
                    statuses.push(SiteStatus::WriteError);
                }
            }
        }

        let aborted = statuses.iter().filter(|s| **s == SiteStatus::Aborted).count();
        info!(
            "Wrote {} rows for {} forecasts ({} aborted)",
            rows,
            forecasts.len() - aborted,
            aborted
        );
        statuses
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use parking_lot::Mutex;
    use pvcast_core::{HorizonSpec, InitTime, ReconciledPoint, SiteId};

    fn forecast(site_id: SiteId) -> ReconciledForecast {
        let t0 = InitTime::floored(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(), 30).unwrap();
        let horizons = HorizonSpec::new(30, 2);
        ReconciledForecast {
            site_id,
            init_time: t0,
            horizons,
            contributing_models: Vec::new(),
            model_set: "m".into(),
            points: (0..2)
                .map(|h| ReconciledPoint {
                    horizon: h,
                    valid_time: horizons.valid_time(t0, h),
                    value: Some(1.0),
                    quantiles: None,
                })
                .collect(),
        }
    }

    /// Fails for one site and cancels after a given number of writes.
    struct FlakyStore {
        fail_site: SiteId,
        written: Mutex<Vec<SiteId>>,
        cancel_after: usize,
        cancel: Arc<AtomicBool>,
    }

    impl ForecastStore for FlakyStore {
        fn upsert_site(&self, forecast: &ReconciledForecast) -> Result<usize> {
            if forecast.site_id == self.fail_site {
                return Err(Error::Database("disk I/O error".into()));
            }
            let mut written = self.written.lock();
            written.push(forecast.site_id);
            if written.len() >= self.cancel_after {
                self.cancel.store(true, Ordering::SeqCst);
            }
            Ok(forecast.points.len())
        }
    }

    #[test]
    fn test_failure_is_isolated_per_site() {
        let cancel = Arc::new(AtomicBool::new(false));
        let store = Arc::new(FlakyStore {
            fail_site: 2,
            written: Mutex::new(Vec::new()),
            cancel_after: usize::MAX,
            cancel: cancel.clone(),
        });
        let writer = ForecastWriter::new(store.clone());
        let forecasts: Vec<_> = (1..=3).map(forecast).collect();

        let statuses = writer.write(&forecasts, &cancel);
        assert_eq!(
            statuses,
            vec![SiteStatus::Ok, SiteStatus::WriteError, SiteStatus::Ok]
        );
        assert_eq!(*store.written.lock(), vec![1, 3]);
    }

    #[test]
    fn test_cancel_stops_between_sites() {
        let cancel = Arc::new(AtomicBool::new(false));
        let store = Arc::new(FlakyStore {
            fail_site: 0,
            written: Mutex::new(Vec::new()),
            cancel_after: 2,
            cancel: cancel.clone(),
        });
        let writer = ForecastWriter::new(store.clone());
        let forecasts: Vec<_> = (1..=4).map(forecast).collect();

        let statuses = writer.write(&forecasts, &cancel);
        assert_eq!(
            statuses,
            vec![
                SiteStatus::Ok,
                SiteStatus::Ok,
                SiteStatus::Aborted,
                SiteStatus::Aborted
            ]
        );
        assert_eq!(store.written.lock().len(), 2);
    }

    #[test]
    fn test_sqlite_store_through_writer() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(SqliteStore::open(dir.path().join("f.db")).unwrap());
        let writer = ForecastWriter::new(store.clone());
        let statuses = writer.write(&[forecast(1), forecast(2)], &AtomicBool::new(false));
        assert!(statuses.iter().all(|s| s.is_ok()));
        assert_eq!(store.count_rows().unwrap(), 4);
    }
}
