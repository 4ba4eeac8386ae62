//! External input capabilities: NWP sources and generation metering.
//!
//! Both are synchronous; the assembler runs them on the blocking pool.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Duration, Utc};
use ndarray::Array3;
use serde::Deserialize;
use tracing::debug;

use pvcast_core::{Error, HorizonSpec, InitTime, Result, Site, SiteCoords, SiteId};

/// Regridded NWP covariates for a list of sites.
#[derive(Debug, Clone)]
pub struct NwpFetch {
    pub variables: Vec<String>,
    /// Shape (site, horizon, variable). NaN where the source has no data.
    pub values: Array3<f32>,
    /// Issue time of each site's data; `None` when the site is not covered.
    pub issued_at: Vec<Option<DateTime<Utc>>>,
}

/// A numerical weather prediction provider.
pub trait NwpSource: Send + Sync {
    fn id(&self) -> &str;

    /// Covariates for `sites` over `horizons` from `init_time`.
    /// `Err(Error::InputUnavailable)` when the whole source is down.
    fn fetch(
        &self,
        sites: &[SiteCoords],
        init_time: InitTime,
        horizons: HorizonSpec,
    ) -> Result<NwpFetch>;
}

/// One metered generation reading.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct GenerationReading {
    pub time: DateTime<Utc>,
    pub mw: f64,
}

/// Recent metered generation, used as an optional model feature.
pub trait GenerationSource: Send + Sync {
    fn get_recent_generation(
        &self,
        site: &Site,
        end: DateTime<Utc>,
        window: Duration,
    ) -> Result<Vec<GenerationReading>>;
}

#[derive(Debug, Deserialize)]
struct NwpFile {
    variables: Vec<String>,
    sites: BTreeMap<SiteId, NwpSiteEntry>,
}

#[derive(Debug, Deserialize)]
struct NwpSiteEntry {
    issued_at: DateTime<Utc>,
    /// `values[horizon][variable]`
    values: Vec<Vec<f32>>,
}

/// NWP source backed by a pre-extracted `<dir>/<id>.json` file, as written by
/// the upstream regridding job.
pub struct JsonNwpSource {
    id: String,
    path: PathBuf,
}

impl JsonNwpSource {
    pub fn new(id: impl Into<String>, dir: impl Into<PathBuf>) -> Self {
        let id = id.into();
        let path = dir.into().join(format!("{}.json", id));
        Self { id, path }
    }
}

impl NwpSource for JsonNwpSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn fetch(
        &self,
        sites: &[SiteCoords],
        init_time: InitTime,
        horizons: HorizonSpec,
    ) -> Result<NwpFetch> {
        let text = std::fs::read_to_string(&self.path).map_err(|e| {
            Error::InputUnavailable(format!("{}: {}", self.path.display(), e))
        })?;
        let file: NwpFile = serde_json::from_str(&text).map_err(|e| {
            Error::InputUnavailable(format!("{}: malformed extract: {}", self.path.display(), e))
        })?;

        let n_vars = file.variables.len();
        let mut values = Array3::from_elem((sites.len(), horizons.count, n_vars), f32::NAN);
        let mut issued_at = Vec::with_capacity(sites.len());

        for (i, coords) in sites.iter().enumerate() {
            let Some(entry) = file.sites.get(&coords.site_id) else {
                issued_at.push(None);
                continue;
            };
            for (h, row) in entry.values.iter().take(horizons.count).enumerate() {
                for (v, &x) in row.iter().take(n_vars).enumerate() {
                    values[[i, h, v]] = x;
                }
            }
            issued_at.push(Some(entry.issued_at));
        }

        debug!(
            "Read {} for init time {}: {} of {} sites covered",
            self.path.display(),
            init_time,
            issued_at.iter().filter(|t| t.is_some()).count(),
            sites.len()
        );

        Ok(NwpFetch {
            variables: file.variables,
            values,
            issued_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn coords(id: SiteId) -> SiteCoords {
        SiteCoords {
            site_id: id,
            latitude: 51.0,
            longitude: 0.0,
        }
    }

    #[test]
    fn test_json_source_reads_covered_sites() {
        let dir = tempfile::tempdir().unwrap();
        let json = serde_json::json!({
            "variables": ["dswrf", "t2m"],
            "sites": {
                "1": {
                    "issued_at": "2024-06-01T09:00:00Z",
                    "values": [[100.0, 15.0], [200.0, 16.0], [300.0, 17.0]]
                }
            }
        });
        std::fs::write(dir.path().join("ukv.json"), json.to_string()).unwrap();

        let source = JsonNwpSource::new("ukv", dir.path());
        let t0 = InitTime::floored(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap(), 30).unwrap();
        let fetch = source
            .fetch(&[coords(1), coords(2)], t0, HorizonSpec::new(30, 2))
            .unwrap();

        assert_eq!(fetch.values.dim(), (2, 2, 2));
        assert_eq!(fetch.values[[0, 1, 0]], 200.0);
        assert!(fetch.values[[1, 0, 0]].is_nan());
        assert!(fetch.issued_at[0].is_some());
        assert!(fetch.issued_at[1].is_none());
    }

    #[test]
    fn test_missing_file_is_input_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let source = JsonNwpSource::new("ecmwf", dir.path());
        let t0 = InitTime::now(30).unwrap();
        let result = source.fetch(&[coords(1)], t0, HorizonSpec::new(30, 4));
        assert!(matches!(result, Err(Error::InputUnavailable(_))));
    }
}
