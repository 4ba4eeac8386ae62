//! Sites, init times and forecast horizons.

use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, Datelike, Duration, DurationRound, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub type SiteId = u32;

/// Site id reserved for the national aggregate forecast.
pub const NATIONAL_SITE_ID: SiteId = 0;

/// A PV site. Owned by an external metadata source; read-only to the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub id: SiteId,
    pub latitude: f64,
    pub longitude: f64,
    /// Installed capacity in MW.
    pub capacity_mw: f64,
    /// Panel tilt from horizontal, degrees.
    #[serde(default)]
    pub tilt_deg: f64,
    /// Panel azimuth, degrees clockwise from north.
    #[serde(default = "default_orientation")]
    pub orientation_deg: f64,
}

fn default_orientation() -> f64 {
    180.0
}

impl Site {
    pub fn coords(&self) -> SiteCoords {
        SiteCoords {
            site_id: self.id,
            latitude: self.latitude,
            longitude: self.longitude,
        }
    }

    /// Approximate solar elevation in degrees at this site for `at`.
    ///
    /// Simplified declination / hour-angle model, good to a few degrees,
    /// which is enough to mask night-time horizons.
    pub fn solar_elevation_deg(&self, at: DateTime<Utc>) -> f64 {
        let day_of_year = at.ordinal() as f64;
        let hour = at.hour() as f64 + at.minute() as f64 / 60.0;

        let declination_rad = 23.45_f64.to_radians()
            * ((360.0 / 365.25) * (day_of_year + 284.0)).to_radians().sin();

        let solar_hour = hour + self.longitude / 15.0;
        let hour_angle_rad = ((solar_hour - 12.0) * 15.0).to_radians();

        let lat_rad = self.latitude.to_radians();
        let sin_elevation = lat_rad.sin() * declination_rad.sin()
            + lat_rad.cos() * declination_rad.cos() * hour_angle_rad.cos();
        sin_elevation.clamp(-1.0, 1.0).asin().to_degrees()
    }
}

/// Load a site list from a JSON array.
///
/// Ids must be unique and non-zero (zero is the national aggregate), and
/// capacities positive.
pub fn load_sites(path: &Path) -> Result<Vec<Site>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
    let sites: Vec<Site> = serde_json::from_str(&text)
        .map_err(|e| Error::Config(format!("invalid site list {}: {}", path.display(), e)))?;
    validate_sites(&sites)?;
    Ok(sites)
}

pub fn validate_sites(sites: &[Site]) -> Result<()> {
    let mut seen = HashSet::new();
    for site in sites {
        if site.id == NATIONAL_SITE_ID {
            return Err(Error::Config(format!(
                "site id {} is reserved for the national aggregate",
                NATIONAL_SITE_ID
            )));
        }
        if !seen.insert(site.id) {
            return Err(Error::Config(format!("duplicate site id {}", site.id)));
        }
        if !(site.capacity_mw.is_finite() && site.capacity_mw > 0.0) {
            return Err(Error::Config(format!(
                "site {} has invalid capacity {}",
                site.id, site.capacity_mw
            )));
        }
    }
    Ok(())
}

/// The part of a site an NWP source needs.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SiteCoords {
    pub site_id: SiteId,
    pub latitude: f64,
    pub longitude: f64,
}

/// Forecast issuance timestamp. One run corresponds to exactly one init time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InitTime(DateTime<Utc>);

impl InitTime {
    /// Floor `at` to a multiple of `step_minutes`.
    pub fn floored(at: DateTime<Utc>, step_minutes: u32) -> Result<Self> {
        if step_minutes == 0 {
            return Err(Error::Config("init time step must be positive".into()));
        }
        let floored = at
            .duration_trunc(Duration::minutes(step_minutes as i64))
            .map_err(|e| Error::Config(format!("cannot floor init time {}: {}", at, e)))?;
        Ok(Self(floored))
    }

    /// Current time floored to the step.
    pub fn now(step_minutes: u32) -> Result<Self> {
        Self::floored(Utc::now(), step_minutes)
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.0
    }
}

impl std::fmt::Display for InitTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

/// The horizons requested for a run: `count` steps of `step_minutes`, the
/// first one a full step after the init time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HorizonSpec {
    pub step_minutes: u32,
    pub count: usize,
}

impl HorizonSpec {
    pub fn new(step_minutes: u32, count: usize) -> Self {
        Self {
            step_minutes,
            count,
        }
    }

    /// Valid time of horizon index `horizon`.
    pub fn valid_time(&self, init_time: InitTime, horizon: usize) -> DateTime<Utc> {
        init_time.timestamp() + Duration::minutes(self.step_minutes as i64 * (horizon as i64 + 1))
    }
}
