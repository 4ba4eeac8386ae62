//! pvcast core: shared types, configuration and errors for the PV forecast
//! orchestration pipeline.

pub mod config;
pub mod error;
pub mod forecast;
pub mod site;
pub mod status;

pub use config::{ModelConfig, NationalConfig, PvcastConfig, ReconcilePolicy, RunConfig, SourceConfig};
pub use error::{Error, Result};
pub use forecast::{
    model_set_id, ForecastPoint, ModelKey, ModelTag, Quantiles, ReconciledForecast,
    ReconciledPoint, SiteForecast,
};
pub use site::{
    load_sites, validate_sites, HorizonSpec, InitTime, Site, SiteCoords, SiteId, NATIONAL_SITE_ID,
};
pub use status::{SiteStatus, StatusCounts};
