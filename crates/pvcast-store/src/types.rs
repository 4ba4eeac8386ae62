//! Row types returned by the forecast store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pvcast_core::{Quantiles, SiteId};

/// A stored forecast horizon.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastRow {
    pub site_id: SiteId,
    pub model_set: String,
    pub init_time: DateTime<Utc>,
    pub horizon: usize,
    pub valid_time: DateTime<Utc>,
    pub value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quantiles: Option<Quantiles>,
}

/// Store statistics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreStats {
    pub total_rows: i64,
    pub sites: i64,
    pub init_times: i64,
    pub db_path: String,
    pub db_size_mb: f64,
}
