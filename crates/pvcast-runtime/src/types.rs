//! Run request, states and report.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use pvcast_core::{ReconciledForecast, SiteId, SiteStatus, StatusCounts};

/// Orchestrator state. A run moves forward through these in order and ends
/// in `Completed` or `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunState {
    Pending,
    Assembling,
    Inferring,
    Reconciling,
    Writing,
    Completed,
    Failed,
}

/// What to forecast.
#[derive(Debug, Clone, Default)]
pub struct RunRequest {
    /// Forecast issue time; floored to the run step. Defaults to now.
    pub init_time: Option<DateTime<Utc>>,
    /// Subset of the fleet to run; all sites when `None`.
    pub site_ids: Option<Vec<SiteId>>,
    /// Reconcile but skip the write stage; forecasts are returned in the
    /// report instead.
    pub dry_run: bool,
}

/// Outcome for one site.
#[derive(Debug, Clone, Serialize)]
pub struct SiteOutcome {
    #[serde(rename = "siteId")]
    pub site_id: SiteId,
    pub status: SiteStatus,
    /// Model set written for the site.
    #[serde(rename = "modelSet", skip_serializing_if = "Option::is_none")]
    pub model_set: Option<String>,
    /// Contributing models, fallbacks included.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub models: Vec<String>,
    /// Horizons no model produced a value for.
    #[serde(rename = "missingHorizons", skip_serializing_if = "Vec::is_empty")]
    pub missing_horizons: Vec<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl SiteOutcome {
    pub(crate) fn new(site_id: SiteId) -> Self {
        Self {
            site_id,
            status: SiteStatus::Aborted,
            model_set: None,
            models: Vec::new(),
            missing_horizons: Vec::new(),
            detail: None,
        }
    }
}

/// Summary emitted at the end of every run, successful or not.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    #[serde(rename = "runId")]
    pub run_id: String,
    #[serde(rename = "initTime", skip_serializing_if = "Option::is_none")]
    pub init_time: Option<DateTime<Utc>>,
    pub state: RunState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    /// Every state the run passed through, in order.
    pub states: Vec<RunState>,
    /// Models that were resolved, as `name:id@version`.
    pub models: Vec<String>,
    /// NWP sources that failed entirely, with the reason.
    #[serde(rename = "unavailableSources", skip_serializing_if = "BTreeMap::is_empty")]
    pub unavailable_sources: BTreeMap<String, String>,
    pub sites: Vec<SiteOutcome>,
    pub counts: StatusCounts,
    /// Status of the national aggregate, when one was produced.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub national: Option<SiteStatus>,
    #[serde(rename = "dryRun", skip_serializing_if = "std::ops::Not::not")]
    pub dry_run: bool,
    /// Reconciled forecasts of a dry run, national aggregate last.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub forecasts: Vec<ReconciledForecast>,
    #[serde(rename = "durationMs")]
    pub duration_ms: u64,
}

impl RunReport {
    /// Report for a run that could not be set up at all.
    pub fn failed(reason: impl std::fmt::Display) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            init_time: None,
            state: RunState::Failed,
            failure: Some(reason.to_string()),
            states: vec![RunState::Pending, RunState::Failed],
            models: Vec::new(),
            unavailable_sources: BTreeMap::new(),
            sites: Vec::new(),
            counts: StatusCounts::default(),
            national: None,
            dry_run: false,
            forecasts: Vec::new(),
            duration_ms: 0,
        }
    }

    /// Process exit code for the run trigger.
    pub fn exit_code(&self) -> i32 {
        match self.state {
            RunState::Completed => 0,
            _ => 1,
        }
    }

    pub fn outcome(&self, site_id: SiteId) -> Option<&SiteOutcome> {
        self.sites.iter().find(|s| s.site_id == site_id)
    }
}
