//! National aggregate: the sum of reconciled site forecasts.

use tracing::info;

use pvcast_core::{
    HorizonSpec, InitTime, ModelTag, ReconciledForecast, ReconciledPoint, NATIONAL_SITE_ID,
};

/// Model-set identifier of the national aggregate rows.
pub const NATIONAL_MODEL_SET: &str = "national_sum";

/// Sum the point values of `sites` per horizon.
///
/// A horizon is absent only when no site has a value there. Quantiles are not
/// additive, so the aggregate carries none. Returns `None` when `sites` is
/// empty.
pub fn national_sum(
    init_time: InitTime,
    horizons: HorizonSpec,
    sites: &[ReconciledForecast],
) -> Option<ReconciledForecast> {
    if sites.is_empty() {
        return None;
    }

    let points: Vec<ReconciledPoint> = (0..horizons.count)
        .map(|h| {
            let values: Vec<f64> = sites.iter().filter_map(|s| s.value(h)).collect();
            ReconciledPoint {
                horizon: h,
                valid_time: horizons.valid_time(init_time, h),
                value: if values.is_empty() {
                    None
                } else {
                    Some(values.iter().sum())
                },
                quantiles: None,
            }
        })
        .collect();

    let mut contributing_models: Vec<ModelTag> = sites
        .iter()
        .flat_map(|s| s.contributing_models.iter().cloned())
        .collect();
    contributing_models.sort();
    contributing_models.dedup();

    info!("National aggregate over {} sites", sites.len());
    Some(ReconciledForecast {
        site_id: NATIONAL_SITE_ID,
        init_time,
        horizons,
        contributing_models,
        model_set: NATIONAL_MODEL_SET.to_string(),
        points,
    })
}
