//! Per-site run outcomes.

use serde::{Deserialize, Serialize};

/// Outcome of a run for one site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SiteStatus {
    /// Forecast reconciled and written.
    Ok,
    /// No target model had enough NWP input for this site.
    SkippedMissingInput,
    /// Every eligible model failed for this site.
    ModelError,
    /// The store rejected this site's forecast.
    WriteError,
    /// The run hit its hard timeout before this site was written.
    Aborted,
}

impl SiteStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok)
    }
}

impl std::fmt::Display for SiteStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::SkippedMissingInput => write!(f, "skipped-missing-input"),
            Self::ModelError => write!(f, "model-error"),
            Self::WriteError => write!(f, "write-error"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Aggregate counts over a run's per-site statuses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub ok: usize,
    #[serde(rename = "skippedMissingInput")]
    pub skipped_missing_input: usize,
    #[serde(rename = "modelError")]
    pub model_error: usize,
    #[serde(rename = "writeError")]
    pub write_error: usize,
    pub aborted: usize,
}

impl StatusCounts {
    pub fn tally<'a>(statuses: impl IntoIterator<Item = &'a SiteStatus>) -> Self {
        let mut counts = Self::default();
        for status in statuses {
            match status {
                SiteStatus::Ok => counts.ok += 1,
                SiteStatus::SkippedMissingInput => counts.skipped_missing_input += 1,
                SiteStatus::ModelError => counts.model_error += 1,
                SiteStatus::WriteError => counts.write_error += 1,
                SiteStatus::Aborted => counts.aborted += 1,
            }
        }
        counts
    }

    pub fn total(&self) -> usize {
        self.ok + self.skipped_missing_input + self.model_error + self.write_error + self.aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_serializes_kebab_case() {
        let json = serde_json::to_string(&SiteStatus::SkippedMissingInput).unwrap();
        assert_eq!(json, "\"skipped-missing-input\"");
        assert_eq!(SiteStatus::ModelError.to_string(), "model-error");
    }

    #[test]
    fn test_tally() {
        let statuses = [
            SiteStatus::Ok,
            SiteStatus::Ok,
            SiteStatus::WriteError,
            SiteStatus::SkippedMissingInput,
        ];
        let counts = StatusCounts::tally(&statuses);
        assert_eq!(counts.ok, 2);
        assert_eq!(counts.write_error, 1);
        assert_eq!(counts.skipped_missing_input, 1);
        assert_eq!(counts.total(), 4);
    }
}
