/// Terminal status of one (dataset, year) in a run.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum YearStatus {
    Succeeded,
    /// Artifact already present from an earlier run.
    Skipped,
    Failed,
}

impl YearStatus {
    pub fn as_str(&self) -> &str {
        match self {
            YearStatus::Succeeded => "succeeded",
            YearStatus::Skipped => "skipped",
            YearStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "succeeded" => Some(YearStatus::Succeeded),
            "skipped" => Some(YearStatus::Skipped),
            "failed" => Some(YearStatus::Failed),
            _ => None,
        }
    }

    /// Succeeded and skipped years both have a usable artifact.
    pub fn is_usable(&self) -> bool {
        !matches!(self, YearStatus::Failed)
    }
}
