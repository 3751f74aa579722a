// src/error.rs

//! Per-year failures and the non-fatal notices a run collects.

use serde::Serialize;
use std::{fmt, path::PathBuf};
use thiserror::Error;

/// Why one survey year did not produce an artifact. A failed year never
/// aborts the others.
#[derive(Debug, Error)]
pub enum YearError {
    #[error("no archive resolved for {year} (tried {})", tried.join(", "))]
    FetchUnavailable { year: u16, tried: Vec<String> },

    #[error("archive {} holds no .xpt entry", archive.display())]
    MissingTransportFile { archive: PathBuf },

    #[error("archive {} cannot be opened: {reason}", archive.display())]
    CorruptArchive { archive: PathBuf, reason: String },

    #[error("every decoder failed: {}", attempts.join("; "))]
    DecodeFailure { attempts: Vec<String> },

    #[error("writing {}: {reason}", path.display())]
    Write { path: PathBuf, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("labor series: {0}")]
    Labor(String),
}

impl YearError {
    /// Stable snake_case tag used in reports and the run ledger.
    pub fn kind(&self) -> &'static str {
        match self {
            YearError::FetchUnavailable { .. } => "fetch_unavailable",
            YearError::MissingTransportFile { .. } => "missing_transport_file",
            YearError::CorruptArchive { .. } => "corrupt_archive",
            YearError::DecodeFailure { .. } => "decode_failure",
            YearError::Write { .. } => "write",
            YearError::Io(_) => "io",
            YearError::Labor(_) => "labor",
        }
    }

    pub fn write(path: impl Into<PathBuf>, err: impl fmt::Display) -> Self {
        YearError::Write {
            path: path.into(),
            reason: format!("{err:#}"),
        }
    }
}

/// Conditions worth reporting that do not fail anything.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    AmbiguousTransportFile {
        candidates: Vec<String>,
        chosen: String,
    },
    NormalizationGap {
        year: u16,
        unmapped: Vec<String>,
    },
    WriteConflict {
        path: String,
    },
    JoinKeyMissing {
        state: String,
        year: u16,
        missing: String,
    },
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::AmbiguousTransportFile { candidates, chosen } => write!(
                f,
                "{} transport entries ({}), using {chosen}",
                candidates.len(),
                candidates.join(", ")
            ),
            Notice::NormalizationGap { year, unmapped } => write!(
                f,
                "{year}: {} columns outside the canonical map",
                unmapped.len()
            ),
            Notice::WriteConflict { path } => write!(f, "{path} already exists, left untouched"),
            Notice::JoinKeyMissing {
                state,
                year,
                missing,
            } => write!(f, "{state} {year}: no {missing} data"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_stable_tags() {
        let err = YearError::FetchUnavailable {
            year: 1991,
            tried: vec!["CDBRFS91XPT.ZIP".into()],
        };
        assert_eq!(err.kind(), "fetch_unavailable");
        assert!(err.to_string().contains("CDBRFS91XPT.ZIP"));
    }

    #[test]
    fn notices_serialize_with_kind_tag() {
        let notice = Notice::WriteConflict {
            path: "normalized/brfss_1990.parquet".into(),
        };
        let json = serde_json::to_value(&notice).unwrap();
        assert_eq!(json["kind"], "write_conflict");
    }
}
