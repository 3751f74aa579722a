// src/fetch/mod.rs

//! Remote retrieval of per-year archives and of the labor series.

pub mod source;
pub mod urls;
pub mod zips;

pub use source::{FetchResponse, HttpSource, RemoteSource, SourceError};
pub use zips::{fetch_year_archive, FetchOutcome, FetchSettings};

use crate::config::PipelineConfig;

/// One requested survey year and everything needed to acquire it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct YearTask {
    pub year: u16,
    /// Archive names to try, in order.
    pub candidates: Vec<String>,
}

impl YearTask {
    pub fn plan(year: u16, cfg: &PipelineConfig) -> Self {
        Self {
            year,
            candidates: urls::candidate_names(&cfg.archive_templates, year),
        }
    }
}
