// src/aggregate/mod.rs

//! State-year and county-year rollups of normalized survey records.
//!
//! Records are grouped strictly by (state, year) or (state, county, year);
//! nothing is pooled across either key. Pairs with no records are absent
//! from the output rather than zero-filled.

use anyhow::Result;
use std::{collections::BTreeMap, path::Path};
use tracing::{debug, instrument};

use crate::config::{MetricKind, MetricSpec, Weighting};
use crate::schema::geo;
use crate::schema::write::write_csv_table;
use crate::schema::NormalizedRecord;

pub const STATE_YEAR_FILE: &str = "brfss_state_year.csv";
pub const COUNTY_YEAR_FILE: &str = "brfss_county_year.csv";

/// How much one respondent counts toward a metric.
pub trait WeightPolicy: Send + Sync {
    fn name(&self) -> &'static str;
    /// `None` excludes the record from metrics; it still counts as a respondent.
    fn weight(&self, record: &NormalizedRecord) -> Option<f64>;
}

pub struct Unweighted;

impl WeightPolicy for Unweighted {
    fn name(&self) -> &'static str {
        "unweighted"
    }

    fn weight(&self, _record: &NormalizedRecord) -> Option<f64> {
        Some(1.0)
    }
}

/// Final survey weight read from a canonical column.
pub struct SurveyWeight {
    pub variable: String,
}

impl WeightPolicy for SurveyWeight {
    fn name(&self) -> &'static str {
        "survey_weight"
    }

    fn weight(&self, record: &NormalizedRecord) -> Option<f64> {
        record
            .get(&self.variable)
            .and_then(|v| v.as_f64())
            .filter(|w| w.is_finite() && *w > 0.0)
    }
}

pub fn policy_for(weighting: &Weighting) -> Box<dyn WeightPolicy> {
    match weighting {
        Weighting::Unweighted => Box::new(Unweighted),
        Weighting::SurveyWeight { variable } => Box::new(SurveyWeight {
            variable: variable.clone(),
        }),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StateYearAggregate {
    /// Postal code.
    pub state: String,
    pub year: u16,
    pub respondents: u64,
    pub metrics: BTreeMap<String, Option<f64>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CountyYearAggregate {
    pub state: String,
    /// Five-digit FIPS.
    pub county_fips: String,
    pub year: u16,
    pub respondents: u64,
    pub metrics: BTreeMap<String, Option<f64>>,
}

/// What one value contributes to a metric's weighted mean, if it is valid.
fn observe(kind: &MetricKind, value: Option<&crate::xport::Value>) -> Option<f64> {
    let value = value?;
    match kind {
        MetricKind::Rate {
            numerator,
            denominator,
        } => {
            let code = value.as_i64()?;
            denominator
                .contains(&code)
                .then(|| if numerator.contains(&code) { 1.0 } else { 0.0 })
        }
        MetricKind::Mean {
            min,
            max,
            zero_codes,
        } => {
            if value.as_i64().is_some_and(|c| zero_codes.contains(&c)) {
                return Some(0.0);
            }
            value.as_f64().filter(|v| v >= min && v <= max)
        }
    }
}

#[derive(Debug, Default, Clone)]
struct Cell {
    respondents: u64,
    /// Per metric: (weighted sum, weight total).
    sums: Vec<(f64, f64)>,
}

impl Cell {
    fn results(&self, metrics: &[MetricSpec]) -> BTreeMap<String, Option<f64>> {
        metrics
            .iter()
            .zip(&self.sums)
            .map(|(m, &(num, den))| (m.name.clone(), (den > 0.0).then(|| num / den)))
            .collect()
    }
}

pub struct Aggregator {
    metrics: Vec<MetricSpec>,
    policy: Box<dyn WeightPolicy>,
    /// target state FIPS → postal code
    targets: BTreeMap<String, &'static str>,
    state_year: BTreeMap<(&'static str, u16), Cell>,
    county_year: BTreeMap<(&'static str, String, u16), Cell>,
}

impl Aggregator {
    pub fn new(metrics: Vec<MetricSpec>, policy: Box<dyn WeightPolicy>, states: &[String]) -> Self {
        let targets = states
            .iter()
            .filter_map(|s| geo::parse_state(s))
            .filter_map(|postal| Some((geo::fips_for_postal(postal)?.to_string(), postal)))
            .collect();
        Self {
            metrics,
            policy,
            targets,
            state_year: BTreeMap::new(),
            county_year: BTreeMap::new(),
        }
    }

    fn update(cell: &mut Cell, metrics: &[MetricSpec], weight: Option<f64>, record: &NormalizedRecord) {
        if cell.sums.len() != metrics.len() {
            cell.sums = vec![(0.0, 0.0); metrics.len()];
        }
        cell.respondents += 1;
        let Some(w) = weight else { return };
        for (metric, sum) in metrics.iter().zip(cell.sums.iter_mut()) {
            if let Some(x) = observe(&metric.kind, record.get(&metric.variable)) {
                sum.0 += w * x;
                sum.1 += w;
            }
        }
    }

    /// Fold one batch of records in. Records outside the target states or
    /// without a state are ignored.
    #[instrument(level = "debug", skip_all, fields(records = records.len()))]
    pub fn add(&mut self, records: &[NormalizedRecord]) {
        let mut kept = 0usize;
        for record in records {
            let Some(postal) = record
                .state_fips
                .as_deref()
                .and_then(|f| self.targets.get(f).copied())
            else {
                continue;
            };
            kept += 1;
            let weight = self.policy.weight(record);
            let cell = self.state_year.entry((postal, record.year)).or_default();
            Self::update(cell, &self.metrics, weight, record);
            if let Some(county) = &record.county_fips {
                let cell = self
                    .county_year
                    .entry((postal, county.clone(), record.year))
                    .or_default();
                Self::update(cell, &self.metrics, weight, record);
            }
        }
        debug!(kept, policy = self.policy.name(), "records aggregated");
    }

    pub fn metric_names(&self) -> Vec<String> {
        self.metrics.iter().map(|m| m.name.clone()).collect()
    }

    /// One row per observed (state, year), ordered by state then year.
    pub fn state_year(&self) -> Vec<StateYearAggregate> {
        self.state_year
            .iter()
            .map(|(&(state, year), cell)| StateYearAggregate {
                state: state.to_string(),
                year,
                respondents: cell.respondents,
                metrics: cell.results(&self.metrics),
            })
            .collect()
    }

    pub fn county_year(&self) -> Vec<CountyYearAggregate> {
        self.county_year
            .iter()
            .map(|((state, county, year), cell)| CountyYearAggregate {
                state: state.to_string(),
                county_fips: county.clone(),
                year: *year,
                respondents: cell.respondents,
                metrics: cell.results(&self.metrics),
            })
            .collect()
    }
}

/// Empty string for an absent measure, shortest round-trip text otherwise.
pub fn format_measure(value: Option<f64>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

pub fn write_state_year(path: &Path, metrics: &[String], rows: &[StateYearAggregate]) -> Result<()> {
    let mut header = vec!["state".to_string(), "year".into(), "respondents".into()];
    header.extend(metrics.iter().cloned());
    let body: Vec<Vec<String>> = rows
        .iter()
        .map(|r| {
            let mut line = vec![r.state.clone(), r.year.to_string(), r.respondents.to_string()];
            line.extend(metrics.iter().map(|m| format_measure(r.metrics.get(m).copied().flatten())));
            line
        })
        .collect();
    write_csv_table(path, &header, &body)
}

pub fn write_county_year(path: &Path, metrics: &[String], rows: &[CountyYearAggregate]) -> Result<()> {
    let mut header = vec![
        "state".to_string(),
        "county_fips".into(),
        "year".into(),
        "respondents".into(),
    ];
    header.extend(metrics.iter().cloned());
    let body: Vec<Vec<String>> = rows
        .iter()
        .map(|r| {
            let mut line = vec![
                r.state.clone(),
                r.county_fips.clone(),
                r.year.to_string(),
                r.respondents.to_string(),
            ];
            line.extend(metrics.iter().map(|m| format_measure(r.metrics.get(m).copied().flatten())));
            line
        })
        .collect();
    write_csv_table(path, &header, &body)
}
