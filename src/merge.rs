// src/merge.rs

//! Full outer join of the survey and labor state-year tables.

use anyhow::Result;
use std::{collections::BTreeMap, path::Path};

use crate::aggregate::{format_measure, StateYearAggregate};
use crate::error::Notice;
use crate::labor::LaborYearAggregate;
use crate::schema::write::write_csv_table;

pub const MERGED_FILE: &str = "state_year.csv";

#[derive(Debug, Clone, PartialEq)]
pub struct MergedRecord {
    pub state: String,
    pub year: u16,
    pub health: Option<StateYearAggregate>,
    pub labor: Option<LaborYearAggregate>,
}

/// Join on (state, year). Every key from either side yields exactly one row;
/// a missing side is `None` and reported as a `JoinKeyMissing` notice.
pub fn merge(
    health: &[StateYearAggregate],
    labor: &[LaborYearAggregate],
) -> (Vec<MergedRecord>, Vec<Notice>) {
    let mut rows: BTreeMap<(String, u16), MergedRecord> = BTreeMap::new();
    let blank = |state: &str, year| MergedRecord {
        state: state.to_string(),
        year,
        health: None,
        labor: None,
    };
    for h in health {
        rows.entry((h.state.clone(), h.year))
            .or_insert_with(|| blank(&h.state, h.year))
            .health = Some(h.clone());
    }
    for l in labor {
        rows.entry((l.state.clone(), l.year))
            .or_insert_with(|| blank(&l.state, l.year))
            .labor = Some(l.clone());
    }

    let mut notices = Vec::new();
    for row in rows.values() {
        let missing = match (&row.health, &row.labor) {
            (None, _) => "health",
            (_, None) => "labor",
            _ => continue,
        };
        notices.push(Notice::JoinKeyMissing {
            state: row.state.clone(),
            year: row.year,
            missing: missing.to_string(),
        });
    }
    (rows.into_values().collect(), notices)
}

pub fn write_merged(path: &Path, metrics: &[String], rows: &[MergedRecord]) -> Result<()> {
    let mut header = vec![
        "state".to_string(),
        "year".into(),
        "health_present".into(),
        "labor_present".into(),
        "respondents".into(),
    ];
    header.extend(metrics.iter().cloned());
    header.extend(
        [
            "months_observed",
            "unemployment_rate",
            "labor_force_size",
            "employment_ratio",
        ]
        .map(String::from),
    );

    let body: Vec<Vec<String>> = rows
        .iter()
        .map(|r| {
            let mut line = vec![
                r.state.clone(),
                r.year.to_string(),
                r.health.is_some().to_string(),
                r.labor.is_some().to_string(),
            ];
            match &r.health {
                Some(h) => {
                    line.push(h.respondents.to_string());
                    line.extend(
                        metrics
                            .iter()
                            .map(|m| format_measure(h.metrics.get(m).copied().flatten())),
                    );
                }
                None => line.extend(std::iter::repeat(String::new()).take(metrics.len() + 1)),
            }
            match &r.labor {
                Some(l) => line.extend([
                    l.months_observed.to_string(),
                    format_measure(l.unemployment_rate),
                    format_measure(l.labor_force_size),
                    format_measure(l.employment_ratio),
                ]),
                None => line.extend(std::iter::repeat(String::new()).take(4)),
            }
            line
        })
        .collect();
    write_csv_table(path, &header, &body)
}
